//! End-to-end pipeline tests with in-process backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use sage_chat::pipeline::{STAGE_REASON, STAGE_RESPOND, STAGE_SEARCH};
use sage_chat::{
    cited_references, rewrite, ChatError, Codec, ConversationStore, Pipeline, PipelineObserver,
    PipelineSettings, Reply, SearchBackend, SearchError, SearchHit, SearchLimits, SearchQuery,
};
use sage_core::{Message, RetryPolicy, Turn};
use sage_llm::{ChatCompletion, LlmError, PartialFn, ResponseSchema};

// =============================================================================
// Stubs
// =============================================================================

const REASONING: &str = "TOOL: Google\nLANGUAGE: English\n\
    THOUGHT: The user wants the largest planet.\nKEYPHRASES: largest planet\n\
    OBSERVATION: Planets vary in size.\nTOPIC: astronomy";

/// Answers reasoning requests with a fixed record and streams a fixed answer
/// for response requests.
struct StubLlm {
    reasoning: String,
    answer: String,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<Message>>,
}

impl StubLlm {
    fn new(reasoning: &str, answer: &str) -> Self {
        Self {
            reasoning: reasoning.to_string(),
            answer: answer.to_string(),
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChatCompletion for StubLlm {
    async fn complete(
        &self,
        messages: &[Message],
        _schema: Option<&ResponseSchema>,
        on_partial: Option<PartialFn<'_>>,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages.to_vec();
        match on_partial {
            Some(on_partial) => {
                let chars: Vec<char> = self.answer.chars().collect();
                for chunk in chars.chunks(4) {
                    on_partial(&chunk.iter().collect::<String>());
                }
                Ok(self.answer.clone())
            }
            None => Ok(self.reasoning.clone()),
        }
    }
}

struct StubSearch {
    hits: Vec<SearchHit>,
    queries: Mutex<Vec<SearchQuery>>,
}

impl StubSearch {
    fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            hits,
            queries: Mutex::new(Vec::new()),
        }
    }

    fn jupiter() -> Self {
        Self::new(vec![SearchHit {
            url: "https://en.wikipedia.org/wiki/Jupiter".to_string(),
            title: "Jupiter".to_string(),
            snippet: "Jupiter is the largest planet...".to_string(),
        }])
    }
}

#[async_trait]
impl SearchBackend for StubSearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self.hits.clone())
    }
}

/// Records every observer call as a line.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    partials: Mutex<String>,
}

impl PipelineObserver for Recorder {
    fn on_stage_enter(&self, stage: &str) {
        self.events.lock().unwrap().push(format!("enter {}", stage));
    }

    fn on_stage_leave(&self, stage: &str, fields: &Map<String, Value>) {
        let tag = if fields.contains_key("error") { " error" } else { "" };
        self.events
            .lock()
            .unwrap()
            .push(format!("leave {}{}", stage, tag));
    }

    fn on_partial_answer(&self, text: &str) {
        let events = self.events.lock().unwrap();
        assert_eq!(events.last().map(String::as_str), Some("enter Respond"));
        self.partials.lock().unwrap().push_str(text);
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        codec: Codec::Text,
        search_retry: RetryPolicy::new(3, Duration::ZERO),
        limits: SearchLimits {
            top_k: 3,
            snippet_max_chars: 300,
        },
        max_inquiry_chars: 2000,
    }
}

fn pipeline(llm: Arc<StubLlm>, search: Arc<StubSearch>) -> Pipeline {
    Pipeline::new(llm, search, settings())
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_largest_planet_scenario() {
    let llm = Arc::new(StubLlm::new(
        REASONING,
        "Jupiter is the largest planet [citation:1].",
    ));
    let search = Arc::new(StubSearch::jupiter());
    let recorder = Recorder::default();

    let answer = pipeline(llm.clone(), search.clone())
        .run("Which planet is the largest?", &[], &recorder)
        .await
        .unwrap();

    assert!(answer.answer.contains("Jupiter"));
    assert_eq!(answer.topic, "astronomy");
    assert_eq!(answer.language, "English");
    assert_eq!(answer.keyphrases, "largest planet");
    assert_eq!(answer.references.len(), 1);
    assert_eq!(answer.references[0].position, 1);

    let (display, refs) = rewrite(&answer.answer);
    assert_eq!(display, "Jupiter is the largest planet [1].");
    let cited = cited_references(&refs, &answer.references);
    assert_eq!(cited[0].ordinal, 1);
    assert_eq!(cited[0].reference.url, "https://en.wikipedia.org/wiki/Jupiter");

    assert_eq!(*recorder.partials.lock().unwrap(), answer.answer);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 2);

    let queries = search.queries.lock().unwrap();
    assert_eq!(queries[0].q, "largest planet astronomy");
    assert_eq!(queries[0].language, "en");
}

#[tokio::test]
async fn test_observer_pairs_in_stage_order() {
    let llm = Arc::new(StubLlm::new(REASONING, "Jupiter [citation:1]."));
    let recorder = Recorder::default();
    let answer = pipeline(llm, Arc::new(StubSearch::jupiter()))
        .run("Which planet is the largest?", &[], &recorder)
        .await
        .unwrap();

    assert_eq!(
        *recorder.events.lock().unwrap(),
        vec![
            "enter Reason",
            "leave Reason",
            "enter Search",
            "leave Search",
            "enter Respond",
            "leave Respond",
        ]
    );
    let names: Vec<&str> = answer.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec![STAGE_REASON, STAGE_SEARCH, STAGE_RESPOND]);
    assert_eq!(answer.stages[0].fields["topic"], "astronomy");
    assert_eq!(answer.stages[1].fields["query"], "largest planet astronomy");
}

#[tokio::test]
async fn test_search_failure_fails_invocation() {
    let llm = Arc::new(StubLlm::new(REASONING, "unused"));
    let search = Arc::new(StubSearch::new(vec![SearchHit {
        url: String::new(),
        title: "no url".to_string(),
        snippet: "text".to_string(),
    }]));
    let recorder = Recorder::default();

    let err = pipeline(llm.clone(), search.clone())
        .run("Which planet is the largest?", &[], &recorder)
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::Search(SearchError::NoResults)));
    assert_eq!(search.queries.lock().unwrap().len(), 3);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.events.lock().unwrap().last().map(String::as_str),
        Some("leave Search error")
    );
    assert!(recorder.partials.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_history_reaches_prompts_unchanged() {
    let llm = Arc::new(StubLlm::new(REASONING, "Still Jupiter [citation:1]."));
    let p = pipeline(llm.clone(), Arc::new(StubSearch::jupiter()));
    let first = p
        .run("Which planet is the largest?", &[], &sage_chat::NoopObserver)
        .await
        .unwrap();
    let history = vec![Turn::new("Which planet is the largest?", first, 10)];

    p.run("How big is it?", &history, &sage_chat::NoopObserver)
        .await
        .unwrap();

    let messages = llm.last_messages.lock().unwrap();
    let inquiries: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert!(inquiries.contains(&"Which planet is the largest?"));
    assert_eq!(inquiries.last(), Some(&"How big is it?"));
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_inquiry_validation() {
    let p = pipeline(
        Arc::new(StubLlm::new(REASONING, "x")),
        Arc::new(StubSearch::jupiter()),
    );
    let err = p.run("   ", &[], &sage_chat::NoopObserver).await.unwrap_err();
    assert!(matches!(err, ChatError::EmptyInquiry));

    let long = "a".repeat(2001);
    let err = p.run(&long, &[], &sage_chat::NoopObserver).await.unwrap_err();
    assert!(matches!(err, ChatError::InquiryTooLong(2000)));
}

// =============================================================================
// Conversation store
// =============================================================================

#[tokio::test]
async fn test_store_appends_only_successful_turns() {
    let store = ConversationStore::new(20);
    let good = pipeline(
        Arc::new(StubLlm::new(REASONING, "Jupiter [citation:1].")),
        Arc::new(StubSearch::jupiter()),
    );
    let failing = pipeline(
        Arc::new(StubLlm::new(REASONING, "x")),
        Arc::new(StubSearch::new(vec![])),
    );

    let reply = store
        .ask(&good, "chat-1", "Which planet is the largest?", &sage_chat::NoopObserver)
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Answer(_)));
    assert!(store
        .ask(&failing, "chat-1", "Another question", &sage_chat::NoopObserver)
        .await
        .is_err());
    assert_eq!(store.lock("chat-1").await.history().len(), 1);

    match store
        .ask(&good, "chat-1", "/review", &sage_chat::NoopObserver)
        .await
        .unwrap()
    {
        Reply::Review(text) => assert!(text.contains("Inquiry: Which planet is the largest?")),
        other => panic!("expected review, got {other:?}"),
    }

    let reply = store
        .ask(&good, "chat-1", "/reset", &sage_chat::NoopObserver)
        .await
        .unwrap();
    assert_eq!(reply, Reply::Reset);
    assert!(store.lock("chat-1").await.history().is_empty());
    assert!(store.ids().is_empty());
}

#[tokio::test]
async fn test_store_forgets_conversations_that_never_answered() {
    let store = ConversationStore::new(20);
    let failing = pipeline(
        Arc::new(StubLlm::new(REASONING, "x")),
        Arc::new(StubSearch::new(vec![])),
    );
    for id in ["a", "b", "c"] {
        assert!(store
            .ask(&failing, id, "Which planet is the largest?", &sage_chat::NoopObserver)
            .await
            .is_err());
    }
    assert!(store.ids().is_empty());
}
