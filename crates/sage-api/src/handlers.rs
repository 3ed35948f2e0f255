//! Route handler functions for all API endpoints.

use std::convert::Infallible;
use std::sync::{Mutex, PoisonError};

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use sage_chat::{
    cited_references, rewrite, CitationStream, CitedReference, NoopObserver, PipelineObserver,
    Reply, GLOBAL_CONVERSATION,
};
use sage_core::{Reference, Stage};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Request and response types
// =============================================================================

/// Body of `POST /chat` and `POST /chat/stream`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub inquiry: String,
    /// Conversation id; the shared global conversation when absent.
    #[serde(default)]
    pub conversation: Option<String>,
}

impl ChatRequest {
    fn conversation_id(&self) -> String {
        match self.conversation.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => GLOBAL_CONVERSATION.to_string(),
        }
    }
}

/// What the surface shows for one inquiry.
#[derive(Debug, Default, Serialize)]
pub struct ChatReply {
    /// `answer`, `reset` or `review`.
    pub kind: String,
    /// Raw answer with `[citation:N]` markers.
    pub answer: String,
    /// Answer with markers rewritten to display ordinals.
    pub display: String,
    pub references: Vec<Reference>,
    /// References in the order the display cites them.
    pub cited: Vec<CitedReference>,
    pub topic: String,
    pub language: String,
    pub thought: String,
    pub keyphrases: String,
    pub stages: Vec<Stage>,
}

impl From<Reply> for ChatReply {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Answer(answer) => {
                let (display, refs) = rewrite(&answer.answer);
                let cited = cited_references(&refs, &answer.references);
                ChatReply {
                    kind: "answer".to_string(),
                    answer: answer.answer,
                    display,
                    references: answer.references,
                    cited,
                    topic: answer.topic,
                    language: answer.language,
                    thought: answer.thought,
                    keyphrases: answer.keyphrases,
                    stages: answer.stages,
                }
            }
            Reply::Reset => ChatReply {
                kind: "reset".to_string(),
                display: "Conversation reset.".to_string(),
                ..ChatReply::default()
            },
            Reply::Review(text) => ChatReply {
                kind: "review".to_string(),
                display: text,
                ..ChatReply::default()
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub model: String,
    pub conversations: usize,
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /health - liveness and basic counters.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        model: state.config.llm.model.clone(),
        conversations: state.conversations.ids().len(),
    })
}

/// POST /chat - answer an inquiry and return the whole reply.
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    let id = request.conversation_id();
    let reply = state
        .conversations
        .ask(&state.pipeline, &id, &request.inquiry, &NoopObserver)
        .await?;
    Ok(Json(ChatReply::from(reply)))
}

/// POST /chat/stream - answer an inquiry as server-sent events.
///
/// Emits `stage` events as stages finish, `partial` events carrying display
/// text while the answer streams, then one `answer` or `error` event.
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>> + Send> {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = request.conversation_id();

    tokio::spawn(async move {
        let observer = StreamObserver::new(tx.clone());
        let ask = state
            .conversations
            .ask(&state.pipeline, &id, &request.inquiry, &observer);

        // Dropping `ask` on disconnect abandons the completion and releases
        // the conversation without recording a turn.
        let result = tokio::select! {
            result = ask => result,
            _ = tx.closed() => {
                tracing::debug!(conversation = %id, "Stream client disconnected");
                return;
            }
        };
        observer.finish();

        let event = match result {
            Ok(reply) => json_event("answer", &ChatReply::from(reply)),
            Err(err) => {
                let err = ApiError::from(err);
                tracing::warn!(
                    conversation = %id,
                    error = %err.message(),
                    "Streamed inquiry failed"
                );
                json_event("error", &err.body())
            }
        };
        let _ = tx.send(event);
    });

    Sse::new(UnboundedReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default())
}

// =============================================================================
// Streaming observer
// =============================================================================

type PrintFn = Box<dyn FnMut(&str) + Send>;

/// Forwards pipeline progress into an SSE channel.
struct StreamObserver {
    tx: UnboundedSender<Event>,
    citations: Mutex<CitationStream<PrintFn>>,
}

impl StreamObserver {
    fn new(tx: UnboundedSender<Event>) -> Self {
        let sink = tx.clone();
        let print: PrintFn = Box::new(move |text: &str| {
            let _ = sink.send(json_event("partial", &json!({ "text": text })));
        });
        Self {
            tx,
            citations: Mutex::new(CitationStream::new(print)),
        }
    }

    /// Send whatever display text the rewriter still holds.
    fn finish(&self) {
        self.citations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
    }
}

impl PipelineObserver for StreamObserver {
    fn on_stage_leave(&self, stage: &str, fields: &Map<String, Value>) {
        let _ = self
            .tx
            .send(json_event("stage", &json!({ "name": stage, "fields": fields })));
    }

    fn on_partial_answer(&self, text: &str) {
        self.citations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text);
    }
}

fn json_event<T: Serialize>(name: &str, value: &T) -> Event {
    match Event::default().event(name).json_data(value) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(event = name, error = %e, "Failed to serialize SSE event");
            Event::default().event("error").data("serialization failed")
        }
    }
}
