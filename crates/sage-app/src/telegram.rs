//! Telegram surface: long-polls the Bot API and answers each message.
//!
//! Every chat id is its own conversation in the store. Messages are handled
//! in the order `getUpdates` returns them.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use sage_chat::{cited_references, rewrite, ConversationStore, NoopObserver, Pipeline, Reply};
use sage_core::config::TelegramConfig;

use crate::display::format_references;

/// Telegram rejects longer messages.
const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("no Telegram token configured (set TELEGRAM_TOKEN)")]
    MissingToken,
    #[error("Telegram request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Telegram returned HTTP {status}")]
    Remote { status: u16 },
    #[error("Telegram rejected {method}: {description}")]
    Api { method: String, description: String },
    #[error("Telegram transport error: {0}")]
    Transport(String),
}

// =============================================================================
// Bot API types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

// =============================================================================
// Client
// =============================================================================

pub struct TelegramBot {
    http: reqwest::Client,
    endpoint: String,
    /// Long-poll wait passed to `getUpdates`, and the deadline for `sendMessage`.
    timeout: Duration,
    poll_interval: Duration,
    offset: i64,
}

impl TelegramBot {
    pub fn new(config: &TelegramConfig) -> Result<Self, TelegramError> {
        let token = config
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(TelegramError::MissingToken)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TelegramError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            offset: 0,
        })
    }

    /// Next update id to ask for.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        deadline: Duration,
    ) -> Result<T, TelegramError> {
        let url = format!("{}/{}", self.endpoint, method);
        let response = tokio::time::timeout(deadline, self.http.post(url).json(body).send())
            .await
            .map_err(|_| TelegramError::Timeout(deadline))?
            .map_err(|e| TelegramError::Transport(e.to_string()))?;

        let status = response.status();
        let parsed: Result<ApiResponse<T>, _> = tokio::time::timeout(deadline, response.json())
            .await
            .map_err(|_| TelegramError::Timeout(deadline))?;
        match parsed {
            Ok(ApiResponse {
                ok: true,
                result: Some(result),
                ..
            }) => Ok(result),
            Ok(api) => Err(TelegramError::Api {
                method: method.to_string(),
                description: api
                    .description
                    .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            }),
            Err(_) if !status.is_success() => Err(TelegramError::Remote {
                status: status.as_u16(),
            }),
            Err(e) => Err(TelegramError::Transport(e.to_string())),
        }
    }

    /// Fetch updates after the current offset.
    pub async fn get_updates(&self) -> Result<Vec<Update>, TelegramError> {
        let body = json!({
            "offset": self.offset,
            "timeout": self.timeout.as_secs(),
            "allowed_updates": ["message"],
        });
        // The server may hold the request for the whole long-poll wait.
        self.call("getUpdates", &body, self.timeout * 2).await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let text: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
        let body = json!({ "chat_id": chat_id, "text": text });
        let _sent: Value = self.call("sendMessage", &body, self.timeout).await?;
        Ok(())
    }

    /// Fetch one batch of updates and answer each text message.
    ///
    /// Returns the number of messages answered. The offset advances past
    /// every fetched update, answered or not.
    pub async fn poll_once(
        &mut self,
        pipeline: &Pipeline,
        store: &ConversationStore,
    ) -> Result<usize, TelegramError> {
        let updates = self.get_updates().await?;
        let mut answered = 0;

        for update in updates {
            self.offset = self.offset.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            let Some(text) = message.text.filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            let chat_id = message.chat.id;

            tracing::info!(chat_id, "Answering Telegram message");
            let reply = match store
                .ask(pipeline, &chat_id.to_string(), &text, &NoopObserver)
                .await
            {
                Ok(reply) => format_reply(reply),
                Err(e) => {
                    tracing::warn!(chat_id, error = %e, "Telegram inquiry failed");
                    format!("error: {}", e)
                }
            };
            self.send_message(chat_id, &reply).await?;
            answered += 1;
        }
        Ok(answered)
    }

    /// Poll forever, pausing after failed polls.
    pub async fn run(mut self, pipeline: &Pipeline, store: &ConversationStore) {
        tracing::info!("Telegram poller started");
        loop {
            if let Err(e) = self.poll_once(pipeline, store).await {
                tracing::warn!(error = %e, "Telegram poll failed");
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

/// Message text for a reply: rewritten citations, then the cited URLs.
pub fn format_reply(reply: Reply) -> String {
    match reply {
        Reply::Answer(answer) => {
            let (display, refs) = rewrite(&answer.answer);
            let cited = cited_references(&refs, &answer.references);
            if cited.is_empty() {
                display
            } else {
                format!("{}\n\n{}", display, format_references(&cited).trim_end())
            }
        }
        Reply::Reset => "Conversation reset.".to_string(),
        Reply::Review(text) => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use sage_chat::{
        Codec, PipelineSettings, SearchBackend, SearchError, SearchHit, SearchLimits, SearchQuery,
    };
    use sage_core::{Answer, Message, Reference, RetryPolicy};
    use sage_llm::{ChatCompletion, LlmError, PartialFn, ResponseSchema};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StubLlm;

    #[async_trait]
    impl ChatCompletion for StubLlm {
        async fn complete(
            &self,
            _messages: &[Message],
            _schema: Option<&ResponseSchema>,
            on_partial: Option<PartialFn<'_>>,
        ) -> Result<String, LlmError> {
            let text = match on_partial {
                Some(_) => "Jupiter is the largest planet [citation:1].",
                None => "LANGUAGE: English\nKEYPHRASES: largest planet\nTOPIC: astronomy",
            };
            Ok(text.to_string())
        }
    }

    struct StubSearch;

    #[async_trait]
    impl SearchBackend for StubSearch {
        async fn search(&self, _query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError> {
            Ok(vec![SearchHit {
                url: "https://en.wikipedia.org/wiki/Jupiter".to_string(),
                title: "Jupiter".to_string(),
                snippet: "Jupiter is the largest planet.".to_string(),
            }])
        }
    }

    fn pipeline() -> Pipeline {
        let settings = PipelineSettings {
            codec: Codec::Text,
            search_retry: RetryPolicy::none(),
            limits: SearchLimits {
                top_k: 3,
                snippet_max_chars: 300,
            },
            max_inquiry_chars: 2000,
        };
        Pipeline::new(Arc::new(StubLlm), Arc::new(StubSearch), settings)
    }

    fn bot_for(server: &MockServer) -> TelegramBot {
        TelegramBot::new(&TelegramConfig {
            token: Some("TOKEN".to_string()),
            api_base: server.uri(),
            timeout_secs: 1,
            poll_interval_secs: 0,
        })
        .unwrap()
    }

    fn updates(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": result }))
    }

    // ---- Construction ----

    #[test]
    fn test_missing_token() {
        let config = TelegramConfig::default();
        assert!(matches!(
            TelegramBot::new(&config),
            Err(TelegramError::MissingToken)
        ));
    }

    // ---- Reply text ----

    #[test]
    fn test_format_reply_lists_cited_urls() {
        let reply = Reply::Answer(Answer {
            answer: "Jupiter [citation:1].".to_string(),
            references: vec![Reference {
                position: 1,
                url: "https://en.wikipedia.org/wiki/Jupiter".to_string(),
                title: "Jupiter".to_string(),
                snippet: "s".to_string(),
            }],
            ..Answer::default()
        });
        assert_eq!(
            format_reply(reply),
            "Jupiter [1].\n\n[1] Jupiter - https://en.wikipedia.org/wiki/Jupiter"
        );
        assert_eq!(format_reply(Reply::Reset), "Conversation reset.");
    }

    // ---- Polling ----

    #[tokio::test]
    async fn test_poll_answers_and_advances_offset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getUpdates"))
            .and(body_partial_json(json!({ "offset": 0 })))
            .respond_with(updates(json!([
                { "update_id": 41, "message": { "chat": { "id": 7 }, "text": "Which planet is the largest?" } },
                { "update_id": 42, "message": { "chat": { "id": 7 } } }
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(json!({ "chat_id": 7 })))
            .respond_with(updates(json!({ "message_id": 1 })))
            .expect(1)
            .mount(&server)
            .await;

        let mut bot = bot_for(&server);
        let store = ConversationStore::new(10);
        let answered = bot.poll_once(&pipeline(), &store).await.unwrap();

        assert_eq!(answered, 1);
        assert_eq!(bot.offset(), 43);
        assert_eq!(store.lock("7").await.history().len(), 1);

        let requests = server.received_requests().await.unwrap();
        let sent: Value = requests
            .iter()
            .find(|r| r.url.path().ends_with("sendMessage"))
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .unwrap();
        let text = sent["text"].as_str().unwrap();
        assert!(text.starts_with("Jupiter is the largest planet [1]."));
        assert!(text.contains("https://en.wikipedia.org/wiki/Jupiter"));
    }

    #[tokio::test]
    async fn test_poll_uses_advanced_offset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getUpdates"))
            .and(body_partial_json(json!({ "offset": 0 })))
            .respond_with(updates(json!([{ "update_id": 9 }])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getUpdates"))
            .and(body_partial_json(json!({ "offset": 10 })))
            .respond_with(updates(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let mut bot = bot_for(&server);
        let store = ConversationStore::new(10);
        assert_eq!(bot.poll_once(&pipeline(), &store).await.unwrap(), 0);
        assert_eq!(bot.poll_once(&pipeline(), &store).await.unwrap(), 0);
        assert_eq!(bot.offset(), 10);
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getUpdates"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "ok": false,
                "description": "Unauthorized"
            })))
            .mount(&server)
            .await;

        let err = bot_for(&server).get_updates().await.unwrap_err();
        assert!(matches!(
            err,
            TelegramError::Api { ref description, .. } if description == "Unauthorized"
        ));
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(
                updates(json!({ "message_id": 1 })).set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let err = bot_for(&server).send_message(7, "hi").await.unwrap_err();
        assert!(matches!(err, TelegramError::Timeout(_)));
    }
}
