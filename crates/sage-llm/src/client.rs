//! The completion client: one request, read as a JSON body or an SSE stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use sage_core::config::LlmConfig;
use sage_core::{Message, RetryPolicy};

use crate::error::LlmError;
use crate::sse::{SseDecoder, SseEvent};
use crate::wire::WireFormat;

/// Callback receiving each streamed answer fragment.
pub type PartialFn<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Longest error body kept in [`LlmError::Remote`].
const MAX_ERROR_BODY: usize = 500;

/// A JSON schema the backend should constrain its output to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

/// Anything that can answer a chat-completion request.
///
/// When `on_partial` is given the request is streamed and every fragment is
/// forwarded as it arrives; the returned string is always the whole answer.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        schema: Option<&ResponseSchema>,
        on_partial: Option<PartialFn<'_>>,
    ) -> Result<String, LlmError>;
}

/// HTTP completion client with deadline and bounded retry.
pub struct CompletionClient {
    http: reqwest::Client,
    config: LlmConfig,
    wire: WireFormat,
    retry: RetryPolicy,
    deadline: Duration,
}

impl CompletionClient {
    /// Build a client; the wire format is resolved here, once.
    pub fn new(config: LlmConfig, retry: RetryPolicy) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Config(format!("failed to build HTTP client: {}", e)))?;
        let wire = WireFormat::resolve(config.wire_format, &config.base_url);
        let deadline = Duration::from_secs(config.timeout_secs.max(1));
        tracing::debug!(
            base_url = %config.base_url,
            model = %config.model,
            ?wire,
            "Completion client ready"
        );
        Ok(Self {
            http,
            config,
            wire,
            retry,
            deadline,
        })
    }

    /// Override the response deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn wire_format(&self) -> WireFormat {
        self.wire
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    async fn attempt(
        &self,
        attempt: u32,
        messages: &[Message],
        schema: Option<&ResponseSchema>,
        on_partial: Option<PartialFn<'_>>,
    ) -> Result<String, LlmError> {
        let stream = on_partial.is_some();
        let body = self.wire.body(&self.config, messages, schema, stream);
        let request = self.wire.request(&self.http, &self.config, stream).json(&body);

        tracing::debug!(attempt, stream, messages = messages.len(), "Sending completion request");

        let response = tokio::time::timeout(self.deadline, request.send())
            .await
            .map_err(|_| LlmError::Timeout(self.deadline))?
            .map_err(|e| LlmError::from_reqwest(e, self.deadline))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Remote {
                status: status.as_u16(),
                body: truncate(&text, MAX_ERROR_BODY),
            });
        }

        // Backends may ignore `stream: true`; the content type decides.
        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_event_stream {
            self.read_stream(response, on_partial).await
        } else {
            let answer = self.read_body(response).await?;
            if let Some(on_partial) = on_partial {
                on_partial(&answer);
            }
            Ok(answer)
        }
    }

    async fn read_body(&self, response: reqwest::Response) -> Result<String, LlmError> {
        let text = tokio::time::timeout(self.deadline, response.text())
            .await
            .map_err(|_| LlmError::Timeout(self.deadline))?
            .map_err(|e| LlmError::from_reqwest(e, self.deadline))?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::Decode(e.to_string()))?;
        let answer = self
            .wire
            .extract_full(&value)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if answer.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(answer)
    }

    async fn read_stream(
        &self,
        response: reqwest::Response,
        on_partial: Option<PartialFn<'_>>,
    ) -> Result<String, LlmError> {
        let deadline = self.deadline;
        let chunks = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| LlmError::from_reqwest(e, deadline)));
        self.read_events(chunks, on_partial).await
    }

    /// Decode SSE chunks into the answer.
    ///
    /// Once a fragment has gone to `on_partial`, a missed deadline is a
    /// [`LlmError::StreamStalled`] so the request is not sent again.
    async fn read_events<S, B>(
        &self,
        mut chunks: S,
        on_partial: Option<PartialFn<'_>>,
    ) -> Result<String, LlmError>
    where
        S: futures::Stream<Item = Result<B, LlmError>> + Unpin,
        B: AsRef<[u8]>,
    {
        let mut decoder = SseDecoder::new();
        let mut answer = String::new();

        'read: loop {
            let next = match tokio::time::timeout(self.deadline, chunks.next()).await {
                Ok(next) => next,
                Err(_) => return Err(stalled(LlmError::Timeout(self.deadline), &answer)),
            };
            let (events, closed) = match next {
                Some(Ok(chunk)) => (decoder.push(chunk.as_ref()), false),
                Some(Err(e)) => return Err(stalled(e, &answer)),
                None => (decoder.finish().into_iter().collect(), true),
            };

            for event in events {
                match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Data(payload) => {
                        let value: Value = serde_json::from_str(&payload)
                            .map_err(|e| LlmError::Decode(e.to_string()))?;
                        if let Some(fragment) = self.wire.extract_fragment(&value) {
                            append_fragment(&mut answer, &fragment, on_partial);
                        }
                    }
                }
            }

            if closed {
                break;
            }
        }

        if answer.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(answer)
    }
}

fn stalled(err: LlmError, answer: &str) -> LlmError {
    match err {
        LlmError::Timeout(deadline) if !answer.is_empty() => LlmError::StreamStalled(deadline),
        other => other,
    }
}

/// Append a fragment, trimming leading whitespace until the answer starts.
fn append_fragment(answer: &mut String, fragment: &str, on_partial: Option<PartialFn<'_>>) {
    let fragment = if answer.is_empty() {
        fragment.trim_start()
    } else {
        fragment
    };
    if fragment.is_empty() {
        return;
    }
    answer.push_str(fragment);
    if let Some(on_partial) = on_partial {
        on_partial(fragment);
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl ChatCompletion for CompletionClient {
    async fn complete(
        &self,
        messages: &[Message],
        schema: Option<&ResponseSchema>,
        on_partial: Option<PartialFn<'_>>,
    ) -> Result<String, LlmError> {
        self.retry
            .run("completion", |attempt| {
                self.attempt(attempt, messages, schema, on_partial)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use sage_core::Retryable;

    #[test]
    fn test_append_fragment_trims_only_leading() {
        let seen = Mutex::new(Vec::new());
        let cb = |s: &str| seen.lock().unwrap().push(s.to_string());
        let mut answer = String::new();

        append_fragment(&mut answer, "\n\n", Some(&cb));
        assert!(answer.is_empty());
        append_fragment(&mut answer, "  Jupiter", Some(&cb));
        append_fragment(&mut answer, " is ", Some(&cb));
        append_fragment(&mut answer, "big.\n", None);

        assert_eq!(answer, "Jupiter is big.\n");
        assert_eq!(*seen.lock().unwrap(), vec!["Jupiter", " is "]);
    }

    fn delta(text: &str) -> Result<Vec<u8>, LlmError> {
        let event = serde_json::json!({"choices": [{"delta": {"content": text}}]});
        Ok(format!("data: {}\n\n", event).into_bytes())
    }

    fn quick_client() -> CompletionClient {
        CompletionClient::new(LlmConfig::default(), RetryPolicy::none())
            .unwrap()
            .with_deadline(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_stall_after_fragments_is_not_retryable() {
        let seen = Mutex::new(String::new());
        let cb = |s: &str| seen.lock().unwrap().push_str(s);
        let chunks = futures::stream::iter(vec![delta("Jupiter"), delta(" is")])
            .chain(futures::stream::pending());

        let err = quick_client()
            .read_events(chunks, Some(&cb))
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::StreamStalled(d) if d == Duration::from_millis(50)));
        assert!(!err.is_retryable());
        assert_eq!(*seen.lock().unwrap(), "Jupiter is");
    }

    #[tokio::test]
    async fn test_stall_before_any_fragment_is_a_timeout() {
        let chunks = futures::stream::iter(vec![delta("  ")]).chain(futures::stream::pending());
        let err = quick_client()
            .read_events(chunks, Some(&ignore))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_read_events_until_done() {
        let chunks = futures::stream::iter(vec![
            delta("Jupiter"),
            delta("."),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ])
        .chain(futures::stream::pending());
        let answer = quick_client().read_events(chunks, None).await.unwrap();
        assert_eq!(answer, "Jupiter.");
    }

    fn ignore(_: &str) {}

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("ééé", 2), "éé...");
    }

    #[test]
    fn test_client_resolves_wire_format() {
        let config = LlmConfig {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            ..LlmConfig::default()
        };
        let client = CompletionClient::new(config, RetryPolicy::none()).unwrap();
        assert_eq!(client.wire_format(), WireFormat::Gemini);
        assert_eq!(client.deadline(), Duration::from_secs(17));
    }
}
