//! Response stage: stream a short answer citing the references.

use sage_core::{Reference, Turn};
use sage_llm::ChatCompletion;

use crate::error::ChatError;
use crate::prompt;

/// Recorded on the Respond stage when no reference backs the answer.
pub const NO_REFERENCES_WARNING: &str = "no references available; answer is not grounded";

/// Output of the response stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Answer text with its literal `[citation:N]` markers.
    pub answer: String,
    pub warning: Option<&'static str>,
}

/// Stream the cited answer, forwarding fragments to `on_partial`.
pub async fn respond(
    llm: &dyn ChatCompletion,
    inquiry: &str,
    language: &str,
    references: &[Reference],
    history: &[Turn],
    on_partial: &(dyn Fn(&str) + Send + Sync),
) -> Result<Response, ChatError> {
    let warning = references.is_empty().then_some(NO_REFERENCES_WARNING);
    if let Some(warning) = warning {
        tracing::warn!("{}", warning);
    }
    let messages = prompt::respond_messages(inquiry, language, references, history);
    let answer = llm.complete(&messages, None, Some(on_partial)).await?;
    Ok(Response { answer, warning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use sage_core::Message;
    use sage_llm::{LlmError, PartialFn, ResponseSchema};

    /// Streams a fixed answer word by word and keeps the system prompt.
    struct WordStreamer {
        answer: &'static str,
        system: Mutex<String>,
    }

    #[async_trait]
    impl ChatCompletion for WordStreamer {
        async fn complete(
            &self,
            messages: &[Message],
            _schema: Option<&ResponseSchema>,
            on_partial: Option<PartialFn<'_>>,
        ) -> Result<String, LlmError> {
            *self.system.lock().unwrap() = messages[0].content.clone();
            if let Some(on_partial) = on_partial {
                for word in self.answer.split_inclusive(' ') {
                    on_partial(word);
                }
            }
            Ok(self.answer.to_string())
        }
    }

    #[tokio::test]
    async fn test_respond_streams_fragments() {
        let llm = WordStreamer {
            answer: "Jupiter is the largest planet [citation:1].",
            system: Mutex::new(String::new()),
        };
        let references = vec![Reference {
            position: 1,
            url: "https://jupiter.example".to_string(),
            title: "Jupiter".to_string(),
            snippet: "Jupiter is the largest planet...".to_string(),
        }];
        let seen = Mutex::new(Vec::new());
        let on_partial = |s: &str| seen.lock().unwrap().push(s.to_string());

        let inquiry = "Which planet is the largest?";
        let response = respond(&llm, inquiry, "English", &references, &[], &on_partial)
            .await
            .unwrap();

        assert_eq!(response.answer, "Jupiter is the largest planet [citation:1].");
        assert_eq!(response.warning, None);
        assert_eq!(seen.lock().unwrap().concat(), response.answer);
        assert!(llm.system.lock().unwrap().contains("[citation:1] Jupiter"));
    }

    #[tokio::test]
    async fn test_respond_without_references_still_answers() {
        let llm = WordStreamer {
            answer: "I could not find sources.",
            system: Mutex::new(String::new()),
        };
        let response = respond(&llm, "q", "English", &[], &[], &|_: &str| {})
            .await
            .unwrap();
        assert_eq!(response.answer, "I could not find sources.");
        assert_eq!(response.warning, Some(NO_REFERENCES_WARNING));
        assert!(llm.system.lock().unwrap().contains("No web results"));
    }
}
