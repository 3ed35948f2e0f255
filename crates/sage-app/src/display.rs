//! Plain-text rendering shared by the terminal and Telegram surfaces.

use serde_json::{Map, Value};

use sage_chat::{CitationStream, CitedReference};
use sage_core::Answer;

/// One line per cited reference, `[N] title - url`.
pub fn format_references(cited: &[CitedReference]) -> String {
    cited
        .iter()
        .map(|c| {
            let r = &c.reference;
            if r.title.is_empty() || r.title == r.url {
                format!("[{}] {}\n", c.ordinal, r.url)
            } else {
                format!("[{}] {} - {}\n", c.ordinal, r.title, r.url)
            }
        })
        .collect()
}

/// One stage of a trace on one line: `Reason: topic=astronomy, repaired=false`.
pub fn format_stage(stage: &str, fields: &Map<String, Value>) -> String {
    let fields: Vec<String> = fields
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect();
    format!("{}: {}", stage, fields.join(", "))
}

/// The answer as it should be read aloud: citation markers dropped.
pub fn spoken_text(answer: &Answer) -> String {
    let mut spoken = String::new();
    {
        let mut stream =
            CitationStream::new(|text: &str| spoken.push_str(text)).with_cite(|_| String::new());
        stream.push(&answer.answer);
        stream.flush();
    }
    spoken.split_whitespace().collect::<Vec<_>>().join(" ")
}
