//! Structured-record codec.
//!
//! A [`Record`] holds a subset of a fixed set of named text fields. It is
//! written to and read from completion output either as `NAME: value` lines
//! or as a flat JSON object.
//!
//! Text decoding anchors on the last occurrence of the final field's marker
//! and walks the field order backward, each field ending where the field
//! after it begins. A field's marker is searched only to the left of the
//! field that follows it, so a stray `topic:` inside a thought is never
//! mistaken for the real section header.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

// =============================================================================
// Field
// =============================================================================

/// A named field of a structured record, in canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Tool,
    Language,
    Thought,
    Keyphrases,
    Observation,
    Topic,
    Answer,
    Inquiry,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Tool,
        Field::Language,
        Field::Thought,
        Field::Keyphrases,
        Field::Observation,
        Field::Topic,
        Field::Answer,
        Field::Inquiry,
    ];

    /// Lower-case field name, as used for JSON keys.
    pub fn name(&self) -> &'static str {
        match self {
            Field::Tool => "tool",
            Field::Language => "language",
            Field::Thought => "thought",
            Field::Keyphrases => "keyphrases",
            Field::Observation => "observation",
            Field::Topic => "topic",
            Field::Answer => "answer",
            Field::Inquiry => "inquiry",
        }
    }

    /// Upper-case line marker, as emitted by text encoding.
    pub fn marker(&self) -> String {
        self.name().to_ascii_uppercase()
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name.trim()))
    }
}

// =============================================================================
// Record
// =============================================================================

/// Field values of one structured completion. Empty values are never stored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    values: BTreeMap<Field, String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }

    /// Value of `field`, or the empty string.
    pub fn value(&self, field: Field) -> &str {
        self.get(field).unwrap_or("")
    }

    pub fn has(&self, field: Field) -> bool {
        self.values.contains_key(&field)
    }

    /// Set a field; a blank value removes it.
    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        let value = value.into();
        let value = value.trim();
        if value.is_empty() {
            self.values.remove(&field);
        } else {
            self.values.insert(field, value.to_string());
        }
    }

    pub fn with(mut self, field: Field, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &str)> {
        self.values.iter().map(|(f, v)| (*f, v.as_str()))
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Wire encoding for records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    /// `NAME: value` lines.
    Text,
    /// A flat JSON object keyed by lower-case field names.
    Json,
}

impl Codec {
    /// Decode completion output. Never fails; unreadable input gives an
    /// empty record.
    pub fn decode(&self, text: &str, order: &[Field]) -> Record {
        match self {
            Codec::Text => decode_text(text, order),
            Codec::Json => decode_json(text, order),
        }
    }

    /// Encode the non-empty fields of `record` that appear in `order`.
    pub fn encode(&self, record: &Record, order: &[Field]) -> String {
        match self {
            Codec::Text => order
                .iter()
                .filter_map(|f| record.get(*f).map(|v| format!("{}: {}", f.marker(), v)))
                .collect::<Vec<_>>()
                .join("\n"),
            Codec::Json => {
                let mut object = Map::new();
                for field in order {
                    if let Some(value) = record.get(*field) {
                        object.insert(field.name().to_string(), Value::String(value.to_string()));
                    }
                }
                Value::Object(object).to_string()
            }
        }
    }

    /// Add `field: value` to raw completion output so that decoding it again
    /// yields the extra field.
    pub fn append(&self, raw: &str, field: Field, value: &str, order: &[Field]) -> String {
        match self {
            Codec::Text => format!("{}\n{}: {}", raw.trim_end(), field.marker(), value),
            Codec::Json => {
                let record = decode_json(raw, order).with(field, value);
                self.encode(&record, order)
            }
        }
    }
}

fn decode_text(text: &str, order: &[Field]) -> Record {
    let mut record = Record::new();
    let Some((last, rest)) = order.split_last() else {
        return record;
    };

    // ASCII lower-casing keeps byte offsets identical to `text`.
    let lower = text.to_ascii_lowercase();
    let marker = |f: &Field| format!("{}:", f.name());

    let mut end = text.len();
    let anchor = marker(last);
    if let Some(pos) = find_marker(&lower, &anchor) {
        record.set(*last, &text[pos + anchor.len()..]);
        end = pos;
    }

    for field in rest.iter().rev() {
        let m = marker(field);
        if let Some(pos) = find_marker(&lower[..end], &m) {
            let value = &text[pos + m.len()..end];
            let first_line = value.trim_start().lines().next().unwrap_or("");
            record.set(*field, first_line);
            end = pos;
        }
    }
    record
}

/// Right-most `marker` that starts a line, else the right-most anywhere.
fn find_marker(lower: &str, marker: &str) -> Option<usize> {
    let mut anywhere = None;
    let mut line_start = None;
    for (pos, _) in lower.match_indices(marker) {
        anywhere = Some(pos);
        let line = lower[..pos].rsplit('\n').next().unwrap_or("");
        if line.trim().is_empty() {
            line_start = Some(pos);
        }
    }
    line_start.or(anywhere)
}

fn decode_json(text: &str, order: &[Field]) -> Record {
    let body = strip_fences(text);
    let body = match body.find('{') {
        Some(start) => &body[start..],
        None => return Record::new(),
    };

    let object = [String::new(), "}".to_string(), "\"}".to_string()]
        .iter()
        .find_map(|suffix| {
            match serde_json::from_str::<Value>(&format!("{}{}", body, suffix)) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            }
        });
    let Some(object) = object else {
        tracing::debug!(len = text.len(), "Structured output is not repairable JSON");
        return Record::new();
    };

    let mut record = Record::new();
    for (key, value) in object {
        let Some(field) = Field::from_name(&key) else {
            continue;
        };
        if !order.contains(&field) {
            continue;
        }
        if let Some(text) = flatten(&value) {
            record.set(field, text);
        }
    }
    record
}

/// Remove a surrounding Markdown code fence, if any.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json).
    let inner = match inner.find('\n') {
        Some(nl) => &inner[nl + 1..],
        None => inner,
    };
    inner.trim_end().strip_suffix("```").unwrap_or(inner).trim()
}

fn flatten(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(flatten)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REASON: [Field; 6] = [
        Field::Tool,
        Field::Language,
        Field::Thought,
        Field::Keyphrases,
        Field::Observation,
        Field::Topic,
    ];

    // ---- Field ----

    #[test]
    fn test_field_names() {
        assert_eq!(Field::Keyphrases.name(), "keyphrases");
        assert_eq!(Field::Keyphrases.marker(), "KEYPHRASES");
        assert_eq!(Field::from_name("Topic"), Some(Field::Topic));
        assert_eq!(Field::from_name(" ANSWER "), Some(Field::Answer));
        assert_eq!(Field::from_name("mood"), None);
    }

    // ---- Record ----

    #[test]
    fn test_record_blank_values_are_dropped() {
        let mut record = Record::new().with(Field::Topic, "astronomy");
        record.set(Field::Thought, "   ");
        assert!(record.has(Field::Topic));
        assert!(!record.has(Field::Thought));
        record.set(Field::Topic, "");
        assert!(record.is_empty());
    }

    // ---- Text decoding ----

    #[test]
    fn test_text_decode_basic() {
        let text = "TOOL: Google\nLANGUAGE: English\nTHOUGHT: The user asks about planets.\n\
                    KEYPHRASES: largest planet\nOBSERVATION: Planet sizes vary.\nTOPIC: astronomy";
        let record = Codec::Text.decode(text, &REASON);
        assert_eq!(record.value(Field::Tool), "Google");
        assert_eq!(record.value(Field::Language), "English");
        assert_eq!(record.value(Field::Thought), "The user asks about planets.");
        assert_eq!(record.value(Field::Keyphrases), "largest planet");
        assert_eq!(record.value(Field::Observation), "Planet sizes vary.");
        assert_eq!(record.value(Field::Topic), "astronomy");
    }

    #[test]
    fn test_text_decode_is_case_insensitive() {
        let record = Codec::Text.decode("Keyphrases: mars moons\ntopic: Astronomy", &REASON);
        assert_eq!(record.value(Field::Keyphrases), "mars moons");
        assert_eq!(record.value(Field::Topic), "Astronomy");
    }

    #[test]
    fn test_text_decode_stray_marker_inside_thought() {
        let text = "THOUGHT: The topic: is unclear, keyphrases: maybe planets\n\
                    KEYPHRASES: largest planet\nTOPIC: astronomy";
        let record = Codec::Text.decode(text, &REASON);
        assert_eq!(record.value(Field::Topic), "astronomy");
        assert_eq!(record.value(Field::Keyphrases), "largest planet");
        assert_eq!(
            record.value(Field::Thought),
            "The topic: is unclear, keyphrases: maybe planets"
        );
    }

    #[test]
    fn test_text_decode_non_terminal_keeps_first_line() {
        let text = "THOUGHT: line one\nline two\nTOPIC: science\nand more";
        let record = Codec::Text.decode(text, &REASON);
        assert_eq!(record.value(Field::Thought), "line one");
        assert_eq!(record.value(Field::Topic), "science\nand more");
    }

    #[test]
    fn test_text_decode_missing_anchor_still_reads_others() {
        let record = Codec::Text.decode("THOUGHT: hmm\nKEYPHRASES: rust async", &REASON);
        assert!(!record.has(Field::Topic));
        assert_eq!(record.value(Field::Keyphrases), "rust async");
        assert_eq!(record.value(Field::Thought), "hmm");
    }

    #[test]
    fn test_text_decode_garbage_is_empty() {
        assert!(Codec::Text.decode("I cannot help with that.", &REASON).is_empty());
        assert!(Codec::Text.decode("", &REASON).is_empty());
        assert!(Codec::Text.decode("TOPIC: x", &[]).is_empty());
    }

    #[test]
    fn test_text_decode_repeated_anchor_uses_last() {
        let text = "TOPIC: wrong\nKEYPHRASES: k\nTOPIC: right";
        let record = Codec::Text.decode(text, &REASON);
        assert_eq!(record.value(Field::Topic), "right");
        assert_eq!(record.value(Field::Keyphrases), "k");
    }

    // ---- Text encoding ----

    #[test]
    fn test_text_encode_skips_missing_and_follows_order() {
        let record = Record::new()
            .with(Field::Topic, "astronomy")
            .with(Field::Thought, "think");
        assert_eq!(
            Codec::Text.encode(&record, &REASON),
            "THOUGHT: think\nTOPIC: astronomy"
        );
    }

    #[test]
    fn test_text_round_trip() {
        let record = Record::new()
            .with(Field::Tool, "Google")
            .with(Field::Language, "German")
            .with(Field::Keyphrases, "Berlin Einwohner")
            .with(Field::Topic, "geography");
        let text = Codec::Text.encode(&record, &REASON);
        assert_eq!(Codec::Text.decode(&text, &REASON), record);
    }

    #[test]
    fn test_text_round_trip_all_fields_mentioning_themselves() {
        let record = Record::new()
            .with(Field::Tool, "Google, the tool: search")
            .with(Field::Language, "English")
            .with(Field::Thought, "a thought: about tools")
            .with(Field::Keyphrases, "largest planet")
            .with(Field::Observation, "observation: sizes vary")
            .with(Field::Topic, "t")
            .with(Field::Answer, "Jupiter. language: English")
            .with(Field::Inquiry, "define inquiry: please");
        let text = Codec::Text.encode(&record, &Field::ALL);
        assert_eq!(Codec::Text.decode(&text, &Field::ALL), record);
    }

    #[test]
    fn test_text_decode_inline_markers_without_line_breaks() {
        let record = Codec::Text.decode("KEYPHRASES: mars moons TOPIC: astronomy", &REASON);
        assert_eq!(record.value(Field::Keyphrases), "mars moons");
        assert_eq!(record.value(Field::Topic), "astronomy");
    }

    // ---- JSON ----

    #[test]
    fn test_json_decode_basic() {
        let record = Codec::Json.decode(
            r#"{"Keyphrases": ["largest", "planet"], "topic": "astronomy", "tool": null}"#,
            &REASON,
        );
        assert_eq!(record.value(Field::Keyphrases), "largest, planet");
        assert_eq!(record.value(Field::Topic), "astronomy");
        assert!(!record.has(Field::Tool));
    }

    #[test]
    fn test_json_decode_repairs_missing_brace() {
        let record = Codec::Json.decode(r#"{"topic": "astronomy""#, &REASON);
        assert_eq!(record.value(Field::Topic), "astronomy");
    }

    #[test]
    fn test_json_decode_repairs_open_string() {
        let record = Codec::Json.decode(r#"{"keyphrases": "largest pla"#, &REASON);
        assert_eq!(record.value(Field::Keyphrases), "largest pla");
    }

    #[test]
    fn test_json_decode_strips_code_fence() {
        let text = "```json\n{\"topic\": \"cooking\"}\n```";
        assert_eq!(Codec::Json.decode(text, &REASON).value(Field::Topic), "cooking");
    }

    #[test]
    fn test_json_decode_unrepairable_is_empty() {
        assert!(Codec::Json.decode(r#"{"topic": "a", "#, &REASON).is_empty());
        assert!(Codec::Json.decode("no json here", &REASON).is_empty());
        assert!(Codec::Json.decode("[1, 2]", &REASON).is_empty());
    }

    #[test]
    fn test_json_decode_ignores_fields_outside_order() {
        let record = Codec::Json.decode(r#"{"answer": "x", "topic": "y"}"#, &REASON);
        assert!(!record.has(Field::Answer));
        assert_eq!(record.value(Field::Topic), "y");
    }

    #[test]
    fn test_json_round_trip() {
        let record = Record::new()
            .with(Field::Thought, "quote \" inside")
            .with(Field::Topic, "misc");
        let text = Codec::Json.encode(&record, &REASON);
        assert_eq!(text, r#"{"thought":"quote \" inside","topic":"misc"}"#);
        assert_eq!(Codec::Json.decode(&text, &REASON), record);
    }

    // ---- Append ----

    #[test]
    fn test_append_text_adds_field() {
        let raw = "KEYPHRASES: jupiter";
        let repaired = Codec::Text.append(raw, Field::Topic, "general knowledge", &REASON);
        let record = Codec::Text.decode(&repaired, &REASON);
        assert_eq!(record.value(Field::Topic), "general knowledge");
        assert_eq!(record.value(Field::Keyphrases), "jupiter");
    }

    #[test]
    fn test_append_json_adds_field() {
        let raw = r#"{"keyphrases": "jupiter"}"#;
        let repaired = Codec::Json.append(raw, Field::Topic, "general knowledge", &REASON);
        let record = Codec::Json.decode(&repaired, &REASON);
        assert_eq!(record.value(Field::Topic), "general knowledge");
        assert_eq!(record.value(Field::Keyphrases), "jupiter");
    }
}
