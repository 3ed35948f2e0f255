//! Prompt construction for the reasoning and response stages.

use serde_json::{json, Value};

use sage_core::{Message, Reference, Turn};
use sage_llm::ResponseSchema;

use crate::codec::{Codec, Field, Record};

/// Fields the reasoning stage asks for, in output order.
pub const REASON_FIELDS: [Field; 6] = [
    Field::Tool,
    Field::Language,
    Field::Thought,
    Field::Keyphrases,
    Field::Observation,
    Field::Topic,
];

/// Fields kept for each prior turn in the reasoning history.
const HISTORY_FIELDS: [Field; 5] = [
    Field::Inquiry,
    Field::Topic,
    Field::Thought,
    Field::Keyphrases,
    Field::Answer,
];

/// Prior turns shown to the reasoning stage.
pub const REASON_HISTORY_TURNS: usize = 3;

/// Prior turns shown to the response stage.
pub const RESPOND_HISTORY_TURNS: usize = 2;

/// References embedded in the response prompt.
pub const MAX_PROMPT_REFERENCES: usize = 3;

const REASON_INSTRUCTIONS: &str = "\
You are a research assistant that prepares a web search for the user's inquiry. \
Think about what the user wants, taking the previous conversation into account, \
and decide which query a search engine needs to find the answer.";

const REASON_FORMAT_TEXT: &str = "\
Reply with exactly these lines and nothing else:
TOOL: always Google
LANGUAGE: the language the inquiry is written in, as an English name
THOUGHT: one sentence about what the user is asking
KEYPHRASES: the search engine query, a few words
OBSERVATION: one sentence of what you already know about it
TOPIC: a short label for the subject, such as astronomy";

const REASON_FORMAT_JSON: &str = "\
Reply with a single JSON object with the string keys tool (always Google), \
language (the language of the inquiry, as an English name), thought, \
keyphrases (the search engine query), observation and topic.";

const REASON_EXAMPLES: &[(&str, &[(Field, &str)])] = &[
    (
        "Which planet is the largest?",
        &[
            (Field::Tool, "Google"),
            (Field::Language, "English"),
            (Field::Thought, "The user wants to know the largest planet of the solar system."),
            (Field::Keyphrases, "largest planet solar system"),
            (Field::Observation, "Planets differ a lot in size."),
            (Field::Topic, "astronomy"),
        ],
    ),
    (
        "Wie viele Einwohner hat Berlin?",
        &[
            (Field::Tool, "Google"),
            (Field::Language, "German"),
            (Field::Thought, "The user asks for the population of Berlin."),
            (Field::Keyphrases, "Berlin Einwohnerzahl"),
            (Field::Observation, "Berlin is the capital of Germany."),
            (Field::Topic, "geography"),
        ],
    ),
];

// =============================================================================
// Reasoning
// =============================================================================

/// Messages for the reasoning request.
pub fn reason_messages(inquiry: &str, history: &[Turn], codec: Codec) -> Vec<Message> {
    let mut system = String::from(REASON_INSTRUCTIONS);
    system.push_str("\n\n");
    system.push_str(match codec {
        Codec::Text => REASON_FORMAT_TEXT,
        Codec::Json => REASON_FORMAT_JSON,
    });

    for (i, (example, fields)) in REASON_EXAMPLES.iter().enumerate() {
        let record = fields
            .iter()
            .fold(Record::new(), |record, (f, v)| record.with(*f, *v));
        system.push_str(&format!(
            "\n\nExample {}\nInquiry: {}\n{}",
            i + 1,
            example,
            codec.encode(&record, &REASON_FIELDS)
        ));
    }

    let recent = recent_turns(history, REASON_HISTORY_TURNS);
    if !recent.is_empty() {
        system.push_str("\n\nPrevious conversation:");
        for turn in recent {
            system.push_str("\n\n");
            system.push_str(&Codec::Text.encode(&turn_record(turn), &HISTORY_FIELDS));
        }
    }

    vec![Message::system(system), Message::user(inquiry)]
}

/// Messages asking the model to supply a field it left out.
///
/// The partial record is shown back as the assistant's answer.
pub fn repair_messages(
    inquiry: &str,
    history: &[Turn],
    codec: Codec,
    partial: &Record,
    missing: Field,
) -> Vec<Message> {
    let mut messages = reason_messages(inquiry, history, codec);
    messages.push(Message::assistant(codec.encode(partial, &REASON_FIELDS)));
    messages.push(Message::user(format!(
        "Your reply has no {} field. Reply again with the complete record, \
         including {}.",
        missing.marker(),
        missing.marker()
    )));
    messages
}

/// JSON schema constraining the reasoning output.
pub fn reason_schema() -> ResponseSchema {
    let properties: serde_json::Map<String, Value> = REASON_FIELDS
        .iter()
        .map(|f| (f.name().to_string(), json!({ "type": "string" })))
        .collect();
    let required: Vec<&str> = REASON_FIELDS.iter().map(|f| f.name()).collect();
    ResponseSchema {
        name: "reasoning".to_string(),
        schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        }),
    }
}

// =============================================================================
// Response
// =============================================================================

/// Messages for the cited answer.
pub fn respond_messages(
    inquiry: &str,
    language: &str,
    references: &[Reference],
    history: &[Turn],
) -> Vec<Message> {
    let language = if language.trim().is_empty() {
        "the language of the inquiry"
    } else {
        language.trim()
    };

    let mut system = if references.is_empty() {
        format!(
            "You are a helpful assistant. No web results were found for this inquiry. \
             Answer in {} in at most 3 sentences from what you know, and say that you \
             could not find sources.",
            language
        )
    } else {
        let mut s = format!(
            "You are a helpful assistant. Answer the inquiry in {} using only the \
             references below. Use at most 3 sentences. End every sentence with one or \
             more citation markers such as [citation:1] naming the references it \
             relies on.\n\nReferences:",
            language
        );
        for reference in references.iter().take(MAX_PROMPT_REFERENCES) {
            s.push_str(&format!(
                "\n[citation:{}] {}\n{}",
                reference.position, reference.title, reference.snippet
            ));
        }
        s
    };
    system.push('\n');

    let mut messages = vec![Message::system(system)];
    for turn in recent_turns(history, RESPOND_HISTORY_TURNS) {
        messages.push(Message::user(turn.inquiry.clone()));
        messages.push(Message::assistant(turn.answer.clone()));
    }
    messages.push(Message::user(inquiry));
    messages
}

fn recent_turns(history: &[Turn], n: usize) -> &[Turn] {
    &history[history.len().saturating_sub(n)..]
}

fn turn_record(turn: &Turn) -> Record {
    // Flatten answers so the first-line rule keeps them whole.
    let answer = turn.answer.split_whitespace().collect::<Vec<_>>().join(" ");
    Record::new()
        .with(Field::Inquiry, turn.inquiry.as_str())
        .with(Field::Topic, turn.topic.as_str())
        .with(Field::Thought, turn.thought.as_str())
        .with(Field::Keyphrases, turn.keyphrases.as_str())
        .with(Field::Answer, answer)
}
