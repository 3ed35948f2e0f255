//! Reasoning stage: turn the inquiry into search keyphrases and a topic.

use sage_core::Turn;
use sage_llm::ChatCompletion;

use crate::codec::{Codec, Field, Record};
use crate::error::ChatError;
use crate::prompt::{self, REASON_FIELDS};

/// Topic used when the model gives none.
pub const DEFAULT_TOPIC: &str = "general knowledge";

/// Decoded reasoning output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reasoning {
    pub record: Record,
    /// Whether a repair request had to be sent.
    pub repaired: bool,
}

/// Ask for a reasoning record, repairing missing keyphrases once.
pub async fn reason(
    llm: &dyn ChatCompletion,
    codec: Codec,
    inquiry: &str,
    history: &[Turn],
) -> Result<Reasoning, ChatError> {
    let schema = match codec {
        Codec::Json => Some(prompt::reason_schema()),
        Codec::Text => None,
    };

    let messages = prompt::reason_messages(inquiry, history, codec);
    let raw = llm.complete(&messages, schema.as_ref(), None).await?;
    let mut record = codec.decode(&raw, &REASON_FIELDS);
    let mut repaired = false;

    if !record.has(Field::Keyphrases) {
        tracing::warn!(fields = record.len(), "Reasoning output has no keyphrases; asking again");
        let messages =
            prompt::repair_messages(inquiry, history, codec, &record, Field::Keyphrases);
        let raw = llm.complete(&messages, schema.as_ref(), None).await?;
        record = merge(codec.decode(&raw, &REASON_FIELDS), &record);
        repaired = true;
        if !record.has(Field::Keyphrases) {
            tracing::warn!("Repair reply still has no keyphrases");
        }
    }

    if !record.has(Field::Topic) {
        let encoded = codec.encode(&record, &REASON_FIELDS);
        let patched = codec.append(&encoded, Field::Topic, DEFAULT_TOPIC, &REASON_FIELDS);
        record = codec.decode(&patched, &REASON_FIELDS);
    }

    Ok(Reasoning { record, repaired })
}

/// `primary` with gaps filled from `fallback`.
fn merge(mut primary: Record, fallback: &Record) -> Record {
    for (field, value) in fallback.iter() {
        if !primary.has(field) {
            primary.set(field, value);
        }
    }
    primary
}
