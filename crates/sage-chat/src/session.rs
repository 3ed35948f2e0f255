//! Conversation history owned by the calling surface.
//!
//! Each conversation id maps to its own turn list behind an async mutex.
//! Holding the guard for the length of a pipeline run keeps two inquiries
//! of the same conversation from interleaving; other conversations are
//! unaffected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use sage_core::config::GeneralConfig;
use sage_core::{Answer, Turn};

use crate::error::ChatError;
use crate::pipeline::{stage_time, Pipeline, PipelineObserver};

/// Conversation used when a surface does not name one.
pub const GLOBAL_CONVERSATION: &str = "global";

// =============================================================================
// Commands
// =============================================================================

/// Inquiries handled by the surface instead of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Forget the conversation.
    Reset,
    /// Show the stage trace of the last turn.
    Review,
}

impl Command {
    pub fn parse(inquiry: &str) -> Option<Command> {
        match inquiry.trim().to_ascii_lowercase().as_str() {
            "/reset" => Some(Command::Reset),
            "/review" => Some(Command::Review),
            _ => None,
        }
    }
}

/// Render the stage trace of a turn for display.
pub fn render_review(turn: Option<&Turn>) -> String {
    let Some(turn) = turn else {
        return "Nothing to review yet.".to_string();
    };

    let mut out = format!("Inquiry: {}\n", turn.inquiry);
    for stage in &turn.stages {
        out.push_str(&format!("{} ({} ms)\n", stage.name, stage.duration_ms));
        for (key, value) in &stage.fields {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("  {}: {}\n", key, value));
        }
    }
    out.push_str(&format!(
        "Total: {} ms across stages, {} ms overall",
        stage_time(&turn.stages).as_millis(),
        turn.duration_ms
    ));
    out
}

// =============================================================================
// Store
// =============================================================================

type Turns = Arc<tokio::sync::Mutex<Vec<Turn>>>;
type Slots = Arc<Mutex<HashMap<String, Slot>>>;

struct Slot {
    turns: Turns,
    last_used: u64,
}

/// Exclusive access to one conversation's history.
///
/// A conversation left empty when its guard drops is removed from the store.
pub struct ConversationGuard {
    turns: OwnedMutexGuard<Vec<Turn>>,
    max_turns: usize,
    id: String,
    slots: Slots,
}

impl ConversationGuard {
    pub fn history(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Append a completed turn, dropping the oldest beyond the cap.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
        let excess = self.turns.len().saturating_sub(self.max_turns);
        if excess > 0 {
            self.turns.drain(..excess);
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        if !self.turns.is_empty() {
            return;
        }
        let mut map = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Held by the map and this guard only: nobody is waiting for it.
        let idle = map
            .get(&self.id)
            .is_some_and(|slot| Arc::strong_count(&slot.turns) == 2);
        if idle {
            map.remove(&self.id);
        }
    }
}

/// What a surface should show for one inquiry.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Answer(Answer),
    Reset,
    Review(String),
}

/// Histories keyed by conversation id.
pub struct ConversationStore {
    slots: Slots,
    max_turns: usize,
    max_conversations: usize,
    clock: AtomicU64,
}

impl ConversationStore {
    pub fn new(max_turns: usize) -> Self {
        Self::from_config(&GeneralConfig {
            history_turns: max_turns,
            ..GeneralConfig::default()
        })
    }

    pub fn from_config(config: &GeneralConfig) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            max_turns: config.history_turns.max(1),
            max_conversations: config.max_conversations.max(1),
            clock: AtomicU64::new(0),
        }
    }

    /// Cap the number of conversations kept in memory.
    pub fn with_max_conversations(mut self, max: usize) -> Self {
        self.max_conversations = max.max(1);
        self
    }

    fn turns(&self, id: &str) -> Turns {
        let mut map = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = map.get_mut(id) {
            slot.last_used = now;
            return Arc::clone(&slot.turns);
        }

        if map.len() >= self.max_conversations {
            evict_idle(&mut map);
        }
        let turns = Turns::default();
        map.insert(
            id.to_string(),
            Slot {
                turns: Arc::clone(&turns),
                last_used: now,
            },
        );
        turns
    }

    fn guard(&self, id: &str, turns: OwnedMutexGuard<Vec<Turn>>) -> ConversationGuard {
        ConversationGuard {
            turns,
            max_turns: self.max_turns,
            id: id.to_string(),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Wait for exclusive access to a conversation.
    pub async fn lock(&self, id: &str) -> ConversationGuard {
        let turns = self.turns(id).lock_owned().await;
        self.guard(id, turns)
    }

    /// Access a conversation, failing if an inquiry is already running in it.
    pub fn try_lock(&self, id: &str) -> Result<ConversationGuard, ChatError> {
        let turns = self
            .turns(id)
            .try_lock_owned()
            .map_err(|_| ChatError::ConversationBusy)?;
        Ok(self.guard(id, turns))
    }

    /// Ids of the conversations currently held.
    pub fn ids(&self) -> Vec<String> {
        let map = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Handle one inquiry for a conversation.
    ///
    /// Commands are answered directly. Anything else runs the pipeline
    /// against the current history; the turn is appended only when the
    /// pipeline succeeds.
    pub async fn ask(
        &self,
        pipeline: &Pipeline,
        id: &str,
        inquiry: &str,
        observer: &dyn PipelineObserver,
    ) -> Result<Reply, ChatError> {
        let mut guard = self.try_lock(id)?;

        match Command::parse(inquiry) {
            Some(Command::Reset) => {
                guard.clear();
                tracing::info!(conversation = %id, "Conversation reset");
                return Ok(Reply::Reset);
            }
            Some(Command::Review) => return Ok(Reply::Review(render_review(guard.last()))),
            None => {}
        }

        let started = Instant::now();
        let answer = pipeline.run(inquiry, guard.history(), observer).await?;
        let duration_ms = started.elapsed().as_millis() as u64;
        guard.push(Turn::new(inquiry.trim(), answer.clone(), duration_ms));
        Ok(Reply::Answer(answer))
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::from_config(&GeneralConfig::default())
    }
}

/// Drop the least recently used conversation nobody holds.
fn evict_idle(map: &mut HashMap<String, Slot>) {
    let oldest = map
        .iter()
        .filter(|(_, slot)| Arc::strong_count(&slot.turns) == 1)
        .min_by_key(|(_, slot)| slot.last_used)
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        tracing::debug!(conversation = %id, "Evicting idle conversation");
        map.remove(&id);
    }
}
