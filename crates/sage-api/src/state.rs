//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use sage_chat::{ConversationStore, Pipeline};
use sage_core::SageConfig;

/// Shared application state, cheap to clone into handler tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SageConfig>,
    pub pipeline: Arc<Pipeline>,
    /// Conversation histories keyed by the request's conversation id.
    pub conversations: Arc<ConversationStore>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: SageConfig, pipeline: Pipeline) -> Self {
        let conversations = ConversationStore::from_config(&config.general);
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            conversations: Arc::new(conversations),
            start_time: Instant::now(),
        }
    }
}
