//! Answer pipeline for Sage.
//!
//! An inquiry is reasoned about, searched on the web and answered with
//! inline citations, streamed as it is generated. This crate holds the
//! stages, the structured-output codec, the streaming citation rewriter
//! and the conversation store the surfaces share.

pub mod citation;
pub mod codec;
pub mod error;
pub mod language;
pub mod pipeline;
pub mod prompt;
pub mod reason;
pub mod respond;
pub mod search;
pub mod session;
pub mod voice;

pub use citation::{cited_references, rewrite, CitationStream, CitedReference};
pub use codec::{Codec, Field, Record};
pub use error::{ChatError, SearchError};
pub use pipeline::{Context, NoopObserver, Pipeline, PipelineObserver, PipelineSettings};
pub use search::{SearchBackend, SearchHit, SearchLimits, SearchQuery, SearxClient};
pub use session::{Command, ConversationStore, Reply, GLOBAL_CONVERSATION};
pub use voice::{CommandListener, CommandSpeaker, Listener, Speaker};
