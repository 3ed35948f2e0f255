//! Pipeline entry point: reason, search and respond for one inquiry.
//!
//! Stages run strictly in order. Each consumes the [`Context`] built so far
//! and returns it with its own outputs merged in. The caller's history is
//! only ever read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use sage_core::{Answer, Reference, RetryPolicy, SageConfig, Stage, Turn};
use sage_llm::{ChatCompletion, CompletionClient};

use crate::codec::{Codec, Field};
use crate::error::ChatError;
use crate::reason;
use crate::respond;
use crate::search::{self, SearchBackend, SearchLimits, SearxClient};

pub const STAGE_REASON: &str = "Reason";
pub const STAGE_SEARCH: &str = "Search";
pub const STAGE_RESPOND: &str = "Respond";

// =============================================================================
// Observer
// =============================================================================

/// Side effects a caller attaches to one invocation.
///
/// `on_stage_enter` and `on_stage_leave` are called once per executed stage,
/// in matching pairs; a failing stage still gets its leave call, with an
/// `error` field. `on_partial_answer` only fires during the response stage.
pub trait PipelineObserver: Send + Sync {
    fn on_stage_enter(&self, _stage: &str) {}
    fn on_stage_leave(&self, _stage: &str, _fields: &Map<String, Value>) {}
    fn on_partial_answer(&self, _text: &str) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

// =============================================================================
// Context
// =============================================================================

/// State threaded through the stages of one invocation.
#[derive(Clone, Debug)]
pub struct Context<'h> {
    pub inquiry: String,
    pub history: &'h [Turn],
    pub tool: String,
    pub thought: String,
    pub keyphrases: String,
    pub observation: String,
    pub topic: String,
    pub language: String,
    pub references: Vec<Reference>,
    pub answer: String,
    pub stages: Vec<Stage>,
}

impl<'h> Context<'h> {
    pub fn new(inquiry: impl Into<String>, history: &'h [Turn]) -> Self {
        Self {
            inquiry: inquiry.into(),
            history,
            tool: String::new(),
            thought: String::new(),
            keyphrases: String::new(),
            observation: String::new(),
            topic: String::new(),
            language: String::new(),
            references: Vec::new(),
            answer: String::new(),
            stages: Vec::new(),
        }
    }

    pub fn into_answer(self) -> Answer {
        Answer {
            answer: self.answer,
            topic: self.topic,
            language: self.language,
            thought: self.thought,
            keyphrases: self.keyphrases,
            references: self.references,
            stages: self.stages,
        }
    }
}

/// Start time of a running stage.
struct StageTimer {
    name: &'static str,
    timestamp: DateTime<Utc>,
    started: Instant,
}

impl StageTimer {
    fn enter(name: &'static str, observer: &dyn PipelineObserver) -> Self {
        observer.on_stage_enter(name);
        Self {
            name,
            timestamp: Utc::now(),
            started: Instant::now(),
        }
    }

    fn leave(self, observer: &dyn PipelineObserver, fields: Map<String, Value>) -> Stage {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        tracing::debug!(stage = self.name, duration_ms, "Stage finished");
        observer.on_stage_leave(self.name, &fields);
        Stage {
            name: self.name.to_string(),
            timestamp: self.timestamp,
            duration_ms,
            fields,
        }
    }

    fn fail<E: std::fmt::Display>(self, observer: &dyn PipelineObserver, err: &E) {
        let mut fields = Map::new();
        fields.insert("error".to_string(), Value::String(err.to_string()));
        tracing::warn!(stage = self.name, error = %err, "Stage failed");
        self.leave(observer, fields);
    }
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// =============================================================================
// Pipeline
// =============================================================================

/// Tunables of the pipeline that do not belong to a backend client.
#[derive(Clone, Copy, Debug)]
pub struct PipelineSettings {
    pub codec: Codec,
    pub search_retry: RetryPolicy,
    pub limits: SearchLimits,
    pub max_inquiry_chars: usize,
}

impl From<&SageConfig> for PipelineSettings {
    fn from(config: &SageConfig) -> Self {
        Self {
            codec: if config.llm.json_schema {
                Codec::Json
            } else {
                Codec::Text
            },
            search_retry: RetryPolicy::from(&config.retry),
            limits: SearchLimits::from(&config.search),
            max_inquiry_chars: config.general.max_inquiry_chars,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&SageConfig::default())
    }
}

/// The answer pipeline with its backends.
pub struct Pipeline {
    llm: Arc<dyn ChatCompletion>,
    search: Arc<dyn SearchBackend>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        llm: Arc<dyn ChatCompletion>,
        search: Arc<dyn SearchBackend>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            llm,
            search,
            settings,
        }
    }

    /// Build the HTTP-backed pipeline described by `config`.
    pub fn from_config(config: &SageConfig) -> Result<Self, ChatError> {
        let llm = CompletionClient::new(config.llm.clone(), RetryPolicy::from(&config.retry))?;
        let search = SearxClient::new(config.search.clone())?;
        Ok(Self::new(
            Arc::new(llm),
            Arc::new(search),
            PipelineSettings::from(config),
        ))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Answer `inquiry` given the prior turns of its conversation.
    pub async fn run(
        &self,
        inquiry: &str,
        history: &[Turn],
        observer: &dyn PipelineObserver,
    ) -> Result<Answer, ChatError> {
        let inquiry = inquiry.trim();
        if inquiry.is_empty() {
            return Err(ChatError::EmptyInquiry);
        }
        let max = self.settings.max_inquiry_chars;
        if inquiry.chars().count() > max {
            return Err(ChatError::InquiryTooLong(max));
        }

        let started = Instant::now();
        let ctx = Context::new(inquiry, history);
        let ctx = self.reason(ctx, observer).await?;
        let ctx = self.search(ctx, observer).await?;
        let ctx = self.respond(ctx, observer).await?;

        tracing::info!(
            duration_ms = started.elapsed().as_millis() as u64,
            references = ctx.references.len(),
            topic = %ctx.topic,
            "Inquiry answered"
        );
        Ok(ctx.into_answer())
    }

    async fn reason<'h>(
        &self,
        mut ctx: Context<'h>,
        observer: &dyn PipelineObserver,
    ) -> Result<Context<'h>, ChatError> {
        let timer = StageTimer::enter(STAGE_REASON, observer);
        let reasoning =
            match reason::reason(self.llm.as_ref(), self.settings.codec, &ctx.inquiry, ctx.history)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    timer.fail(observer, &e);
                    return Err(e);
                }
            };

        let record = &reasoning.record;
        ctx.tool = record.value(Field::Tool).to_string();
        ctx.language = record.value(Field::Language).to_string();
        ctx.thought = record.value(Field::Thought).to_string();
        ctx.keyphrases = record.value(Field::Keyphrases).to_string();
        ctx.observation = record.value(Field::Observation).to_string();
        ctx.topic = record.value(Field::Topic).to_string();

        let stage = timer.leave(
            observer,
            fields(&[
                ("tool", json!(ctx.tool)),
                ("language", json!(ctx.language)),
                ("thought", json!(ctx.thought)),
                ("keyphrases", json!(ctx.keyphrases)),
                ("observation", json!(ctx.observation)),
                ("topic", json!(ctx.topic)),
                ("repaired", json!(reasoning.repaired)),
            ]),
        );
        ctx.stages.push(stage);
        Ok(ctx)
    }

    async fn search<'h>(
        &self,
        mut ctx: Context<'h>,
        observer: &dyn PipelineObserver,
    ) -> Result<Context<'h>, ChatError> {
        let timer = StageTimer::enter(STAGE_SEARCH, observer);
        let query = search::build_query(&ctx.keyphrases, &ctx.topic, &ctx.language);
        let references = match search::search(
            self.search.as_ref(),
            &self.settings.search_retry,
            self.settings.limits,
            &query,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                timer.fail(observer, &e);
                return Err(e.into());
            }
        };

        let urls: Vec<&str> = references.iter().map(|r| r.url.as_str()).collect();
        let stage = timer.leave(
            observer,
            fields(&[
                ("query", json!(query.q)),
                ("language", json!(query.language)),
                ("references", json!(urls)),
            ]),
        );
        ctx.references = references;
        ctx.stages.push(stage);
        Ok(ctx)
    }

    async fn respond<'h>(
        &self,
        mut ctx: Context<'h>,
        observer: &dyn PipelineObserver,
    ) -> Result<Context<'h>, ChatError> {
        let timer = StageTimer::enter(STAGE_RESPOND, observer);
        let on_partial = |text: &str| observer.on_partial_answer(text);
        let response = match respond::respond(
            self.llm.as_ref(),
            &ctx.inquiry,
            &ctx.language,
            &ctx.references,
            ctx.history,
            &on_partial,
        )
        .await
        {
            Ok(a) => a,
            Err(e) => {
                timer.fail(observer, &e);
                return Err(e);
            }
        };

        let mut stage_fields = fields(&[
            ("answer", json!(response.answer)),
            ("references", json!(ctx.references.len())),
        ]);
        if let Some(warning) = response.warning {
            stage_fields.insert("warning".to_string(), json!(warning));
        }
        let stage = timer.leave(observer, stage_fields);
        ctx.answer = response.answer;
        ctx.stages.push(stage);
        Ok(ctx)
    }
}

/// Total time recorded across the stages of an answer.
pub fn stage_time(stages: &[Stage]) -> Duration {
    Duration::from_millis(stages.iter().map(|s| s.duration_ms).sum())
}
