//! Test-spec runner.
//!
//! A test-spec file is a list of conversations:
//!
//! ```text
//! # comment
//! Story: planets
//! User: Which planet is the largest?
//! Pipeline.Reason.Keyphrases: /largest planet/
//! Pipeline.Reason.Language: English
//! Assistant: /jupiter/ is the largest
//! ```
//!
//! `Story:` starts a new conversation; turns before the first one share an
//! unnamed conversation. Assertion lines apply to the `User:` line above
//! them. Each expectation mixes literal text with `/regex/` segments and
//! matches anywhere in the value, ignoring case.

use std::fmt;
use std::path::Path;
use std::time::Instant;

use regex::Regex;

use sage_chat::{NoopObserver, Pipeline};
use sage_core::{Answer, Turn};

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

// =============================================================================
// Model
// =============================================================================

/// Which value of an answer an expectation is checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Answer,
    Keyphrases,
    Language,
}

impl Target {
    fn label(self) -> &'static str {
        match self {
            Target::Answer => "Assistant",
            Target::Keyphrases => "Pipeline.Reason.Keyphrases",
            Target::Language => "Pipeline.Reason.Language",
        }
    }

    fn value(self, answer: &Answer) -> &str {
        match self {
            Target::Answer => &answer.answer,
            Target::Keyphrases => &answer.keyphrases,
            Target::Language => &answer.language,
        }
    }
}

/// Literal text and `/regex/` segments compiled into one pattern.
#[derive(Clone, Debug)]
pub struct Expectation {
    pub source: String,
    regex: Regex,
}

impl Expectation {
    pub fn parse(source: &str) -> Result<Self, String> {
        let source = source.trim();
        if source.is_empty() {
            return Err("empty expectation".to_string());
        }

        let mut pattern = String::from("(?i)");
        for (i, segment) in source.split('/').enumerate() {
            if i % 2 == 1 {
                pattern.push_str("(?:");
                pattern.push_str(segment);
                pattern.push(')');
            } else {
                let words: Vec<String> = segment.split_whitespace().map(regex::escape).collect();
                if !words.is_empty() {
                    if segment.starts_with(char::is_whitespace) && i > 0 {
                        pattern.push_str(r"\s+");
                    }
                    pattern.push_str(&words.join(r"\s+"));
                    if segment.ends_with(char::is_whitespace) {
                        pattern.push_str(r"\s+");
                    }
                } else if !segment.is_empty() && i > 0 {
                    pattern.push_str(r"\s+");
                }
            }
        }
        if source.matches('/').count() % 2 == 1 {
            return Err(format!("unterminated /regex/ in {:?}", source));
        }

        let regex = Regex::new(&pattern).map_err(|e| format!("invalid regex: {}", e))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

#[derive(Clone, Debug)]
pub struct Check {
    pub line: usize,
    pub target: Target,
    pub expected: Expectation,
}

#[derive(Clone, Debug)]
pub struct TurnSpec {
    pub line: usize,
    pub inquiry: String,
    pub checks: Vec<Check>,
}

#[derive(Clone, Debug, Default)]
pub struct Story {
    pub name: String,
    pub turns: Vec<TurnSpec>,
}

#[derive(Clone, Debug, Default)]
pub struct Suite {
    pub stories: Vec<Story>,
}

// =============================================================================
// Parsing
// =============================================================================

impl Suite {
    pub fn load(path: &Path) -> Result<Self, EvalError> {
        let text = std::fs::read_to_string(path).map_err(|source| EvalError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, EvalError> {
        let mut stories: Vec<Story> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once(':') else {
                return Err(syntax(line, format!("expected `Key: value`, got {:?}", trimmed)));
            };
            let value = value.trim();

            let target = match key.trim().to_ascii_lowercase().as_str() {
                "story" => {
                    stories.push(Story {
                        name: value.to_string(),
                        turns: Vec::new(),
                    });
                    continue;
                }
                "user" => {
                    if value.is_empty() {
                        return Err(syntax(line, "empty inquiry".to_string()));
                    }
                    if stories.is_empty() {
                        stories.push(Story::default());
                    }
                    if let Some(story) = stories.last_mut() {
                        story.turns.push(TurnSpec {
                            line,
                            inquiry: value.to_string(),
                            checks: Vec::new(),
                        });
                    }
                    continue;
                }
                "assistant" => Target::Answer,
                "pipeline.reason.keyphrases" => Target::Keyphrases,
                "pipeline.reason.language" => Target::Language,
                other => return Err(syntax(line, format!("unknown key {:?}", other))),
            };

            let expected = Expectation::parse(value).map_err(|message| syntax(line, message))?;
            let turn = stories
                .last_mut()
                .and_then(|story| story.turns.last_mut())
                .ok_or_else(|| syntax(line, format!("{} before any User line", target.label())))?;
            turn.checks.push(Check {
                line,
                target,
                expected,
            });
        }

        stories.retain(|story| !story.turns.is_empty());
        Ok(Suite { stories })
    }

    pub fn check_count(&self) -> usize {
        self.stories
            .iter()
            .flat_map(|s| &s.turns)
            .map(|t| t.checks.len().max(1))
            .sum()
    }
}

fn syntax(line: usize, message: String) -> EvalError {
    EvalError::Syntax { line, message }
}

// =============================================================================
// Running
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub story: String,
    pub line: usize,
    pub passed: bool,
    pub detail: String,
}

#[derive(Clone, Debug, Default)]
pub struct EvalReport {
    pub results: Vec<CheckResult>,
}

impl EvalReport {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.results {
            let status = if r.passed { "PASS" } else { "FAIL" };
            let story = if r.story.is_empty() { "-" } else { &r.story };
            writeln!(f, "{} {}:{} {}", status, story, r.line, r.detail)?;
        }
        write!(f, "{} passed, {} failed", self.passed(), self.failed())
    }
}

/// Run every story; each gets a fresh history that grows with every
/// answered turn.
pub async fn run_suite(pipeline: &Pipeline, suite: &Suite) -> EvalReport {
    let mut report = EvalReport::default();

    for story in &suite.stories {
        let mut history: Vec<Turn> = Vec::new();
        for turn in &story.turns {
            let started = Instant::now();
            let result = pipeline.run(&turn.inquiry, &history, &NoopObserver).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let answer = match result {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!(
                        story = %story.name,
                        line = turn.line,
                        error = %e,
                        "Eval inquiry failed"
                    );
                    report.results.push(CheckResult {
                        story: story.name.clone(),
                        line: turn.line,
                        passed: false,
                        detail: format!("{:?} failed: {}", turn.inquiry, e),
                    });
                    continue;
                }
            };

            if turn.checks.is_empty() {
                report.results.push(CheckResult {
                    story: story.name.clone(),
                    line: turn.line,
                    passed: true,
                    detail: format!("{:?} answered", turn.inquiry),
                });
            }
            for check in &turn.checks {
                let actual = check.target.value(&answer);
                let passed = check.expected.matches(actual);
                let detail = if passed {
                    format!("{} matches {}", check.target.label(), check.expected.source)
                } else {
                    format!(
                        "{} expected {} but got {:?}",
                        check.target.label(),
                        check.expected.source,
                        actual
                    )
                };
                report.results.push(CheckResult {
                    story: story.name.clone(),
                    line: check.line,
                    passed,
                    detail,
                });
            }

            history.push(Turn::new(turn.inquiry.clone(), answer, duration_ms));
        }
    }
    report
}
