//! Speech delegates backed by external programs.
//!
//! Sage does not synthesize or recognize speech itself. A [`Speaker`] hands
//! text to a configured program; a [`Listener`] runs a recognizer and reports
//! each line it prints as a transcript. Spawned processes are not awaited.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::ChatError;

/// Placeholder replaced by the text to speak.
pub const TEXT_PLACEHOLDER: &str = "{text}";
/// Placeholder replaced by the ISO-639-1 language code.
pub const LANG_PLACEHOLDER: &str = "{lang}";

/// Something that can read an answer aloud.
pub trait Speaker: Send + Sync {
    fn speak(&self, text: &str, language_code: &str) -> Result<(), ChatError>;
}

/// Callback receiving one recognized utterance.
pub type TranscriptFn = Arc<dyn Fn(String) + Send + Sync>;

/// Something that turns speech into text.
pub trait Listener: Send + Sync {
    fn listen(&self, on_transcript: TranscriptFn) -> Result<JoinHandle<()>, ChatError>;
}

// =============================================================================
// Command speaker
// =============================================================================

/// Runs `command` once per answer.
///
/// `{text}` and `{lang}` in the arguments are substituted; without a
/// `{text}` argument the text is appended last.
pub struct CommandSpeaker {
    command: Vec<String>,
}

impl CommandSpeaker {
    /// `None` when no command is configured.
    pub fn new(command: Vec<String>) -> Option<Self> {
        if command.first().is_some_and(|p| !p.trim().is_empty()) {
            Some(Self { command })
        } else {
            None
        }
    }

    fn args(&self, text: &str, language_code: &str) -> Vec<String> {
        let mut has_text = false;
        let mut args: Vec<String> = self.command[1..]
            .iter()
            .map(|arg| {
                if arg.contains(TEXT_PLACEHOLDER) {
                    has_text = true;
                }
                arg.replace(TEXT_PLACEHOLDER, text)
                    .replace(LANG_PLACEHOLDER, language_code)
            })
            .collect();
        if !has_text {
            args.push(text.to_string());
        }
        args
    }
}

impl Speaker for CommandSpeaker {
    fn speak(&self, text: &str, language_code: &str) -> Result<(), ChatError> {
        let program = &self.command[0];
        Command::new(program)
            .args(self.args(text, language_code))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ChatError::Voice(format!("failed to start {}: {}", program, e)))?;
        tracing::debug!(program = %program, language = %language_code, "Speaking answer");
        Ok(())
    }
}

// =============================================================================
// Command listener
// =============================================================================

/// Runs a recognizer that prints one transcript per line on stdout.
pub struct CommandListener {
    command: Vec<String>,
}

impl CommandListener {
    /// `None` when no command is configured.
    pub fn new(command: Vec<String>) -> Option<Self> {
        if command.first().is_some_and(|p| !p.trim().is_empty()) {
            Some(Self { command })
        } else {
            None
        }
    }
}

impl Listener for CommandListener {
    fn listen(&self, on_transcript: TranscriptFn) -> Result<JoinHandle<()>, ChatError> {
        let program = self.command[0].clone();
        let mut child = Command::new(&program)
            .args(&self.command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ChatError::Voice(format!("failed to start {}: {}", program, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChatError::Voice(format!("{} has no stdout", program)))?;

        tracing::info!(program = %program, "Listening for speech");
        Ok(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            on_transcript(line.to_string());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(program = %program, error = %e, "Transcript stream failed");
                        break;
                    }
                }
            }
            tracing::debug!(program = %program, "Recognizer finished");
        }))
    }
}
