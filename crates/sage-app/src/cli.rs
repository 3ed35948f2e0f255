//! CLI argument definitions for the Sage application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Sage - answers questions from the web, with citations.
#[derive(Parser, Debug)]
#[command(name = "sage", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error, or a directive list).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Print the stage trace after every answer.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Answer one inquiry, or start an interactive session without one.
    Ask {
        /// The inquiry; words are joined with spaces.
        inquiry: Vec<String>,
    },
    /// Serve the HTTP API.
    Serve {
        /// API server port.
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,
    },
    /// Answer Telegram messages by long polling.
    Telegram,
    /// Run a test-spec file against the pipeline.
    Eval {
        /// Test-spec file.
        file: PathBuf,
    },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > SAGE_CONFIG env var > ~/.sage/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("SAGE_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the log filter, given `RUST_LOG` and the config file value.
    ///
    /// Priority: --log-level flag > RUST_LOG > config file value > a default
    /// that depends on the subcommand.
    pub fn resolve_log_filter(&self, rust_log: Option<String>, configured: Option<&str>) -> String {
        if let Some(ref level) = self.log_level {
            return level.clone();
        }
        if let Some(filter) = rust_log.filter(|f| !f.trim().is_empty()) {
            return filter;
        }
        if let Some(level) = configured.filter(|l| !l.trim().is_empty()) {
            return level.to_string();
        }
        self.default_log_level().to_string()
    }

    /// Long-running services log more than the interactive terminal.
    fn default_log_level(&self) -> &'static str {
        match self.command {
            Some(Command::Serve { .. }) | Some(Command::Telegram) => "info",
            _ => "warn",
        }
    }

    /// Port override from `serve --port`.
    pub fn resolve_port(&self) -> Option<u16> {
        match self.command {
            Some(Command::Serve { port }) => port,
            _ => None,
        }
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".sage").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".sage").join("config.toml");
    }
    PathBuf::from("config.toml")
}
