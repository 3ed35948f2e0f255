//! Sage application binary - composition root.
//!
//! Ties the Sage crates together into a single executable:
//! 1. Parse the command line and load configuration from TOML + env
//! 2. Install the tracing subscriber (stderr, so answers on stdout stay clean)
//! 3. Build the answer pipeline (completion client + SearXNG client)
//! 4. Hand it to the selected surface: terminal, HTTP, Telegram or eval

mod cli;
mod display;
mod eval;
mod repl;
mod telegram;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sage_api::{start_server, AppState};
use sage_chat::{CommandListener, ConversationStore, Pipeline};
use sage_core::SageConfig;

use crate::cli::{CliArgs, Command};
use crate::eval::{run_suite, Suite};
use crate::repl::Terminal;
use crate::telegram::TelegramBot;

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> AppResult<ExitCode> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = SageConfig::load_or_default(&config_file);
    config.apply_env_overrides();
    if let Some(port) = args.resolve_port() {
        config.server.port = port;
    }

    // Tracing.
    let filter = args.resolve_log_filter(
        std::env::var("RUST_LOG").ok(),
        config.general.log_level.as_deref(),
    );
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Sage v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(path = %config_file.display(), "Configuration loaded");

    // Pipeline.
    let pipeline = Pipeline::from_config(&config)?;
    tracing::debug!(
        model = %config.llm.model,
        search = %config.search.base_url,
        "Pipeline ready"
    );

    match args.command.clone() {
        None => {
            let listener = CommandListener::new(config.voice.listen_command.clone());
            let terminal = Terminal::new(pipeline, &config, args.verbose);
            terminal.run_interactive(listener).await?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Ask { inquiry }) => {
            let terminal = Terminal::new(pipeline, &config, args.verbose);
            if inquiry.is_empty() {
                let listener = CommandListener::new(config.voice.listen_command.clone());
                terminal.run_interactive(listener).await?;
                return Ok(ExitCode::SUCCESS);
            }
            let ok = terminal.ask(&inquiry.join(" ")).await;
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Some(Command::Serve { .. }) => {
            let state = AppState::new(config, pipeline);
            tracing::info!(
                "Chat endpoint at http://{}:{}/chat",
                state.config.server.host,
                state.config.server.port
            );
            start_server(state).await?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Telegram) => {
            let bot = TelegramBot::new(&config.telegram)?;
            let store = ConversationStore::from_config(&config.general);
            bot.run(&pipeline, &store).await;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Eval { file }) => {
            let suite = Suite::load(&file)?;
            tracing::info!(
                path = %file.display(),
                stories = suite.stories.len(),
                checks = suite.check_count(),
                "Running test spec"
            );
            let report = run_suite(&pipeline, &suite).await;
            println!("{}", report);
            Ok(if report.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
