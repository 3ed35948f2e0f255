//! Terminal surface: one-shot and interactive inquiries.
//!
//! Answers stream to stdout through the citation rewriter; diagnostics and
//! errors go to stderr.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use sage_chat::language::code_for;
use sage_chat::{
    cited_references, CitationStream, ChatError, CommandListener, CommandSpeaker,
    ConversationStore, Listener, Pipeline, PipelineObserver, Reply, Speaker, GLOBAL_CONVERSATION,
};
use sage_core::{Answer, SageConfig};

use crate::display::{format_references, format_stage, spoken_text};

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

type PrintFn = Box<dyn FnMut(&str) + Send>;

/// Prints streamed answer text and, when verbose, the stage trace.
struct TerminalObserver {
    citations: Mutex<CitationStream<PrintFn>>,
    verbose: bool,
}

impl TerminalObserver {
    fn new(verbose: bool) -> Self {
        let print: PrintFn = Box::new(|text: &str| {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        });
        Self {
            citations: Mutex::new(CitationStream::new(print)),
            verbose,
        }
    }

    /// Print the rewriter's tail and return the refs it saw.
    fn finish(&self) -> Vec<u32> {
        self.citations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl PipelineObserver for TerminalObserver {
    fn on_stage_leave(&self, stage: &str, fields: &Map<String, Value>) {
        if self.verbose {
            eprintln!("{}{}{}", DIM, format_stage(stage, fields), RESET);
        }
    }

    fn on_partial_answer(&self, text: &str) {
        self.citations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text);
    }
}

/// The terminal's single conversation plus optional speech output.
pub struct Terminal {
    pipeline: Pipeline,
    store: ConversationStore,
    speaker: Option<CommandSpeaker>,
    verbose: bool,
}

impl Terminal {
    pub fn new(pipeline: Pipeline, config: &SageConfig, verbose: bool) -> Self {
        Self {
            pipeline,
            store: ConversationStore::from_config(&config.general),
            speaker: CommandSpeaker::new(config.voice.speak_command.clone()),
            verbose,
        }
    }

    /// Answer one inquiry. Returns whether it succeeded.
    pub async fn ask(&self, inquiry: &str) -> bool {
        let observer = TerminalObserver::new(self.verbose);
        let result = self
            .store
            .ask(&self.pipeline, GLOBAL_CONVERSATION, inquiry, &observer)
            .await;
        let refs = observer.finish();

        match result {
            Ok(Reply::Answer(answer)) => {
                println!();
                let cited = cited_references(&refs, &answer.references);
                if !cited.is_empty() {
                    print!("\n{}", format_references(&cited));
                }
                self.speak(&answer);
                true
            }
            Ok(Reply::Reset) => {
                println!("Conversation reset.");
                true
            }
            Ok(Reply::Review(text)) => {
                println!("{}", text);
                true
            }
            Err(e) => {
                println!();
                eprintln!("error: {}", e);
                false
            }
        }
    }

    fn speak(&self, answer: &Answer) {
        let Some(ref speaker) = self.speaker else {
            return;
        };
        let code = code_for(&answer.language).unwrap_or("en");
        if let Err(e) = speaker.speak(&spoken_text(answer), code) {
            tracing::warn!(error = %e, "Failed to speak answer");
        }
    }

    /// Read inquiries from stdin, and from the recognizer when one is
    /// configured, until end of input or `/quit`.
    pub async fn run_interactive(
        &self,
        listener: Option<CommandListener>,
    ) -> Result<(), ChatError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Input>();

        let stdin_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdin_tx.send(Input::Line(line)).is_err() {
                    return;
                }
            }
            let _ = stdin_tx.send(Input::Eof);
        });

        let _recognizer = match listener {
            Some(listener) => {
                let voice_tx = tx.clone();
                Some(listener.listen(Arc::new(move |transcript| {
                    let _ = voice_tx.send(Input::Transcript(transcript));
                }))?)
            }
            None => None,
        };
        drop(tx);

        println!("Ask anything. /review shows the last trace, /reset forgets, /quit exits.");
        loop {
            print!("> ");
            let _ = std::io::stdout().flush();

            let inquiry = match rx.recv().await {
                Some(Input::Line(line)) => line,
                Some(Input::Transcript(text)) => {
                    println!("{}", text);
                    text
                }
                Some(Input::Eof) | None => break,
            };
            let inquiry = inquiry.trim();
            if inquiry.is_empty() {
                continue;
            }
            if is_quit(inquiry) {
                break;
            }
            self.ask(inquiry).await;
        }
        println!();
        Ok(())
    }
}

enum Input {
    Line(String),
    Transcript(String),
    Eof,
}

fn is_quit(inquiry: &str) -> bool {
    matches!(
        inquiry.to_ascii_lowercase().as_str(),
        "/quit" | "/exit" | "quit" | "exit"
    )
}
