use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use deskpilot::desktop::{NativeInput, NativeScreen};
use deskpilot::engine::{DiskArtifactStore, EngineConfig, Orchestrator, StatusSink, TaskOutcome};
use deskpilot::gemini::{GeminiClient, GeminiConfig};
use deskpilot::omni::{OmniClient, OmniConfig};
use tracing_subscriber::EnvFilter;

struct ConsoleStatus;

impl StatusSink for ConsoleStatus {
    fn status(&self, title: &str, detail: &str, busy: bool) {
        if busy {
            eprintln!("[{title}] {detail} ...");
        } else {
            eprintln!("[{title}] {detail}");
        }
    }

    fn conceal(&self) {}

    fn task_done(&self, message: &str) {
        println!("Task complete: {message}");
    }

    fn question(&self, question: &str) {
        println!("Question: {question}");
    }

    fn error(&self, message: &str) {
        eprintln!("Error: {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let screen = NativeScreen::new();
    let input = NativeInput::new()?;
    let parser = OmniClient::new(OmniConfig::default())?;
    let planner = GeminiClient::new(GeminiConfig::default())?;
    let artifacts = Arc::new(DiskArtifactStore::new(std::env::temp_dir().join("deskpilot_runs")));

    let mut pilot = Orchestrator::new(screen, parser, planner, input, EngineConfig::default())
        .with_status_sink(Arc::new(ConsoleStatus))
        .with_artifact_store(artifacts);

    println!("Ready - enter a task (:retry, :abort, :quit)");
    prompt_marker();
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            prompt_marker();
            continue;
        }
        let outcome = match line {
            ":quit" => break,
            ":abort" => {
                pilot.reset_task();
                println!("Task aborted - ready for a new task");
                prompt_marker();
                continue;
            }
            ":retry" => {
                if !pilot.has_active_task() {
                    println!("Nothing to retry");
                    prompt_marker();
                    continue;
                }
                pilot.retry().await
            }
            utterance => pilot.submit(utterance).await,
        };
        match outcome {
            Ok(TaskOutcome::Completed { .. }) => println!("Ready - enter a new task"),
            Ok(TaskOutcome::AwaitingAnswer { question }) => println!("Answer: {question}"),
            Ok(TaskOutcome::Aborted) => println!("Task aborted - ready for a new task"),
            // Already surfaced through the status sink; offer the way out.
            Err(_) => println!("You can :retry the task or enter a new one"),
        }
        prompt_marker();
    }
    Ok(())
}

fn prompt_marker() {
    print!("> ");
    io::stdout().flush().ok();
}
