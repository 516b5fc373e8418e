use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use skein_core::config::AppConfig;
use skein_core::event::EventBus;
use skein_core::types::ThreadId;
use skein_runtime::Runtime;

#[derive(Parser)]
#[command(name = "skein", version, about = "Durable workflow execution runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "skein.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the workflow once
    Run {
        /// Thread identifier (auto-generated if not provided; reuse one to
        /// resume or continue a previous run)
        #[arg(short, long)]
        thread: Option<String>,
        /// Input state fields as key=value pairs
        #[arg(short, long, value_parser = parse_field)]
        input: Vec<(String, String)>,
    },
    /// Validate config, workflow, and agent splice without executing
    Validate,
    /// Show the resolved configuration
    Config,
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run { thread, input } => {
            let events = Arc::new(EventBus::default());
            let mut rx = events.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    if let Ok(json) = serde_json::to_string(&event) {
                        debug!(target: "skein::telemetry", "{}", json);
                    }
                }
            });

            let runtime = Runtime::load(config, events)?;
            let thread_id = thread
                .map(|t| ThreadId::from_str(&t))
                .unwrap_or_default();
            let input: HashMap<String, serde_json::Value> = input
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();

            info!(thread_id = %thread_id, "Starting execution");
            match runtime.execute(input, thread_id).await {
                Ok(outcome) => {
                    if outcome.is_degraded() {
                        warn!(
                            thread_id = %outcome.thread_id,
                            "Ran against the embedded fallback store; shared state was unreachable"
                        );
                    }
                    println!("{}", serde_json::to_string_pretty(&outcome.final_state)?);
                }
                Err(e) => {
                    error!(
                        thread_id = %e.thread_id,
                        node = %e.node,
                        kind = e.kind(),
                        "Execution failed; thread is resumable from its last committed snapshot"
                    );
                    anyhow::bail!("{}", e);
                }
            }
        }
        Commands::Validate => {
            Runtime::load(config, Arc::new(EventBus::default()))?;
            println!("configuration and workflow are valid");
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
