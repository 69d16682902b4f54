//! volley - replay scripted conversations through the orchestration engine

mod config;
mod script;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use volley_agent::{Engine, PendingClientCall, SessionEvent, SessionHandle, SessionOutcome};
use volley_ai::ModelService;
use volley_ai::providers::{ScriptedModel, SseModelService};

use crate::script::Script;

/// volley - tool-invocation orchestration engine
#[derive(Parser, Debug)]
#[command(name = "volley")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ~/.config/volley/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a conversation script through the engine
    Run {
        /// Script file (JSON)
        script: PathBuf,

        /// Automatic model re-invocations per request
        #[arg(long)]
        max_roundtrips: Option<u32>,

        /// End the session on the first failed tool call
        #[arg(long)]
        strict: bool,

        /// Emit session events as JSON lines
        #[arg(long)]
        json: bool,

        /// Write the final session checkpoint to this file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Initialize config file
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("volley=debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    match args.command {
        Command::Init => {
            let path = config::Config::init().context("Error creating config")?;
            println!("Config file created at: {}", path.display());
            println!("\nExample config:\n{}", config::example_config());
            Ok(())
        }
        Command::Run {
            script,
            max_roundtrips,
            strict,
            json,
            save,
        } => {
            let config = match &args.config {
                Some(path) => config::Config::load_from(path),
                None => config::Config::load(),
            };
            let script = Script::load(&script)?;

            let mut engine_config = config.engine_config();
            if let Some(max) = max_roundtrips {
                engine_config.max_automatic_roundtrips = max;
            }
            if strict {
                engine_config.error_tolerant = false;
            }
            if script.system_prompt.is_some() {
                engine_config.system_prompt = script.system_prompt.clone();
            }

            let model = build_model(&config, &script)?;
            let mut engine = Engine::new(engine_config, model);
            for definition in script.definitions() {
                engine.add_tool(definition)?;
            }
            tracing::debug!("Tools: {:?}", engine.tool_names());

            let printer = tokio::spawn(print_events(
                engine.subscribe(),
                engine.handle(),
                script.client_results.clone(),
                json,
            ));

            let result = engine.run(&script.prompt).await;
            let _ = printer.await;

            if let Some(path) = save {
                std::fs::write(&path, engine.checkpoint()?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }

            let outcome = result?;
            if !json {
                print_outcome(&outcome);
            }
            Ok(())
        }
    }
}

fn build_model(config: &config::Config, script: &Script) -> anyhow::Result<Arc<dyn ModelService>> {
    if !script.turns.is_empty() {
        return Ok(Arc::new(ScriptedModel::new(script.turns.clone())));
    }
    let Some(endpoint) = &config.service.endpoint else {
        bail!("Script has no turns and no service endpoint is configured");
    };
    let mut service = SseModelService::new(endpoint.clone());
    if let Some(key) = config.api_key() {
        service = service.with_api_key(key);
    }
    Ok(Arc::new(service))
}

/// Print events until the session ends, answering client calls on the way.
async fn print_events(
    mut rx: broadcast::Receiver<SessionEvent>,
    handle: SessionHandle,
    client_results: std::collections::HashMap<String, serde_json::Value>,
    json: bool,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event printer lagged by {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Could not serialize event: {}", e),
            }
        } else {
            match &event {
                SessionEvent::TextDelta { delta, .. } => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                SessionEvent::ToolExecutionEnd {
                    tool_name, result, ..
                } => {
                    let marker = if result.is_error { "failed" } else { "ok" };
                    println!("\n[{} {}: {}]", tool_name, marker, result.text_content());
                }
                SessionEvent::Error { message } => eprintln!("\nError: {}", message),
                _ => {}
            }
        }

        if let SessionEvent::ClientToolCall { call } = &event {
            let value = match client_results.get(&call.call_id) {
                Some(value) => value.clone(),
                None => ask_client(call, &mut stdin).await,
            };
            if let Err(e) = handle.supply_client_result(&call.call_id, value) {
                eprintln!("Client result rejected: {}", e);
            }
        }

        if event.is_terminal() {
            break;
        }
    }
}

/// Read a client result from stdin. JSON is used as-is, anything else as a string.
async fn ask_client(
    call: &PendingClientCall,
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> serde_json::Value {
    eprint!(
        "\n{} {} wants a result for {}: ",
        call.tool_name, call.call_id, call.arguments
    );
    let _ = std::io::stderr().flush();

    match stdin.next_line().await {
        Ok(Some(line)) => serde_json::from_str(line.trim())
            .unwrap_or_else(|_| serde_json::Value::String(line.trim().to_string())),
        Ok(None) | Err(_) => serde_json::Value::Null,
    }
}

fn print_outcome(outcome: &SessionOutcome) {
    let state = serde_json::to_value(outcome.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    println!(
        "\n[{} | turns: {} | roundtrips: {} | tokens: {} ({} in, {} out)]",
        state,
        outcome.turns,
        outcome.roundtrips,
        outcome.usage.total(),
        outcome.usage.input,
        outcome.usage.output
    );
    if let Some(error) = &outcome.error {
        println!("[error: {}]", error);
    }
}
