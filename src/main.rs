mod provider;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use promptflow_core::config::AppConfig;
use promptflow_core::event::{EventBus, FlowEvent};
use promptflow_core::execution::FlowExecutionResult;
use promptflow_core::flow::PromptFlow;
use promptflow_core::template;
use promptflow_core::traits::{ExecutionSink, ModelProvider};
use promptflow_core::types::PromptTemplate;

use promptflow_engine::{
    validate, BatchCoordinator, BatchTarget, FlowEngine, JsonlHistorySink, MemoryStore,
    RetryingProvider,
};

use crate::provider::EchoProvider;

#[derive(Parser)]
#[command(name = "promptflow", version, about = "Validate and run prompt flows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "promptflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a flow definition for structural errors
    Validate {
        /// Flow definition (JSON)
        flow: PathBuf,
    },
    /// List the variables a template references
    Variables {
        /// Template text
        template: Option<String>,
        /// Read the template from a file instead
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Run a flow once
    Run {
        /// Flow definition (JSON)
        flow: PathBuf,
        /// Input binding (KEY=VALUE), repeatable
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// JSON object of input bindings
        #[arg(long)]
        vars_file: Option<PathBuf>,
        /// JSON array of stored templates for template_ref nodes
        #[arg(long)]
        templates: Option<PathBuf>,
        /// Print node events as they happen
        #[arg(long)]
        watch: bool,
        /// Print the full execution result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a flow over many variable sets
    Batch {
        /// Flow definition (JSON)
        flow: PathBuf,
        /// JSON array of variable sets (objects of strings)
        #[arg(long)]
        sets: PathBuf,
        /// Concurrent items (defaults to [batch].default_concurrency)
        #[arg(long)]
        concurrency: Option<usize>,
        /// JSON array of stored templates for template_ref nodes
        #[arg(long)]
        templates: Option<PathBuf>,
        /// Print the full batch result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("promptflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that need no config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "promptflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { flow } => return validate_flow(flow),
        Commands::Variables { template, file } => {
            return list_variables(template.as_deref(), file.as_deref())
        }
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            flow,
            vars,
            vars_file,
            templates,
            watch,
            json,
        } => {
            let flow = read_flow(&flow)?;
            let inputs = parse_inputs(&vars, vars_file.as_deref())?;
            let engine = build_engine(&config, templates.as_deref()).await?;
            if watch {
                spawn_watcher(engine.event_bus().clone());
            }
            let cancel = cancel_on_ctrl_c();

            let result = engine.execute(&flow, inputs, &cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_run(&result);
            }
            if !result.success {
                bail!(
                    "flow {} {}: {}",
                    result.flow_id,
                    result.status,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Batch {
            flow,
            sets,
            concurrency,
            templates,
            json,
        } => {
            let flow = read_flow(&flow)?;
            let sets: Vec<HashMap<String, String>> = read_json(&sets)?;
            let engine = Arc::new(build_engine(&config, templates.as_deref()).await?);
            let mut coordinator = BatchCoordinator::new(engine, config.batch.clone());
            if let Some(sink) = history_sink(&config) {
                coordinator = coordinator.with_sink(sink);
            }
            let cancel = cancel_on_ctrl_c();

            let (tx, mut rx) = coordinator.progress_channel();
            let progress = tokio::spawn(async move {
                let mut stderr = std::io::stderr();
                while let Some(p) = rx.recv().await {
                    let mark = if p.success { "ok" } else { "failed" };
                    let _ = write!(
                        stderr,
                        "\r[{}/{}] item #{} {}   ",
                        p.processed_count, p.total_count, p.current_item, mark
                    );
                    let _ = stderr.flush();
                }
                let _ = writeln!(stderr);
            });

            let result = coordinator
                .execute_batch(&BatchTarget::Flow(flow), sets, concurrency, Some(tx), &cancel)
                .await?;
            progress.await.ok();

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "batch {}: {} of {} processed, {} succeeded, {} failed, {} cancelled",
                    result.status,
                    result.processed_count,
                    result.total_count,
                    result.success_count,
                    result.failure_count,
                    result.cancelled_count
                );
                for item in result.item_results.iter().filter(|i| !i.result.success) {
                    println!(
                        "  item #{}: {}",
                        item.index,
                        item.result.error.as_deref().unwrap_or("failed")
                    );
                }
            }
        }
        Commands::Completions { .. } | Commands::Validate { .. } | Commands::Variables { .. } => {
            unreachable!("handled before config load")
        }
    }
    Ok(())
}

/// Load the config file; a missing default file falls back to defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    if path == Path::new("promptflow.toml") {
        return Ok(AppConfig::default());
    }
    bail!("config file not found: {}", path.display())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn read_flow(path: &Path) -> anyhow::Result<PromptFlow> {
    read_json(path)
}

fn validate_flow(path: &Path) -> anyhow::Result<()> {
    let flow = read_flow(path)?;
    let errors = validate(&flow);
    if errors.is_empty() {
        println!(
            "{}: ok ({} nodes, {} edges)",
            flow.id,
            flow.nodes.len(),
            flow.edges.len()
        );
        return Ok(());
    }
    for error in &errors {
        println!("{}", error);
    }
    bail!("{} validation error(s) in {}", errors.len(), path.display())
}

fn list_variables(template_text: Option<&str>, file: Option<&Path>) -> anyhow::Result<()> {
    let text = match (template_text, file) {
        (_, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (Some(text), None) => text.to_string(),
        (None, None) => bail!("pass a template or --file"),
    };
    for name in template::extract_variable_names(&text) {
        println!("{}", name);
    }
    Ok(())
}

/// `--vars-file` first, then `--var` pairs on top.
fn parse_inputs(pairs: &[String], file: Option<&Path>) -> anyhow::Result<HashMap<String, Value>> {
    let mut inputs: HashMap<String, Value> = match file {
        Some(path) => read_json(path)?,
        None => HashMap::new(),
    };
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got '{}'", pair);
        };
        inputs.insert(key.trim().to_string(), Value::String(value.to_string()));
    }
    Ok(inputs)
}

fn history_sink(config: &AppConfig) -> Option<Arc<dyn ExecutionSink>> {
    config.history.as_ref().map(|h| {
        let dir = h.dir_path();
        info!(dir = %dir.display(), "Recording execution history");
        Arc::new(JsonlHistorySink::new(dir)) as Arc<dyn ExecutionSink>
    })
}

async fn build_engine(
    config: &AppConfig,
    templates: Option<&Path>,
) -> anyhow::Result<FlowEngine> {
    let echo: Arc<dyn ModelProvider> =
        Arc::new(EchoProvider::new(config.provider.echo_latency_ms));
    let provider: Arc<dyn ModelProvider> = match &config.retry {
        Some(retry) => Arc::new(RetryingProvider::new(echo, retry.clone())),
        None => echo,
    };

    let mut engine = FlowEngine::with_provider(provider)
        .with_config(config.engine.clone())
        .with_event_bus(Arc::new(EventBus::default()));
    if let Some(path) = templates {
        let loaded: Vec<PromptTemplate> = read_json(path)?;
        info!(count = loaded.len(), "Loaded templates");
        let store = MemoryStore::with_definitions(loaded, Vec::new());
        engine = engine.with_templates(Arc::new(store));
    }
    if let Some(sink) = history_sink(config) {
        engine = engine.with_sink(sink);
    }
    Ok(engine)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Interrupted, finishing in-flight work");
        cancel_clone.cancel();
    });
    cancel
}

fn spawn_watcher(event_bus: Arc<EventBus>) {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(FlowEvent::NodeStarted {
                    node_id,
                    kind,
                    iteration,
                    ..
                }) => match iteration {
                    Some(i) => eprintln!("  > {} ({}) [item {}]", node_id, kind, i),
                    None => eprintln!("  > {} ({})", node_id, kind),
                },
                Ok(FlowEvent::NodeFinished {
                    node_id,
                    status,
                    duration_ms,
                    ..
                }) => eprintln!("  < {} {} in {}ms", node_id, status, duration_ms),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Watcher lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_run(result: &FlowExecutionResult) {
    match &result.output {
        Value::String(text) => println!("{}", text),
        Value::Null => {}
        other => println!(
            "{}",
            serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
        ),
    }
    let mut counts: Vec<String> = result
        .status_counts()
        .into_iter()
        .map(|(status, n)| format!("{} {}", n, status))
        .collect();
    counts.sort();
    eprintln!(
        "{} {} in {}ms ({}; {} tokens)",
        result.flow_id,
        result.status,
        result.execution_time_ms,
        counts.join(", "),
        result.total_tokens
    );
    if let Some(node) = &result.failed_node_id {
        eprintln!("failed at node {}", node);
    }
}
