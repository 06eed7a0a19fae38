mod doctor;
mod runtime;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use visitflow_core::config::AppConfig;
use visitflow_core::traits::{DeadLetterQueue, EventRecorder};
use visitflow_core::types::{Signal, TimeRange, VisitorContext};
use visitflow_engine::RunLogger;
use visitflow_gateway::GatewayServer;
use visitflow_store::{summarize, FunnelAnalyzer, MemoryStore, SqliteStore};

use crate::runtime::Runtime;

#[derive(Parser)]
#[command(name = "visitflow", version, about = "Visitor workflow automation engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "visitflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway and the execution worker pool
    Serve,
    /// Feed one signal through the active workflows and print lifecycle events
    Simulate {
        /// Site the visitor is on
        #[arg(long)]
        site: String,
        /// Visitor ID
        #[arg(long, default_value = "cli-visitor")]
        visitor: String,
        /// Page URL
        #[arg(long, default_value = "/")]
        url: String,
        /// Signal as JSON, e.g. {"type":"scroll_depth","percent":60}
        #[arg(long, default_value = r#"{"type":"page_view"}"#)]
        signal: String,
        /// Tag the visitor already carries (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// localStorage entry as key=value (repeatable)
        #[arg(long = "storage")]
        storage: Vec<String>,
        /// Visitor has been here before
        #[arg(long)]
        returning: bool,
        /// Workflows directory (defaults to storage.workflows_dir)
        #[arg(long)]
        workflows: Option<PathBuf>,
        /// Record events in the configured database instead of memory
        #[arg(long)]
        persist: bool,
    },
    /// Funnel analysis for one workflow
    Funnel {
        workflow_id: String,
        /// Start date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        start: Option<String>,
        /// End date, inclusive (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        end: Option<String>,
    },
    /// Execution summary for one workflow
    Summary {
        workflow_id: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    /// Inspect or replay dead-lettered actions
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Validate and list workflow definitions
    Workflows {
        /// Workflows directory (defaults to storage.workflows_dir)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show current configuration
    Config,
    /// Run configuration and storage health checks
    Doctor,
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead-lettered actions, newest first
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Run a dead-lettered action again
    Replay { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("visitflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Init { force }) = &cli.command {
        return init_config(&cli.config, *force);
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        None | Some(Commands::Serve) => serve(config).await,
        Some(Commands::Simulate {
            site,
            visitor,
            url,
            signal,
            tags,
            storage,
            returning,
            workflows,
            persist,
        }) => {
            let signal: Signal = serde_json::from_str(&signal).context("Invalid signal JSON")?;
            let mut ctx = VisitorContext::new(site, visitor).with_url(url);
            ctx.tags = tags;
            ctx.local_storage = parse_storage(&storage)?;
            ctx.is_returning = returning;
            let workflows = workflows.as_deref();
            if persist {
                let store = Arc::new(SqliteStore::open(&config.database_path())?);
                simulate(Runtime::build(config, store)?, signal, ctx, workflows).await
            } else {
                let store = Arc::new(MemoryStore::new());
                simulate(Runtime::build(config, store)?, signal, ctx, workflows).await
            }
        }
        Some(Commands::Funnel {
            workflow_id,
            start,
            end,
        }) => {
            let range = TimeRange::parse(start.as_deref(), end.as_deref())?;
            let store = Arc::new(SqliteStore::open(&config.database_path())?);
            let report = FunnelAnalyzer::new(store, config.engine.top_paths)
                .analyze(&workflow_id, range)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(Commands::Summary {
            workflow_id,
            start,
            end,
        }) => {
            let range = TimeRange::parse(start.as_deref(), end.as_deref())?;
            let store = SqliteStore::open(&config.database_path())?;
            let events = store.query(&workflow_id, range).await?;
            println!("{}", serde_json::to_string_pretty(&summarize(&events))?);
            Ok(())
        }
        Some(Commands::Dlq { action }) => dlq(config, action).await,
        Some(Commands::Workflows { dir }) => {
            let store = Arc::new(MemoryStore::new());
            let runtime = Runtime::build(config, store)?;
            runtime.load_workflows(dir.as_deref()).await?;
            for graph in runtime.catalog.all() {
                let triggers: Vec<&str> = graph.triggers().map(|n| n.title.as_str()).collect();
                println!(
                    "{}  site={}  status={:?}  nodes={}  triggers=[{}]  {}",
                    graph.id(),
                    graph.site_id(),
                    graph.workflow().status,
                    graph.nodes().count(),
                    triggers.join(", "),
                    graph.name(),
                );
            }
            Ok(())
        }
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Doctor) => {
            println!("Visitflow Doctor");
            println!("================");
            doctor::run_doctor(&config);
            Ok(())
        }
        Some(Commands::Init { .. }) => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home()
        .map(|h| h.join(".visitflow").join("config.toml"))
        .filter(|p| p.exists());
    if let Some(home_config) = home_config {
        return Ok(AppConfig::load(&home_config)?);
    }
    warn!(path = %path.display(), "Config file not found, using defaults");
    Ok(AppConfig::default())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let text = toml::to_string_pretty(&AppConfig::default())?;
    std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn parse_storage(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .filter(|(k, _)| !k.is_empty())
                .with_context(|| format!("Expected key=value, got '{}'", pair))
        })
        .collect()
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::open(&config.database_path())?);
    let mut runtime = Runtime::build(config.clone(), store)?;
    runtime.load_workflows(None).await?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });

    if config.log.enabled {
        let logger = RunLogger::new(config.log_dir(), config.log.level);
        tokio::spawn(logger.run(runtime.bus.clone(), cancel.clone()));
    }
    let workers = runtime.spawn_workers(cancel.clone());

    let server = GatewayServer::new(config.gateway.clone(), runtime.app_state());
    let served = server.run(cancel.clone()).await;

    cancel.cancel();
    runtime.shutdown();
    if let Some(workers) = workers {
        workers.await.ok();
    }
    served
}

async fn simulate(
    mut runtime: Runtime,
    signal: Signal,
    ctx: VisitorContext,
    workflows: Option<&Path>,
) -> anyhow::Result<()> {
    signal.validate()?;
    let loaded = runtime.load_workflows(workflows).await?;
    if loaded == 0 {
        warn!("No workflows loaded");
    }

    let mut events = runtime.bus.subscribe();
    let cancel = CancellationToken::new();
    let workers = runtime.spawn_workers(cancel.clone());

    let handles = runtime.detector.detect(&signal, &ctx).await?;
    info!(trigger = signal.trigger_type(), runs = handles.len(), "Signal processed");
    for handle in handles {
        let run = handle.finished().await;
        info!(run_id = %run.id, workflow_id = %run.graph.id(), completed = run.is_completed(), "Run finished");
    }

    // Jobs from finished runs are already queued; the pool drains them on cancel.
    cancel.cancel();
    if let Some(workers) = workers {
        workers.await?;
    }
    runtime.shutdown();

    loop {
        match events.try_recv() {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "Event output lagged"),
            Err(_) => break,
        }
    }
    Ok(())
}

async fn dlq(config: AppConfig, action: DlqAction) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::open(&config.database_path())?);
    match action {
        DlqAction::List { limit } => {
            let entries = store.list(limit).await?;
            if entries.is_empty() {
                println!("Dead-letter queue is empty.");
            }
            for entry in entries {
                println!(
                    "{}  {}  {}/{}  attempts={}  {}  {}",
                    entry.id,
                    entry.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.payload.workflow_id,
                    entry.payload.node_id,
                    entry.attempts,
                    entry.action,
                    entry.reason,
                );
            }
        }
        DlqAction::Replay { id } => {
            let runtime = Runtime::build(config, store)?;
            runtime.load_workflows(None).await?;
            let outcome = runtime.worker.replay(&id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
