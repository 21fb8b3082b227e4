//! `orchestrator` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    — start the API server (and a queue worker unless disabled).
//! - `worker`   — start a queue worker.
//! - `migrate`  — run pending database migrations.
//! - `validate` — compile a workflow definition file.
//! - `recover`  — reset orphaned steps and schedule their runs.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use db::DbPool;
use engine::{CompensationScope, Orchestrator, OrchestratorConfig, SignalMatching, Worker};
use nodes::HandlerRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orchestrator", about = "Durable workflow orchestrator with saga compensation", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// SQLite database URL.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://orchestrator.db", global = true)]
    database_url: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Seconds a step claim stays exclusive.
    #[arg(long, env = "ORCH_LOCK_TTL_SECS", default_value_t = 30, global = true)]
    lock_ttl_secs: u64,

    /// Milliseconds between empty queue polls.
    #[arg(long, env = "ORCH_POLL_INTERVAL_MS", default_value_t = 500, global = true)]
    poll_interval_ms: u64,

    /// `fallback_to_first` or `strict`.
    #[arg(long, env = "ORCH_SIGNAL_MATCHING", default_value = "fallback_to_first", global = true)]
    signal_matching: SignalMatching,

    /// `failed_step` or `unwind`.
    #[arg(long, env = "ORCH_COMPENSATION_SCOPE", default_value = "failed_step", global = true)]
    compensation_scope: CompensationScope,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
        /// Do not run a queue worker in this process.
        #[arg(long)]
        no_worker: bool,
    },
    /// Start a background worker that processes queued jobs.
    Worker,
    /// Run pending database migrations.
    Migrate,
    /// Compile a workflow definition file and print its execution order.
    Validate {
        /// Path to the YAML definition.
        path: PathBuf,
    },
    /// Reset steps left running by a crashed process.
    Recover,
}

impl GlobalArgs {
    fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            signal_matching: self.signal_matching,
            compensation_scope: self.compensation_scope,
            ..OrchestratorConfig::default()
        }
    }

    async fn orchestrator(&self) -> Result<Orchestrator> {
        let pool = DbPool::connect(&self.database_url, 8)
            .await
            .with_context(|| format!("failed to open database {}", self.database_url))?;
        Ok(Orchestrator::new(pool, HandlerRegistry::with_builtins(), self.config()))
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Shutdown requested");
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.log_format);

    match cli.command {
        Command::Serve { bind, no_worker } => {
            let orchestrator = cli.global.orchestrator().await?;
            let report = orchestrator.recover().await?;
            info!(
                steps_reset = report.steps_reset,
                jobs_requeued = report.jobs_requeued,
                runs = report.runs.len(),
                "Startup recovery done"
            );

            let shutdown = shutdown_token();
            let worker = (!no_worker).then(|| {
                let worker = Worker::new(orchestrator.clone());
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            });

            info!("Starting API server on {bind}");
            let state = api::AppState { orchestrator };
            api::serve(&bind, state, shutdown.clone().cancelled_owned())
                .await
                .context("API server failed")?;

            shutdown.cancel();
            if let Some(handle) = worker {
                handle.await.context("worker task panicked")??;
            }
        }
        Command::Worker => {
            let orchestrator = cli.global.orchestrator().await?;
            let report = orchestrator.recover().await?;
            info!(
                steps_reset = report.steps_reset,
                jobs_requeued = report.jobs_requeued,
                runs = report.runs.len(),
                "Startup recovery done"
            );
            Worker::new(orchestrator).run(shutdown_token()).await?;
        }
        Command::Migrate => {
            info!("Running migrations against {}", cli.global.database_url);
            let pool = DbPool::connect(&cli.global.database_url, 1)
                .await
                .context("migration failed")?;
            pool.close().await;
            info!("Migrations applied successfully");
        }
        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read file {}", path.display()))?;

            match engine::compile(&content) {
                Ok(dag) => {
                    println!("Workflow is valid. Execution order: {:?}", dag.topological_order());
                }
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Recover => {
            let orchestrator = cli.global.orchestrator().await?;
            let report = orchestrator.recover().await?;
            println!(
                "Reset {} orphaned step(s); requeued {} job(s); scheduled {} run(s)",
                report.steps_reset,
                report.jobs_requeued,
                report.runs.len()
            );
        }
    }

    Ok(())
}
