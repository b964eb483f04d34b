//! edgesrv - Edge compute service
//!
//! Runs the edge rule engine against JSON-lines telemetry read from stdin.
//! Device writes and publishes go to a dry-run sink that logs them.

mod config;
mod ingest;
mod logging;
mod rule_file;
mod sink;

use crate::config::ServiceConfig;
use crate::rule_file::{validate_rules, RuleFile};
use crate::sink::DryRunSink;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use edge_calc::ExprEngine;
use edge_rules::EdgeComputeEngine;
use edge_store::{KvStore, SqliteKvStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "edgesrv - edge compute rule service")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the engine, reading telemetry from stdin
    Run {
        /// Configuration file (YAML, TOML or JSON)
        #[arg(short, long, value_name = "FILE", env = "EDGESRV_CONFIG")]
        config: Option<PathBuf>,

        /// Rule file, overrides `rules_file` from the config
        #[arg(short, long, value_name = "FILE")]
        rules: Option<PathBuf>,
    },
    /// Validate a rule file and exit
    CheckRules {
        /// Rule file to validate
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run { config, rules } => {
            let mut config = ServiceConfig::load(config.as_deref())?;
            if let Some(rules) = rules {
                config.rules_file = rules;
            }
            logging::init(&config.log)?;
            run_service(config).await
        },
        Commands::CheckRules { file } => check_rules(file).await,
    }
}

async fn run_service(config: ServiceConfig) -> Result<()> {
    info!("Starting edgesrv v{}", env!("CARGO_PKG_VERSION"));

    let store = SqliteKvStore::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
    let rule_file = Arc::new(RuleFile::new(&config.rules_file));
    let rules = rule_file.load().await?;
    info!(path = %rule_file.path().display(), count = rules.len(), "Rules loaded");
    for problem in validate_rules(&rules, &ExprEngine::new()?) {
        warn!("{}", problem);
    }

    let sink = Arc::new(DryRunSink::new());
    let engine = Arc::new(
        EdgeComputeEngine::builder()
            .config(config.engine.clone())
            .store(Arc::new(store.clone()) as Arc<dyn KvStore>)
            .device_writer(sink.clone())
            .publisher(sink.clone())
            .rule_persister(rule_file)
            .build()?,
    );
    engine.load_rules(rules);
    engine.start().await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
            }
            shutdown.cancel();
        });
    }

    let stats = ingest::ingest(
        tokio::io::stdin(),
        engine.as_ref(),
        |value| sink.observe(value),
        shutdown.clone(),
    )
    .await;
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        "Telemetry input finished"
    );

    // Input closed: keep running until Ctrl-C so actions and retries complete
    if !shutdown.is_cancelled() {
        info!("Waiting for Ctrl-C");
        shutdown.cancelled().await;
    }

    let metrics = engine.get_metrics();
    info!(
        triggered = metrics.rules_triggered,
        executed = metrics.rules_executed,
        dropped = metrics.rules_dropped,
        actions = metrics.actions_executed,
        actions_failed = metrics.actions_failed,
        "Engine metrics"
    );

    if let Err(e) = engine.stop().await {
        warn!(error = %e, "Engine stop reported an error");
    }
    store.close().await;
    info!("edgesrv stopped");
    Ok(())
}

async fn check_rules(file: PathBuf) -> Result<()> {
    let rules = RuleFile::new(&file).load().await?;
    let engine = ExprEngine::new()?;
    let problems = validate_rules(&rules, &engine);

    if problems.is_empty() {
        println!("{}: {} rules OK", file.display(), rules.len());
        return Ok(());
    }
    for problem in &problems {
        eprintln!("{}", problem);
    }
    bail!("{} problem(s) in {}", problems.len(), file.display())
}
