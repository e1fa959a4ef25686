//! chaosd - chaos engine harness.
//!
//! Runs the chaos scheduler against an in-memory simulated cluster until the
//! run budget is spent or the process receives Ctrl+C.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chaos_common::{ChaosParameters, EngineConfig, TelemetryId};
use chaosd::scheduler::{ChaosScheduler, SchedulerDeps};
use chaosd::sim::SimulatedCluster;
use chaosd::state_store::{FileStateStore, MemoryStateStore, StateStore};
use chaosd::{ClusterClients, EventStream};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chaosd")]
#[command(author, version, about = "Chaos engine - scheduled, safety-gated fault injection")]
struct Cli {
    /// Chaos parameters file (TOML)
    #[arg(short, long)]
    parameters: Option<PathBuf>,

    /// Parameter override, e.g. ClusterHealthPolicy.MaxPercentUnhealthyNodes=20
    #[arg(long = "set", value_name = "NAME=VALUE")]
    overrides: Vec<String>,

    /// Fault selection seed
    #[arg(long)]
    seed: Option<u64>,

    /// Run duration, e.g. "10m" or "1h 30m"
    #[arg(long, value_parser = humantime::parse_duration)]
    time_to_run: Option<Duration>,

    /// Stop after this many iterations
    #[arg(long)]
    max_iterations: Option<u64>,

    /// Persist run state to this file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Persist the event stream to this JSONL file
    #[arg(long)]
    events_file: Option<PathBuf>,

    /// Simulated cluster: node count
    #[arg(long, default_value = "5")]
    nodes: usize,

    /// Simulated cluster: stateful partition count
    #[arg(long, default_value = "4")]
    partitions: usize,

    /// Simulated cluster: replicas per partition
    #[arg(long, default_value = "3")]
    replicas: usize,

    /// Simulated cluster: how long faulted entities take to recover
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    recovery: Duration,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli);

    info!("Starting chaos engine");

    let params = load_parameters(&cli)?;
    let config = EngineConfig::from_env().map_err(|errors| {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        anyhow::anyhow!("invalid engine configuration: {joined}")
    })?;

    let cluster = Arc::new(
        SimulatedCluster::builder()
            .nodes(cli.nodes)
            .stateful_partitions(cli.partitions, cli.replicas)
            .stateless_partitions(1, cli.nodes.min(3))
            .system_partitions(1, cli.nodes.min(3))
            .recovery(Some(cli.recovery))
            .build(),
    );

    let store: Arc<dyn StateStore> = match &cli.state_file {
        Some(path) => Arc::new(FileStateStore::new(path.clone())),
        None => Arc::new(MemoryStateStore::new()),
    };
    let events = match &cli.events_file {
        Some(path) => EventStream::with_persistence(config.max_events, path.clone())
            .with_context(|| format!("failed to open event log {}", path.display()))?,
        None => EventStream::new(config.max_events),
    };

    let deps = SchedulerDeps::new(ClusterClients::from_shared(cluster.clone()))
        .with_store(store)
        .with_events(events);
    let scheduler = ChaosScheduler::open(config, deps).await?;

    let mut updates = scheduler.events().subscribe();
    let echo = tokio::spawn(async move {
        while let Ok(record) = updates.recv().await {
            info!(
                sequence = record.sequence,
                kind = %record.event.kind(),
                reason = record.event.reason().unwrap_or(""),
                "Chaos event"
            );
        }
    });

    scheduler.start(params).await?;

    tokio::select! {
        _ = scheduler.wait_until_stopped() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Interrupt received, stopping chaos run");
            scheduler.stop().await?;
        }
    }
    echo.abort();

    let state = scheduler.status();
    let telemetry = scheduler.telemetry();
    info!(
        run_id = %state.run_id,
        status = %state.status,
        iterations = state.iteration,
        events = scheduler.events().len(),
        faults_executed = cluster.executed_actions().len(),
        telemetry = telemetry.records().len(),
        execute_failures = telemetry.count(TelemetryId::ExecuteFaultActionFailed),
        "Chaos run finished"
    );
    if let Some(last) = scheduler.events().last() {
        info!("Final event: {:?}", last.event);
    }

    Ok(())
}

fn load_parameters(cli: &Cli) -> Result<ChaosParameters> {
    let mut params = match &cli.parameters {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<ChaosParameters>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => ChaosParameters::default(),
    };

    params.apply_assignments(cli.overrides.iter().map(String::as_str))?;
    if let Some(seed) = cli.seed {
        params.seed = Some(seed);
    }
    if let Some(time_to_run) = cli.time_to_run {
        params.time_to_run = time_to_run;
    }
    if cli.max_iterations.is_some() {
        params.max_iterations = cli.max_iterations;
    }
    Ok(params)
}

fn init_logging(cli: &Cli) -> Option<WorkerGuard> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("chaosd={default_level},chaos_common={default_level}"))
    });

    let stdout_layer = if cli.json_logs {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chaosd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}
