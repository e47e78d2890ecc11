//! Cluster State Registry Simulator
//!
//! Runs a small in-process cluster to exercise the registry end to end:
//!
//! ```text
//!   node-1 ─┐
//!   node-2 ─┼── InMemoryCluster ── late joiner ── departure of node-1
//!   node-N ─┘
//! ```
//!
//! Each founding node asserts a few private entries plus one shared entry.
//! A late joiner then performs the join handshake, the first node leaves,
//! and the remaining views are checked for convergence.

use anyhow::{bail, Context};
use clap::Parser;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_state_registry::{
    InMemoryCluster, NodeId, RegistryConfig, RegistryEvent, StateRegistry,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cluster State Registry - in-process cluster simulation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of founding nodes
    #[arg(long, env = "REGISTRY_NODES", default_value = "3")]
    nodes: usize,

    /// Private entries asserted by each founding node
    #[arg(long, env = "REGISTRY_ENTRIES", default_value = "4")]
    entries_per_node: usize,

    /// Registry config file (YAML)
    #[arg(long, env = "REGISTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured topic
    #[arg(long, env = "REGISTRY_TOPIC")]
    topic: Option<String>,

    /// How long to wait for the cluster to converge, in milliseconds
    #[arg(long, env = "CONVERGENCE_TIMEOUT_MS", default_value = "5000")]
    convergence_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print registry counters in Prometheus text format on exit
    #[arg(long, env = "PRINT_METRICS")]
    print_metrics: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    if args.nodes == 0 {
        bail!("--nodes must be at least 1");
    }

    let mut config = match &args.config {
        Some(path) => RegistryConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RegistryConfig::default(),
    };
    if let Some(topic) = &args.topic {
        config.topic = topic.clone();
    }
    config.validate().context("invalid registry configuration")?;

    info!("Starting Cluster State Registry simulation");
    info!("  Version: {}", cluster_state_registry::VERSION);
    info!("  Topic: {}", config.topic);
    info!("  Founding nodes: {}", args.nodes);
    info!("  Entries per node: {}", args.entries_per_node);

    let cluster = InMemoryCluster::new();
    let convergence_timeout = Duration::from_millis(args.convergence_timeout_ms);

    // Founding members
    let mut registries = Vec::with_capacity(args.nodes + 1);
    for i in 1..=args.nodes {
        let transport = cluster.join(format!("node-{i}"));
        let registry = StateRegistry::start(config.clone(), transport)
            .with_context(|| format!("failed to start node-{i}"))?;
        registries.push(Arc::new(registry));
    }
    let readiness = join_all(registries.iter().map(|registry| registry.ready())).await;
    for result in readiness {
        result.context("registry shut down before it became ready")?;
    }

    let mut events = registries[0].subscribe();
    for registry in &registries {
        let node = registry.local_node().clone();
        for n in 0..args.entries_per_node {
            registry.add(&format!("{node}/entry-{n}"));
        }
        registry.add("shared");
    }
    wait_for_convergence(&registries, convergence_timeout).await?;
    info!(entries = registries[0].get_all().len(), "Founding members converged");

    // Late joiner
    let late = Arc::new(
        StateRegistry::start(config.clone(), cluster.join("late-joiner"))
            .context("failed to start late joiner")?,
    );
    tokio::time::timeout(convergence_timeout, late.ready())
        .await
        .context("late joiner never became ready")??;
    info!(status = ?late.status(), "Late joiner ready");
    registries.push(late);
    wait_for_convergence(&registries, convergence_timeout).await?;

    // Departure
    let departing = registries.remove(0);
    let departed = departing.local_node().clone();
    departing.shutdown();
    cluster.leave(&departed);
    drop(departing);
    wait_for_departure(&registries, &departed, convergence_timeout).await?;
    wait_for_convergence(&registries, convergence_timeout).await?;
    info!(node = %departed, "Departure cleaned up on every remaining node");

    while let Ok(event) = events.try_recv() {
        match event {
            RegistryEvent::EntryAdded { name } => info!(entry = %name, "entry-added"),
            RegistryEvent::EntryRemoved { name } => info!(entry = %name, "entry-removed"),
        }
    }

    for registry in &registries {
        let status = serde_json::to_string(&registry.status())?;
        println!("{status}");
    }

    if args.print_metrics {
        print!("{}", render_metrics(&registries)?);
    }

    for registry in &registries {
        registry.shutdown();
    }
    info!("Simulation complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Convergence Checks
// =============================================================================

async fn wait_for_convergence(
    registries: &[Arc<StateRegistry>],
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let reference = registries[0].get_all_map();
        if registries[1..]
            .iter()
            .all(|registry| registry.get_all_map() == reference)
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Registries did not converge in time");
            bail!("registries did not converge within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_departure(
    registries: &[Arc<StateRegistry>],
    departed: &NodeId,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let clean = registries.iter().all(|registry| {
            registry
                .get_all_map()
                .values()
                .all(|owners| !owners.contains(departed))
        });
        if clean {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("entries owned by {departed} were not cleaned up within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Metrics Rendering
// =============================================================================

fn render_metrics(registries: &[Arc<StateRegistry>]) -> anyhow::Result<String> {
    use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

    let registry = Registry::new();
    let counters = IntGaugeVec::new(
        Opts::new("state_registry_counter", "State registry counters by node"),
        &["node", "counter"],
    )?;
    let entries = IntGaugeVec::new(
        Opts::new("state_registry_entries", "Entries present in the node's view"),
        &["node"],
    )?;
    registry.register(Box::new(counters.clone()))?;
    registry.register(Box::new(entries.clone()))?;

    for state in registries {
        let node = state.local_node().as_str();
        for (name, value) in state.metrics().counters() {
            counters
                .with_label_values(&[node, name])
                .set(i64::try_from(value).unwrap_or(i64::MAX));
        }
        entries
            .with_label_values(&[node])
            .set(i64::try_from(state.get_all().len()).unwrap_or(i64::MAX));
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
