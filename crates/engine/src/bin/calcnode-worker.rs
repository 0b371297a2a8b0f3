//! calcnode-worker — remote calculation node process.
//!
//! Connects a DEALER socket to the dispatcher's ROUTER endpoint, announces
//! its node count with `Ready`, and executes the jobs it is sent on a pool of
//! in-process calculation nodes.
//!
//! # Usage
//!
//! ```bash
//! # Defaults from config/calcnode.toml, one node per core
//! calcnode-worker
//!
//! # Explicit endpoint and node count
//! calcnode-worker --endpoint tcp://10.0.0.5:5590 --nodes 8
//! ```

use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use calcnode_core::{
    ComputedValue, InMemoryFunctionBlacklist, InMemoryIdentifierMap,
    InMemoryViewComputationCacheSource,
};
use calcnode_engine::node::from_fn;
use calcnode_engine::{
    CalculationNode, EngineConfig, ExecutionWatchdog, FunctionError, FunctionRepository,
    InMemoryFunctionRepository, LocalNodeJobInvoker, RemoteNodeClient, SimpleCalculationNode,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Remote calculation node serving jobs from a dispatcher.
#[derive(Parser, Debug)]
#[command(name = "calcnode-worker", version, about)]
struct Cli {
    /// Path to calcnode.toml config file.
    #[arg(long, env = "CALCNODE_CONFIG", default_value = "config/calcnode.toml")]
    config: String,

    /// Dispatcher endpoint, overriding `remote.endpoint`.
    #[arg(long)]
    endpoint: Option<String>,

    /// Number of calculation nodes, overriding `local.node_count`.
    #[arg(long)]
    nodes: Option<usize>,
}

// ── Built-in functions ──────────────────────────────────────────────

/// Functions every worker can run without a plugin.
///
/// - `Constant`: writes `parameters.value` to every requested output
/// - `Sum` / `Product`: fold the numeric inputs
fn builtin_functions() -> InMemoryFunctionRepository {
    InMemoryFunctionRepository::new()
        .with_function(
            "Constant",
            from_fn(|ctx, _| {
                let value = ctx.parameters.get("value").cloned().ok_or_else(|| {
                    FunctionError::new("IllegalArgumentException", "missing parameter 'value'")
                })?;
                Ok(ctx
                    .desired_outputs
                    .iter()
                    .map(|spec| ComputedValue::new(spec.clone(), value.clone()))
                    .collect())
            }),
        )
        .with_function("Sum", from_fn(|ctx, inputs| fold(ctx.desired_outputs, inputs, 0.0, |a, b| a + b)))
        .with_function("Product", from_fn(|ctx, inputs| fold(ctx.desired_outputs, inputs, 1.0, |a, b| a * b)))
}

fn fold(
    outputs: &std::collections::BTreeSet<calcnode_core::ValueSpecification>,
    inputs: &calcnode_engine::FunctionInputs,
    init: f64,
    op: fn(f64, f64) -> f64,
) -> Result<Vec<ComputedValue>, FunctionError> {
    let mut acc = init;
    for (spec, value) in &inputs.values {
        let n = value.as_f64().ok_or_else(|| {
            FunctionError::new(
                "IllegalArgumentException",
                format!("input {} is not a number", spec.value_name),
            )
        })?;
        acc = op(acc, n);
    }
    Ok(outputs
        .iter()
        .map(|spec| ComputedValue::new(spec.clone(), Value::from(acc)))
        .collect())
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match EngineConfig::from_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config, "loaded calcnode config");
            cfg
        }
        Err(e) => {
            warn!(error = %e, path = %cli.config, "failed to load config, using defaults");
            EngineConfig::default()
        }
    };
    if let Some(endpoint) = cli.endpoint {
        config.remote.endpoint = endpoint;
    }
    if let Some(nodes) = cli.nodes {
        config.local.node_count = nodes;
    }
    config.validate()?;

    let shutdown = CancellationToken::new();
    let watchdog = Arc::new(ExecutionWatchdog::new(config.watchdog.max_job_item_execution_time()));
    let checker = watchdog.spawn_checker(config.watchdog.check_interval(), shutdown.clone());

    let cache = Arc::new(InMemoryViewComputationCacheSource::new());
    let functions: Arc<dyn FunctionRepository> = Arc::new(builtin_functions());
    let blacklist = Arc::new(InMemoryFunctionBlacklist::new());
    let invoker = LocalNodeJobInvoker::from_config(&config.local, |node_id| {
        Arc::new(
            SimpleCalculationNode::new(node_id, cache.clone(), functions.clone())
                .with_blacklist(blacklist.clone(), blacklist.clone())
                .with_watchdog(watchdog.clone()),
        ) as Arc<dyn CalculationNode>
    })?;

    let transport = config.remote.transport()?;
    let connection = calcnode_wire::zmq::connect(&transport, Arc::new(InMemoryIdentifierMap::new())).await?;
    let client = RemoteNodeClient::new(Arc::new(invoker));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    info!(endpoint = %transport, nodes = config.local.resolved_node_count(), "calcnode-worker starting");
    client.run(connection, shutdown.clone()).await?;

    shutdown.cancel();
    checker.await?;
    info!("calcnode-worker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
