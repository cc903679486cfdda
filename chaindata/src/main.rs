// src/main.rs
//
// Minimal demo node that wires up the chaindata library:
//
// - storage stack under ./data/blockchain
// - block, filter, and fee oracles for the regtest chain
// - Prometheus metrics exporter on /metrics
// - event logger showing tip and fee updates until ctrl-c.

use std::sync::Arc;

use chaindata::{
    AcceptAllValidator, Chain, Event, HeaderSource, Node, NodeConfig, Position,
    run_prometheus_http_server,
};
use tokio::signal;

/// Stand-in ancestor resolver: a real deployment plugs in its header-sync
/// oracle here.
struct StaticChain;

impl HeaderSource for StaticChain {
    fn ancestors(&self, from: &Position, _to: &Position) -> Vec<Position> {
        vec![*from]
    }
}

#[tokio::main]
async fn main() {
    // Basic tracing setup.
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chaindata=info".to_string()),
        )
        .init();

    if let Err(err) = run().await {
        eprintln!("fatal error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let cfg = NodeConfig::default();

    let node = Node::start(
        &cfg,
        Chain::UnitTest,
        Arc::new(StaticChain),
        Arc::new(AcceptAllValidator),
    )
    .map_err(|e| format!("failed to start node: {e}"))?;

    // ---------------------------
    // Metrics exporter
    // ---------------------------

    if cfg.metrics.enabled {
        let metrics = node.metrics.clone();
        let addr = cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics, addr).await {
                tracing::error!("metrics HTTP server error: {e}");
            }
        });
        tracing::info!("metrics exporter listening on http://{addr}/metrics");
    }

    // ---------------------------
    // Event logger
    // ---------------------------

    let mut events = node.events.subscribe();
    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::NewFilter {
                    chain, position, ..
                } => tracing::info!("{chain} cfilter chain updated to height {}", position.height),
                Event::NewBlock { chain, position } => {
                    tracing::info!("{chain} block stored at height {}", position.height)
                }
                Event::ReorgFilter {
                    chain, ancestor, ..
                } => tracing::info!("{chain} cfilter chain reorged to height {}", ancestor.height),
                Event::ReorgBlock { chain, ancestor } => {
                    tracing::info!("{chain} block chain reorged to height {}", ancestor.height)
                }
                Event::FeeEstimateUpdated { chain, sat_per_kvb } => {
                    tracing::info!("{chain} fee estimate now {sat_per_kvb} sat/kvB")
                }
            }
        }
    });

    tracing::info!(
        "node running: chain={}, sync tip {}",
        node.chain(),
        node.db.sync.tip(node.chain())
    );

    // ---------------------------
    // Run until ctrl-c
    // ---------------------------

    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");

    logger.abort();
    node.shutdown()
        .await
        .map_err(|e| format!("shutdown error: {e}"))?;

    Ok(())
}
