//! Prometheus-backed metrics and HTTP exporter.
//!
//! This module defines a [`MetricsRegistry`] that owns a Prometheus
//! registry and a set of strongly-typed data-plane metrics, and an async
//! HTTP exporter that serves `/metrics` using `hyper`.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header, server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use prometheus::{self, Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Data-plane Prometheus metrics.
///
/// These are registered into a [`Registry`] and updated from the node
/// coordinator and oracles.
#[derive(Clone)]
pub struct DataPlaneMetrics {
    /// Total payload bytes appended to the bulk stores.
    pub bulk_bytes_written: IntCounter,
    /// Total sync packets persisted.
    pub sync_packets_stored: IntCounter,
    /// Total sync-stream reorgs (explicit and checksum-triggered).
    pub sync_reorgs: IntCounter,
    /// Blocks persisted by the block oracle.
    pub blocks_stored: IntCounter,
    /// Filters persisted by the filter oracles.
    pub filters_stored: IntCounter,
    /// Depth of the busiest download queue.
    pub download_queue_depth: IntGauge,
    /// Last published fee estimate in sat/kvB (0 when unavailable).
    pub fee_estimate_sat_per_kvb: IntGauge,
}

impl DataPlaneMetrics {
    /// Registers data-plane metrics into the given `Registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let bulk_bytes_written = IntCounter::with_opts(Opts::new(
            "storage_bulk_bytes_written",
            "Total payload bytes appended to the mapped bulk stores",
        ))?;
        registry.register(Box::new(bulk_bytes_written.clone()))?;

        let sync_packets_stored = IntCounter::with_opts(Opts::new(
            "storage_sync_packets_stored",
            "Total sync packets persisted across all chains",
        ))?;
        registry.register(Box::new(sync_packets_stored.clone()))?;

        let sync_reorgs = IntCounter::with_opts(Opts::new(
            "storage_sync_reorgs",
            "Total sync-stream truncations (explicit and checksum-triggered)",
        ))?;
        registry.register(Box::new(sync_reorgs.clone()))?;

        let blocks_stored = IntCounter::with_opts(Opts::new(
            "oracle_blocks_stored",
            "Blocks persisted by the block oracle",
        ))?;
        registry.register(Box::new(blocks_stored.clone()))?;

        let filters_stored = IntCounter::with_opts(Opts::new(
            "oracle_filters_stored",
            "Compact filters persisted by the filter oracles",
        ))?;
        registry.register(Box::new(filters_stored.clone()))?;

        let download_queue_depth = IntGauge::with_opts(Opts::new(
            "oracle_download_queue_depth",
            "Depth of the busiest download queue",
        ))?;
        registry.register(Box::new(download_queue_depth.clone()))?;

        let fee_estimate_sat_per_kvb = IntGauge::with_opts(Opts::new(
            "oracle_fee_estimate_sat_per_kvb",
            "Last published fee estimate in satoshis per 1000 vbytes",
        ))?;
        registry.register(Box::new(fee_estimate_sat_per_kvb.clone()))?;

        Ok(Self {
            bulk_bytes_written,
            sync_packets_stored,
            sync_reorgs,
            blocks_stored,
            filters_stored,
            download_queue_depth,
            fee_estimate_sat_per_kvb,
        })
    }
}

/// Wrapper around a Prometheus registry and the data-plane metrics.
///
/// This is the main handle you pass around in the node. It can be wrapped
/// in an [`Arc`] and shared across threads/tasks.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub data_plane: DataPlaneMetrics,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with a fresh underlying `Registry`
    /// and registers the data-plane metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("chaindata".to_string()), None)?;
        let data_plane = DataPlaneMetrics::register(&registry)?;
        Ok(Self {
            registry,
            data_plane,
        })
    }

    /// Encodes all metrics in this registry into the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("failed to encode Prometheus metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Runs an HTTP server that exposes Prometheus metrics.
///
/// The server listens on `addr` and serves `GET /metrics` with the
/// Prometheus text exposition format. All other paths return 404.
///
/// This function is `async` and is intended to be spawned onto a Tokio
/// runtime.
pub async fn run_prometheus_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let metrics = metrics.clone();
                handle_request(req, metrics)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                tracing::error!("prometheus HTTP server error: {err}");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = metrics.gather_text();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap()),
    }
}
