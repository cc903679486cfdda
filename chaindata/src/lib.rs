//! Persistent data plane for compact-filter light nodes.
//!
//! This crate provides the storage and coordination layer a light node
//! builds on:
//!
//! - strongly-typed domain types (`types`),
//! - a transactional key/value substrate (`kv`),
//! - append-only memory-mapped bulk storage (`bulk`),
//! - typed sub-stores assembled by a shared container (`database`),
//! - a generic download pipeline (`download`),
//! - block, filter, and fee oracles (`oracle`),
//! - a single-consumer actor substrate (`actor`),
//! - an internal event bus (`events`),
//! - Prometheus-based metrics (`metrics`),
//! - and a top-level node coordinator (`node`).
//!
//! Higher-level binaries compose these pieces with a header-sync layer and
//! peer transport to build wallets and chain services.

pub mod actor;
pub mod bulk;
pub mod config;
pub mod crypto;
pub mod database;
pub mod download;
pub mod events;
pub mod kv;
pub mod metrics;
pub mod node;
pub mod oracle;
pub mod params;
pub mod types;
pub mod util;

// Re-export top-level configuration types.
pub use config::{FeeConfig, MetricsConfig, NodeConfig, StorageConfig};

// Re-export the storage stack.
pub use bulk::{Bulk, BulkError, BulkGuard, IndexEntry, ReadView, SEGMENT_SIZE, WriteView};
pub use database::{
    BlockFilter, BlockHeaders, BlockReader, BlockWriter, Blocks, CfheaderParams, CfilterParams,
    ConfigKey, ConfigStore, Database, Peers, StorageError, SyncPacket, SyncStore, Wallet,
};
pub use kv::{Dir, Kv, KvError, ReadTxn, Table, Txn};

// Re-export pipeline and oracle interfaces.
pub use download::{Batch, DownloadManager, DownloadSink, HeaderSource, batch_size};
pub use oracle::{
    AcceptAllValidator, BlockFuture, BlockOracle, BlockValidator, BlockWork, FeeOracle, FeeWork,
    FilterOracle, FilterWork,
};

// Re-export the messaging substrate.
pub use actor::{Actor, Gate, Handle, Mailbox};
pub use events::{Event, EventBus};

// Re-export metrics registry and exporter.
pub use metrics::{DataPlaneMetrics, MetricsRegistry, run_prometheus_http_server};

// Re-export the node coordinator.
pub use node::Node;

// Re-export domain types at the crate root for convenience.
pub use types::*;
