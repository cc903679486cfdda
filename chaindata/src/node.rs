//! Node-level wiring for one chain.
//!
//! [`Node::start`] opens the database, spawns the oracles in dependency
//! order, and bridges published events into the metrics registry.
//! [`Node::shutdown`] tears everything down in reverse order, draining each
//! oracle before the storage layer flushes.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::NodeConfig;
use crate::database::{Database, StorageError};
use crate::download::HeaderSource;
use crate::events::{Event, EventBus};
use crate::metrics::MetricsRegistry;
use crate::oracle::{BlockOracle, BlockValidator, FeeOracle, FilterOracle};
use crate::params;
use crate::types::{BlockHash, Chain, NO_TIP, Position};

/// A running data plane for one chain.
pub struct Node {
    pub db: Arc<Database>,
    pub events: EventBus,
    pub metrics: Arc<MetricsRegistry>,
    pub block_oracle: BlockOracle,
    pub filter_oracle: FilterOracle,
    pub fee_oracle: FeeOracle,
    chain: Chain,
    metrics_bridge: JoinHandle<()>,
}

impl Node {
    /// Opens storage and spawns every oracle for `chain`.
    ///
    /// `headers` resolves ancestor chains for the download pipelines and
    /// `validator` checks downloaded blocks; both are supplied by the
    /// header-sync layer above this crate.
    pub fn start(
        config: &NodeConfig,
        chain: Chain,
        headers: Arc<dyn HeaderSource + Send + Sync>,
        validator: Arc<dyn BlockValidator>,
    ) -> Result<Self, StorageError> {
        let db = Arc::new(Database::open(
            &config.storage.data_dir,
            config.storage.block_policy,
        )?);
        let events = EventBus::new();
        let metrics = Arc::new(
            MetricsRegistry::new().map_err(|_| StorageError::Corrupt("metrics registry"))?,
        );

        let filter_type = params::chain_params(chain).sync_filter_type;
        let filter_oracle = FilterOracle::start(
            db.clone(),
            chain,
            filter_type,
            headers.clone(),
            events.clone(),
            None,
        );
        let block_oracle = BlockOracle::start(
            db.clone(),
            chain,
            headers,
            validator,
            events.clone(),
            Position::new(NO_TIP, BlockHash::default()),
        );
        let fee_oracle = FeeOracle::start(chain, &config.fee, events.clone());

        let metrics_bridge = spawn_metrics_bridge(&events, metrics.clone());

        info!(
            "started {chain} data plane with block policy {:?}",
            db.block_policy()
        );
        Ok(Self {
            db,
            events,
            metrics,
            block_oracle,
            filter_oracle,
            fee_oracle,
            chain,
            metrics_bridge,
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Drains every oracle, then flushes the storage layer.
    pub async fn shutdown(mut self) -> Result<(), StorageError> {
        info!("shutting down {} data plane", self.chain);
        self.fee_oracle.shutdown().await;
        self.filter_oracle.shutdown().await;
        self.block_oracle.shutdown().await;
        self.metrics_bridge.abort();
        self.db.flush()
    }
}

fn spawn_metrics_bridge(events: &EventBus, metrics: Arc<MetricsRegistry>) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Event::NewFilter { .. }) => metrics.data_plane.filters_stored.inc(),
                Ok(Event::NewBlock { .. }) => metrics.data_plane.blocks_stored.inc(),
                Ok(Event::ReorgFilter { .. }) | Ok(Event::ReorgBlock { .. }) => {
                    metrics.data_plane.sync_reorgs.inc();
                }
                Ok(Event::FeeEstimateUpdated { sat_per_kvb, .. }) => {
                    metrics
                        .data_plane
                        .fee_estimate_sat_per_kvb
                        .set(sat_per_kvb as i64);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::AcceptAllValidator;
    use tempfile::TempDir;

    struct EmptyChain;

    impl HeaderSource for EmptyChain {
        fn ancestors(&self, from: &Position, _to: &Position) -> Vec<Position> {
            vec![*from]
        }
    }

    #[tokio::test]
    async fn start_and_shutdown_cleanly() {
        let tmp = TempDir::new().expect("tempdir");
        let config = NodeConfig {
            storage: crate::config::StorageConfig {
                data_dir: tmp.path().to_path_buf(),
                block_policy: None,
            },
            ..Default::default()
        };

        let node = Node::start(
            &config,
            Chain::UnitTest,
            Arc::new(EmptyChain),
            Arc::new(AcceptAllValidator),
        )
        .expect("start node");

        assert_eq!(node.chain(), Chain::UnitTest);
        assert_eq!(node.db.sync.tip(Chain::UnitTest), 0);
        assert_eq!(node.fee_oracle.estimated_fee(), None);

        node.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn fee_events_reach_metrics() {
        let tmp = TempDir::new().expect("tempdir");
        let config = NodeConfig {
            storage: crate::config::StorageConfig {
                data_dir: tmp.path().to_path_buf(),
                block_policy: None,
            },
            fee: crate::config::FeeConfig {
                validity: std::time::Duration::from_secs(1200),
                refresh: std::time::Duration::from_millis(10),
            },
            ..Default::default()
        };

        let node = Node::start(
            &config,
            Chain::UnitTest,
            Arc::new(EmptyChain),
            Arc::new(AcceptAllValidator),
        )
        .expect("start node");

        let sink = node.fee_oracle.sample_sink();
        assert!(sink.send(crate::oracle::FeeWork::UpdateEstimate(2000)).await);

        for _ in 0..100 {
            if node.metrics.data_plane.fee_estimate_sat_per_kvb.get() == 2000 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(node.metrics.data_plane.fee_estimate_sat_per_kvb.get(), 2000);

        node.shutdown().await.expect("clean shutdown");
    }
}
