//! Internal event bus.
//!
//! Tip advancement, reorgs, and fee estimate changes publish here; wallets
//! and user interfaces subscribe to decide when to rescan. Events for a
//! given chain and kind are published in order; a slow subscriber that
//! overruns the channel capacity observes a lagged error, not reordering.

use tokio::sync::broadcast;

use crate::types::{Chain, FilterType, Position};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    NewFilter {
        chain: Chain,
        filter_type: FilterType,
        position: Position,
    },
    NewBlock {
        chain: Chain,
        position: Position,
    },
    ReorgFilter {
        chain: Chain,
        filter_type: FilterType,
        /// Common ancestor the chain rewound to.
        ancestor: Position,
    },
    ReorgBlock {
        chain: Chain,
        ancestor: Position,
    },
    FeeEstimateUpdated {
        chain: Chain,
        /// Satoshis per 1000 virtual bytes.
        sat_per_kvb: u64,
    },
}

/// Cloneable publish/subscribe handle.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Returns whether at least one subscriber
    /// received it.
    pub fn publish(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
