//! Fee estimation oracle.
//!
//! External fee sources push `(timestamp, rate)` samples into the oracle's
//! mailbox. On every tick the oracle drops samples older than the validity
//! window, publishes the arithmetic mean of what remains, and re-arms its
//! timer. `estimated_fee` reads the last published value without touching
//! the actor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::actor::{self, Actor, Handle, Mailbox};
use crate::config::FeeConfig;
use crate::events::{Event, EventBus};
use crate::types::Chain;

/// Messages accepted by the fee oracle.
#[derive(Clone, Debug)]
pub enum FeeWork {
    /// A new sample from some fee source, in satoshis per 1000 vbytes.
    UpdateEstimate(u64),
}

/// Rolling sample window. Pure state, separated from the actor so the
/// arithmetic is testable with explicit clocks.
struct FeeState {
    validity: Duration,
    samples: Vec<(Instant, u64)>,
}

impl FeeState {
    fn new(validity: Duration) -> Self {
        Self {
            validity,
            samples: Vec::new(),
        }
    }

    fn add_sample(&mut self, at: Instant, rate: u64) {
        self.samples.push((at, rate));
    }

    /// Trims expired samples and returns the mean of the remainder.
    fn estimate(&mut self, now: Instant) -> Option<u64> {
        let limit = now.checked_sub(self.validity);
        self.samples.retain(|(at, _)| match limit {
            Some(limit) => *at >= limit,
            None => true,
        });

        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|(_, rate)| rate).sum();
        Some(sum / self.samples.len() as u64)
    }
}

struct FeeOracleActor {
    chain: Chain,
    state: FeeState,
    output: Arc<RwLock<Option<u64>>>,
    events: EventBus,
}

impl Actor for FeeOracleActor {
    type Work = FeeWork;

    fn pipeline(&mut self, work: FeeWork) {
        match work {
            FeeWork::UpdateEstimate(rate) => {
                trace!("fee sample for {}: {rate} sat/kvB", self.chain);
                self.state.add_sample(Instant::now(), rate);
            }
        }
    }

    fn state_machine(&mut self) -> bool {
        let estimate = self.state.estimate(Instant::now());
        let changed = {
            let mut output = self.output.write();
            let changed = *output != estimate;
            *output = estimate;
            changed
        };

        if changed {
            match estimate {
                Some(rate) => {
                    debug!("updated {} fee estimate to {rate} sat/kvB", self.chain);
                    self.events.publish(Event::FeeEstimateUpdated {
                        chain: self.chain,
                        sat_per_kvb: rate,
                    });
                }
                None => debug!("fee estimate for {} not available", self.chain),
            }
        }
        false
    }

    fn shut_down(&mut self) {
        self.samples_clear();
    }
}

impl FeeOracleActor {
    fn samples_clear(&mut self) {
        self.state.samples.clear();
        *self.output.write() = None;
    }
}

/// Owner handle to a running fee oracle.
pub struct FeeOracle {
    handle: Handle<FeeWork>,
    output: Arc<RwLock<Option<u64>>>,
}

impl FeeOracle {
    /// Spawns the oracle. The heartbeat doubles as the re-estimation
    /// timer.
    pub fn start(chain: Chain, config: &FeeConfig, events: EventBus) -> Self {
        let output = Arc::new(RwLock::new(None));
        let actor = FeeOracleActor {
            chain,
            state: FeeState::new(config.validity),
            output: output.clone(),
            events,
        };
        let handle = actor::spawn(actor, config.refresh);
        Self { handle, output }
    }

    /// Mailbox for fee sources to push samples into.
    pub fn sample_sink(&self) -> Mailbox<FeeWork> {
        self.handle.mailbox()
    }

    /// Last published estimate, or `None` when no valid samples exist.
    pub fn estimated_fee(&self) -> Option<u64> {
        *self.output.read()
    }

    /// Cancels the timer and drains the mailbox.
    pub async fn shutdown(&mut self) {
        self.handle.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn estimate_is_mean_of_window() {
        let mut state = FeeState::new(20 * MINUTE);
        let base = Instant::now();
        let now = base + 25 * MINUTE;

        state.add_sample(base, 100); // 25 minutes old: expired
        state.add_sample(base + 15 * MINUTE, 200); // 10 minutes old
        state.add_sample(base + 20 * MINUTE, 300); // 5 minutes old

        assert_eq!(state.estimate(now), Some(250));
        // The expired sample is gone for good.
        assert_eq!(state.samples.len(), 2);
    }

    #[test]
    fn empty_window_has_no_estimate() {
        let mut state = FeeState::new(20 * MINUTE);
        let base = Instant::now();
        assert_eq!(state.estimate(base), None);

        state.add_sample(base, 500);
        assert_eq!(state.estimate(base + 21 * MINUTE), None);
    }

    #[test]
    fn single_sample_is_its_own_mean() {
        let mut state = FeeState::new(20 * MINUTE);
        let base = Instant::now();
        state.add_sample(base, 123);
        assert_eq!(state.estimate(base + MINUTE), Some(123));
    }

    #[tokio::test]
    async fn oracle_publishes_mean_of_samples() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let config = FeeConfig {
            validity: 20 * MINUTE,
            refresh: Duration::from_millis(10),
        };
        let mut oracle = FeeOracle::start(Chain::UnitTest, &config, events);

        assert_eq!(oracle.estimated_fee(), None);

        let sink = oracle.sample_sink();
        assert!(sink.send(FeeWork::UpdateEstimate(100)).await);
        assert!(sink.send(FeeWork::UpdateEstimate(300)).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(oracle.estimated_fee(), Some(200));

        let event = rx.recv().await.expect("estimate event");
        assert_eq!(
            event,
            Event::FeeEstimateUpdated {
                chain: Chain::UnitTest,
                sat_per_kvb: 100,
            }
        );

        oracle.shutdown().await;
        assert_eq!(oracle.estimated_fee(), None);
    }
}
