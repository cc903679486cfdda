//! Generic download pipeline.
//!
//! A [`DownloadManager`] tracks the highest fully processed position of
//! some payload kind (filters, blocks), queues the positions still
//! missing, hands slices of the queue to external workers as batches, and
//! integrates completed downloads strictly in height order. Each payload
//! is verified against the expectations of its [`DownloadSink`]; failures
//! send the task back to the pending pool for redownload. Tip updates are
//! therefore monotone: an observer only sees the position move backward
//! through an explicit reorg carried by [`DownloadManager::update_position`].

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::types::Position;

/// Heartbeats a task may stay in flight before it is handed out again.
const STALL_TICKS: u32 = 250;

/// Resolves ancestor chains between two positions.
///
/// The returned chain starts at the highest common ancestor of `from` and
/// `to` (equal to `from` when the two are on the same branch) and ends at
/// `to`, in ascending height order.
pub trait HeaderSource {
    fn ancestors(&self, from: &Position, to: &Position) -> Vec<Position>;
}

/// Consumer side of the pipeline: validation, anchor chaining, and
/// persistence for one payload kind.
pub trait DownloadSink {
    type Payload;
    type Anchor: Clone;

    /// Whether `payload` matches what the store expects at `position`.
    fn verify(&self, position: &Position, payload: &Self::Payload) -> bool;

    /// Computes the anchor at `position` given the payload and the anchor
    /// of its predecessor.
    fn advance(
        &self,
        position: &Position,
        payload: &Self::Payload,
        previous: &Self::Anchor,
    ) -> Self::Anchor;

    /// Persists the payload and publishes the new tip. Returning `false`
    /// leaves the task queued for another attempt.
    fn commit(
        &mut self,
        position: &Position,
        payload: &Self::Payload,
        anchor: &Self::Anchor,
    ) -> bool;

    /// Invoked when pending work is available for external workers.
    fn batch_ready(&self) {}
}

enum TaskState<P> {
    Pending,
    InFlight { ticks: u32 },
    Downloaded(P),
}

struct Task<P> {
    position: Position,
    state: TaskState<P>,
    attempts: u32,
}

/// A slice of queue positions granted to one worker.
#[derive(Clone, Debug)]
pub struct Batch {
    pub id: u64,
    positions: Vec<Position>,
}

impl Batch {
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Batch size as a function of queue depth.
pub fn batch_size(queue_len: usize) -> usize {
    if queue_len < 10 {
        1
    } else if queue_len < 100 {
        10
    } else if queue_len < 1000 {
        100
    } else {
        1000
    }
}

pub struct DownloadManager<S: DownloadSink> {
    sink: S,
    known: Position,
    anchor: S::Anchor,
    queue: VecDeque<Task<S::Payload>>,
    next_batch_id: u64,
}

impl<S: DownloadSink> DownloadManager<S> {
    pub fn new(sink: S, known: Position, anchor: S::Anchor) -> Self {
        Self {
            sink,
            known,
            anchor,
            queue: VecDeque::new(),
            next_batch_id: 0,
        }
    }

    /// Highest fully processed position.
    pub fn known(&self) -> Position {
        self.known
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_len(&self) -> usize {
        self.queue
            .iter()
            .filter(|t| matches!(t.state, TaskState::Pending))
            .count()
    }

    /// Extends (or reorganizes) the queue toward `target`.
    ///
    /// `load_anchor` supplies the stored anchor at the fork point when the
    /// ancestor chain reveals that `known` is no longer on the best branch;
    /// in that case the queue is rebuilt from the common ancestor.
    pub fn update_position(
        &mut self,
        target: Position,
        headers: &(impl HeaderSource + ?Sized),
        load_anchor: impl FnOnce(&Position) -> Option<S::Anchor>,
    ) {
        let chain = headers.ancestors(&self.known, &target);
        let Some(first) = chain.first() else {
            return;
        };

        if *first != self.known {
            let Some(anchor) = load_anchor(first) else {
                warn!("missing anchor at fork point {first}, keeping current queue");
                return;
            };
            debug!("reorg: rewinding from {} to {first}", self.known);
            self.queue.clear();
            self.known = *first;
            self.anchor = anchor;
        }

        let mut highest = self
            .queue
            .back()
            .map(|t| t.position.height)
            .unwrap_or(self.known.height);
        for position in chain.into_iter().skip(1) {
            if position.height <= highest {
                continue;
            }
            highest = position.height;
            self.queue.push_back(Task {
                position,
                state: TaskState::Pending,
                attempts: 0,
            });
        }
    }

    /// Grants a batch of pending positions to a worker, marking them in
    /// flight. Returns `None` when nothing is pending.
    pub fn allocate_batch(&mut self) -> Option<Batch> {
        let limit = batch_size(self.queue.len());
        let mut positions = Vec::new();

        for task in self.queue.iter_mut() {
            if positions.len() >= limit {
                break;
            }
            if matches!(task.state, TaskState::Pending) {
                task.state = TaskState::InFlight { ticks: 0 };
                positions.push(task.position);
            }
        }

        if positions.is_empty() {
            return None;
        }

        let id = self.next_batch_id;
        self.next_batch_id += 1;
        trace!("allocated batch {id} with {} task(s)", positions.len());
        Some(Batch { id, positions })
    }

    /// Looks up the queued position carrying `hash`, if any.
    pub fn find_position(&self, hash: &crate::types::BlockHash) -> Option<Position> {
        self.queue
            .iter()
            .map(|t| t.position)
            .find(|p| p.hash == *hash)
    }

    /// Records a downloaded payload for `position`. Returns whether the
    /// payload was accepted into the queue.
    pub fn receive(&mut self, position: &Position, payload: S::Payload) -> bool {
        let Some(task) = self.queue.iter_mut().find(|t| t.position == *position) else {
            trace!("discarding payload for unknown position {position}");
            return false;
        };

        match task.state {
            TaskState::Downloaded(_) => false,
            _ => {
                task.state = TaskState::Downloaded(payload);
                true
            }
        }
    }

    /// Integrates downloaded payloads from the front of the queue, strictly
    /// in height order. Returns the number of tasks processed.
    pub fn process_downloaded(&mut self) -> usize {
        let mut processed = 0;

        while let Some(front) = self.queue.front() {
            if !matches!(front.state, TaskState::Downloaded(_)) {
                break;
            }

            let mut task = self.queue.pop_front().expect("front exists");
            let TaskState::Downloaded(payload) = std::mem::replace(&mut task.state, TaskState::Pending)
            else {
                unreachable!("state checked above");
            };

            if !self.sink.verify(&task.position, &payload) {
                warn!(
                    "payload for {} does not match expectations, requeueing",
                    task.position
                );
                task.attempts += 1;
                self.queue.push_front(task);
                break;
            }

            let anchor = self.sink.advance(&task.position, &payload, &self.anchor);
            if !self.sink.commit(&task.position, &payload, &anchor) {
                warn!("commit failed for {}, will retry", task.position);
                task.state = TaskState::Downloaded(payload);
                self.queue.push_front(task);
                break;
            }

            self.known = task.position;
            self.anchor = anchor;
            processed += 1;
        }

        processed
    }

    /// Periodic driver: requeues stalled downloads, integrates completed
    /// ones, and signals workers when pending work remains.
    pub fn heartbeat(&mut self) -> usize {
        for task in self.queue.iter_mut() {
            if let TaskState::InFlight { ticks } = &mut task.state {
                *ticks += 1;
                if *ticks > STALL_TICKS {
                    debug!("task {} stalled in flight, requeueing", task.position);
                    task.state = TaskState::Pending;
                }
            }
        }

        let processed = self.process_downloaded();

        if self.pending_len() > 0 {
            self.sink.batch_ready();
        }
        processed
    }

    /// Drops all queued work and repositions the pipeline, e.g. after an
    /// externally detected reorg.
    pub fn reset(&mut self, position: Position, anchor: S::Anchor) {
        self.queue.clear();
        self.known = position;
        self.anchor = anchor;
    }
}
