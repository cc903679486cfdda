//! Single-consumer actor substrate.
//!
//! Every oracle owns its mutable state inside an [`Actor`] driven by one
//! tokio task: messages arrive through a bounded mailbox, a heartbeat timer
//! triggers the state machine, and a [`Gate`] rejects work once shutdown
//! begins. The runner guarantees the single-consumer invariant: `pipeline`,
//! `state_machine`, and `shut_down` execute on one task only, so actor
//! state needs no locking of its own.
//!
//! Shutdown is a promise: [`Handle::shutdown`] closes the gate, lets the
//! actor drain whatever is already queued, runs `shut_down`, and resolves
//! when the task has exited.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Default mailbox capacity. Senders are backpressured beyond this.
pub const MAILBOX_CAPACITY: usize = 256;

/// Rejects new work once closed. Closing is one-way.
#[derive(Default)]
pub struct Gate {
    closed: AtomicBool,
}

impl Gate {
    /// Returns `false` if the gate has been closed.
    pub fn pass(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A single-consumer component owning private state.
pub trait Actor: Send + 'static {
    type Work: Send + 'static;

    /// Consumes one incoming message.
    fn pipeline(&mut self, work: Self::Work);

    /// Performs additional work; returns whether more remains. Invoked
    /// after each message and on every heartbeat, repeatedly while it
    /// reports more work.
    fn state_machine(&mut self) -> bool;

    /// Releases owned resources. Idempotent; runs exactly once, after the
    /// mailbox has drained.
    fn shut_down(&mut self);
}

/// Sending side of an actor's mailbox.
pub struct Mailbox<W> {
    tx: mpsc::Sender<W>,
    gate: Arc<Gate>,
}

impl<W> Clone for Mailbox<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<W: Send + 'static> Mailbox<W> {
    /// Enqueues a message, waiting for mailbox space. Returns `false` when
    /// the actor is shutting down.
    pub async fn send(&self, work: W) -> bool {
        if !self.gate.pass() {
            return false;
        }
        self.tx.send(work).await.is_ok()
    }

    /// Non-blocking enqueue. Returns `false` when the actor is shutting
    /// down or the mailbox is full.
    pub fn try_send(&self, work: W) -> bool {
        if !self.gate.pass() {
            return false;
        }
        self.tx.try_send(work).is_ok()
    }
}

/// Owner-side handle to a spawned actor.
pub struct Handle<W> {
    mailbox: Mailbox<W>,
    gate: Arc<Gate>,
    stop: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Receiver<()>>,
}

impl<W: Send + 'static> Handle<W> {
    pub fn mailbox(&self) -> Mailbox<W> {
        self.mailbox.clone()
    }

    /// Closes the gate, asks the runner to drain and stop, and waits for
    /// the actor to finish. Idempotent.
    pub async fn shutdown(&mut self) {
        self.gate.close();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(done) = self.done.take() {
            let _ = done.await;
        }
    }
}

/// Spawns `actor` on its own task with a heartbeat interval.
pub fn spawn<A: Actor>(mut actor: A, heartbeat: Duration) -> Handle<A::Work> {
    let (tx, mut rx) = mpsc::channel::<A::Work>(MAILBOX_CAPACITY);
    let gate = Arc::new(Gate::default());
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    let mailbox = Mailbox {
        tx,
        gate: gate.clone(),
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                maybe = rx.recv() => {
                    match maybe {
                        Some(work) => {
                            actor.pipeline(work);
                            while actor.state_machine() {}
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    while actor.state_machine() {}
                }
            }
        }

        // Drain whatever was accepted before the gate closed.
        while let Ok(work) = rx.try_recv() {
            actor.pipeline(work);
        }
        actor.shut_down();
        trace!("actor drained and shut down");
        let _ = done_tx.send(());
    });

    debug!("spawned actor with {heartbeat:?} heartbeat");
    Handle {
        mailbox,
        gate,
        stop: Some(stop_tx),
        done: Some(done_rx),
    }
}
