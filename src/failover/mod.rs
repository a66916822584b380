/// Failover coordination
///
/// The coordinator watches snapshot publications and drives a small state
/// machine around primary loss. While no primary is known it accelerates
/// the probe cadence (bounded) and parks write checkouts in a FIFO queue;
/// the first snapshot that carries a primary again releases the queue in
/// submission order and restores the configured cadence.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::connection::NodeConnection;
use crate::core::TopologySnapshot;

/// Ceiling on probe acceleration relative to the configured interval
const MAX_PROBE_ACCELERATION: u32 = 4;
/// Accelerated probing never goes below this floor
const MIN_ACCELERATED_INTERVAL: Duration = Duration::from_millis(50);

/// Where the coordinator currently stands with respect to the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    /// A primary is known and writes flow normally
    Stable,
    /// The primary vanished from the latest snapshot
    PrimaryLost,
    /// Accelerated probing is underway, waiting for a new primary claim
    Electing,
}

impl std::fmt::Display for FailoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverState::Stable => write!(f, "stable"),
            FailoverState::PrimaryLost => write!(f, "primary-lost"),
            FailoverState::Electing => write!(f, "electing"),
        }
    }
}

/// A write checkout parked until a primary is available again
struct PendingWrite {
    submitted_at: Instant,
    tx: oneshot::Sender<Arc<NodeConnection>>,
}

struct CoordinatorInner {
    state: Mutex<FailoverState>,
    queue: Mutex<VecDeque<PendingWrite>>,
    interval_tx: watch::Sender<Duration>,
    base_interval: Duration,
}

/// Handle to the coordinator; cheap to clone
#[derive(Clone)]
pub struct FailoverCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FailoverCoordinator {
    pub fn new(base_interval: Duration, interval_tx: watch::Sender<Duration>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                state: Mutex::new(FailoverState::Stable),
                queue: Mutex::new(VecDeque::new()),
                interval_tx,
                base_interval,
            }),
        }
    }

    /// Spawn the watcher task
    pub fn start(
        &self,
        snapshot_rx: watch::Receiver<Arc<TopologySnapshot>>,
        closed_rx: watch::Receiver<bool>,
    ) {
        let coordinator = self.clone();
        tokio::spawn(coordinator.run(snapshot_rx, closed_rx));
    }

    pub fn state(&self) -> FailoverState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Park a write checkout. The ticket resolves with a primary connection
    /// once one is published; it errors if the client closes first. Wait
    /// deadlines are the caller's concern.
    pub fn enqueue_write(&self) -> oneshot::Receiver<Arc<NodeConnection>> {
        let (tx, rx) = oneshot::channel();
        let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(PendingWrite {
            submitted_at: Instant::now(),
            tx,
        });
        debug!("queued write checkout ({} pending)", queue.len());
        rx
    }

    async fn run(
        self,
        mut snapshot_rx: watch::Receiver<Arc<TopologySnapshot>>,
        mut closed_rx: watch::Receiver<bool>,
    ) {
        let mut had_primary = snapshot_rx.borrow().has_primary();
        loop {
            tokio::select! {
                changed = snapshot_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = Arc::clone(&snapshot_rx.borrow_and_update());
                    self.observe(&snapshot, &mut had_primary);
                }
                _ = closed_rx.changed() => {
                    if *closed_rx.borrow() {
                        break;
                    }
                }
            }
        }
        // Dropping the senders resolves every parked checkout with an error
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!("failover coordinator stopped");
    }

    fn observe(&self, snapshot: &TopologySnapshot, had_primary: &mut bool) {
        if let Some(primary) = &snapshot.primary {
            let was = self.set_state(FailoverState::Stable);
            if was != FailoverState::Stable {
                info!(
                    "primary {} available again, resuming writes",
                    primary.endpoint
                );
                let _ = self.inner.interval_tx.send(self.inner.base_interval);
            }
            if let Some(conn) = &primary.connection {
                self.release_queue(conn);
            }
            *had_primary = true;
        } else if *had_primary {
            let _ = self.set_state(FailoverState::PrimaryLost);
            info!(
                "primary lost (snapshot v{}), accelerating probes",
                snapshot.version
            );
            let _ = self.inner.interval_tx.send(self.accelerated_interval());
            *had_primary = false;
        } else if self.state() == FailoverState::PrimaryLost {
            // Probing continued without turning up a primary
            let _ = self.set_state(FailoverState::Electing);
        }
    }

    fn set_state(&self, next: FailoverState) -> FailoverState {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *state, next)
    }

    fn accelerated_interval(&self) -> Duration {
        let accelerated = self.inner.base_interval / MAX_PROBE_ACCELERATION;
        accelerated.max(MIN_ACCELERATED_INTERVAL).min(self.inner.base_interval)
    }

    /// Release every parked checkout in submission order. Tickets whose
    /// caller already gave up are skipped.
    fn release_queue(&self, primary: &Arc<NodeConnection>) {
        let drained: Vec<PendingWrite> = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        for pending in drained {
            let waited = pending.submitted_at.elapsed();
            if pending.tx.send(Arc::clone(primary)).is_ok() {
                debug!(
                    "released queued write to {} after {:?}",
                    primary.endpoint(),
                    waited
                );
            }
        }
    }
}
