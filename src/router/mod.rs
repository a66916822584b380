/// Read/write routing over topology snapshots
///
/// Selection is a pure function of one snapshot plus the effective read
/// preference. The router never mutates topology state; when no usable
/// member exists it waits on the watch channel for a better snapshot, or
/// parks a write on the failover queue, up to the configured wait timeout.
use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::connection::NodeConnection;
use crate::core::{MemberDescriptor, OperationKind, ReadPreference, TopologySnapshot};
use crate::error::{ClientError, ClientResult};
use crate::failover::FailoverCoordinator;

/// Select a member connection from one snapshot. Returns `None` when the
/// snapshot has no usable member for the preference.
pub fn pick(
    snapshot: &TopologySnapshot,
    preference: ReadPreference,
) -> Option<Arc<NodeConnection>> {
    match preference {
        ReadPreference::Primary => snapshot.primary.as_ref().and_then(|d| d.connection.clone()),
        ReadPreference::Secondary => {
            // Passives serve reads alongside regular secondaries
            let pool: Vec<&MemberDescriptor> = snapshot
                .secondaries
                .iter()
                .chain(snapshot.passives.iter())
                .filter(|d| d.connection.is_some())
                .collect();
            if pool.is_empty() {
                snapshot.primary.as_ref().and_then(|d| d.connection.clone())
            } else {
                let idx = rand::thread_rng().gen_range(0..pool.len());
                pool[idx].connection.clone()
            }
        }
        ReadPreference::Nearest => snapshot
            .readable_members()
            .into_iter()
            .filter(|d| d.connection.is_some())
            .min_by_key(|d| d.latency.unwrap_or(Duration::MAX))
            .and_then(|d| d.connection.clone()),
    }
}

/// Stateless routing facade held by the client
#[derive(Clone)]
pub struct Router {
    snapshot_rx: watch::Receiver<Arc<TopologySnapshot>>,
    coordinator: FailoverCoordinator,
    default_preference: ReadPreference,
    wait_timeout: Duration,
    closed_rx: watch::Receiver<bool>,
}

impl Router {
    pub fn new(
        snapshot_rx: watch::Receiver<Arc<TopologySnapshot>>,
        coordinator: FailoverCoordinator,
        default_preference: ReadPreference,
        wait_timeout: Duration,
        closed_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            snapshot_rx,
            coordinator,
            default_preference,
            wait_timeout,
            closed_rx,
        }
    }

    pub fn default_preference(&self) -> ReadPreference {
        self.default_preference
    }

    /// Route an operation to a member connection. Writes always target the
    /// primary; reads honor the per-operation preference override, falling
    /// back to the configured default.
    pub async fn select(
        &self,
        kind: OperationKind,
        preference: Option<ReadPreference>,
    ) -> ClientResult<Arc<NodeConnection>> {
        if *self.closed_rx.borrow() {
            return Err(ClientError::Closed);
        }
        match kind {
            OperationKind::Write => self.select_writer().await,
            OperationKind::Read => {
                let preference = preference.unwrap_or(self.default_preference);
                self.select_reader(preference).await
            }
        }
    }

    async fn select_writer(&self) -> ClientResult<Arc<NodeConnection>> {
        let mut rx = self.snapshot_rx.clone();
        if let Some(conn) = pick(&rx.borrow_and_update(), ReadPreference::Primary) {
            return Ok(conn);
        }

        // No primary in the current snapshot: park on the failover queue.
        // Re-check after enqueueing so a publication racing the miss cannot
        // leave us waiting for a snapshot that already arrived.
        let deadline = Instant::now() + self.wait_timeout;
        let ticket = self.coordinator.enqueue_write();
        if let Some(conn) = pick(&rx.borrow_and_update(), ReadPreference::Primary) {
            return Ok(conn);
        }

        let mut closed_rx = self.closed_rx.clone();
        tokio::select! {
            released = ticket => released.map_err(|_| ClientError::Closed),
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    "no primary available within {:?}, failing write checkout",
                    self.wait_timeout
                );
                Err(ClientError::NoPrimaryAvailable)
            }
            _ = wait_closed(&mut closed_rx) => Err(ClientError::Closed),
        }
    }

    async fn select_reader(&self, preference: ReadPreference) -> ClientResult<Arc<NodeConnection>> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut rx = self.snapshot_rx.clone();
        let mut closed_rx = self.closed_rx.clone();
        loop {
            match self.guarded_pick(&mut rx, preference) {
                Ok(Some(conn)) => return Ok(conn),
                Ok(None) => {}
                Err(err @ ClientError::StaleSnapshot { .. }) => {
                    debug!("{err}, recomputing");
                    continue;
                }
                Err(err) => return Err(err),
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ClientError::Closed);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(match preference {
                        ReadPreference::Nearest => ClientError::NoSecondaryAvailable,
                        _ => ClientError::NoPrimaryAvailable,
                    });
                }
                _ = wait_closed(&mut closed_rx) => return Err(ClientError::Closed),
            }
        }
    }

    /// Pick from the freshest snapshot, detecting a publication that raced
    /// the computation so the caller recomputes instead of acting on a
    /// superseded view.
    fn guarded_pick(
        &self,
        rx: &mut watch::Receiver<Arc<TopologySnapshot>>,
        preference: ReadPreference,
    ) -> ClientResult<Option<Arc<NodeConnection>>> {
        let snapshot = Arc::clone(&rx.borrow_and_update());
        let picked = pick(&snapshot, preference);
        if rx.has_changed().unwrap_or(false) {
            let latest = rx.borrow().version;
            return Err(ClientError::StaleSnapshot {
                computed: snapshot.version,
                latest,
            });
        }
        Ok(picked)
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
