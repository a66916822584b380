//! veleta - replica set topology tracking and read/write routing
//!
//! veleta maintains a live picture of a replica set (primary, secondaries,
//! passives, arbiters) by probing every member on an interval, and routes
//! application reads and writes against that picture. Writes always target
//! the primary; reads honor a configurable preference with a per-operation
//! override. When the primary is lost, probing accelerates and write
//! checkouts queue until a new primary is observed or the operation wait
//! deadline passes.
//!
//! # Example
//!
//! ```no_run
//! use veleta::{ReplicaSetClient, ReplicaSetConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ReplicaSetConfig::load_from_file("veleta.toml")?;
//!     let mut client = ReplicaSetClient::open(config).await?;
//!
//!     client.wait_for_full_setup(std::time::Duration::from_secs(30)).await;
//!     let reader = client.checkout_reader(None).await?;
//!     println!("reading from {}", reader.endpoint());
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod failover;
pub mod monitor;
pub mod router;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;

pub use crate::config::ReplicaSetConfig;
pub use crate::core::connection::{NodeConnection, Operation, Response, TransportFactory};
pub use crate::core::{
    AckLevel, Endpoint, MemberRole, OperationKind, ReadPreference, TopologySnapshot, WriteConcern,
};
pub use crate::error::{ClientError, ClientResult};
pub use crate::events::ClusterEvent;
pub use crate::failover::FailoverState;

use crate::core::connection::TcpTransportFactory;
use crate::events::EventNotifier;
use crate::failover::FailoverCoordinator;
use crate::monitor::TopologyMonitor;
use crate::router::Router;

/// Client handle over one replica set. Owns the monitor, router and
/// failover coordinator; cheap operations take `&self` so the handle can be
/// shared behind an `Arc`.
pub struct ReplicaSetClient {
    config: ReplicaSetConfig,
    router: Router,
    monitor: TopologyMonitor,
    coordinator: FailoverCoordinator,
    snapshot_rx: watch::Receiver<Arc<TopologySnapshot>>,
    events: mpsc::UnboundedReceiver<ClusterEvent>,
    notifier: EventNotifier,
    closed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ReplicaSetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSetClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReplicaSetClient {
    /// Open a client against the configured seed list over TCP
    pub async fn open(config: ReplicaSetConfig) -> ClientResult<Self> {
        Self::open_with_transport(config, Arc::new(TcpTransportFactory)).await
    }

    /// Open a client with a caller-provided transport factory. This is the
    /// seam the test suite uses to drive a simulated set in-process.
    pub async fn open_with_transport(
        config: ReplicaSetConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> ClientResult<Self> {
        config.validate()?;
        info!(
            "opening client for set `{}` with {} seed(s)",
            config.set.name,
            config.set.seeds.len()
        );

        let (notifier, events) = EventNotifier::channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (interval_tx, interval_rx) = watch::channel(config.probe_interval());

        let (monitor, snapshot_rx) = TopologyMonitor::new(
            &config,
            factory,
            notifier.clone(),
            interval_rx,
            closed_rx.clone(),
        );
        monitor.start().await;

        let coordinator = FailoverCoordinator::new(config.probe_interval(), interval_tx);
        coordinator.start(snapshot_rx.clone(), closed_rx.clone());

        let router = Router::new(
            snapshot_rx.clone(),
            coordinator.clone(),
            config.routing.read_preference,
            config.operation_wait_timeout(),
            closed_rx,
        );

        Ok(Self {
            config,
            router,
            monitor,
            coordinator,
            snapshot_rx,
            events,
            notifier,
            closed_tx,
        })
    }

    pub fn config(&self) -> &ReplicaSetConfig {
        &self.config
    }

    /// Latest published topology snapshot
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.snapshot_rx.borrow())
    }

    pub fn failover_state(&self) -> FailoverState {
        self.coordinator.state()
    }

    /// Whether reads currently land on the primary: always for the
    /// `primary` preference, for `secondary` only while no secondary is
    /// connected, and never assumed for `nearest`.
    pub fn is_read_primary(&self) -> bool {
        match self.router.default_preference() {
            ReadPreference::Primary => true,
            ReadPreference::Secondary => {
                let snapshot = self.topology();
                snapshot
                    .secondaries
                    .iter()
                    .chain(snapshot.passives.iter())
                    .all(|d| d.connection.is_none())
            }
            ReadPreference::Nearest => false,
        }
    }

    /// Check out a connection for a read, optionally overriding the
    /// configured read preference for this operation only
    pub async fn checkout_reader(
        &self,
        preference: Option<ReadPreference>,
    ) -> ClientResult<Arc<NodeConnection>> {
        self.router.select(OperationKind::Read, preference).await
    }

    /// Check out the primary connection for a write, waiting through a
    /// failover up to the operation wait timeout
    pub async fn checkout_writer(&self) -> ClientResult<Arc<NodeConnection>> {
        self.router.select(OperationKind::Write, None).await
    }

    /// Insert documents through the primary and verify the write concern
    /// against the acknowledgment count reported by the set. Returns how
    /// many members acknowledged.
    pub async fn insert(
        &self,
        collection: &str,
        documents: Vec<String>,
        write_concern: Option<WriteConcern>,
    ) -> ClientResult<u32> {
        let write_concern = write_concern.unwrap_or(self.config.routing.write_concern);
        let conn = self.checkout_writer().await?;
        let data_members = self.topology().readable_members().len();
        let required = write_concern.required_acks(data_members) as u32;

        let response = conn
            .execute(Operation::Insert {
                collection: collection.to_string(),
                documents,
                write_concern,
            })
            .await?;
        match response {
            Response::Ack { acknowledged_by } => {
                if acknowledged_by < required {
                    return Err(ClientError::WriteConcernUnsatisfied {
                        required,
                        acknowledged: acknowledged_by,
                    });
                }
                Ok(acknowledged_by)
            }
            Response::Documents { .. } => Err(ClientError::protocol("unexpected reply to insert")),
        }
    }

    /// Read every document in a collection from a member chosen by the
    /// effective read preference
    pub async fn find(
        &self,
        collection: &str,
        preference: Option<ReadPreference>,
    ) -> ClientResult<Vec<String>> {
        let conn = self.checkout_reader(preference).await?;
        match conn
            .execute(Operation::Find {
                collection: collection.to_string(),
            })
            .await?
        {
            Response::Documents { documents } => Ok(documents),
            Response::Ack { .. } => Err(ClientError::protocol("unexpected reply to find")),
        }
    }

    /// Receive the next lifecycle event
    pub async fn next_event(&mut self) -> Option<ClusterEvent> {
        self.events.recv().await
    }

    /// Consume events until fullSetup fires or `wait` elapses. Returns
    /// whether the set stabilized in time.
    pub async fn wait_for_full_setup(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, async {
            while let Some(event) = self.next_event().await {
                if event == ClusterEvent::FullSetup {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    /// Close the client: cancel pending waits, stop probe loops, shut
    /// member connections down and emit the close event. Idempotent.
    pub async fn close(&self) {
        if *self.closed_tx.borrow() {
            return;
        }
        info!("closing client for set `{}`", self.config.set.name);
        let _ = self.closed_tx.send(true);
        self.monitor.shutdown().await;
        self.notifier.emit(ClusterEvent::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut config = ReplicaSetConfig::default();
        config.set.seeds.clear();
        let err = ReplicaSetClient::open(config).await.unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[tokio::test]
    async fn test_new_client_starts_with_empty_topology() {
        // A seed that never answers: topology stays empty, state stable
        let mut config = ReplicaSetConfig::default();
        config.set.seeds = vec![Endpoint::new("127.0.0.1", 1)];
        config.monitor.connection_timeout_ms = 100;

        let client = ReplicaSetClient::open(config).await.unwrap();
        assert_eq!(client.topology().member_count(), 0);
        assert_eq!(client.failover_state(), FailoverState::Stable);
        assert!(client.is_read_primary());
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut config = ReplicaSetConfig::default();
        config.set.seeds = vec![Endpoint::new("127.0.0.1", 1)];
        config.monitor.connection_timeout_ms = 100;

        let client = ReplicaSetClient::open(config).await.unwrap();
        client.close().await;
        client.close().await;
    }
}
