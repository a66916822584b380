/// Topology monitoring
///
/// The monitor runs one probe loop per configured or discovered member.
/// Loops are independent: a hung member never delays observation of the
/// others. Each probe outcome is merged into the member registry under a
/// single lock and published as a fresh immutable `TopologySnapshot` over a
/// watch channel, so routing consumers never observe a torn view and never
/// block the monitor.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReplicaSetConfig;
use crate::core::connection::{NodeConnection, TransportFactory};
use crate::core::{Endpoint, MemberDescriptor, MemberRole, ProbeInfo, TopologySnapshot};
use crate::error::{ClientError, ClientResult};
use crate::events::{ClusterEvent, EventNotifier};

/// Consecutive probe failures before a member is marked unreachable
const PROBE_FAILURE_LIMIT: u32 = 3;

/// Monitor-side bookkeeping for one member. Mutation is confined to the
/// monitor; snapshots expose immutable copies.
struct MemberState {
    role: MemberRole,
    consecutive_failures: u32,
    election_term: u64,
    latency: Option<Duration>,
    last_probe_at: Option<SystemTime>,
    connection: Option<Arc<NodeConnection>>,
    ever_reachable: bool,
    // Sticky across unreachability; arbiters never gate fullSetup
    arbiter: bool,
}

impl MemberState {
    fn new() -> Self {
        Self {
            role: MemberRole::Unknown,
            consecutive_failures: 0,
            election_term: 0,
            latency: None,
            last_probe_at: None,
            connection: None,
            ever_reachable: false,
            arbiter: false,
        }
    }
}

struct Registry {
    members: HashMap<Endpoint, MemberState>,
    version: u64,
    opened: bool,
    full_setup_announced: bool,
    current_primary: Option<Endpoint>,
}

struct MonitorInner {
    set_name: String,
    seeds: Vec<Endpoint>,
    probe_timeout: Duration,
    factory: Arc<dyn TransportFactory>,
    registry: Mutex<Registry>,
    snapshot_tx: watch::Sender<Arc<TopologySnapshot>>,
    interval_rx: watch::Receiver<Duration>,
    closed_rx: watch::Receiver<bool>,
    notifier: EventNotifier,
}

/// Handle to the monitor; cheap to clone
#[derive(Clone)]
pub struct TopologyMonitor {
    inner: Arc<MonitorInner>,
}

impl TopologyMonitor {
    /// Build the monitor. `interval_rx` carries the probe cadence, which the
    /// failover coordinator shortens during elections; `closed_rx` flips
    /// true once on client close.
    pub fn new(
        config: &ReplicaSetConfig,
        factory: Arc<dyn TransportFactory>,
        notifier: EventNotifier,
        interval_rx: watch::Receiver<Duration>,
        closed_rx: watch::Receiver<bool>,
    ) -> (Self, watch::Receiver<Arc<TopologySnapshot>>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(TopologySnapshot::empty()));
        let inner = Arc::new(MonitorInner {
            set_name: config.set.name.clone(),
            seeds: config.set.seeds.clone(),
            probe_timeout: config.connection_timeout(),
            factory,
            registry: Mutex::new(Registry {
                members: HashMap::new(),
                version: 0,
                opened: false,
                full_setup_announced: false,
                current_primary: None,
            }),
            snapshot_tx,
            interval_rx,
            closed_rx,
            notifier,
        });
        (Self { inner }, snapshot_rx)
    }

    /// Register the seeds and start one probe loop per seed. Further
    /// members reported by probe responses get loops of their own.
    pub async fn start(&self) {
        {
            let mut reg = self.inner.registry.lock().await;
            for seed in &self.inner.seeds {
                reg.members
                    .entry(seed.clone())
                    .or_insert_with(MemberState::new);
            }
        }
        for seed in &self.inner.seeds {
            MonitorInner::spawn_loop(Arc::clone(&self.inner), seed.clone());
        }
    }

    /// Tear down every member connection. Probe loops exit on their own via
    /// the closed flag.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<NodeConnection>> = {
            let mut reg = self.inner.registry.lock().await;
            reg.members
                .values_mut()
                .filter_map(|state| state.connection.take())
                .collect()
        };
        for conn in connections {
            conn.close().await;
        }
    }

    /// Number of members currently known (configured plus discovered)
    pub async fn known_members(&self) -> usize {
        self.inner.registry.lock().await.members.len()
    }
}

impl MonitorInner {
    fn spawn_loop(inner: Arc<MonitorInner>, endpoint: Endpoint) {
        tokio::spawn(probe_loop(inner, endpoint));
    }

    /// Reuse the member's connection or establish a new one
    async fn connection_for(&self, endpoint: &Endpoint) -> ClientResult<Arc<NodeConnection>> {
        {
            let reg = self.registry.lock().await;
            if let Some(state) = reg.members.get(endpoint) {
                if let Some(conn) = &state.connection {
                    return Ok(Arc::clone(conn));
                }
            }
        }
        let conn =
            NodeConnection::connect(endpoint.clone(), self.factory.as_ref(), self.probe_timeout)
                .await?;
        let mut reg = self.registry.lock().await;
        if let Some(state) = reg.members.get_mut(endpoint) {
            state.connection = Some(Arc::clone(&conn));
        }
        Ok(conn)
    }

    /// Merge a successful probe into the registry and publish a new
    /// snapshot. Returns endpoints discovered from the member's
    /// self-reported list so the caller can start loops for them.
    async fn apply_success(
        &self,
        endpoint: &Endpoint,
        info: ProbeInfo,
        latency: Duration,
        conn: Arc<NodeConnection>,
    ) -> Vec<Endpoint> {
        if info.set_name != self.set_name {
            // Hard error for this probe, not fatal to the client
            let err = ClientError::SetNameMismatch {
                endpoint: endpoint.clone(),
                expected: self.set_name.clone(),
                reported: info.set_name.clone(),
            };
            warn!("discarding probe result: {}", err);
            self.notifier.emit(ClusterEvent::Error {
                message: err.to_string(),
            });
            self.apply_failure(endpoint).await;
            return Vec::new();
        }

        let mut discovered = Vec::new();
        let mut reg = self.registry.lock().await;
        let reg = &mut *reg;

        let prior_role;
        let was_ever_reachable;
        {
            let state = reg
                .members
                .entry(endpoint.clone())
                .or_insert_with(MemberState::new);
            prior_role = state.role;
            was_ever_reachable = state.ever_reachable;
            state.consecutive_failures = 0;
            state.election_term = info.election_term;
            state.latency = Some(latency);
            state.last_probe_at = Some(SystemTime::now());
            state.connection = Some(conn);
            state.ever_reachable = true;
        }

        // A primary claim is only accepted if no rival claim carries a
        // higher election term; ties break by endpoint ordering. The loser
        // is demoted to secondary for this snapshot and re-probed next
        // cycle.
        let mut resolved_role = info.role;
        if resolved_role == MemberRole::Primary {
            let rivals: Vec<(Endpoint, u64)> = reg
                .members
                .iter()
                .filter(|(ep, state)| ep != &endpoint && state.role == MemberRole::Primary)
                .map(|(ep, state)| (ep.clone(), state.election_term))
                .collect();
            for (rival, rival_term) in rivals {
                let rival_wins = rival_term > info.election_term
                    || (rival_term == info.election_term && rival < *endpoint);
                if rival_wins {
                    debug!(
                        "demoting primary claim of {} (term {}) in favor of {} (term {})",
                        endpoint, info.election_term, rival, rival_term
                    );
                    resolved_role = MemberRole::Secondary;
                } else if let Some(state) = reg.members.get_mut(&rival) {
                    debug!(
                        "demoting stale primary {} (term {}) in favor of {} (term {})",
                        rival, rival_term, endpoint, info.election_term
                    );
                    state.role = MemberRole::Secondary;
                }
            }
        }
        if let Some(state) = reg.members.get_mut(endpoint) {
            state.role = resolved_role;
            state.arbiter = resolved_role == MemberRole::Arbiter;
        }

        // Secondary seeding: adopt every endpoint this member knows about
        for ep in info.members.iter().chain(info.primary_hint.iter()) {
            if !reg.members.contains_key(ep) {
                info!("discovered member {} via {}", ep, endpoint);
                reg.members.insert(ep.clone(), MemberState::new());
                discovered.push(ep.clone());
            }
        }

        if !reg.opened {
            reg.opened = true;
            self.notifier.emit(ClusterEvent::Open {
                endpoint: endpoint.clone(),
            });
        }

        if prior_role == MemberRole::Unreachable && was_ever_reachable {
            info!("member {} recovered as {}", endpoint, resolved_role);
            self.notifier.emit(ClusterEvent::MemberRecovered {
                endpoint: endpoint.clone(),
            });
        }

        self.publish_locked(reg);
        discovered
    }

    /// Record a failed probe; after three consecutive failures the member
    /// is downgraded to unreachable and its connection reclaimed. The probe
    /// loop keeps retrying at the normal cadence so recovery detection
    /// latency stays bounded.
    async fn apply_failure(&self, endpoint: &Endpoint) {
        let mut reg = self.registry.lock().await;
        let reg = &mut *reg;
        let Some(state) = reg.members.get_mut(endpoint) else {
            return;
        };
        state.consecutive_failures += 1;
        state.last_probe_at = Some(SystemTime::now());
        if state.consecutive_failures < PROBE_FAILURE_LIMIT
            || state.role == MemberRole::Unreachable
        {
            return;
        }

        let was_active = state.role.is_resolved();
        let was_arbiter = state.arbiter;
        state.role = MemberRole::Unreachable;
        state.latency = None;
        let stale = state.connection.take();
        if let Some(conn) = stale {
            tokio::spawn(async move { conn.close().await });
        }

        if was_active {
            if !was_arbiter {
                reg.full_setup_announced = false;
            }
            warn!(
                "member {} unreachable after {} consecutive probe failures",
                endpoint, PROBE_FAILURE_LIMIT
            );
            self.notifier.emit(ClusterEvent::MemberLost {
                endpoint: endpoint.clone(),
            });
        }
        self.publish_locked(reg);
    }

    /// Build and atomically publish a snapshot from the registry, bumping
    /// the version and emitting primaryChanged/fullSetup as warranted.
    fn publish_locked(&self, reg: &mut Registry) {
        reg.version += 1;
        let mut snapshot = TopologySnapshot {
            version: reg.version,
            primary: None,
            secondaries: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
        };

        let mut endpoints: Vec<Endpoint> = reg.members.keys().cloned().collect();
        endpoints.sort();
        for ep in endpoints {
            let Some(state) = reg.members.get(&ep) else {
                continue;
            };
            let descriptor = MemberDescriptor {
                endpoint: ep,
                role: state.role,
                last_probe_at: state.last_probe_at,
                latency: state.latency,
                connection: state.connection.clone(),
            };
            match state.role {
                MemberRole::Primary => snapshot.primary = Some(descriptor),
                MemberRole::Secondary => snapshot.secondaries.push(descriptor),
                MemberRole::Passive => snapshot.passives.push(descriptor),
                MemberRole::Arbiter => snapshot.arbiters.push(descriptor),
                MemberRole::Unknown | MemberRole::Unreachable => {}
            }
        }

        let new_primary = snapshot.primary.as_ref().map(|d| d.endpoint.clone());
        if new_primary != reg.current_primary {
            info!(
                "primary changed: {:?} -> {:?}",
                reg.current_primary, new_primary
            );
            self.notifier.emit(ClusterEvent::PrimaryChanged {
                old: reg.current_primary.clone(),
                new: new_primary.clone(),
            });
            reg.current_primary = new_primary;
        }

        // Arbiters never gate stabilization, including a known arbiter that
        // went unreachable
        let all_resolved = !reg.members.is_empty()
            && reg
                .members
                .values()
                .all(|s| s.role.is_resolved() || s.arbiter);
        if all_resolved && !reg.full_setup_announced {
            reg.full_setup_announced = true;
            info!("full set discovered ({} members)", reg.members.len());
            self.notifier.emit(ClusterEvent::FullSetup);
        }

        let _ = self.snapshot_tx.send(Arc::new(snapshot));
    }
}

/// One member's probe loop: probe, merge, sleep for the current interval,
/// repeat until the client closes.
async fn probe_loop(inner: Arc<MonitorInner>, endpoint: Endpoint) {
    debug!("starting probe loop for {}", endpoint);
    let mut closed_rx = inner.closed_rx.clone();
    loop {
        if *closed_rx.borrow() {
            break;
        }
        match inner.connection_for(&endpoint).await {
            Ok(conn) => {
                let started = Instant::now();
                match conn.probe().await {
                    Ok(info) => {
                        let discovered = inner
                            .apply_success(&endpoint, info, started.elapsed(), conn)
                            .await;
                        for ep in discovered {
                            MonitorInner::spawn_loop(Arc::clone(&inner), ep);
                        }
                    }
                    Err(err) => {
                        debug!("probe of {} failed: {}", endpoint, err);
                        inner.apply_failure(&endpoint).await;
                    }
                }
            }
            Err(err) => {
                debug!("connect to {} failed: {}", endpoint, err);
                inner.apply_failure(&endpoint).await;
            }
        }

        let interval = *inner.interval_rx.borrow();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = closed_rx.changed() => {
                // A dropped sender means the client went away
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("probe loop for {} stopped", endpoint);
}
