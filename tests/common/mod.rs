#![allow(dead_code)]
//! In-process simulated replica set used by the integration tests.
//!
//! Each member keeps its own document store; inserts land on the primary
//! and replicate to every live data-bearing member, with the acknowledgment
//! count reported back the way a real set would. Members can be killed,
//! revived and promoted mid-test to exercise failover paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use veleta::core::connection::{MemberTransport, Operation, Response, TransportFactory};
use veleta::core::ProbeInfo;
use veleta::{ClientError, ClientResult, Endpoint, MemberRole, ReadPreference, ReplicaSetConfig, WriteConcern};

pub fn ep(port: u16) -> Endpoint {
    Endpoint::new("127.0.0.1", port)
}

/// Config tuned for test cadence: fast probes, short timeouts
pub fn fast_config(seeds: Vec<Endpoint>, preference: ReadPreference) -> ReplicaSetConfig {
    let mut config = ReplicaSetConfig::default();
    config.set.name = "rs0".to_string();
    config.set.seeds = seeds;
    config.routing.read_preference = preference;
    config.routing.write_concern = WriteConcern::members(2, 10_000);
    config.routing.operation_wait_timeout_ms = 2_000;
    config.monitor.probe_interval_ms = 20;
    config.monitor.connection_timeout_ms = 500;
    config
}

struct SimMember {
    up: AtomicBool,
    role: Mutex<MemberRole>,
    store: Mutex<HashMap<String, Vec<String>>>,
}

struct SetState {
    name: String,
    term: AtomicU64,
    members: BTreeMap<Endpoint, SimMember>,
}

impl SetState {
    fn member(&self, endpoint: &Endpoint) -> ClientResult<&SimMember> {
        self.members.get(endpoint).ok_or_else(|| {
            ClientError::Network(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no such member {endpoint}"),
            ))
        })
    }

    fn live_member(&self, endpoint: &Endpoint) -> ClientResult<&SimMember> {
        let member = self.member(endpoint)?;
        if !member.up.load(Ordering::SeqCst) {
            return Err(ClientError::Network(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("member {endpoint} is down"),
            )));
        }
        Ok(member)
    }

    fn live_primary(&self) -> Option<&Endpoint> {
        self.members.iter().find_map(|(endpoint, member)| {
            let live = member.up.load(Ordering::SeqCst);
            (live && *member.role.lock().unwrap() == MemberRole::Primary).then_some(endpoint)
        })
    }

    fn probe_info(&self, endpoint: &Endpoint) -> ClientResult<ProbeInfo> {
        let member = self.live_member(endpoint)?;
        let role = *member.role.lock().unwrap();
        Ok(ProbeInfo {
            role,
            set_name: self.name.clone(),
            primary_hint: self.live_primary().cloned(),
            members: self.members.keys().cloned().collect(),
            election_term: self.term.load(Ordering::SeqCst),
        })
    }

    fn execute(&self, endpoint: &Endpoint, op: &Operation) -> ClientResult<Response> {
        let member = self.live_member(endpoint)?;
        match op {
            Operation::Insert {
                collection,
                documents,
                ..
            } => {
                if *member.role.lock().unwrap() != MemberRole::Primary {
                    return Err(ClientError::protocol(format!(
                        "member {endpoint} is not primary"
                    )));
                }
                // Replicate to every live data-bearing member, self included
                let mut acknowledged = 0u32;
                for replica in self.members.values() {
                    if !replica.up.load(Ordering::SeqCst) {
                        continue;
                    }
                    let role = *replica.role.lock().unwrap();
                    if !role.is_readable() {
                        continue;
                    }
                    replica
                        .store
                        .lock()
                        .unwrap()
                        .entry(collection.clone())
                        .or_default()
                        .extend(documents.iter().cloned());
                    acknowledged += 1;
                }
                Ok(Response::Ack {
                    acknowledged_by: acknowledged,
                })
            }
            Operation::Find { collection } => Ok(Response::Documents {
                documents: member
                    .store
                    .lock()
                    .unwrap()
                    .get(collection)
                    .cloned()
                    .unwrap_or_default(),
            }),
        }
    }
}

/// Handle to the simulated set; clone-cheap
#[derive(Clone)]
pub struct SimSet {
    state: Arc<SetState>,
}

impl SimSet {
    pub fn new(name: &str, members: &[(u16, MemberRole)]) -> Self {
        let members = members
            .iter()
            .map(|(port, role)| {
                (
                    ep(*port),
                    SimMember {
                        up: AtomicBool::new(true),
                        role: Mutex::new(*role),
                        store: Mutex::new(HashMap::new()),
                    },
                )
            })
            .collect();
        Self {
            state: Arc::new(SetState {
                name: name.to_string(),
                term: AtomicU64::new(1),
                members,
            }),
        }
    }

    /// The usual fixture: one primary and two secondaries
    pub fn three_members() -> Self {
        Self::new(
            "rs0",
            &[
                (31000, MemberRole::Primary),
                (31001, MemberRole::Secondary),
                (31002, MemberRole::Secondary),
            ],
        )
    }

    pub fn factory(&self) -> Arc<SimFactory> {
        Arc::new(SimFactory {
            state: Arc::clone(&self.state),
        })
    }

    pub fn primary(&self) -> Option<Endpoint> {
        self.state.live_primary().cloned()
    }

    pub fn kill(&self, endpoint: &Endpoint) {
        self.state.members[endpoint].up.store(false, Ordering::SeqCst);
    }

    pub fn revive(&self, endpoint: &Endpoint) {
        self.state.members[endpoint].up.store(true, Ordering::SeqCst);
    }

    /// Promote a member to primary under a fresh election term
    pub fn promote(&self, endpoint: &Endpoint) {
        self.state.term.fetch_add(1, Ordering::SeqCst);
        *self.state.members[endpoint].role.lock().unwrap() = MemberRole::Primary;
    }

    /// Take the primary down without electing a successor
    pub fn kill_primary_without_promotion(&self) -> Endpoint {
        let primary = self.primary().expect("set has no primary");
        self.kill(&primary);
        primary
    }

    /// Take the primary down and promote the lowest live secondary, the
    /// way a healthy set recovers on its own
    pub fn kill_primary(&self) -> Endpoint {
        let old = self.kill_primary_without_promotion();
        let successor = self
            .state
            .members
            .iter()
            .find(|(_, member)| {
                member.up.load(Ordering::SeqCst)
                    && *member.role.lock().unwrap() == MemberRole::Secondary
            })
            .map(|(endpoint, _)| endpoint.clone())
            .expect("no live secondary to promote");
        self.promote(&successor);
        old
    }

    /// Documents a specific member holds, for replication assertions
    pub fn documents_on(&self, endpoint: &Endpoint, collection: &str) -> Vec<String> {
        self.state.members[endpoint]
            .store
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct SimFactory {
    state: Arc<SetState>,
}

struct SimTransport {
    endpoint: Endpoint,
    state: Arc<SetState>,
}

#[async_trait]
impl TransportFactory for SimFactory {
    async fn open(&self, endpoint: &Endpoint) -> ClientResult<Box<dyn MemberTransport>> {
        // Connecting to a down member fails like a refused TCP connect
        self.state.live_member(endpoint)?;
        Ok(Box::new(SimTransport {
            endpoint: endpoint.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

#[async_trait]
impl MemberTransport for SimTransport {
    async fn probe(&self) -> ClientResult<ProbeInfo> {
        self.state.probe_info(&self.endpoint)
    }

    async fn execute(&self, op: &Operation) -> ClientResult<Response> {
        self.state.execute(&self.endpoint, op)
    }

    async fn close(&self) {}
}

/// Poll until the condition holds or the deadline passes
pub async fn wait_until<F>(wait: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(wait, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
