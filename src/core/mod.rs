/// Core topology data model shared by the monitor, router and failover layers
pub mod connection;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::core::connection::NodeConnection;
use crate::error::ClientError;

/// A (host, port) pair identifying a set member across its lifetime.
/// Equality and ordering are by value; ordering also breaks election-term
/// ties during dual-primary arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClientError::protocol(format!("invalid endpoint `{s}`: expected host:port")))?;
        if host.is_empty() {
            return Err(ClientError::protocol(format!(
                "invalid endpoint `{s}`: empty host"
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ClientError::protocol(format!("invalid endpoint `{s}`: bad port")))?;
        Ok(Endpoint::new(host, port))
    }
}

// Endpoints travel as "host:port" strings in config files and on the wire.
impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Role a member holds within the set, as resolved by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Unknown,
    Primary,
    Secondary,
    Passive,
    Arbiter,
    Unreachable,
}

impl MemberRole {
    /// A resolved, reachable role (anything the monitor has classified)
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            MemberRole::Primary | MemberRole::Secondary | MemberRole::Passive | MemberRole::Arbiter
        )
    }

    /// Eligible as a read target (arbiters hold no data)
    pub fn is_readable(&self) -> bool {
        matches!(
            self,
            MemberRole::Primary | MemberRole::Secondary | MemberRole::Passive
        )
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberRole::Unknown => "unknown",
            MemberRole::Primary => "primary",
            MemberRole::Secondary => "secondary",
            MemberRole::Passive => "passive",
            MemberRole::Arbiter => "arbiter",
            MemberRole::Unreachable => "unreachable",
        };
        write!(f, "{name}")
    }
}

/// Self-reported status returned by a member in response to a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeInfo {
    /// Role the member claims for itself
    pub role: MemberRole,
    /// Name of the set the member believes it belongs to
    pub set_name: String,
    /// The member's view of the current primary, if any
    pub primary_hint: Option<Endpoint>,
    /// Membership as known by the probed node; feeds secondary seeding
    pub members: Vec<Endpoint>,
    /// Election/term identifier backing a primary claim
    pub election_term: u64,
}

/// Read routing policy. `Secondary` prefers secondaries and falls back to
/// the primary while none are discovered; `Nearest` picks the lowest-latency
/// member of any role except arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPreference {
    Primary,
    Secondary,
    Nearest,
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadPreference::Primary => write!(f, "primary"),
            ReadPreference::Secondary => write!(f, "secondary"),
            ReadPreference::Nearest => write!(f, "nearest"),
        }
    }
}

/// Kind of operation being routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

/// Acknowledgment level required before a write is considered successful
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckLevel {
    /// A majority of data-bearing members
    Majority,
    /// A fixed number of members, the writing primary included
    Members(u32),
}

impl Serialize for AckLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AckLevel::Majority => serializer.serialize_str("majority"),
            AckLevel::Members(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for AckLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(u32),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(AckLevel::Members(n)),
            Repr::Text(s) if s == "majority" => Ok(AckLevel::Majority),
            Repr::Text(s) => Err(D::Error::custom(format!(
                "invalid ack level `{s}`: expected `majority` or a member count"
            ))),
        }
    }
}

/// Write concern: acknowledgment level plus the time the set is given to
/// satisfy it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub ack: AckLevel,
    pub timeout_ms: u64,
}

impl WriteConcern {
    pub fn majority(timeout_ms: u64) -> Self {
        Self {
            ack: AckLevel::Majority,
            timeout_ms,
        }
    }

    pub fn members(count: u32, timeout_ms: u64) -> Self {
        Self {
            ack: AckLevel::Members(count),
            timeout_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Number of member acknowledgments required given the count of
    /// data-bearing members currently in the set
    pub fn required_acks(&self, data_members: usize) -> usize {
        match self.ack {
            AckLevel::Majority => data_members / 2 + 1,
            AckLevel::Members(n) => n as usize,
        }
    }
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::majority(10_000)
    }
}

/// One member as observed by the monitor. Mutated only by the monitor;
/// everything else consumes descriptors as immutable values inside a
/// snapshot.
#[derive(Debug, Clone)]
pub struct MemberDescriptor {
    pub endpoint: Endpoint,
    pub role: MemberRole,
    pub last_probe_at: Option<SystemTime>,
    /// Round-trip latency of the last successful probe
    pub latency: Option<Duration>,
    /// Absent until the first successful probe established a connection
    pub connection: Option<Arc<NodeConnection>>,
}

/// Immutable, versioned view of current membership and roles. Published
/// atomically by the monitor; a descriptor appears in exactly one role set
/// and at most one member holds the primary slot.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub version: u64,
    pub primary: Option<MemberDescriptor>,
    pub secondaries: Vec<MemberDescriptor>,
    pub passives: Vec<MemberDescriptor>,
    pub arbiters: Vec<MemberDescriptor>,
}

impl TopologySnapshot {
    /// Snapshot before any probe has completed
    pub fn empty() -> Self {
        Self {
            version: 0,
            primary: None,
            secondaries: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
        }
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// All members eligible as read targets (everything but arbiters)
    pub fn readable_members(&self) -> Vec<&MemberDescriptor> {
        self.primary
            .iter()
            .chain(self.secondaries.iter())
            .chain(self.passives.iter())
            .collect()
    }

    /// Total descriptors across all role sets
    pub fn member_count(&self) -> usize {
        self.primary.iter().count()
            + self.secondaries.len()
            + self.passives.len()
            + self.arbiters.len()
    }

    /// Compare role assignments, ignoring version and probe bookkeeping.
    /// Re-probing a stable topology must keep this unchanged.
    pub fn same_membership(&self, other: &TopologySnapshot) -> bool {
        fn roles(snap: &TopologySnapshot) -> Vec<(Endpoint, MemberRole)> {
            let mut out: Vec<(Endpoint, MemberRole)> = snap
                .primary
                .iter()
                .chain(snap.secondaries.iter())
                .chain(snap.passives.iter())
                .chain(snap.arbiters.iter())
                .map(|d| (d.endpoint.clone(), d.role))
                .collect();
            out.sort();
            out
        }
        roles(self) == roles(other)
    }
}
