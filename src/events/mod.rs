/// Lifecycle event delivery to the owning client
///
/// Events are handed off over an unbounded channel in emission order; the
/// monitor and coordinator never wait on subscriber logic.
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::Endpoint;

/// Lifecycle signals exposed to the client/application layer
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    /// First successful connection to any seed
    Open { endpoint: Endpoint },
    /// Every currently known non-arbiter member has a resolved, reachable role
    FullSetup,
    /// A previously reachable member became unreachable
    MemberLost { endpoint: Endpoint },
    /// A previously unreachable member answered a probe again
    MemberRecovered { endpoint: Endpoint },
    /// The primary slot changed hands (either side may be vacant)
    PrimaryChanged {
        old: Option<Endpoint>,
        new: Option<Endpoint>,
    },
    /// An anomaly worth surfacing; does not by itself close the client
    Error { message: String },
    /// The client was closed
    Close,
}

impl ClusterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterEvent::Open { .. } => "open",
            ClusterEvent::FullSetup => "fullSetup",
            ClusterEvent::MemberLost { .. } => "memberLost",
            ClusterEvent::MemberRecovered { .. } => "memberRecovered",
            ClusterEvent::PrimaryChanged { .. } => "primaryChanged",
            ClusterEvent::Error { .. } => "error",
            ClusterEvent::Close => "close",
        }
    }
}

/// Sending half of the event channel, shared by monitor and coordinator
#[derive(Clone)]
pub struct EventNotifier {
    tx: mpsc::UnboundedSender<ClusterEvent>,
}

impl EventNotifier {
    /// Create a notifier and the receiver the owning client consumes
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. Never blocks; a dropped receiver means the client is
    /// gone and the event is discarded.
    pub fn emit(&self, event: ClusterEvent) {
        debug!("event: {}", event.name());
        let _ = self.tx.send(event);
    }
}
