/// Unified error handling for the veleta client
///
/// Per-member probe failures are always recovered locally by the topology
/// monitor and never escape the probe loop; routing failures are surfaced
/// to the caller that issued the operation. The only globally fatal
/// condition is an explicit client close.
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::Endpoint;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// A probe or operation exceeded its configured timeout
    #[error("operation `{operation}` timed out after {waited_ms}ms against {endpoint}")]
    ConnectionTimeout {
        endpoint: Endpoint,
        operation: String,
        waited_ms: u64,
    },

    /// A member failed three consecutive probes and was downgraded
    #[error("member {endpoint} unreachable after {failures} consecutive probe failures")]
    NodeUnreachable { endpoint: Endpoint, failures: u32 },

    /// A probed node disagrees on set identity; the probe result is discarded
    #[error("member {endpoint} reports set `{reported}`, expected `{expected}`")]
    SetNameMismatch {
        endpoint: Endpoint,
        expected: String,
        reported: String,
    },

    /// Routing could not find a primary within the operation wait deadline
    #[error("no primary available within the operation wait deadline")]
    NoPrimaryAvailable,

    /// Routing could not satisfy the requested read preference in time
    #[error("no secondary available within the operation wait deadline")]
    NoSecondaryAvailable,

    /// Internal guard: a selection was computed against a superseded snapshot
    #[error("selection computed against superseded snapshot {computed} (latest {latest})")]
    StaleSnapshot { computed: u64, latest: u64 },

    /// A write was not acknowledged by the required number of members
    #[error("write acknowledged by {acknowledged} members, {required} required")]
    WriteConcernUnsatisfied { required: u32, acknowledged: u32 },

    /// The client has been closed; all pending waits are cancelled
    #[error("client is closed")]
    Closed,

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Network-related errors
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Wire protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// Create a timeout error for an operation against a member
    pub fn timeout<S: Into<String>>(endpoint: Endpoint, operation: S, waited_ms: u64) -> Self {
        ClientError::ConnectionTimeout {
            endpoint,
            operation: operation.into(),
            waited_ms,
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ClientError::Protocol(message.into())
    }

    /// Check if the caller may retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionTimeout { .. }
                | ClientError::NodeUnreachable { .. }
                | ClientError::NoPrimaryAvailable
                | ClientError::NoSecondaryAvailable
                | ClientError::StaleSnapshot { .. }
                | ClientError::Network(_)
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}
