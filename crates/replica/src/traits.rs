//! Collaborator seams: the transport and the application.

use thiserror::Error;

/// Failure to hand a message to the network.
#[derive(Debug, Clone, Error)]
#[error("send to {addr}{path} failed: {detail}")]
pub struct TransportError {
    pub addr: String,
    pub path: String,
    pub detail: String,
}

/// The wire the replica speaks through.
///
/// One logical endpoint per message kind; the dispatcher calls `send`
/// with the already-encoded frame. Implementations must not block
/// indefinitely: the dispatcher bounds concurrency, not send latency.
pub trait Transport: Send + Sync {
    fn send(&self, addr: &str, path: &str, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// The deterministic application the ordered operations run against.
///
/// `execute` must be deterministic and side-effect-free with respect to
/// consensus state: every non-faulty replica calls it with the same
/// operations in the same order and must obtain the same results.
pub trait App: Send + Sync {
    fn execute(&self, operation: &str, data: &[u8]) -> String;
}
