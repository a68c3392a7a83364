//! Consensus error taxonomy.

use palisade_types::SeqNum;
use thiserror::Error;

/// Failures surfaced by the consensus state machines.
///
/// Only `Corrupt` and `OutOfOrder` reach the router: corrupt input is
/// dropped, out-of-order input is re-queued with backoff. `Protocol` and
/// `Fatal` are observed through side channels.
#[derive(Debug, Clone, Error)]
pub enum ConsensusError {
    /// View, sequence, or digest mismatch, or malformed payload.
    /// The message is dropped; no state changes.
    #[error("corrupt message: {detail}")]
    Corrupt { detail: String },

    /// Message for an instance that does not exist yet or whose phase is
    /// not yet reachable. Re-queued with a small backoff.
    #[error("out of order for {seq}: {detail}")]
    OutOfOrder { seq: SeqNum, detail: String },

    /// Invariant violation local to one instance, e.g. a conflicting
    /// PRE-PREPARE in the same view. Fatal to the instance; kept as
    /// evidence.
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// Safety breach across instances. The replica halts.
    #[error("fatal safety violation: {detail}")]
    Fatal { detail: String },
}

impl ConsensusError {
    pub fn corrupt(detail: impl Into<String>) -> Self {
        ConsensusError::Corrupt {
            detail: detail.into(),
        }
    }

    pub fn out_of_order(seq: SeqNum, detail: impl Into<String>) -> Self {
        ConsensusError::OutOfOrder {
            seq,
            detail: detail.into(),
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        ConsensusError::Protocol {
            detail: detail.into(),
        }
    }

    /// Whether the router should re-queue the offending message.
    pub fn is_out_of_order(&self) -> bool {
        matches!(self, ConsensusError::OutOfOrder { .. })
    }

    /// Whether the message was malformed or inconsistent and is dropped.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, ConsensusError::Corrupt { .. })
    }
}
