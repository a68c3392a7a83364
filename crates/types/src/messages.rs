//! Protocol messages.
//!
//! One struct per wire message kind. Digest inputs are built as
//! domain-tagged, length-prefixed byte strings so every replica derives
//! identical fingerprints from identical logical content.

use crate::{Digest, ReplicaId, SeqNum, View};
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;

/// Operation name of the null request installed by view changes to fill
/// sequence gaps. Executing it is a no-op.
pub const NULL_OPERATION: &str = "<null>";

/// Domain tag for request digests.
const DOMAIN_REQUEST: &[u8] = b"request:";

/// A client request.
///
/// `sequence` is `None` until the primary assigns one; it is excluded
/// from the digest so the fingerprint is identical before and after
/// assignment.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestMsg {
    /// Client identity. Opaque to the protocol.
    pub client_id: String,
    /// Client-monotone timestamp, used for stale-request rejection.
    pub timestamp: u64,
    /// Operation to execute.
    pub operation: String,
    /// Operation payload.
    pub data: Vec<u8>,
    /// Sequence number, assigned by the primary.
    pub sequence: Option<SeqNum>,
}

impl RequestMsg {
    /// Create an unassigned request.
    pub fn new(
        client_id: impl Into<String>,
        timestamp: u64,
        operation: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            timestamp,
            operation: operation.into(),
            data,
            sequence: None,
        }
    }

    /// The null no-op request installed for gap sequence numbers during
    /// view change.
    pub fn null(sequence: SeqNum) -> Self {
        Self {
            client_id: String::new(),
            timestamp: 0,
            operation: NULL_OPERATION.to_string(),
            data: Vec::new(),
            sequence: Some(sequence),
        }
    }

    /// Whether this is the null no-op request.
    pub fn is_null(&self) -> bool {
        self.operation == NULL_OPERATION
    }

    /// Canonical digest of the request.
    ///
    /// Covers `(client_id, timestamp, operation, data)` with length
    /// prefixes on the variable-width fields; excludes `sequence`.
    pub fn digest(&self) -> Digest {
        let mut message = Vec::with_capacity(
            DOMAIN_REQUEST.len()
                + 8
                + 12
                + self.client_id.len()
                + self.operation.len()
                + self.data.len(),
        );
        message.extend_from_slice(DOMAIN_REQUEST);
        message.extend_from_slice(&(self.client_id.len() as u32).to_le_bytes());
        message.extend_from_slice(self.client_id.as_bytes());
        message.extend_from_slice(&self.timestamp.to_le_bytes());
        message.extend_from_slice(&(self.operation.len() as u32).to_le_bytes());
        message.extend_from_slice(self.operation.as_bytes());
        message.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        message.extend_from_slice(&self.data);
        Digest::of(&message)
    }
}

/// The primary's ordering assignment for one request.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepareMsg {
    pub view: View,
    pub sequence: SeqNum,
    pub digest: Digest,
    pub request: RequestMsg,
}

/// Vote phases of the three-phase exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum VoteKind {
    Prepare,
    Commit,
}

/// A PREPARE or COMMIT vote for `(view, sequence, digest)`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteMsg {
    pub view: View,
    pub sequence: SeqNum,
    pub digest: Digest,
    pub replica: ReplicaId,
    pub kind: VoteKind,
}

/// Reply sent to the client after local execution.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ReplyMsg {
    pub view: View,
    pub timestamp: u64,
    pub client_id: String,
    pub replica: ReplicaId,
    pub result: String,
}

/// Announcement that a replica has executed everything up to `sequence`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CheckpointMsg {
    pub sequence: SeqNum,
    pub digest: Digest,
    pub replica: ReplicaId,
}

/// A prepared certificate: the PRE-PREPARE plus 2f matching PREPAREs,
/// carried across view boundaries.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PreparedProof {
    pub pre_prepare: PrePrepareMsg,
    pub prepares: Vec<VoteMsg>,
}

impl PreparedProof {
    /// Digest the certificate vouches for.
    pub fn digest(&self) -> Digest {
        self.pre_prepare.digest
    }
}

/// A replica's declaration that the current primary should be replaced.
///
/// `prepared` maps each sequence number above the stable checkpoint that
/// this replica prepared to its certificate; `checkpoint_proof` carries
/// the 2f+1 CHECKPOINT messages backing `stable_checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChangeMsg {
    pub next_view: View,
    pub replica: ReplicaId,
    pub stable_checkpoint: SeqNum,
    pub checkpoint_proof: Vec<CheckpointMsg>,
    pub prepared: BTreeMap<SeqNum, PreparedProof>,
}

/// The new primary's proof of election plus the re-proposed ordering.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewViewMsg {
    pub next_view: View,
    pub replica: ReplicaId,
    pub view_changes: Vec<ViewChangeMsg>,
    pub pre_prepares: Vec<PrePrepareMsg>,
}
