//! Errors reported on the replica's side channel.

use crate::codec::CodecError;
use crate::traits::TransportError;
use palisade_consensus::ConsensusError;
use thiserror::Error;

/// Everything that flows into the error channel.
///
/// These never cross back into the consensus path; the error logger
/// drains them, and repeated bursts trigger cooling.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("message dropped after {attempts} delivery attempts: {detail}")]
    RetriesExhausted { attempts: u32, detail: String },
}
