//! Consensus state machines for the palisade replica.
//!
//! This crate holds the synchronous core of the protocol; all I/O is
//! performed by the replica runtime, which drives these state machines
//! and broadcasts whatever they emit.
//!
//! # Architecture
//!
//! - [`Instance`]: the three-phase exchange for one sequence number.
//!   PRE-PREPARE fixes a request, 2f matching PREPAREs make it prepared,
//!   2f+1 matching COMMITs make it committed.
//! - [`InstanceRegistry`]: thread-safe map from sequence number to
//!   instance; read-locked lookups, write-locked insert/purge.
//! - [`CheckpointEngine`]: collects CHECKPOINT messages, advances the
//!   stable watermark, and truncates everything at or below it.
//! - [`ViewChangeState`]: collects VIEW-CHANGE messages and computes
//!   (or verifies) the re-proposed ordering of a NEW-VIEW.
//!
//! # Safety
//!
//! - **One assignment per slot**: an instance accepts exactly one
//!   PRE-PREPARE digest for its `(view, sequence)`; a conflicting second
//!   assignment is refused and kept as equivocation evidence.
//!
//! - **Quorum intersection**: any two sets of 2f+1 replicas overlap in at
//!   least f+1, so two different requests can never both gather commit
//!   quorums for the same sequence.
//!
//! - **Certificate transfer**: a view change carries every prepared
//!   certificate above the stable checkpoint, and the new primary must
//!   re-propose each one at its original digest; backups verify the
//!   proposal by recomputing it.
//!
//! # Liveness
//!
//! - **Suspicion timeouts**: replicas that accepted a request but saw no
//!   commit initiate a view change; f+1 matching VIEW-CHANGE messages
//!   pull lagging replicas along.
//!
//! - **Null-request gap fill**: sequences the new primary cannot account
//!   for are re-proposed as no-ops, so execution never stalls on a gap.

mod checkpoint;
mod error;
mod instance;
mod registry;
mod view_change;

pub use checkpoint::{CheckpointEngine, CheckpointOutcome};
pub use error::ConsensusError;
pub use instance::{CheckpointState, Instance, Stage};
pub use registry::InstanceRegistry;
pub use view_change::{compute_proposal, ViewChangeState};
