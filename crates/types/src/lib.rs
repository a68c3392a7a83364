//! Core types for the palisade replication protocol.
//!
//! This crate provides the foundational types used throughout the replica
//! implementation:
//!
//! - **Primitives**: [`Digest`] and its canonical byte-string construction
//! - **Identifiers**: [`ReplicaId`], [`View`], [`SeqNum`]
//! - **Membership**: [`NodeTable`] with quorum arithmetic and primary rotation
//! - **Protocol messages**: one struct per wire message kind, plus the
//!   [`InboundMsg`] sum the router dispatches on
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crate, making it the foundation layer. Everything
//! here is passive data; the state machines live in `palisade-consensus` and
//! the running tasks in `palisade-replica`.

mod digest;
mod ids;
mod inbound;
mod messages;
mod node_table;

pub use digest::Digest;
pub use ids::{ReplicaId, SeqNum, View};
pub use inbound::InboundMsg;
pub use messages::{
    CheckpointMsg, NewViewMsg, PrePrepareMsg, PreparedProof, ReplyMsg, RequestMsg, ViewChangeMsg,
    VoteKind, VoteMsg, NULL_OPERATION,
};
pub use node_table::{NodeTable, ReplicaInfo};
