//! The running palisade replica.
//!
//! This crate wires the consensus state machines from
//! `palisade-consensus` into a live replica: a router classifying
//! inbound traffic, a pool of resolver workers driving the per-sequence
//! instances, an execution pipeline that applies committed operations in
//! strict sequence order, a checkpoint trigger, suspicion timers, and an
//! outbound dispatcher with bounded concurrency.
//!
//! # Message Flow
//!
//! ```text
//! transport → entrance → router → delivery → resolvers ──→ broadcast
//!                                               │
//!                                     committed pairs
//!                                               │
//!                                           executor ──→ replies, checkpoints
//! ```
//!
//! All I/O goes through two collaborator seams: [`Transport`] for the
//! wire and [`App`] for the deterministic application. The [`loopback`]
//! module provides in-memory implementations of both.

mod codec;
mod config;
mod dispatcher;
mod error;
mod executor;
pub mod loopback;
mod replica;
mod router;
mod timers;
mod traits;

pub use codec::{decode, encode, CodecError, WIRE_VERSION};
pub use config::ReplicaConfig;
pub use error::ReplicaError;
pub use replica::{Replica, ReplicaHandle, ViewPhase};
pub use traits::{App, Transport, TransportError};
