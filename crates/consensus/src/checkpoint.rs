//! Checkpoint engine and watermarks.
//!
//! Every K executed requests the replica broadcasts a CHECKPOINT and logs
//! a copy for itself. A checkpoint at sequence `s` becomes **stable** when
//! the log holds our own CHECKPOINT for `s` plus 2f+1 entries whose
//! digests match ours; everything at or below `s` is then garbage.
//!
//! The stable sequence is published through an atomic so the hot path can
//! test the watermark window without taking the log lock.

use palisade_types::{CheckpointMsg, Digest, ReplicaId, SeqNum};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Outcome of logging one CHECKPOINT message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Logged; not stable yet.
    Logged,
    /// This message made the checkpoint stable. The caller must purge the
    /// instance registry through the returned sequence.
    NewlyStable(SeqNum),
}

/// Collects CHECKPOINT messages and advances the stable watermark.
pub struct CheckpointEngine {
    my_id: ReplicaId,
    f: usize,
    /// Watermark window width: pre-prepares are admitted for sequences in
    /// `(stable, stable + window]`.
    window: u64,
    stable: AtomicU64,
    log: Mutex<BTreeMap<u64, HashMap<ReplicaId, CheckpointMsg>>>,
}

impl CheckpointEngine {
    pub fn new(my_id: ReplicaId, f: usize, window: u64) -> Self {
        Self {
            my_id,
            f,
            window,
            stable: AtomicU64::new(0),
            log: Mutex::new(BTreeMap::new()),
        }
    }

    /// The stable checkpoint sequence. Lock-free.
    pub fn stable(&self) -> SeqNum {
        SeqNum(self.stable.load(Ordering::Acquire))
    }

    /// Whether a sequence number falls inside the acceptance window
    /// `(stable, stable + window]`.
    pub fn in_window(&self, sequence: SeqNum) -> bool {
        let stable = self.stable.load(Ordering::Acquire);
        sequence.0 > stable && sequence.0 <= stable + self.window
    }

    /// Build the local CHECKPOINT for `sequence` with the digest of the
    /// execution state (the last executed request's fingerprint).
    pub fn make_checkpoint(&self, sequence: SeqNum, digest: Digest) -> CheckpointMsg {
        CheckpointMsg {
            sequence,
            digest,
            replica: self.my_id,
        }
    }

    /// Log a CHECKPOINT message (our own included) and advance the stable
    /// watermark when the quorum condition holds.
    ///
    /// Stability requires our own checkpoint for the sequence to be
    /// present, plus 2f+1 logged entries agreeing with our digest.
    pub fn on_checkpoint(&self, msg: CheckpointMsg) -> CheckpointOutcome {
        let mut log = self.log.lock();

        let seq = msg.sequence;
        let entry = log.entry(seq.0).or_default();
        // Idempotent replace: one slot per replica.
        entry.insert(msg.replica, msg);

        let stable_now = self.stable.load(Ordering::Acquire);
        if seq.0 <= stable_now {
            return CheckpointOutcome::Logged;
        }

        let Some(own) = entry.get(&self.my_id) else {
            return CheckpointOutcome::Logged;
        };
        let own_digest = own.digest;
        let matching = entry
            .values()
            .filter(|m| m.digest == own_digest)
            .count();

        debug!(
            seq = seq.0,
            matching = matching,
            quorum = 2 * self.f + 1,
            "Checkpoint logged"
        );

        if matching < 2 * self.f + 1 {
            return CheckpointOutcome::Logged;
        }

        // Stable: raise the watermark and truncate the log below it.
        self.stable.store(seq.0, Ordering::Release);
        let retained = log.split_off(&seq.0);
        *log = retained;

        info!(stable = seq.0, "Checkpoint stable, watermark raised");
        CheckpointOutcome::NewlyStable(seq)
    }

    /// The 2f+1 matching CHECKPOINT proofs for the current stable
    /// sequence, carried in view-change messages. Empty at the initial
    /// watermark, where no checkpoint has been taken yet.
    pub fn stable_proof(&self) -> Vec<CheckpointMsg> {
        let stable = self.stable.load(Ordering::Acquire);
        if stable == 0 {
            return Vec::new();
        }
        let log = self.log.lock();
        let Some(entry) = log.get(&stable) else {
            return Vec::new();
        };
        let Some(own) = entry.get(&self.my_id) else {
            return Vec::new();
        };
        let own_digest = own.digest;
        entry
            .values()
            .filter(|m| m.digest == own_digest)
            .cloned()
            .collect()
    }

    /// Logged sequence numbers, ascending.
    pub fn logged_sequences(&self) -> Vec<SeqNum> {
        self.log.lock().keys().map(|s| SeqNum(*s)).collect()
    }
}
