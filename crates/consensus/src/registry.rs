//! Instance registry.
//!
//! Thread-safe map from sequence number to live [`Instance`]. Lookups are
//! read-locked so router shards proceed in parallel on different sequence
//! numbers; insert and purge take the write lock. Per-instance mutation
//! happens under each instance's own guard.

use crate::instance::Instance;
use palisade_types::{PreparedProof, ReplicaId, SeqNum, View};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Owns every live instance, indexed by sequence number.
pub struct InstanceRegistry {
    my_id: ReplicaId,
    f: usize,
    instances: RwLock<HashMap<u64, Arc<Instance>>>,
}

impl InstanceRegistry {
    pub fn new(my_id: ReplicaId, f: usize) -> Self {
        Self {
            my_id,
            f,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the instance for a sequence number.
    pub fn get(&self, sequence: SeqNum) -> Option<Arc<Instance>> {
        self.instances.read().get(&sequence.0).cloned()
    }

    /// Atomically return the existing instance or create a fresh idle one
    /// for `(view, sequence)` under the given primary.
    pub fn get_or_create(&self, sequence: SeqNum, view: View, primary: ReplicaId) -> Arc<Instance> {
        let mut instances = self.instances.write();
        instances
            .entry(sequence.0)
            .or_insert_with(|| {
                Arc::new(Instance::new(view, sequence, self.f, self.my_id, primary))
            })
            .clone()
    }

    /// Drop every instance with sequence ≤ `stable`. Called when a
    /// checkpoint stabilizes; no sequence at or below a stable checkpoint
    /// may stay live.
    pub fn purge_through(&self, stable: SeqNum) {
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|seq, instance| {
            if *seq <= stable.0 {
                instance.mark_checkpoint_stable();
                false
            } else {
                true
            }
        });
        let purged = before - instances.len();
        if purged > 0 {
            debug!(stable = stable.0, purged = purged, "Purged checkpointed instances");
        }
    }

    /// Drop every instance created for a view older than `view`. Called
    /// when a new view is adopted: in-flight sequences are re-proposed by
    /// the NEW-VIEW message, so the old-view instances are dead weight.
    pub fn purge_older_views(&self, view: View) {
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|_, instance| instance.view() >= view);
        let purged = before - instances.len();
        if purged > 0 {
            debug!(view = view.0, purged = purged, "Purged stale-view instances");
        }
    }

    /// Prepared certificates for every instance above `stable`, keyed by
    /// sequence. This is the P set a view change carries.
    pub fn prepared_above(&self, stable: SeqNum) -> BTreeMap<SeqNum, PreparedProof> {
        self.instances
            .read()
            .iter()
            .filter(|(seq, _)| **seq > stable.0)
            .filter_map(|(seq, instance)| {
                instance.prepared_proof().map(|proof| (SeqNum(*seq), proof))
            })
            .collect()
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Live sequence numbers, ascending.
    pub fn sequences(&self) -> Vec<SeqNum> {
        let mut seqs: Vec<u64> = self.instances.read().keys().copied().collect();
        seqs.sort_unstable();
        seqs.into_iter().map(SeqNum).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Stage;
    use palisade_types::RequestMsg;

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(ReplicaId(0), 1)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = registry();
        let a = registry.get_or_create(SeqNum(1), View(0), ReplicaId(0));
        let b = registry.get_or_create(SeqNum(1), View(0), ReplicaId(0));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(SeqNum(2)).is_none());
    }

    #[test]
    fn test_purge_through_removes_at_and_below() {
        let registry = registry();
        for seq in 1..=6 {
            registry.get_or_create(SeqNum(seq), View(0), ReplicaId(0));
        }
        let checkpointed = registry.get(SeqNum(5)).unwrap();
        assert_eq!(checkpointed.checkpoint_state(), crate::CheckpointState::Pending);

        registry.purge_through(SeqNum(5));
        assert_eq!(registry.sequences(), vec![SeqNum(6)]);
        assert_eq!(checkpointed.checkpoint_state(), crate::CheckpointState::Stable);
    }

    #[test]
    fn test_prepared_above_collects_certificates() {
        let registry = registry();

        // Drive seq 2 to prepared; leave seq 3 idle.
        let instance = registry.get_or_create(SeqNum(2), View(0), ReplicaId(0));
        let pp = instance
            .start_consensus(RequestMsg::new("c", 1, "x", vec![]))
            .unwrap();
        let vote = palisade_types::VoteMsg {
            view: pp.view,
            sequence: pp.sequence,
            digest: pp.digest,
            replica: ReplicaId(1),
            kind: palisade_types::VoteKind::Prepare,
        };
        instance.on_prepare(vote).unwrap();
        assert_eq!(instance.stage(), Stage::Prepared);
        registry.get_or_create(SeqNum(3), View(0), ReplicaId(0));

        let prepared = registry.prepared_above(SeqNum(0));
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[&SeqNum(2)].digest(), pp.digest);

        // Nothing above the would-be checkpoint at 2.
        assert!(registry.prepared_above(SeqNum(2)).is_empty());
    }
}
