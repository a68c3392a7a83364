//! View change collection and new-view computation.
//!
//! When the primary is suspected faulty, every replica broadcasts a
//! VIEW-CHANGE for the next view carrying its stable checkpoint proof and
//! the prepared certificates above it. The next primary collects 2f+1 of
//! them and re-proposes every prepared sequence in the new view; gaps
//! between the highest stable checkpoint and the highest prepared
//! sequence are filled with null no-op requests so sequence numbers are
//! never skipped.
//!
//! The proposal computation is deterministic over the collected set, so
//! backups recompute it from the NEW-VIEW message and accept only on
//! exact agreement.

use crate::ConsensusError;
use palisade_types::{
    NewViewMsg, NodeTable, PrePrepareMsg, PreparedProof, ReplicaId, RequestMsg, SeqNum, View,
    ViewChangeMsg,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Collects VIEW-CHANGE messages keyed by the view they ask for.
pub struct ViewChangeState {
    table: NodeTable,
    /// next view → sender → message. BTreeMap keeps iteration order
    /// deterministic, which the proposal computation relies on.
    collected: Mutex<BTreeMap<u64, BTreeMap<ReplicaId, ViewChangeMsg>>>,
}

impl ViewChangeState {
    pub fn new(table: NodeTable) -> Self {
        Self {
            table,
            collected: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build, record, and return our own VIEW-CHANGE for `next_view`.
    pub fn make_view_change(
        &self,
        next_view: View,
        stable_checkpoint: SeqNum,
        checkpoint_proof: Vec<palisade_types::CheckpointMsg>,
        prepared: BTreeMap<SeqNum, PreparedProof>,
    ) -> ViewChangeMsg {
        let msg = ViewChangeMsg {
            next_view,
            replica: self.table.my_id(),
            stable_checkpoint,
            checkpoint_proof,
            prepared,
        };
        self.collected
            .lock()
            .entry(next_view.0)
            .or_default()
            .insert(msg.replica, msg.clone());
        msg
    }

    /// Record a peer's VIEW-CHANGE. Returns the distinct-sender count for
    /// that view. Re-delivery replaces the sender's slot.
    pub fn record(&self, msg: ViewChangeMsg) -> Result<usize, ConsensusError> {
        if !self.table.contains(msg.replica) {
            return Err(ConsensusError::corrupt(format!(
                "view change from unknown replica {}",
                msg.replica
            )));
        }
        validate_prepared_proofs(&msg)?;

        let mut collected = self.collected.lock();
        let senders = collected.entry(msg.next_view.0).or_default();
        senders.insert(msg.replica, msg.clone());
        let count = senders.len();

        debug!(
            next_view = msg.next_view.0,
            from = %msg.replica,
            count = count,
            "View change recorded"
        );
        Ok(count)
    }

    /// Whether 2f+1 distinct replicas have asked for `next_view`.
    pub fn quorum_reached(&self, next_view: View) -> bool {
        self.collected
            .lock()
            .get(&next_view.0)
            .is_some_and(|senders| senders.len() >= self.table.commit_quorum())
    }

    /// The smallest view above `current` that f+1 distinct replicas have
    /// already asked for. A lagging replica joins that view change rather
    /// than waiting for its own timer.
    pub fn catchup_view(&self, current: View) -> Option<View> {
        let threshold = self.table.catchup_threshold();
        self.collected
            .lock()
            .iter()
            .find(|(view, senders)| **view > current.0 && senders.len() >= threshold)
            .map(|(view, _)| View(*view))
    }

    /// Assemble the NEW-VIEW for `next_view`. Only meaningful on the
    /// replica that will be primary there; returns `None` until 2f+1
    /// view changes (our own included) have been collected.
    pub fn build_new_view(&self, next_view: View) -> Option<NewViewMsg> {
        if self.table.primary_for(next_view) != self.table.my_id() {
            return None;
        }
        let view_changes: Vec<ViewChangeMsg> = {
            let collected = self.collected.lock();
            let senders = collected.get(&next_view.0)?;
            if senders.len() < self.table.commit_quorum() {
                return None;
            }
            senders.values().cloned().collect()
        };

        let pre_prepares = compute_proposal(next_view, &view_changes);
        info!(
            next_view = next_view.0,
            view_changes = view_changes.len(),
            reproposed = pre_prepares.len(),
            "Assembled new view"
        );

        Some(NewViewMsg {
            next_view,
            replica: self.table.my_id(),
            view_changes,
            pre_prepares,
        })
    }

    /// Validate a NEW-VIEW from the elected primary: 2f+1 distinct valid
    /// view changes for the announced view, and a proposal set identical
    /// to the one we recompute from them.
    pub fn verify_new_view(&self, msg: &NewViewMsg) -> Result<(), ConsensusError> {
        if self.table.primary_for(msg.next_view) != msg.replica {
            return Err(ConsensusError::corrupt(format!(
                "new view {} announced by {}, expected primary {}",
                msg.next_view,
                msg.replica,
                self.table.primary_for(msg.next_view)
            )));
        }

        let mut senders = BTreeMap::new();
        for vc in &msg.view_changes {
            if vc.next_view != msg.next_view {
                return Err(ConsensusError::corrupt(format!(
                    "new view {} carries a view change for {}",
                    msg.next_view, vc.next_view
                )));
            }
            if !self.table.contains(vc.replica) {
                return Err(ConsensusError::corrupt(format!(
                    "new view carries a view change from unknown replica {}",
                    vc.replica
                )));
            }
            validate_prepared_proofs(vc)?;
            senders.insert(vc.replica, ());
        }
        if senders.len() < self.table.commit_quorum() {
            return Err(ConsensusError::corrupt(format!(
                "new view {} carries {} distinct view changes, quorum is {}",
                msg.next_view,
                senders.len(),
                self.table.commit_quorum()
            )));
        }

        let expected = compute_proposal(msg.next_view, &msg.view_changes);
        if expected != msg.pre_prepares {
            warn!(next_view = msg.next_view.0, "New view proposal mismatch");
            return Err(ConsensusError::corrupt(format!(
                "new view {} proposal does not match the recomputed set",
                msg.next_view
            )));
        }
        Ok(())
    }

    /// Drop collection state for views at or below the adopted one.
    pub fn purge_through(&self, adopted: View) {
        self.collected.lock().retain(|view, _| *view > adopted.0);
    }
}

/// Ensure every prepared certificate in a view change is internally
/// consistent: the pre-prepare's digest must fingerprint its request and
/// the certificate must sit under its claimed sequence.
fn validate_prepared_proofs(msg: &ViewChangeMsg) -> Result<(), ConsensusError> {
    for (seq, proof) in &msg.prepared {
        if proof.pre_prepare.sequence != *seq {
            return Err(ConsensusError::corrupt(format!(
                "prepared certificate keyed at {} holds sequence {}",
                seq, proof.pre_prepare.sequence
            )));
        }
        if proof.pre_prepare.request.digest() != proof.pre_prepare.digest {
            return Err(ConsensusError::corrupt(format!(
                "prepared certificate at {} has a digest mismatch",
                seq
            )));
        }
        if *seq <= msg.stable_checkpoint {
            return Err(ConsensusError::corrupt(format!(
                "prepared certificate at {} is below the stable checkpoint {}",
                seq, msg.stable_checkpoint
            )));
        }
    }
    Ok(())
}

/// Compute the re-proposed pre-prepares for a new view.
///
/// `min_s` is the highest stable checkpoint across the collected view
/// changes; `max_s` the highest prepared sequence. Every sequence in
/// `(min_s, max_s]` is re-proposed: with the prepared certificate's
/// request where one exists, with the null request otherwise.
pub fn compute_proposal(next_view: View, view_changes: &[ViewChangeMsg]) -> Vec<PrePrepareMsg> {
    let min_s = view_changes
        .iter()
        .map(|vc| vc.stable_checkpoint.0)
        .max()
        .unwrap_or(0);
    let max_s = view_changes
        .iter()
        .flat_map(|vc| vc.prepared.keys().map(|seq| seq.0))
        .max()
        .unwrap_or(min_s);

    let mut proposal = Vec::new();
    for n in (min_s + 1)..=max_s {
        let seq = SeqNum(n);
        let certificate = view_changes.iter().find_map(|vc| vc.prepared.get(&seq));

        let pre_prepare = match certificate {
            Some(proof) => {
                let mut request = proof.pre_prepare.request.clone();
                request.sequence = Some(seq);
                PrePrepareMsg {
                    view: next_view,
                    sequence: seq,
                    digest: proof.digest(),
                    request,
                }
            }
            None => {
                let request = RequestMsg::null(seq);
                PrePrepareMsg {
                    view: next_view,
                    sequence: seq,
                    digest: request.digest(),
                    request,
                }
            }
        };
        proposal.push(pre_prepare);
    }
    proposal
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{NodeTable, ReplicaInfo, VoteKind, VoteMsg};
    use tracing_test::traced_test;

    fn table(my_id: u64) -> NodeTable {
        let replicas = (0..4)
            .map(|i| ReplicaInfo {
                id: ReplicaId(i),
                addr: format!("replica-{i}:4000"),
            })
            .collect();
        NodeTable::new(ReplicaId(my_id), replicas)
    }

    fn prepared_proof(view: u64, seq: u64) -> PreparedProof {
        let mut request = RequestMsg::new("client-a", seq, "x", vec![]);
        request.sequence = Some(SeqNum(seq));
        let digest = request.digest();
        let pre_prepare = PrePrepareMsg {
            view: View(view),
            sequence: SeqNum(seq),
            digest,
            request,
        };
        let prepares = (1..=2)
            .map(|i| VoteMsg {
                view: View(view),
                sequence: SeqNum(seq),
                digest,
                replica: ReplicaId(i),
                kind: VoteKind::Prepare,
            })
            .collect();
        PreparedProof {
            pre_prepare,
            prepares,
        }
    }

    fn view_change(replica: u64, next_view: u64, stable: u64, prepared_seqs: &[u64]) -> ViewChangeMsg {
        let prepared = prepared_seqs
            .iter()
            .map(|seq| (SeqNum(*seq), prepared_proof(next_view - 1, *seq)))
            .collect();
        ViewChangeMsg {
            next_view: View(next_view),
            replica: ReplicaId(replica),
            stable_checkpoint: SeqNum(stable),
            checkpoint_proof: vec![],
            prepared,
        }
    }

    #[traced_test]
    #[test]
    fn test_quorum_counts_distinct_senders() {
        let state = ViewChangeState::new(table(1));
        state.record(view_change(0, 1, 0, &[])).unwrap();
        state.record(view_change(2, 1, 0, &[])).unwrap();
        // Re-delivery from R2 does not add a sender.
        state.record(view_change(2, 1, 0, &[])).unwrap();
        assert!(!state.quorum_reached(View(1)));

        state.record(view_change(3, 1, 0, &[])).unwrap();
        assert!(state.quorum_reached(View(1)));
    }

    #[test]
    fn test_catchup_at_f_plus_one() {
        let state = ViewChangeState::new(table(0));
        state.record(view_change(1, 2, 0, &[])).unwrap();
        assert!(state.catchup_view(View(0)).is_none());

        state.record(view_change(2, 2, 0, &[])).unwrap();
        assert_eq!(state.catchup_view(View(0)), Some(View(2)));
        // Already past it: no catch-up needed.
        assert!(state.catchup_view(View(2)).is_none());
    }

    #[test]
    fn test_new_view_only_from_next_primary() {
        // View 1's primary is R1; R2 must never assemble the new view.
        let state = ViewChangeState::new(table(2));
        for replica in [0, 1, 3] {
            state.record(view_change(replica, 1, 0, &[])).unwrap();
        }
        assert!(state.quorum_reached(View(1)));
        assert!(state.build_new_view(View(1)).is_none());
    }

    #[test]
    fn test_proposal_fills_gaps_with_null_requests() {
        // Stable checkpoints up to 3, prepared certificates at 5 and 10:
        // sequences 4, 6, 7, 8, 9 become null requests.
        let view_changes = vec![
            view_change(0, 1, 3, &[5]),
            view_change(2, 1, 2, &[10]),
            view_change(3, 1, 3, &[]),
        ];
        let proposal = compute_proposal(View(1), &view_changes);

        assert_eq!(proposal.len(), 7);
        assert_eq!(proposal[0].sequence, SeqNum(4));
        assert!(proposal[0].request.is_null());
        assert!(!proposal[1].request.is_null());
        assert_eq!(proposal[1].sequence, SeqNum(5));
        for pp in &proposal[2..6] {
            assert!(pp.request.is_null(), "gap {} must be null", pp.sequence);
        }
        assert_eq!(proposal[6].sequence, SeqNum(10));
        assert!(!proposal[6].request.is_null());
        // Every proposal is stamped with the new view.
        assert!(proposal.iter().all(|pp| pp.view == View(1)));
    }

    #[test]
    fn test_reproposal_preserves_digest() {
        let view_changes = vec![view_change(0, 1, 2, &[3])];
        let proposal = compute_proposal(View(1), &view_changes);
        assert_eq!(proposal.len(), 1);
        assert_eq!(proposal[0].digest, view_changes[0].prepared[&SeqNum(3)].digest());
        assert_eq!(proposal[0].request.digest(), proposal[0].digest);
    }

    #[traced_test]
    #[test]
    fn test_build_and_verify_new_view() {
        // R1 is primary of view 1; it collects from R0, R3 plus its own.
        let primary_state = ViewChangeState::new(table(1));
        primary_state.record(view_change(0, 1, 0, &[2])).unwrap();
        primary_state.make_view_change(View(1), SeqNum(0), vec![], BTreeMap::new());
        primary_state.record(view_change(3, 1, 0, &[])).unwrap();

        let new_view = primary_state.build_new_view(View(1)).expect("quorum");
        assert_eq!(new_view.replica, ReplicaId(1));
        assert_eq!(new_view.pre_prepares.len(), 2);

        // A backup accepts it; a tampered proposal set is rejected.
        let backup_state = ViewChangeState::new(table(2));
        backup_state.verify_new_view(&new_view).unwrap();

        let mut tampered = new_view.clone();
        tampered.pre_prepares.pop();
        assert!(backup_state.verify_new_view(&tampered).is_err());

        let mut wrong_primary = new_view;
        wrong_primary.replica = ReplicaId(3);
        assert!(backup_state.verify_new_view(&wrong_primary).is_err());
    }

    #[test]
    fn test_rejects_inconsistent_certificates() {
        let state = ViewChangeState::new(table(0));
        let mut msg = view_change(1, 1, 4, &[5]);
        // Certificate below the claimed stable checkpoint.
        let proof = msg.prepared.remove(&SeqNum(5)).unwrap();
        msg.prepared.insert(SeqNum(5), proof);
        msg.stable_checkpoint = SeqNum(5);
        assert!(state.record(msg).is_err());
    }
}
