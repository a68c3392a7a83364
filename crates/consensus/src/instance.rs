//! Per-sequence consensus instance.
//!
//! One [`Instance`] drives the three-phase exchange for a single sequence
//! number: PRE-PREPARE fixes the request, 2f matching PREPAREs make it
//! prepared, 2f+1 matching COMMITs make it committed. All mutation happens
//! under the instance's own guard, so the quorum test and the stage
//! transition are race-free against concurrent vote deliveries: the
//! transition fires exactly once, on the crossing vote.

use crate::ConsensusError;
use palisade_types::{
    PrePrepareMsg, PreparedProof, ReplicaId, ReplyMsg, RequestMsg, SeqNum, View, VoteKind, VoteMsg,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Progress of one instance through the three phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Idle,
    PrePrepared,
    Prepared,
    Committed,
}

/// Whether the instance's sequence has been folded into a stable
/// checkpoint yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Pending,
    Stable,
}

struct InstanceInner {
    stage: Stage,
    request: Option<RequestMsg>,
    pre_prepare: Option<PrePrepareMsg>,
    /// PREPARE votes by sender. The primary never sends PREPARE, so its
    /// slot is seeded with a tombstone (`None`) that counts as one
    /// distinct voter toward the 2f threshold.
    prepares: HashMap<ReplicaId, Option<VoteMsg>>,
    /// COMMIT votes by sender, the local replica's own included.
    commits: HashMap<ReplicaId, VoteMsg>,
    checkpoint_state: CheckpointState,
}

/// The consensus state machine for one sequence number.
pub struct Instance {
    view: View,
    sequence: SeqNum,
    /// Fault threshold `(n - 1) / 3` of the cluster this instance runs in.
    f: usize,
    my_id: ReplicaId,
    inner: Mutex<InstanceInner>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Instance")
            .field("view", &self.view)
            .field("sequence", &self.sequence)
            .field("stage", &inner.stage)
            .field("prepares", &inner.prepares.len())
            .field("commits", &inner.commits.len())
            .finish()
    }
}

impl Instance {
    /// Create an idle instance for `(view, sequence)`.
    pub fn new(view: View, sequence: SeqNum, f: usize, my_id: ReplicaId, primary: ReplicaId) -> Self {
        let mut prepares = HashMap::new();
        // The primary does not send PREPARE; seed its slot so the 2f
        // threshold counts it as one distinct voter.
        prepares.insert(primary, None);

        Self {
            view,
            sequence,
            f,
            my_id,
            inner: Mutex::new(InstanceInner {
                stage: Stage::Idle,
                request: None,
                pre_prepare: None,
                prepares,
                commits: HashMap::new(),
                checkpoint_state: CheckpointState::Pending,
            }),
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn sequence(&self) -> SeqNum {
        self.sequence
    }

    pub fn stage(&self) -> Stage {
        self.inner.lock().stage
    }

    /// Assign the sequence number to a client request and emit the
    /// PRE-PREPARE. Primary only; fails unless the instance is idle.
    pub fn start_consensus(&self, mut request: RequestMsg) -> Result<PrePrepareMsg, ConsensusError> {
        let mut inner = self.inner.lock();
        if inner.stage != Stage::Idle {
            return Err(ConsensusError::protocol(format!(
                "consensus already started for {} at stage {:?}",
                self.sequence, inner.stage
            )));
        }

        request.sequence = Some(self.sequence);
        let digest = request.digest();

        let pre_prepare = PrePrepareMsg {
            view: self.view,
            sequence: self.sequence,
            digest,
            request: request.clone(),
        };

        inner.request = Some(request);
        inner.pre_prepare = Some(pre_prepare.clone());
        inner.stage = Stage::PrePrepared;

        debug!(seq = self.sequence.0, view = self.view.0, %digest, "Assigned sequence to request");
        Ok(pre_prepare)
    }

    /// Accept the primary's ordering assignment and emit our PREPARE.
    /// Backups only. Returns `Ok(None)` when the identical assignment is
    /// re-delivered.
    pub fn on_pre_prepare(
        &self,
        pre_prepare: PrePrepareMsg,
    ) -> Result<Option<VoteMsg>, ConsensusError> {
        if pre_prepare.view != self.view {
            return Err(ConsensusError::corrupt(format!(
                "pre-prepare view {} does not match instance view {}",
                pre_prepare.view, self.view
            )));
        }
        if pre_prepare.sequence != self.sequence {
            return Err(ConsensusError::corrupt(format!(
                "pre-prepare sequence {} does not match instance {}",
                pre_prepare.sequence, self.sequence
            )));
        }
        if pre_prepare.request.digest() != pre_prepare.digest {
            return Err(ConsensusError::corrupt(format!(
                "pre-prepare digest {} does not match its request",
                pre_prepare.digest
            )));
        }

        let mut inner = self.inner.lock();
        if let Some(existing) = &inner.pre_prepare {
            if existing.digest != pre_prepare.digest {
                // Equivocating primary. Keep the first assignment as
                // evidence and refuse the second.
                return Err(ConsensusError::protocol(format!(
                    "conflicting pre-prepare for {} in {}: have {}, got {}",
                    self.sequence, self.view, existing.digest, pre_prepare.digest
                )));
            }
            trace!(seq = self.sequence.0, "Duplicate pre-prepare ignored");
            return Ok(None);
        }

        inner.request = Some(pre_prepare.request.clone());
        inner.pre_prepare = Some(pre_prepare.clone());
        inner.stage = Stage::PrePrepared;

        debug!(
            seq = self.sequence.0,
            view = self.view.0,
            digest = %pre_prepare.digest,
            "Accepted pre-prepare"
        );

        Ok(Some(VoteMsg {
            view: self.view,
            sequence: self.sequence,
            digest: pre_prepare.digest,
            replica: self.my_id,
            kind: VoteKind::Prepare,
        }))
    }

    /// Record a PREPARE vote. When the vote tips the 2f threshold the
    /// instance becomes prepared and emits our COMMIT (which is also
    /// recorded locally toward the commit quorum).
    pub fn on_prepare(&self, vote: VoteMsg) -> Result<Option<VoteMsg>, ConsensusError> {
        let mut inner = self.inner.lock();

        let Some(pre_prepare) = inner.pre_prepare.clone() else {
            return Err(ConsensusError::out_of_order(
                self.sequence,
                "prepare arrived before pre-prepare",
            ));
        };
        self.verify_vote(&vote, &pre_prepare)?;

        // Idempotent: a re-delivered vote replaces the entry without
        // changing the distinct-voter count.
        inner.prepares.insert(vote.replica, Some(vote.clone()));
        let distinct = inner.prepares.len();
        trace!(
            seq = self.sequence.0,
            voter = %vote.replica,
            distinct = distinct,
            "Prepare vote recorded"
        );

        if inner.stage >= Stage::Prepared {
            // Late vote from a slow peer; stored as view-change evidence.
            return Ok(None);
        }

        if inner.request.is_some() && distinct >= 2 * self.f {
            inner.stage = Stage::Prepared;

            let commit = VoteMsg {
                view: self.view,
                sequence: self.sequence,
                digest: pre_prepare.digest,
                replica: self.my_id,
                kind: VoteKind::Commit,
            };
            // Our own COMMIT counts toward the 2f+1 quorum the moment we
            // emit it.
            inner.commits.insert(self.my_id, commit.clone());

            debug!(seq = self.sequence.0, view = self.view.0, "Prepared");
            return Ok(Some(commit));
        }

        Ok(None)
    }

    /// Record a COMMIT vote. When the vote tips the 2f+1 threshold the
    /// instance commits and yields the reply template paired with the
    /// committed request.
    ///
    /// A commit reaching an unprepared instance is corrupt; the router
    /// holds commits back until the prepared phase is reachable.
    pub fn on_commit(&self, vote: VoteMsg) -> Result<Option<(ReplyMsg, RequestMsg)>, ConsensusError> {
        let mut inner = self.inner.lock();

        if inner.stage < Stage::Prepared {
            return Err(ConsensusError::corrupt(format!(
                "commit for {} arrived before the instance prepared",
                self.sequence
            )));
        }
        let pre_prepare = inner
            .pre_prepare
            .clone()
            .expect("prepared instance always holds a pre-prepare");
        self.verify_vote(&vote, &pre_prepare)?;

        inner.commits.insert(vote.replica, vote.clone());
        let distinct = inner.commits.len();
        trace!(
            seq = self.sequence.0,
            voter = %vote.replica,
            distinct = distinct,
            "Commit vote recorded"
        );

        if inner.stage >= Stage::Committed {
            return Ok(None);
        }

        if distinct >= 2 * self.f + 1 {
            inner.stage = Stage::Committed;
            let request = inner
                .request
                .clone()
                .expect("prepared instance always holds a request");

            debug!(seq = self.sequence.0, view = self.view.0, "Committed");

            let reply = ReplyMsg {
                view: self.view,
                timestamp: request.timestamp,
                client_id: request.client_id.clone(),
                replica: self.my_id,
                // Filled by the execution pipeline once the operation runs.
                result: String::new(),
            };
            return Ok(Some((reply, request)));
        }

        Ok(None)
    }

    fn verify_vote(&self, vote: &VoteMsg, pre_prepare: &PrePrepareMsg) -> Result<(), ConsensusError> {
        if vote.view != self.view {
            return Err(ConsensusError::corrupt(format!(
                "vote view {} does not match instance view {} (from {})",
                vote.view, self.view, vote.replica
            )));
        }
        if vote.sequence != self.sequence {
            return Err(ConsensusError::corrupt(format!(
                "vote sequence {} does not match instance {} (from {})",
                vote.sequence, self.sequence, vote.replica
            )));
        }
        if vote.digest != pre_prepare.digest {
            return Err(ConsensusError::corrupt(format!(
                "vote digest {} does not match accepted digest {} (from {})",
                vote.digest, pre_prepare.digest, vote.replica
            )));
        }
        Ok(())
    }

    /// The prepared certificate for this instance, once it exists.
    /// Carries the real PREPARE votes recorded so far (the primary's
    /// seeded slot holds no message and is omitted).
    pub fn prepared_proof(&self) -> Option<PreparedProof> {
        let inner = self.inner.lock();
        if inner.stage < Stage::Prepared {
            return None;
        }
        let pre_prepare = inner.pre_prepare.clone()?;
        let prepares = inner
            .prepares
            .values()
            .filter_map(|v| v.clone())
            .collect();
        Some(PreparedProof {
            pre_prepare,
            prepares,
        })
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        self.inner.lock().checkpoint_state
    }

    /// Mark the instance as covered by a stable checkpoint. The registry
    /// purges it right after.
    pub fn mark_checkpoint_stable(&self) {
        self.inner.lock().checkpoint_state = CheckpointState::Stable;
    }

    #[cfg(test)]
    pub(crate) fn vote_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.prepares.len(), inner.commits.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::Digest;
    use tracing_test::traced_test;

    const F: usize = 1;

    fn request() -> RequestMsg {
        RequestMsg::new("client-a", 1, "x", vec![])
    }

    /// A backup instance that has accepted the primary's pre-prepare.
    fn pre_prepared_backup() -> (Instance, PrePrepareMsg) {
        let primary = Instance::new(View(0), SeqNum(1), F, ReplicaId(0), ReplicaId(0));
        let pre_prepare = primary.start_consensus(request()).unwrap();

        let backup = Instance::new(View(0), SeqNum(1), F, ReplicaId(3), ReplicaId(0));
        let prepare = backup.on_pre_prepare(pre_prepare.clone()).unwrap();
        assert!(prepare.is_some());
        (backup, pre_prepare)
    }

    fn prepare_from(id: u64, pp: &PrePrepareMsg) -> VoteMsg {
        VoteMsg {
            view: pp.view,
            sequence: pp.sequence,
            digest: pp.digest,
            replica: ReplicaId(id),
            kind: VoteKind::Prepare,
        }
    }

    fn commit_from(id: u64, pp: &PrePrepareMsg) -> VoteMsg {
        VoteMsg {
            view: pp.view,
            sequence: pp.sequence,
            digest: pp.digest,
            replica: ReplicaId(id),
            kind: VoteKind::Commit,
        }
    }

    #[test]
    fn test_start_consensus_assigns_sequence() {
        let primary = Instance::new(View(0), SeqNum(7), F, ReplicaId(0), ReplicaId(0));
        let pp = primary.start_consensus(request()).unwrap();
        assert_eq!(pp.sequence, SeqNum(7));
        assert_eq!(pp.request.sequence, Some(SeqNum(7)));
        assert_eq!(primary.stage(), Stage::PrePrepared);

        // A second start on the same instance is a protocol violation.
        assert!(primary.start_consensus(request()).is_err());
    }

    #[traced_test]
    #[test]
    fn test_prepare_quorum_counts_primary_seed() {
        let (backup, pp) = pre_prepared_backup();

        // Seed alone (1 distinct) is below 2f = 2; one backup vote tips it.
        let commit = backup.on_prepare(prepare_from(1, &pp)).unwrap();
        assert!(commit.is_some());
        assert_eq!(backup.stage(), Stage::Prepared);
        assert_eq!(commit.unwrap().kind, VoteKind::Commit);
    }

    #[test]
    fn test_duplicate_prepare_does_not_double_count() {
        let (backup, pp) = pre_prepared_backup();

        // The same node voting twice stays one distinct voter.
        let pre_prepare_digest = pp.digest;
        let mut duplicate = prepare_from(1, &pp);
        duplicate.digest = pre_prepare_digest;
        // First delivery does not reach quorum by itself? It does (seed +
        // R1 = 2f), so feed the duplicate first through a fresh instance
        // that never saw R1.
        let primary = Instance::new(View(0), SeqNum(1), F, ReplicaId(0), ReplicaId(0));
        let pp2 = primary.start_consensus(request()).unwrap();
        // Primary seed tombstone is replaced, not added, by a vote from
        // the primary id itself.
        let from_primary = prepare_from(0, &pp2);
        assert!(primary.on_prepare(from_primary.clone()).unwrap().is_none());
        assert!(primary.on_prepare(from_primary).unwrap().is_none());
        let (prepares, _) = primary.vote_counts();
        assert_eq!(prepares, 1);

        // And on the backup: duplicate votes from R1 fire the transition
        // exactly once.
        let commit = backup.on_prepare(duplicate.clone()).unwrap();
        assert!(commit.is_some());
        assert!(backup.on_prepare(duplicate).unwrap().is_none());
        let (prepares, _) = backup.vote_counts();
        assert_eq!(prepares, 2);
    }

    #[test]
    fn test_commit_before_prepared_is_corrupt() {
        let (backup, pp) = pre_prepared_backup();
        let err = backup.on_commit(commit_from(1, &pp)).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[traced_test]
    #[test]
    fn test_commit_quorum_includes_own_commit() {
        let (backup, pp) = pre_prepared_backup();
        backup.on_prepare(prepare_from(1, &pp)).unwrap();

        // Own commit was recorded on the prepared transition; two peer
        // commits reach 2f+1 = 3.
        assert!(backup.on_commit(commit_from(0, &pp)).unwrap().is_none());
        let committed = backup.on_commit(commit_from(1, &pp)).unwrap();
        let (reply, req) = committed.expect("third distinct commit must commit");
        assert_eq!(backup.stage(), Stage::Committed);
        assert_eq!(reply.client_id, "client-a");
        assert_eq!(req.sequence, Some(SeqNum(1)));

        // Late commits are stored but do not re-fire.
        assert!(backup.on_commit(commit_from(2, &pp)).unwrap().is_none());
        let (_, commits) = backup.vote_counts();
        assert_eq!(commits, 4);
    }

    #[test]
    fn test_vote_with_wrong_digest_is_corrupt() {
        let (backup, pp) = pre_prepared_backup();
        let mut bad = prepare_from(1, &pp);
        bad.digest = Digest::of(b"something else");
        let err = backup.on_prepare(bad).unwrap_err();
        assert!(matches!(err, ConsensusError::Corrupt { .. }));
    }

    #[test]
    fn test_conflicting_pre_prepare_is_rejected() {
        let (backup, pp) = pre_prepared_backup();

        let mut other = RequestMsg::new("client-b", 9, "y", vec![]);
        other.sequence = Some(pp.sequence);
        let conflicting = PrePrepareMsg {
            view: pp.view,
            sequence: pp.sequence,
            digest: other.digest(),
            request: other,
        };
        let err = backup.on_pre_prepare(conflicting).unwrap_err();
        assert!(matches!(err, ConsensusError::Protocol { .. }));

        // The identical assignment is an idempotent no-op.
        assert!(backup.on_pre_prepare(pp).unwrap().is_none());
    }

    #[test]
    fn test_mismatched_digest_pre_prepare_is_corrupt() {
        let backup = Instance::new(View(0), SeqNum(1), F, ReplicaId(1), ReplicaId(0));
        let mut req = request();
        req.sequence = Some(SeqNum(1));
        let lying = PrePrepareMsg {
            view: View(0),
            sequence: SeqNum(1),
            digest: Digest::of(b"not the request"),
            request: req,
        };
        let err = backup.on_pre_prepare(lying).unwrap_err();
        assert!(matches!(err, ConsensusError::Corrupt { .. }));
        assert_eq!(backup.stage(), Stage::Idle);
    }

    #[test]
    fn test_prepared_proof_carries_real_votes() {
        let (backup, pp) = pre_prepared_backup();
        assert!(backup.prepared_proof().is_none());

        backup.on_prepare(prepare_from(1, &pp)).unwrap();
        let proof = backup.prepared_proof().expect("prepared");
        assert_eq!(proof.pre_prepare, pp);
        // The primary's seeded slot holds no message.
        assert_eq!(proof.prepares.len(), 1);
        assert_eq!(proof.prepares[0].replica, ReplicaId(1));
    }
}
