//! The replica: one value owning every channel, registry, and task.
//!
//! # Task layout
//!
//! - **router** (1): acceptance filtering, forwards to the resolver pool
//! - **resolvers** (5, tunable): drive the consensus state machines and
//!   broadcast whatever they emit
//! - **executor** (1): ordered execution pipeline and checkpoint trigger
//! - **dispatcher** (1): outbound sends with bounded concurrency
//! - **error logger** (1): drains the error channel, cools on bursts
//! - **control** (1): suspicion fires and view-change triggers
//!
//! All channels are bounded; the consensus path never blocks on anything
//! but its own bounded channels.

use crate::codec::{self, CodecError};
use crate::config::ReplicaConfig;
use crate::dispatcher::{spawn_dispatcher, spawn_error_logger, Outbound};
use crate::error::ReplicaError;
use crate::executor::spawn_executor;
use crate::router::{spawn_router, Delivery};
use crate::timers::{Control, TimerManager};
use crate::traits::{App, Transport};
use palisade_consensus::{
    CheckpointEngine, CheckpointOutcome, ConsensusError, InstanceRegistry, Stage, ViewChangeState,
};
use palisade_types::{
    CheckpointMsg, Digest, InboundMsg, NewViewMsg, NodeTable, PrePrepareMsg, ReplicaId, ReplyMsg,
    RequestMsg, SeqNum, View, ViewChangeMsg, VoteMsg,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Whether the replica is operating normally or mid view change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    Normal,
    Changing { next: View },
}

struct ViewStatus {
    current: View,
    phase: ViewPhase,
}

/// Shared replica state; every task holds an `Arc` to this.
pub(crate) struct Core {
    pub table: NodeTable,
    pub config: ReplicaConfig,
    pub registry: InstanceRegistry,
    pub checkpoints: CheckpointEngine,
    pub view_changes: ViewChangeState,
    pub app: Arc<dyn App>,

    view: Mutex<ViewStatus>,
    /// Last VIEW-CHANGE we broadcast, kept for rebroadcast on repeated
    /// suspicion while the change is still pending.
    own_view_change: Mutex<Option<ViewChangeMsg>>,
    /// The primary's assignment counter. Guarded together with the
    /// watermark check so assignment never races past the window.
    next_sequence: Mutex<u64>,

    /// Written only by the executor task.
    pub last_executed: AtomicU64,
    pub committed: Mutex<Vec<RequestMsg>>,
    /// client id → timestamp of the last reply sent. Written by the
    /// executor, read at the request boundary.
    pub client_replies: Mutex<HashMap<String, u64>>,
    pub timers: Mutex<TimerManager>,

    entrance_tx: mpsc::Sender<Delivery>,
    execution_tx: mpsc::Sender<(ReplyMsg, RequestMsg)>,
    outbound_tx: mpsc::Sender<Outbound>,
    error_tx: mpsc::Sender<ReplicaError>,
}

impl Core {
    pub fn current_view(&self) -> View {
        self.view.lock().current
    }

    pub fn phase(&self) -> ViewPhase {
        self.view.lock().phase
    }

    /// Report an error on the side channel. Never blocks; a full channel
    /// drops the report rather than stalling consensus.
    pub fn report(&self, err: ReplicaError) {
        let _ = self.error_tx.try_send(err);
    }

    /// Encode a message once and queue one frame per peer.
    pub async fn broadcast(&self, msg: &InboundMsg) {
        let bytes = match codec::encode(msg) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.report(err.into());
                return;
            }
        };
        let path = msg.path();
        for peer in self.table.peers() {
            let frame = Outbound {
                addr: peer.addr.clone(),
                path,
                bytes: bytes.clone(),
            };
            if self.outbound_tx.send(frame).await.is_err() {
                return;
            }
        }
    }

    /// Resolver entry point: dispatch one routed message, re-queueing it
    /// with backoff when it raced ahead of its instance.
    pub(crate) async fn handle(&self, delivery: Delivery) {
        let result = match delivery.msg.clone() {
            InboundMsg::Request(req) => self.on_request(req).await,
            InboundMsg::PrePrepare(pp) => self.on_pre_prepare(pp).await,
            InboundMsg::Prepare(vote) => self.on_prepare(vote).await,
            InboundMsg::Commit(vote) => self.on_commit(vote).await,
            InboundMsg::Reply(reply) => {
                debug!(from = %reply.replica, client = %reply.client_id, "Observed reply");
                Ok(())
            }
            InboundMsg::Checkpoint(msg) => self.on_checkpoint(msg),
            InboundMsg::ViewChange(vc) => self.on_view_change(vc).await,
            InboundMsg::NewView(nv) => self.on_new_view(nv).await,
        };

        match result {
            Ok(()) => {}
            Err(err) if err.is_out_of_order() => self.requeue(delivery, err),
            Err(err) => self.report(err.into()),
        }
    }

    /// Re-enqueue a message that arrived ahead of its instance, after a
    /// small backoff. Dropped once the retry budget is spent.
    fn requeue(&self, delivery: Delivery, err: ConsensusError) {
        if delivery.attempts >= self.config.retry_budget {
            self.report(ReplicaError::RetriesExhausted {
                attempts: delivery.attempts,
                detail: err.to_string(),
            });
            return;
        }
        trace!(
            kind = delivery.msg.type_name(),
            attempts = delivery.attempts,
            "Re-queueing early message"
        );
        let entrance_tx = self.entrance_tx.clone();
        let backoff = self.config.retry_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = entrance_tx
                .send(Delivery {
                    msg: delivery.msg,
                    attempts: delivery.attempts + 1,
                })
                .await;
        });
    }

    // ═══════════════════════════════════════════════════════════════════
    // Consensus handlers
    // ═══════════════════════════════════════════════════════════════════

    async fn on_request(&self, req: RequestMsg) -> Result<(), ConsensusError> {
        if req.is_null() {
            return Err(ConsensusError::corrupt("null request from a client"));
        }

        // Exactly-once hint: drop requests not newer than the last reply
        // sent to this client.
        {
            let replies = self.client_replies.lock();
            if let Some(last) = replies.get(&req.client_id) {
                if req.timestamp <= *last {
                    debug!(client = %req.client_id, ts = req.timestamp, "Dropped stale request");
                    return Ok(());
                }
            }
        }

        let digest = req.digest();
        self.timers
            .lock()
            .set(digest, self.config.suspicion_timeout);

        let view = self.current_view();
        if !self.table.is_primary(view) {
            return Ok(());
        }

        // Assign the next sequence number, but only inside the watermark
        // window; buffering beyond it is forbidden.
        let sequence = {
            let mut next = self.next_sequence.lock();
            let candidate = SeqNum(*next + 1);
            if !self.checkpoints.in_window(candidate) {
                warn!(
                    seq = candidate.0,
                    stable = self.checkpoints.stable().0,
                    "Assignment outside the watermark window, dropping request"
                );
                return Ok(());
            }
            *next = candidate.0;
            candidate
        };

        let instance = self
            .registry
            .get_or_create(sequence, view, self.table.my_id());
        let pre_prepare = instance.start_consensus(req)?;
        debug!(seq = sequence.0, view = view.0, "Broadcasting pre-prepare");
        self.broadcast(&InboundMsg::PrePrepare(pre_prepare)).await;
        Ok(())
    }

    async fn on_pre_prepare(&self, pp: PrePrepareMsg) -> Result<(), ConsensusError> {
        let view = self.current_view();
        if pp.view < view {
            debug!(seq = pp.sequence.0, view = pp.view.0, "Dropped old-view pre-prepare");
            return Ok(());
        }
        if pp.view > view {
            // The NEW-VIEW announcing that view may still be in flight.
            return Err(ConsensusError::out_of_order(
                pp.sequence,
                "pre-prepare for a future view",
            ));
        }
        if !self.checkpoints.in_window(pp.sequence) {
            debug!(
                seq = pp.sequence.0,
                stable = self.checkpoints.stable().0,
                "Pre-prepare outside the watermark window"
            );
            return Ok(());
        }

        let request_digest = pp.request.digest();
        let is_null = pp.request.is_null();
        let instance =
            self.registry
                .get_or_create(pp.sequence, pp.view, self.table.primary_for(pp.view));
        if let Some(prepare) = instance.on_pre_prepare(pp)? {
            if !is_null {
                self.timers
                    .lock()
                    .set(request_digest, self.config.suspicion_timeout);
            }
            self.broadcast(&InboundMsg::from_vote(prepare)).await;
        }
        Ok(())
    }

    async fn on_prepare(&self, vote: VoteMsg) -> Result<(), ConsensusError> {
        let view = self.current_view();
        if vote.view < view {
            debug!(seq = vote.sequence.0, "Dropped old-view prepare");
            return Ok(());
        }
        if vote.view > view {
            return Err(ConsensusError::out_of_order(
                vote.sequence,
                "prepare for a future view",
            ));
        }

        let Some(instance) = self.registry.get(vote.sequence) else {
            return Err(ConsensusError::out_of_order(
                vote.sequence,
                "prepare before any instance exists",
            ));
        };
        if let Some(commit) = instance.on_prepare(vote)? {
            self.broadcast(&InboundMsg::from_vote(commit)).await;
        }
        Ok(())
    }

    async fn on_commit(&self, vote: VoteMsg) -> Result<(), ConsensusError> {
        let view = self.current_view();
        if vote.view < view {
            debug!(seq = vote.sequence.0, "Dropped old-view commit");
            return Ok(());
        }
        if vote.view > view {
            return Err(ConsensusError::out_of_order(
                vote.sequence,
                "commit for a future view",
            ));
        }

        let Some(instance) = self.registry.get(vote.sequence) else {
            return Err(ConsensusError::out_of_order(
                vote.sequence,
                "commit before any instance exists",
            ));
        };
        // The commit phase is reachable only once the instance has
        // prepared; hold earlier arrivals back. Stages never regress, so
        // a commit passing this check cannot find the instance unprepared.
        if instance.stage() < Stage::Prepared {
            return Err(ConsensusError::out_of_order(
                vote.sequence,
                "commit before the instance prepared",
            ));
        }
        if let Some(pair) = instance.on_commit(vote)? {
            if self.execution_tx.send(pair).await.is_err() {
                warn!("Execution pipeline is gone");
            }
        }
        Ok(())
    }

    fn on_checkpoint(&self, msg: CheckpointMsg) -> Result<(), ConsensusError> {
        if !self.table.contains(msg.replica) {
            return Err(ConsensusError::corrupt(format!(
                "checkpoint from unknown replica {}",
                msg.replica
            )));
        }
        if let CheckpointOutcome::NewlyStable(stable) = self.checkpoints.on_checkpoint(msg) {
            self.registry.purge_through(stable);
        }
        Ok(())
    }

    async fn on_view_change(&self, vc: ViewChangeMsg) -> Result<(), ConsensusError> {
        let current = self.current_view();
        if vc.next_view <= current {
            debug!(next = vc.next_view.0, "Dropped view change for a past view");
            return Ok(());
        }
        let next = vc.next_view;
        self.view_changes.record(vc)?;

        // Catch-up rule: f+1 replicas already want a higher view; join
        // them rather than waiting for our own timer. Applies even while
        // a change to a lower view is still pending.
        if let Some(target) = self.view_changes.catchup_view(current) {
            self.start_view_change(target, "catch-up").await;
        }

        self.try_complete(next).await;
        Ok(())
    }

    async fn on_new_view(&self, nv: NewViewMsg) -> Result<(), ConsensusError> {
        if nv.next_view <= self.current_view() {
            debug!(next = nv.next_view.0, "Dropped stale new view");
            return Ok(());
        }
        self.view_changes.verify_new_view(&nv)?;

        {
            let mut vs = self.view.lock();
            if nv.next_view <= vs.current {
                return Ok(());
            }
            vs.current = nv.next_view;
            vs.phase = ViewPhase::Normal;
        }
        info!(view = nv.next_view.0, primary = %nv.replica, "Adopted new view");
        self.finish_adoption(nv.next_view, &nv.pre_prepares);

        // Install the re-proposed orderings as if each were an incoming
        // pre-prepare, and vote for them.
        let primary = self.table.primary_for(nv.next_view);
        for pp in nv.pre_prepares {
            let request_digest = pp.request.digest();
            let is_null = pp.request.is_null();
            let instance = self
                .registry
                .get_or_create(pp.sequence, nv.next_view, primary);
            match instance.on_pre_prepare(pp) {
                Ok(Some(prepare)) => {
                    if !is_null {
                        self.timers
                            .lock()
                            .set(request_digest, self.config.suspicion_timeout);
                    }
                    self.broadcast(&InboundMsg::from_vote(prepare)).await;
                }
                Ok(None) => {}
                Err(err) => self.report(err.into()),
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // View manager
    // ═══════════════════════════════════════════════════════════════════

    /// Begin (or rejoin) a view change toward `target`.
    pub(crate) async fn start_view_change(&self, target: View, reason: &str) {
        let rebroadcast = {
            let mut vs = self.view.lock();
            if target <= vs.current {
                return;
            }
            match vs.phase {
                ViewPhase::Changing { next } if next >= target => true,
                _ => {
                    vs.phase = ViewPhase::Changing { next: target };
                    false
                }
            }
        };

        if rebroadcast {
            // Still waiting on quorum; repeat our declaration in case the
            // first broadcast was lost.
            let msg = self.own_view_change.lock().clone();
            if let Some(msg) = msg {
                debug!(next = msg.next_view.0, "Rebroadcasting view change");
                self.broadcast(&InboundMsg::ViewChange(msg)).await;
            }
            return;
        }

        info!(next = target.0, reason = reason, "Starting view change");
        let stable = self.checkpoints.stable();
        let msg = self.view_changes.make_view_change(
            target,
            stable,
            self.checkpoints.stable_proof(),
            self.registry.prepared_above(stable),
        );
        *self.own_view_change.lock() = Some(msg.clone());
        self.broadcast(&InboundMsg::ViewChange(msg)).await;
        self.try_complete(target).await;
    }

    /// If we are the primary of `next` and hold a view-change quorum,
    /// assemble the NEW-VIEW, adopt the view, and install the proposal.
    async fn try_complete(&self, next: View) {
        if self.table.primary_for(next) != self.table.my_id() {
            return;
        }
        let new_view = {
            let mut vs = self.view.lock();
            if vs.current >= next {
                return;
            }
            match self.view_changes.build_new_view(next) {
                Some(nv) => {
                    vs.current = next;
                    vs.phase = ViewPhase::Normal;
                    nv
                }
                None => return,
            }
        };

        info!(view = next.0, "Adopted new view as primary");
        self.finish_adoption(next, &new_view.pre_prepares);
        self.broadcast(&InboundMsg::NewView(new_view.clone())).await;

        // Take the primary's side of each re-proposed ordering; backups
        // answer with prepares as usual.
        for pp in new_view.pre_prepares {
            let instance = self
                .registry
                .get_or_create(pp.sequence, next, self.table.my_id());
            if let Err(err) = instance.start_consensus(pp.request) {
                self.report(err.into());
            }
        }
    }

    /// Cleanup shared by both adoption paths. Old-view instances are
    /// dead weight once the proposal re-covers their sequences.
    fn finish_adoption(&self, next: View, proposal: &[PrePrepareMsg]) {
        self.view_changes.purge_through(next);
        self.registry.purge_older_views(next);
        self.timers.lock().cancel_all();
        *self.own_view_change.lock() = None;

        let proposed_max = proposal.last().map(|pp| pp.sequence.0).unwrap_or(0);
        let stable = self.checkpoints.stable().0;
        let mut next_seq = self.next_sequence.lock();
        *next_seq = (*next_seq).max(proposed_max).max(stable);
    }

    /// A suspicion timer fired: the primary sat on a request too long.
    pub(crate) async fn on_suspect(&self, request: Digest) {
        let target = {
            let vs = self.view.lock();
            match vs.phase {
                ViewPhase::Normal => vs.current.next(),
                ViewPhase::Changing { next } => next,
            }
        };
        warn!(%request, next = target.0, "Request stalled, suspecting primary");
        self.start_view_change(target, "suspicion timeout").await;
    }
}

/// A running replica. Dropping it aborts every task it spawned.
pub struct Replica {
    core: Arc<Core>,
    tasks: Vec<JoinHandle<()>>,
}

impl Replica {
    /// Construct the replica and spawn its task set. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        table: NodeTable,
        config: ReplicaConfig,
        transport: Arc<dyn Transport>,
        app: Arc<dyn App>,
    ) -> Replica {
        let n = table.len();
        let capacity = config.channel_capacity(n);

        let (entrance_tx, entrance_rx) = mpsc::channel::<Delivery>(capacity);
        let (delivery_tx, delivery_rx) = mpsc::channel::<Delivery>(capacity);
        let (execution_tx, execution_rx) = mpsc::channel::<(ReplyMsg, RequestMsg)>(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(capacity * n);
        let (error_tx, error_rx) = mpsc::channel::<ReplicaError>(capacity * n);
        let (control_tx, control_rx) = mpsc::channel::<Control>(capacity);

        let f = table.f();
        let my_id = table.my_id();
        let core = Arc::new(Core {
            registry: InstanceRegistry::new(my_id, f),
            checkpoints: CheckpointEngine::new(my_id, f, config.high_watermark),
            view_changes: ViewChangeState::new(table.clone()),
            app,
            view: Mutex::new(ViewStatus {
                current: View(0),
                phase: ViewPhase::Normal,
            }),
            own_view_change: Mutex::new(None),
            next_sequence: Mutex::new(0),
            last_executed: AtomicU64::new(0),
            committed: Mutex::new(Vec::new()),
            client_replies: Mutex::new(HashMap::new()),
            timers: Mutex::new(TimerManager::new(control_tx)),
            entrance_tx,
            execution_tx,
            outbound_tx,
            error_tx,
            table,
            config,
        });

        let mut tasks = Vec::new();
        tasks.push(spawn_router(core.clone(), entrance_rx, delivery_tx));
        tasks.extend(spawn_resolvers(core.clone(), delivery_rx));
        tasks.push(spawn_executor(core.clone(), execution_rx));
        tasks.push(spawn_dispatcher(
            outbound_rx,
            transport,
            core.error_tx.clone(),
            core.config.max_outbound,
        ));
        tasks.push(spawn_error_logger(
            error_rx,
            core.config.cooling_threshold,
            core.config.cooling_interval,
        ));
        tasks.push(spawn_control(core.clone(), control_rx));

        info!(replica = %my_id, n = n, f = f, "Replica started");
        Replica { core, tasks }
    }

    /// A cloneable handle for feeding messages and inspecting state.
    pub fn handle(&self) -> ReplicaHandle {
        ReplicaHandle {
            core: self.core.clone(),
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_resolvers(core: Arc<Core>, delivery_rx: mpsc::Receiver<Delivery>) -> Vec<JoinHandle<()>> {
    let shared = Arc::new(tokio::sync::Mutex::new(delivery_rx));
    (0..core.config.resolver_workers.max(1))
        .map(|_| {
            let core = core.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
                loop {
                    let delivery = { shared.lock().await.recv().await };
                    let Some(delivery) = delivery else { break };
                    core.handle(delivery).await;
                }
            })
        })
        .collect()
}

fn spawn_control(core: Arc<Core>, mut control_rx: mpsc::Receiver<Control>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = control_rx.recv().await {
            match signal {
                Control::Suspect { request } => core.on_suspect(request).await,
            }
        }
    })
}

/// Handle onto a running replica.
#[derive(Clone)]
pub struct ReplicaHandle {
    core: Arc<Core>,
}

impl ReplicaHandle {
    /// Feed an already-decoded message into the entrance channel.
    pub async fn submit(&self, msg: InboundMsg) {
        let _ = self.core.entrance_tx.send(Delivery::new(msg)).await;
    }

    /// Feed a client request.
    pub async fn submit_request(&self, req: RequestMsg) {
        self.submit(InboundMsg::Request(req)).await;
    }

    /// Decode a wire frame received on `path` and feed it in.
    pub async fn feed_wire(&self, path: &str, bytes: &[u8]) -> Result<(), CodecError> {
        let msg = codec::decode(path, bytes)?;
        self.submit(msg).await;
        Ok(())
    }

    pub fn my_id(&self) -> ReplicaId {
        self.core.table.my_id()
    }

    pub fn view(&self) -> View {
        self.core.current_view()
    }

    pub fn phase(&self) -> ViewPhase {
        self.core.phase()
    }

    pub fn last_executed(&self) -> SeqNum {
        SeqNum(self.core.last_executed.load(Ordering::Acquire))
    }

    pub fn stable_checkpoint(&self) -> SeqNum {
        self.core.checkpoints.stable()
    }

    /// Snapshot of the committed log, in execution order.
    pub fn committed_log(&self) -> Vec<RequestMsg> {
        self.core.committed.lock().clone()
    }

    /// Live instance sequence numbers, ascending.
    pub fn live_instances(&self) -> Vec<SeqNum> {
        self.core.registry.sequences()
    }

    /// Sequence numbers with entries in the checkpoint log, ascending.
    pub fn checkpoint_log(&self) -> Vec<SeqNum> {
        self.core.checkpoints.logged_sequences()
    }
}
