//! Ordered execution pipeline.
//!
//! A single task owns `last_executed`, the pending pair buffer, and the
//! committed log. Committed `(reply, request)` pairs arrive in any order;
//! execution happens strictly in sequence order with no gaps, at most
//! once per sequence. Every K executions the checkpoint engine emits a
//! CHECKPOINT, self-delivered before it is broadcast.

use crate::replica::Core;
use palisade_consensus::{CheckpointOutcome, ConsensusError};
use palisade_types::{InboundMsg, ReplyMsg, RequestMsg, SeqNum};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub(crate) fn spawn_executor(
    core: Arc<Core>,
    mut execution_rx: mpsc::Receiver<(ReplyMsg, RequestMsg)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<u64, (ReplyMsg, RequestMsg)> = HashMap::new();

        while let Some((reply, request)) = execution_rx.recv().await {
            let Some(seq) = request.sequence else {
                core.report(
                    ConsensusError::corrupt("committed request carries no sequence").into(),
                );
                continue;
            };

            let last = core.last_executed.load(Ordering::Acquire);
            if seq.0 <= last {
                // A slow peer replaying an already-executed sequence.
                debug!(seq = seq.0, last = last, "Skipped re-committed sequence");
                continue;
            }

            if let Some((_, buffered)) = pending.get(&seq.0) {
                if buffered.digest() != request.digest() {
                    // Two committed requests for one sequence: safety is
                    // gone. Stop executing and raise the alarm.
                    error!(
                        seq = seq.0,
                        ours = %buffered.digest(),
                        theirs = %request.digest(),
                        "Conflicting committed requests, halting execution"
                    );
                    core.report(
                        ConsensusError::Fatal {
                            detail: format!(
                                "two committed requests with different digests at {seq}"
                            ),
                        }
                        .into(),
                    );
                    return;
                }
            }
            pending.insert(seq.0, (reply, request));

            // Execute every consecutive sequence that is now ready.
            loop {
                let next = core.last_executed.load(Ordering::Acquire) + 1;
                let Some((mut reply, request)) = pending.remove(&next) else {
                    break;
                };

                reply.result = if request.is_null() {
                    String::new()
                } else {
                    core.app.execute(&request.operation, &request.data)
                };

                core.committed.lock().push(request.clone());
                core.timers.lock().cancel(&request.digest());
                core.last_executed.store(next, Ordering::Release);
                info!(seq = next, op = %request.operation, "Executed");

                if !request.is_null() {
                    core.client_replies
                        .lock()
                        .insert(request.client_id.clone(), request.timestamp);
                    core.broadcast(&InboundMsg::Reply(reply)).await;
                }

                if next % core.config.checkpoint_period == 0 {
                    let checkpoint = core
                        .checkpoints
                        .make_checkpoint(SeqNum(next), request.digest());
                    debug!(seq = next, "Emitting checkpoint");
                    // Our own checkpoint is logged directly; stability
                    // still needs 2f+1 matching entries.
                    if let CheckpointOutcome::NewlyStable(stable) =
                        core.checkpoints.on_checkpoint(checkpoint.clone())
                    {
                        core.registry.purge_through(stable);
                    }
                    core.broadcast(&InboundMsg::Checkpoint(checkpoint)).await;
                }
            }
        }
    })
}
