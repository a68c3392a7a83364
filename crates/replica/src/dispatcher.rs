//! Outbound dispatcher and error logger.
//!
//! The dispatcher drains the outbound queue and hands frames to the
//! transport with bounded concurrency. Send failures are reported on the
//! error channel and never touch the consensus path; the error logger
//! applies the cooling policy when failures come in bursts.

use crate::error::ReplicaError;
use crate::traits::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

/// One frame queued for the transport.
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    pub addr: String,
    pub path: &'static str,
    pub bytes: Vec<u8>,
}

/// Drain the outbound queue, bounding concurrent sends with a semaphore.
pub(crate) fn spawn_dispatcher(
    mut outbound_rx: mpsc::Receiver<Outbound>,
    transport: Arc<dyn Transport>,
    error_tx: mpsc::Sender<ReplicaError>,
    max_outbound: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let slots = Arc::new(Semaphore::new(max_outbound));
        while let Some(out) = outbound_rx.recv().await {
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            let transport = transport.clone();
            let error_tx = error_tx.clone();
            tokio::spawn(async move {
                let _slot = permit;
                if let Err(err) = transport.send(&out.addr, out.path, out.bytes) {
                    // try_send: error reporting must never block a send slot.
                    let _ = error_tx.try_send(ReplicaError::Transport(err));
                }
            });
        }
    })
}

/// Drain the error channel. After `threshold` consecutive reports, sleep
/// for the cooling interval before resuming.
pub(crate) fn spawn_error_logger(
    mut error_rx: mpsc::Receiver<ReplicaError>,
    threshold: u32,
    cooling: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut remaining = threshold;
        while let Some(err) = error_rx.recv().await {
            warn!(error = %err, "Replica error");
            remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                warn!(
                    threshold = threshold,
                    cooling_ms = cooling.as_millis() as u64,
                    "Error burst detected, cooling down"
                );
                tokio::time::sleep(cooling).await;
                remaining = threshold;
            }
        }
    })
}
