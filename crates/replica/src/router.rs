//! Inbound message router.
//!
//! Classifies every inbound message and forwards it to the resolver
//! pool. The router is also where acceptance policy lives: own messages
//! looping back from broadcast are suppressed (votes and checkpoints are
//! already self-accounted where they should count), the primary ignores
//! its own assignment path, and while a view change is in progress only
//! CHECKPOINT, VIEW-CHANGE, and NEW-VIEW traffic passes.

use crate::replica::{Core, ViewPhase};
use palisade_types::InboundMsg;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// A message on its way through the replica, with its re-delivery count.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub msg: InboundMsg,
    pub attempts: u32,
}

impl Delivery {
    pub fn new(msg: InboundMsg) -> Self {
        Self { msg, attempts: 0 }
    }
}

pub(crate) fn spawn_router(
    core: Arc<Core>,
    mut entrance_rx: mpsc::Receiver<Delivery>,
    delivery_tx: mpsc::Sender<Delivery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = entrance_rx.recv().await {
            let msg = &delivery.msg;

            // Broadcast fan-out can echo our own messages back; our
            // votes and checkpoints are already counted locally.
            if msg.sender() == Some(core.table.my_id()) {
                trace!(kind = msg.type_name(), "Dropped own message");
                continue;
            }

            // The primary assigns orderings; it never takes one in.
            if let InboundMsg::PrePrepare(pp) = msg {
                if core.table.primary_for(pp.view) == core.table.my_id() {
                    trace!(seq = pp.sequence.0, "Dropped pre-prepare addressed to the primary");
                    continue;
                }
            }

            if matches!(core.phase(), ViewPhase::Changing { .. })
                && !msg.admitted_during_view_change()
            {
                trace!(kind = msg.type_name(), "Dropped while view changing");
                continue;
            }

            if delivery_tx.send(delivery).await.is_err() {
                break;
            }
        }
    })
}
