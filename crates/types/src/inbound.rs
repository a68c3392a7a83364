//! The inbound message sum dispatched by the router.

use crate::messages::{
    CheckpointMsg, NewViewMsg, PrePrepareMsg, ReplyMsg, RequestMsg, ViewChangeMsg, VoteKind,
    VoteMsg,
};
use crate::ReplicaId;

/// Every message a replica can receive, one variant per wire kind.
///
/// The router matches exhaustively on this sum; adding a message kind is
/// a compile error until every dispatch site handles it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMsg {
    Request(RequestMsg),
    PrePrepare(PrePrepareMsg),
    Prepare(VoteMsg),
    Commit(VoteMsg),
    Reply(ReplyMsg),
    Checkpoint(CheckpointMsg),
    ViewChange(ViewChangeMsg),
    NewView(NewViewMsg),
}

impl InboundMsg {
    /// Wrap a vote under the variant matching its kind.
    pub fn from_vote(vote: VoteMsg) -> Self {
        match vote.kind {
            VoteKind::Prepare => InboundMsg::Prepare(vote),
            VoteKind::Commit => InboundMsg::Commit(vote),
        }
    }

    /// Logical endpoint this message kind travels on.
    pub fn path(&self) -> &'static str {
        match self {
            InboundMsg::Request(_) => "/request",
            InboundMsg::PrePrepare(_) => "/preprepare",
            InboundMsg::Prepare(_) => "/prepare",
            InboundMsg::Commit(_) => "/commit",
            InboundMsg::Reply(_) => "/reply",
            InboundMsg::Checkpoint(_) => "/checkpoint",
            InboundMsg::ViewChange(_) => "/viewchange",
            InboundMsg::NewView(_) => "/newview",
        }
    }

    /// Human-readable kind name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            InboundMsg::Request(_) => "Request",
            InboundMsg::PrePrepare(_) => "PrePrepare",
            InboundMsg::Prepare(_) => "Prepare",
            InboundMsg::Commit(_) => "Commit",
            InboundMsg::Reply(_) => "Reply",
            InboundMsg::Checkpoint(_) => "Checkpoint",
            InboundMsg::ViewChange(_) => "ViewChange",
            InboundMsg::NewView(_) => "NewView",
        }
    }

    /// The replica that produced this message, when the kind carries one.
    /// Requests come from clients and have no replica sender.
    pub fn sender(&self) -> Option<ReplicaId> {
        match self {
            InboundMsg::Request(_) => None,
            InboundMsg::PrePrepare(_) => None,
            InboundMsg::Prepare(v) | InboundMsg::Commit(v) => Some(v.replica),
            InboundMsg::Reply(r) => Some(r.replica),
            InboundMsg::Checkpoint(c) => Some(c.replica),
            InboundMsg::ViewChange(vc) => Some(vc.replica),
            InboundMsg::NewView(nv) => Some(nv.replica),
        }
    }

    /// Whether this kind is still admitted while a view change is in
    /// progress. Everything else is discarded until the new view starts.
    pub fn admitted_during_view_change(&self) -> bool {
        matches!(
            self,
            InboundMsg::Checkpoint(_) | InboundMsg::ViewChange(_) | InboundMsg::NewView(_)
        )
    }
}
