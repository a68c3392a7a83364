//! Wire encoding for protocol messages.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: borsh-encoded message]
//! ```
//!
//! - Version is currently `1`
//! - Payload is the borsh encoding of the message struct for the kind
//!
//! # Path-Based Type Dispatch
//!
//! The message kind is determined by the endpoint path the frame arrived
//! on, not by a field in the frame. This keeps the wire format minimal
//! and makes routing a table lookup.

use borsh::BorshDeserialize;
use palisade_types::{
    CheckpointMsg, InboundMsg, NewViewMsg, PrePrepareMsg, ReplyMsg, RequestMsg, ViewChangeMsg,
    VoteMsg,
};
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("frame too short")]
    FrameTooShort,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("unknown path: {0}")]
    UnknownPath(String),
}

/// Encode a message to wire format. The frame carries no kind tag; the
/// dispatcher sends it on [`InboundMsg::path`].
pub fn encode(msg: &InboundMsg) -> Result<Vec<u8>, CodecError> {
    let payload = match msg {
        InboundMsg::Request(m) => borsh::to_vec(m),
        InboundMsg::PrePrepare(m) => borsh::to_vec(m),
        InboundMsg::Prepare(m) | InboundMsg::Commit(m) => borsh::to_vec(m),
        InboundMsg::Reply(m) => borsh::to_vec(m),
        InboundMsg::Checkpoint(m) => borsh::to_vec(m),
        InboundMsg::ViewChange(m) => borsh::to_vec(m),
        InboundMsg::NewView(m) => borsh::to_vec(m),
    }
    .map_err(|e| CodecError::Encode(e.to_string()))?;

    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode a frame received on `path`.
pub fn decode(path: &str, data: &[u8]) -> Result<InboundMsg, CodecError> {
    if data.is_empty() {
        return Err(CodecError::FrameTooShort);
    }

    let version = data[0];
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    let payload = &data[1..];

    fn read<T: BorshDeserialize>(payload: &[u8]) -> Result<T, CodecError> {
        T::try_from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }

    match path {
        "/request" => Ok(InboundMsg::Request(read::<RequestMsg>(payload)?)),
        "/preprepare" => Ok(InboundMsg::PrePrepare(read::<PrePrepareMsg>(payload)?)),
        "/prepare" | "/commit" => Ok(InboundMsg::from_vote(read::<VoteMsg>(payload)?)),
        "/reply" => Ok(InboundMsg::Reply(read::<ReplyMsg>(payload)?)),
        "/checkpoint" => Ok(InboundMsg::Checkpoint(read::<CheckpointMsg>(payload)?)),
        "/viewchange" => Ok(InboundMsg::ViewChange(read::<ViewChangeMsg>(payload)?)),
        "/newview" => Ok(InboundMsg::NewView(read::<NewViewMsg>(payload)?)),
        _ => Err(CodecError::UnknownPath(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{Digest, ReplicaId, SeqNum, View, VoteKind};

    #[test]
    fn test_round_trip_on_matching_path() {
        let request = RequestMsg::new("client-a", 1, "x", b"payload".to_vec());
        let msg = InboundMsg::Request(request);

        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(decode(msg.path(), &bytes).unwrap(), msg);
    }

    #[test]
    fn test_vote_kind_survives_path_dispatch() {
        let vote = VoteMsg {
            view: View(0),
            sequence: SeqNum(4),
            digest: Digest::of(b"d"),
            replica: ReplicaId(2),
            kind: VoteKind::Commit,
        };
        let msg = InboundMsg::Commit(vote);
        let bytes = encode(&msg).unwrap();
        let decoded = decode("/commit", &bytes).unwrap();
        assert!(matches!(decoded, InboundMsg::Commit(_)));
    }

    #[test]
    fn test_unknown_version() {
        let result = decode("/request", &[99, 1, 2, 3]);
        assert!(matches!(result, Err(CodecError::UnknownVersion(99))));
    }

    #[test]
    fn test_unknown_path() {
        let msg = InboundMsg::Request(RequestMsg::new("c", 1, "x", vec![]));
        let bytes = encode(&msg).unwrap();
        assert!(matches!(
            decode("/telemetry", &bytes),
            Err(CodecError::UnknownPath(_))
        ));
    }

    #[test]
    fn test_empty_frame() {
        assert!(matches!(decode("/request", &[]), Err(CodecError::FrameTooShort)));
    }
}
