//! MLS message envelope and the outermost peer framing.
//!
//! The delivery service treats MLS traffic as opaque: only the epoch in
//! the envelope header is read for gating. Bodies are produced and
//! consumed exclusively by the group facade.

use bytes::{Buf, BufMut, Bytes};

use crate::refs::{MESSAGE_REF_LABEL, MessageRef};
use crate::wire::{self, Result, WireDecode, WireEncode, WireError};
use crate::Identity;

/// An MLS-protected message: clear epoch header, opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlsMessage {
    /// Epoch the message was protected under.
    pub epoch: u64,
    /// Protected body, interpreted only by the group facade.
    pub body: Bytes,
}

impl MlsMessage {
    /// Reference naming this message (gossip dedup, conflict sets,
    /// proposal references).
    pub fn message_ref(&self) -> MessageRef {
        MessageRef::compute(MESSAGE_REF_LABEL, &self.encode_to_bytes())
    }
}

impl WireEncode for MlsMessage {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.epoch);
        wire::put_bytes(buf, &self.body);
    }
}

impl WireDecode for MlsMessage {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self { epoch: wire::get_u64(buf)?, body: wire::get_bytes(buf)? })
    }
}

/// Gossip-layer message (§ wire tag under `DdsMessage::Gossip`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    /// Ask the receiver to add the sender to its forwarding sample.
    Subscribe(Identity),
    /// Flooded MLS payload (proposal or application message).
    Gossip(MlsMessage),
}

impl GossipMessage {
    const TAG_SUBSCRIBE: u8 = 1;
    const TAG_GOSSIP: u8 = 2;
}

impl WireEncode for GossipMessage {
    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::Subscribe(id) => {
                buf.put_u8(Self::TAG_SUBSCRIBE);
                id.encode(buf);
            },
            Self::Gossip(msg) => {
                buf.put_u8(Self::TAG_GOSSIP);
                msg.encode(buf);
            },
        }
    }
}

impl WireDecode for GossipMessage {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        match wire::get_u8(buf)? {
            Self::TAG_SUBSCRIBE => Ok(Self::Subscribe(Identity::decode(buf)?)),
            Self::TAG_GOSSIP => Ok(Self::Gossip(MlsMessage::decode(buf)?)),
            tag => Err(WireError::UnknownTag { context: "GossipMessage", tag }),
        }
    }
}

/// Outermost frame exchanged between peers.
///
/// Welcomes are opaque here: only a joining client interprets them, via
/// the group facade. Consensus traffic travels MLS-protected so that it is
/// authenticated and epoch-bound before the cascade ever sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdsMessage {
    /// Welcome package for a newly added member.
    Welcome(Bytes),
    /// Epidemic dissemination traffic.
    Gossip(GossipMessage),
    /// MLS-protected `CascadeConsensusMessage`.
    CascadeConsensus(MlsMessage),
}

impl DdsMessage {
    const TAG_WELCOME: u8 = 1;
    const TAG_GOSSIP: u8 = 2;
    const TAG_CASCADE: u8 = 3;
}

impl WireEncode for DdsMessage {
    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::Welcome(welcome) => {
                buf.put_u8(Self::TAG_WELCOME);
                wire::put_bytes(buf, welcome);
            },
            Self::Gossip(msg) => {
                buf.put_u8(Self::TAG_GOSSIP);
                msg.encode(buf);
            },
            Self::CascadeConsensus(msg) => {
                buf.put_u8(Self::TAG_CASCADE);
                msg.encode(buf);
            },
        }
    }
}

impl WireDecode for DdsMessage {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        match wire::get_u8(buf)? {
            Self::TAG_WELCOME => Ok(Self::Welcome(wire::get_bytes(buf)?)),
            Self::TAG_GOSSIP => Ok(Self::Gossip(GossipMessage::decode(buf)?)),
            Self::TAG_CASCADE => Ok(Self::CascadeConsensus(MlsMessage::decode(buf)?)),
            tag => Err(WireError::UnknownTag { context: "DdsMessage", tag }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(epoch: u64, body: &'static [u8]) -> MlsMessage {
        MlsMessage { epoch, body: Bytes::from_static(body) }
    }

    #[test]
    fn message_ref_depends_on_body_and_epoch() {
        assert_ne!(msg(0, b"a").message_ref(), msg(0, b"b").message_ref());
        assert_ne!(msg(0, b"a").message_ref(), msg(1, b"a").message_ref());
        assert_eq!(msg(2, b"a").message_ref(), msg(2, b"a").message_ref());
    }

    #[test]
    fn dds_round_trip() {
        let cases = [
            DdsMessage::Welcome(Bytes::from_static(b"welcome-bytes")),
            DdsMessage::Gossip(GossipMessage::Subscribe(Identity::from("alice"))),
            DdsMessage::Gossip(GossipMessage::Gossip(msg(4, b"proposal"))),
            DdsMessage::CascadeConsensus(msg(4, b"protected")),
        ];
        for case in cases {
            let decoded = DdsMessage::decode_exact(&case.encode_to_bytes()).unwrap();
            assert_eq!(case, decoded);
        }
    }

    #[test]
    fn unknown_frame_tag_is_recoverable() {
        let err = DdsMessage::decode_exact(&[9, 0, 0]).unwrap_err();
        assert!(matches!(err, WireError::UnknownTag { context: "DdsMessage", tag: 9 }));
    }
}
