//! Wire types for the Cascade Consensus pipeline.
//!
//! Four message families share the `CASCADE_CONSENSUS` frame: the two CAC
//! broadcast instances, Restrained Consensus, and Full Consensus. Every
//! frame carries the instance number it belongs to so that a statement for
//! one instance can never be replayed into the other.

use bytes::{Buf, BufMut};

use crate::auth::{AuthenticatedContent, LeafIndex};
use crate::refs::{CAC2_CONTENT_REF_LABEL, MessageRef};
use crate::wire::{self, Result, WireDecode, WireEncode, WireError};

/// Statement kind carried by a CAC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacKind {
    /// First-phase endorsement of a message.
    Witness = 1,
    /// Second-phase delivery vote.
    Ready = 2,
}

impl CacKind {
    /// Parse a wire tag.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Witness),
            2 => Some(Self::Ready),
            _ => None,
        }
    }
}

impl WireEncode for CacKind {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(*self as u8);
    }
}

impl WireDecode for CacKind {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let tag = wire::get_u8(buf)?;
        Self::from_u8(tag).ok_or(WireError::UnknownTag { context: "CacKind", tag })
    }
}

/// One round of CAC broadcast traffic.
///
/// Every CAC message piggybacks the sender's full set of verified
/// signatures, so any single message from a correct member is enough to
/// catch a receiver up. The broadcast payload rides along only when the
/// sender has just endorsed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacMessage<T> {
    /// Whether this round announces a witness or a ready statement.
    pub kind: CacKind,
    /// Accumulated signature envelopes known to the sender.
    pub sigs: Vec<AuthenticatedContent>,
    /// The message being broadcast, if attached.
    pub payload: Option<T>,
}

impl<T: WireEncode> WireEncode for CacMessage<T> {
    fn encode(&self, buf: &mut impl BufMut) {
        self.kind.encode(buf);
        wire::put_list(buf, &self.sigs);
        wire::put_opt(buf, &self.payload);
    }
}

impl<T: WireDecode> WireDecode for CacMessage<T> {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            kind: CacKind::decode(buf)?,
            sigs: wire::get_list(buf)?,
            payload: wire::get_opt(buf)?,
        })
    }
}

/// Payload of the second CAC instance: the outcome of a Restrained
/// Consensus round (or of its timeout fallback).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cac2Content {
    /// References of the commits the sender holds responsible for the
    /// conflict, in sorted order.
    pub conflicting_messages: Vec<MessageRef>,
    /// Justifying signatures (CAC proofs, subset signatures, retracts),
    /// in sorted order.
    pub signatures: Vec<AuthenticatedContent>,
}

impl Cac2Content {
    /// Reference naming this content for CAC₂ bookkeeping.
    ///
    /// Senders sort both lists before broadcasting, so two members
    /// submitting the same outcome produce the same reference.
    pub fn content_ref(&self) -> MessageRef {
        MessageRef::compute(CAC2_CONTENT_REF_LABEL, &self.encode_to_bytes())
    }
}

impl WireEncode for Cac2Content {
    fn encode(&self, buf: &mut impl BufMut) {
        wire::put_list(buf, &self.conflicting_messages);
        wire::put_list(buf, &self.signatures);
    }
}

impl WireDecode for Cac2Content {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self { conflicting_messages: wire::get_list(buf)?, signatures: wire::get_list(buf)? })
    }
}

/// Body of a Restrained Consensus participation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrainedConsContent {
    /// The sender's signatures, one per power-set subset containing it.
    pub sig_set: Vec<AuthenticatedContent>,
    /// Power set of the `(sender, ref)` conflict pairs.
    pub power_conflict_set: Vec<Vec<(LeafIndex, MessageRef)>>,
    /// CAC signatures justifying each conflict pair.
    pub proofs: Vec<AuthenticatedContent>,
}

impl WireEncode for RestrainedConsContent {
    fn encode(&self, buf: &mut impl BufMut) {
        wire::put_list(buf, &self.sig_set);
        wire::put_list(buf, &self.power_conflict_set);
        wire::put_list(buf, &self.proofs);
    }
}

impl WireDecode for RestrainedConsContent {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            sig_set: wire::get_list(buf)?,
            power_conflict_set: wire::get_list(buf)?,
            proofs: wire::get_list(buf)?,
        })
    }
}

/// Restrained Consensus traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestrainedConsensusMessage {
    /// A participant's signed subsets and proofs.
    Participate(RestrainedConsContent),
    /// A signed withdrawal by a member that did not propose.
    Retract(AuthenticatedContent),
}

impl RestrainedConsensusMessage {
    const TAG_PARTICIPATE: u8 = 1;
    const TAG_RETRACT: u8 = 2;
}

impl WireEncode for RestrainedConsensusMessage {
    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::Participate(content) => {
                buf.put_u8(Self::TAG_PARTICIPATE);
                content.encode(buf);
            },
            Self::Retract(retract) => {
                buf.put_u8(Self::TAG_RETRACT);
                retract.encode(buf);
            },
        }
    }
}

impl WireDecode for RestrainedConsensusMessage {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        match wire::get_u8(buf)? {
            Self::TAG_PARTICIPATE => Ok(Self::Participate(RestrainedConsContent::decode(buf)?)),
            Self::TAG_RETRACT => Ok(Self::Retract(AuthenticatedContent::decode(buf)?)),
            tag => Err(WireError::UnknownTag { context: "RestrainedConsensusMessage", tag }),
        }
    }
}

/// Signed body of a PBFT pre-prepare, prepare or commit vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusContent {
    /// View the vote belongs to.
    pub view: u32,
    /// Reference of the value being agreed on.
    pub message_ref: MessageRef,
}

impl WireEncode for ConsensusContent {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.view);
        self.message_ref.encode(buf);
    }
}

impl WireDecode for ConsensusContent {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self { view: wire::get_u32(buf)?, message_ref: MessageRef::decode(buf)? })
    }
}

/// Signed body of a view-change vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewChangeContent {
    /// The view being moved to.
    pub view: u32,
}

impl WireEncode for ViewChangeContent {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.view);
    }
}

impl WireDecode for ViewChangeContent {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self { view: wire::get_u32(buf)? })
    }
}

/// Full Consensus (simplified PBFT) traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage<T> {
    /// Forward a value to the current leader.
    Propose {
        /// View the proposal targets.
        view: u32,
        /// Proposed value.
        content: T,
    },
    /// Leader's ordering announcement.
    PrePrepare {
        /// Signed `(view, ref)` statement.
        signed: AuthenticatedContent,
        /// The proposed value itself.
        proposed: T,
    },
    /// First-round vote.
    Prepare(AuthenticatedContent),
    /// Second-round vote.
    Commit(AuthenticatedContent),
    /// Signed request to advance the view.
    ViewChange(AuthenticatedContent),
}

impl<T> ConsensusMessage<T> {
    const TAG_PROPOSE: u8 = 1;
    const TAG_PRE_PREPARE: u8 = 2;
    const TAG_PREPARE: u8 = 3;
    const TAG_COMMIT: u8 = 4;
    const TAG_VIEW_CHANGE: u8 = 5;
}

impl<T: WireEncode> WireEncode for ConsensusMessage<T> {
    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::Propose { view, content } => {
                buf.put_u8(Self::TAG_PROPOSE);
                buf.put_u32(*view);
                content.encode(buf);
            },
            Self::PrePrepare { signed, proposed } => {
                buf.put_u8(Self::TAG_PRE_PREPARE);
                signed.encode(buf);
                proposed.encode(buf);
            },
            Self::Prepare(signed) => {
                buf.put_u8(Self::TAG_PREPARE);
                signed.encode(buf);
            },
            Self::Commit(signed) => {
                buf.put_u8(Self::TAG_COMMIT);
                signed.encode(buf);
            },
            Self::ViewChange(signed) => {
                buf.put_u8(Self::TAG_VIEW_CHANGE);
                signed.encode(buf);
            },
        }
    }
}

impl<T: WireDecode> WireDecode for ConsensusMessage<T> {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        match wire::get_u8(buf)? {
            Self::TAG_PROPOSE => {
                Ok(Self::Propose { view: wire::get_u32(buf)?, content: T::decode(buf)? })
            },
            Self::TAG_PRE_PREPARE => Ok(Self::PrePrepare {
                signed: AuthenticatedContent::decode(buf)?,
                proposed: T::decode(buf)?,
            }),
            Self::TAG_PREPARE => Ok(Self::Prepare(AuthenticatedContent::decode(buf)?)),
            Self::TAG_COMMIT => Ok(Self::Commit(AuthenticatedContent::decode(buf)?)),
            Self::TAG_VIEW_CHANGE => Ok(Self::ViewChange(AuthenticatedContent::decode(buf)?)),
            tag => Err(WireError::UnknownTag { context: "ConsensusMessage", tag }),
        }
    }
}

/// Instance numbers stamped on cascade frames.
pub mod instance {
    /// Full Consensus (instance-less in the pipeline numbering).
    pub const FULL_CONSENSUS: u8 = 0;
    /// First CAC instance and its Restrained Consensus follow-up.
    pub const CAC1: u8 = 1;
    /// Second CAC instance.
    pub const CAC2: u8 = 2;
}

/// Marker for which pipeline stage a cascade frame belongs to.
pub type CascadeInstance = u8;

/// Body of a cascade frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeBody {
    /// First CAC instance, carrying commits.
    Cac(CacMessage<crate::MlsMessage>),
    /// Restrained Consensus traffic.
    Restrained(RestrainedConsensusMessage),
    /// Second CAC instance, carrying RC outcomes.
    Cac2(CacMessage<Cac2Content>),
    /// Full Consensus traffic.
    Consensus(ConsensusMessage<Cac2Content>),
}

impl CascadeBody {
    const TAG_CAC: u8 = 1;
    const TAG_RC: u8 = 2;
    const TAG_CAC2: u8 = 3;
    const TAG_FC: u8 = 4;
}

/// A cascade frame: instance number plus stage body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeConsensusMessage {
    /// Pipeline instance this frame belongs to.
    pub instance: CascadeInstance,
    /// Stage-specific body.
    pub body: CascadeBody,
}

impl CascadeConsensusMessage {
    /// Frame for the first CAC instance.
    pub fn cac1(message: CacMessage<crate::MlsMessage>) -> Self {
        Self { instance: instance::CAC1, body: CascadeBody::Cac(message) }
    }

    /// Frame for Restrained Consensus (runs under the first instance).
    pub fn restrained(message: RestrainedConsensusMessage) -> Self {
        Self { instance: instance::CAC1, body: CascadeBody::Restrained(message) }
    }

    /// Frame for the second CAC instance.
    pub fn cac2(message: CacMessage<Cac2Content>) -> Self {
        Self { instance: instance::CAC2, body: CascadeBody::Cac2(message) }
    }

    /// Frame for Full Consensus.
    pub fn consensus(message: ConsensusMessage<Cac2Content>) -> Self {
        Self { instance: instance::FULL_CONSENSUS, body: CascadeBody::Consensus(message) }
    }
}

impl WireEncode for CascadeConsensusMessage {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.instance);
        match &self.body {
            CascadeBody::Cac(m) => {
                buf.put_u8(CascadeBody::TAG_CAC);
                m.encode(buf);
            },
            CascadeBody::Restrained(m) => {
                buf.put_u8(CascadeBody::TAG_RC);
                m.encode(buf);
            },
            CascadeBody::Cac2(m) => {
                buf.put_u8(CascadeBody::TAG_CAC2);
                m.encode(buf);
            },
            CascadeBody::Consensus(m) => {
                buf.put_u8(CascadeBody::TAG_FC);
                m.encode(buf);
            },
        }
    }
}

impl WireDecode for CascadeConsensusMessage {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let instance = wire::get_u8(buf)?;
        let body = match wire::get_u8(buf)? {
            CascadeBody::TAG_CAC => CascadeBody::Cac(CacMessage::decode(buf)?),
            CascadeBody::TAG_RC => CascadeBody::Restrained(RestrainedConsensusMessage::decode(buf)?),
            CascadeBody::TAG_CAC2 => CascadeBody::Cac2(CacMessage::decode(buf)?),
            CascadeBody::TAG_FC => CascadeBody::Consensus(ConsensusMessage::decode(buf)?),
            tag => return Err(WireError::UnknownTag { context: "CascadeConsensusMessage", tag }),
        };
        Ok(Self { instance, body })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::refs::MESSAGE_REF_LABEL;
    use crate::{ContentType, MlsMessage};

    fn sig(sender: u32, payload: &'static [u8]) -> AuthenticatedContent {
        AuthenticatedContent {
            sender: LeafIndex(sender),
            epoch: 1,
            content_type: ContentType::Application,
            payload: Bytes::from_static(payload),
            signature: Bytes::from_static(&[7; 64]),
        }
    }

    fn some_ref(seed: &[u8]) -> MessageRef {
        MessageRef::compute(MESSAGE_REF_LABEL, seed)
    }

    #[test]
    fn cac_message_round_trip() {
        let msg = CacMessage {
            kind: CacKind::Witness,
            sigs: vec![sig(0, b"w0"), sig(1, b"w1")],
            payload: Some(MlsMessage { epoch: 1, body: Bytes::from_static(b"commit") }),
        };
        let decoded =
            CacMessage::<MlsMessage>::decode_exact(&msg.encode_to_bytes()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn cac_ready_without_payload() {
        let msg: CacMessage<MlsMessage> =
            CacMessage { kind: CacKind::Ready, sigs: vec![sig(2, b"r")], payload: None };
        let decoded =
            CacMessage::<MlsMessage>::decode_exact(&msg.encode_to_bytes()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn cac2_content_ref_is_order_sensitive() {
        let a = Cac2Content {
            conflicting_messages: vec![some_ref(b"1"), some_ref(b"2")],
            signatures: vec![],
        };
        let b = Cac2Content {
            conflicting_messages: vec![some_ref(b"2"), some_ref(b"1")],
            signatures: vec![],
        };
        // Senders sort before broadcasting; unsorted submissions are
        // distinct content on purpose.
        assert_ne!(a.content_ref(), b.content_ref());
    }

    #[test]
    fn restrained_round_trip() {
        let content = RestrainedConsContent {
            sig_set: vec![sig(0, b"subset")],
            power_conflict_set: vec![
                vec![],
                vec![(LeafIndex(0), some_ref(b"a"))],
                vec![(LeafIndex(0), some_ref(b"a")), (LeafIndex(1), some_ref(b"b"))],
            ],
            proofs: vec![sig(1, b"proof")],
        };
        let cases = [
            RestrainedConsensusMessage::Participate(content),
            RestrainedConsensusMessage::Retract(sig(2, b"RETRACT")),
        ];
        for case in cases {
            let decoded =
                RestrainedConsensusMessage::decode_exact(&case.encode_to_bytes()).unwrap();
            assert_eq!(case, decoded);
        }
    }

    #[test]
    fn consensus_round_trip() {
        let content = Cac2Content {
            conflicting_messages: vec![some_ref(b"c")],
            signatures: vec![sig(0, b"s")],
        };
        let cases = [
            ConsensusMessage::Propose { view: 0, content: content.clone() },
            ConsensusMessage::PrePrepare { signed: sig(1, b"pp"), proposed: content },
            ConsensusMessage::Prepare(sig(2, b"p")),
            ConsensusMessage::Commit(sig(0, b"c")),
            ConsensusMessage::ViewChange(sig(1, b"vc")),
        ];
        for case in cases {
            let decoded =
                ConsensusMessage::<Cac2Content>::decode_exact(&case.encode_to_bytes()).unwrap();
            assert_eq!(case, decoded);
        }
    }

    #[test]
    fn cascade_frame_round_trip() {
        let frame = CascadeConsensusMessage::cac1(CacMessage {
            kind: CacKind::Witness,
            sigs: vec![sig(0, b"w")],
            payload: None,
        });
        assert_eq!(frame.instance, instance::CAC1);
        let decoded = CascadeConsensusMessage::decode_exact(&frame.encode_to_bytes()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn unknown_stage_tag_rejected() {
        let err = CascadeConsensusMessage::decode_exact(&[1, 9]).unwrap_err();
        assert!(matches!(err, WireError::UnknownTag { context: "CascadeConsensusMessage", tag: 9 }));
    }
}
