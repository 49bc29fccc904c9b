//! The authenticated-content envelope and member addressing types.
//!
//! [`AuthenticatedContent`] is the signed statement format reused by every
//! consensus layer: CAC signatures, Restrained Consensus subsets and
//! retracts, and PBFT vote contents are all application payloads inside
//! this envelope. Verification is performed by the group facade against
//! the roster of the current epoch.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};

use crate::refs::{AUTH_CONTENT_REF_LABEL, MessageRef};
use crate::wire::{self, Result, WireDecode, WireEncode, WireError};

/// Position of a member in the group's leaf ordering.
///
/// Leaf indices are stable across an epoch; removals blank a leaf rather
/// than shifting its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeafIndex(pub u32);

impl fmt::Display for LeafIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WireEncode for LeafIndex {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.0);
    }
}

impl WireDecode for LeafIndex {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self(wire::get_u32(buf)?))
    }
}

/// Opaque member identity, unique per member.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity(pub Bytes);

impl Identity {
    /// Build an identity from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl WireEncode for Identity {
    fn encode(&self, buf: &mut impl BufMut) {
        wire::put_bytes(buf, &self.0);
    }
}

impl WireDecode for Identity {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self(wire::get_bytes(buf)?))
    }
}

/// Content classification inside an MLS framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    /// Application data (also carries every consensus statement).
    Application = 1,
    /// A membership or key-update proposal.
    Proposal = 2,
    /// A commit finalising proposals and advancing the epoch.
    Commit = 3,
}

impl ContentType {
    /// Parse a wire tag.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Application),
            2 => Some(Self::Proposal),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

impl WireEncode for ContentType {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(*self as u8);
    }
}

impl WireDecode for ContentType {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let tag = wire::get_u8(buf)?;
        Self::from_u8(tag).ok_or(WireError::UnknownTag { context: "ContentType", tag })
    }
}

/// A signed statement bound to a group epoch.
///
/// The signature covers the to-be-signed transcript produced by
/// [`AuthenticatedContent::to_be_signed`]; the group facade supplies the
/// group binding (group id, signature domain) when signing and verifying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedContent {
    /// Leaf index of the signer.
    pub sender: LeafIndex,
    /// Epoch the statement belongs to.
    pub epoch: u64,
    /// Classification of `payload`.
    pub content_type: ContentType,
    /// Statement body.
    pub payload: Bytes,
    /// Signature over the to-be-signed transcript.
    pub signature: Bytes,
}

impl AuthenticatedContent {
    /// The transcript covered by the signature.
    pub fn to_be_signed(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 8 + 1 + 4 + self.payload.len());
        self.sender.encode(&mut buf);
        buf.put_u64(self.epoch);
        self.content_type.encode(&mut buf);
        wire::put_bytes(&mut buf, &self.payload);
        buf
    }

    /// Reference naming this envelope, used to deduplicate signatures
    /// received through different paths.
    pub fn content_ref(&self) -> MessageRef {
        MessageRef::compute(AUTH_CONTENT_REF_LABEL, &self.encode_to_bytes())
    }
}

impl WireEncode for AuthenticatedContent {
    fn encode(&self, buf: &mut impl BufMut) {
        self.sender.encode(buf);
        buf.put_u64(self.epoch);
        self.content_type.encode(buf);
        wire::put_bytes(buf, &self.payload);
        wire::put_bytes(buf, &self.signature);
    }
}

impl WireDecode for AuthenticatedContent {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            sender: LeafIndex::decode(buf)?,
            epoch: wire::get_u64(buf)?,
            content_type: ContentType::decode(buf)?,
            payload: wire::get_bytes(buf)?,
            signature: wire::get_bytes(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuthenticatedContent {
        AuthenticatedContent {
            sender: LeafIndex(3),
            epoch: 7,
            content_type: ContentType::Application,
            payload: Bytes::from_static(b"statement"),
            signature: Bytes::from_static(&[0xAA; 64]),
        }
    }

    #[test]
    fn round_trip() {
        let ac = sample();
        let decoded = AuthenticatedContent::decode_exact(&ac.encode_to_bytes()).unwrap();
        assert_eq!(ac, decoded);
    }

    #[test]
    fn signature_excluded_from_transcript() {
        let mut ac = sample();
        let tbs = ac.to_be_signed();
        ac.signature = Bytes::from_static(&[0xBB; 64]);
        assert_eq!(tbs, ac.to_be_signed());
    }

    #[test]
    fn envelope_ref_covers_signature() {
        let mut ac = sample();
        let r1 = ac.content_ref();
        ac.signature = Bytes::from_static(&[0xBB; 64]);
        assert_ne!(r1, ac.content_ref());
    }

    #[test]
    fn unknown_content_type_rejected() {
        let mut wire_bytes = sample().encode_to_bytes().to_vec();
        // sender (4) + epoch (8) precede the content type byte
        wire_bytes[12] = 9;
        assert!(matches!(
            AuthenticatedContent::decode_exact(&wire_bytes),
            Err(WireError::UnknownTag { context: "ContentType", tag: 9 })
        ));
    }
}
