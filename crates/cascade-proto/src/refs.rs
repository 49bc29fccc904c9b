//! Domain-separated cryptographic references.
//!
//! A [`MessageRef`] names a message by hash so that the consensus layers
//! can exchange and count statements about a message without shipping its
//! body every time. Two distinct messages never share a reference
//! (collision resistance of SHA-256); equality and ordering are
//! byte-lexicographic.

use std::fmt;

use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};

use crate::wire::{self, Result, WireDecode, WireEncode};

/// Reference label for [`MlsMessage`](crate::MlsMessage) envelopes.
pub const MESSAGE_REF_LABEL: &[u8] = b"MLS 1.0 Message Reference";

/// Reference label for [`Cac2Content`](crate::Cac2Content) payloads.
pub const CAC2_CONTENT_REF_LABEL: &[u8] = b"Distributed Delivery Service 1.0 CAC 2 Content";

/// Reference label for deduplicating signed envelopes. Never on the wire.
pub const AUTH_CONTENT_REF_LABEL: &[u8] = b"Distributed Delivery Service 1.0 Signature Reference";

/// A 32-byte domain-separated hash naming a message.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageRef([u8; 32]);

impl MessageRef {
    /// Byte width of a reference on the wire.
    pub const LEN: usize = 32;

    /// Hash `content` under `label`.
    ///
    /// The transcript is `label ‖ len(content) ‖ content`, so values hashed
    /// under different labels can never collide with each other.
    pub fn compute(label: &[u8], content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update((content.len() as u64).to_be_bytes());
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Raw reference bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageRef({})", self.short())
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl WireEncode for MessageRef {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }
}

impl WireDecode for MessageRef {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        wire::need(buf, Self::LEN)?;
        let mut bytes = [0u8; Self::LEN];
        buf.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }
}
