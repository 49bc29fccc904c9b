//! Sequenced CAC signatures.
//!
//! A CAC signature is an [`AuthenticatedContent`] whose application
//! payload encodes `(sequence, kind, referenced message)`. Every honest
//! member numbers its signatures 0, 1, 2, … within an epoch; receivers
//! refuse to process a signature until all its predecessors have been
//! processed, which prevents a Byzantine member from reordering its own
//! statements.

use bytes::{Buf, BufMut};
use cascade_proto::wire::{self, WireDecode, WireEncode, WireError};
use cascade_proto::{AuthenticatedContent, CacKind, ContentType, LeafIndex, MessageRef};

use crate::group::GroupState;

/// Encoded body of a CAC signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacSignatureBody {
    sequence: u32,
    kind: CacKind,
    referenced: MessageRef,
}

impl WireEncode for CacSignatureBody {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sequence);
        self.kind.encode(buf);
        self.referenced.encode(buf);
    }
}

impl WireDecode for CacSignatureBody {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            sequence: wire::get_u32(buf)?,
            kind: CacKind::decode(buf)?,
            referenced: MessageRef::decode(buf)?,
        })
    }
}

/// A verified, decoded CAC signature.
///
/// Only [`CacSignature::sign`] and [`CacSignature::verify_and_convert`]
/// construct values of this type, so holding one implies the envelope
/// verified under the epoch it was checked against. Equality and ordering
/// go by the envelope reference, so the same signature received through
/// different paths deduplicates cleanly.
#[derive(Debug, Clone)]
pub struct CacSignature {
    /// Position in the signer's per-epoch emission order.
    pub sequence: u32,
    /// Witness or ready.
    pub kind: CacKind,
    /// The message the statement is about.
    pub referenced: MessageRef,
    /// The signed envelope, as received or emitted.
    pub content: AuthenticatedContent,
    content_ref: MessageRef,
}

impl CacSignature {
    /// Sign a new statement under the current group state.
    pub fn sign<G: GroupState>(
        state: &G,
        sequence: u32,
        kind: CacKind,
        referenced: MessageRef,
    ) -> Self {
        let body = CacSignatureBody { sequence, kind, referenced };
        let content = state.sign(&body.encode_to_bytes());
        let content_ref = content.content_ref();
        Self { sequence, kind, referenced, content, content_ref }
    }

    /// Verify an envelope and decode it as a CAC signature.
    ///
    /// Returns `None` unless the envelope (i) verifies against the
    /// roster, (ii) targets the current epoch, (iii) is application
    /// content, and (iv) decodes as a well-formed signature body.
    pub fn verify_and_convert<G: GroupState>(
        state: &G,
        content: &AuthenticatedContent,
    ) -> Option<Self> {
        if content.epoch != state.epoch()
            || content.content_type != ContentType::Application
            || !state.verify(content)
        {
            return None;
        }
        let body = CacSignatureBody::decode_exact(&content.payload).ok()?;
        Some(Self {
            sequence: body.sequence,
            kind: body.kind,
            referenced: body.referenced,
            content: content.clone(),
            content_ref: content.content_ref(),
        })
    }

    /// Leaf index of the signer.
    pub fn sender(&self) -> LeafIndex {
        self.content.sender
    }

    /// Whether this is a witness statement.
    pub fn is_witness(&self) -> bool {
        self.kind == CacKind::Witness
    }

    /// Whether this is a ready statement.
    pub fn is_ready(&self) -> bool {
        self.kind == CacKind::Ready
    }

    /// Reference of the signed envelope.
    pub fn content_ref(&self) -> MessageRef {
        self.content_ref
    }
}

impl PartialEq for CacSignature {
    fn eq(&self, other: &Self) -> bool {
        self.content_ref == other.content_ref
    }
}

impl Eq for CacSignature {}

impl PartialOrd for CacSignature {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacSignature {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.content_ref.cmp(&other.content_ref)
    }
}

#[cfg(test)]
mod tests {
    use cascade_proto::refs::MESSAGE_REF_LABEL;
    use cascade_proto::Identity;

    use super::*;
    use crate::group::{Credential, RosterGroup};

    fn group_pair() -> (RosterGroup, RosterGroup) {
        let alice = Credential::from_seed(Identity::from("alice"), [1u8; 32]);
        let bob = Credential::from_seed(Identity::from("bob"), [2u8; 32]);

        let mut group_a = RosterGroup::create(&b"sig-test"[..], alice);
        let proposal = group_a.propose_add(bob.key_package()).unwrap();
        group_a.handle_proposal(&proposal).unwrap();
        let (commit, welcome) = group_a.commit_pending([0u8; 32]);
        group_a.merge_commit(&commit).unwrap();
        let group_b =
            RosterGroup::from_welcome(bob, &welcome.unwrap().encode_to_bytes()).unwrap();
        (group_a, group_b)
    }

    fn reference(seed: &[u8]) -> MessageRef {
        MessageRef::compute(MESSAGE_REF_LABEL, seed)
    }

    #[test]
    fn sign_then_convert_round_trip() {
        let (alice, bob) = group_pair();
        let signed = CacSignature::sign(&alice, 0, CacKind::Witness, reference(b"m"));

        let converted = CacSignature::verify_and_convert(&bob, &signed.content).unwrap();
        assert_eq!(converted, signed);
        assert_eq!(converted.sequence, 0);
        assert!(converted.is_witness());
        assert_eq!(converted.sender(), alice.self_index());
        assert_eq!(converted.referenced, reference(b"m"));
    }

    #[test]
    fn wrong_epoch_rejected() {
        let (alice, bob) = group_pair();
        let mut content = CacSignature::sign(&alice, 0, CacKind::Ready, reference(b"m")).content;
        content.epoch = 5;
        assert!(CacSignature::verify_and_convert(&bob, &content).is_none());
    }

    #[test]
    fn tampered_body_rejected() {
        let (alice, bob) = group_pair();
        let mut content =
            CacSignature::sign(&alice, 0, CacKind::Witness, reference(b"m")).content;
        let mut payload = content.payload.to_vec();
        payload[0] ^= 1; // flip a sequence bit
        content.payload = payload.into();
        assert!(CacSignature::verify_and_convert(&bob, &content).is_none());
    }

    #[test]
    fn malformed_body_rejected() {
        let (alice, bob) = group_pair();
        let content = alice.sign(b"not a signature body");
        assert!(CacSignature::verify_and_convert(&bob, &content).is_none());
    }

    #[test]
    fn ordering_follows_envelope_ref() {
        let (alice, _) = group_pair();
        let a = CacSignature::sign(&alice, 0, CacKind::Witness, reference(b"m"));
        let b = CacSignature::sign(&alice, 1, CacKind::Witness, reference(b"m"));
        assert_ne!(a, b);
        assert_eq!(a.cmp(&b), a.content_ref().cmp(&b.content_ref()));
    }
}
