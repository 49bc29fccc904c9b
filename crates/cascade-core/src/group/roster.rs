//! Roster-backed implementation of the group facade.
//!
//! `RosterGroup` keeps the part of an MLS group the delivery service can
//! observe: a leaf-indexed roster of Ed25519 verification keys, an epoch
//! counter, and the proposals cached for the next commit. Signing and
//! verification are real; the key schedule and welcome secrets of a full
//! MLS engine stay behind the [`GroupState`] seam.
//!
//! Leaf indices are stable: removing a member blanks its leaf, and adds
//! fill the first blank leaf before extending the roster.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes};
use cascade_proto::wire::{self, WireDecode, WireEncode, WireError};
use cascade_proto::{AuthenticatedContent, ContentType, Identity, LeafIndex, MessageRef, MlsMessage};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

use super::error::GroupError;
use super::GroupState;

/// Domain prefix for roster signatures.
const SIGNATURE_DOMAIN: &[u8] = b"cascade-dds 1.0 signed content";

/// A member's long-term identity and signing key.
#[derive(Clone)]
pub struct Credential {
    identity: Identity,
    signing_key: SigningKey,
}

impl Credential {
    /// Generate a credential from fresh randomness.
    pub fn generate(identity: Identity, rng: &mut impl RngCore) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self::from_seed(identity, seed)
    }

    /// Deterministic credential from a fixed seed.
    pub fn from_seed(identity: Identity, seed: [u8; 32]) -> Self {
        Self { identity, signing_key: SigningKey::from_bytes(&seed) }
    }

    /// The credential's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The key package to publish to the directory service.
    pub fn key_package(&self) -> KeyPackage {
        KeyPackage {
            identity: self.identity.clone(),
            verify_key: Bytes::copy_from_slice(self.signing_key.verifying_key().as_bytes()),
        }
    }
}

/// Published credential material used to invite a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPackage {
    /// Identity the package belongs to.
    pub identity: Identity,
    /// Ed25519 verification key, 32 bytes.
    pub verify_key: Bytes,
}

impl WireEncode for KeyPackage {
    fn encode(&self, buf: &mut impl BufMut) {
        self.identity.encode(buf);
        wire::put_bytes(buf, &self.verify_key);
    }
}

impl WireDecode for KeyPackage {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self { identity: Identity::decode(buf)?, verify_key: wire::get_bytes(buf)? })
    }
}

/// One occupied leaf of the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RosterEntry {
    identity: Identity,
    verify_key: Bytes,
}

impl WireEncode for RosterEntry {
    fn encode(&self, buf: &mut impl BufMut) {
        self.identity.encode(buf);
        wire::put_bytes(buf, &self.verify_key);
    }
}

impl WireDecode for RosterEntry {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self { identity: Identity::decode(buf)?, verify_key: wire::get_bytes(buf)? })
    }
}

/// Welcome package for newly added members: the public roster as of the
/// epoch the commit creates. Blank leaves are preserved so indices match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    /// Group identifier.
    pub group_id: Bytes,
    /// Epoch the joiner starts in (the post-commit epoch).
    pub epoch: u64,
    leaves: Vec<Option<RosterEntry>>,
}

impl WireEncode for Welcome {
    fn encode(&self, buf: &mut impl BufMut) {
        wire::put_bytes(buf, &self.group_id);
        buf.put_u64(self.epoch);
        buf.put_u32(self.leaves.len() as u32);
        for leaf in &self.leaves {
            wire::put_opt(buf, leaf);
        }
    }
}

impl WireDecode for Welcome {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        let group_id = wire::get_bytes(buf)?;
        let epoch = wire::get_u64(buf)?;
        let count = wire::get_u32(buf)? as usize;
        if count > wire::MAX_FIELD_LEN {
            return Err(WireError::FieldTooLarge { len: count });
        }
        let mut leaves = Vec::with_capacity(count);
        for _ in 0..count {
            leaves.push(wire::get_opt(buf)?);
        }
        Ok(Self { group_id, epoch, leaves })
    }
}

/// A membership or key-update proposal body.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Proposal {
    Add(KeyPackage),
    Remove(Identity),
    Update(Bytes),
}

impl Proposal {
    const TAG_ADD: u8 = 1;
    const TAG_REMOVE: u8 = 2;
    const TAG_UPDATE: u8 = 3;
}

impl WireEncode for Proposal {
    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::Add(kp) => {
                buf.put_u8(Self::TAG_ADD);
                kp.encode(buf);
            },
            Self::Remove(id) => {
                buf.put_u8(Self::TAG_REMOVE);
                id.encode(buf);
            },
            Self::Update(key) => {
                buf.put_u8(Self::TAG_UPDATE);
                wire::put_bytes(buf, key);
            },
        }
    }
}

impl WireDecode for Proposal {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        match wire::get_u8(buf)? {
            Self::TAG_ADD => Ok(Self::Add(KeyPackage::decode(buf)?)),
            Self::TAG_REMOVE => Ok(Self::Remove(Identity::decode(buf)?)),
            Self::TAG_UPDATE => Ok(Self::Update(wire::get_bytes(buf)?)),
            tag => Err(WireError::UnknownTag { context: "Proposal", tag }),
        }
    }
}

/// Commit body: the proposals being finalised, by reference, plus a nonce
/// so concurrent commits over the same proposals stay distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CommitBody {
    nonce: Bytes,
    proposal_refs: Vec<MessageRef>,
}

impl WireEncode for CommitBody {
    fn encode(&self, buf: &mut impl BufMut) {
        wire::put_bytes(buf, &self.nonce);
        wire::put_list(buf, &self.proposal_refs);
    }
}

impl WireDecode for CommitBody {
    fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self { nonce: wire::get_bytes(buf)?, proposal_refs: wire::get_list(buf)? })
    }
}

#[derive(Debug, Clone)]
struct PendingProposal {
    sender: LeafIndex,
    proposal: Proposal,
}

/// Concrete group facade: Ed25519 roster, structured proposals, commits
/// by proposal reference.
#[derive(Clone)]
pub struct RosterGroup {
    group_id: Bytes,
    epoch: u64,
    leaves: Vec<Option<RosterEntry>>,
    self_index: LeafIndex,
    identity: Identity,
    signing_key: SigningKey,
    pending: BTreeMap<MessageRef, PendingProposal>,
    // Signing key staged by a self-update, installed when the update is
    // committed.
    staged_update_key: Option<SigningKey>,
}

impl RosterGroup {
    /// Create a new group with the local member as the only leaf.
    pub fn create(group_id: impl Into<Bytes>, credential: Credential) -> Self {
        let entry = RosterEntry {
            identity: credential.identity.clone(),
            verify_key: Bytes::copy_from_slice(credential.signing_key.verifying_key().as_bytes()),
        };
        Self {
            group_id: group_id.into(),
            epoch: 0,
            leaves: vec![Some(entry)],
            self_index: LeafIndex(0),
            identity: credential.identity,
            signing_key: credential.signing_key,
            pending: BTreeMap::new(),
            staged_update_key: None,
        }
    }

    /// Join a group from an encoded welcome package.
    pub fn from_welcome(credential: Credential, welcome_bytes: &[u8]) -> Result<Self, GroupError> {
        let welcome = Welcome::decode_exact(welcome_bytes)
            .map_err(|e| GroupError::Malformed(e.to_string()))?;

        let own_key = credential.signing_key.verifying_key();
        let self_index = welcome
            .leaves
            .iter()
            .position(|leaf| {
                leaf.as_ref().is_some_and(|entry| {
                    entry.identity == credential.identity
                        && entry.verify_key.as_ref() == own_key.as_bytes()
                })
            })
            .ok_or_else(|| GroupError::NotWelcomed {
                identity: credential.identity.to_string(),
            })?;

        Ok(Self {
            group_id: welcome.group_id,
            epoch: welcome.epoch,
            leaves: welcome.leaves,
            self_index: LeafIndex(self_index as u32),
            identity: credential.identity,
            signing_key: credential.signing_key,
            pending: BTreeMap::new(),
            staged_update_key: None,
        })
    }

    /// Fresh commit randomness.
    pub fn fresh_secret(rng: &mut impl RngCore) -> [u8; 32] {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        secret
    }

    /// The local member's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Propose adding a member by key package.
    pub fn propose_add(&self, key_package: KeyPackage) -> Result<MlsMessage, GroupError> {
        if self.leaf_of(&key_package.identity).is_some() {
            return Err(GroupError::AlreadyMember { identity: key_package.identity.to_string() });
        }
        Ok(self.protect_content(ContentType::Proposal, &Proposal::Add(key_package).encode_to_bytes()))
    }

    /// Propose removing a member by identity. `None` if not a member.
    pub fn propose_remove(&self, identity: &Identity) -> Option<MlsMessage> {
        self.leaf_of(identity)?;
        Some(self.protect_content(
            ContentType::Proposal,
            &Proposal::Remove(identity.clone()).encode_to_bytes(),
        ))
    }

    /// Propose rotating the local member's signing key. The new key is
    /// staged and installed when the update is committed.
    pub fn propose_update(&mut self, seed: [u8; 32]) -> MlsMessage {
        let new_key = SigningKey::from_bytes(&seed);
        let verify_key = Bytes::copy_from_slice(new_key.verifying_key().as_bytes());
        self.staged_update_key = Some(new_key);
        self.protect_content(ContentType::Proposal, &Proposal::Update(verify_key).encode_to_bytes())
    }

    /// Leaf index of a proposal's author, if the message is a valid
    /// proposal of the current epoch.
    pub fn proposal_sender(&self, message: &MlsMessage) -> Option<LeafIndex> {
        self.classify(message, ContentType::Proposal).map(|c| c.sender)
    }

    /// Cache a delivered proposal for the next commit.
    pub fn handle_proposal(&mut self, message: &MlsMessage) -> Result<MessageRef, GroupError> {
        let content = self
            .classify(message, ContentType::Proposal)
            .ok_or(GroupError::InvalidMessage { what: "proposal", epoch: self.epoch })?;
        let proposal = Proposal::decode_exact(&content.payload)
            .map_err(|e| GroupError::Malformed(e.to_string()))?;

        let reference = message.message_ref();
        self.pending
            .insert(reference, PendingProposal { sender: content.sender, proposal });
        Ok(reference)
    }

    /// Drop pending self-update proposals. Called on a staging clone
    /// before self-committing, so a member never commits its own update.
    pub fn remove_self_updates(&mut self) {
        let own = self.self_index;
        self.pending.retain(|_, p| {
            !(p.sender == own && matches!(p.proposal, Proposal::Update(_)))
        });
    }

    /// Build a commit over every cached proposal, plus the welcome for
    /// members the commit adds.
    pub fn commit_pending(&self, nonce: [u8; 32]) -> (MlsMessage, Option<Welcome>) {
        let proposal_refs: Vec<MessageRef> = self.pending.keys().copied().collect();
        let body = CommitBody {
            nonce: Bytes::copy_from_slice(&nonce),
            proposal_refs,
        };
        let commit = self.protect_content(ContentType::Commit, &body.encode_to_bytes());

        let adds_members = self
            .pending
            .values()
            .any(|p| matches!(p.proposal, Proposal::Add(_)));
        let welcome = adds_members.then(|| Welcome {
            group_id: self.group_id.clone(),
            epoch: self.epoch + 1,
            leaves: self.projected_leaves(self.pending.values()),
        });

        (commit, welcome)
    }

    /// Apply a delivered commit: mutate the roster, advance the epoch and
    /// clear the per-epoch caches.
    pub fn merge_commit(&mut self, message: &MlsMessage) -> Result<(), GroupError> {
        let content = self
            .classify(message, ContentType::Commit)
            .ok_or(GroupError::InvalidMessage { what: "commit", epoch: self.epoch })?;
        let body = CommitBody::decode_exact(&content.payload)
            .map_err(|e| GroupError::Malformed(e.to_string()))?;

        let mut referenced = Vec::with_capacity(body.proposal_refs.len());
        for reference in &body.proposal_refs {
            let pending = self.pending.get(reference).ok_or(GroupError::UnknownProposal {
                reference: reference.short(),
            })?;
            referenced.push(pending.clone());
        }

        self.leaves = self.projected_leaves(referenced.iter());

        let own_update_committed = referenced
            .iter()
            .any(|p| p.sender == self.self_index && matches!(p.proposal, Proposal::Update(_)));
        if own_update_committed {
            if let Some(new_key) = self.staged_update_key.take() {
                self.signing_key = new_key;
            }
        }

        self.epoch += 1;
        self.pending.clear();
        self.staged_update_key = None;
        Ok(())
    }

    /// Roster after applying the given proposals, without mutating.
    fn projected_leaves<'a>(
        &self,
        proposals: impl Iterator<Item = &'a PendingProposal>,
    ) -> Vec<Option<RosterEntry>> {
        let mut leaves = self.leaves.clone();
        for pending in proposals {
            match &pending.proposal {
                Proposal::Add(kp) => {
                    if leaves.iter().flatten().any(|e| e.identity == kp.identity) {
                        continue;
                    }
                    let entry = RosterEntry {
                        identity: kp.identity.clone(),
                        verify_key: kp.verify_key.clone(),
                    };
                    match leaves.iter_mut().find(|leaf| leaf.is_none()) {
                        Some(blank) => *blank = Some(entry),
                        None => leaves.push(Some(entry)),
                    }
                },
                Proposal::Remove(identity) => {
                    for leaf in leaves.iter_mut() {
                        if leaf.as_ref().is_some_and(|e| &e.identity == identity) {
                            *leaf = None;
                        }
                    }
                },
                Proposal::Update(verify_key) => {
                    let index = pending.sender.0 as usize;
                    if let Some(Some(entry)) = leaves.get_mut(index) {
                        entry.verify_key = verify_key.clone();
                    }
                },
            }
        }
        leaves
    }

    fn leaf_of(&self, identity: &Identity) -> Option<LeafIndex> {
        self.leaves.iter().enumerate().find_map(|(i, leaf)| {
            leaf.as_ref()
                .filter(|entry| &entry.identity == identity)
                .map(|_| LeafIndex(i as u32))
        })
    }

    fn sign_content(&self, content_type: ContentType, payload: &[u8]) -> AuthenticatedContent {
        let mut content = AuthenticatedContent {
            sender: self.self_index,
            epoch: self.epoch,
            content_type,
            payload: Bytes::copy_from_slice(payload),
            signature: Bytes::new(),
        };
        let signature = self.signing_key.sign(&self.signing_transcript(&content));
        content.signature = Bytes::copy_from_slice(&signature.to_bytes());
        content
    }

    fn signing_transcript(&self, content: &AuthenticatedContent) -> Vec<u8> {
        let mut transcript = Vec::new();
        transcript.extend_from_slice(SIGNATURE_DOMAIN);
        wire::put_bytes(&mut transcript, &self.group_id);
        transcript.extend_from_slice(&content.to_be_signed());
        transcript
    }

    fn protect_content(&self, content_type: ContentType, payload: &[u8]) -> MlsMessage {
        let content = self.sign_content(content_type, payload);
        MlsMessage { epoch: self.epoch, body: content.encode_to_bytes() }
    }

    /// Unwrap a message of the current epoch whose content verifies and
    /// matches `expected`.
    fn classify(
        &self,
        message: &MlsMessage,
        expected: ContentType,
    ) -> Option<AuthenticatedContent> {
        if message.epoch != self.epoch {
            return None;
        }
        let content = AuthenticatedContent::decode_exact(&message.body).ok()?;
        if content.epoch != message.epoch || content.content_type != expected {
            return None;
        }
        if !self.verify(&content) {
            return None;
        }
        Some(content)
    }
}

impl GroupState for RosterGroup {
    fn group_id(&self) -> &[u8] {
        &self.group_id
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn self_index(&self) -> LeafIndex {
        self.self_index
    }

    fn member_count(&self) -> usize {
        self.leaves.iter().flatten().count()
    }

    fn member_identities(&self, exclude_self: bool) -> Vec<Identity> {
        self.leaves
            .iter()
            .enumerate()
            .filter_map(|(i, leaf)| {
                let entry = leaf.as_ref()?;
                if exclude_self && LeafIndex(i as u32) == self.self_index {
                    None
                } else {
                    Some(entry.identity.clone())
                }
            })
            .collect()
    }

    fn member_indices(&self) -> Vec<LeafIndex> {
        self.leaves
            .iter()
            .enumerate()
            .filter_map(|(i, leaf)| leaf.as_ref().map(|_| LeafIndex(i as u32)))
            .collect()
    }

    fn identity_of(&self, index: LeafIndex) -> Option<Identity> {
        self.leaves.get(index.0 as usize)?.as_ref().map(|e| e.identity.clone())
    }

    fn sign(&self, payload: &[u8]) -> AuthenticatedContent {
        self.sign_content(ContentType::Application, payload)
    }

    fn verify(&self, content: &AuthenticatedContent) -> bool {
        let Some(Some(entry)) = self.leaves.get(content.sender.0 as usize) else {
            return false;
        };
        let Ok(key_bytes) = <[u8; 32]>::try_from(entry.verify_key.as_ref()) else {
            return false;
        };
        let Ok(verify_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&content.signature) else {
            return false;
        };
        verify_key.verify(&self.signing_transcript(content), &signature).is_ok()
    }

    fn protect(&self, payload: &[u8]) -> MlsMessage {
        self.protect_content(ContentType::Application, payload)
    }

    fn unprotect_application(&self, message: &MlsMessage) -> Option<Bytes> {
        self.classify(message, ContentType::Application).map(|c| c.payload)
    }

    fn valid_proposal(&self, message: &MlsMessage) -> Option<MessageRef> {
        let content = self.classify(message, ContentType::Proposal)?;
        Proposal::decode_exact(&content.payload).ok()?;
        Some(message.message_ref())
    }

    fn valid_commit(&self, message: &MlsMessage) -> Option<BTreeSet<MessageRef>> {
        let content = self.classify(message, ContentType::Commit)?;
        let body = CommitBody::decode_exact(&content.payload).ok()?;
        Some(body.proposal_refs.into_iter().collect())
    }

    fn commit_sender(&self, message: &MlsMessage) -> Option<LeafIndex> {
        self.classify(message, ContentType::Commit).map(|c| c.sender)
    }

    fn commit_proposal_count(&self, message: &MlsMessage) -> Option<usize> {
        let content = self.classify(message, ContentType::Commit)?;
        let body = CommitBody::decode_exact(&content.payload).ok()?;
        Some(body.proposal_refs.len())
    }

    fn commit_membership_changes(&self, message: &MlsMessage) -> (Vec<Identity>, Vec<Identity>) {
        let mut added = Vec::new();
        let mut removed = Vec::new();

        let Some(content) = self.classify(message, ContentType::Commit) else {
            return (added, removed);
        };
        let Ok(body) = CommitBody::decode_exact(&content.payload) else {
            return (added, removed);
        };

        for reference in &body.proposal_refs {
            let Some(pending) = self.pending.get(reference) else {
                tracing::warn!(reference = %reference, "commit references unknown proposal");
                continue;
            };
            match &pending.proposal {
                Proposal::Add(kp) => added.push(kp.identity.clone()),
                Proposal::Remove(identity) => removed.push(identity.clone()),
                Proposal::Update(_) => {},
            }
        }

        (added, removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(name: &str, seed: u8) -> Credential {
        Credential::from_seed(Identity::from(name), [seed; 32])
    }

    fn two_member_group() -> (RosterGroup, RosterGroup) {
        let alice_cred = credential("alice", 1);
        let bob_cred = credential("bob", 2);

        let mut alice = RosterGroup::create(&b"test-group"[..], alice_cred);
        let proposal = alice.propose_add(bob_cred.key_package()).unwrap();
        alice.handle_proposal(&proposal).unwrap();

        let (commit, welcome) = alice.commit_pending([9u8; 32]);
        alice.merge_commit(&commit).unwrap();

        let welcome_bytes = welcome.unwrap().encode_to_bytes();
        let bob = RosterGroup::from_welcome(bob_cred, &welcome_bytes).unwrap();
        (alice, bob)
    }

    #[test]
    fn create_starts_at_epoch_zero() {
        let group = RosterGroup::create(&b"g"[..], credential("alice", 1));
        assert_eq!(group.epoch(), 0);
        assert_eq!(group.self_index(), LeafIndex(0));
        assert_eq!(group.member_count(), 1);
    }

    #[test]
    fn add_commit_welcome_join() {
        let (alice, bob) = two_member_group();
        assert_eq!(alice.epoch(), 1);
        assert_eq!(bob.epoch(), 1);
        assert_eq!(bob.self_index(), LeafIndex(1));
        assert_eq!(
            alice.member_identities(false),
            vec![Identity::from("alice"), Identity::from("bob")]
        );
        assert_eq!(bob.member_identities(true), vec![Identity::from("alice")]);
    }

    #[test]
    fn sign_verify_across_members() {
        let (alice, bob) = two_member_group();
        let signed = alice.sign(b"statement");
        assert!(bob.verify(&signed));

        let mut tampered = signed.clone();
        tampered.payload = Bytes::from_static(b"other");
        assert!(!bob.verify(&tampered));
    }

    #[test]
    fn protect_unprotect_round_trip() {
        let (alice, bob) = two_member_group();
        let message = alice.protect(b"hi");
        assert_eq!(bob.unprotect_application(&message).unwrap(), Bytes::from_static(b"hi"));
        // Wrong content type is not an application message.
        let proposal = alice.propose_remove(&Identity::from("bob")).unwrap();
        assert!(bob.unprotect_application(&proposal).is_none());
    }

    #[test]
    fn epoch_mismatch_rejected() {
        let (alice, bob) = two_member_group();
        let mut message = alice.protect(b"hi");
        message.epoch = 7;
        assert!(bob.unprotect_application(&message).is_none());
    }

    #[test]
    fn commit_classification_and_changes() {
        let (mut alice, mut bob) = two_member_group();
        let carol_cred = credential("carol", 3);

        let proposal = alice.propose_add(carol_cred.key_package()).unwrap();
        let reference = alice.handle_proposal(&proposal).unwrap();
        bob.handle_proposal(&proposal).unwrap();

        let (commit, welcome) = alice.commit_pending([1u8; 32]);
        assert!(welcome.is_some());
        assert_eq!(bob.valid_commit(&commit).unwrap(), BTreeSet::from([reference]));
        assert_eq!(bob.commit_sender(&commit), Some(LeafIndex(0)));
        assert_eq!(bob.commit_proposal_count(&commit), Some(1));

        let (added, removed) = bob.commit_membership_changes(&commit);
        assert_eq!(added, vec![Identity::from("carol")]);
        assert!(removed.is_empty());

        bob.merge_commit(&commit).unwrap();
        alice.merge_commit(&commit).unwrap();
        assert_eq!(bob.epoch(), 2);
        assert_eq!(bob.member_count(), 3);
        assert_eq!(alice.member_identities(false), bob.member_identities(false));
    }

    #[test]
    fn remove_blanks_leaf_keeping_indices() {
        let (mut alice, mut bob) = two_member_group();
        let carol_cred = credential("carol", 3);
        let add = alice.propose_add(carol_cred.key_package()).unwrap();
        alice.handle_proposal(&add).unwrap();
        bob.handle_proposal(&add).unwrap();
        let (commit, _) = alice.commit_pending([1u8; 32]);
        alice.merge_commit(&commit).unwrap();
        bob.merge_commit(&commit).unwrap();

        let remove = alice.propose_remove(&Identity::from("bob")).unwrap();
        alice.handle_proposal(&remove).unwrap();
        let (commit, welcome) = alice.commit_pending([2u8; 32]);
        assert!(welcome.is_none());
        alice.merge_commit(&commit).unwrap();

        // Carol keeps leaf 2 even though leaf 1 is now blank.
        assert_eq!(alice.member_indices(), vec![LeafIndex(0), LeafIndex(2)]);
        assert_eq!(alice.identity_of(LeafIndex(2)), Some(Identity::from("carol")));
        assert_eq!(alice.identity_of(LeafIndex(1)), None);
    }

    #[test]
    fn self_update_rotates_key_on_merge() {
        let (mut alice, mut bob) = two_member_group();

        let update = bob.propose_update([7u8; 32]);
        alice.handle_proposal(&update).unwrap();
        bob.handle_proposal(&update).unwrap();

        let (commit, _) = alice.commit_pending([3u8; 32]);
        alice.merge_commit(&commit).unwrap();
        bob.merge_commit(&commit).unwrap();

        // Bob signs with the rotated key and Alice accepts it.
        let signed = bob.sign(b"post-update");
        assert!(alice.verify(&signed));
    }

    #[test]
    fn remove_self_updates_drops_only_own_updates() {
        let (mut alice, mut bob) = two_member_group();

        let own_update = alice.propose_update([5u8; 32]);
        alice.handle_proposal(&own_update).unwrap();
        let bobs_update = bob.propose_update([6u8; 32]);
        alice.handle_proposal(&bobs_update).unwrap();

        let mut staged = alice.clone();
        staged.remove_self_updates();
        let (commit, _) = staged.commit_pending([4u8; 32]);
        // Only Bob's update survives in the commit.
        assert_eq!(alice.commit_proposal_count(&commit), Some(1));
    }

    #[test]
    fn welcome_requires_membership() {
        let (mut alice, _bob) = two_member_group();
        let carol_cred = credential("carol", 3);
        let mallory_cred = credential("mallory", 4);

        let add = alice.propose_add(carol_cred.key_package()).unwrap();
        alice.handle_proposal(&add).unwrap();
        let (commit, welcome) = alice.commit_pending([8u8; 32]);
        alice.merge_commit(&commit).unwrap();
        let welcome_bytes = welcome.unwrap().encode_to_bytes();

        assert!(RosterGroup::from_welcome(carol_cred, &welcome_bytes).is_ok());
        assert!(matches!(
            RosterGroup::from_welcome(mallory_cred, &welcome_bytes),
            Err(GroupError::NotWelcomed { .. })
        ));
    }

    #[test]
    fn concurrent_commits_are_distinct_messages() {
        let (mut alice, mut bob) = two_member_group();
        let update = bob.propose_update([7u8; 32]);
        alice.handle_proposal(&update).unwrap();
        bob.handle_proposal(&update).unwrap();

        let (commit_a, _) = alice.commit_pending([1u8; 32]);
        let (commit_b, _) = bob.commit_pending([1u8; 32]);
        assert_ne!(commit_a.message_ref(), commit_b.message_ref());
    }
}
