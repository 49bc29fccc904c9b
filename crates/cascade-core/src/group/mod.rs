//! The group state facade.
//!
//! The delivery service never talks to the MLS engine directly.
//! Everything it needs (epoch, roster, signing, verification, message
//! classification) goes through the [`GroupState`] trait. The cryptographic group itself
//! (key schedule, ratchet tree, welcome secrets) lives behind this seam
//! and is out of scope here.
//!
//! [`RosterGroup`] is the concrete implementation shipped with the
//! workspace: an Ed25519-signed roster with structured proposals and
//! commits, sufficient for running and testing the full delivery stack.

pub mod error;
pub mod roster;

use std::collections::BTreeSet;

use bytes::Bytes;
use cascade_proto::{AuthenticatedContent, Identity, LeafIndex, MessageRef, MlsMessage};

pub use error::GroupError;
pub use roster::{Credential, KeyPackage, RosterGroup, Welcome};

/// Facade over an MLS-style cryptographic group.
///
/// Classification methods (`valid_proposal`, `valid_commit`,
/// `unprotect_application`) return `None` both for messages from another
/// epoch and for messages that fail verification; the caller cannot and
/// need not distinguish the two.
pub trait GroupState {
    /// Identifier of the group.
    fn group_id(&self) -> &[u8];

    /// Current epoch.
    fn epoch(&self) -> u64;

    /// Leaf index of the local member.
    fn self_index(&self) -> LeafIndex;

    /// Number of occupied leaves.
    fn member_count(&self) -> usize;

    /// Identities of all occupied leaves, optionally without the local
    /// member, in leaf order.
    fn member_identities(&self, exclude_self: bool) -> Vec<Identity>;

    /// Indices of all occupied leaves, ascending.
    fn member_indices(&self) -> Vec<LeafIndex>;

    /// Identity at a leaf, if occupied.
    fn identity_of(&self, index: LeafIndex) -> Option<Identity>;

    /// Sign arbitrary application content under the current epoch.
    fn sign(&self, payload: &[u8]) -> AuthenticatedContent;

    /// Verify a signed envelope against the roster.
    ///
    /// Checks the signature only; epoch gating is the caller's concern.
    fn verify(&self, content: &AuthenticatedContent) -> bool;

    /// Protect application content into an MLS message for the wire.
    fn protect(&self, payload: &[u8]) -> MlsMessage;

    /// Unprotect an application message of the current epoch.
    fn unprotect_application(&self, message: &MlsMessage) -> Option<Bytes>;

    /// Classify a proposal of the current epoch, returning its reference.
    fn valid_proposal(&self, message: &MlsMessage) -> Option<MessageRef>;

    /// Classify a commit of the current epoch, returning the proposals it
    /// references.
    fn valid_commit(&self, message: &MlsMessage) -> Option<BTreeSet<MessageRef>>;

    /// Leaf index of a commit's author.
    fn commit_sender(&self, message: &MlsMessage) -> Option<LeafIndex>;

    /// Number of proposals a commit references (Choice ordering input).
    fn commit_proposal_count(&self, message: &MlsMessage) -> Option<usize>;

    /// Identities added and removed by a commit, resolved against the
    /// proposals cached in the current epoch.
    fn commit_membership_changes(&self, message: &MlsMessage) -> (Vec<Identity>, Vec<Identity>);
}
