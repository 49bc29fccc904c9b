//! Restrained Consensus: a short agreement round among the members whose
//! commits conflicted.
//!
//! Only conflict-set authors participate. Each signs every power-set
//! subset containing itself and sends the lot, with CAC proofs, to the
//! other participants. A member that receives a participation without
//! having proposed signs a `RETRACT` and withdraws. The round completes
//! when a unique maximum subset is fully signed; any validation failure,
//! ambiguity or timeout terminates with ⊥ and falls through to the next
//! pipeline stage.

use std::collections::{BTreeMap, BTreeSet};

use cascade_proto::{
    AuthenticatedContent, Identity, LeafIndex, MessageRef, RestrainedConsContent,
    RestrainedConsensusMessage,
};
use cascade_proto::wire::{WireDecode, WireEncode};

use crate::group::GroupState;
use crate::signature::CacSignature;

/// Sentinel payload of a retract signature.
const RETRACT_PAYLOAD: &[u8] = b"RETRACT";

type Pair = (LeafIndex, MessageRef);

/// Actions returned by the Restrained Consensus state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestrainedAction {
    /// Send to the listed participants.
    SendParticipants {
        /// Conflict-set authors to reach.
        to: Vec<Identity>,
        /// Participation or retract message.
        message: RestrainedConsensusMessage,
    },
    /// Arm the 2·RTT decision timeout.
    SetTimer,
    /// Disarm the decision timeout.
    CancelTimer,
    /// The round completed on a unique fully signed subset.
    Decide {
        /// References of the agreed conflict pairs.
        refs: Vec<MessageRef>,
        /// One subset signature per participant.
        signatures: Vec<AuthenticatedContent>,
        /// Retract signatures collected along the way.
        retracts: Vec<AuthenticatedContent>,
    },
    /// The round terminated with ⊥.
    Bottom,
}

/// Per-epoch Restrained Consensus state.
pub struct RestrainedConsensus {
    retracting: bool,
    proposed: bool,
    finished: bool,
    timer_armed: bool,
    power_set: Vec<Vec<Pair>>,
    signed: BTreeMap<BTreeSet<Pair>, BTreeMap<LeafIndex, AuthenticatedContent>>,
    retracts: Vec<AuthenticatedContent>,
}

impl RestrainedConsensus {
    /// Fresh, idle instance.
    pub fn new() -> Self {
        Self {
            retracting: false,
            proposed: false,
            finished: false,
            timer_armed: false,
            power_set: Vec::new(),
            signed: BTreeMap::new(),
            retracts: Vec::new(),
        }
    }

    /// Reset for a new epoch, disarming any pending timeout.
    pub fn new_epoch(&mut self) -> Vec<RestrainedAction> {
        let mut out = Vec::new();
        if self.timer_armed {
            self.timer_armed = false;
            out.push(RestrainedAction::CancelTimer);
        }
        self.retracting = false;
        self.proposed = false;
        self.finished = false;
        self.power_set.clear();
        self.signed.clear();
        self.retracts.clear();
        out
    }

    /// Whether the round reached a terminal state.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Whether this member withdrew from the round.
    pub fn retracting(&self) -> bool {
        self.retracting
    }

    /// Enter the round as a participant.
    ///
    /// `conflict` holds the `(author, commit ref)` pairs of the CAC
    /// conflict set; `proofs` the CAC signatures justifying them.
    pub fn propose<G: GroupState>(
        &mut self,
        state: &G,
        conflict: &[Pair],
        proofs: &[CacSignature],
    ) -> Vec<RestrainedAction> {
        if self.retracting || self.proposed {
            return Vec::new();
        }
        self.proposed = true;

        self.power_set = power_set(conflict);

        let own = state.self_index();
        let mut sig_set = Vec::new();
        for subset in &self.power_set {
            if subset.iter().any(|(leaf, _)| *leaf == own) {
                let sig = state.sign(&subset.encode_to_bytes());
                sig_set.push(sig.clone());
                self.signed
                    .entry(subset.iter().copied().collect())
                    .or_default()
                    .insert(own, sig);
            }
        }

        // Retracts that raced ahead of our own delivery still count.
        let already_retracted: Vec<LeafIndex> =
            self.retracts.iter().map(|r| r.sender).collect();
        for retracted in already_retracted {
            self.drop_retracted(retracted);
        }

        let content = RestrainedConsContent {
            sig_set,
            power_conflict_set: self.power_set.clone(),
            proofs: proofs.iter().map(|p| p.content.clone()).collect(),
        };

        let mut out = vec![
            RestrainedAction::SendParticipants {
                to: participants_of_pairs(state, conflict),
                message: RestrainedConsensusMessage::Participate(content),
            },
            RestrainedAction::SetTimer,
        ];
        self.timer_armed = true;

        out.extend(self.check_completion());
        out
    }

    /// Process an incoming round message. Silent once terminal.
    pub fn receive_message<G: GroupState>(
        &mut self,
        state: &G,
        message: RestrainedConsensusMessage,
    ) -> Vec<RestrainedAction> {
        if self.finished {
            return Vec::new();
        }
        match message {
            RestrainedConsensusMessage::Participate(content) => {
                self.handle_participate(state, content)
            },
            RestrainedConsensusMessage::Retract(retract) => self.handle_retract(state, retract),
        }
    }

    /// The 2·RTT decision timeout fired.
    pub fn handle_timeout(&mut self) -> Vec<RestrainedAction> {
        self.timer_armed = false;
        self.bottom()
    }

    fn handle_participate<G: GroupState>(
        &mut self,
        state: &G,
        content: RestrainedConsContent,
    ) -> Vec<RestrainedAction> {
        // Every proof must verify and convert.
        let mut proofs = Vec::with_capacity(content.proofs.len());
        for raw in &content.proofs {
            match CacSignature::verify_and_convert(state, raw) {
                Some(proof) => proofs.push(proof),
                None => {
                    tracing::debug!("restrained consensus: invalid proof, terminating with bottom");
                    return self.bottom();
                },
            }
        }

        // Proof sequences must be gap-free per sender.
        let mut sequences: BTreeMap<LeafIndex, BTreeSet<u32>> = BTreeMap::new();
        for proof in &proofs {
            sequences.entry(proof.sender()).or_default().insert(proof.sequence);
        }
        for seqs in sequences.values() {
            let highest = *seqs.iter().next_back().expect("non-empty sequence set");
            if highest as usize > seqs.len() - 1 {
                tracing::debug!("restrained consensus: proof sequence gap, terminating");
                return self.bottom();
            }
        }

        // Who is participating?
        let Some(sender) = content.sig_set.first().map(|sig| sig.sender) else {
            return self.bottom();
        };

        // Each claimed pair must be backed by a witness proof for that
        // exact message.
        for subset in &content.power_conflict_set {
            for (_, reference) in subset {
                let covered =
                    proofs.iter().any(|p| p.is_witness() && p.referenced == *reference);
                if !covered {
                    tracing::debug!(reference = %reference, "restrained consensus: unproven pair");
                    return self.bottom();
                }
            }
        }

        // All subset signatures must verify, share one sender, and parse.
        let mut signed_subsets: BTreeMap<BTreeSet<Pair>, AuthenticatedContent> = BTreeMap::new();
        for sig in &content.sig_set {
            if sig.sender != sender || sig.epoch != state.epoch() || !state.verify(sig) {
                return self.bottom();
            }
            let Ok(pairs) = Vec::<Pair>::decode_exact(&sig.payload) else {
                return self.bottom();
            };
            signed_subsets.insert(pairs.into_iter().collect(), sig.clone());
        }

        if self.proposed {
            for (subset, sig) in signed_subsets {
                self.signed.entry(subset).or_default().insert(sender, sig);
            }
            self.check_completion()
        } else {
            // We did not deliver a conflicting commit ourselves: withdraw
            // so the participants can converge without us.
            let sig = state.sign(RETRACT_PAYLOAD);
            self.retracting = true;
            vec![RestrainedAction::SendParticipants {
                to: participants_of_power_set(state, &content.power_conflict_set),
                message: RestrainedConsensusMessage::Retract(sig),
            }]
        }
    }

    fn handle_retract<G: GroupState>(
        &mut self,
        state: &G,
        retract: AuthenticatedContent,
    ) -> Vec<RestrainedAction> {
        if retract.epoch != state.epoch() {
            return Vec::new(); // replay from an earlier epoch
        }
        if retract.payload.as_ref() != RETRACT_PAYLOAD || !state.verify(&retract) {
            return Vec::new();
        }
        if self.retracts.iter().any(|r| r.sender == retract.sender) {
            return Vec::new();
        }

        let retracted = retract.sender;
        self.retracts.push(retract);
        self.drop_retracted(retracted);
        self.check_completion()
    }

    fn drop_retracted(&mut self, retracted: LeafIndex) {
        self.power_set
            .retain(|subset| !subset.iter().any(|(leaf, _)| *leaf == retracted));
    }

    fn check_completion(&mut self) -> Vec<RestrainedAction> {
        if self.power_set.is_empty() {
            return Vec::new();
        }

        let mut biggest: &Vec<Pair> = &self.power_set[0];
        let mut unique = true;
        for subset in &self.power_set[1..] {
            if subset.len() > biggest.len() {
                biggest = subset;
                unique = true;
            } else if subset.len() == biggest.len() {
                unique = false;
            }
        }

        if !unique {
            return self.bottom();
        }

        let key: BTreeSet<Pair> = biggest.iter().copied().collect();
        let Some(signatures) = self.signed.get(&key) else {
            return Vec::new();
        };
        if signatures.len() != biggest.len() {
            return Vec::new();
        }

        self.finished = true;
        let mut out = Vec::new();
        if self.timer_armed {
            self.timer_armed = false;
            out.push(RestrainedAction::CancelTimer);
        }
        out.push(RestrainedAction::Decide {
            refs: biggest.iter().map(|(_, r)| *r).collect(),
            signatures: signatures.values().cloned().collect(),
            retracts: self.retracts.clone(),
        });
        out
    }

    fn bottom(&mut self) -> Vec<RestrainedAction> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        if self.timer_armed {
            self.timer_armed = false;
            out.push(RestrainedAction::CancelTimer);
        }
        out.push(RestrainedAction::Bottom);
        out
    }
}

impl Default for RestrainedConsensus {
    fn default() -> Self {
        Self::new()
    }
}

/// Power set of the input, empty subset included.
fn power_set<T: Clone>(input: &[T]) -> Vec<Vec<T>> {
    let mut subsets: Vec<Vec<T>> = vec![Vec::new()];
    for item in input.iter().rev() {
        let count = subsets.len();
        for i in 0..count {
            let mut with_item = vec![item.clone()];
            with_item.extend(subsets[i].iter().cloned());
            subsets.push(with_item);
        }
    }
    subsets
}

fn participants_of_pairs<G: GroupState>(state: &G, pairs: &[Pair]) -> Vec<Identity> {
    pairs.iter().filter_map(|(leaf, _)| state.identity_of(*leaf)).collect()
}

fn participants_of_power_set<G: GroupState>(
    state: &G,
    power: &[Vec<Pair>],
) -> Vec<Identity> {
    // Each participant appears in exactly one single-element subset.
    power
        .iter()
        .filter(|subset| subset.len() == 1)
        .filter_map(|subset| state.identity_of(subset[0].0))
        .collect()
}

#[cfg(test)]
mod tests {
    use cascade_proto::refs::MESSAGE_REF_LABEL;
    use cascade_proto::{CacKind, Identity};

    use super::*;
    use crate::group::{Credential, RosterGroup};

    fn build_groups(names: &[&str]) -> Vec<RosterGroup> {
        let creds: Vec<Credential> = names
            .iter()
            .enumerate()
            .map(|(i, n)| Credential::from_seed(Identity::from(*n), [i as u8 + 1; 32]))
            .collect();

        let mut founder = RosterGroup::create(&b"rc-test"[..], creds[0].clone());
        for cred in &creds[1..] {
            let p = founder.propose_add(cred.key_package()).unwrap();
            founder.handle_proposal(&p).unwrap();
        }
        let (commit, welcome) = founder.commit_pending([0u8; 32]);
        founder.merge_commit(&commit).unwrap();
        let welcome = welcome.unwrap().encode_to_bytes();

        let mut groups = vec![founder];
        for cred in creds.into_iter().skip(1) {
            groups.push(RosterGroup::from_welcome(cred, &welcome).unwrap());
        }
        groups
    }

    fn reference(seed: &[u8]) -> MessageRef {
        MessageRef::compute(MESSAGE_REF_LABEL, seed)
    }

    /// Conflict pairs and witness proofs as the cascade would supply them.
    fn conflict_fixture(groups: &[RosterGroup]) -> (Vec<Pair>, Vec<CacSignature>) {
        let pairs =
            vec![(LeafIndex(0), reference(b"commit-a")), (LeafIndex(1), reference(b"commit-b"))];
        let proofs = vec![
            CacSignature::sign(&groups[0], 0, CacKind::Witness, pairs[0].1),
            CacSignature::sign(&groups[1], 0, CacKind::Witness, pairs[1].1),
        ];
        (pairs, proofs)
    }

    fn extract_participation(actions: &[RestrainedAction]) -> RestrainedConsensusMessage {
        actions
            .iter()
            .find_map(|a| match a {
                RestrainedAction::SendParticipants { message, .. } => Some(message.clone()),
                _ => None,
            })
            .expect("participation message")
    }

    #[test]
    fn power_set_includes_every_subset() {
        let set = power_set(&[1, 2, 3]);
        assert_eq!(set.len(), 8);
        assert!(set.contains(&vec![]));
        assert!(set.contains(&vec![1, 2, 3]));
        assert!(set.contains(&vec![2, 3]));
    }

    #[test]
    fn two_participants_decide_the_full_pair_set() {
        let groups = build_groups(&["a", "b", "c"]);
        let (pairs, proofs) = conflict_fixture(&groups);

        let mut rc_a = RestrainedConsensus::new();
        let mut rc_b = RestrainedConsensus::new();

        let a_actions = rc_a.propose(&groups[0], &pairs, &proofs);
        let b_actions = rc_b.propose(&groups[1], &pairs, &proofs);
        assert!(matches!(a_actions[1], RestrainedAction::SetTimer));

        // Cross-deliver the participation messages.
        let from_a = extract_participation(&a_actions);
        let from_b = extract_participation(&b_actions);
        let a_result = rc_a.receive_message(&groups[0], from_b);
        let b_result = rc_b.receive_message(&groups[1], from_a);

        for (i, result) in [a_result, b_result].into_iter().enumerate() {
            let decide = result
                .iter()
                .find_map(|a| match a {
                    RestrainedAction::Decide { refs, signatures, retracts } => {
                        Some((refs.clone(), signatures.len(), retracts.len()))
                    },
                    _ => None,
                })
                .unwrap_or_else(|| panic!("participant {i} should decide: {result:?}"));
            let (refs, sig_count, retract_count) = decide;
            assert_eq!(refs.len(), 2);
            assert_eq!(sig_count, 2);
            assert_eq!(retract_count, 0);
        }
        assert!(rc_a.finished() && rc_b.finished());
    }

    #[test]
    fn non_proposer_retracts_and_proposers_decide_without_it() {
        let groups = build_groups(&["a", "b", "c"]);
        let (pairs, proofs) = conflict_fixture(&groups);

        let mut rc_a = RestrainedConsensus::new();
        let mut rc_c = RestrainedConsensus::new();

        let a_actions = rc_a.propose(&groups[0], &pairs, &proofs);
        let from_a = extract_participation(&a_actions);

        // C never delivered a conflicting commit of its own: it retracts.
        let c_actions = rc_c.receive_message(&groups[2], from_a);
        assert!(rc_c.retracting());
        let retract = extract_participation(&c_actions);
        assert!(matches!(retract, RestrainedConsensusMessage::Retract(_)));

        // A absorbs the retract; C authored no pair, so the power set is
        // untouched and the round simply continues.
        let a_result = rc_a.receive_message(&groups[0], retract);
        assert!(!a_result.iter().any(|a| matches!(a, RestrainedAction::Bottom)));
        assert!(!rc_a.finished());
    }

    #[test]
    fn retract_from_pair_author_shrinks_the_outcome() {
        let groups = build_groups(&["a", "b", "c"]);
        let (pairs, proofs) = conflict_fixture(&groups);

        let mut rc_a = RestrainedConsensus::new();
        let a_actions = rc_a.propose(&groups[0], &pairs, &proofs);
        drop(a_actions);

        // B (author of the second pair) retracts instead of proposing.
        let retract = RestrainedConsensusMessage::Retract(groups[1].sign(RETRACT_PAYLOAD));
        let result = rc_a.receive_message(&groups[0], retract);

        // Every subset containing B is gone; {A} is the unique biggest
        // and A already signed it.
        let decide = result
            .iter()
            .find_map(|a| match a {
                RestrainedAction::Decide { refs, retracts, .. } => {
                    Some((refs.clone(), retracts.len()))
                },
                _ => None,
            })
            .expect("should decide after retract");
        assert_eq!(decide.0, vec![pairs[0].1]);
        assert_eq!(decide.1, 1);
    }

    #[test]
    fn invalid_proof_terminates_with_bottom() {
        let groups = build_groups(&["a", "b", "c"]);
        let (pairs, proofs) = conflict_fixture(&groups);

        let mut rc_a = RestrainedConsensus::new();
        let mut rc_b = RestrainedConsensus::new();
        let mut from_b = extract_participation(&rc_b.propose(&groups[1], &pairs, &proofs));

        if let RestrainedConsensusMessage::Participate(content) = &mut from_b {
            // Corrupt a proof signature.
            let mut broken = content.proofs[0].clone();
            broken.signature = bytes::Bytes::from_static(&[0u8; 64]);
            content.proofs[0] = broken;
        }

        rc_a.propose(&groups[0], &pairs, &proofs);
        let result = rc_a.receive_message(&groups[0], from_b);
        assert!(result.iter().any(|a| matches!(a, RestrainedAction::Bottom)));
        assert!(rc_a.finished());
    }

    #[test]
    fn unproven_pair_terminates_with_bottom() {
        let groups = build_groups(&["a", "b", "c"]);
        let (pairs, proofs) = conflict_fixture(&groups);

        // B claims an extra pair nobody witnessed.
        let mut padded = pairs.clone();
        padded.push((LeafIndex(2), reference(b"unproven")));

        let mut rc_b = RestrainedConsensus::new();
        let from_b = extract_participation(&rc_b.propose(&groups[1], &padded, &proofs));

        let mut rc_a = RestrainedConsensus::new();
        rc_a.propose(&groups[0], &pairs, &proofs);
        let result = rc_a.receive_message(&groups[0], from_b);
        assert!(result.iter().any(|a| matches!(a, RestrainedAction::Bottom)));
    }

    #[test]
    fn timeout_terminates_with_bottom_once() {
        let groups = build_groups(&["a", "b", "c"]);
        let (pairs, proofs) = conflict_fixture(&groups);

        let mut rc = RestrainedConsensus::new();
        rc.propose(&groups[0], &pairs, &proofs);

        let first = rc.handle_timeout();
        assert!(first.iter().any(|a| matches!(a, RestrainedAction::Bottom)));
        assert!(rc.finished());

        let second = rc.handle_timeout();
        assert!(second.is_empty());
    }

    #[test]
    fn new_epoch_resets_terminal_state() {
        let groups = build_groups(&["a", "b", "c"]);
        let (pairs, proofs) = conflict_fixture(&groups);

        let mut rc = RestrainedConsensus::new();
        rc.propose(&groups[0], &pairs, &proofs);
        rc.handle_timeout();
        assert!(rc.finished());

        let actions = rc.new_epoch();
        assert!(actions.is_empty()); // timer already fired
        assert!(!rc.finished() && !rc.retracting());
    }
}
