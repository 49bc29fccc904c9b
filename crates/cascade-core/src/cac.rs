//! CAC Byzantine-reliable broadcast, generic over its payload type.
//!
//! One instance agrees on a set of candidate messages per epoch. Members
//! endorse candidates with sequenced WITNESS signatures, escalate to READY
//! once a candidate has gathered enough witnesses, and deliver once a
//! candidate has gathered a ready quorum, together with the *conflict
//! set*: every candidate any honest member might still consider. A
//! singleton conflict set means the epoch is uncontended; anything larger
//! is escalated by the caller.
//!
//! Quorum parameters for the `n > 5t + k` regime:
//! `t = (n − k) / 5`, witness quorum `qw = 4t + k`, ready quorum
//! `qr = n − t`. Deployments in the `n > 3t + k` regime must lower the
//! witness quorum accordingly.
//!
//! Re-entrancy: `receive_message` drains an explicit FIFO queue under a
//! flag, so a message enqueued while a drain is in progress is processed
//! by the outer invocation. Locally emitted broadcasts are fed back by the
//! orchestrator (network broadcast excludes self), never recursively.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use cascade_proto::{Cac2Content, CacKind, CacMessage, LeafIndex, MessageRef, MlsMessage};

use crate::group::GroupState;
use crate::signature::CacSignature;

/// Payloads a CAC instance can carry: anything with a stable reference.
pub trait CacPayload: Clone + Eq + std::fmt::Debug {
    /// Domain-separated reference naming this payload.
    fn payload_ref(&self) -> MessageRef;
}

impl CacPayload for MlsMessage {
    fn payload_ref(&self) -> MessageRef {
        self.message_ref()
    }
}

impl CacPayload for Cac2Content {
    fn payload_ref(&self) -> MessageRef {
        self.content_ref()
    }
}

/// Ordering key for choosing among validated candidates.
///
/// The total order is: more proposals first, then smaller sender leaf,
/// then smaller reference. All three components are derived from the
/// candidate itself, so every honest member ranks identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChoiceWeight {
    /// Number of proposals the candidate commits.
    pub proposals: u32,
    /// Leaf index of the candidate's author.
    pub sender: LeafIndex,
}

impl Default for ChoiceWeight {
    fn default() -> Self {
        Self { proposals: 0, sender: LeafIndex(u32::MAX) }
    }
}

impl ChoiceWeight {
    /// Whether `(self, ours)` ranks before `(other, theirs)`.
    pub fn ranks_before(&self, ours: &MessageRef, other: &Self, theirs: &MessageRef) -> bool {
        use std::cmp::Reverse;
        (Reverse(self.proposals), self.sender, ours)
            < (Reverse(other.proposals), other.sender, theirs)
    }
}

/// Actions returned by a CAC instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacAction<T> {
    /// Broadcast this message to every member. The orchestrator must also
    /// feed it back into the instance, since the network excludes self.
    Broadcast(CacMessage<T>),
    /// A payload learned through consensus chatter that the caller has
    /// not yet ratified; hand it to the validation pipeline.
    Transmit(T),
    /// A payload reached its ready quorum.
    Deliver {
        /// The delivered payload.
        payload: T,
        /// Every candidate with at least `k` witnesses.
        conflict_set: Vec<MessageRef>,
        /// The full set of verified signatures, as proof material.
        signatures: Vec<CacSignature>,
    },
}

#[derive(Debug, Default, Clone)]
struct Tallies {
    witnesses: BTreeSet<LeafIndex>,
    readies: BTreeSet<LeafIndex>,
}

/// One per-epoch CAC broadcast instance.
pub struct CacBroadcast<T> {
    k: usize,
    n: usize,
    t: usize,
    qw: usize,
    qr: usize,

    sig_count: u32,
    has_sent_ready: bool,

    draining: bool,
    queue: VecDeque<CacMessage<T>>,

    messages: BTreeMap<MessageRef, T>,
    valid_signatures: BTreeMap<MessageRef, CacSignature>,
    valid_messages: BTreeSet<MessageRef>,
    seen_messages: BTreeSet<MessageRef>,
    waiting_messages: BTreeSet<MessageRef>,
    delivered_messages: BTreeSet<MessageRef>,
    // Highest contiguous count of processed signatures per signer; a
    // signer's next acceptable sequence equals its entry.
    sequences: BTreeMap<LeafIndex, u32>,
    out_of_order: BTreeSet<CacSignature>,
    tallies: BTreeMap<MessageRef, Tallies>,
    weights: BTreeMap<MessageRef, ChoiceWeight>,
}

impl<T: CacPayload> CacBroadcast<T> {
    /// Create an instance with conflict parameter `k`.
    pub fn new(k: usize) -> Self {
        assert!(k >= 1);
        Self {
            k,
            n: 0,
            t: 0,
            qw: 0,
            qr: 0,
            sig_count: 0,
            has_sent_ready: false,
            draining: false,
            queue: VecDeque::new(),
            messages: BTreeMap::new(),
            valid_signatures: BTreeMap::new(),
            valid_messages: BTreeSet::new(),
            seen_messages: BTreeSet::new(),
            waiting_messages: BTreeSet::new(),
            delivered_messages: BTreeSet::new(),
            sequences: BTreeMap::new(),
            out_of_order: BTreeSet::new(),
            tallies: BTreeMap::new(),
            weights: BTreeMap::new(),
        }
    }

    /// Reset all per-epoch state and recompute quorums for the roster.
    pub fn new_epoch<G: GroupState>(&mut self, state: &G) {
        self.n = state.member_count();
        self.t = self.n.saturating_sub(self.k) / 5;
        self.qw = 4 * self.t + self.k;
        self.qr = self.n - self.t;

        self.sig_count = 0;
        self.has_sent_ready = false;
        self.draining = false;
        self.queue.clear();

        self.messages.clear();
        self.valid_signatures.clear();
        self.valid_messages.clear();
        self.seen_messages.clear();
        self.waiting_messages.clear();
        self.delivered_messages.clear();
        self.sequences.clear();
        self.out_of_order.clear();
        self.tallies.clear();
        self.weights.clear();
    }

    /// Whether this instance has emitted any signature this epoch.
    pub fn has_started(&self) -> bool {
        self.sig_count > 0
    }

    /// Payloads seen this epoch, by reference.
    pub fn messages(&self) -> &BTreeMap<MessageRef, T> {
        &self.messages
    }

    /// All verified signatures, ordered by envelope reference.
    pub fn signatures(&self) -> Vec<CacSignature> {
        self.valid_signatures.values().cloned().collect()
    }

    /// Broadcast a payload of our own. A no-op once any statement has
    /// been signed this epoch.
    pub fn broadcast<G: GroupState>(
        &mut self,
        state: &G,
        payload: T,
        weight: ChoiceWeight,
    ) -> Vec<CacAction<T>> {
        if self.sig_count > 0 {
            return Vec::new();
        }

        let reference = payload.payload_ref();
        self.messages.insert(reference, payload.clone());
        self.seen_messages.insert(reference);
        self.valid_messages.insert(reference);
        self.weights.insert(reference, weight);

        self.emit_signature(state, CacKind::Witness, reference);
        vec![self.make_broadcast(CacKind::Witness, Some(payload))]
    }

    /// Ratify a payload as application-layer valid. May trigger the first
    /// witness of the epoch, or release a payload parked in the waiting
    /// set.
    pub fn validate_message<G: GroupState>(
        &mut self,
        state: &G,
        payload: T,
        weight: ChoiceWeight,
    ) -> Vec<CacAction<T>> {
        let reference = payload.payload_ref();
        self.messages.entry(reference).or_insert_with(|| payload.clone());
        self.valid_messages.insert(reference);
        self.weights.insert(reference, weight);

        let mut out = Vec::new();

        if self.sig_count == 0 {
            if let Some(chosen) = self.pick_best_valid() {
                self.waiting_messages.remove(&chosen);
                self.emit_signature(state, CacKind::Witness, chosen);
                let chosen_payload = self.messages.get(&chosen).cloned();
                out.push(self.make_broadcast(CacKind::Witness, chosen_payload));
            }
        }

        if self.waiting_messages.remove(&reference) {
            self.emit_signature(state, CacKind::Witness, reference);
            out.push(self.make_broadcast(CacKind::Witness, None));
        }

        out
    }

    /// Process one incoming CAC message.
    ///
    /// Messages arriving while a drain is in progress are queued and
    /// handled by the outer invocation.
    pub fn receive_message<G: GroupState>(
        &mut self,
        state: &G,
        message: CacMessage<T>,
    ) -> Vec<CacAction<T>> {
        self.queue.push_back(message);
        if self.draining {
            return Vec::new();
        }

        self.draining = true;
        let mut out = Vec::new();
        while let Some(next) = self.queue.pop_front() {
            self.process_message(state, next, &mut out);
        }
        self.draining = false;
        out
    }

    fn process_message<G: GroupState>(
        &mut self,
        state: &G,
        message: CacMessage<T>,
        out: &mut Vec<CacAction<T>>,
    ) {
        if let Some(payload) = &message.payload {
            let reference = payload.payload_ref();
            self.messages.entry(reference).or_insert_with(|| payload.clone());
        }

        for content in &message.sigs {
            if self.valid_signatures.contains_key(&content.content_ref()) {
                continue;
            }
            let Some(sig) = CacSignature::verify_and_convert(state, content) else {
                tracing::debug!(sender = content.sender.0, "dropping unverifiable CAC signature");
                continue;
            };
            self.ingest_signature(sig);
        }
        self.sweep_out_of_order();

        match message.kind {
            CacKind::Witness => self.received_witness(state, out),
            CacKind::Ready => self.received_ready(state, out),
        }
    }

    /// Accept a verified signature if it is the signer's next expected
    /// sequence; buffer it if it is ahead, ignore it if it is behind.
    fn ingest_signature(&mut self, sig: CacSignature) {
        let next = self.sequences.get(&sig.sender()).copied().unwrap_or(0);
        match sig.sequence.cmp(&next) {
            std::cmp::Ordering::Equal => self.process_new_sig(sig),
            std::cmp::Ordering::Greater => {
                self.out_of_order.insert(sig);
            },
            // A second signature claiming an already-processed sequence:
            // replay or equivocation either way, ignore it.
            std::cmp::Ordering::Less => {
                tracing::debug!(
                    sender = sig.sender().0,
                    sequence = sig.sequence,
                    "ignoring stale CAC signature sequence"
                );
            },
        }
    }

    /// Retry buffered signatures until no further one becomes contiguous.
    fn sweep_out_of_order(&mut self) {
        loop {
            let ready: Vec<CacSignature> = self
                .out_of_order
                .iter()
                .filter(|sig| {
                    sig.sequence == self.sequences.get(&sig.sender()).copied().unwrap_or(0)
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }
            for sig in ready {
                self.out_of_order.remove(&sig);
                self.process_new_sig(sig);
            }
        }
        // Buffered sequences below the contiguous frontier can never
        // become acceptable; drop them.
        let sequences = &self.sequences;
        self.out_of_order
            .retain(|sig| sig.sequence > sequences.get(&sig.sender()).copied().unwrap_or(0));
    }

    fn process_new_sig(&mut self, sig: CacSignature) {
        *self.sequences.entry(sig.sender()).or_insert(0) += 1;

        let sender = sig.sender();
        let tallies = self.tallies.entry(sig.referenced).or_default();
        match sig.kind {
            CacKind::Witness => tallies.witnesses.insert(sender),
            CacKind::Ready => tallies.readies.insert(sender),
        };
        self.valid_signatures.insert(sig.content_ref(), sig);
    }

    fn received_witness<G: GroupState>(&mut self, state: &G, out: &mut Vec<CacAction<T>>) {
        // Payloads known to us that the upper layer has only seen through
        // consensus chatter: hand them up for validation.
        let to_transmit: Vec<MessageRef> = self
            .tallies
            .keys()
            .filter(|r| !self.seen_messages.contains(r) && self.messages.contains_key(r))
            .copied()
            .collect();
        for reference in to_transmit {
            self.seen_messages.insert(reference);
            out.push(CacAction::Transmit(self.messages[&reference].clone()));
        }

        if self.sig_count == 0 && !self.valid_messages.is_empty() {
            if let Some(chosen) = self.pick_best_valid() {
                self.emit_signature(state, CacKind::Witness, chosen);
                let payload = self.messages.get(&chosen).cloned();
                out.push(self.make_broadcast(CacKind::Witness, payload));
            }
        }

        let ready_threshold = (self.n + self.t) / 2 + 1;
        if self.tallies.values().any(|t| t.witnesses.len() >= ready_threshold) {
            for reference in self.messages_with_enough_witness() {
                if !self.tallies[&reference].readies.contains(&state.self_index()) {
                    self.emit_signature(state, CacKind::Ready, reference);
                    out.push(self.make_broadcast(CacKind::Ready, None));
                }

                // Uncontended fast path: everyone witnessed one single
                // candidate, no need to wait for the ready round.
                if self.n > 5 * self.t
                    && self.tallies[&reference].witnesses.len() >= self.n - self.t
                    && self.tallies.len() == 1
                    && !self.delivered_messages.contains(&reference)
                {
                    if let Some(payload) = self.messages.get(&reference).cloned() {
                        self.delivered_messages.insert(reference);
                        out.push(CacAction::Deliver {
                            payload,
                            conflict_set: vec![reference],
                            signatures: self.signatures(),
                        });
                    }
                }
            }
        }

        // Once signatures from n − t distinct signers have been seen, the
        // silent minority can no longer change the witnessed picture:
        // either converge on a sufficiently witnessed candidate, or
        // witness every plausible one.
        let seen_processes = self.sequences.len() + 1;
        if seen_processes >= self.n - self.t && !self.has_sent_ready {
            let floor = seen_processes.saturating_sub(2 * self.t);
            let candidate = self
                .tallies
                .iter()
                .find(|(_, t)| t.witnesses.len() >= floor)
                .map(|(r, _)| *r);

            let self_witnessed = |cac: &Self, r: &MessageRef| {
                cac.tallies
                    .get(r)
                    .is_some_and(|t| t.witnesses.contains(&state.self_index()))
            };

            match candidate {
                Some(reference)
                    if self.n > 5 * self.t
                        && !self_witnessed(self, &reference)
                        && self.valid_messages.contains(&reference) =>
                {
                    self.emit_signature(state, CacKind::Witness, reference);
                    out.push(self.make_broadcast(CacKind::Witness, None));
                },
                _ => {
                    let witnessed: Vec<(MessageRef, usize)> = self
                        .tallies
                        .iter()
                        .filter(|(_, t)| !t.witnesses.is_empty())
                        .map(|(r, t)| (*r, t.witnesses.len()))
                        .collect();
                    let min_witnesses =
                        1.max(self.n.saturating_sub(self.t * (witnessed.len() + 1)));

                    for (reference, witness_count) in witnessed {
                        if witness_count >= min_witnesses
                            && !self.waiting_messages.contains(&reference)
                            && !self_witnessed(self, &reference)
                        {
                            if self.valid_messages.contains(&reference) {
                                self.emit_signature(state, CacKind::Witness, reference);
                                out.push(self.make_broadcast(CacKind::Witness, None));
                            } else {
                                self.waiting_messages.insert(reference);
                            }
                        }
                    }
                },
            }
        }
    }

    fn received_ready<G: GroupState>(&mut self, state: &G, out: &mut Vec<CacAction<T>>) {
        let ready_messages = self.messages_with_enough_witness();
        if ready_messages.is_empty() {
            return;
        }

        for reference in &ready_messages {
            if !self.tallies[reference].readies.contains(&state.self_index()) {
                self.emit_signature(state, CacKind::Ready, *reference);
                out.push(self.make_broadcast(CacKind::Ready, None));
            }
        }

        let conflict_set: Vec<MessageRef> = self
            .tallies
            .iter()
            .filter(|(_, t)| t.witnesses.len() >= self.k)
            .map(|(r, _)| *r)
            .collect();

        for reference in &conflict_set {
            if self.tallies[reference].readies.len() >= self.qr
                && !self.delivered_messages.contains(reference)
            {
                let Some(payload) = self.messages.get(reference).cloned() else {
                    // Quorum reached for a payload we only know by hash.
                    // Recovery of the body is out of scope; hold delivery
                    // until some copy arrives with a later message.
                    tracing::warn!(reference = %reference, "ready quorum for unseen payload");
                    continue;
                };
                self.delivered_messages.insert(*reference);
                out.push(CacAction::Deliver {
                    payload,
                    conflict_set: conflict_set.clone(),
                    signatures: self.signatures(),
                });
            }
        }
    }

    /// Candidates whose witness tally reached the witness quorum.
    fn messages_with_enough_witness(&self) -> Vec<MessageRef> {
        self.tallies
            .iter()
            .filter(|(_, t)| t.witnesses.len() >= self.qw)
            .map(|(r, _)| *r)
            .collect()
    }

    /// Best validated candidate under the Choice order.
    fn pick_best_valid(&self) -> Option<MessageRef> {
        let mut best: Option<(MessageRef, ChoiceWeight)> = None;
        for reference in &self.valid_messages {
            let weight = self.weights.get(reference).copied().unwrap_or_default();
            best = match best {
                None => Some((*reference, weight)),
                Some((best_ref, best_weight))
                    if weight.ranks_before(reference, &best_weight, &best_ref) =>
                {
                    Some((*reference, weight))
                },
                keep => keep,
            };
        }
        best.map(|(r, _)| r)
    }

    fn emit_signature<G: GroupState>(&mut self, state: &G, kind: CacKind, reference: MessageRef) {
        let sig = CacSignature::sign(state, self.sig_count, kind, reference);
        self.sig_count += 1;

        let tallies = self.tallies.entry(reference).or_default();
        match kind {
            CacKind::Witness => tallies.witnesses.insert(state.self_index()),
            CacKind::Ready => tallies.readies.insert(state.self_index()),
        };
        self.valid_signatures.insert(sig.content_ref(), sig);
    }

    fn make_broadcast(&mut self, kind: CacKind, payload: Option<T>) -> CacAction<T> {
        if kind == CacKind::Ready {
            self.has_sent_ready = true;
        }
        let sigs = self.valid_signatures.values().map(|s| s.content.clone()).collect();
        CacAction::Broadcast(CacMessage { kind, sigs, payload })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use cascade_proto::{CacKind, CacMessage, Identity, WireEncode};

    use super::*;
    use crate::group::{Credential, RosterGroup};

    /// Build an n-member group, returning each member's view.
    fn build_groups(names: &[&str]) -> Vec<RosterGroup> {
        let creds: Vec<Credential> = names
            .iter()
            .enumerate()
            .map(|(i, n)| Credential::from_seed(Identity::from(*n), [i as u8 + 1; 32]))
            .collect();

        let mut founder = RosterGroup::create(&b"cac-test"[..], creds[0].clone());
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

    fn payload(body: &'static [u8]) -> MlsMessage {
        MlsMessage { epoch: 1, body: Bytes::from_static(body) }
    }

    fn weight(proposals: u32, sender: u32) -> ChoiceWeight {
        ChoiceWeight { proposals, sender: LeafIndex(sender) }
    }

    /// Test pump: apply broadcasts to every instance (including the
    /// sender, standing in for the orchestrator's self-feedback), until
    /// quiescent. Returns all Deliver actions per member.
    struct Pump {
        groups: Vec<RosterGroup>,
        instances: Vec<CacBroadcast<MlsMessage>>,
        delivered: Vec<Vec<CacAction<MlsMessage>>>,
        in_flight: VecDeque<CacMessage<MlsMessage>>,
    }

    impl Pump {
        fn new(names: &[&str]) -> Self {
            let groups = build_groups(names);
            let instances = groups
                .iter()
                .map(|g| {
                    let mut cac = CacBroadcast::new(1);
                    cac.new_epoch(g);
                    cac
                })
                .collect();
            let delivered = vec![Vec::new(); groups.len()];
            Self { groups, instances, delivered, in_flight: VecDeque::new() }
        }

        fn absorb(&mut self, member: usize, actions: Vec<CacAction<MlsMessage>>) {
            for action in actions {
                match action {
                    CacAction::Broadcast(msg) => self.in_flight.push_back(msg),
                    CacAction::Deliver { .. } => self.delivered[member].push(action),
                    CacAction::Transmit(_) => {},
                }
            }
        }

        fn run(&mut self) {
            while let Some(msg) = self.in_flight.pop_front() {
                for i in 0..self.instances.len() {
                    let actions = self.instances[i].receive_message(&self.groups[i], msg.clone());
                    self.absorb(i, actions);
                }
            }
        }
    }

    #[test]
    fn quorum_parameters() {
        let groups = build_groups(&["a", "b", "c"]);
        let mut cac: CacBroadcast<MlsMessage> = CacBroadcast::new(1);
        cac.new_epoch(&groups[0]);
        assert_eq!((cac.n, cac.t, cac.qw, cac.qr), (3, 0, 1, 3));

        let groups = build_groups(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k"]);
        cac.new_epoch(&groups[0]);
        assert_eq!((cac.n, cac.t, cac.qw, cac.qr), (11, 2, 9, 9));
    }

    #[test]
    fn uncontended_broadcast_delivers_everywhere() {
        let mut pump = Pump::new(&["a", "b", "c"]);
        let m = payload(b"commit-a");
        let reference = m.message_ref();

        let actions = pump.instances[0].broadcast(&pump.groups[0], m.clone(), weight(1, 0));
        pump.absorb(0, actions);
        pump.run();

        // B and C ratify the candidate once the upper layer has checked it.
        for i in 1..3 {
            let actions =
                pump.instances[i].validate_message(&pump.groups[i], m.clone(), weight(1, 0));
            pump.absorb(i, actions);
        }
        pump.run();

        for (i, deliveries) in pump.delivered.iter().enumerate() {
            assert_eq!(deliveries.len(), 1, "member {i} delivered {deliveries:?}");
            match &deliveries[0] {
                CacAction::Deliver { payload, conflict_set, .. } => {
                    assert_eq!(payload.message_ref(), reference);
                    assert_eq!(conflict_set, &vec![reference]);
                },
                other => panic!("expected Deliver, got {other:?}"),
            }
        }
    }

    #[test]
    fn broadcast_is_single_shot_per_epoch() {
        let mut pump = Pump::new(&["a", "b", "c"]);
        let first = pump.instances[0].broadcast(&pump.groups[0], payload(b"one"), weight(1, 0));
        assert!(!first.is_empty());
        assert!(pump.instances[0].has_started());

        let second = pump.instances[0].broadcast(&pump.groups[0], payload(b"two"), weight(1, 0));
        assert!(second.is_empty());
    }

    #[test]
    fn conflicting_broadcasts_deliver_with_conflict_set() {
        let mut pump = Pump::new(&["a", "b", "c"]);
        let m_a = payload(b"commit-a");
        let m_b = payload(b"commit-b");

        // A and B sign concurrently, before seeing each other.
        let a_actions = pump.instances[0].broadcast(&pump.groups[0], m_a.clone(), weight(1, 0));
        let b_actions = pump.instances[1].broadcast(&pump.groups[1], m_b.clone(), weight(1, 1));
        pump.absorb(0, a_actions);
        pump.absorb(1, b_actions);

        // C ratifies both candidates.
        let c1 = pump.instances[2].validate_message(&pump.groups[2], m_a.clone(), weight(1, 0));
        pump.absorb(2, c1);
        let c2 = pump.instances[2].validate_message(&pump.groups[2], m_b.clone(), weight(1, 1));
        pump.absorb(2, c2);
        pump.run();

        let mut conflict_sets: Vec<Vec<MessageRef>> = Vec::new();
        for deliveries in &pump.delivered {
            assert!(!deliveries.is_empty(), "every member must deliver");
            for delivery in deliveries {
                if let CacAction::Deliver { conflict_set, .. } = delivery {
                    conflict_sets.push(conflict_set.clone());
                }
            }
        }
        // Whatever was delivered, the conflict set exposes both commits.
        assert!(conflict_sets.iter().all(|cs| cs.len() == 2));
    }

    #[test]
    fn duplicate_signatures_are_idempotent() {
        let mut pump = Pump::new(&["a", "b", "c"]);
        let actions = pump.instances[0].broadcast(&pump.groups[0], payload(b"m"), weight(1, 0));
        let CacAction::Broadcast(msg) = &actions[0] else { panic!("expected broadcast") };

        let first = pump.instances[1].receive_message(&pump.groups[1], msg.clone());
        let count_after_first = pump.instances[1].signatures().len();
        assert!(!first.is_empty() || count_after_first > 0);

        pump.instances[1].receive_message(&pump.groups[1], msg.clone());
        assert_eq!(pump.instances[1].signatures().len(), count_after_first);
    }

    #[test]
    fn out_of_order_sequences_are_buffered_until_contiguous() {
        let mut pump = Pump::new(&["a", "b", "c"]);

        // A emits two signatures: witness (seq 0) and ready (seq 1).
        let m = payload(b"m");
        let reference = m.message_ref();
        pump.instances[0].broadcast(&pump.groups[0], m.clone(), weight(1, 0));
        let sig0 = pump.instances[0].signatures()[0].clone();
        let sig1 = CacSignature::sign(&pump.groups[0], 1, CacKind::Ready, reference);

        // B first hears only the second signature: it must not count yet.
        let gapped: CacMessage<MlsMessage> =
            CacMessage { kind: CacKind::Ready, sigs: vec![sig1.content.clone()], payload: None };
        pump.instances[1].receive_message(&pump.groups[1], gapped);
        assert_eq!(pump.instances[1].signatures().len(), 0);

        // Once the predecessor arrives, both process in order.
        let filler: CacMessage<MlsMessage> = CacMessage {
            kind: CacKind::Witness,
            sigs: vec![sig0.content.clone()],
            payload: Some(m),
        };
        pump.instances[1].receive_message(&pump.groups[1], filler);
        assert_eq!(pump.instances[1].signatures().len(), 2);
    }

    #[test]
    fn forged_signatures_are_dropped() {
        let mut pump = Pump::new(&["a", "b", "c"]);
        let m = payload(b"m");
        pump.instances[0].broadcast(&pump.groups[0], m.clone(), weight(1, 0));

        let mut forged = pump.instances[0].signatures()[0].content.clone();
        forged.payload = Bytes::from_static(b"tampered");

        let msg: CacMessage<MlsMessage> =
            CacMessage { kind: CacKind::Witness, sigs: vec![forged], payload: Some(m) };
        pump.instances[1].receive_message(&pump.groups[1], msg);
        assert!(pump.instances[1].signatures().is_empty());
    }

    #[test]
    fn chatter_payloads_are_transmitted_upward_once() {
        let mut pump = Pump::new(&["a", "b", "c"]);
        let m = payload(b"commit");

        let actions = pump.instances[0].broadcast(&pump.groups[0], m.clone(), weight(1, 0));
        let CacAction::Broadcast(msg) = &actions[0] else { panic!("expected broadcast") };

        let received = pump.instances[1].receive_message(&pump.groups[1], msg.clone());
        let transmits: Vec<_> = received
            .iter()
            .filter(|a| matches!(a, CacAction::Transmit(p) if *p == m))
            .collect();
        assert_eq!(transmits.len(), 1);

        // Replaying the same message does not re-transmit.
        let again = pump.instances[1].receive_message(&pump.groups[1], msg.clone());
        assert!(!again.iter().any(|a| matches!(a, CacAction::Transmit(_))));
    }

    #[test]
    fn emitted_signature_sequences_form_a_strict_prefix() {
        let mut pump = Pump::new(&["a", "b", "c"]);
        let m_a = payload(b"commit-a");
        let m_b = payload(b"commit-b");

        let a = pump.instances[0].broadcast(&pump.groups[0], m_a.clone(), weight(1, 0));
        let b = pump.instances[1].broadcast(&pump.groups[1], m_b.clone(), weight(1, 1));
        pump.absorb(0, a);
        pump.absorb(1, b);
        let c1 = pump.instances[2].validate_message(&pump.groups[2], m_a, weight(1, 0));
        pump.absorb(2, c1);
        let c2 = pump.instances[2].validate_message(&pump.groups[2], m_b, weight(1, 1));
        pump.absorb(2, c2);
        pump.run();

        // From any member's collected signature set, every signer's
        // sequences are exactly 0, 1, …, k.
        for member in 0..3 {
            let mut per_sender: BTreeMap<LeafIndex, Vec<u32>> = BTreeMap::new();
            for sig in pump.instances[member].signatures() {
                per_sender.entry(sig.sender()).or_default().push(sig.sequence);
            }
            for (sender, mut sequences) in per_sender {
                sequences.sort_unstable();
                let expected: Vec<u32> = (0..sequences.len() as u32).collect();
                assert_eq!(
                    sequences, expected,
                    "member {member} holds a gapped sequence for signer {sender}"
                );
            }
        }
    }

    #[test]
    fn choice_weight_total_order() {
        let r_small = MessageRef::compute(b"t", b"a").min(MessageRef::compute(b"t", b"b"));
        let r_big = MessageRef::compute(b"t", b"a").max(MessageRef::compute(b"t", b"b"));

        // More proposals wins.
        assert!(weight(3, 5).ranks_before(&r_big, &weight(2, 0), &r_small));
        // Equal proposals: smaller sender wins.
        assert!(weight(2, 1).ranks_before(&r_big, &weight(2, 4), &r_small));
        // Full tie: smaller reference wins.
        assert!(weight(2, 1).ranks_before(&r_small, &weight(2, 1), &r_big));
        assert!(!weight(2, 1).ranks_before(&r_big, &weight(2, 1), &r_small));
    }
}
