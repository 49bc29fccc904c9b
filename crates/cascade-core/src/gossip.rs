//! Murmur-style epidemic gossip for proposals and application messages.
//!
//! Each member maintains a random sample of peers and forwards every
//! first-seen message to all of them. Subscriptions are replayed: a peer
//! added to the sample mid-epoch receives everything seen so far, which
//! tolerates subscription races at the cost of duplicate frames. The
//! received-set guarantees exactly-once local delivery within an epoch.

use std::collections::{BTreeMap, BTreeSet};

use cascade_proto::{GossipMessage, Identity, MessageRef, MlsMessage};
use rand::seq::SliceRandom;
use rand::RngCore;

use crate::group::GroupState;

/// Minimum number of peers to keep in the forwarding sample.
pub const MINIMUM_PEERS: usize = 6;

/// Actions returned by the gossip broadcaster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipAction {
    /// Send to one peer, connecting on demand.
    Send {
        /// Peer to reach.
        to: Identity,
        /// Message to deliver.
        message: GossipMessage,
    },
    /// Send to every currently connected peer in the list.
    SendSample {
        /// Sampled peers.
        to: Vec<Identity>,
        /// Message to deliver.
        message: GossipMessage,
    },
    /// Hand a first-seen payload to the layer above.
    Deliver(MlsMessage),
}

/// Murmur gossip broadcaster.
pub struct GossipBroadcaster {
    self_id: Identity,
    sample: BTreeSet<Identity>,
    received: BTreeMap<MessageRef, MlsMessage>,
}

impl GossipBroadcaster {
    /// Create an empty broadcaster for the given local identity.
    pub fn new(self_id: Identity) -> Self {
        Self { self_id, sample: BTreeSet::new(), received: BTreeMap::new() }
    }

    /// Peers currently in the forwarding sample, in stable order.
    pub fn sample(&self) -> Vec<Identity> {
        self.sample.iter().cloned().collect()
    }

    /// References received so far this epoch.
    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// Fill the sample for a fresh group and subscribe to the new peers.
    pub fn init<G: GroupState>(
        &mut self,
        state: &G,
        rng: &mut impl RngCore,
    ) -> Vec<GossipAction> {
        self.refill_sample(state, rng)
    }

    /// Start a new epoch: clear the received set, drop removed members
    /// from the sample, and top the sample back up.
    pub fn new_epoch<G: GroupState>(
        &mut self,
        state: &G,
        removed: &[Identity],
        rng: &mut impl RngCore,
    ) -> Vec<GossipAction> {
        self.received.clear();
        for id in removed {
            self.sample.remove(id);
        }
        self.refill_sample(state, rng)
    }

    /// Process one incoming gossip frame.
    pub fn receive_message(&mut self, message: GossipMessage) -> Vec<GossipAction> {
        match message {
            GossipMessage::Gossip(payload) => {
                if self.received.contains_key(&payload.message_ref()) {
                    return Vec::new();
                }
                self.dispatch_message(payload)
            },
            GossipMessage::Subscribe(id) => {
                if !self.sample.insert(id.clone()) {
                    return Vec::new();
                }
                tracing::debug!(peer = %id, "gossip subscription, replaying received set");
                self.received
                    .values()
                    .map(|payload| GossipAction::Send {
                        to: id.clone(),
                        message: GossipMessage::Gossip(payload.clone()),
                    })
                    .collect()
            },
        }
    }

    /// Record, forward and locally deliver a payload. This is both the
    /// locally originated entry point and the tail of remote reception.
    pub fn dispatch_message(&mut self, payload: MlsMessage) -> Vec<GossipAction> {
        self.received.insert(payload.message_ref(), payload.clone());

        let mut actions = Vec::with_capacity(2);
        if !self.sample.is_empty() {
            actions.push(GossipAction::SendSample {
                to: self.sample(),
                message: GossipMessage::Gossip(payload.clone()),
            });
        }
        actions.push(GossipAction::Deliver(payload));
        actions
    }

    /// Top the sample up to `max(log10(n), MINIMUM_PEERS)` peers drawn
    /// uniformly from the members not already sampled.
    fn refill_sample<G: GroupState>(
        &mut self,
        state: &G,
        rng: &mut impl RngCore,
    ) -> Vec<GossipAction> {
        let members = state.member_identities(true);
        let expected_min = (members.len().checked_ilog10().unwrap_or(0) as usize)
            .max(MINIMUM_PEERS);

        if self.sample.len() >= expected_min || self.sample.len() >= members.len() {
            return Vec::new();
        }

        let mut candidates: Vec<Identity> =
            members.into_iter().filter(|id| !self.sample.contains(id)).collect();
        candidates.sort();

        let wanted = (expected_min - self.sample.len()).min(candidates.len());
        let sampled: Vec<Identity> =
            candidates.choose_multiple(rng, wanted).cloned().collect();

        sampled
            .into_iter()
            .map(|id| {
                self.sample.insert(id.clone());
                GossipAction::Send {
                    to: id,
                    message: GossipMessage::Subscribe(self.self_id.clone()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use cascade_proto::Identity;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::group::{Credential, RosterGroup};

    fn build_group(names: &[&str]) -> RosterGroup {
        let creds: Vec<Credential> = names
            .iter()
            .enumerate()
            .map(|(i, name)| Credential::from_seed(Identity::from(*name), [i as u8 + 1; 32]))
            .collect();

        let mut group = RosterGroup::create(&b"gossip-test"[..], creds[0].clone());
        for cred in &creds[1..] {
            let proposal = group.propose_add(cred.key_package()).unwrap();
            group.handle_proposal(&proposal).unwrap();
        }
        let (commit, _) = group.commit_pending([0u8; 32]);
        group.merge_commit(&commit).unwrap();
        group
    }

    fn payload(body: &'static [u8]) -> MlsMessage {
        MlsMessage { epoch: 1, body: Bytes::from_static(body) }
    }

    fn subscriptions(actions: &[GossipAction]) -> Vec<Identity> {
        actions
            .iter()
            .filter_map(|a| match a {
                GossipAction::Send { to, message: GossipMessage::Subscribe(_) } => {
                    Some(to.clone())
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn init_samples_all_peers_in_small_group() {
        let group = build_group(&["a", "b", "c"]);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let mut gossip = GossipBroadcaster::new(Identity::from("a"));

        let actions = gossip.init(&group, &mut rng);
        // Fewer members than MINIMUM_PEERS: everyone else gets sampled.
        assert_eq!(subscriptions(&actions).len(), 2);
        assert_eq!(gossip.sample().len(), 2);
    }

    #[test]
    fn init_caps_sample_at_minimum_peers() {
        let names: Vec<String> = (0..20).map(|i| format!("m{i:02}")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let group = build_group(&name_refs);

        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let mut gossip = GossipBroadcaster::new(Identity::from("m00"));
        let actions = gossip.init(&group, &mut rng);

        assert_eq!(subscriptions(&actions).len(), MINIMUM_PEERS);
        assert_eq!(gossip.sample().len(), MINIMUM_PEERS);
    }

    #[test]
    fn gossip_delivers_exactly_once() {
        let group = build_group(&["a", "b", "c"]);
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let mut gossip = GossipBroadcaster::new(Identity::from("a"));
        gossip.init(&group, &mut rng);

        let first = gossip.receive_message(GossipMessage::Gossip(payload(b"p1")));
        assert!(first.iter().any(|a| matches!(a, GossipAction::Deliver(_))));
        assert!(first.iter().any(|a| matches!(a, GossipAction::SendSample { .. })));

        // Second arrival of the same payload: silence.
        let second = gossip.receive_message(GossipMessage::Gossip(payload(b"p1")));
        assert!(second.is_empty());
    }

    #[test]
    fn subscribe_replays_received_set() {
        let group = build_group(&["a", "b", "c"]);
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let mut gossip = GossipBroadcaster::new(Identity::from("a"));
        gossip.init(&group, &mut rng);

        gossip.receive_message(GossipMessage::Gossip(payload(b"p1")));
        gossip.receive_message(GossipMessage::Gossip(payload(b"p2")));

        let late = Identity::from("late-peer");
        let actions = gossip.receive_message(GossipMessage::Subscribe(late.clone()));
        let replayed: Vec<_> = actions
            .iter()
            .filter(|a| {
                matches!(a, GossipAction::Send { to, message: GossipMessage::Gossip(_) } if *to == late)
            })
            .collect();
        assert_eq!(replayed.len(), 2);
        assert!(gossip.sample().contains(&late));
    }

    #[test]
    fn duplicate_subscribe_is_noop() {
        let group = build_group(&["a", "b", "c"]);
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let mut gossip = GossipBroadcaster::new(Identity::from("a"));
        gossip.init(&group, &mut rng);

        let peer = Identity::from("peer");
        gossip.receive_message(GossipMessage::Subscribe(peer.clone()));
        let sample_before = gossip.sample();
        let actions = gossip.receive_message(GossipMessage::Subscribe(peer));
        assert!(actions.is_empty());
        assert_eq!(gossip.sample(), sample_before);
    }

    #[test]
    fn new_epoch_clears_received_and_drops_removed() {
        let group = build_group(&["a", "b", "c"]);
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let mut gossip = GossipBroadcaster::new(Identity::from("a"));
        gossip.init(&group, &mut rng);
        gossip.receive_message(GossipMessage::Gossip(payload(b"p1")));
        assert_eq!(gossip.received_count(), 1);

        let removed = [Identity::from("b")];
        gossip.new_epoch(&group, &removed, &mut rng);
        assert_eq!(gossip.received_count(), 0);
        assert!(!gossip.sample().contains(&removed[0]));

        // The previously seen payload delivers again in the new epoch.
        let actions = gossip.receive_message(GossipMessage::Gossip(payload(b"p1")));
        assert!(actions.iter().any(|a| matches!(a, GossipAction::Deliver(_))));
    }

    #[test]
    fn dispatch_forwards_and_delivers_locally() {
        let group = build_group(&["a", "b", "c"]);
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let mut gossip = GossipBroadcaster::new(Identity::from("a"));
        gossip.init(&group, &mut rng);

        let actions = gossip.dispatch_message(payload(b"mine"));
        let sample = gossip.sample();
        match &actions[0] {
            GossipAction::SendSample { to, .. } => assert_eq!(*to, sample),
            other => panic!("expected SendSample, got {other:?}"),
        }
        assert!(matches!(&actions[1], GossipAction::Deliver(_)));
    }
}
