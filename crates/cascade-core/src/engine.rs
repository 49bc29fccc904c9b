//! The delivery-service engine: epoch lifecycle, buffering and dispatch.
//!
//! The engine owns the gossip broadcaster and the consensus cascade,
//! gates every incoming frame by epoch, tracks which commits are still
//! missing proposals, and hands agreed commits to the client.
//!
//! # Commit delivery is two-phase
//!
//! The engine cannot advance the MLS state itself; the client owns the
//! group. When the cascade agrees on a commit, the engine emits
//! [`EngineAction::DeliverCommit`] (membership changes computed against
//! the pre-merge state) and then waits. The client merges the commit and
//! calls [`DeliveryService::commit_merged`] with the post-merge state;
//! only then are welcomes sent, the per-epoch state reset, and buffered
//! future messages drained.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use cascade_proto::wire::{WireDecode, WireEncode};
use cascade_proto::{
    CascadeConsensusMessage, DdsMessage, Identity, LeafIndex, MessageRef, MlsMessage,
};
use rand::RngCore;

use crate::cac::ChoiceWeight;
use crate::cascade::{CascadeAction, CascadeConsensus, CascadeTimer};
use crate::gossip::{GossipAction, GossipBroadcaster};
use crate::group::GroupState;

/// Actions the driver executes on behalf of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Send to one peer, connecting on demand.
    Send {
        /// Peer to reach.
        to: Identity,
        /// Frame to send.
        message: DdsMessage,
    },
    /// Broadcast to every connected peer.
    Broadcast {
        /// Frame to send.
        message: DdsMessage,
    },
    /// Send to the listed peers that are currently connected.
    SendMany {
        /// Peers to reach.
        to: Vec<Identity>,
        /// Frame to send.
        message: DdsMessage,
    },
    /// Arm a timer; when it fires, call
    /// [`DeliveryService::handle_timer`] with the same kind.
    SetTimer {
        /// Which timer.
        kind: CascadeTimer,
        /// How long from now.
        duration: Duration,
    },
    /// Disarm a timer. Idempotent.
    CancelTimer {
        /// Which timer.
        kind: CascadeTimer,
    },
    /// A welcome arrived while not yet in a group.
    DeliverWelcome {
        /// Opaque welcome package for the group facade.
        welcome: Bytes,
    },
    /// A proposal or application message was delivered by gossip.
    DeliverMessage {
        /// The MLS message, classified by the client.
        message: MlsMessage,
    },
    /// The cascade agreed on this commit; merge it, then call
    /// [`DeliveryService::commit_merged`].
    DeliverCommit {
        /// The agreed commit.
        commit: MlsMessage,
        /// Identities the commit adds (pre-merge view).
        added: Vec<Identity>,
        /// Identities the commit removes (pre-merge view).
        removed: Vec<Identity>,
    },
}

struct ProposedCommit {
    reference: MessageRef,
    welcome: Option<Bytes>,
}

struct PendingDelivery {
    reference: MessageRef,
    added: Vec<Identity>,
    removed: Vec<Identity>,
}

/// The distributed delivery service engine.
pub struct DeliveryService<R: RngCore> {
    self_id: Identity,
    rtt: Duration,
    rng: R,
    initialized: bool,

    gossip: GossipBroadcaster,
    cascade: CascadeConsensus,

    future_proposals: Vec<MlsMessage>,
    future_consensus: Vec<MlsMessage>,

    received_proposals: BTreeSet<MessageRef>,
    incomplete_commits: BTreeMap<MessageRef, (MlsMessage, BTreeSet<MessageRef>)>,

    proposed_commit: Option<ProposedCommit>,
    pending_delivery: Option<PendingDelivery>,
}

impl<R: RngCore> DeliveryService<R> {
    /// Create an engine for `self_id` with the deployment round-trip
    /// time and a randomness source for gossip sampling.
    pub fn new(self_id: Identity, rtt: Duration, rng: R) -> Self {
        Self {
            self_id: self_id.clone(),
            rtt,
            rng,
            initialized: false,
            gossip: GossipBroadcaster::new(self_id),
            cascade: CascadeConsensus::new(),
            future_proposals: Vec::new(),
            future_consensus: Vec::new(),
            received_proposals: BTreeSet::new(),
            incomplete_commits: BTreeMap::new(),
            proposed_commit: None,
            pending_delivery: None,
        }
    }

    /// The local identity.
    pub fn self_id(&self) -> &Identity {
        &self.self_id
    }

    /// Whether a group has been installed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Install the group after creating it or joining by welcome.
    pub fn init<G: GroupState>(&mut self, state: &G) -> Vec<EngineAction> {
        debug_assert!(!self.initialized, "engine initialized twice");
        self.initialized = true;

        let mut out = Vec::new();
        let gossip_actions = self.gossip.init(state, &mut self.rng);
        self.map_gossip_actions(Some(state), gossip_actions, &mut out);
        let cascade_actions = self.cascade.new_epoch(state);
        self.map_cascade_actions(state, cascade_actions, &mut out);
        self.drain_futures(state, &mut out);
        out
    }

    /// Process one frame from the network.
    ///
    /// `state` is `None` before the client has a group; everything that
    /// needs a group is buffered until [`DeliveryService::init`].
    pub fn receive_network_message<G: GroupState>(
        &mut self,
        state: Option<&G>,
        message: DdsMessage,
    ) -> Vec<EngineAction> {
        let mut out = Vec::new();
        match message {
            DdsMessage::Welcome(welcome) => {
                if self.initialized {
                    tracing::debug!("welcome ignored, already in a group");
                } else {
                    out.push(EngineAction::DeliverWelcome { welcome });
                }
            },
            DdsMessage::Gossip(gossip) => {
                let actions = self.gossip.receive_message(gossip);
                self.map_gossip_actions(state, actions, &mut out);
            },
            DdsMessage::CascadeConsensus(protected) => {
                let Some(state) = state else {
                    self.future_consensus.push(protected);
                    return out;
                };
                match protected.epoch.cmp(&state.epoch()) {
                    std::cmp::Ordering::Less => {
                        tracing::debug!(
                            epoch = protected.epoch,
                            current = state.epoch(),
                            "dropping stale consensus frame"
                        );
                    },
                    std::cmp::Ordering::Greater => self.future_consensus.push(protected),
                    std::cmp::Ordering::Equal => {
                        self.handle_cascade_current(state, protected, &mut out)
                    },
                }
            },
        }
        out
    }

    /// Disseminate a locally originated proposal or application message.
    pub fn dispatch_message<G: GroupState>(
        &mut self,
        state: &G,
        message: MlsMessage,
    ) -> Vec<EngineAction> {
        if !self.initialized {
            tracing::warn!("dispatch before group initialization");
            return Vec::new();
        }
        let mut out = Vec::new();
        let actions = self.gossip.dispatch_message(message);
        self.map_gossip_actions(Some(state), actions, &mut out);
        out
    }

    /// Whether a new commit may be proposed (no cascade in progress).
    pub fn can_propose_commit(&self) -> bool {
        !self.cascade.cac1_started()
    }

    /// Submit our own commit, with the welcome to send if it adds
    /// members and wins.
    pub fn propose_commit<G: GroupState>(
        &mut self,
        state: &G,
        commit: MlsMessage,
        welcome: Option<Bytes>,
    ) -> Vec<EngineAction> {
        if !self.initialized {
            tracing::warn!("commit proposed before group initialization");
            return Vec::new();
        }
        self.proposed_commit =
            Some(ProposedCommit { reference: commit.message_ref(), welcome });

        let weight = commit_weight(state, &commit);
        let mut out = Vec::new();
        let actions = self.cascade.propose_commit(state, commit, weight);
        self.map_cascade_actions(state, actions, &mut out);
        out
    }

    /// A timer armed through [`EngineAction::SetTimer`] fired.
    pub fn handle_timer<G: GroupState>(
        &mut self,
        state: &G,
        kind: CascadeTimer,
    ) -> Vec<EngineAction> {
        if !self.initialized {
            return Vec::new();
        }
        let mut out = Vec::new();
        let actions = self.cascade.handle_timeout(state, kind);
        self.map_cascade_actions(state, actions, &mut out);
        out
    }

    /// Second phase of commit delivery: the client merged the commit and
    /// `state` is the new epoch.
    pub fn commit_merged<G: GroupState>(&mut self, state: &G) -> Vec<EngineAction> {
        let Some(pending) = self.pending_delivery.take() else {
            tracing::warn!("commit_merged without pending delivery");
            return Vec::new();
        };

        let mut out = Vec::new();

        // Welcome the members our own commit added.
        if let Some(proposed) = &self.proposed_commit {
            if proposed.reference == pending.reference && !pending.added.is_empty() {
                if let Some(welcome) = proposed.welcome.clone() {
                    out.push(EngineAction::SendMany {
                        to: pending.added.clone(),
                        message: DdsMessage::Welcome(welcome),
                    });
                }
            }
        }

        // Per-epoch garbage collection.
        self.received_proposals.clear();
        self.incomplete_commits.clear();
        self.proposed_commit = None;

        let gossip_actions = self.gossip.new_epoch(state, &pending.removed, &mut self.rng);
        self.map_gossip_actions(Some(state), gossip_actions, &mut out);

        let cascade_actions = self.cascade.new_epoch(state);
        self.map_cascade_actions(state, cascade_actions, &mut out);

        tracing::info!(epoch = state.epoch(), "epoch advanced");

        self.drain_futures(state, &mut out);
        out
    }

    /// Release buffered messages whose epoch has arrived, and drop the
    /// ones whose epoch has passed.
    fn drain_futures<G: GroupState>(&mut self, state: &G, out: &mut Vec<EngineAction>) {
        let epoch = state.epoch();

        let proposals = std::mem::take(&mut self.future_proposals);
        for message in proposals {
            match message.epoch.cmp(&epoch) {
                std::cmp::Ordering::Equal => self.handle_proposal_delivery(state, message, out),
                std::cmp::Ordering::Greater => self.future_proposals.push(message),
                std::cmp::Ordering::Less => {},
            }
        }

        let consensus = std::mem::take(&mut self.future_consensus);
        for message in consensus {
            match message.epoch.cmp(&epoch) {
                std::cmp::Ordering::Equal => self.handle_cascade_current(state, message, out),
                std::cmp::Ordering::Greater => self.future_consensus.push(message),
                std::cmp::Ordering::Less => {},
            }
        }
    }

    fn map_gossip_actions<G: GroupState>(
        &mut self,
        state: Option<&G>,
        actions: Vec<GossipAction>,
        out: &mut Vec<EngineAction>,
    ) {
        for action in actions {
            match action {
                GossipAction::Send { to, message } => {
                    out.push(EngineAction::Send { to, message: DdsMessage::Gossip(message) });
                },
                GossipAction::SendSample { to, message } => {
                    out.push(EngineAction::SendMany {
                        to,
                        message: DdsMessage::Gossip(message),
                    });
                },
                GossipAction::Deliver(message) => {
                    let Some(state) = state else {
                        self.future_proposals.push(message);
                        continue;
                    };
                    match message.epoch.cmp(&state.epoch()) {
                        std::cmp::Ordering::Less => {
                            tracing::debug!(epoch = message.epoch, "dropping stale gossip");
                        },
                        std::cmp::Ordering::Greater => self.future_proposals.push(message),
                        std::cmp::Ordering::Equal => {
                            self.handle_proposal_delivery(state, message, out)
                        },
                    }
                },
            }
        }
    }

    /// A gossip payload of the current epoch: deliver it upward and, if
    /// it is a proposal, check whether it completes a parked commit.
    fn handle_proposal_delivery<G: GroupState>(
        &mut self,
        state: &G,
        message: MlsMessage,
        out: &mut Vec<EngineAction>,
    ) {
        if let Some(reference) = state.valid_proposal(&message) {
            out.push(EngineAction::DeliverMessage { message });
            if self.received_proposals.insert(reference) {
                self.unlock_commits(state, reference, out);
            }
        } else if state.unprotect_application(&message).is_some() {
            out.push(EngineAction::DeliverMessage { message });
        } else {
            tracing::debug!(epoch = message.epoch, "dropping unclassifiable gossip payload");
        }
    }

    /// A proposal arrived: commits waiting only for it become complete.
    fn unlock_commits<G: GroupState>(
        &mut self,
        state: &G,
        reference: MessageRef,
        out: &mut Vec<EngineAction>,
    ) {
        let mut completed = Vec::new();
        self.incomplete_commits.retain(|commit_ref, (commit, remaining)| {
            remaining.remove(&reference);
            if remaining.is_empty() {
                completed.push((*commit_ref, commit.clone()));
                false
            } else {
                true
            }
        });

        for (_, commit) in completed {
            let weight = commit_weight(state, &commit);
            let actions = self.cascade.validate_commit(state, commit, weight);
            self.map_cascade_actions(state, actions, out);
        }
    }

    /// A commit became known (through consensus chatter): ratify it once
    /// every proposal it references has been received.
    fn handle_commit_seen<G: GroupState>(
        &mut self,
        state: &G,
        commit: MlsMessage,
        out: &mut Vec<EngineAction>,
    ) {
        let Some(references) = state.valid_commit(&commit) else {
            tracing::debug!("ignoring invalid commit candidate");
            return;
        };

        let remaining: BTreeSet<MessageRef> =
            references.difference(&self.received_proposals).copied().collect();

        if remaining.is_empty() {
            let weight = commit_weight(state, &commit);
            let actions = self.cascade.validate_commit(state, commit, weight);
            self.map_cascade_actions(state, actions, out);
        } else {
            tracing::debug!(
                missing = remaining.len(),
                "commit waits for proposals to arrive"
            );
            self.incomplete_commits.insert(commit.message_ref(), (commit, remaining));
        }
    }

    fn handle_cascade_current<G: GroupState>(
        &mut self,
        state: &G,
        protected: MlsMessage,
        out: &mut Vec<EngineAction>,
    ) {
        let Some(plaintext) = state.unprotect_application(&protected) else {
            tracing::warn!("undecryptable consensus frame");
            return;
        };
        let message = match CascadeConsensusMessage::decode_exact(&plaintext) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "malformed consensus frame");
                return;
            },
        };

        let actions = self.cascade.receive_message(state, message);
        self.map_cascade_actions(state, actions, out);
    }

    fn map_cascade_actions<G: GroupState>(
        &mut self,
        state: &G,
        actions: Vec<CascadeAction>,
        out: &mut Vec<EngineAction>,
    ) {
        for action in actions {
            match action {
                CascadeAction::Broadcast(message) => {
                    out.push(EngineAction::Broadcast { message: protect_frame(state, &message) });
                },
                CascadeAction::Send { to, message } => {
                    out.push(EngineAction::Send {
                        to,
                        message: protect_frame(state, &message),
                    });
                },
                CascadeAction::SendMany { to, message } => {
                    out.push(EngineAction::SendMany {
                        to,
                        message: protect_frame(state, &message),
                    });
                },
                CascadeAction::SetTimer(kind) => {
                    out.push(EngineAction::SetTimer {
                        kind,
                        duration: self.rtt * kind.rtts(),
                    });
                },
                CascadeAction::CancelTimer(kind) => {
                    out.push(EngineAction::CancelTimer { kind });
                },
                CascadeAction::CommitSeen(commit) => {
                    self.handle_commit_seen(state, commit, out);
                },
                CascadeAction::DeliverCommit(commit) => {
                    if self.pending_delivery.is_some() {
                        tracing::warn!("second commit agreement in one epoch, ignoring");
                        continue;
                    }
                    let (added, removed) = state.commit_membership_changes(&commit);
                    self.pending_delivery = Some(PendingDelivery {
                        reference: commit.message_ref(),
                        added: added.clone(),
                        removed: removed.clone(),
                    });
                    out.push(EngineAction::DeliverCommit { commit, added, removed });
                },
            }
        }
    }
}

/// Wrap a cascade frame in the MLS envelope for the wire.
fn protect_frame<G: GroupState>(state: &G, message: &CascadeConsensusMessage) -> DdsMessage {
    DdsMessage::CascadeConsensus(state.protect(&message.encode_to_bytes()))
}

/// Choice weight of a commit under the given state.
fn commit_weight<G: GroupState>(state: &G, commit: &MlsMessage) -> ChoiceWeight {
    ChoiceWeight {
        proposals: state.commit_proposal_count(commit).unwrap_or(0) as u32,
        sender: state.commit_sender(commit).unwrap_or(LeafIndex(u32::MAX)),
    }
}
