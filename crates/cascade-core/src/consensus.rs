//! Full Consensus: the pipeline's final-resort total-order agreement,
//! a simplified PBFT.
//!
//! Simplifications relative to the original protocol: no checkpoints and
//! no sequence numbers. One instance decides a single value per epoch
//! and is reset. Views rotate the leader through the sorted roster,
//! offset by the epoch so successive epochs start from different
//! leaders. All votes are group-signed statements over `(view, ref)`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use cascade_proto::{
    ConsensusContent, ConsensusMessage, Identity, LeafIndex, MessageRef, ViewChangeContent,
};
use cascade_proto::wire::{WireDecode, WireEncode};

use crate::cac::CacPayload;
use crate::group::GroupState;

/// The two timers the instance arms, both 1·RTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusTimer {
    /// Waiting for the leader to order our proposal.
    Propose,
    /// Waiting for progress after rebroadcasting; fires a view change.
    Forward,
}

/// Actions returned by the Full Consensus state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusAction<T> {
    /// Broadcast to every member.
    Broadcast(ConsensusMessage<T>),
    /// Send to one member (usually the current leader).
    Send {
        /// Recipient.
        to: Identity,
        /// Message to deliver.
        message: ConsensusMessage<T>,
    },
    /// Arm a 1·RTT timer.
    SetTimer(ConsensusTimer),
    /// Disarm a timer.
    CancelTimer(ConsensusTimer),
    /// The value reached its commit quorum.
    Deliver(T),
}

/// Per-epoch Full Consensus instance.
pub struct FullConsensus<T> {
    f: usize,
    current_view: u32,
    leader: LeafIndex,
    leader_id: Option<Identity>,

    future: BTreeMap<u32, VecDeque<ConsensusMessage<T>>>,
    messages: BTreeMap<MessageRef, T>,

    proposed: Option<T>,
    has_sent_pre_prepare: bool,
    has_sent_prepare: bool,
    has_sent_commit: bool,
    delivered: bool,

    prepare_votes: BTreeMap<MessageRef, BTreeSet<LeafIndex>>,
    commit_votes: BTreeMap<MessageRef, BTreeSet<LeafIndex>>,
    view_change_votes: BTreeSet<LeafIndex>,

    propose_timer_armed: bool,
    forward_timer_armed: bool,
}

impl<T: CacPayload + WireEncode + WireDecode> FullConsensus<T> {
    /// Fresh, idle instance.
    pub fn new() -> Self {
        Self {
            f: 0,
            current_view: 0,
            leader: LeafIndex(0),
            leader_id: None,
            future: BTreeMap::new(),
            messages: BTreeMap::new(),
            proposed: None,
            has_sent_pre_prepare: false,
            has_sent_prepare: false,
            has_sent_commit: false,
            delivered: false,
            prepare_votes: BTreeMap::new(),
            commit_votes: BTreeMap::new(),
            view_change_votes: BTreeSet::new(),
            propose_timer_armed: false,
            forward_timer_armed: false,
        }
    }

    /// Reset for a new epoch and enter view 0.
    pub fn new_epoch<G: GroupState>(&mut self, state: &G) -> Vec<ConsensusAction<T>> {
        let n = state.member_count();
        self.f = n.saturating_sub(1) / 3;

        self.future.clear();
        self.messages.clear();
        self.proposed = None;
        self.delivered = false;

        self.new_view(state, 0)
    }

    /// The view this instance is currently in.
    pub fn current_view(&self) -> u32 {
        self.current_view
    }

    /// Submit a value for agreement. Single-shot per epoch.
    pub fn propose<G: GroupState>(&mut self, state: &G, value: T) -> Vec<ConsensusAction<T>> {
        if self.proposed.is_some() {
            return Vec::new();
        }
        self.proposed = Some(value);

        if self.has_sent_prepare {
            Vec::new()
        } else {
            self.propose_current(state)
        }
    }

    /// Process one incoming consensus message.
    pub fn receive_message<G: GroupState>(
        &mut self,
        state: &G,
        message: ConsensusMessage<T>,
    ) -> Vec<ConsensusAction<T>> {
        match message {
            ConsensusMessage::Propose { view, content } => {
                if view == self.current_view {
                    self.handle_propose(state, content)
                } else if view > self.current_view {
                    self.future
                        .entry(view)
                        .or_default()
                        .push_back(ConsensusMessage::Propose { view, content });
                    Vec::new()
                } else {
                    Vec::new()
                }
            },
            ConsensusMessage::PrePrepare { signed, proposed } => {
                let message = ConsensusMessage::PrePrepare {
                    signed: signed.clone(),
                    proposed: proposed.clone(),
                };
                match self.content_if_ready(state, &signed, message) {
                    Some((sender, content)) => {
                        self.handle_pre_prepare(state, sender, content, proposed)
                    },
                    None => Vec::new(),
                }
            },
            ConsensusMessage::Prepare(signed) => {
                let message = ConsensusMessage::Prepare(signed.clone());
                match self.content_if_ready(state, &signed, message) {
                    Some((sender, content)) => self.handle_prepare(state, sender, content),
                    None => Vec::new(),
                }
            },
            ConsensusMessage::Commit(signed) => {
                let message = ConsensusMessage::Commit(signed.clone());
                match self.content_if_ready(state, &signed, message) {
                    Some((sender, content)) => self.handle_commit(sender, content),
                    None => Vec::new(),
                }
            },
            ConsensusMessage::ViewChange(signed) => {
                if signed.epoch != state.epoch() || !state.verify(&signed) {
                    return Vec::new();
                }
                let Ok(content) = ViewChangeContent::decode_exact(&signed.payload) else {
                    return Vec::new();
                };
                if content.view == self.current_view + 1 {
                    self.handle_view_change(state, signed.sender, content.view)
                } else if content.view > self.current_view {
                    self.future
                        .entry(content.view)
                        .or_default()
                        .push_back(ConsensusMessage::ViewChange(signed));
                    Vec::new()
                } else {
                    Vec::new()
                }
            },
        }
    }

    /// A previously armed timer fired.
    pub fn handle_timeout<G: GroupState>(
        &mut self,
        state: &G,
        timer: ConsensusTimer,
    ) -> Vec<ConsensusAction<T>> {
        match timer {
            ConsensusTimer::Propose => {
                self.propose_timer_armed = false;
                let Some(value) = self.proposed.clone() else {
                    return Vec::new();
                };
                // The leader went quiet on us: rebroadcast so every member
                // relays, and arm the view-change fallback.
                self.forward_timer_armed = true;
                vec![
                    ConsensusAction::Broadcast(ConsensusMessage::Propose {
                        view: self.current_view,
                        content: value,
                    }),
                    ConsensusAction::SetTimer(ConsensusTimer::Forward),
                ]
            },
            ConsensusTimer::Forward => {
                self.forward_timer_armed = false;
                let view = self.current_view + 1;
                let signed =
                    state.sign(&ViewChangeContent { view }.encode_to_bytes());
                let mut out =
                    vec![ConsensusAction::Broadcast(ConsensusMessage::ViewChange(signed))];
                out.extend(self.handle_view_change(state, state.self_index(), view));
                out
            },
        }
    }

    fn new_view<G: GroupState>(&mut self, state: &G, view: u32) -> Vec<ConsensusAction<T>> {
        self.current_view = view;

        // Leader rotates deterministically; the epoch offset varies the
        // starting leader across epochs.
        let members = state.member_indices();
        let slot = ((u64::from(view) + state.epoch()) % members.len() as u64) as usize;
        self.leader = members[slot];
        self.leader_id = state.identity_of(self.leader);

        self.has_sent_pre_prepare = false;
        self.has_sent_prepare = false;
        self.has_sent_commit = false;
        self.prepare_votes.clear();
        self.commit_votes.clear();
        self.view_change_votes.clear();

        let mut out = self.reset_timers();

        if let Some(queued) = self.future.remove(&view) {
            for message in queued {
                out.extend(self.receive_message(state, message));
            }
        }

        if self.proposed.is_some() && !self.has_sent_prepare && !self.has_sent_pre_prepare {
            out.extend(self.propose_current(state));
        }
        out
    }

    fn propose_current<G: GroupState>(&mut self, state: &G) -> Vec<ConsensusAction<T>> {
        let value = self.proposed.clone().expect("propose_current requires a proposal");
        if self.leader == state.self_index() {
            self.handle_propose(state, value)
        } else {
            let Some(leader_id) = self.leader_id.clone() else {
                return Vec::new();
            };
            self.propose_timer_armed = true;
            vec![
                ConsensusAction::Send {
                    to: leader_id,
                    message: ConsensusMessage::Propose {
                        view: self.current_view,
                        content: value,
                    },
                },
                ConsensusAction::SetTimer(ConsensusTimer::Propose),
            ]
        }
    }

    fn handle_propose<G: GroupState>(&mut self, state: &G, value: T) -> Vec<ConsensusAction<T>> {
        let reference = value.payload_ref();
        self.messages.insert(reference, value.clone());

        if self.leader == state.self_index() {
            if self.has_sent_pre_prepare {
                return Vec::new();
            }
            self.has_sent_pre_prepare = true;

            let content =
                ConsensusContent { view: self.current_view, message_ref: reference };
            let signed = state.sign(&content.encode_to_bytes());
            let mut out = vec![ConsensusAction::Broadcast(ConsensusMessage::PrePrepare {
                signed,
                proposed: value,
            })];
            // Broadcasts do not loop back; the pre-prepare stands in for
            // the leader's own prepare vote.
            out.extend(self.handle_prepare(state, state.self_index(), content));
            out
        } else {
            // Relay to the leader and arm the view-change fallback in
            // case it stays silent.
            let Some(leader_id) = self.leader_id.clone() else {
                return Vec::new();
            };
            self.forward_timer_armed = true;
            vec![
                ConsensusAction::Send {
                    to: leader_id,
                    message: ConsensusMessage::Propose {
                        view: self.current_view,
                        content: value,
                    },
                },
                ConsensusAction::SetTimer(ConsensusTimer::Forward),
            ]
        }
    }

    fn handle_pre_prepare<G: GroupState>(
        &mut self,
        state: &G,
        sender: LeafIndex,
        content: ConsensusContent,
        value: T,
    ) -> Vec<ConsensusAction<T>> {
        if self.leader == state.self_index() || sender != self.leader {
            return Vec::new();
        }

        self.messages.insert(value.payload_ref(), value.clone());
        let mut out = self.reset_timers();

        if !self.has_sent_prepare {
            self.has_sent_prepare = true;
            self.proposed = Some(value);

            self.propose_timer_armed = true;
            out.push(ConsensusAction::SetTimer(ConsensusTimer::Propose));

            let vote =
                ConsensusContent { view: self.current_view, message_ref: content.message_ref };
            let signed = state.sign(&vote.encode_to_bytes());
            out.push(ConsensusAction::Broadcast(ConsensusMessage::Prepare(signed)));
            // Count our own vote; the broadcast does not loop back.
            out.extend(self.handle_prepare(state, state.self_index(), vote));
        }
        out
    }

    fn handle_prepare<G: GroupState>(
        &mut self,
        state: &G,
        sender: LeafIndex,
        content: ConsensusContent,
    ) -> Vec<ConsensusAction<T>> {
        let votes = self.prepare_votes.entry(content.message_ref).or_default();
        votes.insert(sender);

        if votes.len() >= 2 * self.f + 1 && !self.has_sent_commit {
            self.has_sent_commit = true;
            let mut out = self.reset_timers();

            let vote =
                ConsensusContent { view: self.current_view, message_ref: content.message_ref };
            let signed = state.sign(&vote.encode_to_bytes());
            out.push(ConsensusAction::Broadcast(ConsensusMessage::Commit(signed)));
            out.extend(self.handle_commit(state.self_index(), vote));
            out
        } else {
            Vec::new()
        }
    }

    fn handle_commit(
        &mut self,
        sender: LeafIndex,
        content: ConsensusContent,
    ) -> Vec<ConsensusAction<T>> {
        let votes = self.commit_votes.entry(content.message_ref).or_default();
        votes.insert(sender);

        if votes.len() >= 2 * self.f + 1 && !self.delivered {
            let Some(value) = self.messages.get(&content.message_ref).cloned() else {
                // Commit quorum for a value whose pre-prepare never
                // reached us; recovery is out of scope.
                tracing::warn!(reference = %content.message_ref, "commit quorum for unseen value");
                return Vec::new();
            };
            self.delivered = true;
            return vec![ConsensusAction::Deliver(value)];
        }
        Vec::new()
    }

    fn handle_view_change<G: GroupState>(
        &mut self,
        state: &G,
        sender: LeafIndex,
        view: u32,
    ) -> Vec<ConsensusAction<T>> {
        self.view_change_votes.insert(sender);
        if self.view_change_votes.len() >= 2 * self.f + 1 {
            tracing::info!(view, "consensus view change");
            self.new_view(state, view)
        } else {
            Vec::new()
        }
    }

    fn content_if_ready<G: GroupState>(
        &mut self,
        state: &G,
        signed: &cascade_proto::AuthenticatedContent,
        message: ConsensusMessage<T>,
    ) -> Option<(LeafIndex, ConsensusContent)> {
        if signed.epoch != state.epoch() || !state.verify(signed) {
            return None;
        }
        let content = ConsensusContent::decode_exact(&signed.payload).ok()?;

        if content.view == self.current_view {
            Some((signed.sender, content))
        } else {
            if content.view > self.current_view {
                self.future.entry(content.view).or_default().push_back(message);
            }
            None
        }
    }

    fn reset_timers(&mut self) -> Vec<ConsensusAction<T>> {
        let mut out = Vec::new();
        if self.propose_timer_armed {
            self.propose_timer_armed = false;
            out.push(ConsensusAction::CancelTimer(ConsensusTimer::Propose));
        }
        if self.forward_timer_armed {
            self.forward_timer_armed = false;
            out.push(ConsensusAction::CancelTimer(ConsensusTimer::Forward));
        }
        out
    }
}

impl<T: CacPayload + WireEncode + WireDecode> Default for FullConsensus<T> {
    fn default() -> Self {
        Self::new()
    }
}
