//! Cascade Consensus: the orchestrator that turns conflicting commits
//! into one agreed commit per epoch.
//!
//! The pipeline escalates only as far as the conflict requires:
//!
//! ```text
//! CAC₁ ── singleton conflict set ───────────────► deliver
//!   │
//!   │ conflict
//!   ▼
//! Restrained Consensus (conflict-set authors only)
//!   │ decide / ⊥ / timeout
//!   ▼
//! CAC₂ ── singleton conflict set ── Choice ─────► deliver
//!   │
//!   │ conflict
//!   ▼
//! Full Consensus ──────────────── Choice ─────► deliver
//! ```
//!
//! Locally emitted CAC broadcasts are fed back into their instance here
//! (the network broadcast excludes self), through an explicit work queue
//! so processing stays iterative.

use std::collections::VecDeque;

use cascade_proto::{
    Cac2Content, CacMessage, CascadeBody, CascadeConsensusMessage, Identity, LeafIndex,
    MessageRef, MlsMessage, RestrainedConsensusMessage, instance,
};

use crate::cac::{CacAction, CacBroadcast, CacPayload, ChoiceWeight};
use crate::consensus::{ConsensusAction, ConsensusTimer, FullConsensus};
use crate::group::GroupState;
use crate::restrained::{RestrainedAction, RestrainedConsensus};
use crate::signature::CacSignature;

/// Conflict parameter of both CAC instances in this deployment.
pub const CAC_K: usize = 1;

/// Timers the cascade needs the driver to run. Durations are RTT
/// multiples; the driver owns the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeTimer {
    /// Non-participant fallback into CAC₂, 3·RTT.
    RestrainedFallback,
    /// Participant decision timeout, 2·RTT.
    RestrainedDecision,
    /// Full Consensus leader wait, 1·RTT.
    ConsensusPropose,
    /// Full Consensus view-change fallback, 1·RTT.
    ConsensusForward,
}

impl CascadeTimer {
    /// Duration of this timer in round-trip times.
    pub fn rtts(self) -> u32 {
        match self {
            Self::RestrainedFallback => 3,
            Self::RestrainedDecision => 2,
            Self::ConsensusPropose | Self::ConsensusForward => 1,
        }
    }
}

/// Actions returned by the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeAction {
    /// Broadcast to all members (MLS-protected by the engine).
    Broadcast(CascadeConsensusMessage),
    /// Send to one member.
    Send {
        /// Recipient.
        to: Identity,
        /// Frame to deliver.
        message: CascadeConsensusMessage,
    },
    /// Send to the listed members.
    SendMany {
        /// Recipients.
        to: Vec<Identity>,
        /// Frame to deliver.
        message: CascadeConsensusMessage,
    },
    /// Arm a timer.
    SetTimer(CascadeTimer),
    /// Disarm a timer.
    CancelTimer(CascadeTimer),
    /// A commit was learned through consensus chatter; the caller must
    /// run it through proposal-completeness validation.
    CommitSeen(MlsMessage),
    /// Agreement: deliver this commit and advance the epoch.
    DeliverCommit(MlsMessage),
}

/// Work items fed back into the pipeline while draining.
enum Feedback {
    Cac1(CacMessage<MlsMessage>),
    Cac2(CacMessage<Cac2Content>),
}

/// Per-epoch cascade state.
pub struct CascadeConsensus {
    cac1: CacBroadcast<MlsMessage>,
    cac2: CacBroadcast<Cac2Content>,
    restrained: RestrainedConsensus,
    consensus: FullConsensus<Cac2Content>,

    delivered: Vec<MessageRef>,
    fallback_armed: bool,
    consensus_proposed: bool,
}

impl CascadeConsensus {
    /// Fresh cascade.
    pub fn new() -> Self {
        Self {
            cac1: CacBroadcast::new(CAC_K),
            cac2: CacBroadcast::new(CAC_K),
            restrained: RestrainedConsensus::new(),
            consensus: FullConsensus::new(),
            delivered: Vec::new(),
            fallback_armed: false,
            consensus_proposed: false,
        }
    }

    /// Reset every stage for a new epoch, disarming all timers.
    pub fn new_epoch<G: GroupState>(&mut self, state: &G) -> Vec<CascadeAction> {
        let mut out = Vec::new();

        self.cac1.new_epoch(state);
        self.cac2.new_epoch(state);

        for action in self.restrained.new_epoch() {
            if matches!(action, RestrainedAction::CancelTimer) {
                out.push(CascadeAction::CancelTimer(CascadeTimer::RestrainedDecision));
            }
        }
        if self.fallback_armed {
            self.fallback_armed = false;
            out.push(CascadeAction::CancelTimer(CascadeTimer::RestrainedFallback));
        }
        for action in self.consensus.new_epoch(state) {
            self.map_consensus_action(action, &mut out, state);
        }

        self.delivered.clear();
        self.consensus_proposed = false;
        out
    }

    /// Whether a commit broadcast is already underway this epoch.
    pub fn cac1_started(&self) -> bool {
        self.cac1.has_started()
    }

    /// Broadcast our own commit through CAC₁.
    pub fn propose_commit<G: GroupState>(
        &mut self,
        state: &G,
        commit: MlsMessage,
        weight: ChoiceWeight,
    ) -> Vec<CascadeAction> {
        let actions = self.cac1.broadcast(state, commit, weight);
        self.drain(state, actions, Vec::new())
    }

    /// Ratify a fully validated commit candidate.
    pub fn validate_commit<G: GroupState>(
        &mut self,
        state: &G,
        commit: MlsMessage,
        weight: ChoiceWeight,
    ) -> Vec<CascadeAction> {
        let actions = self.cac1.validate_message(state, commit, weight);
        self.drain(state, actions, Vec::new())
    }

    /// Process one unprotected cascade frame.
    pub fn receive_message<G: GroupState>(
        &mut self,
        state: &G,
        message: CascadeConsensusMessage,
    ) -> Vec<CascadeAction> {
        match (message.instance, message.body) {
            (instance::CAC1, CascadeBody::Cac(cac)) => {
                let actions = self.cac1.receive_message(state, cac);
                self.drain(state, actions, Vec::new())
            },
            (instance::CAC2, CascadeBody::Cac2(cac)) => {
                let actions = self.cac2.receive_message(state, cac);
                self.drain(state, Vec::new(), actions)
            },
            (_, CascadeBody::Restrained(rc)) => {
                let actions = self.restrained.receive_message(state, rc);
                let mut out = Vec::new();
                self.map_restrained_actions(state, actions, &mut out);
                out
            },
            (_, CascadeBody::Consensus(fc)) => {
                let actions = self.consensus.receive_message(state, fc);
                let mut out = Vec::new();
                for action in actions {
                    self.map_consensus_action(action, &mut out, state);
                }
                out
            },
            (instance, body) => {
                tracing::warn!(instance, ?body, "cascade frame with mismatched instance");
                Vec::new()
            },
        }
    }

    /// A cascade timer fired.
    pub fn handle_timeout<G: GroupState>(
        &mut self,
        state: &G,
        timer: CascadeTimer,
    ) -> Vec<CascadeAction> {
        match timer {
            CascadeTimer::RestrainedFallback => {
                self.fallback_armed = false;
                let mut out = Vec::new();
                self.enter_cac2_bottom(state, &mut out);
                out
            },
            CascadeTimer::RestrainedDecision => {
                let actions = self.restrained.handle_timeout();
                let mut out = Vec::new();
                self.map_restrained_actions(state, actions, &mut out);
                out
            },
            CascadeTimer::ConsensusPropose => {
                let actions = self.consensus.handle_timeout(state, ConsensusTimer::Propose);
                let mut out = Vec::new();
                for action in actions {
                    self.map_consensus_action(action, &mut out, state);
                }
                out
            },
            CascadeTimer::ConsensusForward => {
                let actions = self.consensus.handle_timeout(state, ConsensusTimer::Forward);
                let mut out = Vec::new();
                for action in actions {
                    self.map_consensus_action(action, &mut out, state);
                }
                out
            },
        }
    }

    /// Run CAC actions to quiescence, feeding broadcasts back into their
    /// instance iteratively.
    fn drain<G: GroupState>(
        &mut self,
        state: &G,
        cac1_actions: Vec<CacAction<MlsMessage>>,
        cac2_actions: Vec<CacAction<Cac2Content>>,
    ) -> Vec<CascadeAction> {
        let mut out = Vec::new();
        let mut queue: VecDeque<Feedback> = VecDeque::new();

        self.handle_cac1_actions(state, cac1_actions, &mut queue, &mut out);
        self.handle_cac2_actions(state, cac2_actions, &mut queue, &mut out);

        while let Some(item) = queue.pop_front() {
            match item {
                Feedback::Cac1(message) => {
                    let actions = self.cac1.receive_message(state, message);
                    self.handle_cac1_actions(state, actions, &mut queue, &mut out);
                },
                Feedback::Cac2(message) => {
                    let actions = self.cac2.receive_message(state, message);
                    self.handle_cac2_actions(state, actions, &mut queue, &mut out);
                },
            }
        }
        out
    }

    fn handle_cac1_actions<G: GroupState>(
        &mut self,
        state: &G,
        actions: Vec<CacAction<MlsMessage>>,
        queue: &mut VecDeque<Feedback>,
        out: &mut Vec<CascadeAction>,
    ) {
        for action in actions {
            match action {
                CacAction::Broadcast(message) => {
                    out.push(CascadeAction::Broadcast(CascadeConsensusMessage::cac1(
                        message.clone(),
                    )));
                    queue.push_back(Feedback::Cac1(message));
                },
                CacAction::Transmit(commit) => {
                    out.push(CascadeAction::CommitSeen(commit));
                },
                CacAction::Deliver { payload, conflict_set, signatures } => {
                    self.handle_cac1_delivery(state, payload, conflict_set, signatures, queue, out);
                },
            }
        }
    }

    fn handle_cac1_delivery<G: GroupState>(
        &mut self,
        state: &G,
        commit: MlsMessage,
        conflict_set: Vec<MessageRef>,
        signatures: Vec<CacSignature>,
        queue: &mut VecDeque<Feedback>,
        out: &mut Vec<CascadeAction>,
    ) {
        self.delivered.push(commit.message_ref());

        if conflict_set.len() == 1 {
            out.push(CascadeAction::DeliverCommit(commit));
            return;
        }

        tracing::info!(
            conflicts = conflict_set.len(),
            "commit conflict, entering restrained consensus"
        );

        if state.commit_sender(&commit) == Some(state.self_index()) {
            // We authored one of the conflicting commits: participate.
            let mut pairs: Vec<(LeafIndex, MessageRef)> = Vec::new();
            for reference in &conflict_set {
                let Some(message) = self.cac1.messages().get(reference) else {
                    continue;
                };
                let Some(sender) = state.commit_sender(message) else {
                    tracing::warn!(reference = %reference, "conflicting commit without valid sender");
                    continue;
                };
                pairs.push((sender, *reference));
            }

            let actions = self.restrained.propose(state, &pairs, &signatures);
            self.map_restrained_actions_queued(state, actions, queue, out);
        } else if !self.fallback_armed {
            self.fallback_armed = true;
            out.push(CascadeAction::SetTimer(CascadeTimer::RestrainedFallback));
        }
    }

    fn map_restrained_actions<G: GroupState>(
        &mut self,
        state: &G,
        actions: Vec<RestrainedAction>,
        out: &mut Vec<CascadeAction>,
    ) {
        let mut queue = VecDeque::new();
        self.map_restrained_actions_queued(state, actions, &mut queue, out);
        while let Some(item) = queue.pop_front() {
            match item {
                Feedback::Cac1(message) => {
                    let actions = self.cac1.receive_message(state, message);
                    self.handle_cac1_actions(state, actions, &mut queue, out);
                },
                Feedback::Cac2(message) => {
                    let actions = self.cac2.receive_message(state, message);
                    self.handle_cac2_actions(state, actions, &mut queue, out);
                },
            }
        }
    }

    fn map_restrained_actions_queued<G: GroupState>(
        &mut self,
        state: &G,
        actions: Vec<RestrainedAction>,
        queue: &mut VecDeque<Feedback>,
        out: &mut Vec<CascadeAction>,
    ) {
        for action in actions {
            match action {
                RestrainedAction::SendParticipants { to, message } => {
                    out.push(CascadeAction::SendMany {
                        to,
                        message: CascadeConsensusMessage::restrained(message),
                    });
                },
                RestrainedAction::SetTimer => {
                    out.push(CascadeAction::SetTimer(CascadeTimer::RestrainedDecision));
                },
                RestrainedAction::CancelTimer => {
                    out.push(CascadeAction::CancelTimer(CascadeTimer::RestrainedDecision));
                },
                RestrainedAction::Decide { refs, signatures, retracts } => {
                    self.enter_cac2_decided(state, refs, signatures, retracts, queue, out);
                },
                RestrainedAction::Bottom => {
                    self.enter_cac2_bottom_queued(state, queue, out);
                },
            }
        }
    }

    /// Restrained Consensus decided: broadcast its outcome through CAC₂.
    fn enter_cac2_decided<G: GroupState>(
        &mut self,
        state: &G,
        refs: Vec<MessageRef>,
        signatures: Vec<cascade_proto::AuthenticatedContent>,
        retracts: Vec<cascade_proto::AuthenticatedContent>,
        queue: &mut VecDeque<Feedback>,
        out: &mut Vec<CascadeAction>,
    ) {
        // Sort everything so equal outcomes hash identically at every
        // member.
        let mut conflicting = refs;
        conflicting.sort();
        let mut sorted = signatures;
        sorted.sort_by_key(|s| s.content_ref());
        let mut sorted_retracts = retracts;
        sorted_retracts.sort_by_key(|s| s.content_ref());
        sorted.extend(sorted_retracts);

        let content = Cac2Content { conflicting_messages: conflicting, signatures: sorted };
        let actions = self.cac2.broadcast(state, content, ChoiceWeight::default());
        self.handle_cac2_actions(state, actions, queue, out);
    }

    /// Restrained Consensus yielded ⊥ (or never ran): submit the list of
    /// commits CAC₁ delivered so far.
    fn enter_cac2_bottom<G: GroupState>(&mut self, state: &G, out: &mut Vec<CascadeAction>) {
        let mut queue = VecDeque::new();
        self.enter_cac2_bottom_queued(state, &mut queue, out);
        while let Some(item) = queue.pop_front() {
            match item {
                Feedback::Cac1(message) => {
                    let actions = self.cac1.receive_message(state, message);
                    self.handle_cac1_actions(state, actions, &mut queue, out);
                },
                Feedback::Cac2(message) => {
                    let actions = self.cac2.receive_message(state, message);
                    self.handle_cac2_actions(state, actions, &mut queue, out);
                },
            }
        }
    }

    fn enter_cac2_bottom_queued<G: GroupState>(
        &mut self,
        state: &G,
        queue: &mut VecDeque<Feedback>,
        out: &mut Vec<CascadeAction>,
    ) {
        let mut conflicting = self.delivered.clone();
        conflicting.sort();
        conflicting.dedup();

        let mut signatures: Vec<cascade_proto::AuthenticatedContent> =
            self.cac1.signatures().into_iter().map(|s| s.content).collect();
        signatures.sort_by_key(|s| s.content_ref());

        let content = Cac2Content { conflicting_messages: conflicting, signatures };
        let actions = self.cac2.broadcast(state, content, ChoiceWeight::default());
        self.handle_cac2_actions(state, actions, queue, out);
    }

    fn handle_cac2_actions<G: GroupState>(
        &mut self,
        state: &G,
        actions: Vec<CacAction<Cac2Content>>,
        queue: &mut VecDeque<Feedback>,
        out: &mut Vec<CascadeAction>,
    ) {
        for action in actions {
            match action {
                CacAction::Broadcast(message) => {
                    out.push(CascadeAction::Broadcast(CascadeConsensusMessage::cac2(
                        message.clone(),
                    )));
                    queue.push_back(Feedback::Cac2(message));
                },
                CacAction::Transmit(content) => {
                    // CAC₂ payloads need no application-layer validation
                    // beyond their signatures; ratify immediately.
                    let actions =
                        self.cac2.validate_message(state, content, ChoiceWeight::default());
                    self.handle_cac2_actions(state, actions, queue, out);
                },
                CacAction::Deliver { payload, conflict_set, .. } => {
                    self.handle_cac2_delivery(state, payload, conflict_set, out);
                },
            }
        }
    }

    fn handle_cac2_delivery<G: GroupState>(
        &mut self,
        state: &G,
        content: Cac2Content,
        conflict_set: Vec<MessageRef>,
        out: &mut Vec<CascadeAction>,
    ) {
        if self.fallback_armed {
            self.fallback_armed = false;
            out.push(CascadeAction::CancelTimer(CascadeTimer::RestrainedFallback));
        }

        if conflict_set.len() == 1 {
            tracing::info!(
                commits = content.conflicting_messages.len(),
                "agreement on a conflict outcome"
            );
            if let Some(commit) = self.choose_commit(state, &content.conflicting_messages) {
                out.push(CascadeAction::DeliverCommit(commit));
            }
        } else if !self.consensus_proposed {
            self.consensus_proposed = true;
            tracing::info!(
                conflicts = conflict_set.len(),
                "conflicting outcomes, falling back to full consensus"
            );
            let actions = self.consensus.propose(state, content);
            for action in actions {
                self.map_consensus_action(action, out, state);
            }
        }
    }

    fn map_consensus_action<G: GroupState>(
        &mut self,
        action: ConsensusAction<Cac2Content>,
        out: &mut Vec<CascadeAction>,
        state: &G,
    ) {
        match action {
            ConsensusAction::Broadcast(message) => {
                out.push(CascadeAction::Broadcast(CascadeConsensusMessage::consensus(message)));
            },
            ConsensusAction::Send { to, message } => {
                out.push(CascadeAction::Send {
                    to,
                    message: CascadeConsensusMessage::consensus(message),
                });
            },
            ConsensusAction::SetTimer(ConsensusTimer::Propose) => {
                out.push(CascadeAction::SetTimer(CascadeTimer::ConsensusPropose));
            },
            ConsensusAction::SetTimer(ConsensusTimer::Forward) => {
                out.push(CascadeAction::SetTimer(CascadeTimer::ConsensusForward));
            },
            ConsensusAction::CancelTimer(ConsensusTimer::Propose) => {
                out.push(CascadeAction::CancelTimer(CascadeTimer::ConsensusPropose));
            },
            ConsensusAction::CancelTimer(ConsensusTimer::Forward) => {
                out.push(CascadeAction::CancelTimer(CascadeTimer::ConsensusForward));
            },
            ConsensusAction::Deliver(content) => {
                tracing::info!("full consensus agreement");
                if let Some(commit) = self.choose_commit(state, &content.conflicting_messages) {
                    out.push(CascadeAction::DeliverCommit(commit));
                }
            },
        }
    }

    /// Deterministic Choice over the commits named by an agreed outcome:
    /// most proposals first, then smallest sender, then smallest ref.
    fn choose_commit<G: GroupState>(
        &self,
        state: &G,
        refs: &[MessageRef],
    ) -> Option<MlsMessage> {
        let mut best: Option<(MessageRef, ChoiceWeight)> = None;
        for reference in refs {
            let Some(commit) = self.cac1.messages().get(reference) else {
                tracing::warn!(reference = %reference, "agreed outcome names unknown commit");
                continue;
            };
            let weight = ChoiceWeight {
                proposals: state.commit_proposal_count(commit).unwrap_or(0) as u32,
                sender: state.commit_sender(commit).unwrap_or(LeafIndex(u32::MAX)),
            };
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
        best.and_then(|(reference, _)| self.cac1.messages().get(&reference).cloned())
    }
}

impl Default for CascadeConsensus {
    fn default() -> Self {
        Self::new()
    }
}
