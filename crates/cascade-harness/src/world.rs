//! The simulated world: members, links, clock and timers.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use cascade_core::cascade::CascadeTimer;
use cascade_core::{Credential, DeliveryService, EngineAction, GroupState, RosterGroup};
use cascade_proto::wire::{WireDecode, WireEncode};
use cascade_proto::{
    CascadeConsensusMessage, DdsMessage, Identity, MessageRef, MlsMessage,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Upper bound on processed events; a scenario that exceeds it is
/// livelocked and the test should fail loudly.
const EVENT_BUDGET: usize = 100_000;

/// Decision hook applied to every enqueued frame.
///
/// Receives sender, receiver, the decoded cascade frame when the
/// receiver's group can read it, and the raw frame. Returning `true`
/// drops the frame. The hook doubles as a traffic observer.
pub type LinkHook =
    Box<dyn FnMut(&Identity, &Identity, Option<&CascadeConsensusMessage>, &DdsMessage) -> bool>;

enum Event {
    Message {
        to: usize,
        message: DdsMessage,
    },
    Timer {
        member: usize,
        kind: CascadeTimer,
        generation: u64,
    },
}

/// One simulated member: group, engine, and everything it observed.
pub struct SimMember {
    /// The member's identity.
    pub id: Identity,
    /// Long-term credential.
    pub credential: Credential,
    /// The group facade, once created or joined.
    pub group: Option<RosterGroup>,
    engine: DeliveryService<ChaCha20Rng>,
    timers: HashMap<CascadeTimer, u64>,
    /// Decrypted application messages, in delivery order.
    pub app_messages: Vec<Bytes>,
    /// References of delivered (agreed) commits, in order.
    pub delivered_commits: Vec<MessageRef>,
    /// Epochs entered, in order (create/join epoch first).
    pub epochs: Vec<u64>,
}

impl SimMember {
    /// Current epoch; panics when no group is installed.
    pub fn epoch(&self) -> u64 {
        self.group.as_ref().expect("member has no group").epoch()
    }
}

/// The simulated world.
pub struct SimWorld {
    now: Duration,
    seq: u64,
    events: BTreeMap<(Duration, u64), Event>,
    /// Members by index; identities are the given names.
    pub members: Vec<SimMember>,
    rtt: Duration,
    default_delay: Duration,
    link_delays: HashMap<(usize, usize), Duration>,
    link_hook: Option<LinkHook>,
    captured: Vec<(usize, DdsMessage)>,
    capture_targets: BTreeSet<usize>,
    rng: ChaCha20Rng,
    events_processed: usize,
}

impl SimWorld {
    /// Build a world of idle members (no groups yet).
    pub fn new(names: &[&str], rtt: Duration) -> Self {
        let members = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let id = Identity::from(*name);
                let credential = Credential::from_seed(id.clone(), [i as u8 + 1; 32]);
                SimMember {
                    id: id.clone(),
                    credential,
                    group: None,
                    engine: DeliveryService::new(
                        id,
                        rtt,
                        ChaCha20Rng::seed_from_u64(i as u64),
                    ),
                    timers: HashMap::new(),
                    app_messages: Vec::new(),
                    delivered_commits: Vec::new(),
                    epochs: Vec::new(),
                }
            })
            .collect();

        Self {
            now: Duration::ZERO,
            seq: 0,
            events: BTreeMap::new(),
            members,
            rtt,
            default_delay: Duration::from_millis(10),
            link_delays: HashMap::new(),
            link_hook: None,
            captured: Vec::new(),
            capture_targets: BTreeSet::new(),
            rng: ChaCha20Rng::seed_from_u64(0xCA5C),
            events_processed: 0,
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Configured round-trip time.
    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    /// Install a drop/observe hook for every link.
    pub fn set_link_hook(&mut self, hook: LinkHook) {
        self.link_hook = Some(hook);
    }

    /// Override the one-way delay of a single link.
    pub fn set_link_delay(&mut self, from: usize, to: usize, delay: Duration) {
        self.link_delays.insert((from, to), delay);
    }

    /// Capture frames addressed to `member` instead of delivering them.
    pub fn capture_frames_to(&mut self, member: usize) {
        self.capture_targets.insert(member);
    }

    /// Stop capturing and return what was captured for `member`.
    pub fn take_captured(&mut self, member: usize) -> Vec<DdsMessage> {
        self.capture_targets.remove(&member);
        let (mine, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.captured).into_iter().partition(|(to, _)| *to == member);
        self.captured = rest;
        mine.into_iter().map(|(_, message)| message).collect()
    }

    /// Deliver a frame to `member` right now, bypassing links.
    pub fn deliver_now(&mut self, member: usize, message: DdsMessage) {
        let actions = {
            let m = &mut self.members[member];
            m.engine.receive_network_message(m.group.as_ref(), message)
        };
        self.execute(member, actions);
    }

    /// Inject a frame onto the wire with an explicit delay.
    pub fn inject_with_delay(&mut self, to: usize, message: DdsMessage, delay: Duration) {
        let at = self.now + delay;
        self.schedule(at, Event::Message { to, message });
    }

    /// Member `founder` creates the group.
    pub fn create_group(&mut self, founder: usize) {
        let member = &mut self.members[founder];
        assert!(member.group.is_none(), "member already in a group");
        let group = RosterGroup::create(&b"sim-group"[..], member.credential.clone());
        member.epochs.push(group.epoch());
        let actions = member.engine.init(&group);
        member.group = Some(group);
        self.execute(founder, actions);
    }

    /// `proposer` proposes adding `target` (by world index).
    pub fn propose_add(&mut self, proposer: usize, target: usize) {
        let key_package = self.members[target].credential.key_package();
        let proposal = {
            let group = self.members[proposer].group.as_ref().expect("proposer has no group");
            group.propose_add(key_package).expect("add proposal")
        };
        self.dispatch(proposer, proposal);
    }

    /// `proposer` proposes removing `target` (by world index).
    pub fn propose_remove(&mut self, proposer: usize, target: usize) {
        let target_id = self.members[target].id.clone();
        let proposal = {
            let group = self.members[proposer].group.as_ref().expect("proposer has no group");
            group.propose_remove(&target_id).expect("target is a member")
        };
        self.dispatch(proposer, proposal);
    }

    /// `member` proposes a key update.
    pub fn propose_update(&mut self, member: usize) {
        let seed = RosterGroup::fresh_secret(&mut self.rng);
        let proposal = {
            let group = self.members[member].group.as_mut().expect("member has no group");
            group.propose_update(seed)
        };
        self.dispatch(member, proposal);
    }

    /// `member` sends an application message to the group.
    pub fn send_app_message(&mut self, member: usize, text: &str) {
        let message = {
            let group = self.members[member].group.as_ref().expect("member has no group");
            group.protect(text.as_bytes())
        };
        self.dispatch(member, message);
    }

    /// `member` commits every proposal it has cached (minus its own
    /// pending updates). Returns the commit's reference.
    pub fn commit(&mut self, member: usize) -> MessageRef {
        let nonce = RosterGroup::fresh_secret(&mut self.rng);
        let (commit, welcome) = {
            let group = self.members[member].group.as_ref().expect("member has no group");
            let mut staged = group.clone();
            staged.remove_self_updates();
            staged.commit_pending(nonce)
        };
        let reference = commit.message_ref();
        let welcome_bytes = welcome.map(|w| w.encode_to_bytes());

        let actions = {
            let m = &mut self.members[member];
            let group = m.group.as_ref().expect("checked above");
            m.engine.propose_commit(group, commit, welcome_bytes)
        };
        self.execute(member, actions);
        reference
    }

    /// Process every event (messages and timers) until the world is
    /// quiet. The clock stops at the last processed event.
    pub fn run(&mut self) {
        self.process_until(None);
    }

    /// Process events up to and including `deadline`, then set the clock
    /// to `deadline`.
    pub fn run_until(&mut self, deadline: Duration) {
        self.process_until(Some(deadline));
        if self.now < deadline {
            self.now = deadline;
        }
    }

    fn process_until(&mut self, deadline: Option<Duration>) {
        loop {
            let Some((&key, _)) = self.events.iter().next() else { break };
            if deadline.is_some_and(|d| key.0 > d) {
                break;
            }
            let event = self.events.remove(&key).expect("key just observed");
            self.now = key.0;

            self.events_processed += 1;
            assert!(
                self.events_processed < EVENT_BUDGET,
                "event budget exhausted: the scenario is livelocked"
            );

            match event {
                Event::Message { to, message } => {
                    let actions = {
                        let m = &mut self.members[to];
                        m.engine.receive_network_message(m.group.as_ref(), message)
                    };
                    self.execute(to, actions);
                },
                Event::Timer { member, kind, generation } => {
                    let m = &mut self.members[member];
                    if m.timers.get(&kind) != Some(&generation) {
                        continue; // cancelled or superseded
                    }
                    m.timers.remove(&kind);
                    let actions = {
                        let group = m.group.as_ref().expect("timer without group");
                        m.engine.handle_timer(group, kind)
                    };
                    self.execute(member, actions);
                },
            }
        }
    }

    /// Every member's current epoch; panics if any member has no group.
    pub fn epochs(&self) -> Vec<u64> {
        self.members.iter().map(SimMember::epoch).collect()
    }

    fn dispatch(&mut self, member: usize, message: MlsMessage) {
        let actions = {
            let m = &mut self.members[member];
            let group = m.group.as_ref().expect("dispatch without group");
            m.engine.dispatch_message(group, message)
        };
        self.execute(member, actions);
    }

    fn execute(&mut self, idx: usize, actions: Vec<EngineAction>) {
        let mut queue: VecDeque<EngineAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                EngineAction::Send { to, message } => {
                    self.enqueue_to_identity(idx, &to, message);
                },
                EngineAction::SendMany { to, message } => {
                    for id in &to {
                        self.enqueue_to_identity(idx, id, message.clone());
                    }
                },
                EngineAction::Broadcast { message } => {
                    // Connectivity model: a member is connected to every
                    // current roster member.
                    let roster = self.members[idx]
                        .group
                        .as_ref()
                        .map(|g| g.member_identities(true))
                        .unwrap_or_default();
                    for id in roster {
                        self.enqueue_to_identity(idx, &id, message.clone());
                    }
                },
                EngineAction::SetTimer { kind, duration } => {
                    let generation = self.seq;
                    self.members[idx].timers.insert(kind, generation);
                    let at = self.now + duration;
                    self.schedule(at, Event::Timer { member: idx, kind, generation });
                },
                EngineAction::CancelTimer { kind } => {
                    self.members[idx].timers.remove(&kind);
                },
                EngineAction::DeliverWelcome { welcome } => {
                    self.join_group(idx, &welcome, &mut queue);
                },
                EngineAction::DeliverMessage { message } => {
                    self.deliver_message(idx, &message);
                },
                EngineAction::DeliverCommit { commit, .. } => {
                    self.deliver_commit(idx, commit, &mut queue);
                },
            }
        }
    }

    fn join_group(&mut self, idx: usize, welcome: &[u8], queue: &mut VecDeque<EngineAction>) {
        let member = &mut self.members[idx];
        if member.group.is_some() {
            return;
        }
        match RosterGroup::from_welcome(member.credential.clone(), welcome) {
            Ok(group) => {
                member.epochs.push(group.epoch());
                let actions = member.engine.init(&group);
                member.group = Some(group);
                queue.extend(actions);
            },
            Err(error) => tracing::warn!(member = %member.id, %error, "welcome rejected"),
        }
    }

    fn deliver_message(&mut self, idx: usize, message: &MlsMessage) {
        let member = &mut self.members[idx];
        let Some(group) = member.group.as_mut() else { return };

        if let Some(plaintext) = group.unprotect_application(message) {
            member.app_messages.push(plaintext);
            return;
        }
        if group.valid_proposal(message).is_some() {
            if let Err(error) = group.handle_proposal(message) {
                tracing::warn!(member = %member.id, %error, "proposal failed to cache");
            }
        }
    }

    fn deliver_commit(
        &mut self,
        idx: usize,
        commit: MlsMessage,
        queue: &mut VecDeque<EngineAction>,
    ) {
        let member = &mut self.members[idx];
        let Some(group) = member.group.as_mut() else { return };

        if let Err(error) = group.merge_commit(&commit) {
            tracing::error!(member = %member.id, %error, "agreed commit failed to merge");
            return;
        }
        member.delivered_commits.push(commit.message_ref());
        member.epochs.push(group.epoch());

        let group = member.group.as_ref().expect("just merged");
        queue.extend(member.engine.commit_merged(group));
    }

    fn enqueue_to_identity(&mut self, from: usize, to: &Identity, message: DdsMessage) {
        let Some(to_idx) = self.members.iter().position(|m| &m.id == to) else {
            tracing::debug!(peer = %to, "frame for unknown identity dropped");
            return;
        };
        if to_idx == from {
            return; // the network never loops a frame back to its sender
        }

        if self.capture_targets.contains(&to_idx) {
            self.captured.push((to_idx, message));
            return;
        }

        if self.link_hook.is_some() {
            let decoded = match &message {
                DdsMessage::CascadeConsensus(protected) => self.members[to_idx]
                    .group
                    .as_ref()
                    .and_then(|g| g.unprotect_application(protected))
                    .and_then(|bytes| CascadeConsensusMessage::decode_exact(&bytes).ok()),
                _ => None,
            };
            let from_id = self.members[from].id.clone();
            let to_id = self.members[to_idx].id.clone();
            let hook = self.link_hook.as_mut().expect("checked above");
            if hook(&from_id, &to_id, decoded.as_ref(), &message) {
                return;
            }
        }

        let delay =
            self.link_delays.get(&(from, to_idx)).copied().unwrap_or(self.default_delay);
        self.schedule(self.now + delay, Event::Message { to: to_idx, message });
    }

    fn schedule(&mut self, at: Duration, event: Event) {
        let key = (at, self.seq);
        self.seq += 1;
        self.events.insert(key, event);
    }
}
