//! Client glue: command handling, group lifecycle, and execution of
//! engine actions.
//!
//! The client owns the group facade and the engine, runs them from the
//! reactor loop, and executes every [`EngineAction`] the engine returns.
//! Engine-triggered deliveries can themselves produce follow-up actions
//! (joining on a welcome, advancing an epoch), so actions are executed
//! through a work queue rather than recursion.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use cascade_core::cascade::CascadeTimer;
use cascade_core::group::KeyPackage;
use cascade_core::{Credential, DeliveryService, EngineAction, GroupState, RosterGroup};
use cascade_proto::wire::{WireDecode, WireEncode};
use cascade_proto::{DdsMessage, Identity, MlsMessage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;

use crate::net::{Network, TimerId, TimerWheel};
use crate::pki;

/// Fixed group identifier of this deployment.
const GROUP_ID: &[u8] = &[0xAB, 0xCD];

/// What a fired timer means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
    /// A consensus-pipeline timer owned by the engine.
    Cascade(CascadeTimer),
    /// The local auto-commit delay after delivering a proposal.
    AutoCommit,
}

/// The interactive MLS client.
pub struct MlsClient {
    credential: Credential,
    group: Option<RosterGroup>,
    engine: DeliveryService<StdRng>,
    net: Network,
    wheel: TimerWheel<TimerKey>,
    timer_ids: HashMap<TimerKey, TimerId>,
    pki_host: String,
    rtt: Duration,
    rng: StdRng,
}

impl MlsClient {
    /// Build a client for `credential`, resolving peers via `pki_host`.
    pub fn new(credential: Credential, pki_host: String, rtt: Duration) -> Self {
        let self_id = credential.identity().clone();
        Self {
            credential,
            group: None,
            engine: DeliveryService::new(self_id, rtt, StdRng::from_entropy()),
            net: Network::new(pki_host.clone()),
            wheel: TimerWheel::new(),
            timer_ids: HashMap::new(),
            pki_host,
            rtt,
            rng: StdRng::from_entropy(),
        }
    }

    /// Earliest pending timer deadline, for the reactor's select.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.wheel.next_deadline()
    }

    /// Handle one stdin command. Returns `false` on `stop`.
    pub async fn handle_command(&mut self, line: &str) -> bool {
        let (command, arg) = match line.split_once(char::is_whitespace) {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };

        match command {
            "create" => self.cmd_create().await,
            "add" | "remove" | "message" if arg.is_empty() => {
                println!("Error: missing argument for command {command}");
            },
            "add" => self.cmd_add(arg).await,
            "remove" => self.cmd_remove(arg).await,
            "update" => self.cmd_update().await,
            "message" => self.cmd_message(arg).await,
            "stop" => return false,
            "" => {},
            _ => println!("Invalid command"),
        }
        true
    }

    /// Handle one complete frame from a peer.
    pub async fn handle_frame(&mut self, frame: Bytes) {
        let message = match DdsMessage::decode_exact(&frame) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed frame");
                return;
            },
        };
        let actions = self.engine.receive_network_message(self.group.as_ref(), message);
        self.run_actions(actions).await;
    }

    /// Fire every due timer.
    pub async fn handle_due_timers(&mut self) {
        let due = self.wheel.pop_due(Instant::now());
        for (id, key) in due {
            if self.timer_ids.get(&key) == Some(&id) {
                self.timer_ids.remove(&key);
            }
            match key {
                TimerKey::Cascade(kind) => {
                    let Some(group) = &self.group else { continue };
                    let actions = self.engine.handle_timer(group, kind);
                    self.run_actions(actions).await;
                },
                TimerKey::AutoCommit => self.auto_commit().await,
            }
        }
    }

    async fn cmd_create(&mut self) {
        if self.group.is_some() {
            return;
        }
        let group = RosterGroup::create(GROUP_ID, self.credential.clone());
        println!("Created group epoch {}", group.epoch());
        let actions = self.engine.init(&group);
        self.group = Some(group);
        self.run_actions(actions).await;
    }

    async fn cmd_add(&mut self, ids: &str) {
        if self.group.is_none() {
            println!("Error: not in a group");
            return;
        }
        for id in ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let prekey = match pki::query(&self.pki_host, id).await {
                Ok((_, prekey)) => prekey,
                Err(error) => {
                    tracing::warn!(%error, "pki query failed");
                    println!("User not found: {id}");
                    continue;
                },
            };
            let key_package = match KeyPackage::decode_exact(&prekey) {
                Ok(kp) => kp,
                Err(error) => {
                    tracing::warn!(%error, "malformed key package from pki");
                    continue;
                },
            };

            let group = self.group.as_ref().expect("checked above");
            match group.propose_add(key_package) {
                Ok(proposal) => self.dispatch(proposal).await,
                Err(error) => println!("Cannot add {id}: {error}"),
            }
        }
    }

    async fn cmd_remove(&mut self, id: &str) {
        let Some(group) = &self.group else {
            println!("Error: not in a group");
            return;
        };
        match group.propose_remove(&Identity::from(id)) {
            Some(proposal) => self.dispatch(proposal).await,
            None => println!("User not found: {id}"),
        }
    }

    async fn cmd_update(&mut self) {
        let Some(group) = &mut self.group else {
            println!("Error: not in a group");
            return;
        };
        let seed = RosterGroup::fresh_secret(&mut self.rng);
        let proposal = group.propose_update(seed);
        self.dispatch(proposal).await;
    }

    async fn cmd_message(&mut self, text: &str) {
        let Some(group) = &self.group else {
            println!("Error: not in a group");
            return;
        };
        let message = group.protect(text.as_bytes());
        self.dispatch(message).await;
    }

    async fn dispatch(&mut self, message: MlsMessage) {
        let Some(group) = &self.group else { return };
        let actions = self.engine.dispatch_message(group, message);
        self.run_actions(actions).await;
    }

    /// Execute engine actions to quiescence.
    async fn run_actions(&mut self, actions: Vec<EngineAction>) {
        let mut queue: VecDeque<EngineAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                EngineAction::Send { to, message } => self.net.send(&to, &message).await,
                EngineAction::Broadcast { message } => self.net.broadcast(&message).await,
                EngineAction::SendMany { to, message } => {
                    self.net.send_many(&to, &message).await
                },
                EngineAction::SetTimer { kind, duration } => {
                    self.arm(TimerKey::Cascade(kind), duration);
                },
                EngineAction::CancelTimer { kind } => self.disarm(TimerKey::Cascade(kind)),
                EngineAction::DeliverWelcome { welcome } => {
                    self.join_group(&welcome, &mut queue).await;
                },
                EngineAction::DeliverMessage { message } => self.deliver_message(&message),
                EngineAction::DeliverCommit { commit, added, removed } => {
                    self.deliver_commit(commit, added, removed, &mut queue).await;
                },
            }
        }
    }

    async fn join_group(&mut self, welcome: &[u8], queue: &mut VecDeque<EngineAction>) {
        if self.group.is_some() {
            return;
        }
        let group = match RosterGroup::from_welcome(self.credential.clone(), welcome) {
            Ok(group) => group,
            Err(error) => {
                tracing::warn!(%error, "welcome rejected");
                return;
            },
        };
        println!("Joined group epoch {}", group.epoch());

        for member in group.member_identities(true) {
            if let Err(error) = self.net.connect(&member).await {
                tracing::warn!(peer = %member, %error, "cannot connect to member");
            }
        }

        let actions = self.engine.init(&group);
        self.group = Some(group);
        queue.extend(actions);
    }

    /// A proposal or application message came out of gossip.
    fn deliver_message(&mut self, message: &MlsMessage) {
        let Some(group) = &mut self.group else { return };

        if let Some(plaintext) = group.unprotect_application(message) {
            println!("Message: {}", String::from_utf8_lossy(&plaintext));
            return;
        }

        if group.valid_proposal(message).is_some() {
            let from_self = group.proposal_sender(message) == Some(group.self_index());
            if let Err(error) = group.handle_proposal(message) {
                tracing::warn!(%error, "delivered proposal failed to cache");
                return;
            }

            // First proposal of the epoch arms the auto-commit: one RTT
            // for our own proposal, two for a remote one so the proposer
            // gets to commit first.
            if !self.timer_ids.contains_key(&TimerKey::AutoCommit)
                && self.engine.can_propose_commit()
            {
                let delay = if from_self { self.rtt } else { 2 * self.rtt };
                self.arm(TimerKey::AutoCommit, delay);
            }
        }
    }

    async fn auto_commit(&mut self) {
        let Some(group) = &self.group else { return };
        if !self.engine.can_propose_commit() {
            return;
        }

        // Stage on a clone so dropping our own pending updates has no
        // side effects if the commit loses.
        let mut staged = group.clone();
        staged.remove_self_updates();
        let nonce = RosterGroup::fresh_secret(&mut self.rng);
        let (commit, welcome) = staged.commit_pending(nonce);

        let welcome_bytes = welcome.map(|w| w.encode_to_bytes());
        let actions = self.engine.propose_commit(group, commit, welcome_bytes);
        self.run_actions(actions).await;
    }

    async fn deliver_commit(
        &mut self,
        commit: MlsMessage,
        added: Vec<Identity>,
        removed: Vec<Identity>,
        queue: &mut VecDeque<EngineAction>,
    ) {
        for id in &added {
            println!("Added: {id}");
            if let Err(error) = self.net.connect(id).await {
                tracing::warn!(peer = %id, %error, "cannot connect to added member");
            }
        }
        for id in &removed {
            println!("Removed: {id}");
            self.net.disconnect(id);
        }

        let Some(group) = &mut self.group else { return };
        if let Err(error) = group.merge_commit(&commit) {
            tracing::error!(%error, "agreed commit failed to merge");
            return;
        }
        println!("New epoch {}", group.epoch());

        self.disarm(TimerKey::AutoCommit);
        let group = self.group.as_ref().expect("group present");
        queue.extend(self.engine.commit_merged(group));
    }

    fn arm(&mut self, key: TimerKey, delay: Duration) {
        if let Some(previous) = self.timer_ids.remove(&key) {
            self.wheel.unregister(previous);
        }
        let id = self.wheel.register(delay, key);
        self.timer_ids.insert(key, id);
    }

    fn disarm(&mut self, key: TimerKey) {
        if let Some(id) = self.timer_ids.remove(&key) {
            self.wheel.unregister(id);
        }
    }
}
