//! Protocol core of the Cascade distributed delivery service.
//!
//! This crate contains the pure state machine logic for disseminating MLS
//! traffic without a central server: epidemic gossip for proposals and
//! application messages, and the Cascade Consensus pipeline (CAC
//! broadcast, Restrained Consensus, Full Consensus) for agreeing on
//! commits. It is completely decoupled from I/O.
//!
//! # Architecture
//!
//! Protocol logic is strictly separated from transport concerns:
//!
//! ```text
//!      ┌───────────────────────────────┐
//!      │ cascade-core                  │
//!      │ - Gossip / CAC / RC / FC      │
//!      │ - Epoch lifecycle             │
//!      │ - Signature bookkeeping       │
//!      └───────────────────────────────┘
//!         ↓                        ↓
//! ┌────────────────────┐  ┌────────────────────┐
//! │ cascade-harness    │  │ cascade-client     │
//! │ - Virtual clock    │  │ - Tokio reactor    │
//! │ - Seeded RNG       │  │ - Real sockets     │
//! │ - Fault injection  │  │ - Timer wheel      │
//! └────────────────────┘  └────────────────────┘
//! ```
//!
//! # Key principles
//!
//! - No I/O in core: components never touch sockets, clocks or threads
//! - Action pattern: every entry point returns a `Vec` of actions for the
//!   driver to execute (send, arm timer, deliver upward)
//! - Borrowed group state: the MLS facade is passed by reference per call
//!   and never stored, so the caller stays in charge of epoch transitions
//! - Injected randomness: gossip sampling takes an explicit `RngCore`
//!
//! # Modules
//!
//! - [`group`]: the [`GroupState`](group::GroupState) facade and its
//!   roster-backed implementation
//! - [`signature`]: sequenced WITNESS/READY signatures
//! - [`gossip`]: Murmur-style epidemic broadcast
//! - [`cac`]: Byzantine-reliable CAC broadcast, generic over its payload
//! - [`restrained`]: short consensus among conflicting committers
//! - [`consensus`]: final-resort Full Consensus (simplified PBFT)
//! - [`cascade`]: the pipeline orchestrator
//! - [`engine`]: epoch gating, buffering and dispatch

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cac;
pub mod cascade;
pub mod consensus;
pub mod engine;
pub mod gossip;
pub mod group;
pub mod restrained;
pub mod signature;

pub use cac::{CacAction, CacBroadcast, CacPayload, ChoiceWeight};
pub use cascade::{CascadeAction, CascadeConsensus, CascadeTimer};
pub use consensus::{ConsensusAction, ConsensusTimer, FullConsensus};
pub use engine::{DeliveryService, EngineAction};
pub use gossip::{GossipAction, GossipBroadcaster, MINIMUM_PEERS};
pub use group::{Credential, GroupError, GroupState, KeyPackage, RosterGroup, Welcome};
pub use restrained::{RestrainedAction, RestrainedConsensus};
pub use signature::CacSignature;
