//! Deterministic simulation harness for the Cascade delivery service.
//!
//! The harness runs any number of members fully in memory: a virtual
//! clock, per-link delivery delays, a drop/observe hook, and message
//! capture for reordering scenarios. Engines are seeded with fixed RNGs,
//! so every run of a scenario is reproducible.
//!
//! The core is sans-IO, which is what makes this possible: the world
//! executes the same engine actions the real reactor would, just against
//! queues instead of sockets and a virtual clock instead of a timer
//! wheel.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod world;

pub use world::{SimMember, SimWorld};
