//! Wire codec and shared data model for the Cascade delivery service.
//!
//! This crate contains every type that crosses a socket, plus the
//! cryptographic references used to name messages. It is pure data: no
//! I/O, no clocks, no protocol state.
//!
//! # Wire format
//!
//! All integers are big-endian. Byte strings are `u32` length-prefixed,
//! lists are `u32` count-prefixed, optionals carry a `u8` presence flag,
//! and every sum type starts with a `u8` tag. Unknown tags decode to a
//! recoverable [`WireError`]; the caller drops the frame and keeps the
//! connection open.
//!
//! # Modules
//!
//! - [`wire`]: encode/decode primitives over `bytes`
//! - [`refs`]: domain-separated message references
//! - [`auth`]: the signed [`AuthenticatedContent`] envelope
//! - [`mls`]: the epoch-tagged [`MlsMessage`] envelope and peer framing
//! - [`consensus`]: CAC / Restrained Consensus / Full Consensus messages
//! - [`pki`]: directory-service request/response types

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod auth;
pub mod consensus;
pub mod mls;
pub mod pki;
pub mod refs;
pub mod wire;

pub use auth::{AuthenticatedContent, ContentType, Identity, LeafIndex};
pub use consensus::{
    instance, Cac2Content, CacKind, CacMessage, CascadeBody, CascadeConsensusMessage,
    CascadeInstance, ConsensusContent, ConsensusMessage, RestrainedConsContent,
    RestrainedConsensusMessage, ViewChangeContent,
};
pub use mls::{DdsMessage, GossipMessage, MlsMessage};
pub use refs::MessageRef;
pub use wire::{WireDecode, WireEncode, WireError};
