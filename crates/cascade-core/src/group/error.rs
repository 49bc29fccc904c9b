//! Group facade error types.

use thiserror::Error;

/// Errors from group lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    /// A welcome or key package failed to decode.
    #[error("malformed group material: {0}")]
    Malformed(String),

    /// The local identity is not part of the welcomed roster.
    #[error("identity {identity} not found in welcome roster")]
    NotWelcomed {
        /// The identity that was looked up.
        identity: String,
    },

    /// A commit referenced a proposal that is not cached.
    #[error("commit references unknown proposal {reference}")]
    UnknownProposal {
        /// Short form of the missing reference.
        reference: String,
    },

    /// A message failed classification for the current epoch.
    #[error("invalid {what} for epoch {epoch}")]
    InvalidMessage {
        /// What kind of message was rejected.
        what: &'static str,
        /// The epoch it was checked against.
        epoch: u64,
    },

    /// No leaf is available for an added member.
    #[error("member {identity} already present")]
    AlreadyMember {
        /// The duplicate identity.
        identity: String,
    },
}
