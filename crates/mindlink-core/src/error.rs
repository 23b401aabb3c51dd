//! Error types for Mindlink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not connected to core service")]
    NotConnected,

    #[error("core service reported failure: {0}")]
    BackendFailure(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("cancelled by user: {reason}")]
    UserCancelled { reason: String },

    #[error("proposal already pending for conversation {0}")]
    ProposalPending(String),

    #[error("proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("vote already cast for proposal {0}")]
    AlreadyVoted(String),

    #[error("transfer not found: {0}")]
    TransferNotFound(String),

    #[error("token window full for conversation {0}")]
    TokenLimitReached(String),

    #[error("channel to core service closed")]
    ChannelClosed,

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendFailure(message.into())
    }

    pub fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::UserCancelled {
            reason: reason.into(),
        }
    }
}
