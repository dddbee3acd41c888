//! Crate-level error and the classification every error maps onto.

use crate::base::BaseError;
use crate::block::BlockError;
use crate::config::ConfigError;
use crate::consensus::{BallotError, ProcessorError, SyncError, VoteproofError};
use crate::network::NetworkError;
use crate::state::OperationError;
use crate::storage::StorageError;
use std::fmt;
use thiserror::Error;

/// How callers should react to an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; do not retry.
    Invalid,
    /// Missing locally or at a peer; retryable within limits.
    NotFound,
    /// Transient proposal processing failure.
    RetryProposalProcessor,
    /// Processing produced no effective change.
    IgnoreProposalProcessor,
    /// Peer transport failed; try the next peer.
    Network,
    /// Idempotent write that already happened.
    AlreadyExists,
    /// Unrecoverable; the node moves to the broken state.
    Broken,
    Other,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound | ErrorKind::RetryProposalProcessor | ErrorKind::Network
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Invalid => "invalid",
            ErrorKind::NotFound => "not found",
            ErrorKind::RetryProposalProcessor => "retry proposal processor",
            ErrorKind::IgnoreProposalProcessor => "ignore proposal processor",
            ErrorKind::Network => "network",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Broken => "broken",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum IsaacError {
    #[error(transparent)]
    Base(#[from] BaseError),

    #[error(transparent)]
    Ballot(#[from] BallotError),

    #[error(transparent)]
    Voteproof(#[from] VoteproofError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Other(String),
}

impl IsaacError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IsaacError::Base(e) => e.kind(),
            IsaacError::Ballot(e) => e.kind(),
            IsaacError::Voteproof(e) => e.kind(),
            IsaacError::Operation(e) => e.kind(),
            IsaacError::Block(e) => e.kind(),
            IsaacError::Storage(e) => e.kind(),
            IsaacError::Network(e) => e.kind(),
            IsaacError::Processor(e) => e.kind(),
            IsaacError::Sync(e) => e.kind(),
            IsaacError::Config(e) => e.kind(),
            IsaacError::Other(_) => ErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, IsaacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_pass_through_wrappers() {
        let err: IsaacError = StorageError::NotFound("blockmap 3".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.kind().is_retryable());

        let err: IsaacError = BallotError::Base(BaseError::EmptyHash).into();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(!err.kind().is_retryable());

        let err: IsaacError = OperationError::Storage(StorageError::Io(std::io::Error::other("disk"))).into();
        assert_eq!(err.kind(), ErrorKind::Broken);
    }
}
