//! Storage collaborators: the permanent database, the per-height temp
//! database and the proposal/operation pool.

pub mod pool;
pub mod sqlite;
pub mod temp;

pub use pool::MemPool;
pub use sqlite::SqliteDatabase;
pub use temp::TempDatabase;

use crate::base::{Hash, Height, NodeAddress, Point};
use crate::block::BlockMap;
use crate::consensus::{ProposalSignFact, Suffrage, SuffrageProof, Voteproof};
use crate::error::ErrorKind;
use crate::state::{
    GetState, Operation, State, SUFFRAGE_EXPELS_STATE_KEY, SUFFRAGE_STATE_KEY,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("height mismatch: expected {expected}, found {found}")]
    HeightMismatch { expected: Height, found: Height },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StorageError::InvalidData(_) | StorageError::HeightMismatch { .. } => ErrorKind::Invalid,
            StorageError::Sqlite(_) | StorageError::Serialization(_) | StorageError::Io(_) => {
                ErrorKind::Broken
            }
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Committed chain data. Single writer on the commit path, any number of
/// readers.
pub trait PermanentDatabase: Send + Sync {
    fn last_blockmap(&self) -> StorageResult<Option<BlockMap>>;

    fn blockmap(&self, height: Height) -> StorageResult<Option<BlockMap>>;

    /// Latest state of `key`.
    fn state(&self, key: &str) -> StorageResult<Option<State>>;

    /// Latest state of `key` written at or below `height`.
    fn state_at(&self, key: &str, height: Height) -> StorageResult<Option<State>>;

    fn suffrage_proof(&self, suffrage_height: Height) -> StorageResult<Option<SuffrageProof>>;

    fn last_suffrage_proof(&self) -> StorageResult<Option<SuffrageProof>>;

    /// Whether an operation fact was committed into state.
    fn exists_in_state_operation(&self, fact: &Hash) -> StorageResult<bool>;

    /// Whether an operation was seen in any committed block.
    fn exists_known_operation(&self, operation: &Hash) -> StorageResult<bool>;

    /// INIT and ACCEPT voteproofs of a committed block.
    fn voteproofs(&self, height: Height) -> StorageResult<Option<(Voteproof, Voteproof)>>;

    /// Atomically promotes a staged height.
    fn merge_temp_database(&self, temp: &TempDatabase) -> StorageResult<()>;

    /// Suffrage voting at `height`: the suffrage state committed below it,
    /// minus nodes expelled at `height`.
    fn suffrage(&self, height: Height) -> StorageResult<Option<Suffrage>> {
        let base = if height > Height::GENESIS { height.prev() } else { Height::GENESIS };

        let Some(nodes) = self.state_at(SUFFRAGE_STATE_KEY, base)? else {
            return Ok(None);
        };
        let expels = self.state_at(SUFFRAGE_EXPELS_STATE_KEY, base)?;
        Suffrage::from_states(&nodes, expels.as_ref(), height)
            .map(Some)
            .map_err(|e| StorageError::InvalidData(e.to_string()))
    }
}

/// Reads states as of the last committed block; what operations see while
/// a proposal is processed.
pub struct LastStates<'a>(pub &'a dyn PermanentDatabase);

impl GetState for LastStates<'_> {
    fn state(&self, key: &str) -> Result<Option<State>, StorageError> {
        self.0.state(key)
    }
}

/// Pending proposals and operations.
pub trait Pool: Send + Sync {
    /// Returns false when a proposal with the same fact hash is known.
    fn set_proposal(&self, proposal: ProposalSignFact) -> StorageResult<bool>;

    fn proposal(&self, fact: &Hash) -> StorageResult<Option<ProposalSignFact>>;

    fn proposal_by_point(
        &self,
        point: Point,
        proposer: &NodeAddress,
    ) -> StorageResult<Option<ProposalSignFact>>;

    /// Returns false when an operation with the same fact hash is known.
    fn set_operation(&self, operation: Operation) -> StorageResult<bool>;

    fn operation(&self, hash: &Hash) -> StorageResult<Option<Operation>>;

    /// Unexpired operations, oldest first, up to `limit`.
    fn operations_for_proposal(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<Operation>>;

    /// Drops operations whose facts were committed.
    fn remove_operations(&self, facts: &[Hash]) -> StorageResult<usize>;

    /// Drops proposals below `height`.
    fn clean_proposals(&self, height: Height) -> StorageResult<usize>;
}
