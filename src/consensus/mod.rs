//! ISAAC+ consensus: ballots and voteproofs, the ballotbox, proposal
//! processing, sync and the state handlers that drive a node through
//! INIT and ACCEPT rounds.
//!
//! ## Structure
//! - `fact.rs` - proposal and ballot facts
//! - `ballot.rs` / `voteproof.rs` - signed votes and their finished tallies
//! - `suffrage.rs` - membership per height and suffrage proofs
//! - `ballotbox.rs` - vote records and voteproof emission
//! - `queue.rs` - inbound ballot queue and broadcaster
//! - `proposal.rs` - proposer selection, proposal maker and selector
//! - `processor.rs` - proposal processors
//! - `timers.rs` - named handler timers
//! - `sync.rs` - sync sources and block catch-up
//! - `states/` - handlers and the state driver

pub mod ballot;
pub mod ballotbox;
pub mod fact;
pub mod processor;
pub mod proposal;
pub mod queue;
pub mod states;
pub mod suffrage;
pub mod sync;
pub mod timers;
pub mod voteproof;

#[cfg(test)]
#[path = "tests.rs"]
pub(crate) mod tests;

pub use ballot::Ballot;
pub use ballotbox::Ballotbox;
pub use fact::{
    AcceptBallotFact, BallotFact, BallotSignFact, InitBallotFact, ProposalFact, ProposalOperation,
    ProposalSignFact,
};
pub use processor::{ProcessorError, ProcessorStatus, ProposalProcessor, ProposalProcessors};
pub use proposal::{network_policy, unavailable_proposal, ProposalMaker, ProposalSelector, ProposerSelector};
pub use queue::{BallotQueue, Broadcaster};
pub use states::{ConsensusContext, StateDriver, StateType, States};
pub use suffrage::{DatabaseSuffrage, Suffrage, SuffrageProof, SuffrageSource};
pub use sync::{SyncError, SyncSourceChecker, SyncSourcePool, Syncer};
pub use timers::{TimerId, Timers};
pub use voteproof::{LastVoteproofs, Voteproof, VoteproofKind};

use crate::base::{BaseError, LocalNode, NetworkId, NodeAddress, StagePoint, VoteResult};
use crate::config::LocalParams;
use crate::error::ErrorKind;
use crate::network::{ConnInfo, NetworkClient};
use crate::state::OperationError;
use crate::storage::{PermanentDatabase, Pool, StorageError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Local node, storage and transport every consensus part works with.
#[derive(Clone)]
pub struct NodeArgs {
    pub local: LocalNode,
    pub network_id: NetworkId,
    pub params: LocalParams,
    pub db: Arc<dyn PermanentDatabase>,
    pub pool: Arc<dyn Pool>,
    pub block_root: PathBuf,
    pub client: Arc<dyn NetworkClient>,
    /// Suffrage peers, local node excluded.
    pub peers: Vec<ConnInfo>,
}

/// Ballot and fact validation failures.
#[derive(Debug, Error)]
pub enum BallotError {
    #[error("invalid fact: {0}")]
    InvalidFact(String),

    #[error("invalid ballot: {0}")]
    Invalid(String),

    #[error("ballot and voteproof disagree: {0}")]
    WrongVoteproof(String),

    #[error("ballot signed at {signed_at} before voteproof at {stagepoint} finished")]
    Stale {
        stagepoint: StagePoint,
        signed_at: String,
    },

    #[error(transparent)]
    Base(#[from] BaseError),

    #[error(transparent)]
    Voteproof(#[from] VoteproofError),

    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl BallotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BallotError::Base(e) => e.kind(),
            BallotError::Voteproof(e) => e.kind(),
            BallotError::Operation(e) => e.kind(),
            _ => ErrorKind::Invalid,
        }
    }
}

/// Voteproof validation failures.
#[derive(Debug, Error)]
pub enum VoteproofError {
    #[error("invalid voteproof: {0}")]
    Invalid(String),

    #[error("unknown node in voteproof: {0}")]
    UnknownNode(NodeAddress),

    #[error("public key of {0} does not match suffrage")]
    PublicKeyMismatch(NodeAddress),

    #[error("voteproof result mismatch: expected {expected}, found {found}")]
    ResultMismatch { expected: VoteResult, found: VoteResult },

    #[error("suffrage not found for height {0}")]
    SuffrageNotFound(i64),

    #[error(transparent)]
    Ballot(Box<BallotError>),

    #[error(transparent)]
    Base(#[from] BaseError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<BallotError> for VoteproofError {
    fn from(err: BallotError) -> Self {
        VoteproofError::Ballot(Box::new(err))
    }
}

impl VoteproofError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VoteproofError::SuffrageNotFound(_) => ErrorKind::NotFound,
            VoteproofError::Ballot(e) => e.kind(),
            VoteproofError::Base(e) => e.kind(),
            VoteproofError::Operation(e) => e.kind(),
            VoteproofError::Storage(e) => e.kind(),
            _ => ErrorKind::Invalid,
        }
    }
}
