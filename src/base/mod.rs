//! Primitive value types shared by every layer: hashes, heights and points,
//! keys and signs, thresholds, fixed trees and cancellation.

pub mod cancel;
pub mod fixedtree;
pub mod hash;
pub mod height;
pub mod hint;
pub mod keys;
pub mod node;
pub mod sign;
pub mod threshold;

pub use cancel::CancellationToken;
pub use fixedtree::{FixedTree, FixedTreeGenerator, FixedTreeNode, FixedTreeProof};
pub use hash::Hash;
pub use height::{Height, Point, Round, Stage, StagePoint};
pub use hint::{Hint, HintTable};
pub use keys::{NetworkId, PrivateKey, PublicKey, Signature};
pub use node::{LocalNode, Node, NodeAddress};
pub use sign::Sign;
pub use threshold::{find_majority, MajorityOutcome, Threshold, ThresholdRequirement, VoteResult};

use crate::error::ErrorKind;
use thiserror::Error;

/// Errors raised while building or checking primitive values.
#[derive(Debug, Error)]
pub enum BaseError {
    #[error("empty hash")]
    EmptyHash,

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid height: {0}")]
    InvalidHeight(i64),

    #[error("invalid node address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid network id: {0}")]
    InvalidNetworkId(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("seed too short: {found} bytes, at least {min} required")]
    InvalidSeed { found: usize, min: usize },

    #[error("invalid threshold: {0}")]
    InvalidThreshold(f64),

    #[error("unknown hint: {0:?}")]
    UnknownHint(String),

    #[error("invalid hint: {0:?}")]
    InvalidHint(String),

    #[error("fixed tree: {0}")]
    FixedTree(String),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("canceled")]
    Canceled,
}

impl BaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BaseError::Canceled => ErrorKind::Other,
            _ => ErrorKind::Invalid,
        }
    }
}
