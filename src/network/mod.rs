//! Peer transport: the client interface the consensus core calls, the
//! node service answering peers, and its HTTP and in-process transports.

pub mod client;
pub mod local;
pub mod server;
pub mod service;

pub use client::HttpClient;
pub use local::LocalNetwork;
pub use server::start_server;
pub use service::NodeService;

use crate::base::{Hash, Height, NodeAddress, Point, PublicKey, Signature};
use crate::block::{BlockMap, BlockMapItemType};
use crate::consensus::{Ballot, ProposalSignFact, SuffrageProof};
use crate::error::ErrorKind;
use crate::state::Operation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("{url} answered {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    #[error("response of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("unknown peer {0}")]
    UnknownPeer(NodeAddress),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::Status { status: 404, .. } => ErrorKind::NotFound,
            NetworkError::Status { status: 400, .. } => ErrorKind::Invalid,
            NetworkError::TooLarge { .. } | NetworkError::Serialization(_) => ErrorKind::Invalid,
            _ => ErrorKind::Network,
        }
    }
}

/// HTTP status a service error is answered with.
pub fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::NotFound => 404,
        ErrorKind::Invalid => 400,
        ErrorKind::AlreadyExists => 409,
        _ => 500,
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// How to reach a peer and what key it signs with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnInfo {
    pub address: NodeAddress,
    pub publickey: PublicKey,
    pub url: String,
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.address, self.url)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub point: Point,
    pub proposer: NodeAddress,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LastBlockMapResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockmap: Option<BlockMap>,
    pub updated: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChallengeRequest {
    /// hex
    pub input: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub signature: Signature,
}

/// Requests the consensus core makes to peers. Every call is bounded by
/// the request timeout.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn send_ballots(&self, conn: &ConnInfo, ballots: &[Ballot]) -> NetworkResult<()>;

    async fn operation(&self, conn: &ConnInfo, hash: &Hash) -> NetworkResult<Option<Operation>>;

    /// Returns false when the peer already knew the operation.
    async fn send_operation(&self, conn: &ConnInfo, operation: &Operation) -> NetworkResult<bool>;

    async fn request_proposal(
        &self,
        conn: &ConnInfo,
        point: Point,
        proposer: &NodeAddress,
    ) -> NetworkResult<Option<ProposalSignFact>>;

    async fn proposal(&self, conn: &ConnInfo, fact: &Hash) -> NetworkResult<Option<ProposalSignFact>>;

    /// `None` when the peer has nothing newer than `known`.
    async fn last_suffrage_proof(
        &self,
        conn: &ConnInfo,
        known: Option<Height>,
    ) -> NetworkResult<Option<SuffrageProof>>;

    async fn suffrage_proof(&self, conn: &ConnInfo, suffrage_height: Height) -> NetworkResult<Option<SuffrageProof>>;

    /// The peer's last block map and whether it differs from `known`.
    async fn last_blockmap(
        &self,
        conn: &ConnInfo,
        known: Option<Hash>,
    ) -> NetworkResult<(Option<BlockMap>, bool)>;

    async fn blockmap(&self, conn: &ConnInfo, height: Height) -> NetworkResult<Option<BlockMap>>;

    /// The raw item file, header included.
    async fn blockmap_item(
        &self,
        conn: &ConnInfo,
        height: Height,
        item_type: BlockMapItemType,
    ) -> NetworkResult<Option<Vec<u8>>>;

    async fn node_challenge(&self, conn: &ConnInfo, input: &[u8]) -> NetworkResult<Signature>;

    async fn sync_sources(&self, conn: &ConnInfo) -> NetworkResult<Vec<ConnInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_classify() {
        let e = NetworkError::Status {
            url: "http://a".to_string(),
            status: 404,
            message: "blockmap 3".to_string(),
        };
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(NetworkError::Timeout("http://a".to_string()).kind(), ErrorKind::Network);
        assert_eq!(status_for(ErrorKind::Invalid), 400);
        assert_eq!(status_for(ErrorKind::Broken), 500);
    }
}
