//! In-process transport: peers are `NodeService`s in the same process.

use super::{status_for, ConnInfo, NetworkClient, NetworkError, NetworkResult, NodeService};
use crate::base::{Hash, Height, NodeAddress, Point, Signature};
use crate::block::{BlockMap, BlockMapItemType};
use crate::consensus::{Ballot, ProposalSignFact, SuffrageProof};
use crate::error::IsaacError;
use crate::state::Operation;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct LocalNetwork {
    services: RwLock<HashMap<NodeAddress, Arc<NodeService>>>,
    offline: RwLock<HashSet<NodeAddress>>,
    delays: RwLock<HashMap<NodeAddress, Duration>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<NodeService>) {
        self.services.write().insert(service.address().clone(), service);
    }

    /// Makes requests to `address` fail like an unreachable peer.
    pub fn set_offline(&self, address: &NodeAddress, offline: bool) {
        let mut set = self.offline.write();
        if offline {
            set.insert(address.clone());
        } else {
            set.remove(address);
        }
    }

    /// Makes `address` answer every request after `delay`.
    pub fn set_delay(&self, address: &NodeAddress, delay: Option<Duration>) {
        let mut delays = self.delays.write();
        match delay {
            Some(d) => delays.insert(address.clone(), d),
            None => delays.remove(address),
        };
    }

    async fn reach(&self, conn: &ConnInfo) -> NetworkResult<Arc<NodeService>> {
        let delay = self.delays.read().get(&conn.address).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.service(conn)
    }

    fn service(&self, conn: &ConnInfo) -> NetworkResult<Arc<NodeService>> {
        if self.offline.read().contains(&conn.address) {
            return Err(NetworkError::Request {
                url: conn.url.clone(),
                reason: "peer offline".to_string(),
            });
        }
        self.services
            .read()
            .get(&conn.address)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownPeer(conn.address.clone()))
    }
}

fn status(conn: &ConnInfo, err: IsaacError) -> NetworkError {
    NetworkError::Status {
        url: conn.url.clone(),
        status: status_for(err.kind()),
        message: err.to_string(),
    }
}

#[async_trait]
impl NetworkClient for LocalNetwork {
    async fn send_ballots(&self, conn: &ConnInfo, ballots: &[Ballot]) -> NetworkResult<()> {
        self.reach(conn).await?.receive_ballots(ballots.to_vec());
        Ok(())
    }

    async fn operation(&self, conn: &ConnInfo, hash: &Hash) -> NetworkResult<Option<Operation>> {
        self.reach(conn).await?.operation(hash).map_err(|e| status(conn, e))
    }

    async fn send_operation(&self, conn: &ConnInfo, operation: &Operation) -> NetworkResult<bool> {
        self.reach(conn).await?
            .receive_operation(operation.clone())
            .map_err(|e| status(conn, e))
    }

    async fn request_proposal(
        &self,
        conn: &ConnInfo,
        point: Point,
        proposer: &NodeAddress,
    ) -> NetworkResult<Option<ProposalSignFact>> {
        self.reach(conn).await?
            .request_proposal(point, proposer)
            .map_err(|e| status(conn, e))
    }

    async fn proposal(&self, conn: &ConnInfo, fact: &Hash) -> NetworkResult<Option<ProposalSignFact>> {
        self.reach(conn).await?.proposal(fact).map_err(|e| status(conn, e))
    }

    async fn last_suffrage_proof(
        &self,
        conn: &ConnInfo,
        known: Option<Height>,
    ) -> NetworkResult<Option<SuffrageProof>> {
        self.reach(conn).await?
            .last_suffrage_proof(known)
            .map_err(|e| status(conn, e))
    }

    async fn suffrage_proof(&self, conn: &ConnInfo, suffrage_height: Height) -> NetworkResult<Option<SuffrageProof>> {
        self.reach(conn).await?
            .suffrage_proof(suffrage_height)
            .map_err(|e| status(conn, e))
    }

    async fn last_blockmap(
        &self,
        conn: &ConnInfo,
        known: Option<Hash>,
    ) -> NetworkResult<(Option<BlockMap>, bool)> {
        self.reach(conn).await?.last_blockmap(known).map_err(|e| status(conn, e))
    }

    async fn blockmap(&self, conn: &ConnInfo, height: Height) -> NetworkResult<Option<BlockMap>> {
        self.reach(conn).await?.blockmap(height).map_err(|e| status(conn, e))
    }

    async fn blockmap_item(
        &self,
        conn: &ConnInfo,
        height: Height,
        item_type: BlockMapItemType,
    ) -> NetworkResult<Option<Vec<u8>>> {
        self.reach(conn).await?
            .blockmap_item(height, item_type)
            .map_err(|e| status(conn, e))
    }

    async fn node_challenge(&self, conn: &ConnInfo, input: &[u8]) -> NetworkResult<Signature> {
        self.reach(conn).await?.node_challenge(input).map_err(|e| status(conn, e))
    }

    async fn sync_sources(&self, conn: &ConnInfo) -> NetworkResult<Vec<ConnInfo>> {
        Ok(self.reach(conn).await?.sync_sources())
    }
}
