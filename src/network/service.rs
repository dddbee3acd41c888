//! Answers peer requests from local storage, independent of transport.

use super::ConnInfo;
use crate::base::{Hash, Height, LocalNode, NetworkId, NodeAddress, Point, Signature};
use crate::block::{BlockError, BlockMap, BlockMapItemType, BlockReader};
use crate::consensus::{
    Ballot, BallotQueue, ProposalMaker, ProposalSignFact, StateType, States, SuffrageProof, SyncSourcePool,
};
use crate::error::{IsaacError, Result};
use crate::state::Operation;
use crate::storage::{PermanentDatabase, Pool, StorageError};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

pub struct NodeService {
    local: LocalNode,
    network_id: NetworkId,
    db: Arc<dyn PermanentDatabase>,
    pool: Arc<dyn Pool>,
    block_root: PathBuf,
    ballots: Arc<BallotQueue>,
    maker: Arc<ProposalMaker>,
    sync_sources: Arc<SyncSourcePool>,
    states: States,
}

impl NodeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: LocalNode,
        network_id: NetworkId,
        db: Arc<dyn PermanentDatabase>,
        pool: Arc<dyn Pool>,
        block_root: PathBuf,
        ballots: Arc<BallotQueue>,
        maker: Arc<ProposalMaker>,
        sync_sources: Arc<SyncSourcePool>,
        states: States,
    ) -> Self {
        NodeService {
            local,
            network_id,
            db,
            pool,
            block_root,
            ballots,
            maker,
            sync_sources,
            states,
        }
    }

    pub fn address(&self) -> &NodeAddress {
        self.local.address()
    }

    pub fn state(&self) -> StateType {
        self.states.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.states.last_error()
    }

    /// Queues ballots for the ballotbox; returns how many were queued.
    pub fn receive_ballots(&self, ballots: Vec<Ballot>) -> usize {
        let n = ballots.len();
        for ballot in ballots {
            self.ballots.push(ballot);
        }
        n
    }

    pub fn operation(&self, hash: &Hash) -> Result<Option<Operation>> {
        Ok(self.pool.operation(hash)?)
    }

    /// Returns false when the operation is already known.
    pub fn receive_operation(&self, operation: Operation) -> Result<bool> {
        operation.is_valid(&self.network_id)?;
        if self.db.exists_known_operation(&operation.hash)?
            || self.db.exists_in_state_operation(&operation.fact_hash())?
        {
            return Ok(false);
        }
        Ok(self.pool.set_operation(operation)?)
    }

    pub fn proposal(&self, fact: &Hash) -> Result<Option<ProposalSignFact>> {
        Ok(self.pool.proposal(fact)?)
    }

    /// A known proposal for the point, or a new one when the local node is
    /// the proposer and the previous block is committed.
    pub fn request_proposal(&self, point: Point, proposer: &NodeAddress) -> Result<Option<ProposalSignFact>> {
        if let Some(pr) = self.pool.proposal_by_point(point, proposer)? {
            return Ok(Some(pr));
        }
        if proposer != self.local.address() || point.height <= Height::GENESIS {
            return Ok(None);
        }
        let Some(previous) = self.db.blockmap(point.height.prev())? else {
            return Ok(None);
        };
        debug!(point = %point, "making proposal on request");
        Ok(Some(self.maker.make(point, previous.manifest.hash)?))
    }

    pub fn last_suffrage_proof(&self, known: Option<Height>) -> Result<Option<SuffrageProof>> {
        let proof = self.db.last_suffrage_proof()?;
        Ok(proof.filter(|p| known.map_or(true, |k| p.suffrage_height() > k)))
    }

    pub fn suffrage_proof(&self, suffrage_height: Height) -> Result<Option<SuffrageProof>> {
        Ok(self.db.suffrage_proof(suffrage_height)?)
    }

    pub fn last_blockmap(&self, known: Option<Hash>) -> Result<(Option<BlockMap>, bool)> {
        match self.db.last_blockmap()? {
            Some(bm) if Some(bm.manifest.hash) == known => Ok((None, false)),
            Some(bm) => Ok((Some(bm), true)),
            None => Ok((None, false)),
        }
    }

    pub fn blockmap(&self, height: Height) -> Result<Option<BlockMap>> {
        Ok(self.db.blockmap(height)?)
    }

    pub fn blockmap_item(&self, height: Height, item_type: BlockMapItemType) -> Result<Option<Vec<u8>>> {
        if self.db.blockmap(height)?.is_none() {
            return Ok(None);
        }
        let reader = BlockReader::open(&self.block_root, height)?;
        match reader.raw(item_type) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(BlockError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn node_challenge(&self, input: &[u8]) -> Result<Signature> {
        if input.is_empty() {
            return Err(IsaacError::Storage(StorageError::InvalidData("empty challenge".to_string())));
        }
        Ok(self.local.sign(&self.network_id, input))
    }

    pub fn sync_sources(&self) -> Vec<ConnInfo> {
        self.sync_sources.sources()
    }
}
