//! Proposer selection, the local proposal maker and the proposal selector.

use super::fact::{ProposalFact, ProposalOperation, ProposalSignFact};
use super::processor::ProcessorError;
use super::suffrage::Suffrage;
use super::NodeArgs;
use crate::base::{Hash, LocalNode, NetworkId, Node, NodeAddress, Point};
use crate::error::{IsaacError, Result};
use crate::network::ConnInfo;
use crate::state::{NetworkPolicy, StateValue, NETWORK_POLICY_STATE_KEY};
use crate::storage::{PermanentDatabase, Pool, StorageError};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Deterministic proposer of a point: `sha256(height ‖ round ‖ previous
/// block)` modulo the suffrage size, over the address-sorted suffrage.
pub struct ProposerSelector;

impl ProposerSelector {
    pub fn select<'a>(point: Point, previous_block: &Hash, suffrage: &'a Suffrage) -> Option<&'a Node> {
        if suffrage.is_empty() {
            return None;
        }
        let h = Hash::digest_parts([
            point.height.to_bytes().as_slice(),
            point.round.to_bytes().as_slice(),
            previous_block.as_bytes(),
        ]);
        let mut n = [0u8; 8];
        n.copy_from_slice(&h.as_bytes()[..8]);
        let index = u64::from_be_bytes(n) % suffrage.len() as u64;
        suffrage.nodes().get(index as usize)
    }
}

/// Proposal hash voted for a point whose proposal could not be had from
/// its proposer. Nothing is processed for it; an INIT majority on it moves
/// the point to the next round.
pub fn unavailable_proposal(point: Point, previous_block: &Hash) -> Hash {
    Hash::digest_parts([
        b"proposal-unavailable".as_slice(),
        point.height.to_bytes().as_slice(),
        point.round.to_bytes().as_slice(),
        previous_block.as_bytes(),
    ])
}

/// Network policy committed in state, or the default before any.
pub fn network_policy(db: &dyn PermanentDatabase) -> std::result::Result<NetworkPolicy, StorageError> {
    match db.state(NETWORK_POLICY_STATE_KEY)? {
        Some(st) => match st.value {
            StateValue::NetworkPolicy(policy) => Ok(policy),
            _ => Err(StorageError::InvalidData("network policy state has another value".to_string())),
        },
        None => Ok(NetworkPolicy::default()),
    }
}

/// Builds and signs the local node's proposal for a point from the pool.
pub struct ProposalMaker {
    local: LocalNode,
    network_id: NetworkId,
    db: Arc<dyn PermanentDatabase>,
    pool: Arc<dyn Pool>,
    lock: Mutex<()>,
}

impl ProposalMaker {
    pub fn new(local: LocalNode, network_id: NetworkId, db: Arc<dyn PermanentDatabase>, pool: Arc<dyn Pool>) -> Self {
        ProposalMaker {
            local,
            network_id,
            db,
            pool,
            lock: Mutex::new(()),
        }
    }

    /// One proposal per point: a second call returns the first.
    pub fn make(&self, point: Point, previous_block: Hash) -> Result<ProposalSignFact> {
        let _guard = self.lock.lock();

        if let Some(pr) = self.pool.proposal_by_point(point, self.local.address())? {
            return Ok(pr);
        }

        let limit = network_policy(self.db.as_ref())?.max_operations_in_proposal as usize;
        let mut operations = Vec::with_capacity(limit);
        for op in self.pool.operations_for_proposal(limit, Utc::now())? {
            let fact = op.fact_hash();
            if self.db.exists_in_state_operation(&fact)? || self.db.exists_known_operation(&op.hash)? {
                continue;
            }
            operations.push(ProposalOperation {
                operation: op.hash,
                fact,
            });
        }

        let fact = ProposalFact::new(point, self.local.address().clone(), previous_block, operations);
        let pr = ProposalSignFact::new(&self.local, &self.network_id, fact);
        self.pool.set_proposal(pr.clone())?;

        info!(
            height = %point.height,
            round = %point.round,
            proposal = %pr.hash(),
            operations = pr.fact.operations.len(),
            "proposal made"
        );
        Ok(pr)
    }
}

/// Resolves the proposal of a point: made locally when the local node is
/// the proposer, otherwise taken from the pool or requested from the
/// proposer with bounded retries.
pub struct ProposalSelector {
    args: NodeArgs,
    maker: Arc<ProposalMaker>,
}

impl ProposalSelector {
    pub fn new(args: NodeArgs, maker: Arc<ProposalMaker>) -> Self {
        ProposalSelector { args, maker }
    }

    pub fn maker(&self) -> &ProposalMaker {
        &self.maker
    }

    fn conn(&self, address: &NodeAddress) -> Option<&ConnInfo> {
        self.args.peers.iter().find(|p| &p.address == address)
    }

    /// Expected proposer of `point` building on `previous_block`.
    pub fn proposer(&self, point: Point, previous_block: &Hash) -> Result<NodeAddress> {
        let suffrage = self
            .args
            .db
            .suffrage(point.height)?
            .ok_or_else(|| StorageError::NotFound(format!("suffrage for {}", point.height)))?;
        ProposerSelector::select(point, previous_block, &suffrage)
            .map(|n| n.address.clone())
            .ok_or_else(|| IsaacError::Other(format!("no proposer for {point}")))
    }

    pub async fn select(&self, point: Point, previous_block: Hash) -> Result<ProposalSignFact> {
        let proposer = self.proposer(point, &previous_block)?;
        if &proposer == self.args.local.address() {
            return self.maker.make(point, previous_block);
        }
        if let Some(pr) = self.args.pool.proposal_by_point(point, &proposer)? {
            return Ok(pr);
        }

        let conn = self
            .conn(&proposer)
            .ok_or_else(|| ProcessorError::Retry(format!("no connection to proposer {proposer}")))?;

        for attempt in 0..self.args.params.proposal_retry_limit {
            let req = self.args.client.request_proposal(conn, point, &proposer);
            match tokio::time::timeout(self.args.params.timeout_request, req).await {
                Ok(Ok(Some(pr))) => {
                    self.check(&pr, point, &proposer, &previous_block)?;
                    self.args.pool.set_proposal(pr.clone())?;
                    debug!(point = %point, proposer = %proposer, "proposal received");
                    return Ok(pr);
                }
                Ok(Ok(None)) => debug!(point = %point, attempt, "proposer has no proposal yet"),
                Ok(Err(e)) => debug!(point = %point, attempt, error = %e, "proposal request failed"),
                Err(_) => debug!(point = %point, attempt, "proposal request timed out"),
            }
            tokio::time::sleep(self.args.params.proposal_retry_interval).await;
        }

        warn!(point = %point, proposer = %proposer, "failed to get proposal");
        Err(ProcessorError::Retry(format!("proposal of {point} from {proposer} not found")).into())
    }

    fn check(&self, pr: &ProposalSignFact, point: Point, proposer: &NodeAddress, previous_block: &Hash) -> Result<()> {
        pr.is_valid(&self.args.network_id)?;
        if pr.point() != point || pr.proposer() != proposer || &pr.fact.previous_block != previous_block {
            return Err(ProcessorError::InvalidProposal(format!(
                "proposal {} is not for {point} by {proposer}",
                pr.hash()
            ))
            .into());
        }
        Ok(())
    }

    /// A proposal by fact hash from the pool or from peers, proposer first.
    pub async fn fetch(&self, hash: &Hash, proposer: Option<&NodeAddress>) -> Result<ProposalSignFact> {
        if let Some(pr) = self.args.pool.proposal(hash)? {
            return Ok(pr);
        }

        let mut conns: Vec<&ConnInfo> = self.args.peers.iter().collect();
        if let Some(p) = proposer {
            conns.sort_by_key(|c| &c.address != p);
        }

        for attempt in 0..self.args.params.proposal_retry_limit {
            for conn in &conns {
                match tokio::time::timeout(self.args.params.timeout_request, self.args.client.proposal(conn, hash)).await {
                    Ok(Ok(Some(pr))) if &pr.hash() == hash => {
                        pr.is_valid(&self.args.network_id)?;
                        self.args.pool.set_proposal(pr.clone())?;
                        return Ok(pr);
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => debug!(peer = %conn, attempt, error = %e, "proposal fetch failed"),
                    Err(_) => debug!(peer = %conn, attempt, "proposal fetch timed out"),
                }
            }
            if conns.is_empty() {
                break;
            }
            tokio::time::sleep(self.args.params.proposal_retry_interval).await;
        }
        Err(ProcessorError::Retry(format!("proposal {hash} not found")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Height, PrivateKey, Round};
    use crate::block::GenesisGenerator;
    use crate::state::{KeyValueFact, Operation, OperationFact};
    use crate::storage::{MemPool, SqliteDatabase};
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    fn node(name: &str) -> Node {
        Node::new(NodeAddress::new(name).unwrap(), PrivateKey::generate().public_key())
    }

    #[test]
    fn proposer_is_deterministic_and_rotates() {
        let suffrage = Suffrage::new(["a", "b", "c", "d"].map(node).to_vec()).unwrap();
        let prev = Hash::digest(b"block");

        let p = Point::new(Height::new(3), Round::ZERO);
        let first = ProposerSelector::select(p, &prev, &suffrage).unwrap().address.clone();
        assert_eq!(ProposerSelector::select(p, &prev, &suffrage).unwrap().address, first);

        let chosen: HashSet<_> = (0..32)
            .map(|r| {
                ProposerSelector::select(Point::new(Height::new(3), Round::new(r)), &prev, &suffrage)
                    .unwrap()
                    .address
                    .clone()
            })
            .collect();
        assert!(chosen.len() > 1);
    }

    #[test]
    fn maker_reuses_proposal_and_skips_committed() {
        let dir = TempDir::new().unwrap();
        let db: Arc<dyn PermanentDatabase> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let local = LocalNode::new(NodeAddress::new("a").unwrap(), PrivateKey::generate());
        let nid = NetworkId::new("n").unwrap();
        let genesis = GenesisGenerator::new(
            local.clone(),
            nid.clone(),
            vec![local.node().clone()],
            dir.path().to_path_buf(),
            db.clone(),
        )
        .generate()
        .unwrap();

        let pool = Arc::new(MemPool::new(Duration::from_secs(60), Duration::from_secs(60)));
        for i in 0..3 {
            let op = Operation::new(
                OperationFact::KeyValue(KeyValueFact::new(format!("k{i}"), "v")),
                &local,
                &nid,
            );
            pool.set_operation(op).unwrap();
        }

        let maker = ProposalMaker::new(local.clone(), nid.clone(), db, pool.clone());
        let point = Point::new(Height::new(1), Round::ZERO);
        let pr = maker.make(point, genesis.manifest.hash).unwrap();
        assert!(pr.is_valid(&nid).is_ok());
        assert_eq!(pr.fact.operations.len(), 3);
        assert_eq!(pr.fact.previous_block, genesis.manifest.hash);

        let again = maker.make(point, genesis.manifest.hash).unwrap();
        assert_eq!(again.hash(), pr.hash());
    }
}
