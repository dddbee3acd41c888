//! Genesis block: the initial suffrage and network policy at height 0.

use super::{BlockError, BlockMap, BlockWriter};
use crate::base::{Hash, Height, LocalNode, NetworkId, Node, Point, Stage, StagePoint, Threshold, VoteResult};
use crate::consensus::{
    AcceptBallotFact, BallotFact, BallotSignFact, InitBallotFact, ProposalFact, ProposalOperation,
    ProposalSignFact, Voteproof,
};
use crate::state::{
    NetworkPolicy, NetworkPolicyFact, Operation, OperationFact, StateMergeDelta, StateMergeValue,
    SuffrageNodeStateValue, NETWORK_POLICY_STATE_KEY, SUFFRAGE_STATE_KEY,
};
use crate::storage::PermanentDatabase;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct GenesisGenerator {
    local: LocalNode,
    network_id: NetworkId,
    nodes: Vec<Node>,
    policy: NetworkPolicy,
    root: PathBuf,
    db: Arc<dyn PermanentDatabase>,
}

impl GenesisGenerator {
    pub fn new(
        local: LocalNode,
        network_id: NetworkId,
        nodes: Vec<Node>,
        root: PathBuf,
        db: Arc<dyn PermanentDatabase>,
    ) -> Self {
        GenesisGenerator {
            local,
            network_id,
            nodes,
            policy: NetworkPolicy::default(),
            root,
            db,
        }
    }

    pub fn with_policy(mut self, policy: NetworkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builds block 0 and saves it. The genesis voteproofs are signed by the
    /// local node alone.
    pub fn generate(&self) -> Result<BlockMap, BlockError> {
        if !self.nodes.iter().any(|n| n == self.local.node()) {
            return Err(BlockError::Invalid(format!(
                "local node {} is not in the genesis suffrage",
                self.local.address()
            )));
        }
        self.policy.is_valid()?;

        let point = Point::genesis();
        let operation = Operation::new(
            OperationFact::NetworkPolicy(NetworkPolicyFact::new(self.policy.clone())),
            &self.local,
            &self.network_id,
        );
        let proposal = ProposalSignFact::new(
            &self.local,
            &self.network_id,
            ProposalFact::new(
                point,
                self.local.address().clone(),
                Hash::EMPTY,
                vec![ProposalOperation {
                    operation: operation.hash,
                    fact: operation.fact_hash(),
                }],
            ),
        );

        let writer = BlockWriter::new(
            self.local.clone(),
            self.network_id.clone(),
            Height::GENESIS,
            self.root.clone(),
            self.db.clone(),
        );
        writer.set_proposal(proposal.clone())?;
        writer.set_operations_size(1)?;

        let mut values = vec![StateMergeValue::new(
            NETWORK_POLICY_STATE_KEY,
            StateMergeDelta::Policy(self.policy.clone()),
        )];
        values.extend(self.nodes.iter().map(|n| {
            StateMergeValue::new(
                SUFFRAGE_STATE_KEY,
                StateMergeDelta::Join(SuffrageNodeStateValue {
                    node: n.clone(),
                    start: Height::GENESIS,
                }),
            )
        }));
        writer.set_states(operation.fact_hash(), values)?;
        writer.set_process_result(0, operation, true, None)?;

        let manifest = writer.manifest(None)?;

        let init = BallotFact::Init(InitBallotFact::new(point, Hash::EMPTY, proposal.hash(), vec![]));
        writer.set_init_voteproof(self.voteproof(Stage::Init, init))?;
        let accept = BallotFact::Accept(AcceptBallotFact::new(point, proposal.hash(), manifest.hash, vec![]));
        writer.set_accept_voteproof(self.voteproof(Stage::Accept, accept))?;

        let blockmap = writer.save()?;
        info!(
            block = %blockmap.manifest.hash,
            nodes = self.nodes.len(),
            "genesis block created"
        );
        Ok(blockmap)
    }

    fn voteproof(&self, stage: Stage, fact: BallotFact) -> Voteproof {
        let sf = BallotSignFact::new(&self.local, &self.network_id, fact.clone());
        Voteproof::finish(
            StagePoint::new(Point::genesis(), stage),
            VoteResult::Majority,
            Threshold::MAX,
            vec![sf],
            Some(fact),
            vec![],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{NodeAddress, PrivateKey};
    use crate::block::{BlockItem, BlockMapItemType, BlockReader};
    use crate::storage::SqliteDatabase;
    use tempfile::TempDir;

    fn local(name: &str) -> LocalNode {
        LocalNode::new(NodeAddress::new(name).unwrap(), PrivateKey::generate())
    }

    #[test]
    fn genesis_is_saved_and_readable() {
        let dir = TempDir::new().unwrap();
        let db: Arc<dyn PermanentDatabase> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let a = local("a");
        let b = local("b");
        let nid = NetworkId::new("n").unwrap();

        let g = GenesisGenerator::new(
            a.clone(),
            nid.clone(),
            vec![a.node().clone(), b.node().clone()],
            dir.path().to_path_buf(),
            db.clone(),
        );
        let bm = g.generate().unwrap();
        assert!(bm.is_valid(&nid).is_ok());
        assert_eq!(db.last_blockmap().unwrap(), Some(bm.clone()));

        let suffrage = db.suffrage(Height::new(1)).unwrap().unwrap();
        assert_eq!(suffrage.len(), 2);

        let proof = db.last_suffrage_proof().unwrap().unwrap();
        assert_eq!(proof.suffrage_height(), Height::GENESIS);
        proof.prove(&nid, None, Threshold::default()).unwrap();

        let reader = BlockReader::open(dir.path(), Height::GENESIS).unwrap();
        assert_eq!(reader.blockmap(), &bm);
        let mut seen = Vec::new();
        reader
            .items(|item| {
                seen.push(std::mem::discriminant(&item));
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen.len(), BlockMapItemType::ALL.len());

        match reader.item(BlockMapItemType::States).unwrap() {
            BlockItem::States(states) => assert_eq!(states.len(), 2),
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn local_node_must_be_in_suffrage() {
        let dir = TempDir::new().unwrap();
        let db: Arc<dyn PermanentDatabase> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let g = GenesisGenerator::new(
            local("a"),
            NetworkId::new("n").unwrap(),
            vec![local("b").node().clone()],
            dir.path().to_path_buf(),
            db,
        );
        assert!(matches!(g.generate(), Err(BlockError::Invalid(_))));
    }
}
