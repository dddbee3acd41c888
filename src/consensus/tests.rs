//! Scenario tests running whole nodes over the in-process network, and
//! fixtures shared with the module tests.

use super::states::{ConsensusContext, StateDriver, StateType, States};
use super::voteproof::next_point;
use super::{
    AcceptBallotFact, Ballot, BallotFact, BallotSignFact, Ballotbox, DatabaseSuffrage, InitBallotFact,
    LastVoteproofs, NodeArgs, ProcessorError, ProposalFact, ProposalOperation, ProposalSignFact, ProposerSelector,
    Voteproof,
};
use crate::base::{
    CancellationToken, Hash, Height, LocalNode, NetworkId, NodeAddress, Point, PrivateKey, Round, Stage,
    StagePoint, Threshold, VoteResult,
};
use crate::block::{BlockImporter, BlockMap, BlockReader, GenesisGenerator, ImportBlock};
use crate::config::LocalParams;
use crate::error::ErrorKind;
use crate::network::{ConnInfo, LocalNetwork, NodeService};
use crate::state::{key_value_state_key, KeyValueFact, Operation, OperationFact, SuffrageExpelFact, SuffrageExpelOperation};
use crate::storage::{MemPool, PermanentDatabase, Pool, SqliteDatabase};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) const TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn init_logging() {
    crate::logger::init_test_logger();
}

pub(crate) fn network_id() -> NetworkId {
    NetworkId::new("n").unwrap()
}

pub(crate) fn local(name: &str) -> LocalNode {
    LocalNode::new(NodeAddress::new(name).unwrap(), PrivateKey::generate())
}

pub(crate) fn conn(local: &LocalNode) -> ConnInfo {
    ConnInfo {
        address: local.address().clone(),
        publickey: local.publickey(),
        url: format!("local://{}", local.address()),
    }
}

/// Short timings so scenarios finish in a few seconds.
pub(crate) fn test_params(threshold: f64) -> LocalParams {
    LocalParams {
        threshold: Threshold::new(threshold).unwrap(),
        interval_broadcast_ballot: Duration::from_millis(300),
        wait_preparing_init_ballot: Duration::from_millis(20),
        timeout_request: Duration::from_millis(500),
        ballot_stuck_wait: Duration::from_secs(5),
        ballot_stuck_resolve_after: Duration::from_secs(10),
        sync_retry_limit: 5,
        sync_retry_interval: Duration::from_millis(50),
        proposal_retry_limit: 2,
        proposal_retry_interval: Duration::from_millis(20),
        process_concurrency: 2,
        ..LocalParams::default()
    }
}

/// Majority voteproof signed by `signer` alone.
pub(crate) fn majority(signer: &LocalNode, fact: BallotFact) -> Voteproof {
    let sp = StagePoint::new(fact.point(), fact.stage());
    Voteproof::finish(
        sp,
        VoteResult::Majority,
        Threshold::MAX,
        vec![BallotSignFact::new(signer, &network_id(), fact.clone())],
        Some(fact),
        vec![],
    )
}

/// INIT and ACCEPT majorities at `height`, for storage fixtures.
pub(crate) fn voteproof_pair(height: Height) -> (Voteproof, Voteproof) {
    let signer = local("vp");
    let point = Point::new(height, Round::ZERO);
    let proposal = Hash::digest(b"proposal");
    let previous = if height > Height::GENESIS {
        Hash::digest(b"previous")
    } else {
        Hash::EMPTY
    };
    let init = BallotFact::Init(InitBallotFact::new(point, previous, proposal, vec![]));
    let accept = BallotFact::Accept(AcceptBallotFact::new(point, proposal, Hash::digest(b"block"), vec![]));
    (majority(&signer, init), majority(&signer, accept))
}

pub(crate) fn key_value(local: &LocalNode, key: &str, value: &str) -> Operation {
    Operation::new(OperationFact::KeyValue(KeyValueFact::new(key, value)), local, &network_id())
}

/// One node wired like the binary does, on the in-process network. The
/// driver runs once `start` is called.
pub(crate) struct TestNode {
    pub local: LocalNode,
    pub args: NodeArgs,
    pub ctx: Arc<ConsensusContext>,
    pub states: States,
    driver: Option<StateDriver>,
    cancel: CancellationToken,
    _dir: TempDir,
}

impl TestNode {
    pub(crate) fn new(
        local: LocalNode,
        params: LocalParams,
        network: &Arc<LocalNetwork>,
        peers: Vec<ConnInfo>,
        sync_sources: Vec<ConnInfo>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let db: Arc<dyn PermanentDatabase> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let pool: Arc<dyn Pool> = Arc::new(MemPool::new(Duration::from_secs(600), Duration::from_secs(600)));
        let args = NodeArgs {
            local: local.clone(),
            network_id: network_id(),
            params,
            db,
            pool,
            block_root: dir.path().to_path_buf(),
            client: Arc::clone(network) as Arc<dyn crate::network::NetworkClient>,
            peers,
        };

        let (ctx, voteproofs) = ConsensusContext::build(args.clone(), sync_sources);
        let (driver, states) = StateDriver::new(Arc::clone(&ctx), voteproofs);
        let service = NodeService::new(
            local.clone(),
            network_id(),
            Arc::clone(&args.db),
            Arc::clone(&args.pool),
            args.block_root.clone(),
            Arc::clone(&ctx.queue),
            Arc::clone(&ctx.maker),
            Arc::clone(&ctx.sync_sources),
            states.clone(),
        );
        network.register(Arc::new(service));

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&ctx.queue).run(Arc::clone(&ctx.ballotbox), cancel.clone()));

        TestNode {
            local,
            args,
            ctx,
            states,
            driver: Some(driver),
            cancel,
            _dir: dir,
        }
    }

    pub(crate) fn genesis(&self, members: &[&LocalNode]) -> BlockMap {
        GenesisGenerator::new(
            self.local.clone(),
            network_id(),
            members.iter().map(|l| l.node().clone()).collect(),
            self.args.block_root.clone(),
            Arc::clone(&self.args.db),
        )
        .generate()
        .unwrap()
    }

    pub(crate) fn start(&mut self) -> JoinHandle<StateType> {
        let driver = self.driver.take().expect("driver already started");
        tokio::spawn(driver.run())
    }

    pub(crate) fn tip(&self) -> Height {
        self.args
            .db
            .last_blockmap()
            .unwrap()
            .map(|bm| bm.height())
            .unwrap_or(Height::NIL)
    }

    pub(crate) fn blockmap(&self, height: Height) -> BlockMap {
        self.args.db.blockmap(height).unwrap().unwrap()
    }

    /// Imports `from`'s blocks up to `upto` the way sync does.
    pub(crate) fn import_from(&self, from: &TestNode, upto: Height) {
        let mut blocks = Vec::new();
        let mut h = self.tip().next();
        while h <= upto {
            let reader = BlockReader::open(&from.args.block_root, h).unwrap();
            let blockmap = reader.blockmap().clone();
            let items: BTreeMap<_, _> = blockmap
                .items
                .iter()
                .map(|item| (item.item_type, reader.raw(item.item_type).unwrap()))
                .collect();
            blocks.push(ImportBlock { blockmap, items });
            h = h.next();
        }
        BlockImporter::new(
            network_id(),
            self.args.params.threshold,
            self.args.block_root.clone(),
            Arc::clone(&self.args.db),
        )
        .import(blocks)
        .unwrap();
    }

    /// Every stored block links to the one below it.
    pub(crate) fn assert_chain(&self) {
        let tip = self.tip();
        let mut h = Height::new(1);
        while h <= tip {
            let previous = self.blockmap(h.prev());
            assert_eq!(self.blockmap(h).manifest.previous, Some(previous.manifest.hash), "broken link at {h}");
            h = h.next();
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Ballotbox over `db`'s suffrage, as the node builds it.
fn ballotbox(db: &Arc<dyn PermanentDatabase>, threshold: f64) -> (Ballotbox, mpsc::Receiver<Voteproof>) {
    Ballotbox::new(
        network_id(),
        Threshold::new(threshold).unwrap(),
        Duration::from_secs(30),
        Arc::new(DatabaseSuffrage(Arc::clone(db))),
        8,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_commits_next_block() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let a = local("a");
    let mut node = TestNode::new(a.clone(), test_params(100.0), &network, vec![], vec![]);
    let genesis = node.genesis(&[&a]);
    node.args.pool.set_operation(key_value(&a, "k", "v")).unwrap();

    let driver = node.start();
    wait_until("block 1", || node.tip() >= Height::new(1)).await;

    let b1 = node.blockmap(Height::new(1));
    assert_eq!(b1.manifest.previous, Some(genesis.manifest.hash));
    assert!(b1.is_valid(&network_id()).is_ok());

    let (init, accept) = node.args.db.voteproofs(Height::new(1)).unwrap().unwrap();
    assert_eq!(init.init_majority().unwrap().previous_block, genesis.manifest.hash);
    assert_eq!(accept.accept_majority().unwrap().new_block, b1.manifest.hash);
    assert_eq!(init.init_majority().unwrap().proposal, accept.accept_majority().unwrap().proposal);

    let state = node.args.db.state(&key_value_state_key("k")).unwrap().unwrap();
    assert_eq!(state.height, Height::new(1));

    node.states.stop().await;
    assert_eq!(driver.await.unwrap(), StateType::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocks_keep_linking() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let a = local("a");
    let mut node = TestNode::new(a.clone(), test_params(100.0), &network, vec![], vec![]);
    node.genesis(&[&a]);

    let driver = node.start();
    wait_until("block 5", || node.tip() >= Height::new(5)).await;
    node.states.stop().await;
    driver.await.unwrap();

    node.assert_chain();
    for h in 1..=5 {
        let (init, accept) = node.args.db.voteproofs(Height::new(h)).unwrap().unwrap();
        assert_eq!(init.height(), Height::new(h));
        assert!(accept.accept_majority().is_some());
    }
}

#[tokio::test]
async fn draw_moves_to_next_round() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let nodes = [local("a"), local("b"), local("c")];
    let node = TestNode::new(nodes[0].clone(), test_params(67.0), &network, vec![], vec![]);
    let genesis = node.genesis(&nodes.iter().collect::<Vec<_>>());
    let (_, genesis_accept) = node.args.db.voteproofs(Height::GENESIS).unwrap().unwrap();
    let (bb, mut rx) = ballotbox(&node.args.db, 67.0);
    let nid = network_id();

    let first = Point::new(Height::new(1), Round::ZERO);
    for (l, proposal) in nodes.iter().zip([b"x", b"y", b"z"]) {
        let ballot = Ballot::init(
            l,
            &nid,
            first,
            genesis.manifest.hash,
            Hash::digest(proposal),
            Some(genesis_accept.clone()),
            vec![],
        );
        bb.vote(ballot).await.unwrap();
    }

    let draw = rx.recv().await.unwrap();
    assert_eq!(draw.result(), VoteResult::Draw);
    assert_eq!(draw.point(), StagePoint::new(first, Stage::Init));
    assert!(rx.try_recv().is_err());

    let mut last = LastVoteproofs::default();
    last.set(&draw);
    assert_eq!(last.previous_block_for_next_round(&draw), None);
    let next = next_point(&draw);
    assert_eq!(next, Point::new(Height::new(1), Round::new(1)));

    let proposal = Hash::digest(b"agreed");
    for l in &nodes {
        let ballot = Ballot::init(l, &nid, next, genesis.manifest.hash, proposal, Some(draw.clone()), vec![]);
        bb.vote(ballot).await.unwrap();
    }

    let agreed = rx.recv().await.unwrap();
    assert_eq!(agreed.result(), VoteResult::Majority);
    let fact = agreed.init_majority().unwrap();
    assert_eq!(fact.point, next);
    assert_eq!(fact.previous_block, genesis.manifest.hash);
    assert_eq!(fact.proposal, proposal);
}

#[tokio::test]
async fn ballots_from_outside_suffrage_are_not_counted() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let (a, b, c) = (local("a"), local("b"), local("c"));
    let node = TestNode::new(a.clone(), test_params(67.0), &network, vec![], vec![]);
    let genesis = node.genesis(&[&a, &b]);
    let (_, genesis_accept) = node.args.db.voteproofs(Height::GENESIS).unwrap().unwrap();
    let (bb, mut rx) = ballotbox(&node.args.db, 67.0);

    let ballot = |l: &LocalNode| {
        Ballot::init(
            l,
            &network_id(),
            Point::new(Height::new(1), Round::ZERO),
            genesis.manifest.hash,
            Hash::digest(b"p"),
            Some(genesis_accept.clone()),
            vec![],
        )
    };

    assert!(!bb.vote(ballot(&c)).await.unwrap());
    assert!(bb.vote(ballot(&a)).await.unwrap());
    bb.count().await;
    assert!(rx.try_recv().is_err());

    // Right address, wrong key.
    let impostor = LocalNode::new(b.address().clone(), PrivateKey::generate());
    assert!(!bb.vote(ballot(&impostor)).await.unwrap());
    assert!(rx.try_recv().is_err());

    assert!(bb.vote(ballot(&b)).await.unwrap());
    let vp = rx.recv().await.unwrap();
    assert_eq!(vp.result(), VoteResult::Majority);
    assert!(vp.sign_facts().iter().all(|sf| sf.node() != Some(c.address())));
}

#[tokio::test]
async fn silent_member_is_expelled() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let nodes = [local("a"), local("b"), local("c"), local("d")];
    let node = TestNode::new(nodes[0].clone(), test_params(67.0), &network, vec![], vec![]);
    let genesis = node.genesis(&nodes.iter().collect::<Vec<_>>());
    let (_, genesis_accept) = node.args.db.voteproofs(Height::GENESIS).unwrap().unwrap();
    let (bb, mut rx) = ballotbox(&node.args.db, 67.0);
    let nid = network_id();

    let h = Height::new(1);
    let expel_fact = SuffrageExpelFact::new(nodes[2].address().clone(), h, Height::new(h.get() + 10), "no ballot");
    let live: Vec<&LocalNode> = nodes.iter().filter(|l| l.address().as_str() != "c").collect();
    let proposal = Hash::digest(b"p");

    for (i, l) in live.iter().enumerate() {
        let ballot = Ballot::init(
            l,
            &nid,
            Point::new(h, Round::ZERO),
            genesis.manifest.hash,
            proposal,
            Some(genesis_accept.clone()),
            vec![SuffrageExpelOperation::new(expel_fact.clone(), l, &nid)],
        );
        bb.vote(ballot).await.unwrap();
        if i < live.len() - 1 {
            assert!(rx.try_recv().is_err());
        }
    }

    let vp = rx.recv().await.unwrap();
    assert_eq!(vp.result(), VoteResult::Majority);
    assert_eq!(vp.expels().len(), 1);
    assert_eq!(vp.expels()[0].node(), nodes[2].address());
    assert_eq!(vp.sign_facts().len(), 3);

    let suffrage = node.args.db.suffrage(h).unwrap().unwrap();
    assert_eq!(suffrage.len(), 4);
    assert!(vp.is_valid_with_suffrage(&nid, &suffrage, Threshold::new(67.0).unwrap()).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accept_voteproof_ahead_starts_sync() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let (a, b) = (local("a"), local("b"));

    let mut source = TestNode::new(a.clone(), test_params(100.0), &network, vec![], vec![]);
    source.genesis(&[&a]);
    let driver = source.start();
    wait_until("source block 15", || source.tip() >= Height::new(15)).await;
    source.states.stop().await;
    driver.await.unwrap();

    let mut node = TestNode::new(b.clone(), test_params(100.0), &network, vec![], vec![conn(&a)]);
    node.import_from(&source, Height::new(10));
    assert_eq!(node.tip(), Height::new(10));

    let mut states = node.states.clone();
    let driver = node.start();
    assert!(states.wait_for(StateType::Joining).await);

    // A ballot for 16 carries the ACCEPT voteproof of 15.
    let (_, accept) = source.args.db.voteproofs(Height::new(15)).unwrap().unwrap();
    let b15 = source.blockmap(Height::new(15));
    let ballot = Ballot::init(
        &a,
        &network_id(),
        Point::new(Height::new(16), Round::ZERO),
        b15.manifest.hash,
        Hash::digest(b"p16"),
        Some(accept),
        vec![],
    );
    node.ctx.queue.push(ballot);

    wait_until("synced to 15", || node.tip() == Height::new(15)).await;
    wait_until("rejoined", || node.states.state() == StateType::Joining).await;
    assert_eq!(node.ctx.syncer.target(), Height::new(15));
    assert_eq!(node.blockmap(Height::new(15)), b15);
    node.assert_chain();

    node.states.stop().await;
    assert_eq!(driver.await.unwrap(), StateType::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handover_returns_to_joining() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let (a, b) = (local("a"), local("b"));
    let mut node = TestNode::new(b.clone(), test_params(100.0), &network, vec![], vec![]);
    let source = TestNode::new(a.clone(), test_params(100.0), &network, vec![], vec![]);
    source.genesis(&[&a]);
    node.import_from(&source, Height::GENESIS);

    let mut states = node.states.clone();
    let driver = node.start();
    assert!(states.wait_for(StateType::Joining).await);

    states.start_handover().await;
    assert!(states.wait_for(StateType::Handover).await);
    assert!(node.ctx.processors.current().is_none());

    states.finish_handover().await;
    assert!(states.wait_for(StateType::Joining).await);

    states.stop().await;
    assert_eq!(driver.await.unwrap(), StateType::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_genesis_breaks_boot() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let mut node = TestNode::new(local("a"), test_params(100.0), &network, vec![], vec![]);
    let mut states = node.states.clone();
    assert_eq!(states.last_error(), None);
    let _driver = node.start();
    assert!(states.wait_for(StateType::Broken).await);
    assert_eq!(states.last_error().as_deref(), Some("empty block storage"));
}

fn init_for(signer: &LocalNode, pr: &ProposalSignFact) -> Voteproof {
    let fact = InitBallotFact::new(pr.point(), pr.fact.previous_block, pr.hash(), vec![]);
    majority(signer, BallotFact::Init(fact))
}

#[tokio::test]
async fn proposal_from_unselected_node_is_rejected() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let (a, b) = (local("a"), local("b"));
    let node = TestNode::new(a.clone(), test_params(100.0), &network, vec![], vec![]);
    let genesis = node.genesis(&[&a, &b]);
    let nid = network_id();

    let point = Point::new(Height::new(1), Round::ZERO);
    let suffrage = node.args.db.suffrage(point.height).unwrap().unwrap();
    let selected = ProposerSelector::select(point, &genesis.manifest.hash, &suffrage)
        .unwrap()
        .address
        .clone();
    let (proposer, other) = if &selected == a.address() { (&a, &b) } else { (&b, &a) };
    let propose = |by: &LocalNode| {
        let fact = ProposalFact::new(point, by.address().clone(), genesis.manifest.hash, vec![]);
        ProposalSignFact::new(by, &nid, fact)
    };

    let wrong = propose(other);
    let err = node
        .ctx
        .processors
        .process(wrong.clone(), genesis.manifest.clone(), init_for(&a, &wrong))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessorError::InvalidProposal(_)), "{err}");
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert!(node.args.db.blockmap(point.height).unwrap().is_none());

    let right = propose(proposer);
    let manifest = node
        .ctx
        .processors
        .process(right.clone(), genesis.manifest.clone(), init_for(&a, &right))
        .await
        .unwrap();
    assert_eq!(manifest.height, point.height);
    assert_eq!(manifest.proposal, Some(right.hash()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn canceled_processing_leaves_no_state() {
    init_logging();
    let network = Arc::new(LocalNetwork::new());
    let (a, b) = (local("a"), local("b"));
    let peer = TestNode::new(b.clone(), test_params(100.0), &network, vec![], vec![]);
    let node = TestNode::new(a.clone(), test_params(100.0), &network, vec![conn(&b)], vec![]);
    let genesis = node.genesis(&[&a]);
    let nid = network_id();

    // The second operation only exists on the slow peer, so processing
    // is still running when it is canceled.
    let here = key_value(&a, "here", "1");
    let there = key_value(&a, "there", "2");
    node.args.pool.set_operation(here.clone()).unwrap();
    peer.args.pool.set_operation(there.clone()).unwrap();
    network.set_delay(b.address(), Some(Duration::from_millis(300)));

    let point = Point::new(Height::new(1), Round::ZERO);
    let operations = [&here, &there]
        .iter()
        .map(|op| ProposalOperation {
            operation: op.hash,
            fact: op.fact_hash(),
        })
        .collect();
    let pr = ProposalSignFact::new(
        &a,
        &nid,
        ProposalFact::new(point, a.address().clone(), genesis.manifest.hash, operations),
    );
    let init = init_for(&a, &pr);

    let processing = {
        let ctx = Arc::clone(&node.ctx);
        let (pr, previous, init) = (pr.clone(), genesis.manifest.clone(), init.clone());
        tokio::spawn(async move { ctx.processors.process(pr, previous, init).await })
    };
    wait_until("processor started", || node.ctx.processors.current().is_some()).await;
    node.ctx.processors.cancel();

    let err = processing.await.unwrap().unwrap_err();
    assert!(matches!(err, ProcessorError::Canceled), "{err}");
    assert!(node.args.db.blockmap(point.height).unwrap().is_none());
    assert!(node.args.db.voteproofs(point.height).unwrap().is_none());
    for key in ["here", "there"] {
        assert!(node.args.db.state(&key_value_state_key(key)).unwrap().is_none(), "{key}");
    }
    assert!(!node.args.db.exists_in_state_operation(&here.fact_hash()).unwrap());

    // The same height processes cleanly afterwards.
    network.set_delay(b.address(), None);
    let manifest = node
        .ctx
        .processors
        .process(pr.clone(), genesis.manifest.clone(), init)
        .await
        .unwrap();
    assert_eq!(manifest.height, point.height);
    assert_eq!(manifest.proposal, Some(pr.hash()));
}
