//! Ballotbox: collects ballots per stagepoint and emits at most one
//! voteproof for each.

use super::ballot::Ballot;
use super::fact::{BallotFact, BallotSignFact};
use super::suffrage::{Suffrage, SuffrageSource};
use super::voteproof::{count_sign_facts, Voteproof};
use super::BallotError;
use crate::base::{find_majority, Hash, MajorityOutcome, NetworkId, NodeAddress, StagePoint, Threshold, VoteResult};
use crate::state::SuffrageExpelOperation;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RECYCLER_CAPACITY: usize = 16;

#[derive(Debug, Default)]
struct VoteRecordInner {
    voted: BTreeMap<NodeAddress, Ballot>,
    validated: BTreeSet<NodeAddress>,
    /// Counted fact hashes, one per validated node.
    set: Vec<Hash>,
    sign_facts: Vec<BallotSignFact>,
    facts: HashMap<Hash, BallotFact>,
    /// Expel operations seen in ballots, signs merged per fact.
    expels: BTreeMap<Hash, SuffrageExpelOperation>,
    finished: bool,
}

impl VoteRecordInner {
    fn reset(&mut self) {
        self.voted.clear();
        self.validated.clear();
        self.set.clear();
        self.sign_facts.clear();
        self.facts.clear();
        self.expels.clear();
        self.finished = false;
    }

    /// Returns false when the node already voted; its expel signs are
    /// still merged.
    fn vote(&mut self, node: NodeAddress, ballot: Ballot) -> bool {
        for expel in &ballot.expels {
            match self.expels.get_mut(&expel.fact.hash) {
                Some(known) => {
                    known.merge_signs(expel);
                }
                None => {
                    self.expels.insert(expel.fact.hash, expel.clone());
                }
            }
        }
        if self.voted.contains_key(&node) {
            return false;
        }
        self.voted.insert(node, ballot);
        true
    }

    fn validate(&mut self, suffrage: &Suffrage) {
        let pending: Vec<NodeAddress> = self
            .voted
            .keys()
            .filter(|n| !self.validated.contains(*n))
            .cloned()
            .collect();

        for node in pending {
            let Some(ballot) = self.voted.get(&node) else {
                continue;
            };
            if !suffrage.exists_publickey(&node, &ballot.signfact.sign.signer) {
                continue;
            }
            let sf = ballot.signfact.clone();
            self.validated.insert(node);
            self.set.push(sf.fact.hash());
            self.facts.insert(sf.fact.hash(), sf.fact.clone());
            self.sign_facts.push(sf);
        }
    }

    /// Expels that hold against `suffrage`: the node is a member that did
    /// not vote and enough other members signed.
    fn valid_expels<'a>(
        &self,
        hashes: impl IntoIterator<Item = &'a Hash>,
        suffrage: &Suffrage,
        threshold: Threshold,
    ) -> Vec<SuffrageExpelOperation> {
        let mut expels: Vec<SuffrageExpelOperation> = hashes
            .into_iter()
            .filter_map(|h| self.expels.get(h))
            .filter(|e| suffrage.exists(e.node()) && !self.validated.contains(e.node()))
            .cloned()
            .collect();

        loop {
            let required = threshold.required(suffrage.len().saturating_sub(expels.len()));
            let before = expels.len();
            expels.retain(|e| e.member_signs(suffrage.nodes()) >= required);
            if expels.len() == before {
                return expels;
            }
        }
    }
}

#[derive(Debug, Default)]
struct VoteRecord {
    inner: Mutex<VoteRecordInner>,
}

/// Counting result of one record.
struct Counted {
    result: VoteResult,
    majority: Option<BallotFact>,
    sign_facts: Vec<BallotSignFact>,
    expels: Vec<SuffrageExpelOperation>,
}

pub struct Ballotbox {
    network_id: NetworkId,
    threshold: Threshold,
    window: Duration,
    suffrage: Arc<dyn SuffrageSource>,
    records: RwLock<BTreeMap<StagePoint, Arc<VoteRecord>>>,
    last_stagepoint: Mutex<Option<StagePoint>>,
    count_lock: tokio::sync::Mutex<()>,
    pending_count: AtomicBool,
    recycler: Mutex<Vec<VoteRecordInner>>,
    voteproofs: mpsc::Sender<Voteproof>,
}

impl Ballotbox {
    pub fn new(
        network_id: NetworkId,
        threshold: Threshold,
        window: Duration,
        suffrage: Arc<dyn SuffrageSource>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<Voteproof>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let bb = Ballotbox {
            network_id,
            threshold,
            window,
            suffrage,
            records: RwLock::new(BTreeMap::new()),
            last_stagepoint: Mutex::new(None),
            count_lock: tokio::sync::Mutex::new(()),
            pending_count: AtomicBool::new(false),
            recycler: Mutex::new(Vec::new()),
            voteproofs: tx,
        };
        (bb, rx)
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    /// Highest stagepoint a voteproof was emitted for.
    pub fn last_stagepoint(&self) -> Option<StagePoint> {
        *self.last_stagepoint.lock()
    }

    fn is_old(&self, sp: StagePoint) -> bool {
        self.last_stagepoint().is_some_and(|last| sp <= last)
    }

    /// Records `ballot`; returns false when it was filtered or a repeat.
    pub async fn vote(&self, ballot: Ballot) -> Result<bool, BallotError> {
        let sp = ballot.stagepoint();
        if !sp.stage.can_vote() || self.is_old(sp) {
            return Ok(false);
        }
        let Some(node) = ballot.node().cloned() else {
            return Err(BallotError::Invalid("ballot without node".to_string()));
        };

        let suffrage = self
            .suffrage
            .suffrage(sp.height())
            .map_err(|e| BallotError::Invalid(format!("suffrage lookup: {e}")))?;
        if let Some(s) = &suffrage {
            if !s.exists_publickey(&node, &ballot.signfact.sign.signer) {
                debug!(%node, stagepoint = %sp, "ballot from outside suffrage ignored");
                return Ok(false);
            }
        }
        ballot.is_valid(&self.network_id, self.window)?;

        let carried = ballot.voteproof.clone();
        let record = self.record(sp);
        let inserted = record.inner.lock().vote(node.clone(), ballot);
        debug!(%node, stagepoint = %sp, inserted, "ballot voted");

        if let Some(vp) = carried {
            self.vote_carried_voteproof(vp).await;
        }
        if suffrage.is_some() {
            self.count().await;
        }
        Ok(inserted)
    }

    /// A voteproof another node already finished can move this box on
    /// without waiting for its own count.
    async fn vote_carried_voteproof(&self, vp: Voteproof) {
        if self.is_old(vp.point()) {
            return;
        }
        match self.suffrage.suffrage(vp.height()) {
            Ok(Some(s)) => {
                if let Err(e) = vp.is_valid_with_suffrage(&self.network_id, &s, self.threshold) {
                    debug!(error = %e, stagepoint = %vp.point(), "carried voteproof rejected");
                    return;
                }
                {
                    let mut last = self.last_stagepoint.lock();
                    if last.is_some_and(|l| vp.point() <= l) {
                        return;
                    }
                    *last = Some(vp.point());
                }
                if let Some(record) = self.records.read().get(&vp.point()) {
                    record.inner.lock().finished = true;
                }
                self.prune();
                self.emit(vp).await;
            }
            Ok(None) => {
                // Unknown suffrage: only a hint that this node is behind.
                if vp.is_valid(&self.network_id).is_ok() {
                    self.emit(vp).await;
                }
            }
            Err(e) => warn!(error = %e, "suffrage lookup failed"),
        }
    }

    fn record(&self, sp: StagePoint) -> Arc<VoteRecord> {
        if let Some(r) = self.records.read().get(&sp) {
            return Arc::clone(r);
        }
        let mut records = self.records.write();
        Arc::clone(records.entry(sp).or_insert_with(|| {
            let inner = self.recycler.lock().pop().unwrap_or_default();
            Arc::new(VoteRecord {
                inner: Mutex::new(inner),
            })
        }))
    }

    /// Counts every votable record, newest first. Concurrent calls collapse
    /// into the one holding the count lock.
    pub async fn count(&self) {
        self.pending_count.store(true, Ordering::SeqCst);
        loop {
            let Ok(guard) = self.count_lock.try_lock() else {
                return;
            };
            while self.pending_count.swap(false, Ordering::SeqCst) {
                self.count_once().await;
            }
            drop(guard);
            if !self.pending_count.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn count_once(&self) {
        let candidates: Vec<(StagePoint, Arc<VoteRecord>)> = self
            .records
            .read()
            .iter()
            .rev()
            .filter(|(sp, _)| !self.is_old(**sp))
            .map(|(sp, r)| (*sp, Arc::clone(r)))
            .collect();

        for (sp, record) in candidates {
            let suffrage = match self.suffrage.suffrage(sp.height()) {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, stagepoint = %sp, "suffrage lookup failed");
                    continue;
                }
            };

            let Some(counted) = self.count_record(&record, &suffrage) else {
                continue;
            };
            let vp = Voteproof::finish(
                sp,
                counted.result,
                self.threshold,
                counted.sign_facts,
                counted.majority,
                counted.expels,
            );
            if self.finish(sp, &record) {
                info!(
                    height = %sp.height(),
                    round = %sp.round(),
                    stage = %sp.stage,
                    result = %vp.result(),
                    "voteproof finished"
                );
                self.emit(vp).await;
            }
            return;
        }
    }

    fn count_record(&self, record: &VoteRecord, suffrage: &Suffrage) -> Option<Counted> {
        let mut inner = record.inner.lock();
        if inner.finished {
            return None;
        }
        inner.validate(suffrage);

        let required = self.threshold.required(suffrage.len());
        if inner.set.is_empty() {
            return None;
        }
        let (facts, counts) = count_sign_facts(&inner.sign_facts);

        for (i, hash) in facts.iter().enumerate() {
            let Some(fact) = inner.facts.get(hash) else {
                continue;
            };
            if fact.expels().is_empty() {
                continue;
            }
            let expels = inner.valid_expels(fact.expels(), suffrage, self.threshold);
            if expels.len() != fact.expels().len() {
                continue;
            }
            let total = suffrage.len() - expels.len();
            if find_majority(total, self.threshold.required(total), &counts) == MajorityOutcome::Majority(i) {
                return Some(Counted {
                    result: VoteResult::Majority,
                    majority: Some(fact.clone()),
                    sign_facts: inner.sign_facts.clone(),
                    expels,
                });
            }
        }

        if inner.set.len() < required {
            return None;
        }
        match find_majority(suffrage.len(), required, &counts) {
            MajorityOutcome::Majority(i) => {
                let fact = inner.facts.get(&facts[i])?;
                if !fact.expels().is_empty() {
                    return None;
                }
                Some(Counted {
                    result: VoteResult::Majority,
                    majority: Some(fact.clone()),
                    sign_facts: inner.sign_facts.clone(),
                    expels: Vec::new(),
                })
            }
            MajorityOutcome::Draw => Some(Counted {
                result: VoteResult::Draw,
                majority: None,
                sign_facts: inner.sign_facts.clone(),
                expels: Vec::new(),
            }),
            MajorityOutcome::NotYet => None,
        }
    }

    /// Marks `sp` finished; false when another voteproof took it first.
    fn finish(&self, sp: StagePoint, record: &VoteRecord) -> bool {
        {
            let mut last = self.last_stagepoint.lock();
            if last.is_some_and(|l| sp <= l) {
                return false;
            }
            *last = Some(sp);
        }
        record.inner.lock().finished = true;
        self.prune();
        true
    }

    async fn emit(&self, vp: Voteproof) {
        if self.voteproofs.send(vp).await.is_err() {
            warn!("voteproof receiver closed");
        }
    }

    /// Drops records below the last finished stagepoint.
    fn prune(&self) {
        let Some(last) = self.last_stagepoint() else {
            return;
        };
        let removed = {
            let mut records = self.records.write();
            let keep = records.split_off(&last);
            std::mem::replace(&mut *records, keep)
        };

        let mut recycler = self.recycler.lock();
        for (_, record) in removed {
            if recycler.len() >= RECYCLER_CAPACITY {
                break;
            }
            if let Ok(record) = Arc::try_unwrap(record) {
                let mut inner = record.inner.into_inner();
                inner.reset();
                recycler.push(inner);
            }
        }
    }

    /// Suffrage members with no ballot at `sp`.
    pub fn missing_nodes(&self, sp: StagePoint) -> Option<Vec<NodeAddress>> {
        let suffrage = self.suffrage.suffrage(sp.height()).ok()??;
        let voted: BTreeSet<NodeAddress> = self
            .records
            .read()
            .get(&sp)
            .map(|r| r.inner.lock().voted.keys().cloned().collect())
            .unwrap_or_default();

        Some(
            suffrage
                .nodes()
                .iter()
                .filter(|n| !voted.contains(&n.address))
                .map(|n| n.address.clone())
                .collect(),
        )
    }

    /// Forces a draw at `sp` when every member either voted or is expelled
    /// with enough signs; the voteproof is emitted and returned.
    pub async fn stuck_voteproof(&self, sp: StagePoint) -> Option<Voteproof> {
        if self.is_old(sp) {
            return None;
        }
        let suffrage = self.suffrage.suffrage(sp.height()).ok()??;
        let record = Arc::clone(self.records.read().get(&sp)?);

        let vp = {
            let mut inner = record.inner.lock();
            if inner.finished {
                return None;
            }
            inner.validate(&suffrage);
            let hashes: Vec<Hash> = inner.expels.keys().copied().collect();
            let expels = inner.valid_expels(&hashes, &suffrage, self.threshold);
            if expels.is_empty() || inner.validated.len() + expels.len() != suffrage.len() {
                return None;
            }
            Voteproof::finish_stuck(sp, inner.sign_facts.clone(), expels)
        };

        if !self.finish(sp, &record) {
            return None;
        }
        info!(
            height = %sp.height(),
            round = %sp.round(),
            stage = %sp.stage,
            expels = vp.expels().len(),
            "stuck voteproof finished"
        );
        self.emit(vp.clone()).await;
        Some(vp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Height, LocalNode, Node, Point, PrivateKey, Round, Stage};
    use crate::storage::StorageError;

    struct FixedSuffrage(Suffrage);

    impl SuffrageSource for FixedSuffrage {
        fn suffrage(&self, _height: Height) -> Result<Option<Suffrage>, StorageError> {
            Ok(Some(self.0.clone()))
        }
    }

    fn locals(names: &[&str]) -> Vec<LocalNode> {
        names
            .iter()
            .map(|n| LocalNode::new(NodeAddress::new(*n).unwrap(), PrivateKey::generate()))
            .collect()
    }

    fn boxed(members: &[LocalNode], threshold: f64) -> (Ballotbox, mpsc::Receiver<Voteproof>) {
        let suffrage = Suffrage::new(members.iter().map(|l| l.node().clone()).collect::<Vec<Node>>()).unwrap();
        Ballotbox::new(
            NetworkId::new("n").unwrap(),
            Threshold::new(threshold).unwrap(),
            Duration::from_secs(30),
            Arc::new(FixedSuffrage(suffrage)),
            8,
        )
    }

    fn genesis_ballot(local: &LocalNode, proposal: &[u8]) -> Ballot {
        Ballot::init(
            local,
            &NetworkId::new("n").unwrap(),
            Point::genesis(),
            Hash::EMPTY,
            Hash::digest(proposal),
            None,
            vec![],
        )
    }

    #[tokio::test]
    async fn majority_emits_once() {
        let nodes = locals(&["a", "b", "c"]);
        let (bb, mut rx) = boxed(&nodes, 67.0);

        assert!(bb.vote(genesis_ballot(&nodes[0], b"p")).await.unwrap());
        assert!(rx.try_recv().is_err());
        assert!(bb.vote(genesis_ballot(&nodes[1], b"p")).await.unwrap());
        assert!(rx.try_recv().is_err());
        assert!(bb.vote(genesis_ballot(&nodes[2], b"p")).await.unwrap());

        let vp = rx.try_recv().unwrap();
        assert_eq!(vp.result(), VoteResult::Majority);
        assert_eq!(vp.point(), StagePoint::new(Point::genesis(), Stage::Init));
        assert!(!bb.vote(genesis_ballot(&nodes[2], b"p")).await.unwrap());
        bb.count().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_vote_is_ignored() {
        let nodes = locals(&["a", "b", "c"]);
        let (bb, mut rx) = boxed(&nodes, 67.0);

        assert!(bb.vote(genesis_ballot(&nodes[0], b"p")).await.unwrap());
        assert!(!bb.vote(genesis_ballot(&nodes[0], b"q")).await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn split_votes_draw() {
        let nodes = locals(&["a", "b", "c", "d"]);
        let (bb, mut rx) = boxed(&nodes, 67.0);

        bb.vote(genesis_ballot(&nodes[0], b"x")).await.unwrap();
        bb.vote(genesis_ballot(&nodes[1], b"y")).await.unwrap();
        assert!(rx.try_recv().is_err());
        bb.vote(genesis_ballot(&nodes[2], b"z")).await.unwrap();

        let vp = rx.try_recv().unwrap();
        assert_eq!(vp.result(), VoteResult::Draw);
        assert!(vp.majority().is_none());
    }

    #[tokio::test]
    async fn split_votes_wait_for_required_count() {
        let nodes = locals(&["a", "b", "c"]);
        let (bb, mut rx) = boxed(&nodes, 67.0);

        bb.vote(genesis_ballot(&nodes[0], b"x")).await.unwrap();
        bb.vote(genesis_ballot(&nodes[1], b"y")).await.unwrap();
        bb.count().await;
        assert!(rx.try_recv().is_err());

        bb.vote(genesis_ballot(&nodes[2], b"x")).await.unwrap();
        let vp = rx.try_recv().unwrap();
        assert_eq!(vp.result(), VoteResult::Draw);
        assert_eq!(vp.sign_facts().len(), 3);
    }

    #[tokio::test]
    async fn missing_nodes_and_old_records() {
        let nodes = locals(&["a", "b"]);
        let (bb, mut rx) = boxed(&nodes, 100.0);
        let sp = StagePoint::new(Point::genesis(), Stage::Init);

        bb.vote(genesis_ballot(&nodes[0], b"p")).await.unwrap();
        assert_eq!(bb.missing_nodes(sp).unwrap(), vec![nodes[1].address().clone()]);

        bb.vote(genesis_ballot(&nodes[1], b"p")).await.unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(bb.last_stagepoint(), Some(sp));

        let late = StagePoint::new(Point::new(Height::GENESIS, Round::ZERO), Stage::Init);
        assert!(bb.is_old(late));
    }
}
