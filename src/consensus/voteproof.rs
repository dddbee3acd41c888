//! Finished tallies of ballots.

use super::fact::{AcceptBallotFact, BallotFact, BallotSignFact, InitBallotFact};
use super::suffrage::Suffrage;
use super::VoteproofError;
use crate::base::{
    find_majority, Hash, Height, MajorityOutcome, NetworkId, NodeAddress, Point, Stage, StagePoint,
    Threshold, VoteResult,
};
use crate::state::SuffrageExpelOperation;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteproofKind {
    Normal,
    /// Draw forced by unresponsive nodes: 100 % over the suffrage reduced
    /// by the carried expels.
    Stuck,
}

/// Immutable once built; constructors stamp `finished_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Voteproof {
    id: String,
    point: StagePoint,
    result: VoteResult,
    threshold: Threshold,
    sign_facts: Vec<BallotSignFact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    majority: Option<BallotFact>,
    finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    expels: Vec<SuffrageExpelOperation>,
    kind: VoteproofKind,
}

impl Voteproof {
    pub fn finish(
        point: StagePoint,
        result: VoteResult,
        threshold: Threshold,
        sign_facts: Vec<BallotSignFact>,
        majority: Option<BallotFact>,
        expels: Vec<SuffrageExpelOperation>,
    ) -> Self {
        Self::build(point, result, threshold, sign_facts, majority, expels, VoteproofKind::Normal)
    }

    pub fn finish_stuck(
        point: StagePoint,
        sign_facts: Vec<BallotSignFact>,
        expels: Vec<SuffrageExpelOperation>,
    ) -> Self {
        Self::build(
            point,
            VoteResult::Draw,
            Threshold::MAX,
            sign_facts,
            None,
            expels,
            VoteproofKind::Stuck,
        )
    }

    fn build(
        point: StagePoint,
        result: VoteResult,
        threshold: Threshold,
        mut sign_facts: Vec<BallotSignFact>,
        majority: Option<BallotFact>,
        mut expels: Vec<SuffrageExpelOperation>,
        kind: VoteproofKind,
    ) -> Self {
        sign_facts.sort_by(|a, b| a.node().cmp(&b.node()));
        expels.sort_by(|a, b| a.node().cmp(b.node()));

        let finished_at = Utc::now();
        let id = Hash::digest_parts([
            point.point.to_bytes().as_slice(),
            point.stage.as_str().as_bytes(),
            finished_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        ])
        .to_hex()[..16]
            .to_string();

        Voteproof {
            id,
            point,
            result,
            threshold,
            sign_facts,
            majority,
            finished_at,
            expels,
            kind,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn point(&self) -> StagePoint {
        self.point
    }

    pub fn height(&self) -> Height {
        self.point.height()
    }

    pub fn stage(&self) -> Stage {
        self.point.stage
    }

    pub fn result(&self) -> VoteResult {
        self.result
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn sign_facts(&self) -> &[BallotSignFact] {
        &self.sign_facts
    }

    pub fn majority(&self) -> Option<&BallotFact> {
        self.majority.as_ref()
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn expels(&self) -> &[SuffrageExpelOperation] {
        &self.expels
    }

    pub fn kind(&self) -> VoteproofKind {
        self.kind
    }

    pub fn is_stuck(&self) -> bool {
        self.kind == VoteproofKind::Stuck
    }

    pub fn is_majority(&self) -> bool {
        self.result == VoteResult::Majority
    }

    pub fn init_majority(&self) -> Option<&InitBallotFact> {
        match &self.majority {
            Some(BallotFact::Init(f)) => Some(f),
            _ => None,
        }
    }

    pub fn accept_majority(&self) -> Option<&AcceptBallotFact> {
        match &self.majority {
            Some(BallotFact::Accept(f)) => Some(f),
            _ => None,
        }
    }

    fn expelled_nodes(&self) -> HashSet<&NodeAddress> {
        self.expels.iter().map(|e| e.node()).collect()
    }

    /// Structure and signatures, without knowing the suffrage.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), VoteproofError> {
        let invalid = |reason: String| Err(VoteproofError::Invalid(reason));

        if !self.point.stage.can_vote() {
            return invalid(format!("stage {} cannot be voted", self.point.stage));
        }
        self.point.height().is_valid()?;
        if self.sign_facts.is_empty() {
            return invalid("no sign facts".to_string());
        }

        let mut nodes = HashSet::new();
        for sf in &self.sign_facts {
            sf.is_valid(network_id)?;
            if sf.fact.stagepoint() != self.point {
                return invalid(format!(
                    "sign fact at {} in voteproof at {}",
                    sf.fact.stagepoint(),
                    self.point
                ));
            }
            if let Some(node) = sf.node() {
                if !nodes.insert(node) {
                    return invalid(format!("duplicated sign fact from {node}"));
                }
            }
        }

        match (self.result, &self.majority) {
            (VoteResult::NotYet, _) => return invalid("unfinished result".to_string()),
            (VoteResult::Draw, Some(_)) => return invalid("draw with majority".to_string()),
            (VoteResult::Majority, None) => return invalid("majority without fact".to_string()),
            (VoteResult::Majority, Some(m)) => {
                m.is_valid()?;
                if m.stagepoint() != self.point {
                    return invalid("majority fact at another point".to_string());
                }
                if !self.sign_facts.iter().any(|sf| sf.fact.hash() == m.hash()) {
                    return invalid("majority fact not signed".to_string());
                }
            }
            (VoteResult::Draw, None) => {}
        }

        let mut expelled = HashSet::new();
        for expel in &self.expels {
            expel.is_valid(network_id)?;
            if !expelled.insert(expel.node()) {
                return invalid(format!("duplicated expel of {}", expel.node()));
            }
            if nodes.contains(expel.node()) {
                return invalid(format!("expelled node {} signed", expel.node()));
            }
            if expel.fact.start > self.height() || expel.fact.end < self.height() {
                return invalid(format!("expel of {} not active at {}", expel.node(), self.height()));
            }
        }

        if self.is_stuck() {
            if self.result != VoteResult::Draw || self.threshold != Threshold::MAX {
                return invalid("stuck voteproof must be a 100% draw".to_string());
            }
            if self.expels.is_empty() {
                return invalid("stuck voteproof without expels".to_string());
            }
        }
        Ok(())
    }

    /// Re-derives the result from the sign facts against `suffrage`.
    ///
    /// A voteproof counted with a stricter threshold than `threshold` is
    /// accepted.
    pub fn is_valid_with_suffrage(
        &self,
        network_id: &NetworkId,
        suffrage: &Suffrage,
        threshold: Threshold,
    ) -> Result<(), VoteproofError> {
        self.is_valid(network_id)?;

        for sf in &self.sign_facts {
            let node = sf
                .node()
                .ok_or_else(|| VoteproofError::Invalid("sign fact without node".to_string()))?;
            match suffrage.node(node) {
                None => return Err(VoteproofError::UnknownNode(node.clone())),
                Some(n) if n.publickey != sf.sign.signer => {
                    return Err(VoteproofError::PublicKeyMismatch(node.clone()))
                }
                Some(_) => {}
            }
        }

        let expelled = self.expelled_nodes();
        let total = suffrage.len().saturating_sub(expelled.len());
        let expel_required = threshold.required(total);
        for expel in &self.expels {
            if !suffrage.exists(expel.node()) {
                return Err(VoteproofError::UnknownNode(expel.node().clone()));
            }
            let signs = expel.member_signs(suffrage.nodes());
            if signs < expel_required {
                return Err(VoteproofError::Invalid(format!(
                    "expel of {} has {signs} signs, {expel_required} required",
                    expel.node()
                )));
            }
        }

        if self.is_stuck() {
            if self.sign_facts.len() + self.expels.len() != suffrage.len() {
                return Err(VoteproofError::Invalid(format!(
                    "stuck voteproof: {} sign facts + {} expels != suffrage {}",
                    self.sign_facts.len(),
                    self.expels.len(),
                    suffrage.len()
                )));
            }
            return Ok(());
        }

        if self.threshold < threshold {
            return Err(VoteproofError::Invalid(format!(
                "threshold {} lower than {}",
                self.threshold, threshold
            )));
        }

        let (facts, counts) = count_sign_facts(&self.sign_facts);
        let outcome = find_majority(total, self.threshold.required(total), &counts);
        if outcome.result() != self.result {
            return Err(VoteproofError::ResultMismatch {
                expected: outcome.result(),
                found: self.result,
            });
        }
        if let MajorityOutcome::Majority(i) = outcome {
            if self.majority.as_ref().map(BallotFact::hash) != Some(facts[i]) {
                return Err(VoteproofError::Invalid("majority fact mismatch".to_string()));
            }
        }
        Ok(())
    }
}

/// Per-fact counts in order of first appearance.
pub(crate) fn count_sign_facts(sign_facts: &[BallotSignFact]) -> (Vec<Hash>, Vec<usize>) {
    let mut index: BTreeMap<Hash, usize> = BTreeMap::new();
    let mut facts = Vec::new();
    let mut counts = Vec::new();
    for sf in sign_facts {
        let h = sf.fact.hash();
        match index.get(&h) {
            Some(i) => counts[*i] += 1,
            None => {
                index.insert(h, facts.len());
                facts.push(h);
                counts.push(1);
            }
        }
    }
    (facts, counts)
}

/// Remembers the last INIT, ACCEPT and majority voteproofs the state
/// machine accepted.
#[derive(Clone, Debug, Default)]
pub struct LastVoteproofs {
    init: Option<Voteproof>,
    accept: Option<Voteproof>,
    majority: Option<Voteproof>,
}

impl LastVoteproofs {
    pub fn init(&self) -> Option<&Voteproof> {
        self.init.as_ref()
    }

    pub fn accept(&self) -> Option<&Voteproof> {
        self.accept.as_ref()
    }

    pub fn majority(&self) -> Option<&Voteproof> {
        self.majority.as_ref()
    }

    /// The latest of the last INIT and ACCEPT.
    pub fn cap(&self) -> Option<&Voteproof> {
        match (&self.init, &self.accept) {
            (Some(i), Some(a)) => Some(if i.point() > a.point() { i } else { a }),
            (Some(i), None) => Some(i),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    pub fn is_new(&self, vp: &Voteproof) -> bool {
        self.cap().map_or(true, |last| vp.point() > last.point())
    }

    /// Keeps `vp` when it is newer than anything seen.
    pub fn set(&mut self, vp: &Voteproof) -> bool {
        if !self.is_new(vp) {
            return false;
        }
        if vp.is_majority() {
            self.majority = Some(vp.clone());
        }
        match vp.stage() {
            Stage::Init => self.init = Some(vp.clone()),
            _ => self.accept = Some(vp.clone()),
        }
        true
    }

    /// Previous block the next round after `vp` should build on.
    ///
    /// A majority INIT earlier at the same height keeps its previous block;
    /// a majority ACCEPT of the height below gives its new block.
    pub fn previous_block_for_next_round(&self, vp: &Voteproof) -> Option<Hash> {
        let m = self.majority.as_ref()?;
        let height = vp.height();

        match m.stage() {
            Stage::Init if m.height() == height && m.point() <= vp.point() => {
                m.init_majority().map(|f| f.previous_block)
            }
            Stage::Accept if m.height() == height.prev() => m.accept_majority().map(|f| f.new_block),
            _ => None,
        }
    }
}

/// First point after a finished `vp`.
pub fn next_point(vp: &Voteproof) -> Point {
    match (vp.stage(), vp.result()) {
        (Stage::Accept, VoteResult::Majority) => vp.point().point.next_height(),
        _ => vp.point().point.next_round(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{LocalNode, Node, PrivateKey, Round};
    use crate::consensus::fact::InitBallotFact;
    use crate::state::SuffrageExpelFact;

    fn locals(names: &[&str]) -> Vec<LocalNode> {
        names
            .iter()
            .map(|n| LocalNode::new(NodeAddress::new(*n).unwrap(), PrivateKey::generate()))
            .collect()
    }

    fn suffrage(locals: &[LocalNode]) -> Suffrage {
        Suffrage::new(locals.iter().map(|l| l.node().clone()).collect::<Vec<Node>>()).unwrap()
    }

    fn network() -> NetworkId {
        NetworkId::new("n").unwrap()
    }

    fn init_fact(h: i64, r: u64, proposal: &[u8]) -> BallotFact {
        BallotFact::Init(InitBallotFact::new(
            Point::new(Height::new(h), Round::new(r)),
            Hash::digest(b"prev"),
            Hash::digest(proposal),
            vec![],
        ))
    }

    fn sp(h: i64, r: u64) -> StagePoint {
        StagePoint::new(Point::new(Height::new(h), Round::new(r)), Stage::Init)
    }

    #[test]
    fn majority_revalidates_with_suffrage() {
        let nodes = locals(&["a", "b", "c"]);
        let network_id = network();
        let fact = init_fact(1, 0, b"p");
        let sfs: Vec<_> = nodes
            .iter()
            .map(|l| BallotSignFact::new(l, &network_id, fact.clone()))
            .collect();

        let vp = Voteproof::finish(sp(1, 0), VoteResult::Majority, Threshold::default(), sfs, Some(fact), vec![]);
        assert!(vp.is_valid_with_suffrage(&network_id, &suffrage(&nodes), Threshold::default()).is_ok());

        let outsider = locals(&["a", "b", "x"]);
        assert!(matches!(
            vp.is_valid_with_suffrage(&network_id, &suffrage(&outsider), Threshold::default()),
            Err(VoteproofError::UnknownNode(_))
        ));
    }

    #[test]
    fn forged_result_is_detected() {
        let nodes = locals(&["a", "b", "c"]);
        let network_id = network();
        let sfs: Vec<_> = nodes
            .iter()
            .enumerate()
            .map(|(i, l)| BallotSignFact::new(l, &network_id, init_fact(1, 0, &[i as u8])))
            .collect();
        let majority = sfs[0].fact.clone();

        let forged = Voteproof::finish(
            sp(1, 0),
            VoteResult::Majority,
            Threshold::default(),
            sfs.clone(),
            Some(majority),
            vec![],
        );
        assert!(matches!(
            forged.is_valid_with_suffrage(&network_id, &suffrage(&nodes), Threshold::default()),
            Err(VoteproofError::ResultMismatch { .. })
        ));

        let draw = Voteproof::finish(sp(1, 0), VoteResult::Draw, Threshold::default(), sfs, None, vec![]);
        assert!(draw.is_valid_with_suffrage(&network_id, &suffrage(&nodes), Threshold::default()).is_ok());
    }

    #[test]
    fn early_draw_is_rejected() {
        let nodes = locals(&["a", "b", "c"]);
        let network_id = network();
        let sfs: Vec<_> = nodes[..2]
            .iter()
            .enumerate()
            .map(|(i, l)| BallotSignFact::new(l, &network_id, init_fact(1, 0, &[i as u8])))
            .collect();

        let draw = Voteproof::finish(sp(1, 0), VoteResult::Draw, Threshold::default(), sfs, None, vec![]);
        assert!(matches!(
            draw.is_valid_with_suffrage(&network_id, &suffrage(&nodes), Threshold::default()),
            Err(VoteproofError::ResultMismatch {
                expected: VoteResult::NotYet,
                found: VoteResult::Draw,
            })
        ));
    }

    #[test]
    fn stuck_voteproof_counts_expels() {
        let nodes = locals(&["a", "b", "c", "d"]);
        let network_id = network();
        let fact = init_fact(5, 2, b"p");
        let live: Vec<&LocalNode> = nodes.iter().filter(|l| l.address().as_str() != "c").collect();
        let sfs: Vec<_> = live
            .iter()
            .map(|l| BallotSignFact::new(l, &network_id, fact.clone()))
            .collect();

        let expel_fact = SuffrageExpelFact::new(NodeAddress::new("c").unwrap(), Height::new(5), Height::new(15), "no ballot");
        let mut expel = SuffrageExpelOperation::new(expel_fact.clone(), live[0], &network_id);
        for l in &live[1..] {
            expel.merge_signs(&SuffrageExpelOperation::new(expel_fact.clone(), l, &network_id));
        }

        let vp = Voteproof::finish_stuck(sp(5, 2), sfs.clone(), vec![expel.clone()]);
        assert!(vp.is_valid_with_suffrage(&network_id, &suffrage(&nodes), Threshold::default()).is_ok());

        let short = Voteproof::finish_stuck(sp(5, 2), sfs[..2].to_vec(), vec![expel]);
        assert!(short.is_valid_with_suffrage(&network_id, &suffrage(&nodes), Threshold::default()).is_err());
    }

    #[test]
    fn last_voteproofs_previous_block() {
        let nodes = locals(&["a"]);
        let network_id = network();
        let mut last = LastVoteproofs::default();

        let draw_fact = init_fact(1, 0, b"p");
        let draw = Voteproof::finish(
            sp(1, 0),
            VoteResult::Draw,
            Threshold::MAX,
            vec![BallotSignFact::new(&nodes[0], &network_id, draw_fact)],
            None,
            vec![],
        );
        assert!(last.set(&draw));
        assert_eq!(last.previous_block_for_next_round(&draw), None);
        assert!(!last.set(&draw));

        let fact = init_fact(1, 1, b"p");
        let majority = Voteproof::finish(
            sp(1, 1),
            VoteResult::Majority,
            Threshold::MAX,
            vec![BallotSignFact::new(&nodes[0], &network_id, fact.clone())],
            Some(fact),
            vec![],
        );
        assert!(last.set(&majority));
        assert_eq!(last.previous_block_for_next_round(&majority), Some(Hash::digest(b"prev")));
        assert_eq!(next_point(&majority), Point::new(Height::new(1), Round::new(2)));
    }
}
