//! Ballots: a node's signed vote at one stagepoint, carrying the voteproof
//! it follows and any expels it supports.

use super::fact::{AcceptBallotFact, BallotFact, BallotSignFact, InitBallotFact};
use super::voteproof::Voteproof;
use super::BallotError;
use crate::base::{Hash, Height, LocalNode, NetworkId, NodeAddress, Point, Round, Stage, StagePoint};
use crate::state::SuffrageExpelOperation;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub signfact: BallotSignFact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voteproof: Option<Voteproof>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expels: Vec<SuffrageExpelOperation>,
}

impl Ballot {
    pub fn new(
        local: &LocalNode,
        network_id: &NetworkId,
        fact: BallotFact,
        voteproof: Option<Voteproof>,
        mut expels: Vec<SuffrageExpelOperation>,
    ) -> Self {
        expels.sort_by_key(|e| e.fact.hash);
        Ballot {
            signfact: BallotSignFact::new(local, network_id, fact),
            voteproof,
            expels,
        }
    }

    pub fn init(
        local: &LocalNode,
        network_id: &NetworkId,
        point: Point,
        previous_block: Hash,
        proposal: Hash,
        voteproof: Option<Voteproof>,
        expels: Vec<SuffrageExpelOperation>,
    ) -> Self {
        let fact = InitBallotFact::new(
            point,
            previous_block,
            proposal,
            expels.iter().map(|e| e.fact.hash).collect(),
        );
        Self::new(local, network_id, BallotFact::Init(fact), voteproof, expels)
    }

    pub fn accept(
        local: &LocalNode,
        network_id: &NetworkId,
        point: Point,
        proposal: Hash,
        new_block: Hash,
        voteproof: Voteproof,
        expels: Vec<SuffrageExpelOperation>,
    ) -> Self {
        let fact = AcceptBallotFact::new(
            point,
            proposal,
            new_block,
            expels.iter().map(|e| e.fact.hash).collect(),
        );
        Self::new(local, network_id, BallotFact::Accept(fact), Some(voteproof), expels)
    }

    pub fn fact(&self) -> &BallotFact {
        &self.signfact.fact
    }

    pub fn point(&self) -> Point {
        self.signfact.fact.point()
    }

    pub fn stagepoint(&self) -> StagePoint {
        self.signfact.fact.stagepoint()
    }

    pub fn node(&self) -> Option<&NodeAddress> {
        self.signfact.node()
    }

    /// Structure, signatures and agreement with the carried voteproof.
    ///
    /// `window` bounds how far before the voteproof finished the sign may
    /// be; a sign exactly `window` earlier is still accepted.
    pub fn is_valid(&self, network_id: &NetworkId, window: Duration) -> Result<(), BallotError> {
        self.signfact.is_valid(network_id)?;

        let mut expel_hashes = Vec::with_capacity(self.expels.len());
        for expel in &self.expels {
            expel.is_valid(network_id)?;
            expel_hashes.push(expel.fact.hash);
        }
        expel_hashes.sort();
        if expel_hashes != self.fact().expels() {
            return Err(BallotError::Invalid("expels do not match fact".to_string()));
        }

        let point = self.point();
        let Some(vp) = &self.voteproof else {
            if self.stagepoint().stage == Stage::Init && point == Point::genesis() {
                return Ok(());
            }
            return Err(BallotError::WrongVoteproof(format!("ballot at {point} without voteproof")));
        };
        vp.is_valid(network_id)?;

        match self.fact() {
            BallotFact::Init(fact) => check_init_voteproof(fact, vp)?,
            BallotFact::Accept(fact) => check_accept_voteproof(fact, vp)?,
        }

        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        if self.signfact.sign.signed_at < vp.finished_at() - window {
            return Err(BallotError::Stale {
                stagepoint: vp.point(),
                signed_at: self.signfact.sign.signed_at.to_rfc3339(),
            });
        }
        Ok(())
    }
}

fn check_init_voteproof(fact: &InitBallotFact, vp: &Voteproof) -> Result<(), BallotError> {
    let wrong = |reason: String| Err(BallotError::WrongVoteproof(reason));
    let point = fact.point;

    if point.round == Round::ZERO {
        if point.height == Height::GENESIS {
            return wrong("genesis INIT must not carry a voteproof".to_string());
        }
        let Some(accept) = vp.accept_majority() else {
            return wrong(format!("INIT {point} needs an ACCEPT majority of the previous height"));
        };
        if vp.height() != point.height.prev() {
            return wrong(format!("voteproof {} is not for the previous height of {point}", vp.point()));
        }
        if accept.new_block != fact.previous_block {
            return wrong("previous block differs from accepted block".to_string());
        }
        return Ok(());
    }

    if vp.height() != point.height || vp.point().round().next() != point.round {
        return wrong(format!("voteproof {} does not precede {point}", vp.point()));
    }
    if vp.stage() == Stage::Accept && vp.is_majority() {
        return wrong("ACCEPT majority moves to the next height".to_string());
    }
    Ok(())
}

fn check_accept_voteproof(fact: &AcceptBallotFact, vp: &Voteproof) -> Result<(), BallotError> {
    let Some(init) = vp.init_majority() else {
        return Err(BallotError::WrongVoteproof("ACCEPT needs an INIT majority".to_string()));
    };
    if vp.point().point != fact.point {
        return Err(BallotError::WrongVoteproof(format!(
            "voteproof {} is not at {}",
            vp.point(),
            fact.point
        )));
    }
    if init.proposal != fact.proposal {
        return Err(BallotError::WrongVoteproof("proposal differs from INIT majority".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{PrivateKey, Threshold, VoteResult};

    fn local(name: &str) -> LocalNode {
        LocalNode::new(NodeAddress::new(name).unwrap(), PrivateKey::generate())
    }

    fn network() -> NetworkId {
        NetworkId::new("n").unwrap()
    }

    fn point(h: i64, r: u64) -> Point {
        Point::new(Height::new(h), Round::new(r))
    }

    fn accept_majority(local: &LocalNode, at: Point, new_block: Hash) -> Voteproof {
        let fact = BallotFact::Accept(AcceptBallotFact::new(at, Hash::digest(b"p"), new_block, vec![]));
        Voteproof::finish(
            StagePoint::new(at, Stage::Accept),
            VoteResult::Majority,
            Threshold::MAX,
            vec![BallotSignFact::new(local, &network(), fact.clone())],
            Some(fact),
            vec![],
        )
    }

    fn init_majority(local: &LocalNode, at: Point, proposal: Hash) -> Voteproof {
        let fact = BallotFact::Init(InitBallotFact::new(at, Hash::digest(b"prev"), proposal, vec![]));
        Voteproof::finish(
            StagePoint::new(at, Stage::Init),
            VoteResult::Majority,
            Threshold::MAX,
            vec![BallotSignFact::new(local, &network(), fact.clone())],
            Some(fact),
            vec![],
        )
    }

    const WINDOW: Duration = Duration::from_secs(30);

    #[test]
    fn init_follows_previous_accept() {
        let a = local("a");
        let block = Hash::digest(b"block-1");
        let vp = accept_majority(&a, point(1, 0), block);

        let ok = Ballot::init(&a, &network(), point(2, 0), block, Hash::digest(b"p2"), Some(vp.clone()), vec![]);
        assert!(ok.is_valid(&network(), WINDOW).is_ok());

        let wrong_prev = Ballot::init(&a, &network(), point(2, 0), Hash::digest(b"x"), Hash::digest(b"p2"), Some(vp.clone()), vec![]);
        assert!(matches!(
            wrong_prev.is_valid(&network(), WINDOW),
            Err(BallotError::WrongVoteproof(_))
        ));

        let wrong_height = Ballot::init(&a, &network(), point(3, 0), block, Hash::digest(b"p2"), Some(vp), vec![]);
        assert!(wrong_height.is_valid(&network(), WINDOW).is_err());
    }

    #[test]
    fn next_round_init_needs_previous_round() {
        let a = local("a");
        let vp = init_majority(&a, point(4, 1), Hash::digest(b"p"));

        let ok = Ballot::init(&a, &network(), point(4, 2), Hash::digest(b"prev"), Hash::digest(b"q"), Some(vp.clone()), vec![]);
        assert!(ok.is_valid(&network(), WINDOW).is_ok());

        let skipped = Ballot::init(&a, &network(), point(4, 3), Hash::digest(b"prev"), Hash::digest(b"q"), Some(vp), vec![]);
        assert!(skipped.is_valid(&network(), WINDOW).is_err());
    }

    #[test]
    fn accept_must_match_init_proposal() {
        let a = local("a");
        let proposal = Hash::digest(b"p");
        let vp = init_majority(&a, point(4, 0), proposal);

        let ok = Ballot::accept(&a, &network(), point(4, 0), proposal, Hash::digest(b"b"), vp.clone(), vec![]);
        assert!(ok.is_valid(&network(), WINDOW).is_ok());

        let other = Ballot::accept(&a, &network(), point(4, 0), Hash::digest(b"x"), Hash::digest(b"b"), vp, vec![]);
        assert!(other.is_valid(&network(), WINDOW).is_err());
    }

    #[test]
    fn ballot_signed_before_voteproof_window_is_stale() {
        let a = local("a");
        let vp = init_majority(&a, point(4, 0), Hash::digest(b"p"));
        let mut ballot = Ballot::accept(&a, &network(), point(4, 0), Hash::digest(b"p"), Hash::digest(b"b"), vp.clone(), vec![]);

        let early = vp.finished_at() - chrono::Duration::seconds(31);
        ballot.signfact.sign = crate::base::Sign::sign_at(&a, &network(), &ballot.fact().hash(), early);
        assert!(matches!(
            ballot.is_valid(&network(), WINDOW),
            Err(BallotError::Stale { .. })
        ));

        let edge = vp.finished_at() - chrono::Duration::seconds(30);
        ballot.signfact.sign = crate::base::Sign::sign_at(&a, &network(), &ballot.fact().hash(), edge);
        assert!(ballot.is_valid(&network(), WINDOW).is_ok());
    }

    #[test]
    fn genesis_init_may_omit_voteproof() {
        let a = local("a");
        let ballot = Ballot::init(&a, &network(), Point::genesis(), Hash::EMPTY, Hash::digest(b"p"), None, vec![]);
        assert!(ballot.is_valid(&network(), WINDOW).is_ok());

        let later = Ballot::init(&a, &network(), point(1, 0), Hash::digest(b"g"), Hash::digest(b"p"), None, vec![]);
        assert!(later.is_valid(&network(), WINDOW).is_err());
    }
}
