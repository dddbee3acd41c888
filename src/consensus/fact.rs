//! Proposal and ballot facts with their sign-facts.

use super::BallotError;
use crate::base::hint::{ACCEPT_BALLOT_FACT_HINT, INIT_BALLOT_FACT_HINT};
use crate::base::{Hash, Height, LocalNode, NetworkId, NodeAddress, Point, Sign, Stage, StagePoint};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const PROPOSAL_FACT_PREFIX: &[u8] = b"proposal-fact";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalOperation {
    pub operation: Hash,
    pub fact: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalFact {
    pub point: Point,
    pub proposer: NodeAddress,
    pub previous_block: Hash,
    pub operations: Vec<ProposalOperation>,
    pub proposed_at: DateTime<Utc>,
    pub hash: Hash,
}

impl ProposalFact {
    pub fn new(
        point: Point,
        proposer: NodeAddress,
        previous_block: Hash,
        operations: Vec<ProposalOperation>,
    ) -> Self {
        let proposed_at = Utc::now();
        let hash = Self::generate_hash(&point, &proposer, &previous_block, &operations, &proposed_at);
        ProposalFact {
            point,
            proposer,
            previous_block,
            operations,
            proposed_at,
            hash,
        }
    }

    fn generate_hash(
        point: &Point,
        proposer: &NodeAddress,
        previous_block: &Hash,
        operations: &[ProposalOperation],
        proposed_at: &DateTime<Utc>,
    ) -> Hash {
        let mut parts: Vec<Vec<u8>> = vec![
            PROPOSAL_FACT_PREFIX.to_vec(),
            point.to_bytes().to_vec(),
            proposer.as_bytes().to_vec(),
            previous_block.as_bytes().to_vec(),
        ];
        for op in operations {
            parts.push(op.operation.as_bytes().to_vec());
            parts.push(op.fact.as_bytes().to_vec());
        }
        parts.push(
            proposed_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .into_bytes(),
        );
        Hash::digest_parts(parts)
    }

    pub fn is_valid(&self) -> Result<(), BallotError> {
        self.point.height.is_valid()?;
        if self.point.height > Height::GENESIS {
            self.previous_block.is_valid()?;
        }

        let mut operations = HashSet::new();
        let mut facts = HashSet::new();
        for op in &self.operations {
            op.operation.is_valid()?;
            op.fact.is_valid()?;
            if !operations.insert(op.operation) || !facts.insert(op.fact) {
                return Err(BallotError::InvalidFact(format!(
                    "duplicated operation {} in proposal",
                    op.fact
                )));
            }
        }

        let expected = Self::generate_hash(
            &self.point,
            &self.proposer,
            &self.previous_block,
            &self.operations,
            &self.proposed_at,
        );
        if expected != self.hash {
            return Err(BallotError::InvalidFact("proposal hash mismatch".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSignFact {
    pub fact: ProposalFact,
    pub sign: Sign,
}

impl ProposalSignFact {
    pub fn new(local: &LocalNode, network_id: &NetworkId, fact: ProposalFact) -> Self {
        let sign = Sign::new(local, network_id, &fact.hash);
        ProposalSignFact { fact, sign }
    }

    pub fn hash(&self) -> Hash {
        self.fact.hash
    }

    pub fn point(&self) -> Point {
        self.fact.point
    }

    pub fn proposer(&self) -> &NodeAddress {
        &self.fact.proposer
    }

    /// Structure plus signature; the signer must be the named proposer.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), BallotError> {
        self.fact.is_valid()?;
        if self.sign.node.as_ref() != Some(&self.fact.proposer) {
            return Err(BallotError::InvalidFact("proposal not signed by its proposer".to_string()));
        }
        self.sign.verify(network_id, &self.fact.hash)?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitBallotFact {
    pub point: Point,
    pub previous_block: Hash,
    pub proposal: Hash,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expels: Vec<Hash>,
    pub hash: Hash,
}

impl InitBallotFact {
    pub fn new(point: Point, previous_block: Hash, proposal: Hash, mut expels: Vec<Hash>) -> Self {
        expels.sort();
        expels.dedup();
        let hash = Self::generate_hash(&point, &previous_block, &proposal, &expels);
        InitBallotFact {
            point,
            previous_block,
            proposal,
            expels,
            hash,
        }
    }

    fn generate_hash(point: &Point, previous_block: &Hash, proposal: &Hash, expels: &[Hash]) -> Hash {
        let mut parts = vec![
            INIT_BALLOT_FACT_HINT.as_bytes().to_vec(),
            point.to_bytes().to_vec(),
            previous_block.as_bytes().to_vec(),
            proposal.as_bytes().to_vec(),
        ];
        parts.extend(expels.iter().map(|h| h.as_bytes().to_vec()));
        Hash::digest_parts(parts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptBallotFact {
    pub point: Point,
    pub proposal: Hash,
    pub new_block: Hash,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expels: Vec<Hash>,
    pub hash: Hash,
}

impl AcceptBallotFact {
    pub fn new(point: Point, proposal: Hash, new_block: Hash, mut expels: Vec<Hash>) -> Self {
        expels.sort();
        expels.dedup();
        let hash = Self::generate_hash(&point, &proposal, &new_block, &expels);
        AcceptBallotFact {
            point,
            proposal,
            new_block,
            expels,
            hash,
        }
    }

    fn generate_hash(point: &Point, proposal: &Hash, new_block: &Hash, expels: &[Hash]) -> Hash {
        let mut parts = vec![
            ACCEPT_BALLOT_FACT_HINT.as_bytes().to_vec(),
            point.to_bytes().to_vec(),
            proposal.as_bytes().to_vec(),
            new_block.as_bytes().to_vec(),
        ];
        parts.extend(expels.iter().map(|h| h.as_bytes().to_vec()));
        Hash::digest_parts(parts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_hint")]
pub enum BallotFact {
    #[serde(rename = "init-ballot-fact-v0.0.1")]
    Init(InitBallotFact),
    #[serde(rename = "accept-ballot-fact-v0.0.1")]
    Accept(AcceptBallotFact),
}

impl BallotFact {
    pub fn hash(&self) -> Hash {
        match self {
            BallotFact::Init(f) => f.hash,
            BallotFact::Accept(f) => f.hash,
        }
    }

    pub fn point(&self) -> Point {
        match self {
            BallotFact::Init(f) => f.point,
            BallotFact::Accept(f) => f.point,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            BallotFact::Init(_) => Stage::Init,
            BallotFact::Accept(_) => Stage::Accept,
        }
    }

    pub fn stagepoint(&self) -> StagePoint {
        StagePoint::new(self.point(), self.stage())
    }

    pub fn proposal(&self) -> Hash {
        match self {
            BallotFact::Init(f) => f.proposal,
            BallotFact::Accept(f) => f.proposal,
        }
    }

    pub fn expels(&self) -> &[Hash] {
        match self {
            BallotFact::Init(f) => &f.expels,
            BallotFact::Accept(f) => &f.expels,
        }
    }

    pub fn is_valid(&self) -> Result<(), BallotError> {
        let point = self.point();
        point.height.is_valid()?;
        self.proposal().is_valid()?;

        let expected = match self {
            BallotFact::Init(f) => {
                if point.height > Height::GENESIS {
                    f.previous_block.is_valid()?;
                }
                InitBallotFact::generate_hash(&f.point, &f.previous_block, &f.proposal, &f.expels)
            }
            BallotFact::Accept(f) => {
                f.new_block.is_valid()?;
                AcceptBallotFact::generate_hash(&f.point, &f.proposal, &f.new_block, &f.expels)
            }
        };
        if expected != self.hash() {
            return Err(BallotError::InvalidFact(format!("{} fact hash mismatch", self.stage())));
        }
        if self.expels().windows(2).any(|w| w[0] >= w[1]) {
            return Err(BallotError::InvalidFact("expels not sorted or duplicated".to_string()));
        }
        Ok(())
    }
}

/// A ballot fact with its node sign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotSignFact {
    pub fact: BallotFact,
    pub sign: Sign,
}

impl BallotSignFact {
    pub fn new(local: &LocalNode, network_id: &NetworkId, fact: BallotFact) -> Self {
        let sign = Sign::new(local, network_id, &fact.hash());
        BallotSignFact { fact, sign }
    }

    pub fn node(&self) -> Option<&NodeAddress> {
        self.sign.node.as_ref()
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), BallotError> {
        self.fact.is_valid()?;
        if self.sign.node.is_none() {
            return Err(BallotError::Invalid("ballot sign without node".to_string()));
        }
        self.sign.verify(network_id, &self.fact.hash())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{PrivateKey, Round};

    fn local() -> LocalNode {
        LocalNode::new(NodeAddress::new("a").unwrap(), PrivateKey::generate())
    }

    fn point(h: i64, r: u64) -> Point {
        Point::new(Height::new(h), Round::new(r))
    }

    #[test]
    fn duplicated_operation_invalidates_proposal() {
        let op = ProposalOperation {
            operation: Hash::digest(b"op"),
            fact: Hash::digest(b"fact"),
        };
        let local = local();
        let fact = ProposalFact::new(
            point(1, 0),
            local.address().clone(),
            Hash::digest(b"prev"),
            vec![op.clone(), op],
        );
        assert!(matches!(fact.is_valid(), Err(BallotError::InvalidFact(_))));
    }

    #[test]
    fn proposal_sign_fact() {
        let local = local();
        let network_id = NetworkId::new("n").unwrap();
        let fact = ProposalFact::new(point(1, 0), local.address().clone(), Hash::digest(b"prev"), vec![]);
        let pr = ProposalSignFact::new(&local, &network_id, fact);
        assert!(pr.is_valid(&network_id).is_ok());

        let other = LocalNode::new(NodeAddress::new("b").unwrap(), PrivateKey::generate());
        let forged = ProposalSignFact::new(&other, &network_id, pr.fact.clone());
        assert!(forged.is_valid(&network_id).is_err());
    }

    #[test]
    fn ballot_fact_tagged_json() {
        let fact = BallotFact::Init(InitBallotFact::new(
            point(1, 0),
            Hash::digest(b"prev"),
            Hash::digest(b"pr"),
            vec![],
        ));
        let json = serde_json::to_value(&fact).unwrap();
        assert_eq!(json["_hint"], INIT_BALLOT_FACT_HINT);
        assert!(json.get("expels").is_none());
        let back: BallotFact = serde_json::from_value(json).unwrap();
        assert_eq!(back, fact);
        assert!(back.is_valid().is_ok());
    }

    #[test]
    fn init_fact_needs_previous_block_after_genesis() {
        let fact = BallotFact::Init(InitBallotFact::new(point(1, 0), Hash::EMPTY, Hash::digest(b"pr"), vec![]));
        assert!(fact.is_valid().is_err());

        let genesis = BallotFact::Init(InitBallotFact::new(point(0, 0), Hash::EMPTY, Hash::digest(b"pr"), vec![]));
        assert!(genesis.is_valid().is_ok());
    }
}
