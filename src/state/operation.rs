//! Operations: signed facts that change states when a block commits them.

use super::{
    candidates_value, expels_value, key_value_state_key, network_policy_value, suffrage_nodes_value,
    ExpelRecord, GetState, NetworkPolicy, OperationError, StateMergeDelta, StateMergeValue,
    SuffrageCandidate, SuffrageNodeStateValue, NETWORK_POLICY_STATE_KEY,
    SUFFRAGE_CANDIDATES_STATE_KEY, SUFFRAGE_EXPELS_STATE_KEY, SUFFRAGE_STATE_KEY,
};
use crate::base::hint::{
    KEY_VALUE_FACT_HINT, NETWORK_POLICY_FACT_HINT, SUFFRAGE_CANDIDATE_FACT_HINT,
    SUFFRAGE_EXPEL_FACT_HINT, SUFFRAGE_JOIN_FACT_HINT,
};
use crate::base::{Hash, Height, LocalNode, NetworkId, Node, NodeAddress, PublicKey, Sign, Threshold};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const MAX_KEY_LEN: usize = 256;
const MAX_VALUE_LEN: usize = 4096;

fn default_token() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageCandidateFact {
    pub address: NodeAddress,
    pub publickey: PublicKey,
    pub token: String,
    pub hash: Hash,
}

impl SuffrageCandidateFact {
    pub fn new(address: NodeAddress, publickey: PublicKey) -> Self {
        let token = default_token();
        let hash = Self::generate_hash(&address, &publickey, &token);
        SuffrageCandidateFact {
            address,
            publickey,
            token,
            hash,
        }
    }

    fn generate_hash(address: &NodeAddress, publickey: &PublicKey, token: &str) -> Hash {
        Hash::digest_parts([
            SUFFRAGE_CANDIDATE_FACT_HINT.as_bytes(),
            address.as_bytes(),
            &publickey.to_bytes(),
            token.as_bytes(),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageJoinFact {
    pub candidate: NodeAddress,
    pub start: Height,
    pub token: String,
    pub hash: Hash,
}

impl SuffrageJoinFact {
    pub fn new(candidate: NodeAddress, start: Height) -> Self {
        let token = default_token();
        let hash = Self::generate_hash(&candidate, start, &token);
        SuffrageJoinFact {
            candidate,
            start,
            token,
            hash,
        }
    }

    fn generate_hash(candidate: &NodeAddress, start: Height, token: &str) -> Hash {
        Hash::digest_parts([
            SUFFRAGE_JOIN_FACT_HINT.as_bytes(),
            candidate.as_bytes(),
            &start.to_bytes(),
            token.as_bytes(),
        ])
    }
}

/// Removes `node` from counting between `start` and `end`, inclusive.
///
/// Carries no token: every suffrage node builds the same fact for the same
/// decision, so their signatures aggregate on one fact hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageExpelFact {
    pub node: NodeAddress,
    pub start: Height,
    pub end: Height,
    pub reason: String,
    pub hash: Hash,
}

impl SuffrageExpelFact {
    pub fn new(node: NodeAddress, start: Height, end: Height, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let hash = Self::generate_hash(&node, start, end, &reason);
        SuffrageExpelFact {
            node,
            start,
            end,
            reason,
            hash,
        }
    }

    fn generate_hash(node: &NodeAddress, start: Height, end: Height, reason: &str) -> Hash {
        Hash::digest_parts([
            SUFFRAGE_EXPEL_FACT_HINT.as_bytes(),
            node.as_bytes(),
            &start.to_bytes(),
            &end.to_bytes(),
            reason.as_bytes(),
        ])
    }

    pub fn is_valid(&self) -> Result<(), OperationError> {
        if Self::generate_hash(&self.node, self.start, self.end, &self.reason) != self.hash {
            return Err(OperationError::Invalid("expel fact hash mismatch".to_string()));
        }
        self.start.is_valid()?;
        if self.end < self.start {
            return Err(OperationError::Invalid(format!(
                "expel end {} before start {}",
                self.end, self.start
            )));
        }
        Ok(())
    }

    pub fn record(&self) -> ExpelRecord {
        ExpelRecord {
            node: self.node.clone(),
            start: self.start,
            end: self.end,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyFact {
    pub policy: NetworkPolicy,
    pub token: String,
    pub hash: Hash,
}

impl NetworkPolicyFact {
    pub fn new(policy: NetworkPolicy) -> Self {
        let token = default_token();
        let hash = Self::generate_hash(&policy, &token);
        NetworkPolicyFact { policy, token, hash }
    }

    fn generate_hash(policy: &NetworkPolicy, token: &str) -> Hash {
        Hash::digest_parts([
            NETWORK_POLICY_FACT_HINT.as_bytes(),
            policy.hash_bytes().as_slice(),
            token.as_bytes(),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueFact {
    pub key: String,
    pub value: String,
    pub token: String,
    pub hash: Hash,
}

impl KeyValueFact {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_token(key, value, default_token())
    }

    pub fn with_token(key: impl Into<String>, value: impl Into<String>, token: impl Into<String>) -> Self {
        let (key, value, token) = (key.into(), value.into(), token.into());
        let hash = Self::generate_hash(&key, &value, &token);
        KeyValueFact {
            key,
            value,
            token,
            hash,
        }
    }

    fn generate_hash(key: &str, value: &str, token: &str) -> Hash {
        Hash::digest_parts([
            KEY_VALUE_FACT_HINT.as_bytes(),
            key.as_bytes(),
            &[0u8],
            value.as_bytes(),
            token.as_bytes(),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_hint")]
pub enum OperationFact {
    #[serde(rename = "suffrage-candidate-fact-v0.0.1")]
    SuffrageCandidate(SuffrageCandidateFact),
    #[serde(rename = "suffrage-join-fact-v0.0.1")]
    SuffrageJoin(SuffrageJoinFact),
    #[serde(rename = "suffrage-expel-fact-v0.0.1")]
    SuffrageExpel(SuffrageExpelFact),
    #[serde(rename = "network-policy-fact-v0.0.1")]
    NetworkPolicy(NetworkPolicyFact),
    #[serde(rename = "key-value-fact-v0.0.1")]
    KeyValue(KeyValueFact),
}

impl OperationFact {
    pub fn hash(&self) -> Hash {
        match self {
            OperationFact::SuffrageCandidate(f) => f.hash,
            OperationFact::SuffrageJoin(f) => f.hash,
            OperationFact::SuffrageExpel(f) => f.hash,
            OperationFact::NetworkPolicy(f) => f.hash,
            OperationFact::KeyValue(f) => f.hash,
        }
    }

    fn generate_hash(&self) -> Hash {
        match self {
            OperationFact::SuffrageCandidate(f) => {
                SuffrageCandidateFact::generate_hash(&f.address, &f.publickey, &f.token)
            }
            OperationFact::SuffrageJoin(f) => SuffrageJoinFact::generate_hash(&f.candidate, f.start, &f.token),
            OperationFact::SuffrageExpel(f) => {
                SuffrageExpelFact::generate_hash(&f.node, f.start, f.end, &f.reason)
            }
            OperationFact::NetworkPolicy(f) => NetworkPolicyFact::generate_hash(&f.policy, &f.token),
            OperationFact::KeyValue(f) => KeyValueFact::generate_hash(&f.key, &f.value, &f.token),
        }
    }

    /// Suffrage operations expire sooner in the pool than domain ones.
    pub fn is_suffrage(&self) -> bool {
        !matches!(self, OperationFact::KeyValue(_))
    }

    pub fn is_valid(&self) -> Result<(), OperationError> {
        if self.generate_hash() != self.hash() {
            return Err(OperationError::Invalid("fact hash mismatch".to_string()));
        }
        match self {
            OperationFact::SuffrageExpel(f) => f.is_valid()?,
            OperationFact::SuffrageJoin(f) => f.start.is_valid()?,
            OperationFact::NetworkPolicy(f) => f.policy.is_valid()?,
            OperationFact::KeyValue(f) => {
                if f.key.is_empty() || f.key.len() > MAX_KEY_LEN {
                    return Err(OperationError::Invalid(format!("bad key length, {}", f.key.len())));
                }
                if f.value.len() > MAX_VALUE_LEN {
                    return Err(OperationError::Invalid(format!(
                        "value too long, {}",
                        f.value.len()
                    )));
                }
            }
            OperationFact::SuffrageCandidate(_) => {}
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreProcessResult {
    Accepted,
    /// Well-known reason to leave the operation out of state.
    Skip(String),
}

/// Inputs of `pre_process`. Operations are pre-processed one at a time in
/// fact-hash order, so `admitted_candidates` counts admissions so far in
/// this block.
pub struct PreProcessContext<'a> {
    pub height: Height,
    pub network_id: &'a NetworkId,
    pub threshold: Threshold,
    pub get_state: &'a dyn GetState,
    pub admitted_candidates: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub fact: OperationFact,
    pub signs: Vec<Sign>,
    pub hash: Hash,
}

impl Operation {
    pub fn new(fact: OperationFact, local: &LocalNode, network_id: &NetworkId) -> Self {
        let signs = vec![Sign::new(local, network_id, &fact.hash())];
        Self::with_signs(fact, signs)
    }

    pub fn with_signs(fact: OperationFact, signs: Vec<Sign>) -> Self {
        let hash = Self::generate_hash(&fact, &signs);
        Operation { fact, signs, hash }
    }

    fn generate_hash(fact: &OperationFact, signs: &[Sign]) -> Hash {
        let mut parts = vec![fact.hash().as_bytes().to_vec()];
        parts.extend(signs.iter().map(Sign::hash_bytes));
        Hash::digest_parts(parts)
    }

    pub fn fact_hash(&self) -> Hash {
        self.fact.hash()
    }

    /// Adds (or replaces) the local node's sign.
    pub fn sign(&mut self, local: &LocalNode, network_id: &NetworkId) {
        self.signs.retain(|s| s.signer != local.publickey());
        self.signs.push(Sign::new(local, network_id, &self.fact.hash()));
        self.hash = Self::generate_hash(&self.fact, &self.signs);
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), OperationError> {
        self.fact.is_valid()?;
        if self.signs.is_empty() {
            return Err(OperationError::Invalid("no signs".to_string()));
        }
        let mut signers = HashSet::new();
        for sign in &self.signs {
            if !signers.insert(sign.signer) {
                return Err(OperationError::Invalid(format!("duplicated signer {}", sign.signer)));
            }
            sign.verify(network_id, &self.fact.hash())?;
        }
        if Self::generate_hash(&self.fact, &self.signs) != self.hash {
            return Err(OperationError::Invalid("operation hash mismatch".to_string()));
        }
        Ok(())
    }

    pub fn signed_by(&self, publickey: &PublicKey) -> bool {
        self.signs.iter().any(|s| &s.signer == publickey)
    }

    /// Signs from `nodes`, skipping `exclude`.
    fn member_signs(&self, nodes: &[Node], exclude: Option<&NodeAddress>) -> usize {
        nodes
            .iter()
            .filter(|n| Some(&n.address) != exclude)
            .filter(|n| self.signed_by(&n.publickey))
            .count()
    }

    pub fn pre_process(&self, ctx: &mut PreProcessContext<'_>) -> Result<PreProcessResult, OperationError> {
        let skip = |reason: String| Ok(PreProcessResult::Skip(reason));

        let suffrage = suffrage_nodes_value(ctx.get_state)?;
        let members: Vec<Node> = suffrage.as_ref().map(|s| s.nodes()).unwrap_or_default();
        let policy = network_policy_value(ctx.get_state)?;

        match &self.fact {
            OperationFact::SuffrageCandidate(f) => {
                if !self.signed_by(&f.publickey) {
                    return skip("candidate operation not signed by the candidate".to_string());
                }
                if members.iter().any(|n| n.address == f.address) {
                    return skip(format!("{} already in suffrage", f.address));
                }
                let candidates = candidates_value(ctx.get_state)?;
                if candidates
                    .active_at(ctx.height)
                    .any(|c| c.node.address == f.address)
                {
                    return skip(format!("{} already candidate", f.address));
                }
                if members.len() as u64 >= policy.max_suffrage_size {
                    return skip("suffrage is full".to_string());
                }
                if ctx.admitted_candidates >= policy.candidate_limiter.limit() {
                    return skip("candidate limit reached".to_string());
                }
                ctx.admitted_candidates += 1;
            }
            OperationFact::SuffrageJoin(f) => {
                let candidates = candidates_value(ctx.get_state)?;
                let Some(candidate) = candidates.find(&f.candidate) else {
                    return skip(format!("{} is not a candidate", f.candidate));
                };
                if candidate.start != f.start {
                    return skip("join start does not match candidate".to_string());
                }
                if ctx.height < candidate.start || ctx.height > candidate.deadline {
                    return skip(format!("candidate {} not eligible at {}", f.candidate, ctx.height));
                }
                if members.iter().any(|n| n.address == f.candidate) {
                    return skip(format!("{} already in suffrage", f.candidate));
                }
                if members.len() as u64 >= policy.max_suffrage_size {
                    return skip("suffrage is full".to_string());
                }
                if !self.signed_by(&candidate.node.publickey) {
                    return skip("join not signed by the candidate".to_string());
                }
                let required = ctx.threshold.required(members.len());
                if self.member_signs(&members, None) < required {
                    return skip("not enough suffrage signs".to_string());
                }
            }
            OperationFact::SuffrageExpel(f) => {
                if !members.iter().any(|n| n.address == f.node) {
                    return skip(format!("{} not in suffrage", f.node));
                }
                if f.end < ctx.height {
                    return skip("expel already ended".to_string());
                }
                let expels = expels_value(ctx.get_state)?;
                if expels
                    .expels
                    .iter()
                    .any(|e| e.node == f.node && e.start <= f.start && f.end <= e.end)
                {
                    return skip(format!("{} already expelled", f.node));
                }
                let required = ctx.threshold.required(members.len().saturating_sub(1));
                if self.member_signs(&members, Some(&f.node)) < required {
                    return skip("not enough suffrage signs".to_string());
                }
            }
            OperationFact::NetworkPolicy(_) => {
                let required = ctx.threshold.required(members.len());
                if self.member_signs(&members, None) < required {
                    return skip("not enough suffrage signs".to_string());
                }
            }
            OperationFact::KeyValue(_) => {}
        }

        Ok(PreProcessResult::Accepted)
    }

    pub fn process(&self, height: Height, get_state: &dyn GetState) -> Result<Vec<StateMergeValue>, OperationError> {
        let values = match &self.fact {
            OperationFact::SuffrageCandidate(f) => {
                let policy = network_policy_value(get_state)?;
                let deadline = Height::new(height.get() + policy.suffrage_candidate_lifespan as i64);
                vec![StateMergeValue::new(
                    SUFFRAGE_CANDIDATES_STATE_KEY,
                    StateMergeDelta::AddCandidate(SuffrageCandidate {
                        node: Node::new(f.address.clone(), f.publickey),
                        start: height.next(),
                        deadline,
                    }),
                )]
            }
            OperationFact::SuffrageJoin(f) => {
                let candidates = candidates_value(get_state)?;
                let candidate = candidates
                    .find(&f.candidate)
                    .ok_or_else(|| OperationError::Invalid(format!("{} is not a candidate", f.candidate)))?;
                vec![
                    StateMergeValue::new(
                        SUFFRAGE_STATE_KEY,
                        StateMergeDelta::Join(SuffrageNodeStateValue {
                            node: candidate.node.clone(),
                            start: height.next(),
                        }),
                    ),
                    StateMergeValue::new(
                        SUFFRAGE_CANDIDATES_STATE_KEY,
                        StateMergeDelta::RemoveCandidate(f.candidate.clone()),
                    ),
                ]
            }
            OperationFact::SuffrageExpel(f) => vec![StateMergeValue::new(
                SUFFRAGE_EXPELS_STATE_KEY,
                StateMergeDelta::Expel(f.record()),
            )],
            OperationFact::NetworkPolicy(f) => vec![StateMergeValue::new(
                NETWORK_POLICY_STATE_KEY,
                StateMergeDelta::Policy(f.policy.clone()),
            )],
            OperationFact::KeyValue(f) => vec![StateMergeValue::new(
                key_value_state_key(&f.key),
                StateMergeDelta::KeyValue(f.value.clone()),
            )],
        };
        Ok(values)
    }
}

/// Expel carried by ballots and voteproofs. Signatures from several nodes
/// for the same fact merge into one operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageExpelOperation {
    pub fact: SuffrageExpelFact,
    pub signs: Vec<Sign>,
}

impl SuffrageExpelOperation {
    pub fn new(fact: SuffrageExpelFact, local: &LocalNode, network_id: &NetworkId) -> Self {
        let sign = Sign::new(local, network_id, &fact.hash);
        SuffrageExpelOperation {
            fact,
            signs: vec![sign],
        }
    }

    pub fn node(&self) -> &NodeAddress {
        &self.fact.node
    }

    /// Adds the signs of `other` not seen yet; returns true on change.
    pub fn merge_signs(&mut self, other: &SuffrageExpelOperation) -> bool {
        if other.fact.hash != self.fact.hash {
            return false;
        }
        let mut changed = false;
        for sign in &other.signs {
            if !self.signs.iter().any(|s| s.signer == sign.signer) {
                self.signs.push(sign.clone());
                changed = true;
            }
        }
        if changed {
            self.signs.sort_by(|a, b| a.node.cmp(&b.node));
        }
        changed
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), OperationError> {
        self.fact.is_valid()?;
        if self.signs.is_empty() {
            return Err(OperationError::Invalid("expel without signs".to_string()));
        }
        let mut signers = HashSet::new();
        for sign in &self.signs {
            if !signers.insert(sign.signer) {
                return Err(OperationError::Invalid(format!("duplicated signer {}", sign.signer)));
            }
            sign.verify(network_id, &self.fact.hash)?;
        }
        Ok(())
    }

    /// Signs from suffrage `nodes`, never counting the expelled node.
    pub fn member_signs(&self, nodes: &[Node]) -> usize {
        nodes
            .iter()
            .filter(|n| n.address != self.fact.node)
            .filter(|n| self.signs.iter().any(|s| s.signer == n.publickey))
            .count()
    }

    pub fn into_operation(self) -> Operation {
        Operation::with_signs(OperationFact::SuffrageExpel(self.fact), self.signs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::PrivateKey;
    use crate::state::{State, StateValue, SuffrageCandidatesStateValue, SuffrageNodesStateValue};
    use crate::storage::StorageError;
    use std::collections::HashMap;

    #[derive(Default)]
    struct States(HashMap<String, State>);

    impl GetState for States {
        fn state(&self, key: &str) -> Result<Option<State>, StorageError> {
            Ok(self.0.get(key).cloned())
        }
    }

    fn local(name: &str) -> LocalNode {
        LocalNode::new(NodeAddress::new(name).unwrap(), PrivateKey::generate())
    }

    fn network() -> NetworkId {
        NetworkId::new("n").unwrap()
    }

    fn with_suffrage(members: &[&LocalNode]) -> States {
        let mut states = States::default();
        let value = StateValue::SuffrageNodes(SuffrageNodesStateValue {
            height: Height::GENESIS,
            nodes: members
                .iter()
                .map(|l| SuffrageNodeStateValue {
                    node: l.node().clone(),
                    start: Height::GENESIS,
                })
                .collect(),
        });
        states.0.insert(
            SUFFRAGE_STATE_KEY.to_string(),
            State::new(SUFFRAGE_STATE_KEY, value, Height::GENESIS, None, vec![]),
        );
        states
    }

    fn ctx<'a>(states: &'a States, network_id: &'a NetworkId, height: i64) -> PreProcessContext<'a> {
        PreProcessContext {
            height: Height::new(height),
            network_id,
            threshold: Threshold::default(),
            get_state: states,
            admitted_candidates: 0,
        }
    }

    #[test]
    fn operation_validation() {
        let a = local("a");
        let op = Operation::new(
            OperationFact::KeyValue(KeyValueFact::new("k", "v")),
            &a,
            &network(),
        );
        assert!(op.is_valid(&network()).is_ok());

        let mut tampered = op.clone();
        if let OperationFact::KeyValue(f) = &mut tampered.fact {
            f.value = "w".to_string();
        }
        assert!(tampered.is_valid(&network()).is_err());

        let back: Operation = serde_json::from_str(&serde_json::to_string(&op).unwrap()).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn candidate_limiter_skips_after_limit() {
        let a = local("a");
        let states = with_suffrage(&[&a]);
        let network_id = network();
        let mut c = ctx(&states, &network_id, 1);

        let first = local("x");
        let second = local("y");
        let op1 = Operation::new(
            OperationFact::SuffrageCandidate(SuffrageCandidateFact::new(
                first.address().clone(),
                first.publickey(),
            )),
            &first,
            &network_id,
        );
        let op2 = Operation::new(
            OperationFact::SuffrageCandidate(SuffrageCandidateFact::new(
                second.address().clone(),
                second.publickey(),
            )),
            &second,
            &network_id,
        );

        assert_eq!(op1.pre_process(&mut c).unwrap(), PreProcessResult::Accepted);
        assert!(matches!(op2.pre_process(&mut c).unwrap(), PreProcessResult::Skip(_)));
    }

    #[test]
    fn join_needs_candidate_and_suffrage_signs() {
        let a = local("a");
        let x = local("x");
        let network_id = network();
        let mut states = with_suffrage(&[&a]);
        states.0.insert(
            SUFFRAGE_CANDIDATES_STATE_KEY.to_string(),
            State::new(
                SUFFRAGE_CANDIDATES_STATE_KEY,
                StateValue::SuffrageCandidates(SuffrageCandidatesStateValue {
                    candidates: vec![SuffrageCandidate {
                        node: x.node().clone(),
                        start: Height::new(2),
                        deadline: Height::new(10),
                    }],
                }),
                Height::new(1),
                None,
                vec![],
            ),
        );

        let fact = OperationFact::SuffrageJoin(SuffrageJoinFact::new(x.address().clone(), Height::new(2)));
        let mut op = Operation::new(fact, &x, &network_id);
        assert!(matches!(
            op.pre_process(&mut ctx(&states, &network_id, 3)).unwrap(),
            PreProcessResult::Skip(_)
        ));

        op.sign(&a, &network_id);
        assert!(op.is_valid(&network_id).is_ok());
        assert_eq!(
            op.pre_process(&mut ctx(&states, &network_id, 3)).unwrap(),
            PreProcessResult::Accepted
        );
        assert!(matches!(
            op.pre_process(&mut ctx(&states, &network_id, 11)).unwrap(),
            PreProcessResult::Skip(_)
        ));

        let values = op.process(Height::new(3), &states).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].key, SUFFRAGE_STATE_KEY);
        assert_eq!(values[1].key, SUFFRAGE_CANDIDATES_STATE_KEY);
    }

    #[test]
    fn expel_signs_aggregate() {
        let (a, b, c, d) = (local("a"), local("b"), local("c"), local("d"));
        let network_id = network();
        let states = with_suffrage(&[&a, &b, &c, &d]);

        let fact = SuffrageExpelFact::new(c.address().clone(), Height::new(5), Height::new(15), "no ballot");
        let mut op = SuffrageExpelOperation::new(fact.clone(), &a, &network_id);
        assert!(op.merge_signs(&SuffrageExpelOperation::new(fact.clone(), &b, &network_id)));
        assert!(!op.merge_signs(&SuffrageExpelOperation::new(fact.clone(), &b, &network_id)));
        assert!(op.is_valid(&network_id).is_ok());

        let nodes = vec![a.node().clone(), b.node().clone(), c.node().clone(), d.node().clone()];
        assert_eq!(op.member_signs(&nodes), 2);

        let two = op.clone().into_operation();
        assert!(matches!(
            two.pre_process(&mut ctx(&states, &network_id, 5)).unwrap(),
            PreProcessResult::Skip(_)
        ));

        op.merge_signs(&SuffrageExpelOperation::new(fact, &d, &network_id));
        let three = op.into_operation();
        assert_eq!(
            three.pre_process(&mut ctx(&states, &network_id, 5)).unwrap(),
            PreProcessResult::Accepted
        );
    }

    #[test]
    fn key_value_process() {
        let a = local("a");
        let op = Operation::new(
            OperationFact::KeyValue(KeyValueFact::new("color", "blue")),
            &a,
            &network(),
        );
        let values = op.process(Height::new(1), &States::default()).unwrap();
        assert_eq!(values[0].key, "kv:color");
        assert_eq!(values[0].delta, StateMergeDelta::KeyValue("blue".to_string()));
    }
}
