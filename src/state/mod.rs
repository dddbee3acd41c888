//! Block states: keyed values written by operations, one row per
//! (key, height) that changed it.

pub mod merger;
pub mod operation;

pub use merger::StateValueMerger;
pub use operation::{
    KeyValueFact, NetworkPolicyFact, Operation, OperationFact, PreProcessContext, PreProcessResult,
    SuffrageCandidateFact, SuffrageExpelFact, SuffrageExpelOperation, SuffrageJoinFact,
};

use crate::base::hint::{
    FIXED_CANDIDATE_LIMITER_HINT, KEY_VALUE_STATE_VALUE_HINT, NETWORK_POLICY_STATE_VALUE_HINT,
    SUFFRAGE_CANDIDATES_STATE_VALUE_HINT, SUFFRAGE_EXPELS_STATE_VALUE_HINT,
    SUFFRAGE_NODES_STATE_VALUE_HINT,
};
use crate::base::{BaseError, Hash, Height, Node, NodeAddress};
use crate::error::ErrorKind;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUFFRAGE_STATE_KEY: &str = "suffrage";
pub const SUFFRAGE_CANDIDATES_STATE_KEY: &str = "suffrage_candidates";
pub const SUFFRAGE_EXPELS_STATE_KEY: &str = "suffrage_expels";
pub const NETWORK_POLICY_STATE_KEY: &str = "network_policy";

const KEY_VALUE_PREFIX: &str = "kv:";

pub fn key_value_state_key(key: &str) -> String {
    format!("{KEY_VALUE_PREFIX}{key}")
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error("invalid state {key:?}: {reason}")]
    InvalidState { key: String, reason: String },

    #[error("state merger for {0:?} already closed")]
    MergerClosed(String),

    #[error(transparent)]
    Base(#[from] BaseError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl OperationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperationError::Storage(e) => e.kind(),
            OperationError::MergerClosed(_) => ErrorKind::Other,
            _ => ErrorKind::Invalid,
        }
    }
}

/// Read access to the states of the previous block.
pub trait GetState: Send + Sync {
    fn state(&self, key: &str) -> Result<Option<State>, StorageError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageNodeStateValue {
    pub node: Node,
    pub start: Height,
}

/// Current suffrage. `height` is the suffrage height: it increases by one
/// on every block that changes membership.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageNodesStateValue {
    pub height: Height,
    pub nodes: Vec<SuffrageNodeStateValue>,
}

impl SuffrageNodesStateValue {
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(|n| n.node.clone()).collect()
    }

    pub fn exists(&self, address: &NodeAddress) -> bool {
        self.nodes.iter().any(|n| &n.node.address == address)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageCandidate {
    pub node: Node,
    pub start: Height,
    pub deadline: Height,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageCandidatesStateValue {
    pub candidates: Vec<SuffrageCandidate>,
}

impl SuffrageCandidatesStateValue {
    pub fn find(&self, address: &NodeAddress) -> Option<&SuffrageCandidate> {
        self.candidates.iter().find(|c| &c.node.address == address)
    }

    pub fn active_at(&self, height: Height) -> impl Iterator<Item = &SuffrageCandidate> {
        self.candidates.iter().filter(move |c| c.deadline >= height)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpelRecord {
    pub node: NodeAddress,
    pub start: Height,
    pub end: Height,
    pub reason: String,
}

impl ExpelRecord {
    pub fn is_active(&self, height: Height) -> bool {
        self.start <= height && height <= self.end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageExpelsStateValue {
    pub expels: Vec<ExpelRecord>,
}

impl SuffrageExpelsStateValue {
    pub fn active_at(&self, height: Height) -> impl Iterator<Item = &ExpelRecord> {
        self.expels.iter().filter(move |e| e.is_active(height))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_hint")]
pub enum SuffrageCandidateLimiterRule {
    #[serde(rename = "fixed-suffrage-candidate-limiter-rule-v0.0.1")]
    Fixed { limit: u64 },
}

impl SuffrageCandidateLimiterRule {
    /// Candidates admitted per block.
    pub fn limit(&self) -> u64 {
        match self {
            SuffrageCandidateLimiterRule::Fixed { limit } => *limit,
        }
    }

    fn hash_bytes(&self) -> Vec<u8> {
        match self {
            SuffrageCandidateLimiterRule::Fixed { limit } => {
                let mut b = FIXED_CANDIDATE_LIMITER_HINT.as_bytes().to_vec();
                b.extend_from_slice(&limit.to_be_bytes());
                b
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub max_operations_in_proposal: u64,
    /// Heights a candidate stays eligible to join.
    pub suffrage_candidate_lifespan: u64,
    pub max_suffrage_size: u64,
    /// Heights an expel stays active.
    pub suffrage_expel_lifespan: u64,
    pub candidate_limiter: SuffrageCandidateLimiterRule,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        NetworkPolicy {
            max_operations_in_proposal: 333,
            suffrage_candidate_lifespan: 333,
            max_suffrage_size: 33,
            suffrage_expel_lifespan: 333,
            candidate_limiter: SuffrageCandidateLimiterRule::Fixed { limit: 1 },
        }
    }
}

impl NetworkPolicy {
    pub fn is_valid(&self) -> Result<(), OperationError> {
        let invalid = |reason: &str| {
            Err(OperationError::InvalidState {
                key: NETWORK_POLICY_STATE_KEY.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.max_operations_in_proposal < 1 {
            return invalid("max_operations_in_proposal must be positive");
        }
        if self.suffrage_candidate_lifespan < 1 {
            return invalid("suffrage_candidate_lifespan must be positive");
        }
        if self.max_suffrage_size < 1 {
            return invalid("max_suffrage_size must be positive");
        }
        if self.suffrage_expel_lifespan < 1 {
            return invalid("suffrage_expel_lifespan must be positive");
        }
        Ok(())
    }

    fn hash_bytes(&self) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&self.max_operations_in_proposal.to_be_bytes());
        b.extend_from_slice(&self.suffrage_candidate_lifespan.to_be_bytes());
        b.extend_from_slice(&self.max_suffrage_size.to_be_bytes());
        b.extend_from_slice(&self.suffrage_expel_lifespan.to_be_bytes());
        b.extend_from_slice(&self.candidate_limiter.hash_bytes());
        b
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueStateValue {
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_hint")]
pub enum StateValue {
    #[serde(rename = "suffrage-nodes-state-value-v0.0.1")]
    SuffrageNodes(SuffrageNodesStateValue),
    #[serde(rename = "suffrage-candidates-state-value-v0.0.1")]
    SuffrageCandidates(SuffrageCandidatesStateValue),
    #[serde(rename = "suffrage-expels-state-value-v0.0.1")]
    SuffrageExpels(SuffrageExpelsStateValue),
    #[serde(rename = "network-policy-state-value-v0.0.1")]
    NetworkPolicy(NetworkPolicy),
    #[serde(rename = "key-value-state-value-v0.0.1")]
    KeyValue(KeyValueStateValue),
}

impl StateValue {
    pub fn hint(&self) -> &'static str {
        match self {
            StateValue::SuffrageNodes(_) => SUFFRAGE_NODES_STATE_VALUE_HINT,
            StateValue::SuffrageCandidates(_) => SUFFRAGE_CANDIDATES_STATE_VALUE_HINT,
            StateValue::SuffrageExpels(_) => SUFFRAGE_EXPELS_STATE_VALUE_HINT,
            StateValue::NetworkPolicy(_) => NETWORK_POLICY_STATE_VALUE_HINT,
            StateValue::KeyValue(_) => KEY_VALUE_STATE_VALUE_HINT,
        }
    }

    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut b = self.hint().as_bytes().to_vec();
        match self {
            StateValue::SuffrageNodes(v) => {
                b.extend_from_slice(&v.height.to_bytes());
                for n in &v.nodes {
                    b.extend_from_slice(&n.node.hash_bytes());
                    b.extend_from_slice(&n.start.to_bytes());
                }
            }
            StateValue::SuffrageCandidates(v) => {
                for c in &v.candidates {
                    b.extend_from_slice(&c.node.hash_bytes());
                    b.extend_from_slice(&c.start.to_bytes());
                    b.extend_from_slice(&c.deadline.to_bytes());
                }
            }
            StateValue::SuffrageExpels(v) => {
                for e in &v.expels {
                    b.extend_from_slice(e.node.as_bytes());
                    b.extend_from_slice(&e.start.to_bytes());
                    b.extend_from_slice(&e.end.to_bytes());
                    b.extend_from_slice(e.reason.as_bytes());
                }
            }
            StateValue::NetworkPolicy(p) => b.extend_from_slice(&p.hash_bytes()),
            StateValue::KeyValue(v) => b.extend_from_slice(v.value.as_bytes()),
        }
        b
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub key: String,
    pub value: StateValue,
    pub height: Height,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Hash>,
    pub operations: Vec<Hash>,
    pub hash: Hash,
}

impl State {
    pub fn new(
        key: impl Into<String>,
        value: StateValue,
        height: Height,
        previous: Option<Hash>,
        operations: Vec<Hash>,
    ) -> Self {
        let key = key.into();
        let hash = Self::generate_hash(&key, &value, height);
        State {
            key,
            value,
            height,
            previous,
            operations,
            hash,
        }
    }

    /// SHA256(key ‖ value.hash_bytes() ‖ height)
    pub fn generate_hash(key: &str, value: &StateValue, height: Height) -> Hash {
        Hash::digest_parts([
            key.as_bytes(),
            value.hash_bytes().as_slice(),
            &height.to_bytes(),
        ])
    }

    pub fn is_valid(&self) -> Result<(), OperationError> {
        let invalid = |reason: String| OperationError::InvalidState {
            key: self.key.clone(),
            reason,
        };
        if self.key.is_empty() {
            return Err(invalid("empty key".to_string()));
        }
        self.height.is_valid()?;
        if Self::generate_hash(&self.key, &self.value, self.height) != self.hash {
            return Err(invalid("hash mismatch".to_string()));
        }
        if let Some(previous) = &self.previous {
            previous.is_valid()?;
        }
        Ok(())
    }
}

/// One change an operation makes to one state key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateMergeDelta {
    KeyValue(String),
    AddCandidate(SuffrageCandidate),
    RemoveCandidate(NodeAddress),
    Join(SuffrageNodeStateValue),
    Expel(ExpelRecord),
    Policy(NetworkPolicy),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateMergeValue {
    pub key: String,
    pub delta: StateMergeDelta,
}

impl StateMergeValue {
    pub fn new(key: impl Into<String>, delta: StateMergeDelta) -> Self {
        StateMergeValue {
            key: key.into(),
            delta,
        }
    }
}

pub(crate) fn suffrage_nodes_value(
    get_state: &dyn GetState,
) -> Result<Option<SuffrageNodesStateValue>, OperationError> {
    match get_state.state(SUFFRAGE_STATE_KEY)? {
        None => Ok(None),
        Some(State {
            value: StateValue::SuffrageNodes(v),
            ..
        }) => Ok(Some(v)),
        Some(_) => Err(unexpected_value(SUFFRAGE_STATE_KEY)),
    }
}

pub(crate) fn candidates_value(
    get_state: &dyn GetState,
) -> Result<SuffrageCandidatesStateValue, OperationError> {
    match get_state.state(SUFFRAGE_CANDIDATES_STATE_KEY)? {
        None => Ok(SuffrageCandidatesStateValue::default()),
        Some(State {
            value: StateValue::SuffrageCandidates(v),
            ..
        }) => Ok(v),
        Some(_) => Err(unexpected_value(SUFFRAGE_CANDIDATES_STATE_KEY)),
    }
}

pub(crate) fn expels_value(get_state: &dyn GetState) -> Result<SuffrageExpelsStateValue, OperationError> {
    match get_state.state(SUFFRAGE_EXPELS_STATE_KEY)? {
        None => Ok(SuffrageExpelsStateValue::default()),
        Some(State {
            value: StateValue::SuffrageExpels(v),
            ..
        }) => Ok(v),
        Some(_) => Err(unexpected_value(SUFFRAGE_EXPELS_STATE_KEY)),
    }
}

pub(crate) fn network_policy_value(get_state: &dyn GetState) -> Result<NetworkPolicy, OperationError> {
    match get_state.state(NETWORK_POLICY_STATE_KEY)? {
        None => Ok(NetworkPolicy::default()),
        Some(State {
            value: StateValue::NetworkPolicy(v),
            ..
        }) => Ok(v),
        Some(_) => Err(unexpected_value(NETWORK_POLICY_STATE_KEY)),
    }
}

fn unexpected_value(key: &str) -> OperationError {
    OperationError::InvalidState {
        key: key.to_string(),
        reason: "unexpected value type".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::PrivateKey;

    #[test]
    fn state_hash_covers_key_value_height() {
        let v = StateValue::KeyValue(KeyValueStateValue {
            value: "1".to_string(),
        });
        let a = State::new("kv:a", v.clone(), Height::new(3), None, vec![]);
        assert!(a.is_valid().is_ok());

        let b = State::new("kv:a", v.clone(), Height::new(4), None, vec![]);
        let c = State::new("kv:b", v, Height::new(3), None, vec![]);
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);

        let mut tampered = a.clone();
        tampered.height = Height::new(9);
        assert!(tampered.is_valid().is_err());
    }

    #[test]
    fn state_value_carries_hint() {
        let node = Node::new(NodeAddress::new("a").unwrap(), PrivateKey::generate().public_key());
        let v = StateValue::SuffrageNodes(SuffrageNodesStateValue {
            height: Height::GENESIS,
            nodes: vec![SuffrageNodeStateValue {
                node,
                start: Height::GENESIS,
            }],
        });
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["_hint"], SUFFRAGE_NODES_STATE_VALUE_HINT);
        let back: StateValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);

        let policy = serde_json::to_value(NetworkPolicy::default()).unwrap();
        assert_eq!(policy["candidate_limiter"]["_hint"], FIXED_CANDIDATE_LIMITER_HINT);
    }

    #[test]
    fn expel_activity_range() {
        let e = ExpelRecord {
            node: NodeAddress::new("c").unwrap(),
            start: Height::new(5),
            end: Height::new(15),
            reason: "r".to_string(),
        };
        assert!(!e.is_active(Height::new(4)));
        assert!(e.is_active(Height::new(5)));
        assert!(e.is_active(Height::new(15)));
        assert!(!e.is_active(Height::new(16)));
    }
}
