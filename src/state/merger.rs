use super::{
    OperationError, State, StateMergeDelta, StateValue, SuffrageCandidatesStateValue,
    SuffrageExpelsStateValue, SuffrageNodesStateValue,
};
use crate::base::{Hash, Height};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct MergerInner {
    /// op fact hash -> deltas; ordered so close folds in op-hash order.
    deltas: BTreeMap<Hash, Vec<StateMergeDelta>>,
    closed: bool,
}

/// Accumulates the changes one block makes to one state key.
///
/// `merge` may be called from many workers in any order. `close` folds the
/// deltas in operation-hash order, so the resulting state does not depend
/// on arrival order.
#[derive(Debug)]
pub struct StateValueMerger {
    key: String,
    height: Height,
    previous: Option<State>,
    inner: Mutex<MergerInner>,
}

impl StateValueMerger {
    pub fn new(key: impl Into<String>, height: Height, previous: Option<State>) -> Self {
        StateValueMerger {
            key: key.into(),
            height,
            previous,
            inner: Mutex::new(MergerInner::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns false when `op` was already merged.
    pub fn merge(&self, op: Hash, deltas: Vec<StateMergeDelta>) -> Result<bool, OperationError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(OperationError::MergerClosed(self.key.clone()));
        }
        if inner.deltas.contains_key(&op) {
            return Ok(false);
        }
        inner.deltas.insert(op, deltas);
        Ok(true)
    }

    /// The new state, or `None` when nothing effectively changed.
    pub fn close(&self) -> Result<Option<State>, OperationError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(OperationError::MergerClosed(self.key.clone()));
        }
        inner.closed = true;

        let deltas = std::mem::take(&mut inner.deltas);
        if deltas.is_empty() {
            return Ok(None);
        }

        let previous_value = self.previous.as_ref().map(|s| &s.value);
        let value = self.fold(previous_value, deltas.values().flatten())?;
        if Some(&value) == previous_value {
            return Ok(None);
        }

        Ok(Some(State::new(
            self.key.clone(),
            value,
            self.height,
            self.previous.as_ref().map(|s| s.hash),
            deltas.into_keys().collect(),
        )))
    }

    fn fold<'a>(
        &self,
        previous: Option<&StateValue>,
        deltas: impl Iterator<Item = &'a StateMergeDelta> + Clone,
    ) -> Result<StateValue, OperationError> {
        let mismatch = || OperationError::InvalidState {
            key: self.key.clone(),
            reason: "deltas do not match the state value type".to_string(),
        };

        let Some(first) = deltas.clone().next() else {
            return previous.cloned().ok_or_else(mismatch);
        };

        match first {
            StateMergeDelta::KeyValue(_) => {
                if previous.is_some_and(|v| !matches!(v, StateValue::KeyValue(_))) {
                    return Err(mismatch());
                }
                let mut last = None;
                for d in deltas {
                    match d {
                        StateMergeDelta::KeyValue(v) => last = Some(v.clone()),
                        _ => return Err(mismatch()),
                    }
                }
                let value = last.ok_or_else(mismatch)?;
                Ok(StateValue::KeyValue(super::KeyValueStateValue { value }))
            }
            StateMergeDelta::Policy(_) => {
                if previous.is_some_and(|v| !matches!(v, StateValue::NetworkPolicy(_))) {
                    return Err(mismatch());
                }
                let mut last = None;
                for d in deltas {
                    match d {
                        StateMergeDelta::Policy(p) => last = Some(p.clone()),
                        _ => return Err(mismatch()),
                    }
                }
                Ok(StateValue::NetworkPolicy(last.ok_or_else(mismatch)?))
            }
            StateMergeDelta::AddCandidate(_) | StateMergeDelta::RemoveCandidate(_) => {
                let mut candidates = match previous {
                    None => Vec::new(),
                    Some(StateValue::SuffrageCandidates(v)) => v.candidates.clone(),
                    Some(_) => return Err(mismatch()),
                };
                candidates.retain(|c| c.deadline >= self.height);
                for d in deltas {
                    match d {
                        StateMergeDelta::AddCandidate(c) => {
                            candidates.retain(|x| x.node.address != c.node.address);
                            candidates.push(c.clone());
                        }
                        StateMergeDelta::RemoveCandidate(address) => {
                            candidates.retain(|x| &x.node.address != address);
                        }
                        _ => return Err(mismatch()),
                    }
                }
                candidates.sort_by(|a, b| a.node.address.cmp(&b.node.address));
                Ok(StateValue::SuffrageCandidates(SuffrageCandidatesStateValue { candidates }))
            }
            StateMergeDelta::Join(_) => {
                let (base_height, mut nodes) = match previous {
                    None => (None, Vec::new()),
                    Some(StateValue::SuffrageNodes(v)) => (Some(v.height), v.nodes.clone()),
                    Some(_) => return Err(mismatch()),
                };
                let before = nodes.clone();
                for d in deltas {
                    match d {
                        StateMergeDelta::Join(n) => {
                            if !nodes.iter().any(|x| x.node.address == n.node.address) {
                                nodes.push(n.clone());
                            }
                        }
                        _ => return Err(mismatch()),
                    }
                }
                nodes.sort_by(|a, b| a.node.address.cmp(&b.node.address));

                if let (Some(height), true) = (base_height, nodes == before) {
                    return Ok(StateValue::SuffrageNodes(SuffrageNodesStateValue { height, nodes }));
                }
                let height = base_height.map(Height::next).unwrap_or(Height::GENESIS);
                Ok(StateValue::SuffrageNodes(SuffrageNodesStateValue { height, nodes }))
            }
            StateMergeDelta::Expel(_) => {
                let mut expels = match previous {
                    None => Vec::new(),
                    Some(StateValue::SuffrageExpels(v)) => v.expels.clone(),
                    Some(_) => return Err(mismatch()),
                };
                expels.retain(|e| e.end >= self.height);
                for d in deltas {
                    match d {
                        StateMergeDelta::Expel(e) => {
                            if !expels.iter().any(|x| x.node == e.node && x.start == e.start) {
                                expels.push(e.clone());
                            }
                        }
                        _ => return Err(mismatch()),
                    }
                }
                expels.sort_by(|a, b| (&a.node, a.start).cmp(&(&b.node, b.start)));
                Ok(StateValue::SuffrageExpels(SuffrageExpelsStateValue { expels }))
            }
        }
    }
}
