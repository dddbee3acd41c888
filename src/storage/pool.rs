//! In-memory proposal and operation pool.

use super::{Pool, StorageResult};
use crate::base::{Hash, Height, NodeAddress, Point};
use crate::consensus::ProposalSignFact;
use crate::state::Operation;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

struct PooledOperation {
    operation: Operation,
    received_at: DateTime<Utc>,
}

#[derive(Default)]
struct PoolInner {
    proposals: HashMap<Hash, ProposalSignFact>,
    by_point: BTreeMap<(Point, NodeAddress), Hash>,
    /// keyed by fact hash
    operations: HashMap<Hash, PooledOperation>,
}

pub struct MemPool {
    inner: RwLock<PoolInner>,
    operation_expire: Duration,
    suffrage_operation_expire: Duration,
}

impl MemPool {
    pub fn new(operation_expire: Duration, suffrage_operation_expire: Duration) -> Self {
        MemPool {
            inner: RwLock::new(PoolInner::default()),
            operation_expire,
            suffrage_operation_expire,
        }
    }

    fn is_expired(&self, op: &PooledOperation, now: DateTime<Utc>) -> bool {
        let expire = if op.operation.fact.is_suffrage() {
            self.suffrage_operation_expire
        } else {
            self.operation_expire
        };
        (now - op.received_at)
            .to_std()
            .map_or(false, |age| age > expire)
    }

    pub fn operations_len(&self) -> usize {
        self.inner.read().operations.len()
    }

    /// Inserts with an explicit arrival time.
    pub fn set_operation_at(&self, operation: Operation, received_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write();
        let fact = operation.fact_hash();
        if inner.operations.contains_key(&fact) {
            return false;
        }
        inner.operations.insert(
            fact,
            PooledOperation {
                operation,
                received_at,
            },
        );
        true
    }
}

impl Pool for MemPool {
    fn set_proposal(&self, proposal: ProposalSignFact) -> StorageResult<bool> {
        let mut inner = self.inner.write();
        let hash = proposal.hash();
        if inner.proposals.contains_key(&hash) {
            return Ok(false);
        }
        inner
            .by_point
            .insert((proposal.point(), proposal.proposer().clone()), hash);
        inner.proposals.insert(hash, proposal);
        Ok(true)
    }

    fn proposal(&self, fact: &Hash) -> StorageResult<Option<ProposalSignFact>> {
        Ok(self.inner.read().proposals.get(fact).cloned())
    }

    fn proposal_by_point(
        &self,
        point: Point,
        proposer: &NodeAddress,
    ) -> StorageResult<Option<ProposalSignFact>> {
        let inner = self.inner.read();
        Ok(inner
            .by_point
            .get(&(point, proposer.clone()))
            .and_then(|h| inner.proposals.get(h))
            .cloned())
    }

    fn set_operation(&self, operation: Operation) -> StorageResult<bool> {
        Ok(self.set_operation_at(operation, Utc::now()))
    }

    fn operation(&self, hash: &Hash) -> StorageResult<Option<Operation>> {
        let inner = self.inner.read();
        if let Some(op) = inner.operations.get(hash) {
            return Ok(Some(op.operation.clone()));
        }
        Ok(inner
            .operations
            .values()
            .find(|op| &op.operation.hash == hash)
            .map(|op| op.operation.clone()))
    }

    fn operations_for_proposal(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<Operation>> {
        let mut inner = self.inner.write();

        let expired: Vec<Hash> = inner
            .operations
            .iter()
            .filter(|(_, op)| self.is_expired(op, now))
            .map(|(h, _)| *h)
            .collect();
        for h in &expired {
            inner.operations.remove(h);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired operations dropped from pool");
        }

        let mut ops: Vec<&PooledOperation> = inner.operations.values().collect();
        ops.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.operation.fact_hash().cmp(&b.operation.fact_hash()))
        });
        Ok(ops
            .into_iter()
            .take(limit)
            .map(|op| op.operation.clone())
            .collect())
    }

    fn remove_operations(&self, facts: &[Hash]) -> StorageResult<usize> {
        let mut inner = self.inner.write();
        Ok(facts
            .iter()
            .filter(|f| inner.operations.remove(f).is_some())
            .count())
    }

    fn clean_proposals(&self, height: Height) -> StorageResult<usize> {
        let mut inner = self.inner.write();
        let stale: Vec<(Point, NodeAddress)> = inner
            .by_point
            .keys()
            .take_while(|(p, _)| p.height < height)
            .cloned()
            .collect();
        for key in &stale {
            if let Some(h) = inner.by_point.remove(key) {
                inner.proposals.remove(&h);
            }
        }
        Ok(stale.len())
    }
}
