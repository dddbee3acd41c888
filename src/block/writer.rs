//! Collects one block while its proposal is processed, then saves it.

use super::localfs::{remove_block, LocalFsWriter};
use super::{operation_tree_leaf, BlockError, BlockItem, BlockMap, BlockOperation, Manifest};
use crate::base::hint::{JSON_ENCODER_HINT, LOCALFS_WRITER_HINT};
use crate::base::{FixedTree, FixedTreeGenerator, Hash, Height, LocalNode, NetworkId};
use crate::consensus::{ProposalSignFact, SuffrageProof, Voteproof};
use crate::state::{Operation, State, StateMergeDelta, StateMergeValue, StateValueMerger, SUFFRAGE_STATE_KEY};
use crate::storage::{PermanentDatabase, TempDatabase};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct WriterInner {
    proposal: Option<ProposalSignFact>,
    operations: Vec<Option<BlockOperation>>,
    mergers: BTreeMap<String, Arc<StateValueMerger>>,
    states: Vec<State>,
    operations_tree: Option<FixedTree>,
    states_tree: Option<FixedTree>,
    manifest: Option<Manifest>,
    init: Option<Voteproof>,
    accept: Option<Voteproof>,
    saved: Option<BlockMap>,
    canceled: bool,
}

/// Append-only writer for one height. Safe to share between process
/// workers; `save` is idempotent.
pub struct BlockWriter {
    local: LocalNode,
    network_id: NetworkId,
    height: Height,
    root: PathBuf,
    db: Arc<dyn PermanentDatabase>,
    inner: Mutex<WriterInner>,
}

impl BlockWriter {
    pub fn new(
        local: LocalNode,
        network_id: NetworkId,
        height: Height,
        root: PathBuf,
        db: Arc<dyn PermanentDatabase>,
    ) -> Self {
        BlockWriter {
            local,
            network_id,
            height,
            root,
            db,
            inner: Mutex::new(WriterInner::default()),
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    fn check_open(inner: &WriterInner) -> Result<(), BlockError> {
        if inner.canceled {
            return Err(BlockError::WriterClosed("canceled"));
        }
        if inner.saved.is_some() {
            return Err(BlockError::WriterClosed("saved"));
        }
        Ok(())
    }

    pub fn set_proposal(&self, proposal: ProposalSignFact) -> Result<(), BlockError> {
        if proposal.point().height != self.height {
            return Err(BlockError::Invalid(format!(
                "proposal at {} for block {}",
                proposal.point(),
                self.height
            )));
        }
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        inner.proposal = Some(proposal);
        Ok(())
    }

    pub fn set_operations_size(&self, size: usize) -> Result<(), BlockError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        inner.operations = vec![None; size];
        Ok(())
    }

    pub fn set_process_result(
        &self,
        index: usize,
        operation: Operation,
        in_state: bool,
        reason: Option<String>,
    ) -> Result<(), BlockError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        let size = inner.operations.len();
        let slot = inner
            .operations
            .get_mut(index)
            .ok_or_else(|| BlockError::Invalid(format!("operation index {index} out of range, size {size}")))?;
        *slot = Some(BlockOperation {
            operation,
            in_state,
            reason,
        });
        Ok(())
    }

    fn merger(&self, key: &str) -> Result<Arc<StateValueMerger>, BlockError> {
        {
            let inner = self.inner.lock();
            Self::check_open(&inner)?;
            if let Some(m) = inner.mergers.get(key) {
                return Ok(m.clone());
            }
        }
        let previous = self.db.state(key)?;
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        Ok(inner
            .mergers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(StateValueMerger::new(key, self.height, previous)))
            .clone())
    }

    /// Routes the values one operation produced to their mergers.
    pub fn set_states(&self, op_fact: Hash, values: Vec<StateMergeValue>) -> Result<(), BlockError> {
        let mut by_key: BTreeMap<String, Vec<StateMergeDelta>> = BTreeMap::new();
        for v in values {
            by_key.entry(v.key).or_default().push(v.delta);
        }
        for (key, deltas) in by_key {
            self.merger(&key)?.merge(op_fact, deltas)?;
        }
        Ok(())
    }

    /// Closes the mergers, builds both trees and the manifest.
    pub fn manifest(&self, previous: Option<&Manifest>) -> Result<Manifest, BlockError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        if let Some(m) = &inner.manifest {
            return Ok(m.clone());
        }

        let proposal = inner
            .proposal
            .clone()
            .ok_or(BlockError::MissingItem(super::BlockMapItemType::Proposal))?;

        let mut operations = Vec::with_capacity(inner.operations.len());
        for (i, op) in inner.operations.iter().enumerate() {
            operations.push(
                op.clone()
                    .ok_or_else(|| BlockError::Invalid(format!("operation {i} has no process result")))?,
            );
        }
        operations.sort_by_key(|o| o.operation.fact_hash());

        let mut states = Vec::new();
        for merger in std::mem::take(&mut inner.mergers).into_values() {
            if let Some(st) = merger.close()? {
                states.push(st);
            }
        }

        let mut g = FixedTreeGenerator::new(operations.len());
        for (i, o) in operations.iter().enumerate() {
            let fact = o.operation.fact_hash();
            g.add(i, fact.to_hex(), &operation_tree_leaf(&fact, o.in_state))?;
        }
        let operations_tree = g.tree()?;

        let mut g = FixedTreeGenerator::new(states.len());
        for (i, st) in states.iter().enumerate() {
            g.add(i, st.key.clone(), st.hash.as_bytes())?;
        }
        let states_tree = g.tree()?;

        let suffrage = match states.iter().find(|s| s.key == SUFFRAGE_STATE_KEY) {
            Some(st) => Some(st.hash),
            None => self.db.state(SUFFRAGE_STATE_KEY)?.map(|s| s.hash),
        };

        let manifest = Manifest::new(
            self.height,
            previous.map(|m| m.hash),
            Some(proposal.hash()),
            operations_tree.root(),
            states_tree.root(),
            suffrage,
            proposal.fact.proposed_at,
        );
        manifest.is_valid()?;

        debug!(
            height = %self.height,
            operations = operations.len(),
            states = states.len(),
            manifest = %manifest.hash,
            "manifest built"
        );

        inner.operations = operations.into_iter().map(Some).collect();
        inner.states = states;
        inner.operations_tree = Some(operations_tree);
        inner.states_tree = Some(states_tree);
        inner.manifest = Some(manifest.clone());
        Ok(manifest)
    }

    pub fn set_init_voteproof(&self, vp: Voteproof) -> Result<(), BlockError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        if vp.init_majority().is_none() || vp.height() != self.height {
            return Err(BlockError::Invalid(format!("not an INIT majority for {}", self.height)));
        }
        inner.init = Some(vp);
        Ok(())
    }

    pub fn set_accept_voteproof(&self, vp: Voteproof) -> Result<(), BlockError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        if vp.accept_majority().is_none() || vp.height() != self.height {
            return Err(BlockError::Invalid(format!("not an ACCEPT majority for {}", self.height)));
        }
        inner.accept = Some(vp);
        Ok(())
    }

    /// Writes the item files and promotes the block into the permanent
    /// database. A second call returns the saved block map.
    pub fn save(&self) -> Result<BlockMap, BlockError> {
        let mut inner = self.inner.lock();
        if let Some(bm) = &inner.saved {
            return Ok(bm.clone());
        }
        Self::check_open(&inner)?;

        let manifest = inner
            .manifest
            .clone()
            .ok_or_else(|| BlockError::Invalid("save before manifest".to_string()))?;
        let (Some(init), Some(accept)) = (inner.init.clone(), inner.accept.clone()) else {
            return Err(BlockError::Invalid("save without voteproofs".to_string()));
        };
        match accept.accept_majority() {
            Some(f) if f.new_block == manifest.hash => {}
            _ => {
                return Err(BlockError::Invalid(format!(
                    "ACCEPT voteproof does not accept block {}",
                    manifest.hash
                )))
            }
        }

        let operations: Vec<BlockOperation> = inner.operations.iter().flatten().cloned().collect();
        let states = inner.states.clone();
        let states_tree = inner.states_tree.clone().unwrap_or_default();
        let proposal = inner
            .proposal
            .clone()
            .ok_or(BlockError::MissingItem(super::BlockMapItemType::Proposal))?;

        let mut files = LocalFsWriter::new(&self.root, self.height)?;
        let items = [
            BlockItem::Proposal(proposal),
            BlockItem::Operations(operations.clone()),
            BlockItem::OperationsTree(inner.operations_tree.clone().unwrap_or_default()),
            BlockItem::States(states.clone()),
            BlockItem::StatesTree(states_tree.clone()),
            BlockItem::Voteproofs(Box::new((init.clone(), accept.clone()))),
        ]
        .iter()
        .map(|item| files.write_item(item))
        .collect::<Result<Vec<_>, _>>()?;

        let blockmap = BlockMap::new(
            &self.local,
            &self.network_id,
            manifest,
            items,
            LOCALFS_WRITER_HINT,
            JSON_ENCODER_HINT,
        );
        files.finish(&blockmap)?;

        let temp = build_temp_database(&blockmap, operations, states, &states_tree, init, accept)?;
        if let Err(e) = self.db.merge_temp_database(&temp) {
            remove_block(&self.root, self.height);
            return Err(e.into());
        }

        info!(
            height = %self.height,
            block = %blockmap.manifest.hash,
            "block saved"
        );
        inner.saved = Some(blockmap.clone());
        Ok(blockmap)
    }

    /// Drops everything collected; later calls fail.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.saved.is_some() {
            return;
        }
        inner.canceled = true;
        inner.mergers.clear();
        inner.states.clear();
        inner.operations.clear();
        debug!(height = %self.height, "block writer canceled");
    }
}

/// Stages a complete block for the permanent database.
pub(crate) fn build_temp_database(
    blockmap: &BlockMap,
    operations: Vec<BlockOperation>,
    states: Vec<State>,
    states_tree: &FixedTree,
    init: Voteproof,
    accept: Voteproof,
) -> Result<TempDatabase, BlockError> {
    let mut temp = TempDatabase::new(blockmap.height());
    temp.set_blockmap(blockmap.clone())?;

    let suffrage_state = states.iter().find(|s| s.key == SUFFRAGE_STATE_KEY).cloned();
    temp.set_states(states)?;
    temp.set_operations(
        operations
            .iter()
            .filter(|o| o.in_state)
            .map(|o| o.operation.fact_hash()),
        operations.iter().map(|o| o.operation.hash),
    )?;

    if let Some(state) = suffrage_state {
        let position = states_tree
            .position(&state.key)
            .ok_or_else(|| BlockError::Invalid("suffrage state missing from states tree".to_string()))?;
        let proof = SuffrageProof {
            map: blockmap.clone(),
            state,
            proof: states_tree.proof(position)?,
            voteproof: accept.clone(),
        };
        temp.set_suffrage_proof(proof)?;
    }
    temp.set_voteproofs(init, accept)?;
    Ok(temp)
}
