//! Validates blocks fetched from peers and commits them.
//!
//! Each block is checked on its own first (block map sign, item checksums,
//! trees, voteproofs against the suffrage of its height), then the range is
//! checked as a chain against the local tip, and only then committed.

use super::localfs::{remove_block, verify_item_file, LocalFsWriter};
use super::writer::build_temp_database;
use super::{operation_tree_leaf, BlockError, BlockItem, BlockMap, BlockMapItemType, BlockOperation};
use crate::base::{FixedTree, FixedTreeGenerator, Hash, Height, HintTable, NetworkId, Threshold};
use crate::consensus::{Suffrage, Voteproof};
use crate::state::{State, SUFFRAGE_EXPELS_STATE_KEY, SUFFRAGE_STATE_KEY};
use crate::storage::PermanentDatabase;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// A block as received: its map and the raw item files.
#[derive(Clone, Debug)]
pub struct ImportBlock {
    pub blockmap: BlockMap,
    pub items: BTreeMap<BlockMapItemType, Vec<u8>>,
}

struct VerifiedBlock {
    blockmap: BlockMap,
    raw: BTreeMap<BlockMapItemType, Vec<u8>>,
    operations: Vec<BlockOperation>,
    states: Vec<State>,
    states_tree: FixedTree,
    init: Voteproof,
    accept: Voteproof,
}

/// Suffrage states as of the block before the one being checked.
struct SuffrageTracker {
    nodes: Option<State>,
    expels: Option<State>,
}

impl SuffrageTracker {
    fn suffrage(&self, height: Height) -> Result<Option<Suffrage>, BlockError> {
        match &self.nodes {
            Some(nodes) => Ok(Some(Suffrage::from_states(nodes, self.expels.as_ref(), height)?)),
            None => Ok(None),
        }
    }

    fn update(&mut self, states: &[State]) {
        for st in states {
            if st.key == SUFFRAGE_STATE_KEY {
                self.nodes = Some(st.clone());
            } else if st.key == SUFFRAGE_EXPELS_STATE_KEY {
                self.expels = Some(st.clone());
            }
        }
    }
}

pub struct BlockImporter {
    network_id: NetworkId,
    threshold: Threshold,
    root: PathBuf,
    db: Arc<dyn PermanentDatabase>,
    hints: HintTable,
}

impl BlockImporter {
    pub fn new(
        network_id: NetworkId,
        threshold: Threshold,
        root: PathBuf,
        db: Arc<dyn PermanentDatabase>,
    ) -> Self {
        BlockImporter {
            network_id,
            threshold,
            root,
            db,
            hints: HintTable::new(),
        }
    }

    /// Imports consecutive blocks following the local tip. Returns the new
    /// tip height.
    pub fn import(&self, mut blocks: Vec<ImportBlock>) -> Result<Height, BlockError> {
        blocks.sort_by_key(|b| b.blockmap.height());
        let Some(first) = blocks.first().map(|b| b.blockmap.height()) else {
            return Err(BlockError::Invalid("nothing to import".to_string()));
        };

        let before = if first > Height::GENESIS { first.prev() } else { Height::NIL };
        let mut tracker = if before.is_nil() {
            SuffrageTracker { nodes: None, expels: None }
        } else {
            SuffrageTracker {
                nodes: self.db.state_at(SUFFRAGE_STATE_KEY, before)?,
                expels: self.db.state_at(SUFFRAGE_EXPELS_STATE_KEY, before)?,
            }
        };

        let mut verified = Vec::with_capacity(blocks.len());
        for block in blocks {
            let v = self.verify_block(block, &tracker)?;
            tracker.update(&v.states);
            verified.push(v);
        }

        self.check_chain(&verified)?;

        let mut tip = Height::NIL;
        for v in verified {
            tip = self.commit(v)?;
        }
        info!(from = %first, to = %tip, "blocks imported");
        Ok(tip)
    }

    fn verify_block(&self, block: ImportBlock, tracker: &SuffrageTracker) -> Result<VerifiedBlock, BlockError> {
        let bm = &block.blockmap;
        let height = bm.height();
        bm.is_valid(&self.network_id)?;

        let mut decoded = BTreeMap::new();
        for t in BlockMapItemType::ALL {
            let expected = bm.item(t).ok_or(BlockError::MissingItem(t))?;
            let bytes = block.items.get(&t).ok_or(BlockError::MissingItem(t))?;
            decoded.insert(t, verify_item_file(expected, bytes, &self.hints)?);
        }
        let mut take = |t| decoded.remove(&t).ok_or(BlockError::MissingItem(t));

        let BlockItem::Proposal(proposal) = take(BlockMapItemType::Proposal)? else {
            return Err(BlockError::Invalid("proposal item type mismatch".to_string()));
        };
        let BlockItem::Operations(operations) = take(BlockMapItemType::Operations)? else {
            return Err(BlockError::Invalid("operations item type mismatch".to_string()));
        };
        let BlockItem::OperationsTree(operations_tree) = take(BlockMapItemType::OperationsTree)? else {
            return Err(BlockError::Invalid("operations tree item type mismatch".to_string()));
        };
        let BlockItem::States(states) = take(BlockMapItemType::States)? else {
            return Err(BlockError::Invalid("states item type mismatch".to_string()));
        };
        let BlockItem::StatesTree(states_tree) = take(BlockMapItemType::StatesTree)? else {
            return Err(BlockError::Invalid("states tree item type mismatch".to_string()));
        };
        let BlockItem::Voteproofs(vps) = take(BlockMapItemType::Voteproofs)? else {
            return Err(BlockError::Invalid("voteproofs item type mismatch".to_string()));
        };
        let (init, accept) = *vps;

        proposal.is_valid(&self.network_id).map_err(|e| BlockError::Invalid(e.to_string()))?;
        if Some(proposal.hash()) != bm.manifest.proposal || proposal.point().height != height {
            return Err(BlockError::Invalid(format!("proposal does not belong to block {height}")));
        }

        let mut g = FixedTreeGenerator::new(operations.len());
        for (i, o) in operations.iter().enumerate() {
            o.operation.is_valid(&self.network_id)?;
            let fact = o.operation.fact_hash();
            g.add(i, fact.to_hex(), &operation_tree_leaf(&fact, o.in_state))?;
        }
        let rebuilt = g.tree()?;
        if rebuilt != operations_tree || rebuilt.root() != bm.manifest.operations_tree {
            return Err(BlockError::Invalid(format!("operations tree of {height} does not match")));
        }

        let mut g = FixedTreeGenerator::new(states.len());
        for (i, st) in states.iter().enumerate() {
            st.is_valid()?;
            if st.height != height {
                return Err(BlockError::Invalid(format!("state {:?} not at {height}", st.key)));
            }
            g.add(i, st.key.clone(), st.hash.as_bytes())?;
        }
        let rebuilt = g.tree()?;
        if rebuilt != states_tree || rebuilt.root() != bm.manifest.states_tree {
            return Err(BlockError::Invalid(format!("states tree of {height} does not match")));
        }

        self.verify_voteproofs(bm, &proposal.hash(), &init, &accept, &states, tracker)?;

        debug!(height = %height, operations = operations.len(), states = states.len(), "block verified");
        Ok(VerifiedBlock {
            blockmap: block.blockmap,
            raw: block.items,
            operations,
            states,
            states_tree,
            init,
            accept,
        })
    }

    fn verify_voteproofs(
        &self,
        bm: &BlockMap,
        proposal: &Hash,
        init: &Voteproof,
        accept: &Voteproof,
        states: &[State],
        tracker: &SuffrageTracker,
    ) -> Result<(), BlockError> {
        let height = bm.height();
        let init_fact = init
            .init_majority()
            .ok_or_else(|| BlockError::Invalid(format!("no INIT majority for {height}")))?;
        let accept_fact = accept
            .accept_majority()
            .ok_or_else(|| BlockError::Invalid(format!("no ACCEPT majority for {height}")))?;
        if init.height() != height || accept.point().point != init.point().point {
            return Err(BlockError::Invalid(format!("voteproofs not at {height}")));
        }
        if &init_fact.proposal != proposal || &accept_fact.proposal != proposal {
            return Err(BlockError::Invalid("voteproofs for another proposal".to_string()));
        }
        if accept_fact.new_block != bm.manifest.hash {
            return Err(BlockError::Invalid("ACCEPT voteproof for another block".to_string()));
        }

        if height == Height::GENESIS {
            let mut own = SuffrageTracker { nodes: None, expels: None };
            own.update(states);
            let suffrage = own
                .suffrage(height)?
                .ok_or_else(|| BlockError::Invalid("genesis without suffrage".to_string()))?;
            for vp in [init, accept] {
                vp.is_valid(&self.network_id)?;
                for sf in vp.sign_facts() {
                    let known = sf.node().is_some_and(|n| suffrage.exists_publickey(n, &sf.sign.signer));
                    if !known {
                        return Err(BlockError::Invalid("genesis voteproof signed outside suffrage".to_string()));
                    }
                }
            }
            return Ok(());
        }

        let suffrage = tracker
            .suffrage(height)?
            .ok_or_else(|| BlockError::Invalid(format!("suffrage for {height} unknown")))?;
        init.is_valid_with_suffrage(&self.network_id, &suffrage, self.threshold)?;
        accept.is_valid_with_suffrage(&self.network_id, &suffrage, self.threshold)?;
        Ok(())
    }

    fn check_chain(&self, blocks: &[VerifiedBlock]) -> Result<(), BlockError> {
        let mut previous = self.db.last_blockmap()?.map(|bm| (bm.height(), bm.manifest.hash));
        for v in blocks {
            let m = &v.blockmap.manifest;
            match previous {
                None if m.height == Height::GENESIS => {}
                Some((h, hash)) if m.height == h.next() && m.previous == Some(hash) => {}
                _ => {
                    return Err(BlockError::Invalid(format!(
                        "block {} does not follow {}",
                        m.height,
                        previous.map_or(Height::NIL, |(h, _)| h)
                    )))
                }
            }
            previous = Some((m.height, m.hash));
        }
        Ok(())
    }

    fn commit(&self, v: VerifiedBlock) -> Result<Height, BlockError> {
        let height = v.blockmap.height();

        let mut files = LocalFsWriter::new(&self.root, height)?;
        for item in &v.blockmap.items {
            let bytes = v.raw.get(&item.item_type).ok_or(BlockError::MissingItem(item.item_type))?;
            files.write_raw(item, bytes)?;
        }
        files.finish(&v.blockmap)?;

        let temp = build_temp_database(&v.blockmap, v.operations, v.states, &v.states_tree, v.init, v.accept)?;
        if let Err(e) = self.db.merge_temp_database(&temp) {
            remove_block(&self.root, height);
            return Err(e.into());
        }
        Ok(height)
    }
}
