//! Write-once staging of one block before it is promoted.

use super::{StorageError, StorageResult};
use crate::base::{Hash, Height};
use crate::block::BlockMap;
use crate::consensus::{SuffrageProof, Voteproof};
use crate::state::State;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug)]
pub struct TempDatabase {
    height: Height,
    blockmap: Option<BlockMap>,
    states: BTreeMap<String, State>,
    operations_in_state: BTreeSet<Hash>,
    operations_known: BTreeSet<Hash>,
    voteproofs: Option<(Voteproof, Voteproof)>,
    suffrage_proof: Option<SuffrageProof>,
}

impl TempDatabase {
    pub fn new(height: Height) -> Self {
        TempDatabase {
            height,
            blockmap: None,
            states: BTreeMap::new(),
            operations_in_state: BTreeSet::new(),
            operations_known: BTreeSet::new(),
            voteproofs: None,
            suffrage_proof: None,
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    fn check_height(&self, found: Height) -> StorageResult<()> {
        if found != self.height {
            return Err(StorageError::HeightMismatch {
                expected: self.height,
                found,
            });
        }
        Ok(())
    }

    pub fn set_blockmap(&mut self, blockmap: BlockMap) -> StorageResult<()> {
        self.check_height(blockmap.height())?;
        if self.blockmap.is_some() {
            return Err(StorageError::AlreadyExists(format!("blockmap {}", self.height)));
        }
        self.blockmap = Some(blockmap);
        Ok(())
    }

    pub fn set_states(&mut self, states: impl IntoIterator<Item = State>) -> StorageResult<()> {
        for st in states {
            self.check_height(st.height)?;
            if self.states.contains_key(&st.key) {
                return Err(StorageError::AlreadyExists(format!("state {:?}", st.key)));
            }
            self.states.insert(st.key.clone(), st);
        }
        Ok(())
    }

    /// `in_state` holds fact hashes, `known` operation hashes.
    pub fn set_operations(
        &mut self,
        in_state: impl IntoIterator<Item = Hash>,
        known: impl IntoIterator<Item = Hash>,
    ) -> StorageResult<()> {
        self.operations_in_state.extend(in_state);
        self.operations_known.extend(known);
        Ok(())
    }

    pub fn set_voteproofs(&mut self, init: Voteproof, accept: Voteproof) -> StorageResult<()> {
        self.check_height(init.height())?;
        self.check_height(accept.height())?;
        if self.voteproofs.is_some() {
            return Err(StorageError::AlreadyExists(format!("voteproofs {}", self.height)));
        }
        self.voteproofs = Some((init, accept));
        Ok(())
    }

    pub fn set_suffrage_proof(&mut self, proof: SuffrageProof) -> StorageResult<()> {
        self.check_height(proof.height())?;
        if self.suffrage_proof.is_some() {
            return Err(StorageError::AlreadyExists(format!("suffrage proof {}", self.height)));
        }
        self.suffrage_proof = Some(proof);
        Ok(())
    }

    pub fn blockmap(&self) -> Option<&BlockMap> {
        self.blockmap.as_ref()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.values()
    }

    pub fn state(&self, key: &str) -> Option<&State> {
        self.states.get(key)
    }

    pub fn operations_in_state(&self) -> impl Iterator<Item = &Hash> {
        self.operations_in_state.iter()
    }

    pub fn operations_known(&self) -> impl Iterator<Item = &Hash> {
        self.operations_known.iter()
    }

    pub fn voteproofs(&self) -> Option<&(Voteproof, Voteproof)> {
        self.voteproofs.as_ref()
    }

    pub fn suffrage_proof(&self) -> Option<&SuffrageProof> {
        self.suffrage_proof.as_ref()
    }

    /// Ready to merge: block map and voteproofs are set.
    pub fn is_complete(&self) -> StorageResult<()> {
        if self.blockmap.is_none() {
            return Err(StorageError::NotFound(format!("blockmap {} not staged", self.height)));
        }
        if self.voteproofs.is_none() {
            return Err(StorageError::NotFound(format!("voteproofs {} not staged", self.height)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{KeyValueStateValue, StateValue};

    fn state(key: &str, height: i64) -> State {
        State::new(
            key,
            StateValue::KeyValue(KeyValueStateValue { value: "v".into() }),
            Height::new(height),
            None,
            vec![],
        )
    }

    #[test]
    fn states_are_write_once_per_key() {
        let mut temp = TempDatabase::new(Height::new(3));
        temp.set_states([state("kv:a", 3)]).unwrap();
        assert!(matches!(
            temp.set_states([state("kv:a", 3)]),
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(matches!(
            temp.set_states([state("kv:b", 4)]),
            Err(StorageError::HeightMismatch { .. })
        ));
        assert_eq!(temp.states().count(), 1);
        assert!(temp.is_complete().is_err());
    }
}
