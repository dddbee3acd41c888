//! Suffrage membership per height and proofs of suffrage changes.

use super::voteproof::Voteproof;
use super::VoteproofError;
use crate::base::{FixedTreeProof, Height, NetworkId, Node, NodeAddress, PublicKey, Stage, Threshold};
use crate::block::BlockMap;
use crate::state::{State, StateValue, SUFFRAGE_STATE_KEY};
use crate::storage::{PermanentDatabase, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Nodes allowed to vote at one height, sorted by address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Suffrage {
    nodes: Vec<Node>,
}

impl Suffrage {
    pub fn new(mut nodes: Vec<Node>) -> Result<Self, VoteproofError> {
        if nodes.is_empty() {
            return Err(VoteproofError::Invalid("empty suffrage".to_string()));
        }
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        if nodes.windows(2).any(|w| w[0].address == w[1].address) {
            return Err(VoteproofError::Invalid("duplicated suffrage node".to_string()));
        }
        Ok(Suffrage { nodes })
    }

    /// Members from a suffrage nodes state, less nodes expelled at `height`.
    pub fn from_states(
        nodes: &State,
        expels: Option<&State>,
        height: Height,
    ) -> Result<Self, VoteproofError> {
        let StateValue::SuffrageNodes(value) = &nodes.value else {
            return Err(VoteproofError::Invalid(format!(
                "state {:?} is not a suffrage nodes state",
                nodes.key
            )));
        };

        let expelled: Vec<&NodeAddress> = match expels.map(|s| &s.value) {
            Some(StateValue::SuffrageExpels(v)) => v.active_at(height).map(|e| &e.node).collect(),
            Some(_) => {
                return Err(VoteproofError::Invalid("not a suffrage expels state".to_string()))
            }
            None => Vec::new(),
        };

        Suffrage::new(
            value
                .nodes
                .iter()
                .filter(|n| n.start <= height && !expelled.contains(&&n.node.address))
                .map(|n| n.node.clone())
                .collect(),
        )
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, address: &NodeAddress) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.address.cmp(address))
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn exists(&self, address: &NodeAddress) -> bool {
        self.node(address).is_some()
    }

    pub fn exists_publickey(&self, address: &NodeAddress, publickey: &PublicKey) -> bool {
        self.node(address).is_some_and(|n| &n.publickey == publickey)
    }

    /// Members other than `exclude`, in address order.
    pub fn others<'a>(&'a self, exclude: &'a NodeAddress) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| &n.address != exclude)
    }
}

/// Resolves the suffrage voting at a height; `None` while the blocks that
/// define it are not known locally.
pub trait SuffrageSource: Send + Sync {
    fn suffrage(&self, height: Height) -> Result<Option<Suffrage>, StorageError>;
}

/// Suffrage read from the permanent database.
#[derive(Clone)]
pub struct DatabaseSuffrage(pub Arc<dyn PermanentDatabase>);

impl SuffrageSource for DatabaseSuffrage {
    fn suffrage(&self, height: Height) -> Result<Option<Suffrage>, StorageError> {
        self.0.suffrage(height)
    }
}

/// Evidence that a suffrage state was committed: the block map, the state,
/// its proof in the states tree and the ACCEPT voteproof of that block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuffrageProof {
    pub map: BlockMap,
    pub state: State,
    pub proof: FixedTreeProof,
    pub voteproof: Voteproof,
}

impl SuffrageProof {
    pub fn height(&self) -> Height {
        self.map.height()
    }

    /// Suffrage height carried by the state.
    pub fn suffrage_height(&self) -> Height {
        match &self.state.value {
            StateValue::SuffrageNodes(v) => v.height,
            _ => Height::NIL,
        }
    }

    pub fn suffrage(&self) -> Result<Suffrage, VoteproofError> {
        Suffrage::from_states(&self.state, None, self.height().next())
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), VoteproofError> {
        self.map
            .is_valid(network_id)
            .map_err(|e| VoteproofError::Invalid(e.to_string()))?;
        self.state.is_valid()?;
        if self.state.key != SUFFRAGE_STATE_KEY {
            return Err(VoteproofError::Invalid(format!(
                "suffrage proof for state {:?}",
                self.state.key
            )));
        }
        if self.state.height != self.height() {
            return Err(VoteproofError::Invalid("state height does not match block".to_string()));
        }

        let leaf = self
            .proof
            .leaf()
            .ok_or_else(|| VoteproofError::Invalid("empty states tree proof".to_string()))?;
        if leaf.key != self.state.key || leaf.leaf != crate::base::Hash::digest(self.state.hash.as_bytes()) {
            return Err(VoteproofError::Invalid("proof leaf does not match state".to_string()));
        }
        let root = self
            .map
            .manifest
            .states_tree
            .ok_or_else(|| VoteproofError::Invalid("block without states tree".to_string()))?;
        self.proof.verify(&root)?;

        self.voteproof.is_valid(network_id)?;
        if self.voteproof.stage() != Stage::Accept || self.voteproof.height() != self.height() {
            return Err(VoteproofError::Invalid("voteproof is not the block's ACCEPT".to_string()));
        }
        match self.voteproof.accept_majority() {
            Some(f) if f.new_block == self.map.manifest.hash => Ok(()),
            _ => Err(VoteproofError::Invalid("voteproof does not accept this block".to_string())),
        }
    }

    /// Checks this proof follows `previous`: the voteproof is signed by the
    /// previous suffrage and the suffrage height advances by one. The
    /// genesis proof only needs signers from its own suffrage.
    pub fn prove(
        &self,
        network_id: &NetworkId,
        previous: Option<&SuffrageProof>,
        threshold: Threshold,
    ) -> Result<(), VoteproofError> {
        self.is_valid(network_id)?;

        let Some(previous) = previous else {
            if self.suffrage_height() != Height::GENESIS {
                return Err(VoteproofError::Invalid(
                    "first suffrage proof must be genesis".to_string(),
                ));
            }
            let own = self.suffrage()?;
            for sf in self.voteproof.sign_facts() {
                let node = sf
                    .node()
                    .ok_or_else(|| VoteproofError::Invalid("sign fact without node".to_string()))?;
                if !own.exists_publickey(node, &sf.sign.signer) {
                    return Err(VoteproofError::UnknownNode(node.clone()));
                }
            }
            return Ok(());
        };

        if self.suffrage_height() != previous.suffrage_height().next() {
            return Err(VoteproofError::Invalid(format!(
                "suffrage height {} does not follow {}",
                self.suffrage_height(),
                previous.suffrage_height()
            )));
        }
        if self.height() <= previous.height() {
            return Err(VoteproofError::Invalid("suffrage proof height not increasing".to_string()));
        }
        let voters = previous.suffrage()?;
        self.voteproof.is_valid_with_suffrage(network_id, &voters, threshold)
    }
}
