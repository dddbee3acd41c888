//! Index-addressed Merkle tree.
//!
//! Node `i` has children `2i+1` and `2i+2`; its hash is
//! `SHA256(leaf_hash(i) ‖ node_hash(2i+1) ‖ node_hash(2i+2))` with missing
//! children contributing nothing. Leaves can be added in any order; the
//! root only depends on the final leaf vector.

use super::hash::Hash;
use super::BaseError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTreeNode {
    pub index: u64,
    pub key: String,
    pub leaf: Hash,
    pub hash: Hash,
}

fn node_hash(leaf: &Hash, left: Option<&Hash>, right: Option<&Hash>) -> Hash {
    let empty: &[u8] = &[];
    Hash::digest_parts([
        leaf.as_bytes(),
        left.map(|h| h.as_bytes()).unwrap_or(empty),
        right.map(|h| h.as_bytes()).unwrap_or(empty),
    ])
}

/// Collects leaves by index, then builds the tree once all are present.
#[derive(Debug)]
pub struct FixedTreeGenerator {
    leaves: Vec<Option<(String, Hash)>>,
}

impl FixedTreeGenerator {
    pub fn new(size: usize) -> Self {
        FixedTreeGenerator {
            leaves: vec![None; size],
        }
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn add(&mut self, index: usize, key: impl Into<String>, leaf_bytes: &[u8]) -> Result<(), BaseError> {
        let size = self.leaves.len();
        let slot = self
            .leaves
            .get_mut(index)
            .ok_or_else(|| BaseError::FixedTree(format!("index {index} out of range, size {size}")))?;
        if slot.is_some() {
            return Err(BaseError::FixedTree(format!("index {index} already set")));
        }
        *slot = Some((key.into(), Hash::digest(leaf_bytes)));
        Ok(())
    }

    pub fn tree(self) -> Result<FixedTree, BaseError> {
        let mut leaves = Vec::with_capacity(self.leaves.len());
        for (i, leaf) in self.leaves.into_iter().enumerate() {
            leaves.push(leaf.ok_or_else(|| BaseError::FixedTree(format!("index {i} is empty")))?);
        }

        let n = leaves.len();
        let mut hashes = vec![Hash::EMPTY; n];
        for i in (0..n).rev() {
            let left = hashes.get(2 * i + 1).copied();
            let right = hashes.get(2 * i + 2).copied();
            hashes[i] = node_hash(&leaves[i].1, left.as_ref(), right.as_ref());
        }

        let nodes = leaves
            .into_iter()
            .zip(hashes)
            .enumerate()
            .map(|(i, ((key, leaf), hash))| FixedTreeNode {
                index: i as u64,
                key,
                leaf,
                hash,
            })
            .collect();

        Ok(FixedTree { nodes })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FixedTree {
    nodes: Vec<FixedTreeNode>,
}

impl FixedTree {
    /// Rebuilds a tree from stored nodes, recomputing every node hash.
    pub fn from_nodes(nodes: Vec<FixedTreeNode>) -> Result<Self, BaseError> {
        for (i, node) in nodes.iter().enumerate() {
            if node.index != i as u64 {
                return Err(BaseError::FixedTree(format!(
                    "node at position {i} has index {}",
                    node.index
                )));
            }
        }
        for i in (0..nodes.len()).rev() {
            let left = nodes.get(2 * i + 1).map(|n| &n.hash);
            let right = nodes.get(2 * i + 2).map(|n| &n.hash);
            if node_hash(&nodes[i].leaf, left, right) != nodes[i].hash {
                return Err(BaseError::FixedTree(format!("hash mismatch at index {i}")));
            }
        }
        Ok(FixedTree { nodes })
    }

    pub fn root(&self) -> Option<Hash> {
        self.nodes.first().map(|n| n.hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[FixedTreeNode] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<FixedTreeNode> {
        self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&FixedTreeNode> {
        self.nodes.get(index)
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.key == key)
    }

    /// Path from `index` up to the root, each step carrying both child hashes.
    pub fn proof(&self, index: usize) -> Result<FixedTreeProof, BaseError> {
        if index >= self.nodes.len() {
            return Err(BaseError::FixedTree(format!("index {index} out of range")));
        }

        let mut path = Vec::new();
        let mut i = index;
        loop {
            let node = &self.nodes[i];
            path.push(FixedTreeProofNode {
                index: node.index,
                key: node.key.clone(),
                leaf: node.leaf,
                left: self.nodes.get(2 * i + 1).map(|n| n.hash),
                right: self.nodes.get(2 * i + 2).map(|n| n.hash),
            });
            if i == 0 {
                break;
            }
            i = (i - 1) / 2;
        }

        Ok(FixedTreeProof { nodes: path })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTreeProofNode {
    pub index: u64,
    pub key: String,
    pub leaf: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Hash>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTreeProof {
    pub nodes: Vec<FixedTreeProofNode>,
}

impl FixedTreeProof {
    /// The proven leaf, first on the path.
    pub fn leaf(&self) -> Option<&FixedTreeProofNode> {
        self.nodes.first()
    }

    pub fn verify(&self, root: &Hash) -> Result<(), BaseError> {
        let mut iter = self.nodes.iter();
        let Some(first) = iter.next() else {
            return Err(BaseError::FixedTree("empty proof".to_string()));
        };

        let mut index = first.index;
        let mut hash = node_hash(&first.leaf, first.left.as_ref(), first.right.as_ref());

        for node in iter {
            if index == 0 || node.index != (index - 1) / 2 {
                return Err(BaseError::FixedTree(format!(
                    "index {} is not the parent of {index}",
                    node.index
                )));
            }
            let child = if index == 2 * node.index + 1 {
                node.left
            } else {
                node.right
            };
            if child != Some(hash) {
                return Err(BaseError::FixedTree(format!("child hash mismatch at index {}", node.index)));
            }
            index = node.index;
            hash = node_hash(&node.leaf, node.left.as_ref(), node.right.as_ref());
        }

        if index != 0 || hash != *root {
            return Err(BaseError::FixedTree("root mismatch".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(order: &[usize]) -> FixedTree {
        let mut g = FixedTreeGenerator::new(order.len());
        for i in order {
            g.add(*i, format!("k{i}"), format!("leaf-{i}").as_bytes()).unwrap();
        }
        g.tree().unwrap()
    }

    #[test]
    fn insertion_order_does_not_change_root() {
        let a = build(&[0, 1, 2, 3, 4, 5, 6]);
        let b = build(&[6, 3, 0, 5, 1, 4, 2]);
        assert_eq!(a.root(), b.root());
        assert!(a.root().is_some());
    }

    #[test]
    fn root_follows_definition() {
        let t = build(&[0, 1, 2]);
        let l = |i: usize| Hash::digest(format!("leaf-{i}").as_bytes());
        let n1 = Hash::digest_parts([l(1).as_bytes()]);
        let n2 = Hash::digest_parts([l(2).as_bytes()]);
        let n0 = Hash::digest_parts([l(0).as_bytes(), n1.as_bytes(), n2.as_bytes()]);
        assert_eq!(t.root(), Some(n0));
    }

    #[test]
    fn missing_leaf_fails() {
        let mut g = FixedTreeGenerator::new(3);
        g.add(0, "a", b"a").unwrap();
        g.add(2, "c", b"c").unwrap();
        assert!(g.add(2, "c", b"c").is_err());
        assert!(g.add(3, "d", b"d").is_err());
        assert!(g.tree().is_err());
    }

    #[test]
    fn proofs_verify_for_every_index() {
        let t = build(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let root = t.root().unwrap();
        for i in 0..t.len() {
            let proof = t.proof(i).unwrap();
            assert!(proof.verify(&root).is_ok(), "index {i}");
            assert_eq!(proof.leaf().unwrap().key, format!("k{i}"));
        }

        let mut proof = t.proof(7).unwrap();
        proof.nodes[0].leaf = Hash::digest(b"forged");
        assert!(proof.verify(&root).is_err());
    }

    #[test]
    fn from_nodes_detects_tampering() {
        let t = build(&[0, 1, 2, 3]);
        let mut nodes = t.clone().into_nodes();
        assert_eq!(FixedTree::from_nodes(nodes.clone()).unwrap(), t);

        nodes[3].leaf = Hash::digest(b"x");
        assert!(FixedTree::from_nodes(nodes).is_err());
    }
}
