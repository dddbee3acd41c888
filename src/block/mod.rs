//! Block format: manifest, block map and the six block items, plus the
//! local item files, writer, reader, importer and genesis generator.

pub mod genesis;
pub mod importer;
pub mod localfs;
pub mod reader;
pub mod writer;

pub use genesis::GenesisGenerator;
pub use importer::{BlockImporter, ImportBlock};
pub use localfs::{ItemFile, ItemFileHeader, ItemFiles, LocalFsReader, LocalFsWriter};
pub use reader::BlockReader;
pub use writer::BlockWriter;

use crate::base::{BaseError, FixedTree, Hash, Height, LocalNode, NetworkId, Sign};
use crate::consensus::{ProposalSignFact, Voteproof, VoteproofError};
use crate::error::ErrorKind;
use crate::state::{Operation, OperationError, State};
use crate::storage::StorageError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("invalid block: {0}")]
    Invalid(String),

    #[error("checksum mismatch in {item}: expected {expected}, found {found}")]
    ChecksumMismatch {
        item: BlockMapItemType,
        expected: String,
        found: String,
    },

    #[error("missing block item {0}")]
    MissingItem(BlockMapItemType),

    #[error("unknown compression format {0:?}")]
    UnknownCompression(String),

    #[error("block writer already {0}")]
    WriterClosed(&'static str),

    #[error(transparent)]
    Base(#[from] BaseError),

    #[error(transparent)]
    Voteproof(#[from] VoteproofError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BlockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlockError::Base(e) => e.kind(),
            BlockError::Voteproof(e) => e.kind(),
            BlockError::Operation(e) => e.kind(),
            BlockError::Storage(e) => e.kind(),
            BlockError::MissingItem(_) => ErrorKind::NotFound,
            BlockError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            BlockError::Io(_) => ErrorKind::Broken,
            BlockError::WriterClosed(_) => ErrorKind::Other,
            _ => ErrorKind::Invalid,
        }
    }
}

/// Compact block summary; its hash is the block hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub height: Height,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations_tree: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states_tree: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffrage: Option<Hash>,
    pub proposed_at: DateTime<Utc>,
    pub hash: Hash,
}

impl Manifest {
    pub fn new(
        height: Height,
        previous: Option<Hash>,
        proposal: Option<Hash>,
        operations_tree: Option<Hash>,
        states_tree: Option<Hash>,
        suffrage: Option<Hash>,
        proposed_at: DateTime<Utc>,
    ) -> Self {
        let mut manifest = Manifest {
            height,
            previous,
            proposal,
            operations_tree,
            states_tree,
            suffrage,
            proposed_at,
            hash: Hash::EMPTY,
        };
        manifest.hash = manifest.generate_hash();
        manifest
    }

    fn generate_hash(&self) -> Hash {
        let opt = |h: &Option<Hash>| h.map(|h| h.as_bytes().to_vec()).unwrap_or_default();
        Hash::digest_parts([
            self.height.to_bytes().to_vec(),
            opt(&self.previous),
            opt(&self.proposal),
            opt(&self.operations_tree),
            opt(&self.states_tree),
            opt(&self.suffrage),
            self.proposed_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .into_bytes(),
        ])
    }

    pub fn is_valid(&self) -> Result<(), BlockError> {
        self.height.is_valid()?;
        if self.height > Height::GENESIS && self.previous.map_or(true, |p| p.is_empty()) {
            return Err(BlockError::Invalid(format!(
                "manifest at {} without previous block",
                self.height
            )));
        }
        if self.proposal.map_or(true, |p| p.is_empty()) {
            return Err(BlockError::Invalid("manifest without proposal".to_string()));
        }
        if self.generate_hash() != self.hash {
            return Err(BlockError::Invalid("manifest hash mismatch".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockMapItemType {
    Proposal,
    Operations,
    OperationsTree,
    States,
    StatesTree,
    Voteproofs,
}

impl BlockMapItemType {
    pub const ALL: [BlockMapItemType; 6] = [
        BlockMapItemType::Proposal,
        BlockMapItemType::Operations,
        BlockMapItemType::OperationsTree,
        BlockMapItemType::States,
        BlockMapItemType::StatesTree,
        BlockMapItemType::Voteproofs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BlockMapItemType::Proposal => "proposal",
            BlockMapItemType::Operations => "operations",
            BlockMapItemType::OperationsTree => "operations_tree",
            BlockMapItemType::States => "states",
            BlockMapItemType::StatesTree => "states_tree",
            BlockMapItemType::Voteproofs => "voteproofs",
        }
    }

    /// List items are one JSON record per line.
    pub fn is_list(self) -> bool {
        !matches!(self, BlockMapItemType::Proposal | BlockMapItemType::Voteproofs)
    }

    pub fn file_name(self) -> String {
        let ext = if self.is_list() { "ndjson" } else { "json" };
        format!("{}.{ext}", self.as_str())
    }
}

impl fmt::Display for BlockMapItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BlockMapItemType {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlockMapItemType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| BlockError::Invalid(format!("unknown block item type {s:?}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapItem {
    #[serde(rename = "type")]
    pub item_type: BlockMapItemType,
    pub url: String,
    pub checksum: String,
    pub count: u64,
}

/// Signed index over a block's items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMap {
    pub manifest: Manifest,
    pub items: Vec<BlockMapItem>,
    pub writer: String,
    pub encoder: String,
    pub sign: Sign,
}

impl BlockMap {
    pub fn new(
        local: &LocalNode,
        network_id: &NetworkId,
        manifest: Manifest,
        mut items: Vec<BlockMapItem>,
        writer: &str,
        encoder: &str,
    ) -> Self {
        items.sort_by_key(|i| i.item_type);
        let signed = Self::signed_hash(&manifest, &items, writer, encoder);
        BlockMap {
            manifest,
            items,
            writer: writer.to_string(),
            encoder: encoder.to_string(),
            sign: Sign::new(local, network_id, &signed),
        }
    }

    fn signed_hash(manifest: &Manifest, items: &[BlockMapItem], writer: &str, encoder: &str) -> Hash {
        let mut parts: Vec<Vec<u8>> = vec![
            manifest.hash.as_bytes().to_vec(),
            writer.as_bytes().to_vec(),
            encoder.as_bytes().to_vec(),
        ];
        for item in items {
            parts.push(item.item_type.as_str().as_bytes().to_vec());
            parts.push(item.url.as_bytes().to_vec());
            parts.push(item.checksum.as_bytes().to_vec());
            parts.push(item.count.to_be_bytes().to_vec());
        }
        Hash::digest_parts(parts)
    }

    pub fn height(&self) -> Height {
        self.manifest.height
    }

    pub fn hash(&self) -> Hash {
        Self::signed_hash(&self.manifest, &self.items, &self.writer, &self.encoder)
    }

    pub fn item(&self, item_type: BlockMapItemType) -> Option<&BlockMapItem> {
        self.items.iter().find(|i| i.item_type == item_type)
    }

    /// Manifest, all six items and the producer sign.
    pub fn is_valid(&self, network_id: &NetworkId) -> Result<(), BlockError> {
        self.manifest.is_valid()?;

        if self.items.len() != BlockMapItemType::ALL.len() {
            return Err(BlockError::Invalid(format!(
                "block map has {} items, {} required",
                self.items.len(),
                BlockMapItemType::ALL.len()
            )));
        }
        for t in BlockMapItemType::ALL {
            let item = self.item(t).ok_or(BlockError::MissingItem(t))?;
            if item.checksum.is_empty() {
                return Err(BlockError::Invalid(format!("empty checksum for {t}")));
            }
        }
        if self.sign.node.is_none() {
            return Err(BlockError::Invalid("block map sign without node".to_string()));
        }
        self.sign.verify(network_id, &self.hash())?;
        Ok(())
    }
}

/// An operation as recorded in a block, with its process result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOperation {
    pub operation: Operation,
    pub in_state: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A decoded block item.
#[derive(Clone, Debug)]
pub enum BlockItem {
    Proposal(ProposalSignFact),
    Operations(Vec<BlockOperation>),
    OperationsTree(FixedTree),
    States(Vec<State>),
    StatesTree(FixedTree),
    Voteproofs(Box<(Voteproof, Voteproof)>),
}

/// Leaf bytes of an operations tree entry: fact hash plus whether the
/// operation changed state.
pub fn operation_tree_leaf(fact: &Hash, in_state: bool) -> Vec<u8> {
    let mut b = fact.as_bytes().to_vec();
    b.push(u8::from(in_state));
    b
}
