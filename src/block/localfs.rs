//! Block item files on the local filesystem.
//!
//! Each height owns a directory derived from the zero-padded height, split
//! into three-character segments (`000/000/000/000/000/000/012`). The
//! directory holds one file per item type, `item_files.json` listing their
//! URLs and checksums, and `blockmap.json`.
//!
//! An item file is a header line, `# {"writer":..,"encoder":..,"type":..,"count":..}`,
//! followed by the body. List items are one JSON record per line.

use super::{BlockError, BlockItem, BlockMap, BlockMapItem, BlockMapItemType, BlockOperation};
use crate::base::hint::{HintedKind, JSON_ENCODER_HINT, LOCALFS_WRITER_HINT};
use crate::base::{FixedTree, FixedTreeNode, Hash, Height, HintTable};
use crate::consensus::{ProposalSignFact, Voteproof};
use crate::state::State;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const ITEM_FILES_NAME: &str = "item_files.json";
pub const BLOCKMAP_NAME: &str = "blockmap.json";
pub const URL_SCHEME: &str = "localfs:/";
const TEMP_DIR: &str = ".tmp";

/// Relative directory of a height.
pub fn height_directory(height: Height) -> PathBuf {
    let padded = format!("{:021}", height.get()).replace('-', "_");
    let mut path = PathBuf::new();
    for segment in padded.as_bytes().chunks(3) {
        path.push(String::from_utf8_lossy(segment).as_ref());
    }
    path
}

pub fn checksum(body: &[u8]) -> String {
    Hash::digest(body).to_hex()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFileHeader {
    pub writer: String,
    pub encoder: String,
    #[serde(rename = "type")]
    pub item_type: BlockMapItemType,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFile {
    #[serde(rename = "type")]
    pub item_type: BlockMapItemType,
    pub url: String,
    pub checksum: String,
    /// Empty means uncompressed, the only format written here.
    #[serde(default)]
    pub compress: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFiles {
    pub height: Height,
    pub items: Vec<ItemFile>,
}

impl ItemFiles {
    pub fn item(&self, item_type: BlockMapItemType) -> Option<&ItemFile> {
        self.items.iter().find(|i| i.item_type == item_type)
    }
}

fn encode_lines<'a, T: Serialize + 'a>(
    records: impl IntoIterator<Item = &'a T>,
) -> Result<(u64, Vec<u8>), BlockError> {
    let mut body = Vec::new();
    let mut count = 0;
    for record in records {
        serde_json::to_writer(&mut body, record)?;
        body.push(b'\n');
        count += 1;
    }
    Ok((count, body))
}

fn decode_lines<T: DeserializeOwned>(body: &[u8], hints: &HintTable) -> Result<Vec<T>, BlockError> {
    let mut records = Vec::new();
    for line in body.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
        let value: serde_json::Value = serde_json::from_slice(line)?;
        hints.check_value(&value)?;
        records.push(serde_json::from_value(value)?);
    }
    Ok(records)
}

fn decode_one<T: DeserializeOwned>(body: &[u8], hints: &HintTable) -> Result<T, BlockError> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    hints.check_value(&value)?;
    Ok(serde_json::from_value(value)?)
}

/// Body bytes and record count of an item.
pub fn encode_item(item: &BlockItem) -> Result<(BlockMapItemType, u64, Vec<u8>), BlockError> {
    let (t, (count, body)) = match item {
        BlockItem::Proposal(pr) => (BlockMapItemType::Proposal, (1, serde_json::to_vec(pr)?)),
        BlockItem::Operations(ops) => (BlockMapItemType::Operations, encode_lines(ops)?),
        BlockItem::OperationsTree(tree) => (BlockMapItemType::OperationsTree, encode_lines(tree.nodes())?),
        BlockItem::States(states) => (BlockMapItemType::States, encode_lines(states)?),
        BlockItem::StatesTree(tree) => (BlockMapItemType::StatesTree, encode_lines(tree.nodes())?),
        BlockItem::Voteproofs(vps) => (BlockMapItemType::Voteproofs, (2, serde_json::to_vec(vps.as_ref())?)),
    };
    Ok((t, count, body))
}

pub fn decode_item(item_type: BlockMapItemType, body: &[u8], hints: &HintTable) -> Result<BlockItem, BlockError> {
    let item = match item_type {
        BlockMapItemType::Proposal => BlockItem::Proposal(decode_one::<ProposalSignFact>(body, hints)?),
        BlockMapItemType::Operations => BlockItem::Operations(decode_lines::<BlockOperation>(body, hints)?),
        BlockMapItemType::OperationsTree => {
            BlockItem::OperationsTree(FixedTree::from_nodes(decode_lines::<FixedTreeNode>(body, hints)?)?)
        }
        BlockMapItemType::States => BlockItem::States(decode_lines::<State>(body, hints)?),
        BlockMapItemType::StatesTree => {
            BlockItem::StatesTree(FixedTree::from_nodes(decode_lines::<FixedTreeNode>(body, hints)?)?)
        }
        BlockMapItemType::Voteproofs => {
            BlockItem::Voteproofs(Box::new(decode_one::<(Voteproof, Voteproof)>(body, hints)?))
        }
    };
    Ok(item)
}

/// Splits an item file into its header and body and checks the hints.
pub fn parse_item_file<'a>(
    bytes: &'a [u8],
    hints: &HintTable,
) -> Result<(ItemFileHeader, &'a [u8]), BlockError> {
    let rest = bytes
        .strip_prefix(b"# ")
        .ok_or_else(|| BlockError::Invalid("item file without header".to_string()))?;
    let end = rest
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| BlockError::Invalid("unterminated item file header".to_string()))?;
    let header: ItemFileHeader = serde_json::from_slice(&rest[..end])?;

    if hints.lookup(&header.writer)? != HintedKind::Writer {
        return Err(BlockError::Invalid(format!("{} is not a writer hint", header.writer)));
    }
    if hints.lookup(&header.encoder)? != HintedKind::Encoder {
        return Err(BlockError::Invalid(format!("{} is not an encoder hint", header.encoder)));
    }
    Ok((header, &rest[end + 1..]))
}

/// Verifies the body checksum of a raw item file and decodes it.
pub fn verify_item_file(
    expected: &BlockMapItem,
    bytes: &[u8],
    hints: &HintTable,
) -> Result<BlockItem, BlockError> {
    let (header, body) = parse_item_file(bytes, hints)?;
    if header.item_type != expected.item_type {
        return Err(BlockError::Invalid(format!(
            "item file holds {}, expected {}",
            header.item_type, expected.item_type
        )));
    }
    let found = checksum(body);
    if found != expected.checksum {
        return Err(BlockError::ChecksumMismatch {
            item: expected.item_type,
            expected: expected.checksum.clone(),
            found,
        });
    }
    decode_item(expected.item_type, body, hints)
}

fn remove_dir(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove block directory");
        }
    }
}

/// Removes a committed height directory.
pub fn remove_block(root: &Path, height: Height) {
    remove_dir(&root.join(height_directory(height)));
}

/// Writes one height into a temporary directory, then renames it into
/// place. Dropping an unfinished writer removes the temporary directory.
pub struct LocalFsWriter {
    root: PathBuf,
    height: Height,
    temp: Option<PathBuf>,
    items: BTreeMap<BlockMapItemType, ItemFile>,
}

impl LocalFsWriter {
    pub fn new(root: &Path, height: Height) -> Result<Self, BlockError> {
        let temp = root
            .join(TEMP_DIR)
            .join(format!("{:021}-{:016x}", height.get(), rand::random::<u64>()));
        fs::create_dir_all(&temp)?;
        Ok(LocalFsWriter {
            root: root.to_path_buf(),
            height,
            temp: Some(temp),
            items: BTreeMap::new(),
        })
    }

    pub fn height(&self) -> Height {
        self.height
    }

    fn temp(&self) -> Result<&Path, BlockError> {
        self.temp.as_deref().ok_or(BlockError::WriterClosed("finished"))
    }

    pub fn write_item(&mut self, item: &BlockItem) -> Result<BlockMapItem, BlockError> {
        let (item_type, count, body) = encode_item(item)?;
        let header = ItemFileHeader {
            writer: LOCALFS_WRITER_HINT.to_string(),
            encoder: JSON_ENCODER_HINT.to_string(),
            item_type,
            count,
        };

        let mut bytes = b"# ".to_vec();
        serde_json::to_writer(&mut bytes, &header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&body);

        let file_name = item_type.file_name();
        fs::write(self.temp()?.join(&file_name), &bytes)?;

        let rel = height_directory(self.height).join(&file_name);
        let url = format!("{URL_SCHEME}{}", rel.to_string_lossy());
        let checksum = checksum(&body);
        self.items.insert(
            item_type,
            ItemFile {
                item_type,
                url: url.clone(),
                checksum: checksum.clone(),
                compress: String::new(),
            },
        );
        Ok(BlockMapItem {
            item_type,
            url,
            checksum,
            count,
        })
    }

    /// Stores an item file received from a peer as is.
    pub fn write_raw(&mut self, item: &BlockMapItem, bytes: &[u8]) -> Result<(), BlockError> {
        fs::write(self.temp()?.join(item.item_type.file_name()), bytes)?;
        self.items.insert(
            item.item_type,
            ItemFile {
                item_type: item.item_type,
                url: item.url.clone(),
                checksum: item.checksum.clone(),
                compress: String::new(),
            },
        );
        Ok(())
    }

    /// Writes the item list and block map, then moves the directory into
    /// place.
    pub fn finish(&mut self, blockmap: &BlockMap) -> Result<PathBuf, BlockError> {
        if blockmap.height() != self.height {
            return Err(BlockError::Invalid(format!(
                "block map height {} for writer at {}",
                blockmap.height(),
                self.height
            )));
        }
        let temp = self.temp()?.to_path_buf();

        let item_files = ItemFiles {
            height: self.height,
            items: self.items.values().cloned().collect(),
        };
        fs::write(temp.join(ITEM_FILES_NAME), serde_json::to_vec_pretty(&item_files)?)?;
        fs::write(temp.join(BLOCKMAP_NAME), serde_json::to_vec_pretty(blockmap)?)?;

        let target = self.root.join(height_directory(self.height));
        if target.exists() {
            remove_dir(&target);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&temp, &target)?;
        self.temp = None;

        debug!(height = %self.height, path = %target.display(), "block files written");
        Ok(target)
    }

    pub fn cancel(&mut self) {
        if let Some(temp) = self.temp.take() {
            remove_dir(&temp);
        }
    }
}

impl Drop for LocalFsWriter {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Reads one committed height.
pub struct LocalFsReader {
    dir: PathBuf,
    item_files: ItemFiles,
    hints: HintTable,
}

impl LocalFsReader {
    pub fn new(root: &Path, height: Height) -> Result<Self, BlockError> {
        let dir = root.join(height_directory(height));
        let item_files: ItemFiles = serde_json::from_slice(&fs::read(dir.join(ITEM_FILES_NAME))?)?;
        if item_files.height != height {
            return Err(BlockError::Invalid(format!(
                "item files of {} found for {height}",
                item_files.height
            )));
        }
        Ok(LocalFsReader {
            dir,
            item_files,
            hints: HintTable::new(),
        })
    }

    pub fn item_files(&self) -> &ItemFiles {
        &self.item_files
    }

    pub fn hints(&self) -> &HintTable {
        &self.hints
    }

    pub fn blockmap(&self) -> Result<BlockMap, BlockError> {
        Ok(serde_json::from_slice(&fs::read(self.dir.join(BLOCKMAP_NAME))?)?)
    }

    /// The whole item file, header included.
    pub fn raw(&self, item_type: BlockMapItemType) -> Result<Vec<u8>, BlockError> {
        let item = self
            .item_files
            .item(item_type)
            .ok_or(BlockError::MissingItem(item_type))?;
        if !item.compress.is_empty() {
            return Err(BlockError::UnknownCompression(item.compress.clone()));
        }
        let rel = item
            .url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| BlockError::Invalid(format!("unsupported item url {}", item.url)))?;
        let file_name = Path::new(rel)
            .file_name()
            .ok_or_else(|| BlockError::Invalid(format!("bad item url {}", item.url)))?;
        Ok(fs::read(self.dir.join(file_name))?)
    }

    /// The item body after checksum verification.
    pub fn body(&self, item_type: BlockMapItemType) -> Result<Vec<u8>, BlockError> {
        let bytes = self.raw(item_type)?;
        let expected = self
            .item_files
            .item(item_type)
            .ok_or(BlockError::MissingItem(item_type))?;
        let (_, body) = parse_item_file(&bytes, &self.hints)?;
        let found = checksum(body);
        if found != expected.checksum {
            return Err(BlockError::ChecksumMismatch {
                item: item_type,
                expected: expected.checksum.clone(),
                found,
            });
        }
        Ok(body.to_vec())
    }

    pub fn read(&self, item_type: BlockMapItemType) -> Result<BlockItem, BlockError> {
        let body = self.body(item_type)?;
        decode_item(item_type, &body, &self.hints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::FixedTreeGenerator;
    use tempfile::TempDir;

    #[test]
    fn height_directory_segments() {
        assert_eq!(
            height_directory(Height::new(12)),
            PathBuf::from("000/000/000/000/000/000/012")
        );
        assert_eq!(
            height_directory(Height::new(-1)),
            PathBuf::from("_00/000/000/000/000/000/001")
        );
    }

    fn tree() -> FixedTree {
        let mut g = FixedTreeGenerator::new(3);
        for i in 0..3 {
            g.add(i, format!("k{i}"), &[i as u8]).unwrap();
        }
        g.tree().unwrap()
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let height = Height::new(4);

        let mut w = LocalFsWriter::new(dir.path(), height).unwrap();
        let item = w.write_item(&BlockItem::StatesTree(tree())).unwrap();
        assert_eq!(item.count, 3);

        let temp = w.temp().unwrap().to_path_buf();
        let files = ItemFiles {
            height,
            items: w.items.values().cloned().collect(),
        };
        fs::write(temp.join(ITEM_FILES_NAME), serde_json::to_vec(&files).unwrap()).unwrap();
        let target = dir.path().join(height_directory(height));
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::rename(&temp, &target).unwrap();
        w.temp = None;

        let r = LocalFsReader::new(dir.path(), height).unwrap();
        match r.read(BlockMapItemType::StatesTree).unwrap() {
            BlockItem::StatesTree(t) => assert_eq!(t, tree()),
            other => panic!("unexpected item {other:?}"),
        }

        let path = target.join(BlockMapItemType::StatesTree.file_name());
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0x01;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            r.read(BlockMapItemType::StatesTree),
            Err(BlockError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unknown_hints_and_compression_are_rejected() {
        let hints = HintTable::new();
        let bad = b"# {\"writer\":\"other-writer-v0.0.1\",\"encoder\":\"json-encoder-v0.0.1\",\"type\":\"states\",\"count\":0}\n";
        assert!(parse_item_file(bad, &hints).is_err());
        assert!(parse_item_file(b"no header", &hints).is_err());

        let dir = TempDir::new().unwrap();
        let height = Height::new(1);
        let target = dir.path().join(height_directory(height));
        fs::create_dir_all(&target).unwrap();
        let files = ItemFiles {
            height,
            items: vec![ItemFile {
                item_type: BlockMapItemType::States,
                url: format!("{URL_SCHEME}states.ndjson"),
                checksum: checksum(b""),
                compress: "zz".to_string(),
            }],
        };
        fs::write(target.join(ITEM_FILES_NAME), serde_json::to_vec(&files).unwrap()).unwrap();

        let r = LocalFsReader::new(dir.path(), height).unwrap();
        assert!(matches!(
            r.raw(BlockMapItemType::States),
            Err(BlockError::UnknownCompression(_))
        ));
    }

    #[test]
    fn dropped_writer_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        {
            let mut w = LocalFsWriter::new(dir.path(), Height::new(2)).unwrap();
            w.write_item(&BlockItem::States(vec![])).unwrap();
        }
        let temp_root = dir.path().join(TEMP_DIR);
        assert_eq!(fs::read_dir(temp_root).unwrap().count(), 0);
        assert!(!dir.path().join(height_directory(Height::new(2))).exists());
    }
}
