//! Reads committed blocks back from the local item files.

use super::localfs::LocalFsReader;
use super::{BlockError, BlockItem, BlockMap, BlockMapItemType};
use crate::base::Height;
use std::io::Cursor;
use std::path::Path;

/// Read-only view of one committed block; safe to share once built.
pub struct BlockReader {
    files: LocalFsReader,
    blockmap: BlockMap,
}

impl BlockReader {
    pub fn open(root: &Path, height: Height) -> Result<Self, BlockError> {
        let files = LocalFsReader::new(root, height)?;
        let blockmap = files.blockmap()?;
        if blockmap.height() != height {
            return Err(BlockError::Invalid(format!(
                "block map of {} stored at {height}",
                blockmap.height()
            )));
        }
        Ok(BlockReader { files, blockmap })
    }

    pub fn blockmap(&self) -> &BlockMap {
        &self.blockmap
    }

    /// Verified body of an item as a stream of bytes.
    pub fn reader(&self, item_type: BlockMapItemType) -> Result<Cursor<Vec<u8>>, BlockError> {
        self.check_listed(item_type)?;
        Ok(Cursor::new(self.files.body(item_type)?))
    }

    /// The whole item file as served to peers.
    pub fn raw(&self, item_type: BlockMapItemType) -> Result<Vec<u8>, BlockError> {
        self.check_listed(item_type)?;
        self.files.raw(item_type)
    }

    pub fn item(&self, item_type: BlockMapItemType) -> Result<BlockItem, BlockError> {
        self.check_listed(item_type)?;
        self.files.read(item_type)
    }

    /// Decodes every item in type order; the callback returns false to stop.
    pub fn items<F>(&self, mut f: F) -> Result<(), BlockError>
    where
        F: FnMut(BlockItem) -> Result<bool, BlockError>,
    {
        for t in BlockMapItemType::ALL {
            if !f(self.item(t)?)? {
                break;
            }
        }
        Ok(())
    }

    fn check_listed(&self, item_type: BlockMapItemType) -> Result<(), BlockError> {
        let item = self.blockmap.item(item_type).ok_or(BlockError::MissingItem(item_type))?;
        let file = self
            .files
            .item_files()
            .item(item_type)
            .ok_or(BlockError::MissingItem(item_type))?;
        if item.checksum != file.checksum {
            return Err(BlockError::ChecksumMismatch {
                item: item_type,
                expected: item.checksum.clone(),
                found: file.checksum.clone(),
            });
        }
        Ok(())
    }
}
