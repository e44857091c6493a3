//! Region math for the on-disk layout.
//!
//! Every parameter derives from the backing-file size plus the fixed crate
//! defaults, so no superblock is needed:
//!
//! ```text
//! [ 0 .. bitmap_blocks )      free-block bitmap, one bit per block
//! [ .. + inode_table_blocks ) inode table, 32 records per block
//! [ data_start .. N )         data blocks
//! ```

use crate::error::{FsError, FsResult};
use crate::fs::{BLOCK_SIZE, INODES_PER_BLOCK, INODE_CAPACITY, INODE_SIZE};

/// Blocks needed to hold one bit per block for `total_blocks` blocks.
pub const fn bitmap_blocks(total_blocks: u32) -> u32 {
    total_blocks.div_ceil(8 * BLOCK_SIZE as u32)
}

/// Blocks needed to hold the full inode table.
pub const fn inode_table_blocks() -> u32 {
    ((INODE_CAPACITY * INODE_SIZE) / BLOCK_SIZE) as u32
}

/// Fixed block positions for one mounted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub total_blocks: u32,
    pub bitmap_blocks: u32,
    pub inode_table_start: u32,
    pub inode_table_blocks: u32,
    /// First data block; everything below it is metadata.
    pub data_start: u32,
}

impl Layout {
    /// Derive the layout for an image of `total_blocks` blocks.
    ///
    /// Fails with [`FsError::Corruption`] when the image cannot hold the
    /// metadata region plus at least one data block.
    pub fn for_total_blocks(total_blocks: u32) -> FsResult<Self> {
        let bitmap_blocks = bitmap_blocks(total_blocks);
        let inode_table_start = bitmap_blocks;
        let inode_table_blocks = inode_table_blocks();
        let data_start = inode_table_start + inode_table_blocks;
        if total_blocks <= data_start {
            return Err(FsError::Corruption(format!(
                "image of {total_blocks} blocks cannot hold {data_start} metadata blocks and data"
            )));
        }
        Ok(Layout {
            total_blocks,
            bitmap_blocks,
            inode_table_start,
            inode_table_blocks,
            data_start,
        })
    }

    /// Block index and byte offset of the record for inode `id`.
    pub fn inode_position(&self, id: u32) -> (u32, usize) {
        debug_assert!((id as usize) < INODE_CAPACITY);
        let block = self.inode_table_start + id / INODES_PER_BLOCK as u32;
        let offset = (id as usize % INODES_PER_BLOCK) * INODE_SIZE;
        (block, offset)
    }

    /// Number of permanently reserved metadata blocks.
    pub fn metadata_blocks(&self) -> u32 {
        self.data_start
    }

    /// Whether `idx` lies inside the data region.
    pub fn is_data_block(&self, idx: u32) -> bool {
        idx >= self.data_start && idx < self.total_blocks
    }
}
