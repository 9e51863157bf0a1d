//! Image geometry.
//!
//! ```text
//! block 0            superblock
//! 1 ..               block bitmap        (bitmap_blocks)
//! ..                 inode table         (inode_table_blocks)
//! data_start ..      data blocks         (number_of_blocks)
//! ```

use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use sfs_types::{
    BLOCK_POINTER_SIZE, BlockNumber, ByteOffset, INODE_RECORD_SIZE, InodeNumber, MIN_BLOCK_SIZE,
};

/// Derived geometry of an image. Every field follows from `block_size` and
/// `number_of_blocks`; see [`Layout::compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub block_size: u32,
    /// Data blocks (bitmap bits).
    pub number_of_blocks: u64,
    pub bitmap_blocks: u64,
    pub inode_table_blocks: u64,
    pub first_inode_table_block: u64,
    pub data_start: u64,
    pub inode_count: u64,
}

impl Layout {
    pub fn compute(block_size: u32, number_of_blocks: u64) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(SfsError::BlockSizeTooSmall(block_size));
        }
        if block_size as usize % INODE_RECORD_SIZE != 0 {
            return Err(SfsError::WrongBlockSize(block_size));
        }
        if number_of_blocks == 0 {
            return Err(SfsError::NumberOfBlocksZero);
        }

        let bs = u64::from(block_size);
        if number_of_blocks.checked_mul(bs).is_none() {
            return Err(too_large(block_size, number_of_blocks));
        }
        let inodes_per_block = bs / INODE_RECORD_SIZE as u64;
        let bitmap_blocks = number_of_blocks.div_ceil(bs * 8);
        let inode_table_blocks = number_of_blocks.div_ceil(inodes_per_block);
        let first_inode_table_block = 1 + bitmap_blocks;
        let data_start = first_inode_table_block + inode_table_blocks;
        let layout = Self {
            block_size,
            number_of_blocks,
            bitmap_blocks,
            inode_table_blocks,
            first_inode_table_block,
            data_start,
            inode_count: inode_table_blocks * inodes_per_block,
        };
        // The whole image must be byte-addressable.
        if layout.total_blocks().checked_mul(bs).is_none() {
            return Err(too_large(block_size, number_of_blocks));
        }
        Ok(layout)
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.data_start.saturating_add(self.number_of_blocks)
    }

    /// Length of the backing file.
    #[must_use]
    pub fn image_len(&self) -> u64 {
        self.total_blocks()
            .saturating_mul(u64::from(self.block_size))
    }

    #[must_use]
    pub fn block_size_usize(&self) -> usize {
        self.block_size as usize
    }

    /// Usable bytes of a data block (the `next` pointer takes the rest).
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.block_size_usize() - BLOCK_POINTER_SIZE
    }

    /// Number of chained data blocks needed to hold `len` bytes.
    #[must_use]
    pub fn blocks_for_len(&self, len: u64) -> u64 {
        len.div_ceil(self.payload_size() as u64)
    }

    #[must_use]
    pub fn inodes_per_block(&self) -> u64 {
        u64::from(self.block_size) / INODE_RECORD_SIZE as u64
    }

    /// Byte offset of the start of block `block`, or `None` past the image.
    #[must_use]
    pub fn block_byte_offset(&self, block: BlockNumber) -> Option<ByteOffset> {
        if block.0 >= self.total_blocks() {
            return None;
        }
        block.to_byte_offset(self.block_size)
    }

    /// Byte offset of the bitmap (start of block 1).
    #[must_use]
    pub fn bitmap_offset(&self) -> ByteOffset {
        ByteOffset(u64::from(self.block_size))
    }

    /// Bytes of the bitmap that carry bits (the rest of the last bitmap block is padding).
    #[must_use]
    pub fn bitmap_len_bytes(&self) -> u64 {
        self.number_of_blocks.div_ceil(8)
    }

    /// Byte offset of inode record `ino`, or `None` outside the table.
    #[must_use]
    pub fn inode_offset(&self, ino: InodeNumber) -> Option<ByteOffset> {
        if ino.0 >= self.inode_count {
            return None;
        }
        let table = self.first_inode_table_block * u64::from(self.block_size);
        Some(ByteOffset(table + ino.0 * INODE_RECORD_SIZE as u64))
    }

    /// Block that holds inode record `ino` (for error reports).
    #[must_use]
    pub fn inode_block(&self, ino: InodeNumber) -> BlockNumber {
        BlockNumber(self.first_inode_table_block + ino.0 / self.inodes_per_block())
    }

    /// Absolute block for bitmap bit `bit`.
    #[must_use]
    pub fn data_block(&self, bit: u64) -> BlockNumber {
        BlockNumber(self.data_start + bit)
    }

    /// Bitmap bit for an absolute block, or `None` outside the data area.
    #[must_use]
    pub fn bit_of(&self, block: BlockNumber) -> Option<u64> {
        if block.0 < self.data_start || block.0 >= self.total_blocks() {
            return None;
        }
        Some(block.0 - self.data_start)
    }

    /// Data block reserved for the anchor file; its first 8 bytes hold the
    /// directory-mutation counter.
    #[must_use]
    pub fn anchor_block(&self) -> BlockNumber {
        BlockNumber(self.data_start)
    }
}

fn too_large(block_size: u32, number_of_blocks: u64) -> SfsError {
    SfsError::Format(format!(
        "{number_of_blocks} blocks of {block_size} bytes overflow the address space"
    ))
}
