//! Fixed-size record codecs: superblock, inode, directory entry.

use crate::layout::Layout;
use serde::{Deserialize, Serialize};
use sfs_types::{
    BlockNumber, DIR_ENTRY_NAME_LEN, DIR_ENTRY_SIZE, INODE_NAME_LEN, INODE_RECORD_SIZE,
    InodeNumber, ParseError, SFS_MAGIC, SUPERBLOCK_LEN, ensure_slice, nul_terminated, read_le_u32,
    read_le_u64, trim_nul_padded, write_le_u32, write_le_u64, write_nul_padded,
};

// ── Superblock ──────────────────────────────────────────────────────────────

pub const SB_MAGIC: usize = 0x00;
pub const SB_BLOCK_SIZE: usize = 0x04;
pub const SB_NUMBER_OF_BLOCKS: usize = 0x08;
pub const SB_FREE_BLOCKS: usize = 0x10;
/// Allocation cursor; this 8-byte range doubles as the free-cursor lock.
pub const SB_NEXT_FREE_BLOCK: usize = 0x18;
pub const SB_BITMAP_BLOCKS: usize = 0x20;
pub const SB_INODE_TABLE_BLOCKS: usize = 0x28;
pub const SB_DATA_START: usize = 0x30;
pub const SB_FIRST_INODE_TABLE_BLOCK: usize = 0x38;
pub const SB_NEXT_FREE_INODE: usize = 0x40;
pub const SB_INODE_COUNT: usize = 0x48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    pub block_size: u32,
    pub number_of_blocks: u64,
    pub free_blocks: u64,
    pub next_free_block: u64,
    pub bitmap_blocks: u64,
    pub inode_table_blocks: u64,
    pub data_start: u64,
    pub first_inode_table_block: u64,
    pub next_free_inode: u64,
    pub inode_count: u64,
}

impl Superblock {
    /// Superblock of a freshly formatted image: only the anchor block is in
    /// use and inodes 0 and 1 are taken.
    #[must_use]
    pub fn fresh(layout: &Layout) -> Self {
        let next_free_block = if layout.number_of_blocks > 1 { 1 } else { 0 };
        let next_free_inode = if layout.inode_count > InodeNumber::FIRST_FREE.0 {
            InodeNumber::FIRST_FREE.0
        } else {
            0
        };
        Self {
            magic: SFS_MAGIC,
            block_size: layout.block_size,
            number_of_blocks: layout.number_of_blocks,
            free_blocks: layout.number_of_blocks - 1,
            next_free_block,
            bitmap_blocks: layout.bitmap_blocks,
            inode_table_blocks: layout.inode_table_blocks,
            data_start: layout.data_start,
            first_inode_table_block: layout.first_inode_table_block,
            next_free_inode,
            inode_count: layout.inode_count,
        }
    }

    /// Parse the superblock. The magic is checked before any other field.
    pub fn parse_from_bytes(region: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(region, SB_MAGIC)?;
        if magic != SFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SFS_MAGIC),
                actual: u64::from(magic),
            });
        }
        ensure_slice(region, 0, SUPERBLOCK_LEN)?;

        Ok(Self {
            magic,
            block_size: read_le_u32(region, SB_BLOCK_SIZE)?,
            number_of_blocks: read_le_u64(region, SB_NUMBER_OF_BLOCKS)?,
            free_blocks: read_le_u64(region, SB_FREE_BLOCKS)?,
            next_free_block: read_le_u64(region, SB_NEXT_FREE_BLOCK)?,
            bitmap_blocks: read_le_u64(region, SB_BITMAP_BLOCKS)?,
            inode_table_blocks: read_le_u64(region, SB_INODE_TABLE_BLOCKS)?,
            data_start: read_le_u64(region, SB_DATA_START)?,
            first_inode_table_block: read_le_u64(region, SB_FIRST_INODE_TABLE_BLOCK)?,
            next_free_inode: read_le_u64(region, SB_NEXT_FREE_INODE)?,
            inode_count: read_le_u64(region, SB_INODE_COUNT)?,
        })
    }

    pub fn write_to_bytes(&self, region: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(region, SB_MAGIC, self.magic)?;
        write_le_u32(region, SB_BLOCK_SIZE, self.block_size)?;
        write_le_u64(region, SB_NUMBER_OF_BLOCKS, self.number_of_blocks)?;
        write_le_u64(region, SB_FREE_BLOCKS, self.free_blocks)?;
        write_le_u64(region, SB_NEXT_FREE_BLOCK, self.next_free_block)?;
        write_le_u64(region, SB_BITMAP_BLOCKS, self.bitmap_blocks)?;
        write_le_u64(region, SB_INODE_TABLE_BLOCKS, self.inode_table_blocks)?;
        write_le_u64(region, SB_DATA_START, self.data_start)?;
        write_le_u64(region, SB_FIRST_INODE_TABLE_BLOCK, self.first_inode_table_block)?;
        write_le_u64(region, SB_NEXT_FREE_INODE, self.next_free_inode)?;
        write_le_u64(region, SB_INODE_COUNT, self.inode_count)
    }

    /// Check that the stored geometry is exactly what `layout` derives.
    pub fn validate_geometry(&self, layout: &Layout) -> Result<(), ParseError> {
        let checks: [(&'static str, u64, u64); 5] = [
            ("bitmap_blocks", self.bitmap_blocks, layout.bitmap_blocks),
            (
                "inode_table_blocks",
                self.inode_table_blocks,
                layout.inode_table_blocks,
            ),
            ("data_start", self.data_start, layout.data_start),
            (
                "first_inode_table_block",
                self.first_inode_table_block,
                layout.first_inode_table_block,
            ),
            ("inode_count", self.inode_count, layout.inode_count),
        ];
        for (field, stored, derived) in checks {
            if stored != derived {
                return Err(ParseError::InvalidField {
                    field,
                    reason: "does not match geometry derived from block size and count",
                });
            }
        }
        if self.free_blocks >= self.number_of_blocks {
            return Err(ParseError::InvalidField {
                field: "free_blocks",
                reason: "exceeds usable data blocks",
            });
        }
        if self.next_free_inode >= self.inode_count {
            return Err(ParseError::InvalidField {
                field: "next_free_inode",
                reason: "outside inode table",
            });
        }
        Ok(())
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

const INODE_KIND_OFFSET: usize = INODE_NAME_LEN;
const INODE_GENERATION_OFFSET: usize = INODE_KIND_OFFSET + 1;
const INODE_SIZE_OFFSET: usize = 240;
const INODE_FIRST_BLOCK_OFFSET: usize = 248;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeKind {
    Empty,
    Directory,
    File,
}

impl InodeKind {
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::Directory => b'D',
            Self::File => b'F',
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Empty),
            b'D' => Ok(Self::Directory),
            b'F' => Ok(Self::File),
            _ => Err(ParseError::InvalidField {
                field: "inode_kind",
                reason: "expected 0, 'D' or 'F'",
            }),
        }
    }
}

/// One 256-byte inode table record.
///
/// `generation` is bumped every time the slot is emptied, so a slot that is
/// reused for a new file is distinguishable from the file that held it
/// before. It wraps at 256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub name: String,
    pub kind: InodeKind,
    pub generation: u8,
    pub size: u64,
    pub first_block: BlockNumber,
}

impl Inode {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            kind: InodeKind::Empty,
            generation: 0,
            size: 0,
            first_block: BlockNumber::NONE,
        }
    }

    #[must_use]
    pub fn new(name: &str, kind: InodeKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            generation: 0,
            size: 0,
            first_block: BlockNumber::NONE,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    #[must_use]
    pub fn is_empty_slot(&self) -> bool {
        self.kind == InodeKind::Empty
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let record = ensure_slice(bytes, 0, INODE_RECORD_SIZE)?;
        Ok(Self {
            name: trim_nul_padded(&record[..INODE_NAME_LEN]),
            kind: InodeKind::from_raw(record[INODE_KIND_OFFSET])?,
            generation: record[INODE_GENERATION_OFFSET],
            size: read_le_u64(record, INODE_SIZE_OFFSET)?,
            first_block: BlockNumber(read_le_u64(record, INODE_FIRST_BLOCK_OFFSET)?),
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; INODE_RECORD_SIZE], ParseError> {
        let mut record = [0_u8; INODE_RECORD_SIZE];
        write_nul_padded(&mut record, 0, INODE_NAME_LEN, self.name.as_bytes())?;
        record[INODE_KIND_OFFSET] = self.kind.to_raw();
        record[INODE_GENERATION_OFFSET] = self.generation;
        write_le_u64(&mut record, INODE_SIZE_OFFSET, self.size)?;
        write_le_u64(&mut record, INODE_FIRST_BLOCK_OFFSET, self.first_block.0)?;
        Ok(record)
    }
}

// ── Directory entry ─────────────────────────────────────────────────────────

const DIR_ENTRY_INO_OFFSET: usize = DIR_ENTRY_NAME_LEN;

/// One 256-byte directory entry: NUL-padded name plus inode number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryRecord {
    pub name: String,
    pub ino: InodeNumber,
}

impl DirEntryRecord {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let record = ensure_slice(bytes, 0, DIR_ENTRY_SIZE)?;
        Ok(Self {
            name: trim_nul_padded(&record[..DIR_ENTRY_NAME_LEN]),
            ino: InodeNumber(read_le_u64(record, DIR_ENTRY_INO_OFFSET)?),
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; DIR_ENTRY_SIZE], ParseError> {
        let mut record = [0_u8; DIR_ENTRY_SIZE];
        write_nul_padded(&mut record, 0, DIR_ENTRY_NAME_LEN, self.name.as_bytes())?;
        write_le_u64(&mut record, DIR_ENTRY_INO_OFFSET, self.ino.0)?;
        Ok(record)
    }

    /// Compare a raw record's name against `name` without allocating.
    #[must_use]
    pub fn raw_name_eq(record: &[u8], name: &str) -> bool {
        record
            .get(..DIR_ENTRY_NAME_LEN)
            .is_some_and(|field| nul_terminated(field) == name.as_bytes())
    }
}
