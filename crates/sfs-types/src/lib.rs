#![forbid(unsafe_code)]
//! Shared newtypes, format constants and little-endian codec helpers for
//! SimpleFS images.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SFS_MAGIC: u32 = 0x4A5B;

/// Smallest accepted block size in bytes.
pub const MIN_BLOCK_SIZE: u32 = 1024;

/// Size of one inode record; block sizes must be a multiple of it.
pub const INODE_RECORD_SIZE: usize = 256;
/// Size of one directory entry record.
pub const DIR_ENTRY_SIZE: usize = 256;

/// Bytes reserved for a name inside an inode record.
pub const INODE_NAME_LEN: usize = 238;
/// Bytes reserved for a name inside a directory entry record.
pub const DIR_ENTRY_NAME_LEN: usize = 248;
/// Longest usable name: one byte of the inode name field stays NUL.
pub const MAX_NAME_LEN: usize = INODE_NAME_LEN - 1;

/// Trailing `next` pointer stored in every data block.
pub const BLOCK_POINTER_SIZE: usize = 8;

/// Encoded superblock length (all fields, rest of block 0 is zero).
pub const SUPERBLOCK_LEN: usize = 0x50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

impl BlockNumber {
    /// End-of-chain / "no block" sentinel. Block 0 is always the superblock,
    /// so it can never be part of a data chain.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Byte offset of this block for a given block size.
    #[must_use]
    pub fn to_byte_offset(self, block_size: u32) -> Option<ByteOffset> {
        self.0.checked_mul(u64::from(block_size)).map(ByteOffset)
    }
}

impl InodeNumber {
    /// The root directory.
    pub const ROOT: Self = Self(0);
    /// Hidden anchor file carrying the directory-mutation counter block.
    pub const ANCHOR: Self = Self(1);

    /// First slot available to user files and directories.
    pub const FIRST_FREE: Self = Self(2);

    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 < Self::FIRST_FREE.0
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    let actual = data.len().saturating_sub(offset);
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Copy `name` into a fixed NUL-padded field, leaving at least one NUL.
pub fn write_nul_padded(
    data: &mut [u8],
    offset: usize,
    field_len: usize,
    name: &[u8],
) -> Result<(), ParseError> {
    if name.len() >= field_len {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "does not fit NUL-padded field",
        });
    }
    let field = ensure_slice_mut(data, offset, field_len)?;
    field.fill(0);
    field[..name.len()].copy_from_slice(name);
    Ok(())
}

/// Bytes of a NUL-padded field up to (not including) the first NUL.
#[must_use]
pub fn nul_terminated(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    String::from_utf8_lossy(nul_terminated(bytes)).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
    }

    #[test]
    fn test_read_past_end() {
        let bytes = [0_u8; 6];
        assert_eq!(
            read_le_u64(&bytes, 0),
            Err(ParseError::InsufficientData {
                needed: 8,
                offset: 0,
                actual: 6
            })
        );
        assert!(read_le_u32(&bytes, usize::MAX).is_err());
    }

    #[test]
    fn test_write_helpers() {
        let mut buf = [0_u8; 12];
        write_le_u32(&mut buf, 0, 0x4A5B).expect("u32");
        write_le_u64(&mut buf, 4, 7).expect("u64");
        assert_eq!(&buf[..4], &[0x5B, 0x4A, 0, 0]);
        assert_eq!(read_le_u64(&buf, 4).expect("u64"), 7);
        assert!(write_le_u64(&mut buf, 8, 1).is_err());
    }

    #[test]
    fn test_nul_padded_names() {
        let mut field = [0xAA_u8; 16];
        write_nul_padded(&mut field, 0, 16, b"notes").expect("fits");
        assert_eq!(trim_nul_padded(&field), "notes");
        assert!(field[5..].iter().all(|b| *b == 0));

        let err = write_nul_padded(&mut field, 0, 16, &[b'x'; 16]);
        assert!(err.is_err());
    }

    #[test]
    fn test_inode_constants() {
        assert_eq!(InodeNumber::ROOT, InodeNumber(0));
        assert_eq!(InodeNumber::ANCHOR, InodeNumber(1));
        assert!(InodeNumber::ANCHOR.is_reserved());
        assert!(!InodeNumber(2).is_reserved());
        assert_eq!(MAX_NAME_LEN, 237);
    }

    #[test]
    fn test_block_number_offsets() {
        assert!(BlockNumber::NONE.is_none());
        assert_eq!(
            BlockNumber(3).to_byte_offset(4096),
            Some(ByteOffset(12_288))
        );
        assert_eq!(BlockNumber(u64::MAX).to_byte_offset(4096), None);
    }

    #[test]
    fn test_byte_offset_checked_ops() {
        assert_eq!(ByteOffset(10).checked_add(5), Some(ByteOffset(15)));
        assert_eq!(ByteOffset(u64::MAX).checked_add(1), None);
        assert_eq!(ByteOffset(17).to_usize(), Ok(17));
    }
}
