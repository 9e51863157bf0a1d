#![forbid(unsafe_code)]
//! On-disk format of SimpleFS images.
//!
//! Pure codec crate: no I/O, no side effects. Computes the image geometry
//! and encodes/decodes the superblock, inode and directory entry records.

pub mod layout;
pub mod path;
pub mod records;

pub use layout::Layout;
pub use records::{DirEntryRecord, Inode, InodeKind, Superblock};

use sfs_error::SfsError;
use sfs_types::ParseError;

/// Convert a parse failure while reading live metadata into `Corruption`.
#[must_use]
pub fn parse_to_corruption(block: u64, err: &ParseError) -> SfsError {
    SfsError::Corruption {
        block,
        detail: err.to_string(),
    }
}

/// Convert a parse failure while opening an image. A wrong magic number is
/// `BadMagicNumber`; anything else is a `Format` error.
#[must_use]
pub fn parse_to_format(err: &ParseError) -> SfsError {
    match err {
        ParseError::InvalidMagic { actual, .. } => SfsError::BadMagicNumber {
            found: u32::try_from(*actual).unwrap_or(u32::MAX),
        },
        other => SfsError::Format(other.to_string()),
    }
}
