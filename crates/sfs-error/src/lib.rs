#![forbid(unsafe_code)]
//! Error types for SimpleFS.
//!
//! # Error Taxonomy
//!
//! SimpleFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `sfs-types` | Byte-level record violations |
//! | Runtime | `SfsError` | `sfs-error` (this crate) | Errors returned by the library and CLI |
//!
//! `sfs-error` does not depend on `sfs-types`. Parse failures are converted in
//! `sfs-ondisk`: while opening an image they become `Format` (or
//! `BadMagicNumber`), while reading live records they become `Corruption` with
//! the offending block number.
//!
//! ## errno Mapping
//!
//! Every `SfsError` variant maps to exactly one POSIX errno via
//! [`SfsError::to_errno`]. The match is exhaustive so a new variant does not
//! compile until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `BlockSizeTooSmall` / `WrongBlockSize` / `NumberOfBlocksZero` | `EINVAL` |
//! | `HostAccess` | raw OS error or `EACCES` |
//! | `FileAlreadyExists` | `EEXIST` |
//! | `BadMagicNumber` | `EINVAL` |
//! | `FileDoesntExist` / `DirDoesntExist` / `ParentDirDoesntExist` | `ENOENT` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `InvalidPath` | `EINVAL` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NoFreeBlocks` / `NoFreeInodes` | `ENOSPC` |
//! | `DirNotEmpty` | `ENOTEMPTY` |
//! | `WrongMode` / `UnknownDescriptor` | `EBADF` |

use thiserror::Error;

/// Unified error type for all SimpleFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    /// Operating system I/O error on the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image metadata is inconsistent at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The backing file is not a usable image (wrong length, geometry mismatch).
    #[error("invalid image format: {0}")]
    Format(String),

    #[error("block size {0} is below the 1024-byte minimum")]
    BlockSizeTooSmall(u32),

    #[error("block size {0} is not a multiple of the 256-byte inode record")]
    WrongBlockSize(u32),

    #[error("number of blocks must be greater than zero")]
    NumberOfBlocksZero,

    /// The host file could not be created or opened.
    #[error("cannot access host file {path}: {source}")]
    HostAccess {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Target already exists (image file, file or directory entry).
    #[error("file already exists")]
    FileAlreadyExists,

    /// Block 0 does not start with the SimpleFS magic number.
    #[error("bad magic number {found:#x}")]
    BadMagicNumber { found: u32 },

    #[error("no such file: {0}")]
    FileDoesntExist(String),

    /// Parent directory of a new file is missing.
    #[error("no such directory: {0}")]
    DirDoesntExist(String),

    /// Parent directory of a new directory is missing.
    #[error("parent directory does not exist: {0}")]
    ParentDirDoesntExist(String),

    #[error("name too long")]
    NameTooLong,

    /// Relative path, `.`/`..` component, or an operation on `/` that needs a child.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("no free blocks")]
    NoFreeBlocks,

    #[error("no free inodes")]
    NoFreeInodes,

    #[error("directory not empty")]
    DirNotEmpty,

    /// Read on a write-only handle or write on a read-only handle.
    #[error("handle not opened for this operation")]
    WrongMode,

    #[error("unknown file descriptor {0}")]
    UnknownDescriptor(u32),
}

impl SfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_)
            | Self::BlockSizeTooSmall(_)
            | Self::WrongBlockSize(_)
            | Self::NumberOfBlocksZero
            | Self::BadMagicNumber { .. }
            | Self::InvalidPath(_) => libc::EINVAL,
            Self::HostAccess { source, .. } => source.raw_os_error().unwrap_or(libc::EACCES),
            Self::FileAlreadyExists => libc::EEXIST,
            Self::FileDoesntExist(_) | Self::DirDoesntExist(_) | Self::ParentDirDoesntExist(_) => {
                libc::ENOENT
            }
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NoFreeBlocks | Self::NoFreeInodes => libc::ENOSPC,
            Self::DirNotEmpty => libc::ENOTEMPTY,
            Self::WrongMode | Self::UnknownDescriptor(_) => libc::EBADF,
        }
    }

    /// Shorthand for a `Corruption` error at `block`.
    #[must_use]
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(SfsError, libc::c_int)> = vec![
            (SfsError::Io(std::io::Error::other("test")), libc::EIO),
            (SfsError::corruption(0, "test"), libc::EIO),
            (SfsError::Format("test".into()), libc::EINVAL),
            (SfsError::BlockSizeTooSmall(512), libc::EINVAL),
            (SfsError::WrongBlockSize(1000), libc::EINVAL),
            (SfsError::NumberOfBlocksZero, libc::EINVAL),
            (
                SfsError::HostAccess {
                    path: "/nope".into(),
                    source: std::io::Error::other("denied"),
                },
                libc::EACCES,
            ),
            (SfsError::FileAlreadyExists, libc::EEXIST),
            (SfsError::BadMagicNumber { found: 0 }, libc::EINVAL),
            (SfsError::FileDoesntExist("/a".into()), libc::ENOENT),
            (SfsError::DirDoesntExist("/a".into()), libc::ENOENT),
            (SfsError::ParentDirDoesntExist("/a".into()), libc::ENOENT),
            (SfsError::NameTooLong, libc::ENAMETOOLONG),
            (SfsError::InvalidPath("..".into()), libc::EINVAL),
            (SfsError::NotDirectory, libc::ENOTDIR),
            (SfsError::IsDirectory, libc::EISDIR),
            (SfsError::NoFreeBlocks, libc::ENOSPC),
            (SfsError::NoFreeInodes, libc::ENOSPC),
            (SfsError::DirNotEmpty, libc::ENOTEMPTY),
            (SfsError::WrongMode, libc::EBADF),
            (SfsError::UnknownDescriptor(3), libc::EBADF),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(SfsError::Io(raw).to_errno(), libc::EPERM);

        let host = SfsError::HostAccess {
            path: "/ro/img".into(),
            source: std::io::Error::from_raw_os_error(libc::EROFS),
        };
        assert_eq!(host.to_errno(), libc::EROFS);
    }

    #[test]
    fn display_formatting() {
        let err = SfsError::corruption(42, "double free");
        assert_eq!(err.to_string(), "corrupt metadata at block 42: double free");

        let magic = SfsError::BadMagicNumber { found: 0xEF53 };
        assert_eq!(magic.to_string(), "bad magic number 0xef53");

        assert_eq!(
            SfsError::UnknownDescriptor(7).to_string(),
            "unknown file descriptor 7"
        );
        assert_eq!(
            SfsError::BlockSizeTooSmall(512).to_string(),
            "block size 512 is below the 1024-byte minimum"
        );
    }
}
