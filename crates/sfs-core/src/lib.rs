#![forbid(unsafe_code)]
//! SimpleFS image engine.
//!
//! [`Image`] is the explicit context for one opened backing file. Every
//! operation goes straight to the file and coordinates with other processes
//! (and other `Image`s in this process) through advisory byte-range locks:
//!
//! - `create`/`mkdir`/`unlink` hold the directory mutex exclusively;
//! - lookups, reads and writes hold it shared, plus a record lock on the
//!   file's inode slot;
//! - allocation takes the free-cursor lock inside a single call.
//!
//! # Example
//!
//! ```no_run
//! use sfs_core::{AccessMode, FileKind, Image, Whence};
//!
//! Image::init("fs.img", 4096, 1024)?;
//! let image = Image::open("fs.img")?;
//! image.create("/hello.txt", FileKind::File)?;
//! let fh = image.open_file("/hello.txt", AccessMode::ReadWrite)?;
//! image.write(fh, b"hello")?;
//! image.seek(fh, Whence::Start(0))?;
//! let mut buf = [0_u8; 5];
//! assert_eq!(image.read(fh, &mut buf)?, 5);
//! image.close_file(fh)?;
//! image.close()?;
//! # Ok::<(), sfs_error::SfsError>(())
//! ```

mod check;
mod handles;
mod image;
mod io;

pub use image::Image;
pub use sfs_error::{Result, SfsError};

use serde::{Deserialize, Serialize};
use sfs_ondisk::InodeKind;
use sfs_types::InodeNumber;

/// Geometry for a new image.
///
/// Validated by [`sfs_ondisk::Layout::compute`] when the image is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Block size in bytes: at least 1024 and a multiple of 256.
    pub block_size: u32,
    /// Number of data blocks.
    pub block_count: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            block_count: 1024,
        }
    }
}

/// Kind of object to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
}

impl From<FileKind> for InodeKind {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::File => Self::File,
            FileKind::Directory => Self::Directory,
        }
    }
}

impl FileKind {
    fn from_inode(kind: InodeKind) -> Option<Self> {
        match kind {
            InodeKind::File => Some(Self::File),
            InodeKind::Directory => Some(Self::Directory),
            InodeKind::Empty => None,
        }
    }
}

/// How a file handle may be used.
///
/// Reads are allowed in every mode. `Append` writes always land at the
/// current end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Append,
}

impl AccessMode {
    #[must_use]
    pub fn can_write(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Seek origin and signed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    Start(i64),
    Current(i64),
    End(i64),
}

/// Process-local open-file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHandle(pub u32);

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata of one file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub ino: InodeNumber,
    pub name: String,
    pub kind: FileKind,
    /// Bytes (for directories: entries × 256).
    pub size: u64,
    /// Data blocks in the chain.
    pub blocks: u64,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub ino: InodeNumber,
    pub kind: FileKind,
    pub size: u64,
}

/// Image-wide usage summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statfs {
    pub block_size: u32,
    /// Data blocks, including the reserved anchor block.
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub data_start: u64,
    pub inode_count: u64,
    pub free_inodes: u64,
    pub next_free_block: u64,
    pub next_free_inode: u64,
    /// Processes or images currently inside the directory mutex.
    pub dir_mutex_holders: u64,
}

/// Result of [`Image::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    /// One line per violated invariant.
    pub errors: Vec<String>,
    /// Bitmap bits set (the reserved anchor bit included).
    pub allocated_blocks: u64,
    /// Free count recorded in the superblock.
    pub free_blocks: u64,
    /// Non-Empty inode slots (root and anchor included).
    pub live_inodes: u64,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_read_only_handles_refuse_writes() {
        assert!(!AccessMode::ReadOnly.can_write());
        assert!(AccessMode::WriteOnly.can_write());
        assert!(AccessMode::ReadWrite.can_write());
        assert!(AccessMode::Append.can_write());
    }

    #[test]
    fn format_options_default_and_serde() {
        let options = FormatOptions::default();
        assert_eq!((options.block_size, options.block_count), (4096, 1024));
        let json = serde_json::to_string(&options).expect("serialize");
        let parsed: FormatOptions = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, options);
    }

    #[test]
    fn file_kind_maps_to_inode_kind() {
        assert_eq!(InodeKind::from(FileKind::File), InodeKind::File);
        assert_eq!(InodeKind::from(FileKind::Directory), InodeKind::Directory);
        assert_eq!(FileKind::from_inode(InodeKind::Empty), None);
    }

    #[test]
    fn check_report_json_shape() {
        let report = CheckReport {
            errors: vec!["inode 3: linked 0 times, expected once".to_owned()],
            allocated_blocks: 2,
            free_blocks: 6,
            live_inodes: 3,
        };
        assert!(!report.is_clean());
        let value = serde_json::to_value(&report).expect("serialize");
        assert_eq!(value["allocated_blocks"], 2);
        assert_eq!(value["errors"][0], "inode 3: linked 0 times, expected once");
    }
}
