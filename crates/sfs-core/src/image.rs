//! Image lifecycle, namespace operations and introspection.

use crate::handles::{OpenFile, OpenFileTable};
use crate::{AccessMode, DirEntry, FileHandle, FileKind, FileStat, FormatOptions, Statfs};
use parking_lot::Mutex;
use sfs_block::format::format_image;
use sfs_block::{BlockStore, ByteDevice, FileByteDevice, LockKind};
use sfs_error::{Result, SfsError};
use sfs_lock::{DirGuard, DirMutex};
use sfs_ondisk::records::{SB_FREE_BLOCKS, SB_NEXT_FREE_BLOCK, SB_NEXT_FREE_INODE};
use sfs_ondisk::{Inode, Layout, Superblock, parse_to_format};
use sfs_types::{ByteOffset, InodeNumber, SUPERBLOCK_LEN};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// An opened SimpleFS image.
///
/// All methods take `&self`. Operations on one `Image` are serialized by an
/// in-process mutex, because the advisory locks belong to the open file
/// description shared by all of its threads. Separate `Image`s on the same
/// path (or separate processes) run concurrently under the on-disk protocol.
pub struct Image {
    path: PathBuf,
    pub(crate) store: BlockStore,
    pub(crate) files: Mutex<OpenFileTable>,
    pub(crate) op_lock: Mutex<()>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("layout", self.store.layout())
            .field("open_files", &self.files.lock().len())
            .finish_non_exhaustive()
    }
}

impl Image {
    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Create and format a new image at `path`.
    pub fn init(path: impl AsRef<Path>, block_size: u32, block_count: u64) -> Result<()> {
        Self::init_with(
            path,
            &FormatOptions {
                block_size,
                block_count,
            },
        )
    }

    /// Create and format a new image with explicit options. Fails with
    /// `FileAlreadyExists` if `path` exists; a partially written file is
    /// removed again.
    pub fn init_with(path: impl AsRef<Path>, options: &FormatOptions) -> Result<()> {
        let path = path.as_ref();
        let layout = Layout::compute(options.block_size, options.block_count)?;
        let dev = FileByteDevice::create_new(path, layout.image_len())?;
        let formatted =
            BlockStore::new(Box::new(dev), layout).and_then(|store| format_image(&store));
        if let Err(err) = formatted {
            if let Err(cleanup) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %cleanup, "failed to remove half-written image");
            }
            return Err(err);
        }
        info!(
            path = %path.display(),
            block_size = layout.block_size,
            blocks = layout.number_of_blocks,
            inodes = layout.inode_count,
            "initialized image"
        );
        Ok(())
    }

    /// Open an existing image read-write.
    ///
    /// Nothing is written when the magic number or geometry is wrong.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dev = FileByteDevice::open(path)?;
        if dev.len_bytes() < SUPERBLOCK_LEN as u64 {
            return Err(SfsError::Format(format!(
                "{} is too short to hold a superblock",
                path.display()
            )));
        }
        let mut region = [0_u8; SUPERBLOCK_LEN];
        dev.read_exact_at(ByteOffset::ZERO, &mut region)?;
        let sb = Superblock::parse_from_bytes(&region).map_err(|err| parse_to_format(&err))?;
        let layout = Layout::compute(sb.block_size, sb.number_of_blocks)?;
        sb.validate_geometry(&layout)
            .map_err(|err| parse_to_format(&err))?;
        let store = BlockStore::new(Box::new(dev), layout)?;

        info!(
            path = %path.display(),
            block_size = layout.block_size,
            blocks = layout.number_of_blocks,
            free = sb.free_blocks,
            "opened image"
        );
        Ok(Self {
            path: path.to_owned(),
            store,
            files: Mutex::new(OpenFileTable::default()),
            op_lock: Mutex::new(()),
        })
    }

    /// Flush and drop the image. Handles still open are discarded; their
    /// count is returned.
    pub fn close(self) -> Result<usize> {
        let _op = self.op_lock.lock();
        let open = self.files.lock().len();
        if open > 0 {
            warn!(path = %self.path.display(), open, "closing image with open handles");
        }
        self.store.sync()?;
        info!(path = %self.path.display(), "closed image");
        Ok(open)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        self.store.layout()
    }

    pub(crate) fn dir_lock(&self, kind: LockKind) -> Result<DirGuard<'_>> {
        DirMutex::new(&self.store)?.lock(kind)
    }

    // ── Namespace ───────────────────────────────────────────────────────

    pub fn create(&self, path: &str, kind: FileKind) -> Result<()> {
        let _op = self.op_lock.lock();
        sfs_dir::create(&self.store, path, kind.into())?;
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.create(path, FileKind::Directory)
    }

    /// Remove a file or an empty directory.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let _op = self.op_lock.lock();
        sfs_dir::remove(&self.store, path)
    }

    /// Open a regular file. The new handle starts at offset 0.
    pub fn open_file(&self, path: &str, mode: AccessMode) -> Result<FileHandle> {
        let _op = self.op_lock.lock();
        let (inode, ino) = {
            let _dir = self.dir_lock(LockKind::Shared)?;
            sfs_dir::resolve(&self.store, path)?
        };
        if inode.is_dir() {
            return Err(SfsError::IsDirectory);
        }
        let handle = self.files.lock().insert(OpenFile {
            ino,
            generation: inode.generation,
            name: inode.name,
            offset: 0,
            mode,
        })?;
        debug!(path, ino = ino.0, %handle, ?mode, "opened file");
        Ok(handle)
    }

    pub fn close_file(&self, handle: FileHandle) -> Result<()> {
        let _op = self.op_lock.lock();
        let file = self.files.lock().remove(handle)?;
        debug!(%handle, ino = file.ino.0, "closed file");
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let _op = self.op_lock.lock();
        let _dir = self.dir_lock(LockKind::Shared)?;
        let (inode, ino) = sfs_dir::resolve(&self.store, path)?;
        self.stat_inode(ino, inode)
    }

    /// Entries of the directory at `path`, in storage order.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let _op = self.op_lock.lock();
        let _dir = self.dir_lock(LockKind::Shared)?;
        let (inode, ino) = sfs_dir::resolve(&self.store, path)?;
        if !inode.is_dir() {
            return Err(SfsError::NotDirectory);
        }
        sfs_dir::list(&self.store, ino)?
            .into_iter()
            .map(|entry| {
                let child = sfs_inode::get(&self.store, entry.ino)?;
                let kind = FileKind::from_inode(child.kind).ok_or_else(|| {
                    SfsError::corruption(
                        self.store.layout().inode_block(entry.ino).0,
                        format!("entry {:?} points at empty inode {}", entry.name, entry.ino),
                    )
                })?;
                Ok(DirEntry {
                    name: entry.name,
                    ino: entry.ino,
                    kind,
                    size: child.size,
                })
            })
            .collect()
    }

    pub fn statfs(&self) -> Result<Statfs> {
        let _op = self.op_lock.lock();
        // Sampled before taking the mutex so this call is not counted.
        let dir_mutex_holders = DirMutex::new(&self.store)?.holders()?;
        let _dir = self.dir_lock(LockKind::Shared)?;
        let layout = *self.store.layout();
        let live = sfs_inode::live_inodes(&self.store)?.len() as u64;
        Ok(Statfs {
            block_size: layout.block_size,
            total_blocks: layout.number_of_blocks,
            free_blocks: self.store.read_sb_u64(SB_FREE_BLOCKS)?,
            data_start: layout.data_start,
            inode_count: layout.inode_count,
            free_inodes: layout.inode_count - live,
            next_free_block: self.store.read_sb_u64(SB_NEXT_FREE_BLOCK)?,
            next_free_inode: self.store.read_sb_u64(SB_NEXT_FREE_INODE)?,
            dir_mutex_holders,
        })
    }

    fn stat_inode(&self, ino: InodeNumber, inode: Inode) -> Result<FileStat> {
        let kind = FileKind::from_inode(inode.kind).ok_or_else(|| {
            SfsError::corruption(
                self.store.layout().inode_block(ino).0,
                format!("inode {ino} is empty"),
            )
        })?;
        let blocks = self.store.chain(inode.first_block)?.len() as u64;
        Ok(FileStat {
            ino,
            name: inode.name,
            kind,
            size: inode.size,
            blocks,
        })
    }
}
