//! Handle-based file I/O.

use crate::handles::OpenFile;
use crate::{AccessMode, FileHandle, Image, Whence};
use sfs_alloc::{grow_chain, shrink_chain};
use sfs_block::LockKind;
use sfs_error::{Result, SfsError};
use sfs_lock::lock_inode;
use sfs_ondisk::{Inode, InodeKind};
use sfs_types::BlockNumber;
use tracing::{debug, trace};

impl Image {
    /// Read up to `buf.len()` bytes at the handle's offset. Returns 0 at end
    /// of file; short reads are not errors.
    pub fn read(&self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let _op = self.op_lock.lock();
        let file = self.open_file_state(handle)?;
        let _dir = self.dir_lock(LockKind::Shared)?;
        let _record = lock_inode(&self.store, file.ino, LockKind::Shared)?;
        let inode = self.live_inode(&file)?;

        let available = inode.size.saturating_sub(file.offset);
        let len = usize::try_from(available).map_or(buf.len(), |avail| avail.min(buf.len()));
        if len > 0 {
            let chain = self.store.chain(inode.first_block)?;
            self.store
                .read_chain_at(&chain, file.offset, &mut buf[..len])?;
        }
        self.set_offset(handle, file.offset + len as u64)?;
        trace!(%handle, ino = file.ino.0, offset = file.offset, len, "read");
        Ok(len)
    }

    /// Write all of `data` at the handle's offset, or at end of file for an
    /// `Append` handle. Either the whole write lands or, on `NoFreeBlocks`,
    /// neither the file nor the bitmap changes.
    pub fn write(&self, handle: FileHandle, data: &[u8]) -> Result<()> {
        let _op = self.op_lock.lock();
        let file = self.open_file_state(handle)?;
        if !file.mode.can_write() {
            return Err(SfsError::WrongMode);
        }
        let _dir = self.dir_lock(LockKind::Shared)?;
        let _record = lock_inode(&self.store, file.ino, LockKind::Exclusive)?;
        let mut inode = self.live_inode(&file)?;

        let offset = if file.mode == AccessMode::Append {
            inode.size
        } else {
            file.offset
        };
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| SfsError::Format("write range overflows u64".to_owned()))?;

        if !data.is_empty() {
            let mut chain = self.store.chain(inode.first_block)?;
            let before = chain.len();
            grow_chain(&self.store, &mut chain, end)?;
            self.store.write_chain_at(&chain, offset, data)?;
            inode.first_block = chain.first().copied().unwrap_or(BlockNumber::NONE);
            inode.size = inode.size.max(end);
            sfs_inode::put(&self.store, file.ino, &inode)?;
            trace!(
                %handle,
                ino = file.ino.0,
                offset,
                len = data.len(),
                new_blocks = chain.len() - before,
                size = inode.size,
                "write"
            );
        }
        self.set_offset(handle, end)
    }

    /// Move the handle's offset. The result is clamped into `[0, size]`.
    pub fn seek(&self, handle: FileHandle, whence: Whence) -> Result<u64> {
        let _op = self.op_lock.lock();
        let file = self.open_file_state(handle)?;
        let _dir = self.dir_lock(LockKind::Shared)?;
        let _record = lock_inode(&self.store, file.ino, LockKind::Shared)?;
        let size = self.live_inode(&file)?.size;

        let target = match whence {
            Whence::Start(delta) => i128::from(delta),
            Whence::Current(delta) => i128::from(file.offset) + i128::from(delta),
            Whence::End(delta) => i128::from(size) + i128::from(delta),
        };
        let clamped = target.clamp(0, i128::from(size));
        let position = u64::try_from(clamped).unwrap_or(size);
        self.set_offset(handle, position)?;
        trace!(%handle, ?whence, position, "seek");
        Ok(position)
    }

    /// Resize the file to `len` bytes. Growth reads back as zeros; shrinking
    /// frees trailing blocks. Handle offsets are left alone.
    pub fn truncate(&self, handle: FileHandle, len: u64) -> Result<()> {
        let _op = self.op_lock.lock();
        let file = self.open_file_state(handle)?;
        if !file.mode.can_write() {
            return Err(SfsError::WrongMode);
        }
        let _dir = self.dir_lock(LockKind::Shared)?;
        let _record = lock_inode(&self.store, file.ino, LockKind::Exclusive)?;
        let mut inode = self.live_inode(&file)?;
        if len == inode.size {
            return Ok(());
        }

        let mut chain = self.store.chain(inode.first_block)?;
        if len < inode.size {
            shrink_chain(&self.store, &mut chain, len)?;
            // Bytes past the end must read as zero if the file grows again.
            let capacity = chain.len() as u64 * self.store.layout().payload_size() as u64;
            let stale = usize::try_from(capacity - len)
                .map_err(|_| SfsError::Format("tail does not fit in memory".to_owned()))?;
            if stale > 0 {
                self.store.write_chain_at(&chain, len, &vec![0_u8; stale])?;
            }
        } else {
            grow_chain(&self.store, &mut chain, len)?;
        }
        let old = inode.size;
        inode.size = len;
        inode.first_block = chain.first().copied().unwrap_or(BlockNumber::NONE);
        sfs_inode::put(&self.store, file.ino, &inode)?;
        debug!(%handle, ino = file.ino.0, old, new = len, blocks = chain.len(), "truncated");
        Ok(())
    }

    fn open_file_state(&self, handle: FileHandle) -> Result<OpenFile> {
        self.files.lock().get(handle).cloned()
    }

    fn set_offset(&self, handle: FileHandle, offset: u64) -> Result<()> {
        self.files.lock().get_mut(handle)?.offset = offset;
        Ok(())
    }

    /// Current inode of an open file; `FileDoesntExist` once it has been
    /// unlinked (by anyone) since the handle was opened, even if the slot
    /// already holds a new file.
    fn live_inode(&self, file: &OpenFile) -> Result<Inode> {
        let inode = sfs_inode::get(&self.store, file.ino)?;
        if inode.kind != InodeKind::File || inode.generation != file.generation {
            return Err(SfsError::FileDoesntExist(file.name.clone()));
        }
        Ok(inode)
    }
}
