#![forbid(unsafe_code)]
//! Cross-process coordination for SimpleFS images.
//!
//! Every lock here is an advisory byte-range lock on the shared backing
//! file, so it excludes other processes and other image handles alike.
//!
//! # Lock domains
//!
//! | Domain | Range | Held by |
//! |--------|-------|---------|
//! | Free cursor | superblock `next_free_block` field | one allocate/free call |
//! | Directory mutex | anchor inode record (+ counter in the anchor block) | create/remove (exclusive), lookups/reads/writes (shared) |
//! | Record | one inode record or one data block | file I/O, directory appends |
//!
//! Acquisition order is directory mutex, then record locks, then the free
//! cursor. Nothing here times out.
//!
//! # Directory mutex
//!
//! The first holder of a burst takes the anchor lock while still holding
//! the counter lock, so it never waits. Later arrivals register in the
//! counter and then wait for the anchor lock without holding the counter,
//! which lets the current holder decrement on release.

use sfs_block::{BlockStore, ByteDevice, ByteRange, LockKind};
use sfs_error::{Result, SfsError};
use sfs_ondisk::records::SB_NEXT_FREE_BLOCK;
use sfs_types::{BlockNumber, ByteOffset, InodeNumber};
use tracing::{debug, trace, warn};

// ── Range guards ────────────────────────────────────────────────────────────

/// Held byte-range lock; unlocked on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RangeGuard<'a> {
    dev: &'a dyn ByteDevice,
    range: ByteRange,
    kind: LockKind,
}

impl<'a> RangeGuard<'a> {
    /// Block until `range` is locked.
    pub fn acquire(dev: &'a dyn ByteDevice, range: ByteRange, kind: LockKind) -> Result<Self> {
        dev.lock_range(range, kind, true)?;
        Ok(Self { dev, range, kind })
    }

    /// Lock `range` only if nobody else holds a conflicting lock.
    pub fn try_acquire(
        dev: &'a dyn ByteDevice,
        range: ByteRange,
        kind: LockKind,
    ) -> Result<Option<Self>> {
        if dev.lock_range(range, kind, false)? {
            Ok(Some(Self { dev, range, kind }))
        } else {
            Ok(None)
        }
    }

    #[must_use]
    pub fn range(&self) -> ByteRange {
        self.range
    }

    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.dev.unlock_range(self.range) {
            warn!(
                start = self.range.start,
                len = self.range.len,
                %err,
                "failed to release range lock"
            );
        }
    }
}

impl std::fmt::Debug for RangeGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeGuard")
            .field("range", &self.range)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// The 8-byte superblock range guarding the allocation cursor, free count
/// and bitmap.
#[must_use]
pub fn free_cursor_range() -> ByteRange {
    ByteRange::new(SB_NEXT_FREE_BLOCK as u64, 8)
}

pub fn lock_free_cursor(store: &BlockStore) -> Result<RangeGuard<'_>> {
    RangeGuard::acquire(store.device(), free_cursor_range(), LockKind::Exclusive)
}

pub fn lock_inode(store: &BlockStore, ino: InodeNumber, kind: LockKind) -> Result<RangeGuard<'_>> {
    RangeGuard::acquire(store.device(), store.inode_range(ino)?, kind)
}

pub fn lock_block(
    store: &BlockStore,
    block: BlockNumber,
    kind: LockKind,
) -> Result<RangeGuard<'_>> {
    store.check_data_block(block)?;
    RangeGuard::acquire(store.device(), store.block_range(block)?, kind)
}

// ── Directory-mutation mutex ────────────────────────────────────────────────

/// Readers/writer mutex shared by every process that opens the image.
#[derive(Clone, Copy)]
pub struct DirMutex<'a> {
    dev: &'a dyn ByteDevice,
    counter_block: BlockNumber,
    counter: ByteRange,
    anchor: ByteRange,
}

impl<'a> DirMutex<'a> {
    pub fn new(store: &'a BlockStore) -> Result<Self> {
        let counter_block = store.layout().anchor_block();
        let offset = store.block_byte_offset(counter_block)?;
        Ok(Self {
            dev: store.device(),
            counter_block,
            counter: ByteRange::new(offset.0, 8),
            anchor: store.inode_range(InodeNumber::ANCHOR)?,
        })
    }

    /// Block until the mutex is held in `kind` mode.
    pub fn lock(&self, kind: LockKind) -> Result<DirGuard<'a>> {
        let (holders, fast) = self.register(kind)?;
        if !fast {
            if let Err(err) = self.dev.lock_range(self.anchor, kind, true) {
                self.unregister();
                return Err(err);
            }
        }
        debug!(?kind, holders, fast, "directory mutex acquired");
        Ok(self.guard(kind))
    }

    /// Take the mutex only if it is free for `kind` right now.
    pub fn try_lock(&self, kind: LockKind) -> Result<Option<DirGuard<'a>>> {
        let (holders, fast) = self.register(kind)?;
        if fast || self.dev.lock_range(self.anchor, kind, false)? {
            debug!(?kind, holders, "directory mutex acquired without waiting");
            return Ok(Some(self.guard(kind)));
        }
        self.unregister();
        Ok(None)
    }

    /// Current number of registered holders and waiters.
    pub fn holders(&self) -> Result<u64> {
        let _counter = RangeGuard::acquire(self.dev, self.counter, LockKind::Shared)?;
        self.read_counter()
    }

    fn guard(&self, kind: LockKind) -> DirGuard<'a> {
        DirGuard {
            mutex: *self,
            kind,
            released: false,
        }
    }

    /// Increment the counter; on a 0 -> 1 transition also try the anchor
    /// without blocking. Returns the new count and whether the anchor is held.
    fn register(&self, kind: LockKind) -> Result<(u64, bool)> {
        let _counter = RangeGuard::acquire(self.dev, self.counter, LockKind::Exclusive)?;
        let before = self.read_counter()?;
        let after = before.checked_add(1).ok_or_else(|| {
            SfsError::corruption(self.counter_block.0, "directory mutex counter overflow")
        })?;
        self.write_counter(after)?;
        let fast = if before == 0 {
            match self.dev.lock_range(self.anchor, kind, false) {
                Ok(acquired) => acquired,
                Err(err) => {
                    self.write_counter(before)?;
                    return Err(err);
                }
            }
        } else {
            false
        };
        trace!(before, after, fast, "directory mutex counter incremented");
        Ok((after, fast))
    }

    fn unregister(&self) {
        if let Err(err) = self.decrement() {
            warn!(%err, "failed to decrement directory mutex counter");
        }
    }

    fn decrement(&self) -> Result<()> {
        let _counter = RangeGuard::acquire(self.dev, self.counter, LockKind::Exclusive)?;
        let before = self.read_counter()?;
        if before == 0 {
            warn!("directory mutex counter already zero on release");
            return Ok(());
        }
        self.write_counter(before - 1)?;
        trace!(before, after = before - 1, "directory mutex counter decremented");
        Ok(())
    }

    fn read_counter(&self) -> Result<u64> {
        let mut raw = [0_u8; 8];
        self.dev
            .read_exact_at(ByteOffset(self.counter.start), &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    fn write_counter(&self, value: u64) -> Result<()> {
        self.dev
            .write_all_at(ByteOffset(self.counter.start), &value.to_le_bytes())
    }
}

impl std::fmt::Debug for DirMutex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirMutex")
            .field("counter", &self.counter)
            .field("anchor", &self.anchor)
            .finish_non_exhaustive()
    }
}

/// Held directory mutex; released on drop.
#[must_use = "the directory mutex is released as soon as the guard is dropped"]
pub struct DirGuard<'a> {
    mutex: DirMutex<'a>,
    kind: LockKind,
    released: bool,
}

impl DirGuard<'_> {
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Release now and report failures instead of logging them.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> Result<()> {
        let unlocked = self.mutex.dev.unlock_range(self.mutex.anchor);
        let decremented = self.mutex.decrement();
        debug!(kind = ?self.kind, "directory mutex released");
        unlocked.and(decremented)
    }
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.release_inner() {
            warn!(kind = ?self.kind, %err, "failed to release directory mutex");
        }
    }
}

impl std::fmt::Debug for DirGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirGuard")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
