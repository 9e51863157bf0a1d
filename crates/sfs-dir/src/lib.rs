#![forbid(unsafe_code)]
//! Directory operations.
//!
//! A directory's payload stream is a packed array of 256-byte
//! [`DirEntryRecord`]s; its size is always `records * 256`. Records may
//! straddle block payload boundaries. Removal compacts the array by moving
//! the last record into the freed slot, so there are never holes at rest.
//!
//! [`create`] and [`remove`] take the directory mutex exclusively
//! themselves. [`resolve`], [`lookup`] and [`list`] take no locks: callers
//! hold the mutex (usually shared) around them.

use sfs_alloc::{free_chain, grow_chain, shrink_chain};
use sfs_block::{BlockStore, LockKind};
use sfs_error::{Result, SfsError};
use sfs_lock::{DirMutex, lock_block};
use sfs_ondisk::path::{components, split_parent};
use sfs_ondisk::{DirEntryRecord, Inode, InodeKind, parse_to_corruption};
use sfs_types::{BlockNumber, DIR_ENTRY_SIZE, InodeNumber};
use tracing::{debug, trace, warn};

const RECORD_LEN: u64 = DIR_ENTRY_SIZE as u64;

// ── Entry stream ────────────────────────────────────────────────────────────

/// A directory's chain and the raw bytes of its record array.
struct Entries {
    chain: Vec<BlockNumber>,
    bytes: Vec<u8>,
}

impl Entries {
    fn read(store: &BlockStore, dir: &Inode) -> Result<Self> {
        if dir.size % RECORD_LEN != 0 {
            return Err(SfsError::corruption(
                dir.first_block.0,
                format!("directory size {} is not a multiple of {RECORD_LEN}", dir.size),
            ));
        }
        let chain = store.chain(dir.first_block)?;
        let len = usize::try_from(dir.size)
            .map_err(|_| SfsError::Format("directory does not fit in memory".to_owned()))?;
        let mut bytes = vec![0_u8; len];
        store.read_chain_at(&chain, 0, &mut bytes)?;
        Ok(Self { chain, bytes })
    }

    fn records(&self) -> impl Iterator<Item = &[u8]> {
        self.bytes.chunks_exact(DIR_ENTRY_SIZE)
    }

    fn count(&self) -> usize {
        self.bytes.len() / DIR_ENTRY_SIZE
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.records()
            .position(|record| DirEntryRecord::raw_name_eq(record, name))
    }

    fn decode(&self, slot: usize) -> Result<DirEntryRecord> {
        let start = slot * DIR_ENTRY_SIZE;
        let record = self.bytes.get(start..start + DIR_ENTRY_SIZE).ok_or_else(|| {
            SfsError::corruption(self.first_block().0, format!("entry slot {slot} out of range"))
        })?;
        DirEntryRecord::parse_from_bytes(record)
            .map_err(|err| parse_to_corruption(self.first_block().0, &err))
    }

    fn first_block(&self) -> BlockNumber {
        self.chain.first().copied().unwrap_or(BlockNumber::NONE)
    }
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Find `name` in directory `dir`.
pub fn lookup(store: &BlockStore, dir: &Inode, name: &str) -> Result<Option<InodeNumber>> {
    let entries = Entries::read(store, dir)?;
    entries
        .find(name)
        .map(|slot| entries.decode(slot).map(|record| record.ino))
        .transpose()
}

/// Resolve an absolute path to its inode.
///
/// A missing component, a non-directory in the middle of the path, an
/// Empty slot or the anchor file all report `FileDoesntExist`.
pub fn resolve(store: &BlockStore, path: &str) -> Result<(Inode, InodeNumber)> {
    let parts = components(path)?;
    walk(store, &parts, path)
}

fn walk(store: &BlockStore, parts: &[&str], path: &str) -> Result<(Inode, InodeNumber)> {
    let missing = || SfsError::FileDoesntExist(path.to_owned());
    let mut ino = InodeNumber::ROOT;
    let mut inode = sfs_inode::get(store, ino)?;
    for part in parts {
        if !inode.is_dir() {
            return Err(missing());
        }
        ino = lookup(store, &inode, part)?.ok_or_else(missing)?;
        if ino == InodeNumber::ANCHOR {
            return Err(missing());
        }
        inode = sfs_inode::get(store, ino)?;
        if inode.is_empty_slot() {
            return Err(missing());
        }
    }
    trace!(path, ino = ino.0, "resolved path");
    Ok((inode, ino))
}

/// Live entries of directory `dir_ino` in storage order.
pub fn list(store: &BlockStore, dir_ino: InodeNumber) -> Result<Vec<DirEntryRecord>> {
    let dir = sfs_inode::get(store, dir_ino)?;
    if !dir.is_dir() {
        return Err(SfsError::NotDirectory);
    }
    let entries = Entries::read(store, &dir)?;
    (0..entries.count()).map(|slot| entries.decode(slot)).collect()
}

// ── Mutation ────────────────────────────────────────────────────────────────

/// Create an Empty file or directory at `path` and link it into its parent.
///
/// A missing parent is `DirDoesntExist` when creating a file and
/// `ParentDirDoesntExist` when creating a directory. If linking fails the
/// new inode slot is released again.
pub fn create(store: &BlockStore, path: &str, kind: InodeKind) -> Result<InodeNumber> {
    if kind == InodeKind::Empty {
        return Err(SfsError::Format("cannot create an Empty inode".to_owned()));
    }
    let (parents, name) = split_parent(path)?;
    let mutex = DirMutex::new(store)?;
    let _dir_lock = mutex.lock(LockKind::Exclusive)?;

    let missing_parent = || match kind {
        InodeKind::Directory => SfsError::ParentDirDoesntExist(path.to_owned()),
        _ => SfsError::DirDoesntExist(path.to_owned()),
    };
    let (parent, parent_ino) = match walk(store, &parents, path) {
        Ok(found) => found,
        Err(SfsError::FileDoesntExist(_)) => return Err(missing_parent()),
        Err(err) => return Err(err),
    };
    if !parent.is_dir() {
        return Err(missing_parent());
    }
    // Before insert, so a full inode table cannot mask the duplicate.
    if lookup(store, &parent, name)?.is_some() {
        return Err(SfsError::FileAlreadyExists);
    }

    let ino = sfs_inode::insert(store, &Inode::new(name, kind))?;
    if let Err(err) = append_entry(store, parent_ino, name, ino) {
        if let Err(rollback) = sfs_inode::mark_empty(store, ino) {
            warn!(ino = ino.0, %rollback, "failed to release inode after failed create");
        }
        debug!(path, %err, "create rolled back");
        return Err(err);
    }
    debug!(path, ino = ino.0, parent = parent_ino.0, ?kind, "created");
    Ok(ino)
}

/// Append `name -> ino` to directory `dir_ino`, rejecting duplicates. The
/// directory's tail block stays locked while the chain is extended.
fn append_entry(store: &BlockStore, dir_ino: InodeNumber, name: &str, ino: InodeNumber) -> Result<()> {
    let mut dir = sfs_inode::get(store, dir_ino)?;
    let entries = Entries::read(store, &dir)?;
    if entries.find(name).is_some() {
        return Err(SfsError::FileAlreadyExists);
    }
    let mut chain = entries.chain;
    let record = DirEntryRecord {
        name: name.to_owned(),
        ino,
    }
    .to_bytes()
    .map_err(|_| SfsError::NameTooLong)?;

    let _tail_lock = match chain.last() {
        Some(&tail) => Some(lock_block(store, tail, LockKind::Exclusive)?),
        None => None,
    };
    let new_size = dir.size + RECORD_LEN;
    grow_chain(store, &mut chain, new_size)?;
    store.write_chain_at(&chain, dir.size, &record)?;

    dir.size = new_size;
    dir.first_block = chain.first().copied().unwrap_or(BlockNumber::NONE);
    sfs_inode::put(store, dir_ino, &dir)?;
    trace!(dir = dir_ino.0, name, ino = ino.0, size = new_size, "appended entry");
    Ok(())
}

/// Unlink `path`, free its blocks and inode, and compact the parent.
pub fn remove(store: &BlockStore, path: &str) -> Result<()> {
    let (parents, name) = split_parent(path)?;
    let mutex = DirMutex::new(store)?;
    let _dir_lock = mutex.lock(LockKind::Exclusive)?;

    let missing = || SfsError::FileDoesntExist(path.to_owned());
    let (mut parent, parent_ino) = walk(store, &parents, path)?;
    if !parent.is_dir() {
        return Err(missing());
    }
    let entries = Entries::read(store, &parent)?;
    let slot = entries.find(name).ok_or_else(missing)?;
    let ino = entries.decode(slot)?.ino;
    if ino.is_reserved() {
        return Err(missing());
    }

    let target = sfs_inode::get(store, ino)?;
    if target.is_dir() && target.size > 0 {
        return Err(SfsError::DirNotEmpty);
    }
    let freed = if target.first_block.is_none() {
        0
    } else {
        free_chain(store, target.first_block)?
    };
    sfs_inode::mark_empty(store, ino)?;

    // Move the last record into the hole, then drop the last slot.
    let last = entries.count() - 1;
    if slot != last {
        let tail = &entries.bytes[last * DIR_ENTRY_SIZE..];
        store.write_chain_at(&entries.chain, (slot * DIR_ENTRY_SIZE) as u64, tail)?;
    }
    store.write_chain_at(
        &entries.chain,
        (last * DIR_ENTRY_SIZE) as u64,
        &[0_u8; DIR_ENTRY_SIZE],
    )?;
    let mut chain = entries.chain;
    parent.size -= RECORD_LEN;
    shrink_chain(store, &mut chain, parent.size)?;
    parent.first_block = chain.first().copied().unwrap_or(BlockNumber::NONE);
    sfs_inode::put(store, parent_ino, &parent)?;

    debug!(path, ino = ino.0, freed_blocks = freed, parent_size = parent.size, "removed");
    Ok(())
}
