#![forbid(unsafe_code)]
//! Inode table access.
//!
//! Inode numbers are slot indices. Slot 0 is the root directory and slot 1
//! the anchor file; neither can be freed. The superblock's
//! `next_free_inode` cursor names the lowest Empty slot (0 when the table is
//! full), so [`insert`] never has to look backwards.
//!
//! Slot allocation is serialized by the directory mutex: only `create` and
//! `remove` touch the cursor, and both hold the mutex exclusively.

use sfs_block::BlockStore;
use sfs_error::{Result, SfsError};
use sfs_ondisk::records::SB_NEXT_FREE_INODE;
use sfs_ondisk::{Inode, parse_to_corruption};
use sfs_types::{InodeNumber, MAX_NAME_LEN};
use tracing::{debug, trace};

/// Read and decode inode `ino`.
pub fn get(store: &BlockStore, ino: InodeNumber) -> Result<Inode> {
    let record = store.read_inode_record(ino)?;
    Inode::parse_from_bytes(&record)
        .map_err(|err| parse_to_corruption(store.layout().inode_block(ino).0, &err))
}

/// Encode and write inode `ino`.
pub fn put(store: &BlockStore, ino: InodeNumber, inode: &Inode) -> Result<()> {
    if inode.name.len() > MAX_NAME_LEN {
        return Err(SfsError::NameTooLong);
    }
    let record = inode
        .to_bytes()
        .map_err(|err| parse_to_corruption(store.layout().inode_block(ino).0, &err))?;
    store.write_inode_record(ino, &record)?;
    trace!(ino = ino.0, kind = ?inode.kind, size = inode.size, "wrote inode");
    Ok(())
}

/// Store `inode` in the slot named by the cursor and advance the cursor to
/// the next Empty slot. The slot keeps its generation; `inode.generation` is
/// ignored.
pub fn insert(store: &BlockStore, inode: &Inode) -> Result<InodeNumber> {
    let cursor = InodeNumber(store.read_sb_u64(SB_NEXT_FREE_INODE)?);
    if cursor.0 == 0 {
        debug!("inode table full");
        return Err(SfsError::NoFreeInodes);
    }
    let block = store.layout().inode_block(cursor).0;
    if cursor.is_reserved() {
        return Err(SfsError::corruption(
            block,
            format!("free-inode cursor points at reserved inode {cursor}"),
        ));
    }
    let slot = get(store, cursor)?;
    if !slot.is_empty_slot() {
        return Err(SfsError::corruption(
            block,
            format!("free-inode cursor points at live inode {cursor}"),
        ));
    }
    let inode = Inode {
        generation: slot.generation,
        ..inode.clone()
    };
    put(store, cursor, &inode)?;

    let next = next_empty_after(store, cursor)?;
    store.write_sb_u64(SB_NEXT_FREE_INODE, next.0)?;
    debug!(ino = cursor.0, next_free = next.0, kind = ?inode.kind, "inserted inode");
    Ok(cursor)
}

/// Reset `ino` to an Empty slot, bump its generation and pull the cursor
/// down to it.
pub fn mark_empty(store: &BlockStore, ino: InodeNumber) -> Result<()> {
    if ino.is_reserved() {
        return Err(SfsError::corruption(
            store.layout().inode_block(ino).0,
            format!("inode {ino} is reserved and cannot be freed"),
        ));
    }
    let generation = get(store, ino)?.generation.wrapping_add(1);
    put(
        store,
        ino,
        &Inode {
            generation,
            ..Inode::empty()
        },
    )?;
    let cursor = store.read_sb_u64(SB_NEXT_FREE_INODE)?;
    if cursor == 0 || ino.0 < cursor {
        store.write_sb_u64(SB_NEXT_FREE_INODE, ino.0)?;
    }
    debug!(ino = ino.0, generation, "freed inode");
    Ok(())
}

/// Every non-Empty slot, in slot order (root and anchor included).
pub fn live_inodes(store: &BlockStore) -> Result<Vec<(InodeNumber, Inode)>> {
    let mut live = Vec::new();
    for raw in 0..store.layout().inode_count {
        let ino = InodeNumber(raw);
        let inode = get(store, ino)?;
        if !inode.is_empty_slot() {
            live.push((ino, inode));
        }
    }
    Ok(live)
}

/// First Empty slot after `from`, or the 0 sentinel.
fn next_empty_after(store: &BlockStore, from: InodeNumber) -> Result<InodeNumber> {
    for raw in from.0 + 1..store.layout().inode_count {
        let ino = InodeNumber(raw);
        if get(store, ino)?.is_empty_slot() {
            return Ok(ino);
        }
    }
    Ok(InodeNumber(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_block::FileByteDevice;
    use sfs_block::format::{ANCHOR_NAME, format_image};
    use sfs_ondisk::{InodeKind, Layout};
    use sfs_types::BlockNumber;

    /// 1024-byte blocks, 8 data blocks: two inode-table blocks, 8 slots.
    fn image() -> (tempfile::TempDir, BlockStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::compute(1024, 8).expect("layout");
        assert_eq!(layout.inode_count, 8);
        let dev = FileByteDevice::create_new(dir.path().join("fs.img"), layout.image_len())
            .expect("create");
        let store = BlockStore::new(Box::new(dev), layout).expect("store");
        format_image(&store).expect("format");
        (dir, store)
    }

    fn cursor(store: &BlockStore) -> u64 {
        store.read_sb_u64(SB_NEXT_FREE_INODE).expect("cursor")
    }

    #[test]
    fn fresh_table_has_root_and_anchor() {
        let (_dir, store) = image();
        let live = live_inodes(&store).expect("live");
        assert_eq!(live.len(), 2);
        assert!(live[0].1.is_dir());
        assert_eq!(live[1].1.name, ANCHOR_NAME);
        assert_eq!(cursor(&store), 2);
    }

    #[test]
    fn insert_fills_lowest_slots_then_reports_full() {
        let (_dir, store) = image();
        for expected in 2..8 {
            let ino = insert(&store, &Inode::new("f", InodeKind::File)).expect("insert");
            assert_eq!(ino, InodeNumber(expected));
        }
        assert_eq!(cursor(&store), 0);
        assert!(matches!(
            insert(&store, &Inode::new("g", InodeKind::File)),
            Err(SfsError::NoFreeInodes)
        ));
    }

    #[test]
    fn mark_empty_lowers_cursor() {
        let (_dir, store) = image();
        let inos: Vec<_> = (0..4)
            .map(|_| insert(&store, &Inode::new("f", InodeKind::File)).expect("insert"))
            .collect();
        assert_eq!(cursor(&store), 6);
        mark_empty(&store, inos[2]).expect("free 4");
        assert_eq!(cursor(&store), 4);
        mark_empty(&store, inos[3]).expect("free 5");
        assert_eq!(cursor(&store), 4);
        mark_empty(&store, inos[0]).expect("free 2");
        assert_eq!(cursor(&store), 2);

        assert_eq!(insert(&store, &Inode::new("a", InodeKind::File)).expect("a"), InodeNumber(2));
        // Slot 3 is still live, so the cursor skips it.
        assert_eq!(cursor(&store), 4);
    }

    #[test]
    fn reused_slot_gets_a_new_generation() {
        let (_dir, store) = image();
        let stale = Inode {
            generation: 200,
            ..Inode::new("f", InodeKind::File)
        };
        let ino = insert(&store, &stale).expect("insert");
        assert_eq!(get(&store, ino).expect("get").generation, 0);

        mark_empty(&store, ino).expect("free");
        let empty = get(&store, ino).expect("get");
        assert!(empty.is_empty_slot());
        assert_eq!(empty.generation, 1);

        assert_eq!(insert(&store, &Inode::new("g", InodeKind::File)).expect("reuse"), ino);
        assert_eq!(get(&store, ino).expect("get").generation, 1);

        put(
            &store,
            ino,
            &Inode {
                generation: u8::MAX,
                ..Inode::new("g", InodeKind::File)
            },
        )
        .expect("put");
        mark_empty(&store, ino).expect("free");
        assert_eq!(get(&store, ino).expect("get").generation, 0);
    }

    #[test]
    fn mark_empty_on_full_table_resets_sentinel() {
        let (_dir, store) = image();
        for _ in 2..8 {
            insert(&store, &Inode::new("f", InodeKind::File)).expect("insert");
        }
        mark_empty(&store, InodeNumber(7)).expect("free");
        assert_eq!(cursor(&store), 7);
    }

    #[test]
    fn reserved_and_out_of_range_slots_are_rejected() {
        let (_dir, store) = image();
        for ino in [InodeNumber::ROOT, InodeNumber::ANCHOR] {
            assert!(matches!(
                mark_empty(&store, ino),
                Err(SfsError::Corruption { .. })
            ));
        }
        assert!(matches!(
            get(&store, InodeNumber(8)),
            Err(SfsError::Corruption { .. })
        ));
    }

    #[test]
    fn put_round_trips_and_checks_name_length() {
        let (_dir, store) = image();
        let inode = Inode {
            name: "data.bin".to_owned(),
            kind: InodeKind::File,
            generation: 3,
            size: 4242,
            first_block: BlockNumber(9),
        };
        put(&store, InodeNumber(3), &inode).expect("put");
        assert_eq!(get(&store, InodeNumber(3)).expect("get"), inode);

        let long = Inode::new(&"x".repeat(MAX_NAME_LEN + 1), InodeKind::File);
        assert!(matches!(
            put(&store, InodeNumber(3), &long),
            Err(SfsError::NameTooLong)
        ));
    }

    #[test]
    fn corrupt_cursor_is_detected() {
        let (_dir, store) = image();
        store.write_sb_u64(SB_NEXT_FREE_INODE, 1).expect("poke");
        assert!(matches!(
            insert(&store, &Inode::new("f", InodeKind::File)),
            Err(SfsError::Corruption { .. })
        ));
        store.write_sb_u64(SB_NEXT_FREE_INODE, 0).expect("poke");
        put(&store, InodeNumber(2), &Inode::new("live", InodeKind::File)).expect("put");
        store.write_sb_u64(SB_NEXT_FREE_INODE, 2).expect("poke");
        assert!(matches!(
            insert(&store, &Inode::new("f", InodeKind::File)),
            Err(SfsError::Corruption { .. })
        ));
    }
}
