//! Writing the initial metadata of a new image.

use crate::BlockStore;
use sfs_error::Result;
use sfs_ondisk::{Inode, InodeKind, Superblock, parse_to_corruption};
use sfs_types::{BLOCK_POINTER_SIZE, InodeNumber};
use tracing::debug;

/// Name stored in the root inode record.
pub const ROOT_NAME: &str = "/";
/// Name stored in the anchor inode record; never visible through a directory.
pub const ANCHOR_NAME: &str = ".anchor";

/// Lay down the superblock, root and anchor inodes, and bitmap bit 0 on a
/// zero-filled device.
pub fn format_image(store: &BlockStore) -> Result<()> {
    let layout = *store.layout();
    let sb = Superblock::fresh(&layout);
    store.write_superblock(&sb)?;

    let root = Inode::new(ROOT_NAME, InodeKind::Directory);
    let anchor = Inode {
        name: ANCHOR_NAME.to_owned(),
        kind: InodeKind::File,
        generation: 0,
        size: BLOCK_POINTER_SIZE as u64,
        first_block: layout.anchor_block(),
    };
    for (ino, inode) in [(InodeNumber::ROOT, &root), (InodeNumber::ANCHOR, &anchor)] {
        let record = inode
            .to_bytes()
            .map_err(|err| parse_to_corruption(layout.inode_block(ino).0, &err))?;
        store.write_inode_record(ino, &record)?;
    }

    // Counter starts at zero, chain ends at the anchor block.
    store.zero_block(layout.anchor_block())?;
    store.write_bitmap_bytes(0, &[0b0000_0001])?;

    store.sync()?;
    debug!(
        block_size = layout.block_size,
        blocks = layout.number_of_blocks,
        data_start = layout.data_start,
        inodes = layout.inode_count,
        "formatted image"
    );
    Ok(())
}
