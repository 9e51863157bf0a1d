//! Offline-style consistency check of a live image.

use crate::{CheckReport, Image};
use sfs_alloc::{RESERVED_BITS, bitmap_count_free, bitmap_get};
use sfs_block::LockKind;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{Inode, Layout};
use sfs_types::{BlockNumber, InodeNumber};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

impl Image {
    /// Verify the allocation and namespace invariants.
    ///
    /// Holds the directory mutex exclusively, so nothing else mutates the
    /// image while it runs. Metadata corruption is reported in the returned
    /// [`CheckReport`]; only I/O failures are returned as errors.
    pub fn check(&self) -> Result<CheckReport> {
        let _op = self.op_lock.lock();
        let _dir = self.dir_lock(LockKind::Exclusive)?;
        let store = &self.store;
        let layout = *store.layout();
        let mut report = CheckReport::default();

        let sb = match store.read_superblock() {
            Ok(sb) => sb,
            Err(SfsError::Corruption { detail, .. }) => {
                report.errors.push(format!("superblock: {detail}"));
                return Ok(report);
            }
            Err(err) => return Err(err),
        };
        if let Err(err) = sb.validate_geometry(&layout) {
            report.errors.push(format!("superblock: {err}"));
        }
        report.free_blocks = sb.free_blocks;

        let bitmap = store.read_bitmap()?;
        let free_bits = bitmap_count_free(&bitmap, layout.number_of_blocks);
        report.allocated_blocks = layout.number_of_blocks - free_bits;
        if !bitmap_get(&bitmap, 0) {
            report.errors.push("bitmap: reserved anchor bit is clear".to_owned());
        }
        if sb.free_blocks != free_bits {
            report.errors.push(format!(
                "superblock: free count {} but bitmap has {free_bits} clear bits",
                sb.free_blocks
            ));
        }

        let inodes = scan_inodes(self, &layout, &mut report)?;
        report.live_inodes = inodes.len() as u64;
        check_cursor(&inodes, &layout, sb.next_free_inode, &mut report);

        let owners = check_chains(self, &inodes, &layout, &bitmap, &mut report)?;
        for bit in RESERVED_BITS..layout.number_of_blocks {
            let block = layout.data_block(bit);
            if bitmap_get(&bitmap, bit) && !owners.contains_key(&block) {
                report
                    .errors
                    .push(format!("bitmap: block {block} allocated but unreachable"));
            }
        }

        check_namespace(self, &inodes, &mut report)?;

        if report.is_clean() {
            debug!(
                allocated = report.allocated_blocks,
                free = report.free_blocks,
                inodes = report.live_inodes,
                "image check clean"
            );
        } else {
            warn!(errors = report.errors.len(), "image check found problems");
        }
        Ok(report)
    }
}

/// Decode every slot; undecodable slots become findings.
fn scan_inodes(
    image: &Image,
    layout: &Layout,
    report: &mut CheckReport,
) -> Result<HashMap<InodeNumber, Inode>> {
    let mut live = HashMap::new();
    for raw in 0..layout.inode_count {
        let ino = InodeNumber(raw);
        match sfs_inode::get(&image.store, ino) {
            Ok(inode) if inode.is_empty_slot() => {
                if ino.is_reserved() {
                    report.errors.push(format!("inode {ino}: reserved slot is empty"));
                }
            }
            Ok(inode) => {
                live.insert(ino, inode);
            }
            Err(SfsError::Corruption { detail, .. }) => {
                report.errors.push(format!("inode {ino}: {detail}"));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(live)
}

fn check_cursor(
    inodes: &HashMap<InodeNumber, Inode>,
    layout: &Layout,
    cursor: u64,
    report: &mut CheckReport,
) {
    let lowest_empty = (InodeNumber::FIRST_FREE.0..layout.inode_count)
        .find(|raw| !inodes.contains_key(&InodeNumber(*raw)));
    match lowest_empty {
        Some(lowest) if cursor != lowest => report.errors.push(format!(
            "superblock: free-inode cursor {cursor}, lowest empty slot is {lowest}"
        )),
        None if cursor != 0 => report
            .errors
            .push(format!("superblock: free-inode cursor {cursor} but table is full")),
        _ => {}
    }
}

/// Walk every chain; returns block -> owning inode.
fn check_chains(
    image: &Image,
    inodes: &HashMap<InodeNumber, Inode>,
    layout: &Layout,
    bitmap: &[u8],
    report: &mut CheckReport,
) -> Result<HashMap<BlockNumber, InodeNumber>> {
    let mut owners: HashMap<BlockNumber, InodeNumber> = HashMap::new();
    let mut ordered: Vec<_> = inodes.iter().collect();
    ordered.sort_by_key(|(ino, _)| **ino);

    for (&ino, inode) in ordered {
        let chain = match image.store.chain(inode.first_block) {
            Ok(chain) => chain,
            Err(SfsError::Corruption { detail, .. }) => {
                report.errors.push(format!("inode {ino}: {detail}"));
                continue;
            }
            Err(err) => return Err(err),
        };
        let needed = layout.blocks_for_len(inode.size);
        if chain.len() as u64 != needed {
            report.errors.push(format!(
                "inode {ino}: size {} needs {needed} blocks, chain has {}",
                inode.size,
                chain.len()
            ));
        }
        for block in chain {
            let bit = block.0 - layout.data_start;
            if !bitmap_get(bitmap, bit) {
                report
                    .errors
                    .push(format!("inode {ino}: block {block} is marked free"));
            }
            if let Some(other) = owners.insert(block, ino) {
                report
                    .errors
                    .push(format!("block {block} shared by inodes {other} and {ino}"));
            }
        }
    }

    let anchor_block = layout.anchor_block();
    if owners.get(&anchor_block) != Some(&InodeNumber::ANCHOR) {
        report
            .errors
            .push(format!("anchor: block {anchor_block} is not owned by the anchor inode"));
    }
    Ok(owners)
}

/// Every live inode except root and anchor is linked exactly once, from a
/// directory, under its own name; no directory has duplicates.
fn check_namespace(
    image: &Image,
    inodes: &HashMap<InodeNumber, Inode>,
    report: &mut CheckReport,
) -> Result<()> {
    let mut links: HashMap<InodeNumber, u32> = HashMap::new();
    let mut dirs: Vec<InodeNumber> = inodes
        .iter()
        .filter(|(_, inode)| inode.is_dir())
        .map(|(ino, _)| *ino)
        .collect();
    dirs.sort();

    for dir_ino in dirs {
        let entries = match sfs_dir::list(&image.store, dir_ino) {
            Ok(entries) => entries,
            Err(SfsError::Corruption { detail, .. }) => {
                report.errors.push(format!("directory {dir_ino}: {detail}"));
                continue;
            }
            Err(err) => return Err(err),
        };
        let mut names = HashSet::new();
        for entry in entries {
            if !names.insert(entry.name.clone()) {
                report
                    .errors
                    .push(format!("directory {dir_ino}: duplicate name {:?}", entry.name));
            }
            match inodes.get(&entry.ino) {
                _ if entry.ino.is_reserved() => report.errors.push(format!(
                    "directory {dir_ino}: entry {:?} links reserved inode {}",
                    entry.name, entry.ino
                )),
                None => report.errors.push(format!(
                    "directory {dir_ino}: entry {:?} points at empty inode {}",
                    entry.name, entry.ino
                )),
                Some(target) if target.name != entry.name => report.errors.push(format!(
                    "directory {dir_ino}: entry {:?} names inode {} called {:?}",
                    entry.name, entry.ino, target.name
                )),
                Some(_) => *links.entry(entry.ino).or_default() += 1,
            }
        }
    }

    let mut orphans: Vec<_> = inodes
        .keys()
        .filter(|ino| !ino.is_reserved() && links.get(ino).copied().unwrap_or(0) != 1)
        .collect();
    orphans.sort();
    for ino in orphans {
        let count = links.get(ino).copied().unwrap_or(0);
        report
            .errors
            .push(format!("inode {ino}: linked {count} times, expected once"));
    }
    Ok(())
}
