#![forbid(unsafe_code)]
//! Data-block allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw LSB-first bit manipulation, one bit per data block.
//! 2. **Plan**: [`plan_allocation`], a pure forward scan from the cursor.
//! 3. **Persist**: [`allocate`], [`free_blocks`] and the chain helpers,
//!    which read a bitmap snapshot, commit a plan and update the superblock
//!    counters while holding the free-cursor lock.
//!
//! Bit 0 belongs to the anchor block and is never handed out or freed, so
//! `free_blocks + allocated_bits - 1 == number_of_blocks - 1` at rest.

use sfs_block::BlockStore;
use sfs_error::{Result, SfsError};
use sfs_lock::lock_free_cursor;
use sfs_ondisk::records::{SB_FREE_BLOCKS, SB_NEXT_FREE_BLOCK};
use sfs_types::BlockNumber;
use tracing::{debug, trace, warn};

/// Bits below this index are permanently reserved.
pub const RESERVED_BITS: u64 = 1;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let Ok(byte_idx) = usize::try_from(idx / 8) else {
        return false;
    };
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    if let Some(byte) = usize::try_from(idx / 8)
        .ok()
        .and_then(|i| bitmap.get_mut(i))
    {
        *byte |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    if let Some(byte) = usize::try_from(idx / 8)
        .ok()
        .and_then(|i| bitmap.get_mut(i))
    {
        *byte &= !(1 << (idx % 8));
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u64) -> u64 {
    let full_bytes = usize::try_from(count / 8).unwrap_or(usize::MAX);
    let remainder = count % 8;
    let mut free = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| u64::from(byte.count_zeros()))
        .sum::<u64>();

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        free += (0..remainder).filter(|bit| (byte >> bit) & 1 == 0).count() as u64;
    }

    free
}

// ── Allocation planning ─────────────────────────────────────────────────────

/// Bits chosen for one allocation and the cursor to store afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocPlan {
    /// Bitmap bits in allocation order (the chain order of the new blocks).
    pub bits: Vec<u64>,
    pub next_cursor: u64,
}

/// Pick `n` clear bits scanning forward from `cursor`.
///
/// The scan skips the reserved bits, wraps from `bit_count - 1` to the first
/// usable bit, and visits each bit at most once. Returns `None` when fewer
/// than `n` clear bits exist. A cursor outside the usable range starts the
/// scan at the first usable bit.
#[must_use]
pub fn plan_allocation(bitmap: &[u8], bit_count: u64, cursor: u64, n: u64) -> Option<AllocPlan> {
    if n == 0 {
        return Some(AllocPlan {
            bits: Vec::new(),
            next_cursor: cursor,
        });
    }
    if bit_count <= RESERVED_BITS {
        return None;
    }
    let usable = bit_count - RESERVED_BITS;
    if n > usable {
        return None;
    }

    let mut idx = if (RESERVED_BITS..bit_count).contains(&cursor) {
        cursor
    } else {
        RESERVED_BITS
    };
    let mut bits = Vec::with_capacity(usize::try_from(n).unwrap_or(0));
    for _ in 0..usable {
        if !bitmap_get(bitmap, idx) {
            bits.push(idx);
            if bits.len() as u64 == n {
                break;
            }
        }
        idx += 1;
        if idx >= bit_count {
            idx = RESERVED_BITS;
        }
    }
    if (bits.len() as u64) < n {
        return None;
    }

    let last = *bits.last()?;
    let next_cursor = if last + 1 >= bit_count {
        RESERVED_BITS
    } else {
        last + 1
    };
    Some(AllocPlan { bits, next_cursor })
}

/// Inclusive range of bitmap bytes touched by `bits`.
fn touched_bytes(bits: &[u64]) -> Option<(usize, usize)> {
    let lo = bits.iter().min()? / 8;
    let hi = bits.iter().max()? / 8;
    Some((usize::try_from(lo).ok()?, usize::try_from(hi).ok()?))
}

// ── Persistent allocation ───────────────────────────────────────────────────

/// Allocate `n` zeroed data blocks linked in allocation order.
///
/// All-or-nothing: when fewer than `n` blocks are free, nothing is written
/// and `NoFreeBlocks` is returned.
pub fn allocate(store: &BlockStore, n: u64) -> Result<Vec<BlockNumber>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let layout = *store.layout();
    let _cursor_lock = lock_free_cursor(store)?;

    let free = store.read_sb_u64(SB_FREE_BLOCKS)?;
    if free < n {
        debug!(requested = n, free, "allocation refused: not enough free blocks");
        return Err(SfsError::NoFreeBlocks);
    }
    let cursor = store.read_sb_u64(SB_NEXT_FREE_BLOCK)?;
    let mut bitmap = store.read_bitmap()?;
    let Some(plan) = plan_allocation(&bitmap, layout.number_of_blocks, cursor, n) else {
        warn!(
            requested = n,
            free,
            "free count promises more blocks than the bitmap has"
        );
        return Err(SfsError::NoFreeBlocks);
    };

    for &bit in &plan.bits {
        bitmap_set(&mut bitmap, bit);
    }
    if let Some((lo, hi)) = touched_bytes(&plan.bits) {
        store.write_bitmap_bytes(lo as u64, &bitmap[lo..=hi])?;
    }
    store.write_sb_u64(SB_FREE_BLOCKS, free - n)?;
    store.write_sb_u64(SB_NEXT_FREE_BLOCK, plan.next_cursor)?;

    let blocks: Vec<BlockNumber> = plan.bits.iter().map(|&bit| layout.data_block(bit)).collect();
    for (i, &block) in blocks.iter().enumerate() {
        let next = blocks.get(i + 1).copied().unwrap_or(BlockNumber::NONE);
        store.write_payload(block, &[], next)?;
    }

    debug!(
        count = n,
        first = blocks[0].0,
        cursor = plan.next_cursor,
        free = free - n,
        "allocated blocks"
    );
    Ok(blocks)
}

/// Allocate `n` blocks and return the first one (`NONE` for `n == 0`).
pub fn allocate_n(store: &BlockStore, n: u64) -> Result<BlockNumber> {
    Ok(allocate(store, n)?
        .first()
        .copied()
        .unwrap_or(BlockNumber::NONE))
}

/// Return `blocks` to the free pool: clear their bits, raise the free count
/// and zero their `next` pointers. The cursor is not rewound.
///
/// Every block is validated before anything is written; a reserved,
/// out-of-range, duplicated or already-free block is `Corruption`.
pub fn free_blocks(store: &BlockStore, blocks: &[BlockNumber]) -> Result<()> {
    if blocks.is_empty() {
        return Ok(());
    }
    let layout = *store.layout();
    let mut bits = Vec::with_capacity(blocks.len());
    for &block in blocks {
        store.check_data_block(block)?;
        let bit = block.0 - layout.data_start;
        if bit < RESERVED_BITS {
            return Err(SfsError::corruption(block.0, "refusing to free reserved block"));
        }
        bits.push(bit);
    }

    let _cursor_lock = lock_free_cursor(store)?;
    let mut bitmap = store.read_bitmap()?;
    for (&bit, &block) in bits.iter().zip(blocks) {
        if !bitmap_get(&bitmap, bit) {
            return Err(SfsError::corruption(block.0, "freeing a block that is not allocated"));
        }
        bitmap_clear(&mut bitmap, bit);
    }

    let freed = blocks.len() as u64;
    let free = store.read_sb_u64(SB_FREE_BLOCKS)?;
    let after = free
        .checked_add(freed)
        .filter(|after| *after < layout.number_of_blocks)
        .ok_or_else(|| {
            SfsError::corruption(0, format!("free count {free} + {freed} exceeds usable blocks"))
        })?;

    if let Some((lo, hi)) = touched_bytes(&bits) {
        store.write_bitmap_bytes(lo as u64, &bitmap[lo..=hi])?;
    }
    store.write_sb_u64(SB_FREE_BLOCKS, after)?;
    for &block in blocks {
        store.set_next(block, BlockNumber::NONE)?;
    }
    debug!(count = freed, first = blocks[0].0, free = after, "freed blocks");
    Ok(())
}

pub fn free_block(store: &BlockStore, block: BlockNumber) -> Result<()> {
    free_blocks(store, &[block])
}

/// Free every block of the chain starting at `first`; returns how many.
pub fn free_chain(store: &BlockStore, first: BlockNumber) -> Result<u64> {
    let chain = store.chain(first)?;
    free_blocks(store, &chain)?;
    Ok(chain.len() as u64)
}

/// Unlink and free the last block of the chain starting at `first`.
/// Returns the new tail, or `None` when the chain is now empty.
pub fn free_chain_tail(store: &BlockStore, first: BlockNumber) -> Result<Option<BlockNumber>> {
    let chain = store.chain(first)?;
    let Some((&last, rest)) = chain.split_last() else {
        return Err(SfsError::corruption(first.0, "cannot free the tail of an empty chain"));
    };
    let new_tail = rest.last().copied();
    if let Some(tail) = new_tail {
        store.set_next(tail, BlockNumber::NONE)?;
    }
    free_block(store, last)?;
    trace!(freed = last.0, new_tail = ?new_tail.map(|b| b.0), "freed chain tail");
    Ok(new_tail)
}

// ── Chain sizing ────────────────────────────────────────────────────────────

/// Extend `chain` with freshly allocated blocks until it holds `len` bytes.
/// On `NoFreeBlocks` the chain is unchanged.
pub fn grow_chain(store: &BlockStore, chain: &mut Vec<BlockNumber>, len: u64) -> Result<()> {
    let needed = store.layout().blocks_for_len(len);
    let have = chain.len() as u64;
    if needed <= have {
        return Ok(());
    }
    let fresh = allocate(store, needed - have)?;
    if let Some(&tail) = chain.last() {
        store.set_next(tail, fresh[0])?;
    }
    chain.extend(fresh);
    Ok(())
}

/// Free the blocks of `chain` that are not needed to hold `len` bytes.
pub fn shrink_chain(store: &BlockStore, chain: &mut Vec<BlockNumber>, len: u64) -> Result<()> {
    let keep = usize::try_from(store.layout().blocks_for_len(len)).unwrap_or(usize::MAX);
    if keep >= chain.len() {
        return Ok(());
    }
    let dropped = chain.split_off(keep);
    if let Some(&tail) = chain.last() {
        store.set_next(tail, BlockNumber::NONE)?;
    }
    free_blocks(store, &dropped)
}

/// Free-block counter from the superblock.
pub fn free_block_count(store: &BlockStore) -> Result<u64> {
    store.read_sb_u64(SB_FREE_BLOCKS)
}
