#![forbid(unsafe_code)]
//! Block I/O layer for SimpleFS images.
//!
//! [`BlockStore`] pairs a [`ByteDevice`] with the image [`Layout`] and
//! exposes raw block operations: payload/next access, chain walking, and a
//! byte-stream view over a chain of linked data blocks. There is no block
//! cache; every call goes to the backing file so that other processes see
//! the same bytes.

pub mod device;
pub mod format;

pub use device::{ByteDevice, ByteRange, FileByteDevice, LockKind};

use sfs_error::{Result, SfsError};
use sfs_ondisk::{Layout, Superblock, parse_to_corruption};
use sfs_types::{
    BLOCK_POINTER_SIZE, BlockNumber, ByteOffset, INODE_RECORD_SIZE, InodeNumber, SUPERBLOCK_LEN,
    read_le_u64,
};
use tracing::trace;

/// Payload bytes of a data block plus its `next` pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub payload: Vec<u8>,
    pub next: BlockNumber,
}

/// Raw block access over one image.
pub struct BlockStore {
    dev: Box<dyn ByteDevice>,
    layout: Layout,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("layout", &self.layout)
            .field("len_bytes", &self.dev.len_bytes())
            .finish_non_exhaustive()
    }
}

impl BlockStore {
    pub fn new(dev: Box<dyn ByteDevice>, layout: Layout) -> Result<Self> {
        let len = dev.len_bytes();
        if len < layout.image_len() {
            return Err(SfsError::Format(format!(
                "backing file is {len} bytes, geometry needs {}",
                layout.image_len()
            )));
        }
        Ok(Self { dev, layout })
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn device(&self) -> &dyn ByteDevice {
        self.dev.as_ref()
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }

    pub fn block_byte_offset(&self, block: BlockNumber) -> Result<ByteOffset> {
        self.layout.block_byte_offset(block).ok_or_else(|| {
            SfsError::corruption(
                block.0,
                format!("block beyond image end {}", self.layout.total_blocks()),
            )
        })
    }

    /// Fail with `Corruption` unless `block` lies in the data area.
    pub fn check_data_block(&self, block: BlockNumber) -> Result<()> {
        if self.layout.bit_of(block).is_none() {
            return Err(SfsError::corruption(
                block.0,
                format!(
                    "not a data block (data area is {}..{})",
                    self.layout.data_start,
                    self.layout.total_blocks()
                ),
            ));
        }
        Ok(())
    }

    /// Byte range covering a whole block, used as a record lock.
    pub fn block_range(&self, block: BlockNumber) -> Result<ByteRange> {
        let offset = self.block_byte_offset(block)?;
        Ok(ByteRange::new(offset.0, u64::from(self.layout.block_size)))
    }

    // ── Superblock ──────────────────────────────────────────────────────

    pub fn read_superblock(&self) -> Result<Superblock> {
        let mut region = [0_u8; SUPERBLOCK_LEN];
        self.dev.read_exact_at(ByteOffset::ZERO, &mut region)?;
        Superblock::parse_from_bytes(&region).map_err(|err| parse_to_corruption(0, &err))
    }

    pub fn write_superblock(&self, sb: &Superblock) -> Result<()> {
        let mut region = [0_u8; SUPERBLOCK_LEN];
        sb.write_to_bytes(&mut region)
            .map_err(|err| parse_to_corruption(0, &err))?;
        self.dev.write_all_at(ByteOffset::ZERO, &region)
    }

    /// Read one u64 superblock field (see `sfs_ondisk::records::SB_*`).
    pub fn read_sb_u64(&self, field: usize) -> Result<u64> {
        let mut raw = [0_u8; 8];
        self.dev.read_exact_at(ByteOffset(field as u64), &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_sb_u64(&self, field: usize, value: u64) -> Result<()> {
        self.dev
            .write_all_at(ByteOffset(field as u64), &value.to_le_bytes())
    }

    // ── Bitmap ──────────────────────────────────────────────────────────

    /// Snapshot of every bitmap byte that carries a bit.
    pub fn read_bitmap(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.layout.bitmap_len_bytes())
            .map_err(|_| SfsError::Format("bitmap does not fit in memory".to_owned()))?;
        let mut bitmap = vec![0_u8; len];
        self.dev
            .read_exact_at(self.layout.bitmap_offset(), &mut bitmap)?;
        Ok(bitmap)
    }

    /// Write `bytes` into the bitmap starting at bitmap byte `first_byte`.
    pub fn write_bitmap_bytes(&self, first_byte: u64, bytes: &[u8]) -> Result<()> {
        let end = first_byte.saturating_add(bytes.len() as u64);
        if end > self.layout.bitmap_len_bytes() {
            return Err(SfsError::corruption(
                1,
                format!("bitmap write past end: {first_byte}+{}", bytes.len()),
            ));
        }
        let offset = ByteOffset(self.layout.bitmap_offset().0 + first_byte);
        self.dev.write_all_at(offset, bytes)
    }

    pub fn read_bitmap_byte(&self, index: u64) -> Result<u8> {
        if index >= self.layout.bitmap_len_bytes() {
            return Err(SfsError::corruption(1, format!("bitmap byte {index} out of range")));
        }
        let mut raw = [0_u8; 1];
        let offset = ByteOffset(self.layout.bitmap_offset().0 + index);
        self.dev.read_exact_at(offset, &mut raw)?;
        Ok(raw[0])
    }

    // ── Inode table records ─────────────────────────────────────────────

    fn inode_offset(&self, ino: InodeNumber) -> Result<ByteOffset> {
        self.layout.inode_offset(ino).ok_or_else(|| {
            SfsError::corruption(
                self.layout.first_inode_table_block,
                format!(
                    "inode {ino} outside table of {} slots",
                    self.layout.inode_count
                ),
            )
        })
    }

    pub fn read_inode_record(&self, ino: InodeNumber) -> Result<[u8; INODE_RECORD_SIZE]> {
        let offset = self.inode_offset(ino)?;
        let mut record = [0_u8; INODE_RECORD_SIZE];
        self.dev.read_exact_at(offset, &mut record)?;
        Ok(record)
    }

    pub fn write_inode_record(&self, ino: InodeNumber, record: &[u8; INODE_RECORD_SIZE]) -> Result<()> {
        let offset = self.inode_offset(ino)?;
        self.dev.write_all_at(offset, record)
    }

    /// Byte range of one inode record, used as a record lock.
    pub fn inode_range(&self, ino: InodeNumber) -> Result<ByteRange> {
        let offset = self.inode_offset(ino)?;
        Ok(ByteRange::new(offset.0, INODE_RECORD_SIZE as u64))
    }

    // ── Data blocks ─────────────────────────────────────────────────────

    fn next_offset(&self, block: BlockNumber) -> Result<ByteOffset> {
        self.check_data_block(block)?;
        let base = self.block_byte_offset(block)?;
        Ok(ByteOffset(base.0 + self.layout.payload_size() as u64))
    }

    pub fn read_block(&self, block: BlockNumber) -> Result<DataBlock> {
        self.check_data_block(block)?;
        let base = self.block_byte_offset(block)?;
        let mut raw = vec![0_u8; self.layout.block_size_usize()];
        self.dev.read_exact_at(base, &mut raw)?;
        let payload_len = self.layout.payload_size();
        let next = read_le_u64(&raw, payload_len).map_err(|err| parse_to_corruption(block.0, &err))?;
        raw.truncate(payload_len);
        Ok(DataBlock {
            payload: raw,
            next: BlockNumber(next),
        })
    }

    /// Overwrite the whole payload (zero-padded) and the next pointer.
    pub fn write_payload(&self, block: BlockNumber, payload: &[u8], next: BlockNumber) -> Result<()> {
        self.check_data_block(block)?;
        let payload_len = self.layout.payload_size();
        if payload.len() > payload_len {
            return Err(SfsError::Format(format!(
                "payload of {} bytes exceeds block payload {payload_len}",
                payload.len()
            )));
        }
        let mut raw = vec![0_u8; self.layout.block_size_usize()];
        raw[..payload.len()].copy_from_slice(payload);
        raw[payload_len..].copy_from_slice(&next.0.to_le_bytes());
        self.dev.write_all_at(self.block_byte_offset(block)?, &raw)
    }

    pub fn zero_block(&self, block: BlockNumber) -> Result<()> {
        self.write_payload(block, &[], BlockNumber::NONE)
    }

    pub fn find_next(&self, block: BlockNumber) -> Result<BlockNumber> {
        let mut raw = [0_u8; BLOCK_POINTER_SIZE];
        self.dev.read_exact_at(self.next_offset(block)?, &mut raw)?;
        Ok(BlockNumber(u64::from_le_bytes(raw)))
    }

    pub fn set_next(&self, block: BlockNumber, next: BlockNumber) -> Result<()> {
        self.dev
            .write_all_at(self.next_offset(block)?, &next.0.to_le_bytes())
    }

    /// Walk a chain starting at `first`. An empty chain (`first == 0`) yields
    /// no blocks. Out-of-range links and cycles are `Corruption`.
    pub fn chain(&self, first: BlockNumber) -> Result<Vec<BlockNumber>> {
        let mut blocks = Vec::new();
        let mut current = first;
        while !current.is_none() {
            self.check_data_block(current)?;
            if blocks.len() as u64 >= self.layout.number_of_blocks {
                return Err(SfsError::corruption(
                    current.0,
                    format!("chain starting at {first} loops"),
                ));
            }
            blocks.push(current);
            current = self.find_next(current)?;
        }
        trace!(first = first.0, len = blocks.len(), "walked chain");
        Ok(blocks)
    }

    /// Read `buf.len()` bytes at byte `offset` of the stream formed by the
    /// payloads of `chain`.
    pub fn read_chain_at(&self, chain: &[BlockNumber], offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0_usize;
        for (block, within, len) in self.spans(chain, offset, buf.len())? {
            let base = self.block_byte_offset(block)?;
            self.dev
                .read_exact_at(ByteOffset(base.0 + within), &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Write `data` at byte `offset` of the chain's payload stream; bytes
    /// outside `[offset, offset + data.len())` are untouched.
    pub fn write_chain_at(&self, chain: &[BlockNumber], offset: u64, data: &[u8]) -> Result<()> {
        let mut done = 0_usize;
        for (block, within, len) in self.spans(chain, offset, data.len())? {
            let base = self.block_byte_offset(block)?;
            self.dev
                .write_all_at(ByteOffset(base.0 + within), &data[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Split `[offset, offset + len)` into per-block `(block, offset in block, len)` spans.
    fn spans(
        &self,
        chain: &[BlockNumber],
        offset: u64,
        len: usize,
    ) -> Result<Vec<(BlockNumber, u64, usize)>> {
        let payload = self.layout.payload_size() as u64;
        let capacity = chain.len() as u64 * payload;
        let end = offset.saturating_add(len as u64);
        if end > capacity {
            let last = chain.last().map_or(0, |block| block.0);
            return Err(SfsError::corruption(
                last,
                format!("byte range {offset}..{end} exceeds chain capacity {capacity}"),
            ));
        }

        let mut spans = Vec::new();
        let mut pos = offset;
        while pos < end {
            let index = usize::try_from(pos / payload)
                .map_err(|_| SfsError::Format("chain index overflows usize".to_owned()))?;
            let within = pos % payload;
            let take = (payload - within).min(end - pos);
            // take <= payload, which came from a usize.
            #[allow(clippy::cast_possible_truncation)]
            spans.push((chain[index], within, take as usize));
            pos += take;
        }
        Ok(spans)
    }
}
