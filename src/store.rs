use std::fs::File;
use std::io::{Read, Write};
use std::ops::Range;
use std::path::Path;

use log::{info, warn};
use thiserror::Error;

use crate::bitvec::{byte_count, BitVec};

/// Size of a single block in bytes.
pub const BLOCK_SIZE_BYTES: usize = 256;
/// Total number of blocks in a store. Fixed geometry, not configurable.
pub const NUM_BLOCKS: usize = 65536;
/// Size of a full store image: the block array laid out in block-id order.
pub const IMAGE_SIZE_BYTES: usize = NUM_BLOCKS * BLOCK_SIZE_BYTES;

/// The allocation bitmap lives in a reserved prefix of the block array it
/// describes. These blocks are claimed at creation time and can never be
/// released.
pub const BITMAP_START_BLOCK: usize = 0;
pub const BITMAP_NUM_BLOCKS: usize =
    (byte_count(NUM_BLOCKS) + BLOCK_SIZE_BYTES - 1) / BLOCK_SIZE_BYTES;

const BITMAP_BLOCKS: Range<usize> = BITMAP_START_BLOCK..BITMAP_START_BLOCK + BITMAP_NUM_BLOCKS;

fn bitmap_byte_range() -> Range<usize> {
    let start = BITMAP_START_BLOCK * BLOCK_SIZE_BYTES;
    start..start + BITMAP_NUM_BLOCKS * BLOCK_SIZE_BYTES
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("block id {0} out of range")]
    OutOfRange(usize),
    #[error("block {0} is already allocated")]
    AlreadyAllocated(usize),
    #[error("no free blocks available")]
    Exhausted,
    #[error("block {0} is reserved for the allocation bitmap")]
    ReservedBlock(usize),
    #[error("buffer holds {got} bytes but a block requires {need}")]
    ShortBuffer { need: usize, got: usize },
    #[error("image is {got} bytes, expected exactly {expected}")]
    BadImage { expected: u64, got: u64 },
    #[error("image i/o failed")]
    Io(#[from] std::io::Error),
}

/// A fixed array of `NUM_BLOCKS` blocks of `BLOCK_SIZE_BYTES` bytes each,
/// with a bitmap allocator tracking which blocks are in use.
///
/// The layout is self-describing: the bitmap's backing bytes occupy blocks
/// `BITMAP_START_BLOCK..BITMAP_START_BLOCK + BITMAP_NUM_BLOCKS` of the same
/// array, so serializing the block array captures the allocation state with
/// no separate metadata section.
///
/// Allocation and raw access are deliberately decoupled: `read` and `write`
/// never consult the bitmap, the same way a block device's I/O path is
/// unaware of whatever occupancy bookkeeping sits above it.
pub struct BlockStore {
    /// Single contiguous region backing both user data and the bitmap.
    blocks: Vec<u8>,
    /// View of `NUM_BLOCKS` bits over the reserved prefix of `blocks`.
    bitmap: BitVec,
}

impl BlockStore {
    /// Creates a zeroed store and claims the bitmap's own blocks through the
    /// ordinary request path, so a fresh store already reports them used.
    pub fn new() -> Self {
        let blocks = vec![0u8; IMAGE_SIZE_BYTES];
        let bitmap = BitVec::overlay(NUM_BLOCKS, bitmap_byte_range());
        let mut store = BlockStore { blocks, bitmap };
        for id in BITMAP_BLOCKS {
            store
                .request(id)
                .expect("zeroed bitmap cannot have claimed blocks");
        }
        store
    }

    /// Reattaches the bitmap overlay to a restored image. Occupancy is read
    /// straight from the restored bytes, never recomputed.
    fn from_image(blocks: Vec<u8>) -> Self {
        debug_assert_eq!(blocks.len(), IMAGE_SIZE_BYTES);
        let bitmap = BitVec::overlay(NUM_BLOCKS, bitmap_byte_range());
        BlockStore { blocks, bitmap }
    }

    /// Total block count of any store. Pure geometry, callable before any
    /// store exists.
    pub const fn total_blocks() -> usize {
        NUM_BLOCKS
    }

    pub fn used_blocks(&self) -> usize {
        self.bitmap.count_set(&self.blocks)
    }

    pub fn free_blocks(&self) -> usize {
        NUM_BLOCKS - self.used_blocks()
    }

    pub fn is_allocated(&self, id: usize) -> Result<bool, StoreError> {
        if id >= NUM_BLOCKS {
            return Err(StoreError::OutOfRange(id));
        }
        Ok(self.bitmap.test(&self.blocks, id))
    }

    /// Claims the lowest-indexed free block and returns its id.
    ///
    /// First-fit by construction: the lowest free index always wins, trading
    /// fragmentation behavior for simplicity and locality.
    pub fn allocate(&mut self) -> Result<usize, StoreError> {
        let id = self
            .bitmap
            .first_free(&self.blocks)
            .ok_or(StoreError::Exhausted)?;
        // The scan never reports slack bits, but the id still bounds-checks
        // before the bitmap is touched.
        if id >= NUM_BLOCKS {
            return Err(StoreError::Exhausted);
        }
        self.bitmap.set(&mut self.blocks, id);
        debug_assert!(self.bitmap.test(&self.blocks, id));
        Ok(id)
    }

    /// Claims a specific block id, for callers that need deterministic
    /// placement. Fails if the id is out of range or the block is taken.
    pub fn request(&mut self, id: usize) -> Result<(), StoreError> {
        if id >= NUM_BLOCKS {
            return Err(StoreError::OutOfRange(id));
        }
        if self.bitmap.test(&self.blocks, id) {
            return Err(StoreError::AlreadyAllocated(id));
        }
        self.bitmap.set(&mut self.blocks, id);
        // Trust the mutation only after reading it back.
        debug_assert!(self.bitmap.test(&self.blocks, id));
        Ok(())
    }

    /// Clears the allocation bit for `id`. Releasing an already-free block
    /// is an idempotent success; releasing one of the bitmap's own blocks is
    /// rejected, since handing that block out later would corrupt the
    /// allocator's view of itself.
    pub fn release(&mut self, id: usize) -> Result<(), StoreError> {
        if id >= NUM_BLOCKS {
            return Err(StoreError::OutOfRange(id));
        }
        if BITMAP_BLOCKS.contains(&id) {
            return Err(StoreError::ReservedBlock(id));
        }
        if !self.bitmap.test(&self.blocks, id) {
            warn!("releasing block {} which is already free", id);
        }
        self.bitmap.reset(&mut self.blocks, id);
        Ok(())
    }

    /// Copies block `id` into `buf` and returns the byte count copied,
    /// always `BLOCK_SIZE_BYTES`. Allocation state is not consulted; reading
    /// an unclaimed block returns whatever bytes live there (zeroes if never
    /// written).
    pub fn read(&self, id: usize, buf: &mut [u8]) -> Result<usize, StoreError> {
        if id >= NUM_BLOCKS {
            return Err(StoreError::OutOfRange(id));
        }
        if buf.len() < BLOCK_SIZE_BYTES {
            return Err(StoreError::ShortBuffer {
                need: BLOCK_SIZE_BYTES,
                got: buf.len(),
            });
        }
        let start = id * BLOCK_SIZE_BYTES;
        buf[..BLOCK_SIZE_BYTES].copy_from_slice(&self.blocks[start..start + BLOCK_SIZE_BYTES]);
        Ok(BLOCK_SIZE_BYTES)
    }

    /// Copies `BLOCK_SIZE_BYTES` bytes from `buf` into block `id` and
    /// returns the byte count copied. Like `read`, this ignores allocation
    /// state, so writing into a bitmap block will clobber allocator
    /// metadata.
    pub fn write(&mut self, id: usize, buf: &[u8]) -> Result<usize, StoreError> {
        if id >= NUM_BLOCKS {
            return Err(StoreError::OutOfRange(id));
        }
        if buf.len() < BLOCK_SIZE_BYTES {
            return Err(StoreError::ShortBuffer {
                need: BLOCK_SIZE_BYTES,
                got: buf.len(),
            });
        }
        let start = id * BLOCK_SIZE_BYTES;
        self.blocks[start..start + BLOCK_SIZE_BYTES].copy_from_slice(&buf[..BLOCK_SIZE_BYTES]);
        Ok(BLOCK_SIZE_BYTES)
    }

    /// Writes the full block array, bitmap bytes included, as one contiguous
    /// image. Returns the byte count written. I/O failures propagate without
    /// retry.
    pub fn serialize<W: Write>(&self, mut sink: W) -> Result<usize, StoreError> {
        sink.write_all(&self.blocks)?;
        sink.flush()?;
        Ok(IMAGE_SIZE_BYTES)
    }

    /// Reads exactly one image from `source` and reconstructs a store around
    /// it. The bitmap overlay reattaches to the restored bytes, so which
    /// blocks are marked used survives the round trip bit-exact.
    pub fn deserialize<R: Read>(mut source: R) -> Result<Self, StoreError> {
        let mut blocks = vec![0u8; IMAGE_SIZE_BYTES];
        source.read_exact(&mut blocks)?;
        Ok(Self::from_image(blocks))
    }

    /// Serializes to a file at `path`, creating or truncating it.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<usize, StoreError> {
        let file = File::create(&path)?;
        let written = self.serialize(&file)?;
        file.sync_all()?;
        info!(
            "wrote {} byte image to {}",
            written,
            path.as_ref().display()
        );
        Ok(written)
    }

    /// Deserializes a store from the file at `path`. Files whose length is
    /// not exactly one image are rejected before any bytes are read.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len != IMAGE_SIZE_BYTES as u64 {
            return Err(StoreError::BadImage {
                expected: IMAGE_SIZE_BYTES as u64,
                got: len,
            });
        }
        let store = Self::deserialize(&file)?;
        info!("loaded image from {}", path.as_ref().display());
        Ok(store)
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_reports_reserved_blocks_used() {
        let store = BlockStore::new();
        assert_eq!(store.used_blocks(), BITMAP_NUM_BLOCKS);
        assert_eq!(store.free_blocks(), NUM_BLOCKS - BITMAP_NUM_BLOCKS);
        for id in BITMAP_BLOCKS {
            assert!(store.is_allocated(id).unwrap());
        }
        assert!(!store.is_allocated(BITMAP_NUM_BLOCKS).unwrap());
    }

    #[test]
    fn total_blocks_is_queryable_without_a_store() {
        assert_eq!(BlockStore::total_blocks(), NUM_BLOCKS);
    }

    #[test]
    fn request_claims_block_exactly_once() {
        let mut store = BlockStore::new();

        store.request(100).unwrap();
        match store.request(100) {
            Err(StoreError::AlreadyAllocated(100)) => (),
            other => panic!("expected AlreadyAllocated, got {:?}", other.err()),
        }
    }

    #[test]
    fn request_rejects_out_of_range_ids() {
        let mut store = BlockStore::new();

        assert!(matches!(
            store.request(NUM_BLOCKS),
            Err(StoreError::OutOfRange(_))
        ));
        assert!(matches!(
            store.request(usize::MAX),
            Err(StoreError::OutOfRange(_))
        ));
    }

    #[test]
    fn allocate_returns_ascending_distinct_ids() {
        let mut store = BlockStore::new();
        let used_before = store.used_blocks();

        let ids: Vec<usize> = (0..8).map(|_| store.allocate().unwrap()).collect();
        let expected: Vec<usize> = (BITMAP_NUM_BLOCKS..BITMAP_NUM_BLOCKS + 8).collect();
        assert_eq!(ids, expected);
        assert_eq!(store.used_blocks(), used_before + 8);
    }

    #[test]
    fn allocate_fails_with_exhausted_once_store_is_full() {
        let mut store = BlockStore::new();

        for _ in 0..store.free_blocks() {
            store.allocate().unwrap();
        }
        assert_eq!(store.free_blocks(), 0);
        assert_eq!(store.used_blocks(), NUM_BLOCKS);
        assert!(matches!(store.allocate(), Err(StoreError::Exhausted)));
    }

    #[test]
    fn allocate_skips_requested_blocks() {
        let mut store = BlockStore::new();

        store.request(BITMAP_NUM_BLOCKS).unwrap();
        assert_eq!(store.allocate().unwrap(), BITMAP_NUM_BLOCKS + 1);
    }

    #[test]
    fn released_block_is_reused_lowest_first() {
        let mut store = BlockStore::new();

        let a = store.allocate().unwrap();
        let b = store.allocate().unwrap();
        assert!(a < b);

        let used = store.used_blocks();
        store.release(a).unwrap();
        assert_eq!(store.used_blocks(), used - 1);
        assert_eq!(store.allocate().unwrap(), a);
    }

    #[test]
    fn releasing_free_block_is_idempotent() {
        let mut store = BlockStore::new();

        let id = store.allocate().unwrap();
        store.release(id).unwrap();
        store.release(id).unwrap();
        assert!(!store.is_allocated(id).unwrap());
    }

    #[test]
    fn releasing_bitmap_block_is_rejected() {
        let mut store = BlockStore::new();

        for id in BITMAP_BLOCKS {
            assert!(matches!(
                store.release(id),
                Err(StoreError::ReservedBlock(_))
            ));
        }
        assert_eq!(store.used_blocks(), BITMAP_NUM_BLOCKS);
    }

    #[test]
    fn read_write_round_trip_one_block() {
        let mut store = BlockStore::new();

        let data = [0x55u8; BLOCK_SIZE_BYTES];
        assert_eq!(store.write(40, &data).unwrap(), BLOCK_SIZE_BYTES);

        let mut out = [0u8; BLOCK_SIZE_BYTES];
        assert_eq!(store.read(40, &mut out).unwrap(), BLOCK_SIZE_BYTES);
        assert_eq!(out[..], data[..]);
    }

    #[test]
    fn read_write_ignore_allocation_state() {
        let mut store = BlockStore::new();

        // Block was never allocated; raw access still works.
        let data = [0x0fu8; BLOCK_SIZE_BYTES];
        store.write(500, &data).unwrap();
        assert!(!store.is_allocated(500).unwrap());

        let mut out = [0u8; BLOCK_SIZE_BYTES];
        store.read(500, &mut out).unwrap();
        assert_eq!(out[..], data[..]);
    }

    #[test]
    fn unwritten_block_reads_back_zeroed() {
        let store = BlockStore::new();

        let mut out = [0xffu8; BLOCK_SIZE_BYTES];
        store.read(NUM_BLOCKS - 1, &mut out).unwrap();
        assert_eq!(out[..], [0u8; BLOCK_SIZE_BYTES][..]);
    }

    #[test]
    fn read_write_reject_bad_arguments() {
        let mut store = BlockStore::new();
        let mut buf = [0u8; BLOCK_SIZE_BYTES];

        assert!(matches!(
            store.read(NUM_BLOCKS, &mut buf),
            Err(StoreError::OutOfRange(_))
        ));
        assert!(matches!(
            store.write(NUM_BLOCKS, &buf),
            Err(StoreError::OutOfRange(_))
        ));

        let mut short = [0u8; BLOCK_SIZE_BYTES - 1];
        assert!(matches!(
            store.read(0, &mut short),
            Err(StoreError::ShortBuffer { .. })
        ));
        assert!(matches!(
            store.write(0, &short),
            Err(StoreError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn serialize_into_memory_produces_one_image() {
        let mut store = BlockStore::new();
        store.allocate().unwrap();

        let mut image = Vec::new();
        assert_eq!(store.serialize(&mut image).unwrap(), IMAGE_SIZE_BYTES);
        assert_eq!(image.len(), IMAGE_SIZE_BYTES);

        let restored = BlockStore::deserialize(image.as_slice()).unwrap();
        assert_eq!(restored.used_blocks(), store.used_blocks());
    }

    #[test]
    fn deserialize_rejects_truncated_source() {
        let short = vec![0u8; IMAGE_SIZE_BYTES - 1];
        assert!(matches!(
            BlockStore::deserialize(short.as_slice()),
            Err(StoreError::Io(_))
        ));
    }
}
