//! Fixed-capacity block storage with a self-describing bitmap allocator.
//!
//! A [`BlockStore`] is a flat array of [`NUM_BLOCKS`] blocks of
//! [`BLOCK_SIZE_BYTES`] bytes, addressed by integer id. A bitmap tracks
//! which blocks are in use, and the bitmap's own bytes live in a reserved
//! prefix of that same block array, so a serialized store is one contiguous
//! image carrying its allocation state inline.
//!
//! # Layout
//! =========================================
//! | Bitmap blocks (reserved) | Data blocks |
//! =========================================

mod bitvec;
mod store;

pub use store::{
    BlockStore, StoreError, BITMAP_NUM_BLOCKS, BITMAP_START_BLOCK, BLOCK_SIZE_BYTES,
    IMAGE_SIZE_BYTES, NUM_BLOCKS,
};
