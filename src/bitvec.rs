use std::ops::Range;

/// Number of bytes needed to hold `bits` bits.
pub const fn byte_count(bits: usize) -> usize {
    (bits + 7) / 8
}

/// A fixed-length bit vector overlaid on a byte range of a caller-owned
/// buffer. The vector allocates nothing of its own: it records only the bit
/// length and the byte range it covers, and every operation takes the backing
/// buffer as an argument. This lets the bitmap's storage live inside the very
/// block array it tracks.
///
/// Bit `i` maps to bit `i % 8` (least significant first) of byte `i / 8`
/// within the overlay range, so the packed bytes can be persisted verbatim
/// and reattached later without any re-encoding.
#[derive(Debug, Clone)]
pub struct BitVec {
    bits: usize,
    bytes: Range<usize>,
}

impl BitVec {
    /// Constructs a view of `bits` bits over the byte range `bytes` of some
    /// backing buffer. The range must hold at least `byte_count(bits)` bytes;
    /// a smaller range is a caller bug and panics.
    pub fn overlay(bits: usize, bytes: Range<usize>) -> Self {
        assert!(bits > 0, "bit vector must hold at least one bit");
        assert!(
            bytes.end - bytes.start >= byte_count(bits),
            "overlay range too small for bit count"
        );
        Self { bits, bytes }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    fn slot(&self, bit: usize) -> (usize, u8) {
        (self.bytes.start + bit / 8, 1u8 << (bit % 8))
    }

    pub fn test(&self, buf: &[u8], bit: usize) -> bool {
        assert!(bit < self.bits);
        let (byte, mask) = self.slot(bit);
        buf[byte] & mask != 0
    }

    pub fn set(&self, buf: &mut [u8], bit: usize) {
        assert!(bit < self.bits);
        let (byte, mask) = self.slot(bit);
        buf[byte] |= mask;
    }

    pub fn reset(&self, buf: &mut [u8], bit: usize) {
        assert!(bit < self.bits);
        let (byte, mask) = self.slot(bit);
        buf[byte] &= !mask;
    }

    /// Index of the lowest-indexed zero bit, or `None` once every bit is set.
    /// Slack bits in the final byte (past `len()`) are never reported.
    pub fn first_free(&self, buf: &[u8]) -> Option<usize> {
        let start = self.bytes.start;
        let packed = &buf[start..start + byte_count(self.bits)];
        for (i, &byte) in packed.iter().enumerate() {
            if byte == 0xff {
                continue;
            }
            let bit = i * 8 + byte.trailing_ones() as usize;
            // A hit past the logical length can only be a slack bit in the
            // final byte, which means every real bit below it is set.
            if bit < self.bits {
                return Some(bit);
            }
            return None;
        }
        None
    }

    /// Number of set bits, ignoring slack bits past `len()`.
    pub fn count_set(&self, buf: &[u8]) -> usize {
        let start = self.bytes.start;
        let full = self.bits / 8;
        let mut count: usize = buf[start..start + full]
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum();
        let tail = self.bits % 8;
        if tail != 0 {
            let mask = (1u8 << tail) - 1;
            count += (buf[start + full] & mask).count_ones() as usize;
        }
        count
    }
}
