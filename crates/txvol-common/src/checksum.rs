//! Block checksums
//!
//! Every block the store keeps carries a checksum computed when the block
//! is written and verified when it is read back.

use serde::{Deserialize, Serialize};

/// Checksum of one stored block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChecksum {
    /// CRC32C (fast inline verification)
    pub crc32c: u32,
    /// xxHash64 (guards against CRC collisions on large blocks)
    pub xxhash64: u64,
}

impl BlockChecksum {
    /// Compute the checksum of a block
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }

    /// Verify a block against this checksum
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c && xxhash_rust::xxh64::xxh64(data, 0) == self.xxhash64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_detects_corruption() {
        let mut block = vec![0xA5u8; 4096];
        let sum = BlockChecksum::compute(&block);
        assert!(sum.verify(&block));

        block[100] ^= 0x01;
        assert!(!sum.verify(&block));
    }
}
