//! Key-to-partition assignment
//!
//! The mapping is a pure function of the key bytes and the partition count, so
//! every producer instance (and every restart) routes a symbol to the same
//! partition. It must not depend on process-seeded hashing.

use std::num::NonZeroU32;

/// Partition for `key` among `partitions`: first four bytes of the key's MD5
/// digest as a big-endian integer, modulo the partition count.
pub fn assign(key: &str, partitions: NonZeroU32) -> u32 {
    let digest = md5::compute(key.as_bytes()).0;
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    hash % partitions.get()
}
