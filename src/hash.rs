//! Key hashing for shard selection and ring placement.
//!
//! MurmurHash3 (x64, 128-bit variant) is implemented in-crate because the
//! cluster depends on every node computing byte-identical hashes: the same
//! function positions virtual nodes on the ring and assigns keys to shards,
//! so the output must be stable across platforms and releases.
//!
//! WAL record checksums use CRC32 (IEEE) via the `crc32fast` crate.

/// Both 64-bit halves of a 128-bit MurmurHash3 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Murmur128 {
    pub h1: u64,
    pub h2: u64,
}

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[inline]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut block = [0u8; 8];
    block.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(block)
}

/// MurmurHash3_x64_128 — reference: github.com/aappleby/smhasher
pub fn murmur3_x64_128(data: &[u8], seed: u32) -> Murmur128 {
    let nblocks = data.len() / 16;

    let mut h1 = u64::from(seed);
    let mut h2 = u64::from(seed);

    // body
    for i in 0..nblocks {
        let mut k1 = read_u64_le(data, i * 16);
        let mut k2 = read_u64_le(data, i * 16 + 8);

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;

        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;

        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    // tail
    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;

    for i in (8..tail.len()).rev() {
        k2 ^= u64::from(tail[i]) << ((i - 8) * 8);
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
    }

    for i in (0..tail.len().min(8)).rev() {
        k1 ^= u64::from(tail[i]) << (i * 8);
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    // finalization
    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix64(h1);
    h2 = fmix64(h2);

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    Murmur128 { h1, h2 }
}

/// Primary 64-bit hash: the first half of the 128-bit digest, seed 0.
pub fn hash64(data: &[u8]) -> u64 {
    murmur3_x64_128(data, 0).h1
}

/// Primary 64-bit hash with an explicit seed.
pub fn hash64_seeded(data: &[u8], seed: u32) -> u64 {
    murmur3_x64_128(data, seed).h1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_deterministic_output() {
        assert_eq!(hash64(b"hello"), hash64(b"hello"));
        assert_eq!(
            murmur3_x64_128(b"hello", 7),
            murmur3_x64_128(b"hello", 7)
        );
    }

    #[test]
    fn test_different_keys_produce_different_hashes() {
        assert_ne!(hash64(b"key1"), hash64(b"key2"));
    }

    #[test]
    fn test_empty_input() {
        // The empty digest with seed 0 is all-zero by construction: no body,
        // no tail, and fmix64(0) == 0.
        let digest = murmur3_x64_128(b"", 0);
        assert_eq!(digest.h1, 0);
        assert_eq!(digest.h2, 0);
        assert_ne!(murmur3_x64_128(b"", 42).h1, 0);
    }

    #[test]
    fn test_seed_changes_output() {
        assert_ne!(hash64_seeded(b"test", 0), hash64_seeded(b"test", 42));
    }

    #[test]
    fn test_all_tail_lengths() {
        // Exercise every `len % 16` branch of the tail handling.
        let data: Vec<u8> = (0u8..48).collect();
        let mut seen = HashSet::new();
        for len in 0..=data.len() {
            seen.insert(murmur3_x64_128(&data[..len], 0).h1);
        }
        assert_eq!(seen.len(), data.len() + 1);
    }

    #[test]
    fn test_distribution() {
        // Hash 1000 sequential keys, verify no collisions.
        let mut hashes = HashSet::new();
        for i in 0..1000 {
            hashes.insert(hash64(format!("key_{i}").as_bytes()));
        }
        assert_eq!(hashes.len(), 1000);
    }

    #[test]
    fn test_full_result_128_bit() {
        let digest = murmur3_x64_128(b"hello", 0);
        assert_ne!(digest.h1, 0);
        assert_ne!(digest.h2, 0);
        assert_ne!(digest.h1, digest.h2);
    }

    #[test]
    fn test_crc32_known_vectors() {
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32fast::hash(b""), 0);
    }
}
