//! String hashing
//!
//! Interned strings are hashed with a seeded MurmurHash2. Long strings are
//! not hashed in full: after an initial prefix, fixed-size blocks are sampled
//! at a stride that grows with the string length, which bounds hashing time
//! for very large strings.

/// Prefix hashed in full
const SHORT_STRING: usize = 4096;
/// Strings up to this length use the short stride
const MEDIUM_STRING: usize = 256 * 1024;
/// Size of each sampled block
const BLOCK_SIZE: usize = 256;

const M: u32 = 0x5bd1_e995;
const R: u32 = 24;

/// MurmurHash2 over `data` with the given seed
pub fn murmur2(data: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Hash an interned string's bytes
pub fn hash_string(data: &[u8], seed: u32) -> u32 {
    let len = data.len();
    let str_seed = seed ^ (len as u32);

    if len <= SHORT_STRING {
        return murmur2(data, str_seed);
    }

    let skip = if len <= MEDIUM_STRING {
        16 * BLOCK_SIZE + BLOCK_SIZE
    } else {
        256 * BLOCK_SIZE + BLOCK_SIZE
    };

    let mut hash = murmur2(&data[..SHORT_STRING], str_seed);
    let mut off = SHORT_STRING + (skip * (hash % 256) as usize) / 256;
    while off < len {
        let now = (len - off).min(BLOCK_SIZE);
        hash ^= murmur2(&data[off..off + now], str_seed);
        off += skip;
    }
    hash
}
