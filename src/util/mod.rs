//! Utility functions
//!
//! Byte-level helpers shared by the string table and property code.

pub mod dtoa;
pub mod hash;
pub mod prime;

/// Check for a UTF-8 continuation byte (`10xxxxxx`)
#[inline]
const fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

/// Character length of extended UTF-8 bytes.
///
/// Every byte that is not a continuation byte starts a character, so
/// malformed input still gets a well-defined length.
pub fn char_length(bytes: &[u8]) -> usize {
    if bytes.is_ascii() {
        return bytes.len();
    }
    bytes.iter().filter(|&&b| !is_continuation(b)).count()
}

/// Byte range of the `index`th character, using the same character
/// boundaries as `char_length`
pub fn char_at(bytes: &[u8], index: usize) -> Option<&[u8]> {
    if bytes.is_ascii() {
        return bytes.get(index..index + 1);
    }
    let mut seen = 0usize;
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        if is_continuation(b) {
            continue;
        }
        if let Some(s) = start {
            return Some(&bytes[s..i]);
        }
        if seen == index {
            start = Some(i);
        }
        seen += 1;
    }
    start.map(|s| &bytes[s..])
}

/// Parse a canonical array index: decimal, no leading zeros, below `2^32 - 1`
pub fn array_index_of(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 10 {
        return None;
    }
    if bytes.len() > 1 && bytes[0] == b'0' {
        return None;
    }
    let mut n: u64 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n * 10 + (b - b'0') as u64;
    }
    if n < u32::MAX as u64 {
        Some(n as u32)
    } else {
        None
    }
}
