//! Interned strings
//!
//! Every string in the heap is interned: identical byte sequences always
//! share one `HString`, so string equality is handle equality. Strings are
//! raw bytes (extended UTF-8, not validated). A leading `0xFF` byte, which
//! can never start valid UTF-8, marks an internal key hidden from scripts.

use std::cell::OnceCell;

use crate::error::{Error, Result};
use crate::gc::Heap;
use crate::util::{self, prime};
use crate::value::StrRef;

/// Prefix byte of internal keys
pub const INTERNAL_PREFIX: u8 = 0xFF;

/// Immutable interned string
#[derive(Debug)]
pub struct HString {
    data: Box<[u8]>,
    hash: u32,
    arr_idx: Option<u32>,
    clen: OnceCell<u32>,
}

impl HString {
    pub fn new(data: Box<[u8]>, hash: u32) -> Self {
        let arr_idx = util::array_index_of(&data);
        HString {
            data,
            hash,
            arr_idx,
            clen: OnceCell::new(),
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Byte length
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Array index this string denotes, if it is a canonical index
    #[inline]
    pub fn array_index(&self) -> Option<u32> {
        self.arr_idx
    }

    /// Character length, computed on first use
    pub fn char_len(&self) -> u32 {
        *self
            .clen
            .get_or_init(|| util::char_length(&self.data).min(u32::MAX as usize) as u32)
    }

    /// Internal keys are hidden from enumeration and scripts
    #[inline]
    pub fn is_internal(&self) -> bool {
        self.data.first() == Some(&INTERNAL_PREFIX)
    }

    /// Contents as `&str` when they are valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Lossy display form, used in error messages and debug output
    pub fn to_display(&self) -> String {
        if self.is_internal() {
            return format!("\\xff{}", String::from_utf8_lossy(&self.data[1..]));
        }
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Unused,
    Deleted,
    Used(StrRef),
}

/// Open-addressed intern table
///
/// Probing starts at `hash % size` and advances by a hash-derived prime
/// step. Deleted slots keep a tombstone until the next resize.
#[derive(Debug)]
pub struct StringTable {
    entries: Vec<Entry>,
    /// Used plus deleted slots
    occupied: usize,
    used: usize,
    resizes: usize,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    pub fn new() -> Self {
        StringTable {
            entries: vec![Entry::Unused; prime::MIN_SIZE],
            occupied: 0,
            used: 0,
            resizes: 0,
        }
    }

    /// Number of slots
    #[inline]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Number of live strings
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of resizes so far
    #[inline]
    pub fn resizes(&self) -> usize {
        self.resizes
    }

    /// Find an interned string by content
    pub fn lookup(&self, heap: &Heap, bytes: &[u8], hash: u32) -> Option<StrRef> {
        let size = self.entries.len();
        let step = prime::probe_step(hash);
        let mut i = hash as usize % size;
        for _ in 0..size {
            match self.entries[i] {
                Entry::Unused => return None,
                Entry::Deleted => {}
                Entry::Used(s) => {
                    if let Ok(h) = heap.string(s) {
                        if h.hash() == hash && h.as_bytes() == bytes {
                            return Some(s);
                        }
                    }
                }
            }
            i = (i + step) % size;
        }
        None
    }

    /// Insert a string known not to be present, resizing first if the
    /// load factor calls for it
    pub fn insert(&mut self, heap: &Heap, s: StrRef, hash: u32) -> Result<()> {
        if self.needs_resize(self.occupied + 1) {
            self.resize(heap)?;
        }
        // A reused tombstone was already counted as occupied
        if Self::place(&mut self.entries, s, hash) {
            self.occupied += 1;
        }
        self.used += 1;
        Ok(())
    }

    fn place(entries: &mut [Entry], s: StrRef, hash: u32) -> bool {
        let size = entries.len();
        let step = prime::probe_step(hash);
        let mut i = hash as usize % size;
        for _ in 0..size {
            match entries[i] {
                Entry::Unused => {
                    entries[i] = Entry::Used(s);
                    return true;
                }
                Entry::Deleted => {
                    entries[i] = Entry::Used(s);
                    return false;
                }
                Entry::Used(_) => {}
            }
            i = (i + step) % size;
        }
        debug_assert!(false, "string table full");
        false
    }

    /// Remove a string by handle; the string body is freed by the caller
    pub fn remove(&mut self, s: StrRef, hash: u32) -> bool {
        let size = self.entries.len();
        let step = prime::probe_step(hash);
        let mut i = hash as usize % size;
        for _ in 0..size {
            match self.entries[i] {
                Entry::Unused => return false,
                Entry::Used(x) if x == s => {
                    self.entries[i] = Entry::Deleted;
                    self.used -= 1;
                    return true;
                }
                _ => {}
            }
            i = (i + step) % size;
        }
        false
    }

    /// Whether the load factor is outside the comfortable range
    pub fn wants_resize(&self) -> bool {
        self.needs_resize(self.occupied)
    }

    fn needs_resize(&self, new_occupied: usize) -> bool {
        let size = self.entries.len();
        let free = size.saturating_sub(new_occupied);
        free <= size / 4 || (size > prime::MIN_SIZE && self.used + 1 <= size / 4)
    }

    /// Rehash into a table sized for the live strings, dropping tombstones
    pub fn resize(&mut self, heap: &Heap) -> Result<()> {
        let wanted = (self.used * 2).max(prime::MIN_SIZE);
        let new_size = prime::prime_at_least(wanted).ok_or(Error::OutOfMemory)?;

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(new_size)
            .map_err(|_| Error::OutOfMemory)?;
        entries.resize(new_size, Entry::Unused);

        for e in &self.entries {
            if let Entry::Used(s) = *e {
                let hash = heap.string(s).map(|h| h.hash())?;
                Self::place(&mut entries, s, hash);
            }
        }

        tracing::debug!(
            old_size = self.entries.len(),
            new_size,
            used = self.used,
            "string table resized"
        );
        self.entries = entries;
        self.occupied = self.used;
        self.resizes += 1;
        Ok(())
    }

    /// Iterate over live strings
    pub fn iter(&self) -> impl Iterator<Item = StrRef> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Used(s) => Some(*s),
            _ => None,
        })
    }
}
