//! Property storage
//!
//! Each object stores its own properties in up to three parts:
//!
//! - entry part: insertion-ordered `PropEntry` records (string keys, any
//!   attributes, data or accessor slots). Deleted entries keep their
//!   position with `key: None` until the next reallocation.
//! - array part: dense `Option<Value>` slots for index keys with default
//!   attributes. Absent once abandoned.
//! - hash part: prime-sized open-addressed table of entry indices, built
//!   only once the entry part reaches `E_USE_HASH_LIMIT` slots.
//!
//! This module is pure storage: it never touches reference counts. The
//! `Context` increfs what it stores and decrefs what these methods return.

use crate::util::prime;
use crate::value::{HeapRef, ObjRef, StrRef, Value};

/// Hash slot marker: never used
pub const HASHIDX_UNUSED: u32 = 0xffff_ffff;
/// Hash slot marker: entry deleted
pub const HASHIDX_DELETED: u32 = 0xffff_fffe;

/// Entry part size at which a hash part is built
pub const E_USE_HASH_LIMIT: usize = 32;
/// Array writes below `9 * ((a_size + 7) >> 3)` grow without a density check
pub const A_FAST_RESIZE_LIMIT: u32 = 9;
/// Abandon when `used < 2 * (size >> 3)`, i.e. under 25 % dense
pub const A_ABANDON_LIMIT: u32 = 2;

/// Property attribute bits
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropFlags(u8);

impl PropFlags {
    pub const NONE: PropFlags = PropFlags(0);
    pub const WRITABLE: PropFlags = PropFlags(1 << 0);
    pub const ENUMERABLE: PropFlags = PropFlags(1 << 1);
    pub const CONFIGURABLE: PropFlags = PropFlags(1 << 2);
    pub const ACCESSOR: PropFlags = PropFlags(1 << 3);
    /// Writable, enumerable and configurable: what a plain assignment creates
    pub const DEFAULT: PropFlags = PropFlags(0b111);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        PropFlags(bits & 0b1111)
    }

    #[inline]
    pub const fn contains(self, other: PropFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: PropFlags) -> Self {
        PropFlags(self.0 | other.0)
    }

    #[inline]
    pub const fn without(self, other: PropFlags) -> Self {
        PropFlags(self.0 & !other.0)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[inline]
    pub const fn is_enumerable(self) -> bool {
        self.contains(Self::ENUMERABLE)
    }

    #[inline]
    pub const fn is_configurable(self) -> bool {
        self.contains(Self::CONFIGURABLE)
    }

    #[inline]
    pub const fn is_accessor(self) -> bool {
        self.contains(Self::ACCESSOR)
    }
}

impl std::ops::BitOr for PropFlags {
    type Output = PropFlags;

    fn bitor(self, rhs: PropFlags) -> PropFlags {
        self.union(rhs)
    }
}

impl std::fmt::Debug for PropFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = |flag: PropFlags, ch: char| if self.contains(flag) { ch } else { '-' };
        write!(
            f,
            "PropFlags({}{}{}{})",
            c(Self::WRITABLE, 'w'),
            c(Self::ENUMERABLE, 'e'),
            c(Self::CONFIGURABLE, 'c'),
            c(Self::ACCESSOR, 'a')
        )
    }
}

/// Value slot of a property
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropSlot {
    Data(Value),
    Accessor {
        get: Option<ObjRef>,
        set: Option<ObjRef>,
    },
}

impl PropSlot {
    /// Push every heap handle this slot holds
    pub fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        match self {
            PropSlot::Data(v) => out.extend(v.heap_ref()),
            PropSlot::Accessor { get, set } => {
                out.extend(get.map(|o| o.0));
                out.extend(set.map(|o| o.0));
            }
        }
    }
}

/// One entry part record
#[derive(Debug, Clone, Copy)]
pub struct PropEntry {
    /// `None` marks a deleted entry
    pub key: Option<StrRef>,
    /// Hash of the key string, cached for hash-part rebuilds
    pub hash: u32,
    pub slot: PropSlot,
    pub flags: PropFlags,
}

impl PropEntry {
    const DELETED: PropEntry = PropEntry {
        key: None,
        hash: 0,
        slot: PropSlot::Data(Value::Undefined),
        flags: PropFlags::NONE,
    };
}

/// Where an own property lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Array(u32),
    Entry(usize),
}

/// How an index write past the array part should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayWrite {
    /// Index is within the current array part
    InBounds,
    /// Grow the array part to cover the index
    Grow,
    /// The array part would become too sparse
    Abandon,
}

/// Minimum growth step for both parts
#[inline]
fn min_grow(n: usize) -> usize {
    (n + 16) / 8
}

/// Per-object property storage
#[derive(Debug, Default)]
pub struct PropertyStorage {
    entries: Vec<PropEntry>,
    e_size: usize,
    live: usize,
    array: Vec<Option<Value>>,
    has_array_part: bool,
    hash: Vec<u32>,
}

impl PropertyStorage {
    /// Storage with entry part only
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage with an (empty) array part, as used by arrays
    pub fn with_array_part() -> Self {
        PropertyStorage {
            has_array_part: true,
            ..Self::default()
        }
    }

    /// Number of live entry-part properties
    #[inline]
    pub fn entry_count(&self) -> usize {
        self.live
    }

    /// Entry part capacity, deleted entries included
    #[inline]
    pub fn entry_capacity(&self) -> usize {
        self.e_size
    }

    #[inline]
    pub fn has_array_part(&self) -> bool {
        self.has_array_part
    }

    #[inline]
    pub fn has_hash_part(&self) -> bool {
        !self.hash.is_empty()
    }

    /// Allocated array part length
    #[inline]
    pub fn array_size(&self) -> usize {
        self.array.len()
    }

    /// Number of non-empty array slots
    pub fn array_used(&self) -> usize {
        self.array.iter().filter(|v| v.is_some()).count()
    }

    /// Number of own properties in both parts
    pub fn len(&self) -> usize {
        self.live + self.array_used()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find an entry by interned key
    pub fn find_entry(&self, key: StrRef, hash: u32) -> Option<usize> {
        if self.hash.is_empty() {
            return self.entries.iter().position(|e| e.key == Some(key));
        }

        let size = self.hash.len();
        let step = prime::probe_step(hash);
        let mut i = hash as usize % size;
        for _ in 0..size {
            match self.hash[i] {
                HASHIDX_UNUSED => return None,
                HASHIDX_DELETED => {}
                idx => {
                    let e = &self.entries[idx as usize];
                    if e.key == Some(key) {
                        return Some(idx as usize);
                    }
                }
            }
            i = (i + step) % size;
        }
        None
    }

    #[inline]
    pub fn entry(&self, i: usize) -> &PropEntry {
        &self.entries[i]
    }

    #[inline]
    pub fn entry_mut(&mut self, i: usize) -> &mut PropEntry {
        &mut self.entries[i]
    }

    /// Live entries in insertion order
    pub fn entries(&self) -> impl Iterator<Item = (usize, &PropEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.key.is_some())
    }

    /// Append an entry. The key must not already be present.
    pub fn insert_entry(&mut self, key: StrRef, hash: u32, slot: PropSlot, flags: PropFlags) -> usize {
        debug_assert!(self.find_entry(key, hash).is_none(), "duplicate property key");
        if self.entries.len() >= self.e_size {
            let new_size = self.live + min_grow(self.live).max(1);
            self.realloc_entries(new_size);
        }

        let idx = self.entries.len();
        self.entries.push(PropEntry {
            key: Some(key),
            hash,
            slot,
            flags,
        });
        self.live += 1;
        if !self.hash.is_empty() {
            Self::hash_place(&mut self.hash, hash, idx as u32);
        }
        idx
    }

    /// Remove an entry, returning it so the caller can release its references
    pub fn remove_entry(&mut self, i: usize) -> PropEntry {
        let old = std::mem::replace(&mut self.entries[i], PropEntry::DELETED);
        if old.key.is_some() {
            self.live -= 1;
            if !self.hash.is_empty() {
                let size = self.hash.len();
                let step = prime::probe_step(old.hash);
                let mut h = old.hash as usize % size;
                for _ in 0..size {
                    if self.hash[h] == i as u32 {
                        self.hash[h] = HASHIDX_DELETED;
                        break;
                    }
                    if self.hash[h] == HASHIDX_UNUSED {
                        break;
                    }
                    h = (h + step) % size;
                }
            }
        }
        old
    }

    fn hash_place(hash: &mut [u32], key_hash: u32, idx: u32) {
        let size = hash.len();
        let step = prime::probe_step(key_hash);
        let mut i = key_hash as usize % size;
        for _ in 0..size {
            if hash[i] == HASHIDX_UNUSED || hash[i] == HASHIDX_DELETED {
                hash[i] = idx;
                return;
            }
            i = (i + step) % size;
        }
        debug_assert!(false, "property hash part full");
    }

    /// Drop deleted entries and resize the entry part to `new_size` slots
    fn realloc_entries(&mut self, new_size: usize) {
        debug_assert!(new_size >= self.live);
        self.entries.retain(|e| e.key.is_some());
        self.entries.shrink_to(new_size);
        self.entries.reserve_exact(new_size.saturating_sub(self.entries.len()));
        self.e_size = new_size;
        self.rebuild_hash();
    }

    fn rebuild_hash(&mut self) {
        if self.e_size < E_USE_HASH_LIMIT {
            self.hash = Vec::new();
            return;
        }
        let wanted = self.e_size + self.e_size / 4;
        // Past the prime table, fall back to a size well above the entry count
        let size = prime::prime_at_least(wanted).unwrap_or(wanted * 2 + 1);
        let mut hash = vec![HASHIDX_UNUSED; size];
        for (i, e) in self.entries.iter().enumerate() {
            if e.key.is_some() {
                Self::hash_place(&mut hash, e.hash, i as u32);
            }
        }
        self.hash = hash;
    }

    /// Value in the array part, `None` for holes and out-of-range indices
    #[inline]
    pub fn array_get(&self, idx: u32) -> Option<Value> {
        if !self.has_array_part {
            return None;
        }
        self.array.get(idx as usize).copied().flatten()
    }

    /// Decide how an index write interacts with the array part
    pub fn classify_array_write(&self, idx: u32) -> ArrayWrite {
        let size = self.array.len() as u32;
        if idx < size {
            return ArrayWrite::InBounds;
        }
        let fast_limit = A_FAST_RESIZE_LIMIT.saturating_mul((size + 7) >> 3);
        if idx <= fast_limit {
            return ArrayWrite::Grow;
        }
        let used = self.array_used() as u32;
        let new_size = idx.saturating_add(1);
        if used < A_ABANDON_LIMIT.saturating_mul(new_size >> 3) {
            ArrayWrite::Abandon
        } else {
            ArrayWrite::Grow
        }
    }

    /// Store into the array part, growing it as needed. Returns the old value.
    pub fn array_store(&mut self, idx: u32, value: Value) -> Option<Value> {
        debug_assert!(self.has_array_part);
        let i = idx as usize;
        if i >= self.array.len() {
            let n = i + 1;
            let new_len = n + min_grow(n);
            self.array.resize(new_len, None);
        }
        self.array[i].replace(value)
    }

    /// Clear an array slot, returning the old value
    pub fn array_take(&mut self, idx: u32) -> Option<Value> {
        self.array.get_mut(idx as usize).and_then(Option::take)
    }

    /// Remove every array slot at or above `len`, returning the removed values
    pub fn array_truncate(&mut self, len: u32) -> Vec<Value> {
        let len = len as usize;
        if len >= self.array.len() {
            return Vec::new();
        }
        let removed = self.array.split_off(len);
        removed.into_iter().flatten().collect()
    }

    /// Present array slots in ascending index order
    pub fn array_items(&self) -> impl Iterator<Item = (u32, Value)> + '_ {
        self.array
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i as u32, v)))
    }

    /// Check whether a compaction would find the array part too sparse
    pub fn array_too_sparse(&self) -> bool {
        if !self.has_array_part {
            return false;
        }
        let size = self.array.len() as u32;
        (self.array_used() as u32) < A_ABANDON_LIMIT * (size >> 3)
    }

    /// Move array slots into the entry part under the given keys.
    ///
    /// `keys` are the interned index strings of `array_items()` in the same
    /// order; ownership of one reference per key transfers to the entries.
    pub fn abandon_array_part(&mut self, keys: &[(StrRef, u32)]) {
        let items: Vec<(u32, Value)> = self.array_items().collect();
        debug_assert_eq!(items.len(), keys.len());

        let needed = self.live + items.len();
        if self.e_size < needed {
            self.realloc_entries(needed + min_grow(needed));
        }
        for ((_, value), &(key, hash)) in items.into_iter().zip(keys) {
            self.insert_entry(key, hash, PropSlot::Data(value), PropFlags::DEFAULT);
        }
        self.array = Vec::new();
        self.has_array_part = false;
    }

    /// Rebuild both parts without spare capacity
    pub fn compact(&mut self) {
        let live = self.live;
        self.realloc_entries(live);
        self.entries.shrink_to_fit();
        if self.has_array_part {
            let used_len = self
                .array
                .iter()
                .rposition(|v| v.is_some())
                .map_or(0, |i| i + 1);
            self.array.truncate(used_len);
            self.array.shrink_to_fit();
        }
    }

    /// Every heap handle held by keys and values
    pub fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        for (_, e) in self.entries() {
            out.extend(e.key.map(|k| k.0));
            e.slot.heap_refs(out);
        }
        for v in self.array.iter().flatten() {
            out.extend(v.heap_ref());
        }
    }

    /// Approximate payload bytes
    pub fn byte_size(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<PropEntry>()
            + self.array.capacity() * std::mem::size_of::<Option<Value>>()
            + self.hash.capacity() * std::mem::size_of::<u32>()
    }
}
