//! Slot arena for heap-allocated values
//!
//! Memory layout:
//! ```text
//! slots: [ Slot { generation, cell: Some(HeapCell) } ]   <- live allocation
//!        [ Slot { generation, cell: None } ]             <- on the free list
//!        [ ... ]
//! ```
//!
//! Every allocation is a `HeapCell`: a header with the reference count and
//! GC flags, plus a body (string, buffer or object). Handles carry the slot
//! generation, which is bumped on free, so a handle to a freed slot never
//! resolves to whatever is allocated there next.

use crate::error::{Error, Result};
use crate::runtime::buffer::HBuffer;
use crate::runtime::object::HObject;
use crate::runtime::string::HString;
use crate::value::{BufRef, HeapRef, ObjRef, StrRef};

/// Reference count and GC flag bits shared by every heap allocation
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapHeader {
    refcount: u32,
    flags: u8,
}

impl HeapHeader {
    /// Set by the mark phase
    pub const REACHABLE: u8 = 1 << 0;
    /// Queued on the mark work list
    pub const TEMPROOT: u8 = 1 << 1;
    /// Unreachable with a pending finalizer
    pub const FINALIZABLE: u8 = 1 << 2;
    /// Finalizer already ran for the current unreachability event
    pub const FINALIZED: u8 = 1 << 3;
    /// Referenced by at least one weak reference
    pub const WEAK_TARGET: u8 = 1 << 4;
    /// Runtime-owned root, never collected
    pub const PINNED: u8 = 1 << 5;

    #[inline]
    pub const fn refcount(&self) -> u32 {
        self.refcount
    }

    #[inline]
    pub const fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn set(&mut self, flag: u8) {
        self.flags |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u8) {
        self.flags &= !flag;
    }
}

/// Payload of a heap allocation
#[derive(Debug)]
pub enum HeapBody {
    String(HString),
    Buffer(HBuffer),
    Object(HObject),
}

impl HeapBody {
    /// Approximate bytes charged against the heap limit
    pub fn byte_size(&self) -> usize {
        let payload = match self {
            HeapBody::String(s) => s.len(),
            HeapBody::Buffer(b) => b.len(),
            HeapBody::Object(o) => o.byte_size(),
        };
        std::mem::size_of::<HeapCell>() + payload
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapBody::String(_) => "string",
            HeapBody::Buffer(_) => "buffer",
            HeapBody::Object(_) => "object",
        }
    }
}

/// A live allocation
#[derive(Debug)]
pub struct HeapCell {
    pub header: HeapHeader,
    pub body: HeapBody,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    cell: Option<HeapCell>,
    bytes: usize,
}

/// Counts of live allocations by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapCounts {
    pub objects: usize,
    pub strings: usize,
    pub buffers: usize,
}

/// The heap arena
///
/// Owns every string, buffer and object. Reference counting and collection
/// policy live in the `Context`; the arena only tracks slots, headers and
/// byte accounting.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    used_bytes: usize,
    max_bytes: usize,
    live: usize,
}

impl Heap {
    /// Create an empty heap with a byte limit
    pub fn new(max_bytes: usize) -> Self {
        Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            used_bytes: 0,
            max_bytes,
            live: 0,
        }
    }

    /// Bytes currently charged to live allocations
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    #[inline]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Number of live allocations
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Check whether `bytes` more would stay within the limit
    #[inline]
    pub fn can_alloc(&self, bytes: usize) -> bool {
        self.used_bytes.saturating_add(bytes) <= self.max_bytes
    }

    /// Allocate a cell with refcount zero
    pub fn alloc(&mut self, body: HeapBody) -> Result<HeapRef> {
        let bytes = body.byte_size();
        if !self.can_alloc(bytes) {
            return Err(Error::OutOfMemory);
        }

        let idx = match self.free_list.pop() {
            Some(idx) => idx as usize,
            None => {
                let idx = self.slots.len();
                if idx >= u32::MAX as usize {
                    return Err(Error::OutOfMemory);
                }
                self.slots.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
                self.slots.push(Slot::default());
                idx
            }
        };

        let slot = &mut self.slots[idx];
        debug_assert!(slot.cell.is_none(), "free list returned an occupied slot");
        slot.cell = Some(HeapCell {
            header: HeapHeader::default(),
            body,
        });
        slot.bytes = bytes;
        self.used_bytes = self.used_bytes.saturating_add(bytes);
        self.live += 1;

        Ok(HeapRef::new(idx as u32, slot.generation))
    }

    /// Release a slot, returning its body. Stale handles return `None`.
    pub fn free(&mut self, r: HeapRef) -> Option<HeapBody> {
        let idx = self.validate(r)?;
        let slot = &mut self.slots[idx];
        let cell = slot.cell.take()?;
        self.used_bytes = self.used_bytes.saturating_sub(slot.bytes);
        slot.bytes = 0;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(idx as u32);
        self.live -= 1;
        Some(cell.body)
    }

    /// Slot index for a live handle
    #[inline]
    pub fn validate(&self, r: HeapRef) -> Option<usize> {
        let idx = r.index() as usize;
        let slot = self.slots.get(idx)?;
        if slot.generation != r.generation() || slot.cell.is_none() {
            return None;
        }
        Some(idx)
    }

    #[inline]
    pub fn contains(&self, r: HeapRef) -> bool {
        self.validate(r).is_some()
    }

    pub fn cell(&self, r: HeapRef) -> Result<&HeapCell> {
        let idx = self.validate(r).ok_or_else(Error::invalid_handle)?;
        self.slots[idx].cell.as_ref().ok_or_else(Error::invalid_handle)
    }

    pub fn cell_mut(&mut self, r: HeapRef) -> Result<&mut HeapCell> {
        let idx = self.validate(r).ok_or_else(Error::invalid_handle)?;
        self.slots[idx].cell.as_mut().ok_or_else(Error::invalid_handle)
    }

    #[inline]
    pub fn header(&self, r: HeapRef) -> Result<&HeapHeader> {
        Ok(&self.cell(r)?.header)
    }

    #[inline]
    pub fn header_mut(&mut self, r: HeapRef) -> Result<&mut HeapHeader> {
        Ok(&mut self.cell_mut(r)?.header)
    }

    pub fn string(&self, s: StrRef) -> Result<&HString> {
        match &self.cell(s.0)?.body {
            HeapBody::String(h) => Ok(h),
            _ => Err(Error::invalid_handle()),
        }
    }

    pub fn buffer(&self, b: BufRef) -> Result<&HBuffer> {
        match &self.cell(b.0)?.body {
            HeapBody::Buffer(h) => Ok(h),
            _ => Err(Error::invalid_handle()),
        }
    }

    pub fn buffer_mut(&mut self, b: BufRef) -> Result<&mut HBuffer> {
        match &mut self.cell_mut(b.0)?.body {
            HeapBody::Buffer(h) => Ok(h),
            _ => Err(Error::invalid_handle()),
        }
    }

    pub fn object(&self, o: ObjRef) -> Result<&HObject> {
        match &self.cell(o.0)?.body {
            HeapBody::Object(h) => Ok(h),
            _ => Err(Error::invalid_handle()),
        }
    }

    pub fn object_mut(&mut self, o: ObjRef) -> Result<&mut HObject> {
        match &mut self.cell_mut(o.0)?.body {
            HeapBody::Object(h) => Ok(h),
            _ => Err(Error::invalid_handle()),
        }
    }

    /// Increment a refcount. Stale handles are ignored.
    #[inline]
    pub fn incref(&mut self, r: HeapRef) {
        if let Ok(h) = self.header_mut(r) {
            h.refcount = h.refcount.saturating_add(1);
            #[cfg(feature = "trace-refcount")]
            tracing::trace!(target: "tinyrt::refcount", handle = ?r, refcount = h.refcount, "incref");
        }
    }

    /// Decrement a refcount and return the new count, `None` for stale handles
    #[inline]
    pub fn decref(&mut self, r: HeapRef) -> Option<u32> {
        let h = self.header_mut(r).ok()?;
        debug_assert!(h.refcount > 0, "refcount underflow on {:?}", r);
        h.refcount = h.refcount.saturating_sub(1);
        #[cfg(feature = "trace-refcount")]
        tracing::trace!(target: "tinyrt::refcount", handle = ?r, refcount = h.refcount, "decref");
        Some(h.refcount)
    }

    /// Current refcount, `None` for stale handles
    pub fn refcount(&self, r: HeapRef) -> Option<u32> {
        self.header(r).ok().map(|h| h.refcount)
    }

    /// Re-measure a cell after its payload grew or shrank
    pub fn recharge(&mut self, r: HeapRef) {
        let Some(idx) = self.validate(r) else {
            return;
        };
        let slot = &mut self.slots[idx];
        let Some(cell) = &slot.cell else {
            return;
        };
        let new_bytes = cell.body.byte_size();
        self.used_bytes = self.used_bytes.saturating_sub(slot.bytes).saturating_add(new_bytes);
        slot.bytes = new_bytes;
    }

    /// Handles of every live allocation, in slot order
    pub fn live_refs(&self) -> Vec<HeapRef> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.cell.is_some())
            .map(|(i, s)| HeapRef::new(i as u32, s.generation))
            .collect()
    }

    /// Iterate over live allocations
    pub fn iter(&self) -> impl Iterator<Item = (HeapRef, &HeapCell)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.cell
                .as_ref()
                .map(|c| (HeapRef::new(i as u32, s.generation), c))
        })
    }

    /// Iterate mutably over live allocations
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (HeapRef, &mut HeapCell)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.cell
                .as_mut()
                .map(move |c| (HeapRef::new(i as u32, generation), c))
        })
    }

    pub fn counts(&self) -> HeapCounts {
        let mut counts = HeapCounts::default();
        for (_, cell) in self.iter() {
            match cell.body {
                HeapBody::String(_) => counts.strings += 1,
                HeapBody::Buffer(_) => counts.buffers += 1,
                HeapBody::Object(_) => counts.objects += 1,
            }
        }
        counts
    }
}
