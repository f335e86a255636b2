//! Memory reclamation
//!
//! Two reclaimers share the arena. Reference counting frees most garbage
//! the moment its last counted reference goes away; mark-and-sweep picks up
//! cycles and anything the refcount path had to leave behind. Both run
//! finalizers with the same contract: a finalizer does not run twice for
//! one unreachability event, and a finalizer may rescue its object.

mod allocator;
mod collector;
mod refcount;
mod weak;

use std::collections::VecDeque;

pub use allocator::{Heap, HeapBody, HeapCell, HeapCounts, HeapHeader};
pub use weak::WeakId;
pub(crate) use weak::WeakTable;

use crate::context::Context;
use crate::value::{HeapRef, ObjRef};

/// Mark-and-sweep options
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GcFlags(u8);

impl GcFlags {
    pub const NONE: GcFlags = GcFlags(0);
    /// Last-resort collection on allocation failure; also compacts objects
    pub const EMERGENCY: GcFlags = GcFlags(1 << 0);
    /// Leave finalizable objects queued instead of running their finalizers
    pub const NO_FINALIZERS: GcFlags = GcFlags(1 << 1);
    pub const NO_OBJECT_COMPACTION: GcFlags = GcFlags(1 << 2);
    pub const NO_STRINGTABLE_RESIZE: GcFlags = GcFlags(1 << 3);

    #[inline]
    pub const fn contains(self, other: GcFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for GcFlags {
    type Output = GcFlags;

    fn bitor(self, rhs: GcFlags) -> GcFlags {
        GcFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for GcFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcFlags({:#06b})", self.0)
    }
}

/// Summary of one mark-and-sweep run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Objects that survived the sweep
    pub kept: usize,
    pub freed_objects: usize,
    pub freed_strings: usize,
    pub freed_buffers: usize,
    /// Objects moved to the finalize list
    pub finalizable: usize,
    pub finalizers_run: usize,
    /// The run was skipped because a collection was already in progress
    pub skipped: bool,
}

/// Heap-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub objects: usize,
    pub strings: usize,
    pub buffers: usize,
    pub strtab_size: usize,
    pub strtab_used: usize,
    pub bytes_used: usize,
    pub gc_runs: u64,
    pub refzero_frees: u64,
    pub finalizers_run: u64,
}

/// Reclaimer bookkeeping owned by the context
#[derive(Debug, Default)]
pub(crate) struct GcState {
    /// Mark-and-sweep is between marking and the end of the sweep; the
    /// refcount path must not free anything
    pub ms_running: bool,
    /// A `collect` call is in progress (including its finalizer phase)
    pub collecting: bool,
    pub refzero_running: bool,
    pub refzero_list: VecDeque<ObjRef>,
    /// Objects waiting for their finalizer
    pub finalize_list: Vec<ObjRef>,
    pub finalizers_running: bool,
    /// Objects whose finalizer is on the native stack right now
    pub running_finalizers: Vec<HeapRef>,
    /// Allocations and refzero frees left before a voluntary collection
    pub trigger: i64,
    /// A voluntary collection was requested while one was running
    pub trigger_skipped: bool,
    pub gc_runs: u64,
    pub refzero_frees: u64,
    pub finalizers_run: u64,
}

impl Context {
    /// Snapshot of heap counters
    pub fn stats(&self) -> HeapStats {
        let counts = self.heap.counts();
        HeapStats {
            objects: counts.objects,
            strings: counts.strings,
            buffers: counts.buffers,
            strtab_size: self.strings.size(),
            strtab_used: self.strings.used(),
            bytes_used: self.heap.used_bytes(),
            gc_runs: self.gc.gc_runs,
            refzero_frees: self.gc.refzero_frees,
            finalizers_run: self.gc.finalizers_run,
        }
    }

    /// Count down the voluntary trigger, collecting when it expires
    pub(crate) fn tick_trigger(&mut self) {
        #[cfg(feature = "gc-torture")]
        {
            self.gc.trigger = 0;
        }
        self.gc.trigger -= 1;
        if self.gc.trigger > 0 || !self.config.voluntary_gc {
            return;
        }
        if self.gc.collecting || self.gc.refzero_running {
            self.gc.trigger_skipped = true;
            return;
        }
        self.collect(GcFlags::NONE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let f = GcFlags::EMERGENCY | GcFlags::NO_FINALIZERS;
        assert!(f.contains(GcFlags::EMERGENCY));
        assert!(f.contains(GcFlags::NO_FINALIZERS));
        assert!(!f.contains(GcFlags::NO_STRINGTABLE_RESIZE));
        assert!(f.contains(GcFlags::NONE));
    }

    #[test]
    fn test_stats_track_allocations() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        let before = ctx.stats();
        ctx.push_object(thr).unwrap();
        ctx.push_string(thr, "stats probe").unwrap();
        let after = ctx.stats();
        assert_eq!(after.objects, before.objects + 1);
        assert_eq!(after.strings, before.strings + 1);
        assert_eq!(after.strtab_used, before.strtab_used + 1);
        assert!(after.bytes_used > before.bytes_used);
    }
}
