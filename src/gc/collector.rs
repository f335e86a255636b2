//! Mark-and-sweep collector
//!
//! Reclaims what reference counting cannot: cycles, and objects whose
//! refzero processing was suppressed while a collection was running.
//!
//! Phases:
//! 1. Mark everything reachable from the roots with an explicit work list
//! 2. Keep unreachable objects that have a finalizer (and all they reach)
//!    alive, flagged `FINALIZABLE`
//! 3. Drop the references held by the remaining unreachable objects so the
//!    refcounts of survivors stay exact
//! 4. Sweep objects, then strings and buffers
//! 5. Optional compaction and string table resize
//! 6. Run queued finalizers and reset the voluntary trigger

use crate::context::Context;
use crate::gc::{GcFlags, GcStats, HeapBody, HeapHeader};
use crate::value::{HeapRef, ObjRef, StrRef};

impl Context {
    /// Run a full mark-and-sweep collection.
    ///
    /// A collection requested while one is already running, or while the
    /// refcount path is draining its work list, is skipped
    /// (`GcStats::skipped`).
    pub fn collect(&mut self, flags: GcFlags) -> GcStats {
        if self.gc.collecting || self.gc.refzero_running {
            self.gc.trigger_skipped = true;
            return GcStats {
                skipped: true,
                ..GcStats::default()
            };
        }
        let span = tracing::debug_span!("gc", ?flags);
        let _enter = span.enter();
        tracing::debug!(bytes_used = self.heap.used_bytes(), "gc start");

        self.gc.collecting = true;
        self.gc.ms_running = true;
        let mut stats = GcStats::default();

        self.mark_roots();
        self.mark_finalizable(&mut stats);
        self.release_unreachable_children();
        self.sweep_objects(&mut stats);
        self.sweep_strings_and_buffers(&mut stats);

        if flags.contains(GcFlags::EMERGENCY) && !flags.contains(GcFlags::NO_OBJECT_COMPACTION) {
            self.compact_all();
        }
        if !flags.contains(GcFlags::NO_STRINGTABLE_RESIZE) && self.strings.wants_resize() {
            if let Err(e) = self.strings.resize(&self.heap) {
                tracing::debug!(error = %e, "string table resize failed");
            }
        }

        self.gc.ms_running = false;
        self.gc.gc_runs += 1;

        if !flags.contains(GcFlags::NO_FINALIZERS) {
            stats.finalizers_run = self.run_finalize_list();
        }

        self.gc.trigger = if self.gc.trigger_skipped {
            self.config.gc_trigger_skip
        } else {
            self.config.trigger_after(stats.kept)
        };
        self.gc.trigger_skipped = false;
        self.gc.collecting = false;

        tracing::debug!(
            kept = stats.kept,
            freed_objects = stats.freed_objects,
            freed_strings = stats.freed_strings,
            freed_buffers = stats.freed_buffers,
            finalizable = stats.finalizable,
            finalizers_run = stats.finalizers_run,
            bytes_used = self.heap.used_bytes(),
            "gc end"
        );
        stats
    }

    fn root_refs(&self, out: &mut Vec<HeapRef>) {
        self.roots.heap_refs(out);
        self.keys.heap_refs(out);
        out.extend(self.thrown.heap_ref());
        out.extend(self.curr_thread.map(|t| t.0));
        out.extend(self.thread_stack.iter().flatten().map(|t| t.0));
        out.extend(self.detached.iter().map(|t| t.0));
        out.extend(self.gc.refzero_list.iter().map(|o| o.0));
        out.extend(self.gc.finalize_list.iter().map(|o| o.0));
        out.extend(self.gc.running_finalizers.iter().copied());
        out.extend(
            self.heap
                .iter()
                .filter(|(_, c)| c.header.has(HeapHeader::PINNED))
                .map(|(r, _)| r),
        );
    }

    fn mark_push(&mut self, r: HeapRef, work: &mut Vec<HeapRef>) {
        let Ok(h) = self.heap.header_mut(r) else {
            return;
        };
        if h.has(HeapHeader::REACHABLE) {
            return;
        }
        h.set(HeapHeader::REACHABLE | HeapHeader::TEMPROOT);
        if work.try_reserve(1).is_err() {
            self.fatal("mark work list allocation failed");
        }
        work.push(r);
    }

    fn mark_drain(&mut self, work: &mut Vec<HeapRef>) {
        let mut children = Vec::new();
        while let Some(r) = work.pop() {
            children.clear();
            if let Ok(cell) = self.heap.cell_mut(r) {
                cell.header.clear(HeapHeader::TEMPROOT);
                if let HeapBody::Object(o) = &cell.body {
                    o.heap_refs(&mut children);
                }
            }
            for &child in &children {
                self.mark_push(child, work);
            }
        }
    }

    fn mark_roots(&mut self) {
        let mut roots = Vec::new();
        self.root_refs(&mut roots);
        let mut work = Vec::new();
        for r in roots {
            self.mark_push(r, &mut work);
        }
        self.mark_drain(&mut work);
    }

    fn mark_finalizable(&mut self, stats: &mut GcStats) {
        let candidates: Vec<ObjRef> = self
            .heap
            .iter()
            .filter(|(_, c)| {
                matches!(c.body, HeapBody::Object(_))
                    && !c.header.has(HeapHeader::REACHABLE)
                    && !c.header.has(HeapHeader::FINALIZED)
            })
            .map(|(r, _)| ObjRef(r))
            .collect();

        let mut work = Vec::new();
        for obj in candidates {
            if self.finalizer_of(obj).is_none() {
                continue;
            }
            if let Ok(h) = self.heap.header_mut(obj.0) {
                h.set(HeapHeader::FINALIZABLE);
            }
            stats.finalizable += 1;
            self.mark_push(obj.0, &mut work);
        }
        self.mark_drain(&mut work);
    }

    fn release_unreachable_children(&mut self) {
        let mut children = Vec::new();
        for (_, cell) in self.heap.iter() {
            if cell.header.has(HeapHeader::REACHABLE) {
                continue;
            }
            if let HeapBody::Object(o) = &cell.body {
                o.heap_refs(&mut children);
            }
        }
        // Raw decrements: refzero is off while marking is in effect
        for child in children {
            self.heap.decref(child);
        }
    }

    fn sweep_objects(&mut self, stats: &mut GcStats) {
        let objects: Vec<(HeapRef, HeapHeader)> = self
            .heap
            .iter()
            .filter(|(_, c)| matches!(c.body, HeapBody::Object(_)))
            .map(|(r, c)| (r, c.header))
            .collect();

        for (r, header) in objects {
            if header.has(HeapHeader::FINALIZABLE) {
                if let Ok(h) = self.heap.header_mut(r) {
                    h.clear(HeapHeader::FINALIZABLE | HeapHeader::REACHABLE);
                }
                self.gc.finalize_list.push(ObjRef(r));
                stats.kept += 1;
            } else if header.has(HeapHeader::REACHABLE) {
                let running = self.gc.running_finalizers.contains(&r);
                if let Ok(h) = self.heap.header_mut(r) {
                    h.clear(HeapHeader::REACHABLE);
                    // Reachable again after finalization: rescued
                    if !running {
                        h.clear(HeapHeader::FINALIZED);
                    }
                }
                stats.kept += 1;
            } else {
                self.forget_weak(r);
                self.heap.free(r);
                stats.freed_objects += 1;
            }
        }
    }

    fn sweep_strings_and_buffers(&mut self, stats: &mut GcStats) {
        let leaves: Vec<(HeapRef, HeapHeader, bool)> = self
            .heap
            .iter()
            .filter_map(|(r, c)| match c.body {
                HeapBody::String(_) => Some((r, c.header, true)),
                HeapBody::Buffer(_) => Some((r, c.header, false)),
                HeapBody::Object(_) => None,
            })
            .collect();

        for (r, header, is_string) in leaves {
            if header.has(HeapHeader::REACHABLE) || header.refcount() > 0 {
                if let Ok(h) = self.heap.header_mut(r) {
                    h.clear(HeapHeader::REACHABLE);
                }
                continue;
            }
            if is_string {
                self.free_string(StrRef(r));
                stats.freed_strings += 1;
            } else {
                self.heap.free(r);
                stats.freed_buffers += 1;
            }
        }
    }

    fn compact_all(&mut self) {
        let objects: Vec<HeapRef> = self
            .heap
            .iter()
            .filter(|(_, c)| matches!(c.body, HeapBody::Object(_)))
            .map(|(r, _)| r)
            .collect();
        for r in objects {
            if let Ok(o) = self.heap.object_mut(ObjRef(r)) {
                o.props.compact();
            }
            self.heap.recharge(r);
        }
    }

    /// Run every queued finalizer. Returns how many ran.
    fn run_finalize_list(&mut self) -> usize {
        if self.gc.finalizers_running {
            return 0;
        }
        self.gc.finalizers_running = true;
        let mut ran = 0;
        while let Some(obj) = self.gc.finalize_list.pop() {
            if !self.heap.contains(obj.0) {
                continue;
            }
            // The temporary reference keeps the object alive while its
            // finalizer runs; dropping it frees an unrescued object
            self.heap.incref(obj.0);
            if let Ok(h) = self.heap.header_mut(obj.0) {
                h.set(HeapHeader::FINALIZED);
            }
            self.run_finalizer(obj, false);
            ran += 1;
            self.decref_ref(obj.0);
        }
        self.gc.finalizers_running = false;
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_cycle_collected() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        let before = ctx.stats().objects;

        let a = ctx.push_object(thr).unwrap();
        let b = ctx.push_object(thr).unwrap();
        ctx.dup(thr, -1).unwrap();
        ctx.put_prop_str(thr, -3, "b", true).unwrap();
        ctx.dup(thr, -2).unwrap();
        ctx.put_prop_str(thr, -2, "a", true).unwrap();
        ctx.set_top(thr, 0).unwrap();

        // Each keeps the other alive by refcount
        assert!(ctx.heap.contains(a.0));
        assert!(ctx.heap.contains(b.0));

        let stats = ctx.collect(GcFlags::NONE);
        assert_eq!(stats.freed_objects, 2);
        assert!(!ctx.heap.contains(a.0));
        assert!(!ctx.heap.contains(b.0));
        assert_eq!(ctx.stats().objects, before);
    }

    #[test]
    fn test_reachable_survive_and_flags_cleared() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        let obj = ctx.push_object(thr).unwrap();
        let s = ctx.push_string(thr, "kept").unwrap();
        ctx.collect(GcFlags::NONE);
        assert!(ctx.heap.contains(obj.0));
        assert!(ctx.heap.contains(s.0));
        let h = ctx.heap.header(obj.0).unwrap();
        assert!(!h.has(HeapHeader::REACHABLE));
        assert!(!h.has(HeapHeader::TEMPROOT));
        assert_eq!(ctx.refcount(Value::Object(obj)), Some(1));
    }

    #[test]
    fn test_trigger_reset() {
        let mut ctx = Context::new().unwrap();
        let stats = ctx.collect(GcFlags::NONE);
        assert_eq!(ctx.gc.trigger, ctx.config.trigger_after(stats.kept));
        assert_eq!(ctx.stats().gc_runs, 1);
    }

    #[test]
    fn test_emergency_compacts() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        ctx.push_object(thr).unwrap();
        for i in 0..20 {
            ctx.push(thr, Value::number(i as f64)).unwrap();
            ctx.put_prop_str(thr, -2, &format!("k{i}"), true).unwrap();
        }
        for i in 0..19 {
            ctx.del_prop_str(thr, -1, &format!("k{i}"), true).unwrap();
        }
        let obj = ctx.get(thr, -1).unwrap().as_object().unwrap();
        let cap_before = ctx.heap.object(obj).unwrap().props.entry_capacity();
        ctx.collect(GcFlags::EMERGENCY);
        let cap_after = ctx.heap.object(obj).unwrap().props.entry_capacity();
        assert!(cap_after < cap_before);
        ctx.get_prop_str(thr, -1, "k19").unwrap();
        assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(19.0));
    }
}
