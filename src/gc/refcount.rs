//! Reference counting
//!
//! Every counted slot (value stack entries, property values and keys,
//! prototype links, function internals, thread records) holds one reference.
//! When a count reaches zero outside mark-and-sweep:
//!
//! - strings and buffers are freed on the spot
//! - objects are queued on the refzero list, which is drained iteratively so
//!   freeing a long chain never recurses on the native stack
//!
//! A queued object with a finalizer gets it run first; the finalizer may
//! store the object somewhere and so rescue it.

use crate::context::Context;
use crate::error::{CallStatus, Result};
use crate::gc::{HeapBody, HeapHeader};
use crate::runtime::property::PropSlot;
use crate::runtime::props::{PropKey, ProtoWalk};
use crate::value::{HeapRef, ObjRef, StrRef, Value};

impl Context {
    #[inline]
    pub fn incref(&mut self, v: Value) {
        if let Some(r) = v.heap_ref() {
            self.heap.incref(r);
        }
    }

    #[inline]
    pub fn decref(&mut self, v: Value) {
        if let Some(r) = v.heap_ref() {
            self.decref_ref(r);
        }
    }

    #[inline]
    pub(crate) fn incref_ref(&mut self, r: HeapRef) {
        self.heap.incref(r);
    }

    pub(crate) fn decref_ref(&mut self, r: HeapRef) {
        if self.heap.decref(r) == Some(0) {
            self.refzero(r);
        }
    }

    /// Current reference count of a heap value, `None` for primitives and
    /// freed handles
    pub fn refcount(&self, v: Value) -> Option<u32> {
        v.heap_ref().and_then(|r| self.heap.refcount(r))
    }

    fn refzero(&mut self, r: HeapRef) {
        // Mark-and-sweep owns every free decision while it runs
        if self.gc.ms_running {
            return;
        }
        let Ok(cell) = self.heap.cell(r) else {
            return;
        };
        if cell.header.has(HeapHeader::PINNED) {
            return;
        }
        match cell.body {
            HeapBody::String(_) => self.free_string(StrRef(r)),
            HeapBody::Buffer(_) => {
                self.heap.free(r);
                tracing::trace!(target: "tinyrt::gc", handle = ?r, "buffer freed");
            }
            HeapBody::Object(_) => {
                self.gc.refzero_list.push_back(ObjRef(r));
                if !self.gc.refzero_running {
                    self.drain_refzero();
                }
            }
        }
    }

    pub(crate) fn free_string(&mut self, s: StrRef) {
        if let Ok(h) = self.heap.string(s) {
            let hash = h.hash();
            self.strings.remove(s, hash);
        }
        self.heap.free(s.0);
        tracing::trace!(target: "tinyrt::gc", handle = ?s.0, "string freed");
    }

    fn drain_refzero(&mut self) {
        self.gc.refzero_running = true;
        while let Some(obj) = self.gc.refzero_list.pop_front() {
            let Ok(h) = self.heap.header(obj.0) else {
                continue;
            };
            // Queued twice, or revived by an earlier finalizer
            if h.refcount() != 0 || h.has(HeapHeader::PINNED) {
                continue;
            }
            if !h.has(HeapHeader::FINALIZED) && self.finalizer_of(obj).is_some() {
                self.heap.incref(obj.0);
                if let Ok(h) = self.heap.header_mut(obj.0) {
                    h.set(HeapHeader::FINALIZED);
                }
                self.run_finalizer(obj, false);
                if self.heap.decref(obj.0) != Some(0) {
                    if let Ok(h) = self.heap.header_mut(obj.0) {
                        h.clear(HeapHeader::FINALIZED);
                    }
                    continue;
                }
            }
            self.free_object(obj);
        }
        self.gc.refzero_running = false;
    }

    /// Free an object and release everything it references
    fn free_object(&mut self, obj: ObjRef) {
        let mut children = Vec::new();
        if let Ok(o) = self.heap.object(obj) {
            o.heap_refs(&mut children);
        }
        self.forget_weak(obj.0);
        self.heap.free(obj.0);
        self.gc.refzero_frees += 1;
        tracing::trace!(target: "tinyrt::gc", handle = ?obj.0, children = children.len(), "refzero free");
        for child in children {
            self.decref_ref(child);
        }
        self.tick_trigger();
    }

    /// The finalizer an object inherits, if it is callable
    pub(crate) fn finalizer_of(&self, obj: ObjRef) -> Option<Value> {
        let key = PropKey::Str(self.keys.finalizer);
        let mut walk = ProtoWalk::new(Some(obj), self.config.proto_sanity);
        while let Ok(Some(cur)) = walk.next(&self.heap) {
            if let Ok(Some(p)) = self.own_prop(cur, key) {
                return match p.slot {
                    PropSlot::Data(v) if self.is_callable(v) => Some(v),
                    _ => None,
                };
            }
        }
        None
    }

    /// Run the finalizer of `obj` on the heap thread. Errors are logged and
    /// swallowed.
    pub(crate) fn run_finalizer(&mut self, obj: ObjRef, heap_destruct: bool) {
        let Some(f) = self.finalizer_of(obj) else {
            return;
        };
        let thr = self.roots.heap_thread;
        let heap_destruct = heap_destruct || self.is_destroying();
        let top = self.get_top(thr).unwrap_or(0);
        // An error may be unwinding around us; keep its value out of reach
        let saved_thrown = std::mem::replace(&mut self.thrown, Value::Undefined);
        self.gc.running_finalizers.push(obj.0);
        self.gc.finalizers_run += 1;

        match self.call_finalizer(thr, f, obj, heap_destruct) {
            Ok(CallStatus::Success) => {}
            Ok(CallStatus::Error) => {
                let error = self
                    .get(thr, -1)
                    .map(|v| self.value_summary(v))
                    .unwrap_or_default();
                tracing::warn!(handle = ?obj.0, %error, "finalizer threw");
            }
            Err(e) => tracing::warn!(handle = ?obj.0, error = %e, "finalizer could not run"),
        }

        if let Err(e) = self.set_top(thr, top) {
            tracing::warn!(handle = ?obj.0, error = %e, "stack not restored after finalizer");
        }
        let stray = std::mem::replace(&mut self.thrown, saved_thrown);
        self.decref(stray);
        if let Some(pos) = self.gc.running_finalizers.iter().rposition(|&r| r == obj.0) {
            self.gc.running_finalizers.remove(pos);
        }
    }

    fn call_finalizer(&mut self, thr: ObjRef, f: Value, obj: ObjRef, heap_destruct: bool) -> Result<CallStatus> {
        self.require_stack(thr, 4)?;
        self.push(thr, f)?;
        self.push(thr, Value::Undefined)?;
        self.push(thr, Value::Object(obj))?;
        self.push(thr, Value::Bool(heap_destruct))?;
        self.pcall(thr, 2)
    }

    /// Set (or with `undefined`, clear) the finalizer of the object at
    /// `obj_idx` from the value on top. `[finalizer]` -> `[]`
    pub fn set_finalizer(&mut self, thr: ObjRef, obj_idx: isize) -> Result<()> {
        let obj = self.get(thr, obj_idx)?;
        let f = self.get(thr, -1)?;
        let key = Value::String(self.keys.finalizer);
        self.put_raw(thr, obj, key, f, true)?;
        self.pop(thr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static FINALIZED: Cell<usize> = const { Cell::new(0) };
    }

    fn counting_finalizer(_ctx: &mut Context, _thr: ObjRef) -> Result<usize> {
        FINALIZED.with(|c| c.set(c.get() + 1));
        Ok(0)
    }

    #[test]
    fn test_strings_freed_at_zero() {
        let mut ctx = Context::new().unwrap();
        let s = ctx.intern("transient").unwrap();
        assert_eq!(ctx.refcount(Value::String(s)), Some(1));
        let used = ctx.strings.used();
        ctx.release(s);
        assert_eq!(ctx.refcount(Value::String(s)), None);
        assert_eq!(ctx.strings.used(), used - 1);
    }

    #[test]
    fn test_long_chain_frees_iteratively() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        let before = ctx.stats().objects;

        ctx.push_object(thr).unwrap();
        for _ in 0..50_000 {
            ctx.push_object(thr).unwrap();
            ctx.insert(thr, -2).unwrap();
            // [new outer] -> [new] with new.next = outer
            ctx.put_prop_str(thr, -2, "next", true).unwrap();
        }
        assert!(ctx.stats().objects >= before + 50_000);
        ctx.pop(thr).unwrap();
        assert_eq!(ctx.stats().objects, before);
    }

    #[test]
    fn test_finalizer_runs_once_on_refzero() {
        FINALIZED.with(|c| c.set(0));
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        ctx.push_object(thr).unwrap();
        ctx.push_native_function(thr, counting_finalizer, Some(2), 0).unwrap();
        ctx.set_finalizer(thr, -2).unwrap();
        ctx.pop(thr).unwrap();
        assert_eq!(FINALIZED.with(Cell::get), 1);
        assert_eq!(ctx.stats().finalizers_run, 1);
    }

    #[test]
    fn test_pinned_survive_zero() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        let obj = ctx.push_object(thr).unwrap();
        ctx.heap.header_mut(obj.0).unwrap().set(HeapHeader::PINNED);
        ctx.pop(thr).unwrap();
        assert!(ctx.heap.contains(obj.0));
    }
}
