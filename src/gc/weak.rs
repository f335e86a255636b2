//! Weak references
//!
//! A side table from weak ids to object handles. Entries do not keep their
//! target alive and are never roots; freeing a target drops its entries.

use std::collections::HashMap;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::gc::HeapHeader;
use crate::value::{HeapRef, ObjRef, Value};

/// Weak reference id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeakId(u64);

#[derive(Debug, Default)]
pub(crate) struct WeakTable {
    next_id: u64,
    map: HashMap<WeakId, HeapRef>,
    by_target: HashMap<HeapRef, Vec<WeakId>>,
}

impl WeakTable {
    fn insert(&mut self, target: HeapRef) -> WeakId {
        let id = WeakId(self.next_id);
        self.next_id += 1;
        self.map.insert(id, target);
        self.by_target.entry(target).or_default().push(id);
        id
    }

    fn get(&self, id: WeakId) -> Option<HeapRef> {
        self.map.get(&id).copied()
    }

    /// Remove one entry. Returns the target when it has no entries left.
    fn remove(&mut self, id: WeakId) -> Option<HeapRef> {
        let target = self.map.remove(&id)?;
        let ids = self.by_target.get_mut(&target)?;
        ids.retain(|&i| i != id);
        if ids.is_empty() {
            self.by_target.remove(&target);
            return Some(target);
        }
        None
    }

    /// Drop every entry pointing at `target`
    pub(crate) fn forget_target(&mut self, target: HeapRef) -> usize {
        let Some(ids) = self.by_target.remove(&target) else {
            return 0;
        };
        for id in &ids {
            self.map.remove(id);
        }
        ids.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

impl Context {
    /// Create a weak reference to the object at `idx`
    pub fn weak_ref(&mut self, thr: ObjRef, idx: isize) -> Result<WeakId> {
        let target = self
            .get(thr, idx)?
            .as_object()
            .ok_or_else(|| Error::type_error("weak reference target must be an object"))?;
        self.heap.header_mut(target.0)?.set(HeapHeader::WEAK_TARGET);
        Ok(self.weak.insert(target.0))
    }

    /// Target of a weak reference, `None` once it has been freed
    pub fn weak_get(&self, id: WeakId) -> Option<ObjRef> {
        self.weak
            .get(id)
            .filter(|&r| self.heap.contains(r))
            .map(ObjRef)
    }

    /// Push the target of a weak reference. Returns `false` (pushing
    /// nothing) when it is gone.
    pub fn push_weak(&mut self, thr: ObjRef, id: WeakId) -> Result<bool> {
        match self.weak_get(id) {
            Some(obj) => {
                self.push(thr, Value::Object(obj))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a weak reference
    pub fn weak_drop(&mut self, id: WeakId) -> bool {
        let present = self.weak.get(id).is_some();
        if let Some(target) = self.weak.remove(id) {
            if let Ok(h) = self.heap.header_mut(target) {
                h.clear(HeapHeader::WEAK_TARGET);
            }
        }
        present
    }

    /// Weak-table cleanup for an object about to be freed
    pub(crate) fn forget_weak(&mut self, obj: HeapRef) {
        let weak_target = self
            .heap
            .header(obj)
            .is_ok_and(|h| h.has(HeapHeader::WEAK_TARGET));
        if weak_target {
            let n = self.weak.forget_target(obj);
            tracing::trace!(target: "tinyrt::gc", handle = ?obj, entries = n, "weak entries cleared");
        }
    }
}
