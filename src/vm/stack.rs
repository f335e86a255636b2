//! Value stack
//!
//! Each thread has one value stack. Host code and native functions address
//! it relative to the current frame `bottom`; non-negative indices count up
//! from the bottom and negative ones down from the top. The stack grows in
//! fixed steps and gives memory back once it has a lot of spare capacity.
//!
//! `ValueStack` itself never touches reference counts. The `Context` methods
//! below are the counted interface: every push increfs, every removal
//! decrefs once the stack is consistent again.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::value::{ObjRef, StrRef, Value};
use crate::vm::thread::HThread;

/// Growth step in slots
pub const GROW_STEP: usize = 128;
/// Spare capacity above which the stack shrinks
pub const SHRINK_THRESHOLD: usize = 256;
/// Spare capacity kept after shrinking
pub const SHRINK_SPARE: usize = 64;
/// Initial capacity
pub const INITIAL_SIZE: usize = 64;
/// Slots kept in reserve for runtime internals on top of `require_stack`
pub const INTERNAL_EXTRA: usize = 64;

/// Value stack storage
#[derive(Debug)]
pub struct ValueStack {
    values: Vec<Value>,
    bottom: usize,
    max: usize,
}

impl ValueStack {
    /// Create an empty stack limited to `max` slots
    pub fn new(max: usize) -> Self {
        ValueStack {
            values: Vec::with_capacity(INITIAL_SIZE.min(max)),
            bottom: 0,
            max,
        }
    }

    /// Absolute number of values
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Current frame bottom (absolute)
    #[inline]
    pub fn bottom(&self) -> usize {
        self.bottom
    }

    #[inline]
    pub(crate) fn set_bottom(&mut self, bottom: usize) {
        debug_assert!(bottom <= self.values.len());
        self.bottom = bottom;
    }

    /// Number of values in the current frame
    #[inline]
    pub fn top(&self) -> usize {
        self.values.len() - self.bottom
    }

    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.values.capacity()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    /// Value at an absolute index
    #[inline]
    pub fn get(&self, abs: usize) -> Option<Value> {
        self.values.get(abs).copied()
    }

    /// Replace the value at an absolute index, returning the old one
    #[inline]
    pub(crate) fn replace(&mut self, abs: usize, v: Value) -> Option<Value> {
        self.values.get_mut(abs).map(|slot| std::mem::replace(slot, v))
    }

    /// Make room for `extra` more values. Returns whether the storage grew.
    pub(crate) fn reserve(&mut self, extra: usize) -> Result<bool> {
        let needed = self
            .values
            .len()
            .checked_add(extra)
            .ok_or_else(|| Error::range("valstack limit"))?;
        if needed > self.max {
            return Err(Error::range("valstack limit"));
        }
        if needed <= self.values.capacity() {
            return Ok(false);
        }
        // Round up to the next growth step
        let target = needed
            .checked_add(GROW_STEP - 1)
            .map(|n| n / GROW_STEP * GROW_STEP)
            .unwrap_or(needed)
            .min(self.max);
        self.values
            .try_reserve_exact(target - self.values.len())
            .map_err(|_| Error::OutOfMemory)?;
        Ok(true)
    }

    /// Push a value. Returns whether the storage grew.
    pub(crate) fn push(&mut self, v: Value) -> Result<bool> {
        let grew = self.reserve(1)?;
        self.values.push(v);
        Ok(grew)
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<Value> {
        if self.values.len() > self.bottom {
            self.values.pop()
        } else {
            None
        }
    }

    /// Remove every value at or above `abs`
    pub(crate) fn truncate(&mut self, abs: usize) -> Vec<Value> {
        if abs >= self.values.len() {
            return Vec::new();
        }
        self.values.split_off(abs)
    }

    /// Pad with `undefined` up to absolute length `abs`
    pub(crate) fn extend_undefined(&mut self, abs: usize) -> Result<()> {
        if abs > self.values.len() {
            self.reserve(abs - self.values.len())?;
            self.values.resize(abs, Value::Undefined);
        }
        Ok(())
    }

    /// Insert at an absolute index, shifting values above it up
    pub(crate) fn insert(&mut self, abs: usize, v: Value) -> Result<()> {
        self.reserve(1)?;
        self.values.insert(abs, v);
        Ok(())
    }

    /// Remove at an absolute index, shifting values above it down
    pub(crate) fn remove(&mut self, abs: usize) -> Option<Value> {
        (abs < self.values.len()).then(|| self.values.remove(abs))
    }

    pub(crate) fn swap(&mut self, a: usize, b: usize) {
        self.values.swap(a, b);
    }

    /// Absolute index for a frame-relative one
    pub fn normalize(&self, idx: isize) -> Option<usize> {
        let len = self.values.len();
        if idx >= 0 {
            let abs = self.bottom.checked_add(idx as usize)?;
            (abs < len).then_some(abs)
        } else {
            let abs = len.checked_sub(idx.unsigned_abs())?;
            (abs >= self.bottom).then_some(abs)
        }
    }

    /// Give back memory once spare capacity passes the threshold.
    /// Returns whether the storage shrank.
    pub(crate) fn maybe_shrink(&mut self) -> bool {
        let spare = self.values.capacity() - self.values.len();
        if spare > SHRINK_THRESHOLD {
            self.values.shrink_to(self.values.len() + SHRINK_SPARE);
            return true;
        }
        false
    }
}

impl Context {
    pub(crate) fn thread(&self, thr: ObjRef) -> Result<&HThread> {
        self.heap
            .object(thr)?
            .thread()
            .ok_or_else(|| Error::type_error("not a thread"))
    }

    pub(crate) fn thread_mut(&mut self, thr: ObjRef) -> Result<&mut HThread> {
        self.heap
            .object_mut(thr)?
            .thread_mut()
            .ok_or_else(|| Error::type_error("not a thread"))
    }

    fn valstack(&self, thr: ObjRef) -> Result<&ValueStack> {
        Ok(&self.thread(thr)?.valstack)
    }

    fn valstack_mut(&mut self, thr: ObjRef) -> Result<&mut ValueStack> {
        Ok(&mut self.thread_mut(thr)?.valstack)
    }

    fn release_values(&mut self, values: Vec<Value>) {
        for v in values.into_iter().rev() {
            self.decref(v);
        }
    }

    fn after_shrink(&mut self, thr: ObjRef) -> Result<()> {
        if self.valstack_mut(thr)?.maybe_shrink() {
            self.heap.recharge(thr.0);
        }
        Ok(())
    }

    /// Push a value
    pub fn push(&mut self, thr: ObjRef, v: Value) -> Result<()> {
        if self.valstack_mut(thr)?.push(v)? {
            self.heap.recharge(thr.0);
        }
        self.incref(v);
        Ok(())
    }

    /// Push a value whose reference the caller already owns
    pub(crate) fn push_owned(&mut self, thr: ObjRef, v: Value) -> Result<()> {
        let pushed = self.valstack_mut(thr).and_then(|vs| vs.push(v));
        match pushed {
            Ok(grew) => {
                if grew {
                    self.heap.recharge(thr.0);
                }
                Ok(())
            }
            Err(e) => {
                self.decref(v);
                Err(e)
            }
        }
    }

    /// Pop the top value, handing its reference to the caller
    pub(crate) fn take_top(&mut self, thr: ObjRef) -> Result<Value> {
        self.valstack_mut(thr)?.pop().ok_or_else(Error::invalid_index)
    }

    pub fn pop(&mut self, thr: ObjRef) -> Result<()> {
        let v = self.take_top(thr)?;
        self.decref(v);
        self.after_shrink(thr)
    }

    pub fn pop_n(&mut self, thr: ObjRef, n: usize) -> Result<()> {
        let top = self.get_top(thr)?;
        if n > top {
            return Err(Error::invalid_index());
        }
        self.set_top(thr, top - n)
    }

    /// Push a copy of the value at `idx`
    pub fn dup(&mut self, thr: ObjRef, idx: isize) -> Result<()> {
        let v = self.get(thr, idx)?;
        self.push(thr, v)
    }

    pub fn get(&self, thr: ObjRef, idx: isize) -> Result<Value> {
        self.get_opt(thr, idx).ok_or_else(Error::invalid_index)
    }

    /// Non-throwing `get`
    pub fn get_opt(&self, thr: ObjRef, idx: isize) -> Option<Value> {
        let vs = self.valstack(thr).ok()?;
        vs.get(vs.normalize(idx)?)
    }

    /// Overwrite the value at `idx`
    pub fn set(&mut self, thr: ObjRef, idx: isize, v: Value) -> Result<()> {
        let abs = self.require_abs(thr, idx)?;
        self.set_abs(thr, abs, v)
    }

    /// Move the top value to `idx`, shifting the values above `idx` up
    pub fn insert(&mut self, thr: ObjRef, idx: isize) -> Result<()> {
        let abs = self.require_abs(thr, idx)?;
        let vs = self.valstack_mut(thr)?;
        let v = vs.pop().ok_or_else(Error::invalid_index)?;
        vs.values.insert(abs, v);
        Ok(())
    }

    /// Remove the value at `idx`, shifting the values above it down
    pub fn remove(&mut self, thr: ObjRef, idx: isize) -> Result<()> {
        let abs = self.require_abs(thr, idx)?;
        let v = self
            .valstack_mut(thr)?
            .remove(abs)
            .ok_or_else(Error::invalid_index)?;
        self.decref(v);
        Ok(())
    }

    /// Pop the top value and store it at `idx` (resolved before the pop)
    pub fn replace(&mut self, thr: ObjRef, idx: isize) -> Result<()> {
        let abs = self.require_abs(thr, idx)?;
        let vs = self.valstack_mut(thr)?;
        let v = vs.pop().ok_or_else(Error::invalid_index)?;
        // Replacing the top itself degenerates to a pop
        let released = vs.replace(abs, v).unwrap_or(v);
        self.decref(released);
        Ok(())
    }

    pub fn swap(&mut self, thr: ObjRef, a: isize, b: isize) -> Result<()> {
        let a = self.require_abs(thr, a)?;
        let b = self.require_abs(thr, b)?;
        self.valstack_mut(thr)?.swap(a, b);
        Ok(())
    }

    /// Number of values in the current frame
    pub fn get_top(&self, thr: ObjRef) -> Result<usize> {
        Ok(self.valstack(thr)?.top())
    }

    /// Grow (with `undefined`) or shrink the current frame to `n` values
    pub fn set_top(&mut self, thr: ObjRef, n: usize) -> Result<()> {
        let bottom = self.valstack(thr)?.bottom();
        let abs = bottom.checked_add(n).ok_or_else(|| Error::range("valstack limit"))?;
        self.set_top_abs(thr, abs)
    }

    /// Guarantee room for `n` more values
    pub fn require_stack(&mut self, thr: ObjRef, n: usize) -> Result<()> {
        let extra = n.checked_add(INTERNAL_EXTRA).ok_or_else(|| Error::range("valstack limit"))?;
        let vs = self.valstack_mut(thr)?;
        // The internal reserve is best effort near the limit
        let grew = match vs.reserve(extra) {
            Ok(g) => g,
            Err(_) => vs.reserve(n)?,
        };
        if grew {
            self.heap.recharge(thr.0);
        }
        Ok(())
    }

    /// Frame-relative index for `idx`, `None` when out of range
    pub fn normalize_index(&self, thr: ObjRef, idx: isize) -> Option<usize> {
        let vs = self.valstack(thr).ok()?;
        vs.normalize(idx).map(|abs| abs - vs.bottom())
    }

    /// Throwing `normalize_index`
    pub fn require_index(&self, thr: ObjRef, idx: isize) -> Result<usize> {
        self.normalize_index(thr, idx).ok_or_else(Error::invalid_index)
    }

    /// Intern `s` and push it
    pub fn push_string(&mut self, thr: ObjRef, s: &str) -> Result<StrRef> {
        self.push_string_bytes(thr, s.as_bytes())
    }

    /// Intern raw bytes and push them
    pub fn push_string_bytes(&mut self, thr: ObjRef, bytes: &[u8]) -> Result<StrRef> {
        let s = self.intern(bytes)?;
        self.push_owned(thr, Value::String(s))?;
        Ok(s)
    }

    // Absolute addressing for the call machinery

    pub(crate) fn require_abs(&self, thr: ObjRef, idx: isize) -> Result<usize> {
        self.valstack(thr)?.normalize(idx).ok_or_else(Error::invalid_index)
    }

    pub(crate) fn abs_top(&self, thr: ObjRef) -> Result<usize> {
        Ok(self.valstack(thr)?.len())
    }

    pub(crate) fn bottom(&self, thr: ObjRef) -> Result<usize> {
        Ok(self.valstack(thr)?.bottom())
    }

    pub(crate) fn set_bottom(&mut self, thr: ObjRef, bottom: usize) -> Result<()> {
        self.valstack_mut(thr)?.set_bottom(bottom);
        Ok(())
    }

    pub(crate) fn get_abs(&self, thr: ObjRef, abs: usize) -> Result<Value> {
        self.valstack(thr)?.get(abs).ok_or_else(Error::invalid_index)
    }

    /// Counted store at an absolute index
    pub(crate) fn set_abs(&mut self, thr: ObjRef, abs: usize, v: Value) -> Result<()> {
        self.incref(v);
        match self.valstack_mut(thr).map(|vs| vs.replace(abs, v)) {
            Ok(Some(old)) => {
                self.decref(old);
                Ok(())
            }
            Ok(None) => {
                self.decref(v);
                Err(Error::invalid_index())
            }
            Err(e) => {
                self.decref(v);
                Err(e)
            }
        }
    }

    /// Resize the stack to an absolute length
    pub(crate) fn set_top_abs(&mut self, thr: ObjRef, abs: usize) -> Result<()> {
        let vs = self.valstack_mut(thr)?;
        if abs < vs.bottom() {
            return Err(Error::invalid_index());
        }
        if abs > vs.len() {
            let cap = vs.capacity();
            vs.extend_undefined(abs)?;
            if vs.capacity() != cap {
                self.heap.recharge(thr.0);
            }
            return Ok(());
        }
        let removed = vs.truncate(abs);
        self.release_values(removed);
        self.after_shrink(thr)
    }

    /// Counted insert of several values at an absolute index
    pub(crate) fn insert_abs(&mut self, thr: ObjRef, abs: usize, values: &[Value]) -> Result<()> {
        let vs = self.valstack_mut(thr)?;
        if abs > vs.len() {
            return Err(Error::invalid_index());
        }
        vs.reserve(values.len())?;
        for (i, &v) in values.iter().enumerate() {
            vs.insert(abs + i, v)?;
        }
        for &v in values {
            self.incref(v);
        }
        Ok(())
    }
}
