//! Array helpers
//!
//! Arrays are ordinary objects with an array part and a `length` kept in
//! `ArrayData`. These helpers are the stack-level conveniences the runtime
//! itself uses (the stash, bound argument lists); general element access
//! goes through the property surface.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::object::{ArrayData, ClassId, HObject, ObjectKind};
use crate::value::{ObjRef, Value};

/// Largest valid array length
pub const MAX_ARRAY_LENGTH: u32 = u32::MAX;

impl Context {
    /// Push a new empty array
    pub fn push_array(&mut self, thr: ObjRef) -> Result<ObjRef> {
        let proto = Some(self.roots.array_proto);
        let obj = HObject::new(ClassId::Array, proto, ObjectKind::Array(ArrayData::default()));
        self.push_new_object(thr, obj)
    }

    /// `length` of an array object
    pub fn array_length(&self, arr: ObjRef) -> Result<u32> {
        self.heap
            .object(arr)?
            .array_data()
            .map(|a| a.length)
            .ok_or_else(|| Error::type_error("not an array"))
    }

    fn array_at(&self, thr: ObjRef, idx: isize) -> Result<ObjRef> {
        let obj = self
            .get(thr, idx)?
            .as_object()
            .ok_or_else(|| Error::type_error("not an array"))?;
        self.array_length(obj)?;
        Ok(obj)
    }

    /// `[value]` -> `[]`: append to the array at `arr_idx`
    pub fn array_append(&mut self, thr: ObjRef, arr_idx: isize) -> Result<()> {
        let arr = self.array_at(thr, arr_idx)?;
        let len = self.array_length(arr)?;
        if len == MAX_ARRAY_LENGTH {
            return Err(Error::range("array length limit"));
        }
        let value = self.get(thr, -1)?;
        self.put_raw(thr, Value::Object(arr), Value::number(len as f64), value, true)?;
        self.pop(thr)
    }

    /// Remove the last element of the array at `arr_idx` and push it.
    /// Returns `false`, pushing nothing, for an empty array.
    pub fn array_pop(&mut self, thr: ObjRef, arr_idx: isize) -> Result<bool> {
        let arr = self.array_at(thr, arr_idx)?;
        let len = self.array_length(arr)?;
        if len == 0 {
            return Ok(false);
        }
        let last = Value::number((len - 1) as f64);
        self.get_raw(thr, Value::Object(arr), last)?;
        self.set_array_length(arr, last, true)?;
        Ok(true)
    }

    /// `[v1 .. vn]` -> `[array]`
    pub fn pack_array(&mut self, thr: ObjRef, n: usize) -> Result<ObjRef> {
        let top = self.get_top(thr)?;
        if n > top {
            return Err(Error::invalid_index());
        }
        let arr = self.push_array(thr)?;
        self.insert(thr, -(n as isize) - 1)?;
        // [arr v_i .. v_n]: append the front value, then drop it
        for k in (1..=n as isize).rev() {
            self.dup(thr, -k)?;
            self.array_append(thr, -k - 2)?;
            self.remove(thr, -k)?;
        }
        Ok(arr)
    }

    /// Snapshot of the dense prefix of an array
    pub(crate) fn array_values(&self, arr: ObjRef) -> Result<Vec<Value>> {
        let len = self.array_length(arr)?;
        let o = self.heap.object(arr)?;
        Ok((0..len)
            .map(|i| o.props.array_get(i).unwrap_or(Value::Undefined))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_pop() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        let arr = ctx.push_array(thr).unwrap();
        for i in 0..3 {
            ctx.push(thr, Value::number(i as f64)).unwrap();
            ctx.array_append(thr, -2).unwrap();
        }
        assert_eq!(ctx.array_length(arr).unwrap(), 3);
        assert_eq!(ctx.get_top(thr).unwrap(), 1);

        assert!(ctx.array_pop(thr, 0).unwrap());
        assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(2.0));
        assert_eq!(ctx.array_length(arr).unwrap(), 2);
        ctx.pop(thr).unwrap();

        ctx.array_pop(thr, 0).unwrap();
        ctx.array_pop(thr, 0).unwrap();
        assert!(!ctx.array_pop(thr, 0).unwrap());
        assert_eq!(ctx.get_top(thr).unwrap(), 3);
    }

    #[test]
    fn test_pack_array() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        ctx.push(thr, Value::Null).unwrap();
        for i in 0..4 {
            ctx.push(thr, Value::number(i as f64)).unwrap();
        }
        let arr = ctx.pack_array(thr, 4).unwrap();
        assert_eq!(ctx.get_top(thr).unwrap(), 2);
        assert_eq!(ctx.get(thr, 0).unwrap(), Value::Null);
        assert_eq!(
            ctx.array_values(arr).unwrap(),
            (0..4).map(|i| Value::number(i as f64)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_not_an_array() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        let obj = ctx.push_object(thr).unwrap();
        assert!(matches!(ctx.array_length(obj), Err(Error::Type(_))));
        ctx.push(thr, Value::Null).unwrap();
        assert!(matches!(ctx.array_append(thr, 0), Err(Error::Type(_))));
    }
}
