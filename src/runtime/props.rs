//! Object-level property operations
//!
//! The raw operations (`get_raw`, `put_raw`, ...) take a target and a key as
//! values that the caller keeps rooted on a value stack; they may run
//! accessors, proxy traps and allocations, any of which can trigger a
//! collection. The stack-based wrappers (`get_prop`, `put_prop`, ...) follow
//! the usual `[... key value]` conventions on a thread's value stack.
//!
//! Lookup order for a key:
//! 1. virtual properties (`length` of arrays, strings and buffers; string
//!    and buffer indices)
//! 2. proxy traps when the target is a proxy
//! 3. own storage, then each prototype in turn, bounded by `proto_sanity`

use crate::context::Context;
use crate::error::{Error, Result};
use crate::gc::Heap;
use crate::runtime::object::ObjectKind;
use crate::runtime::property::{ArrayWrite, Loc, PropFlags, PropSlot};
use crate::util::{self, dtoa, hash};
use crate::value::{ObjRef, StrRef, Value};

/// A canonical property key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PropKey {
    /// Array index (`0 ..= 2^32 - 2`)
    Index(u32),
    /// Any other key, interned
    Str(StrRef),
}

/// Bounded walk along a prototype chain (or an environment chain, which uses
/// the same link). Exceeding the budget is a `RangeError`, so cycles fail
/// closed.
pub(crate) struct ProtoWalk {
    next: Option<ObjRef>,
    budget: usize,
}

impl ProtoWalk {
    pub(crate) fn new(start: Option<ObjRef>, limit: usize) -> Self {
        ProtoWalk {
            next: start,
            budget: limit,
        }
    }

    pub(crate) fn next(&mut self, heap: &Heap) -> Result<Option<ObjRef>> {
        let Some(cur) = self.next else {
            return Ok(None);
        };
        if self.budget == 0 {
            return Err(Error::range("prototype chain limit"));
        }
        self.budget -= 1;
        self.next = heap.object(cur)?.proto;
        Ok(Some(cur))
    }
}

/// An own property found in storage
#[derive(Debug, Clone, Copy)]
pub(crate) struct OwnProp {
    pub loc: Loc,
    pub slot: PropSlot,
    pub flags: PropFlags,
}

/// Virtual property value and attributes
type Virtual = (Value, PropFlags);

impl Context {
    /// Reject a failed write: `TypeError` in strict code, `Ok(false)` otherwise
    fn reject(strict: bool, msg: &str) -> Result<bool> {
        if strict {
            Err(Error::type_error(msg))
        } else {
            Ok(false)
        }
    }

    /// Canonicalize a key value and run `f` with it.
    ///
    /// Non-index numbers are converted to their canonical string; the
    /// temporary string reference is released afterwards.
    pub(crate) fn with_key<R>(
        &mut self,
        key: Value,
        f: impl FnOnce(&mut Self, PropKey) -> Result<R>,
    ) -> Result<R> {
        let text = match key {
            Value::String(s) => {
                let k = match self.heap.string(s)?.array_index() {
                    Some(i) => PropKey::Index(i),
                    None => PropKey::Str(s),
                };
                return f(self, k);
            }
            Value::Number(n) => {
                if let Some(i) = key.as_array_index() {
                    return f(self, PropKey::Index(i));
                }
                dtoa::number_to_string(n)
            }
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(Error::type_error("invalid property key")),
        };
        let s = self.intern(text.as_bytes())?;
        let r = f(self, PropKey::Str(s));
        self.release(s);
        r
    }

    /// Interned string for an index key, if one exists. Never allocates.
    fn index_string(&self, idx: u32) -> Option<StrRef> {
        let mut buf = [0u8; 10];
        let bytes = dtoa::u32_to_str(&mut buf, idx);
        let h = hash::hash_string(bytes, self.config.hash_seed);
        self.strings.lookup(&self.heap, bytes, h)
    }

    /// Key as a value, interning index keys
    pub(crate) fn key_string(&mut self, key: PropKey) -> Result<StrRef> {
        match key {
            PropKey::Str(s) => {
                self.incref(Value::String(s));
                Ok(s)
            }
            PropKey::Index(i) => {
                let mut buf = [0u8; 10];
                let bytes = dtoa::u32_to_str(&mut buf, i);
                self.intern(bytes)
            }
        }
    }

    fn entry_prop(&self, obj: ObjRef, key: StrRef) -> Result<Option<OwnProp>> {
        let hash = self.heap.string(key)?.hash();
        let props = &self.heap.object(obj)?.props;
        Ok(props.find_entry(key, hash).map(|i| {
            let e = props.entry(i);
            OwnProp {
                loc: Loc::Entry(i),
                slot: e.slot,
                flags: e.flags,
            }
        }))
    }

    /// Own property in storage (virtual properties excluded)
    pub(crate) fn own_prop(&self, obj: ObjRef, key: PropKey) -> Result<Option<OwnProp>> {
        match key {
            PropKey::Index(i) => {
                let props = &self.heap.object(obj)?.props;
                if props.has_array_part() {
                    return Ok(props.array_get(i).map(|v| OwnProp {
                        loc: Loc::Array(i),
                        slot: PropSlot::Data(v),
                        flags: PropFlags::DEFAULT,
                    }));
                }
                match self.index_string(i) {
                    Some(s) => self.entry_prop(obj, s),
                    None => Ok(None),
                }
            }
            PropKey::Str(s) => self.entry_prop(obj, s),
        }
    }

    /// Virtual property of a value
    fn virtual_prop(&self, target: Value, key: PropKey) -> Result<Option<Virtual>> {
        let is_length = key == PropKey::Str(self.keys.length);
        Ok(match target {
            Value::String(s) => {
                let h = self.heap.string(s)?;
                match key {
                    _ if is_length => Some((Value::Number(h.char_len() as f64), PropFlags::NONE)),
                    // The character itself is materialized by `push_virtual`
                    PropKey::Index(i) => util::char_at(h.as_bytes(), i as usize)
                        .map(|_| (Value::Undefined, PropFlags::ENUMERABLE)),
                    _ => None,
                }
            }
            Value::Buffer(b) => {
                let buf = self.heap.buffer(b)?;
                match key {
                    _ if is_length => Some((Value::Number(buf.len() as f64), PropFlags::NONE)),
                    PropKey::Index(i) => buf
                        .get(i as usize)
                        .map(|byte| (Value::Number(byte as f64), PropFlags::WRITABLE | PropFlags::ENUMERABLE)),
                    _ => None,
                }
            }
            Value::LightFunc(lf) if is_length => {
                Some((Value::Number(lf.nargs.map_or(0.0, f64::from)), PropFlags::NONE))
            }
            Value::Object(o) if is_length => self.heap.object(o)?.array_data().map(|a| {
                let flags = if a.length_writable {
                    PropFlags::WRITABLE
                } else {
                    PropFlags::NONE
                };
                (Value::Number(a.length as f64), flags)
            }),
            _ => None,
        })
    }

    /// Check whether an object has a virtual own property under `key`
    pub(crate) fn virtual_own_key(&self, obj: ObjRef, key: PropKey) -> Result<bool> {
        Ok(self.virtual_prop(Value::Object(obj), key)?.is_some())
    }

    /// Push the value of a virtual property. String characters are interned
    /// here since reading them allocates.
    fn push_virtual(&mut self, thr: ObjRef, target: Value, key: PropKey, v: Value) -> Result<()> {
        if let (Value::String(s), PropKey::Index(i)) = (target, key) {
            let ch = {
                let h = self.heap.string(s)?;
                util::char_at(h.as_bytes(), i as usize)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default()
            };
            self.push_string_bytes(thr, &ch)?;
            return Ok(());
        }
        self.push(thr, v)
    }

    /// Prototype used for property lookups on a value
    fn lookup_start(&self, target: Value) -> Result<Option<ObjRef>> {
        match target {
            Value::Undefined | Value::Null => Err(Error::type_error(format!(
                "cannot read property of {}",
                if target.is_null() { "null" } else { "undefined" }
            ))),
            Value::Object(o) => Ok(Some(o)),
            Value::LightFunc(_) => Ok(Some(self.roots.function_proto)),
            _ => Ok(Some(self.roots.object_proto)),
        }
    }

    /// Call an accessor with `this`, pushing its result
    fn call_accessor(&mut self, thr: ObjRef, f: ObjRef, this: Value, arg: Option<Value>) -> Result<()> {
        self.push(thr, Value::Object(f))?;
        self.push(thr, this)?;
        match arg {
            Some(v) => {
                self.push(thr, v)?;
                self.call(thr, 1)
            }
            None => self.call(thr, 0),
        }
    }

    /// Get a property and push its value (`undefined` when absent).
    /// Returns whether the property was found.
    pub(crate) fn get_raw(&mut self, thr: ObjRef, target: Value, key: Value) -> Result<bool> {
        self.with_key(key, |ctx, k| ctx.get_with_key(thr, target, key, k))
    }

    fn get_with_key(&mut self, thr: ObjRef, target: Value, key: Value, k: PropKey) -> Result<bool> {
        if let Some((v, _)) = self.virtual_prop(target, k)? {
            self.push_virtual(thr, target, k, v)?;
            return Ok(true);
        }
        if let Value::Object(o) = target {
            if self.proxy_data(o)?.is_some() {
                return self.proxy_get(thr, o, key);
            }
        }

        let mut walk = ProtoWalk::new(self.lookup_start(target)?, self.config.proto_sanity);
        while let Some(cur) = walk.next(&self.heap)? {
            let Some(p) = self.own_prop(cur, k)? else {
                continue;
            };
            match p.slot {
                PropSlot::Data(v) => self.push(thr, v)?,
                PropSlot::Accessor { get: Some(g), .. } => self.call_accessor(thr, g, target, None)?,
                PropSlot::Accessor { get: None, .. } => self.push(thr, Value::Undefined)?,
            }
            return Ok(true);
        }
        self.push(thr, Value::Undefined)?;
        Ok(false)
    }

    /// Store a value into an existing own slot: incref new, store, decref old
    pub(crate) fn write_own(&mut self, obj: ObjRef, loc: Loc, value: Value) -> Result<()> {
        self.write_slot(obj, loc, PropSlot::Data(value), None)
    }

    fn write_slot(&mut self, obj: ObjRef, loc: Loc, slot: PropSlot, flags: Option<PropFlags>) -> Result<()> {
        let mut refs = Vec::new();
        slot.heap_refs(&mut refs);
        self.heap.object(obj)?;
        for &r in &refs {
            self.incref_ref(r);
        }
        let old = {
            let o = self.heap.object_mut(obj)?;
            match (loc, slot) {
                (Loc::Array(i), PropSlot::Data(v)) => o.props.array_store(i, v).map(PropSlot::Data),
                (Loc::Array(_), PropSlot::Accessor { .. }) => {
                    return Err(Error::internal("accessor in array part"));
                }
                (Loc::Entry(i), _) => {
                    let e = o.props.entry_mut(i);
                    if let Some(f) = flags {
                        e.flags = f;
                    }
                    Some(std::mem::replace(&mut e.slot, slot))
                }
            }
        };
        if let Some(old) = old {
            refs.clear();
            old.heap_refs(&mut refs);
            for r in refs {
                self.decref_ref(r);
            }
        }
        Ok(())
    }

    /// Move the array part of `obj` into its entry part
    pub(crate) fn abandon_array_part(&mut self, obj: ObjRef) -> Result<()> {
        let indices: Vec<u32> = self.heap.object(obj)?.props.array_items().map(|(i, _)| i).collect();
        // Intern every key before touching storage; interning may collect
        let mut keys = Vec::with_capacity(indices.len());
        for i in indices {
            match self.key_string(PropKey::Index(i)) {
                Ok(s) => keys.push((s, self.heap.string(s)?.hash())),
                Err(e) => {
                    for (s, _) in keys {
                        self.release(s);
                    }
                    return Err(e);
                }
            }
        }
        let o = self.heap.object_mut(obj)?;
        let moved = keys.len();
        o.props.abandon_array_part(&keys);
        self.heap.recharge(obj.0);
        tracing::debug!(object = ?obj, moved, "array part abandoned");
        Ok(())
    }

    /// Append a new entry-part property. The key must not exist yet.
    fn create_entry(&mut self, obj: ObjRef, key: PropKey, slot: PropSlot, flags: PropFlags) -> Result<()> {
        // Owned reference moves into the entry
        let s = self.key_string(key)?;
        let hash = self.heap.string(s)?.hash();
        let mut refs = Vec::new();
        slot.heap_refs(&mut refs);
        for r in refs {
            self.incref_ref(r);
        }
        match self.heap.object_mut(obj) {
            Ok(o) => {
                o.props.insert_entry(s, hash, slot, flags);
            }
            Err(e) => {
                self.release(s);
                return Err(e);
            }
        }
        self.heap.recharge(obj.0);
        Ok(())
    }

    /// Create a new own data property with default attributes
    fn create_own(&mut self, obj: ObjRef, key: PropKey, value: Value) -> Result<()> {
        if let PropKey::Index(i) = key {
            if self.heap.object(obj)?.props.has_array_part() {
                match self.heap.object(obj)?.props.classify_array_write(i) {
                    ArrayWrite::InBounds | ArrayWrite::Grow => {
                        self.incref(value);
                        self.heap.object_mut(obj)?.props.array_store(i, value);
                        self.heap.recharge(obj.0);
                        self.extend_array_length(obj, i)?;
                        return Ok(());
                    }
                    ArrayWrite::Abandon => self.abandon_array_part(obj)?,
                }
            }
            self.create_entry(obj, key, PropSlot::Data(value), PropFlags::DEFAULT)?;
            return self.extend_array_length(obj, i);
        }
        self.create_entry(obj, key, PropSlot::Data(value), PropFlags::DEFAULT)
    }

    fn extend_array_length(&mut self, obj: ObjRef, idx: u32) -> Result<()> {
        if let Some(a) = self.heap.object_mut(obj)?.array_data_mut() {
            if idx >= a.length {
                a.length = idx + 1;
            }
        }
        Ok(())
    }

    /// Whether an index write would need to grow a non-writable length
    fn blocked_by_length(&self, obj: ObjRef, key: PropKey) -> Result<bool> {
        let PropKey::Index(i) = key else {
            return Ok(false);
        };
        Ok(self
            .heap
            .object(obj)?
            .array_data()
            .is_some_and(|a| !a.length_writable && i >= a.length))
    }

    /// Assign a property. Returns `Ok(false)` on a non-strict rejection.
    pub(crate) fn put_raw(&mut self, thr: ObjRef, target: Value, key: Value, value: Value, strict: bool) -> Result<bool> {
        self.with_key(key, |ctx, k| ctx.put_with_key(thr, target, key, k, value, strict))
    }

    fn put_with_key(
        &mut self,
        thr: ObjRef,
        target: Value,
        key: Value,
        k: PropKey,
        value: Value,
        strict: bool,
    ) -> Result<bool> {
        if target.is_nullish() {
            return Err(Error::type_error("cannot write property of null or undefined"));
        }
        if let Some((_, flags)) = self.virtual_prop(target, k)? {
            return self.put_virtual(target, k, value, flags, strict);
        }
        let obj = match target {
            Value::Object(o) => {
                if self.proxy_data(o)?.is_some() {
                    return self.proxy_set(thr, o, key, value, strict);
                }
                Some(o)
            }
            _ => None,
        };

        if let Some(o) = obj {
            if let Some(p) = self.own_prop(o, k)? {
                return match p.slot {
                    PropSlot::Data(_) if p.flags.is_writable() => {
                        self.write_own(o, p.loc, value)?;
                        Ok(true)
                    }
                    PropSlot::Data(_) => Self::reject(strict, "property is not writable"),
                    PropSlot::Accessor { set: Some(s), .. } => {
                        self.call_accessor(thr, s, target, Some(value))?;
                        self.pop(thr)?;
                        Ok(true)
                    }
                    PropSlot::Accessor { set: None, .. } => Self::reject(strict, "setter is undefined"),
                };
            }
        }

        // Inherited properties may forbid or intercept the write
        let start = match obj {
            Some(o) => self.heap.object(o)?.proto,
            None => self.lookup_start(target)?,
        };
        let mut walk = ProtoWalk::new(start, self.config.proto_sanity);
        while let Some(cur) = walk.next(&self.heap)? {
            let Some(p) = self.own_prop(cur, k)? else {
                continue;
            };
            match p.slot {
                PropSlot::Data(_) if p.flags.is_writable() => break,
                PropSlot::Data(_) => return Self::reject(strict, "inherited property is not writable"),
                PropSlot::Accessor { set: Some(s), .. } => {
                    self.call_accessor(thr, s, target, Some(value))?;
                    self.pop(thr)?;
                    return Ok(true);
                }
                PropSlot::Accessor { set: None, .. } => return Self::reject(strict, "setter is undefined"),
            }
        }

        let Some(o) = obj else {
            return Self::reject(strict, "cannot create property on a primitive");
        };
        if !self.heap.object(o)?.is_extensible() {
            return Self::reject(strict, "object is not extensible");
        }
        if self.blocked_by_length(o, k)? {
            return Self::reject(strict, "array length is not writable");
        }
        self.create_own(o, k, value)?;
        Ok(true)
    }

    fn put_virtual(
        &mut self,
        target: Value,
        key: PropKey,
        value: Value,
        flags: PropFlags,
        strict: bool,
    ) -> Result<bool> {
        if !flags.is_writable() {
            return Self::reject(strict, "property is not writable");
        }
        match (target, key) {
            (Value::Buffer(b), PropKey::Index(i)) => {
                let byte = crate::runtime::buffer::coerce_byte(value);
                self.heap.buffer_mut(b)?.set(i as usize, byte);
                Ok(true)
            }
            (Value::Object(o), _) => self.set_array_length(o, value, strict),
            _ => Self::reject(strict, "property is not writable"),
        }
    }

    /// Apply a new array length, deleting trailing elements.
    ///
    /// Deletion stops at the first non-configurable element, leaving the
    /// length just above it, and the write is rejected.
    pub(crate) fn set_array_length(&mut self, obj: ObjRef, value: Value, strict: bool) -> Result<bool> {
        let new_len = match value {
            Value::Number(n) if n >= 0.0 && n.trunc() == n && n <= u32::MAX as f64 => n as u32,
            _ => return Err(Error::range("invalid array length")),
        };
        let a = *self
            .heap
            .object(obj)?
            .array_data()
            .ok_or_else(|| Error::internal("not an array"))?;
        if new_len == a.length {
            return Ok(true);
        }
        if !a.length_writable {
            return Self::reject(strict, "array length is not writable");
        }
        if new_len > a.length {
            self.set_length_field(obj, new_len)?;
            return Ok(true);
        }

        if self.heap.object(obj)?.props.has_array_part() {
            let removed = self.heap.object_mut(obj)?.props.array_truncate(new_len);
            self.set_length_field(obj, new_len)?;
            self.heap.recharge(obj.0);
            for v in removed {
                self.decref(v);
            }
            return Ok(true);
        }

        let mut doomed: Vec<(u32, usize)> = Vec::new();
        {
            let o = self.heap.object(obj)?;
            for (i, e) in o.props.entries() {
                let Some(key) = e.key else { continue };
                if let Some(idx) = self.heap.string(key)?.array_index() {
                    if idx >= new_len {
                        doomed.push((idx, i));
                    }
                }
            }
        }
        doomed.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (idx, entry) in doomed {
            let configurable = self.heap.object(obj)?.props.entry(entry).flags.is_configurable();
            if !configurable {
                self.set_length_field(obj, idx + 1)?;
                return Self::reject(strict, "array element is not configurable");
            }
            self.remove_own(obj, Loc::Entry(entry))?;
        }
        self.set_length_field(obj, new_len)?;
        Ok(true)
    }

    fn set_length_field(&mut self, obj: ObjRef, len: u32) -> Result<()> {
        if let Some(a) = self.heap.object_mut(obj)?.array_data_mut() {
            a.length = len;
        }
        Ok(())
    }

    /// Remove an own property from storage and release its references
    fn remove_own(&mut self, obj: ObjRef, loc: Loc) -> Result<()> {
        let mut refs = Vec::new();
        {
            let o = self.heap.object_mut(obj)?;
            match loc {
                Loc::Array(i) => {
                    if let Some(v) = o.props.array_take(i) {
                        refs.extend(v.heap_ref());
                    }
                }
                Loc::Entry(i) => {
                    let e = o.props.remove_entry(i);
                    refs.extend(e.key.map(|k| k.0));
                    e.slot.heap_refs(&mut refs);
                }
            }
        }
        for r in refs {
            self.decref_ref(r);
        }
        Ok(())
    }

    /// Delete an own property. Returns `Ok(false)` on a non-strict rejection.
    pub(crate) fn del_raw(&mut self, thr: ObjRef, target: Value, key: Value, strict: bool) -> Result<bool> {
        self.with_key(key, |ctx, k| {
            if target.is_nullish() {
                return Err(Error::type_error("cannot delete property of null or undefined"));
            }
            if ctx.virtual_prop(target, k)?.is_some() {
                return Self::reject(strict, "property is not configurable");
            }
            let Value::Object(o) = target else {
                return Ok(true);
            };
            if ctx.proxy_data(o)?.is_some() {
                return ctx.proxy_delete(thr, o, key, strict);
            }
            match ctx.own_prop(o, k)? {
                None => Ok(true),
                Some(p) if !p.flags.is_configurable() => Self::reject(strict, "property is not configurable"),
                Some(p) => {
                    ctx.remove_own(o, p.loc)?;
                    Ok(true)
                }
            }
        })
    }

    /// Check for a property along the prototype chain
    pub(crate) fn has_raw(&mut self, thr: ObjRef, target: Value, key: Value) -> Result<bool> {
        self.with_key(key, |ctx, k| {
            if ctx.virtual_prop(target, k)?.is_some() {
                return Ok(true);
            }
            let Value::Object(o) = target else {
                return Err(Error::type_error("invalid base value for 'in'"));
            };
            if ctx.proxy_data(o)?.is_some() {
                return ctx.proxy_has(thr, o, key);
            }
            let mut walk = ProtoWalk::new(Some(o), ctx.config.proto_sanity);
            while let Some(cur) = walk.next(&ctx.heap)? {
                if ctx.own_prop(cur, k)?.is_some() {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Define an own property with explicit attributes.
    ///
    /// A configurable property is replaced outright. A non-configurable one
    /// only accepts a new value, and only while it stays a writable data
    /// property with the same attributes.
    pub(crate) fn define_raw(
        &mut self,
        thr: ObjRef,
        obj: ObjRef,
        key: PropKey,
        slot: PropSlot,
        flags: PropFlags,
        strict: bool,
    ) -> Result<bool> {
        let flags = match slot {
            PropSlot::Data(_) => flags.without(PropFlags::ACCESSOR),
            PropSlot::Accessor { .. } => flags.union(PropFlags::ACCESSOR).without(PropFlags::WRITABLE),
        };

        if let Some((_, vflags)) = self.virtual_prop(Value::Object(obj), key)? {
            let PropSlot::Data(v) = slot else {
                return Self::reject(strict, "cannot redefine array length as an accessor");
            };
            if !vflags.is_writable() {
                let current = self.heap.object(obj)?.array_data().map(|a| a.length as f64);
                let same = v.as_number() == current && !flags.is_writable();
                return if same {
                    Ok(true)
                } else {
                    Self::reject(strict, "array length is not writable")
                };
            }
            if !self.set_array_length(obj, v, strict)? {
                return Ok(false);
            }
            if !flags.is_writable() {
                if let Some(a) = self.heap.object_mut(obj)?.array_data_mut() {
                    a.length_writable = false;
                }
            }
            return Ok(true);
        }

        match self.own_prop(obj, key)? {
            Some(p) if !p.flags.is_configurable() => {
                let value_only = matches!((p.slot, slot), (PropSlot::Data(_), PropSlot::Data(_)))
                    && p.flags == flags
                    && p.flags.is_writable();
                if value_only {
                    self.write_own(obj, p.loc, match slot {
                        PropSlot::Data(v) => v,
                        PropSlot::Accessor { .. } => Value::Undefined,
                    })?;
                    return Ok(true);
                }
                let unchanged = p.flags == flags
                    && match (p.slot, slot) {
                        (PropSlot::Data(a), PropSlot::Data(b)) => a.same_value(&b),
                        (a, b) => a == b,
                    };
                if unchanged {
                    Ok(true)
                } else {
                    Self::reject(strict, "property is not configurable")
                }
            }
            Some(p) => {
                match p.loc {
                    Loc::Array(_) if flags == PropFlags::DEFAULT && !flags.is_accessor() => {
                        self.write_slot(obj, p.loc, slot, None)?;
                    }
                    Loc::Array(_) => {
                        self.abandon_array_part(obj)?;
                        let p = self
                            .own_prop(obj, key)?
                            .ok_or_else(|| Error::internal("property lost during abandon"))?;
                        self.write_slot(obj, p.loc, slot, Some(flags))?;
                    }
                    Loc::Entry(_) => self.write_slot(obj, p.loc, slot, Some(flags))?,
                }
                Ok(true)
            }
            None => {
                if !self.heap.object(obj)?.is_extensible() {
                    return Self::reject(strict, "object is not extensible");
                }
                if self.blocked_by_length(obj, key)? {
                    return Self::reject(strict, "array length is not writable");
                }
                match (key, slot) {
                    (PropKey::Index(_), PropSlot::Data(v)) if flags == PropFlags::DEFAULT => {
                        self.create_own(obj, key, v)?;
                    }
                    (PropKey::Index(i), _) => {
                        if self.heap.object(obj)?.props.has_array_part() {
                            self.abandon_array_part(obj)?;
                        }
                        self.create_entry(obj, key, slot, flags)?;
                        self.extend_array_length(obj, i)?;
                    }
                    (PropKey::Str(_), _) => self.create_entry(obj, key, slot, flags)?,
                }
                Ok(true)
            }
        }
    }

    fn object_at(&self, thr: ObjRef, idx: isize) -> Result<ObjRef> {
        self.get(thr, idx)?
            .as_object()
            .ok_or_else(|| Error::type_error("not an object"))
    }

    // Stack-based surface

    /// `[key]` -> `[value]`
    pub fn get_prop(&mut self, thr: ObjRef, obj_idx: isize) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)?;
        let target = self.get(thr, obj_idx as isize)?;
        let key = self.get(thr, -1)?;
        let found = self.get_raw(thr, target, key)?;
        self.remove(thr, -2)?;
        Ok(found)
    }

    /// `[key value]` -> `[]`
    pub fn put_prop(&mut self, thr: ObjRef, obj_idx: isize, strict: bool) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)?;
        let target = self.get(thr, obj_idx as isize)?;
        let key = self.get(thr, -2)?;
        let value = self.get(thr, -1)?;
        let ok = self.put_raw(thr, target, key, value, strict)?;
        self.pop_n(thr, 2)?;
        Ok(ok)
    }

    /// `[key]` -> `[]`
    pub fn del_prop(&mut self, thr: ObjRef, obj_idx: isize, strict: bool) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)?;
        let target = self.get(thr, obj_idx as isize)?;
        let key = self.get(thr, -1)?;
        let ok = self.del_raw(thr, target, key, strict)?;
        self.pop(thr)?;
        Ok(ok)
    }

    /// `[key]` -> `[]`
    pub fn has_prop(&mut self, thr: ObjRef, obj_idx: isize) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)?;
        let target = self.get(thr, obj_idx as isize)?;
        let key = self.get(thr, -1)?;
        let found = self.has_raw(thr, target, key)?;
        self.pop(thr)?;
        Ok(found)
    }

    /// `[key value]` -> `[]`: define a data property with `flags`
    pub fn define_prop(&mut self, thr: ObjRef, obj_idx: isize, flags: PropFlags, strict: bool) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)?;
        let obj = self.object_at(thr, obj_idx as isize)?;
        let key = self.get(thr, -2)?;
        let value = self.get(thr, -1)?;
        let ok = self.with_key(key, |ctx, k| {
            ctx.define_raw(thr, obj, k, PropSlot::Data(value), flags, strict)
        })?;
        self.pop_n(thr, 2)?;
        Ok(ok)
    }

    /// `[key getter setter]` -> `[]`: define an accessor property.
    /// `undefined` leaves that half of the accessor empty.
    pub fn define_accessor(&mut self, thr: ObjRef, obj_idx: isize, flags: PropFlags, strict: bool) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)?;
        let obj = self.object_at(thr, obj_idx as isize)?;
        let key = self.get(thr, -3)?;
        let accessor = |v: Value| match v {
            Value::Undefined => Ok(None),
            Value::Object(o) => Ok(Some(o)),
            _ => Err(Error::type_error("accessor must be a function or undefined")),
        };
        let get = accessor(self.get(thr, -2)?)?;
        let set = accessor(self.get(thr, -1)?)?;
        let ok = self.with_key(key, |ctx, k| {
            ctx.define_raw(thr, obj, k, PropSlot::Accessor { get, set }, flags, strict)
        })?;
        self.pop_n(thr, 3)?;
        Ok(ok)
    }

    /// `[key]` -> own property description.
    ///
    /// A data property replaces the key with its value; an accessor replaces
    /// it with `[getter setter]` (either may be `undefined`). An absent
    /// property pops the key and returns `None`.
    pub fn get_own_prop(&mut self, thr: ObjRef, obj_idx: isize) -> Result<Option<PropFlags>> {
        let obj_idx = self.require_index(thr, obj_idx)?;
        let target = self.get(thr, obj_idx as isize)?;
        let key = self.get(thr, -1)?;
        let found = self.with_key(key, |ctx, k| {
            if let Some((v, flags)) = ctx.virtual_prop(target, k)? {
                ctx.push_virtual(thr, target, k, v)?;
                return Ok(Some(flags));
            }
            let Value::Object(o) = target else {
                return Ok(None);
            };
            let o = match ctx.proxy_data(o)? {
                Some(p) => p.target,
                None => o,
            };
            let Some(p) = ctx.own_prop(o, k)? else {
                return Ok(None);
            };
            match p.slot {
                PropSlot::Data(v) => ctx.push(thr, v)?,
                PropSlot::Accessor { get, set } => {
                    ctx.push(thr, get.map_or(Value::Undefined, Value::Object))?;
                    ctx.push(thr, set.map_or(Value::Undefined, Value::Object))?;
                }
            }
            Ok(Some(p.flags))
        })?;
        let key_idx = match found {
            Some(f) if f.is_accessor() => -3,
            Some(_) => -2,
            None => -1,
        };
        self.remove(thr, key_idx)?;
        Ok(found)
    }

    /// Push the prototype of the object at `obj_idx` (or `null`)
    pub fn get_prototype(&mut self, thr: ObjRef, obj_idx: isize) -> Result<()> {
        let obj = self.object_at(thr, obj_idx)?;
        let proto = self.heap.object(obj)?.proto;
        self.push(thr, proto.map_or(Value::Null, Value::Object))
    }

    /// `[proto]` -> `[]`: set the prototype of the object at `obj_idx`.
    ///
    /// `proto` must be an object, `null` or `undefined` (same as `null`).
    /// Cycles are not checked here; lookups stop at `proto_sanity` hops.
    pub fn set_prototype(&mut self, thr: ObjRef, obj_idx: isize) -> Result<()> {
        let obj_idx = self.require_index(thr, obj_idx)?;
        let obj = self.object_at(thr, obj_idx as isize)?;
        let proto = match self.get(thr, -1)? {
            Value::Undefined | Value::Null => None,
            Value::Object(p) => Some(p),
            _ => return Err(Error::type_error("prototype must be an object or null")),
        };
        let current = self.heap.object(obj)?.proto;
        if current != proto {
            if !self.heap.object(obj)?.is_extensible() {
                return Err(Error::type_error("object is not extensible"));
            }
            if let Some(p) = proto {
                self.incref(Value::Object(p));
            }
            self.heap.object_mut(obj)?.proto = proto;
            if let Some(old) = current {
                self.decref(Value::Object(old));
            }
        }
        self.pop(thr)
    }

    /// Prevent new properties on the object at `obj_idx`
    pub fn prevent_extensions(&mut self, thr: ObjRef, obj_idx: isize) -> Result<()> {
        let obj = self.object_at(thr, obj_idx)?;
        self.heap
            .object_mut(obj)?
            .flags
            .clear(crate::runtime::object::ObjectFlags::EXTENSIBLE);
        Ok(())
    }

    /// `value instanceof func`, with bound functions resolved to their target
    pub fn instance_of(&mut self, thr: ObjRef, val_idx: isize, func_idx: isize) -> Result<bool> {
        let val = self.get(thr, val_idx)?;
        let mut func = self.get(thr, func_idx)?;
        if !self.is_callable(func) {
            return Err(Error::type_error("instanceof requires a callable right-hand side"));
        }
        let mut budget = self.config.bound_chain_sanity;
        while let Value::Object(o) = func {
            let ObjectKind::BoundFunction(b) = &self.heap.object(o)?.kind else {
                break;
            };
            if budget == 0 {
                return Err(Error::range("bound function chain limit"));
            }
            budget -= 1;
            func = b.target;
        }

        // The target is reachable from the stack through the bound chain
        let key = Value::String(self.keys.prototype);
        self.get_raw(thr, func, key)?;
        let proto = match self.get(thr, -1)? {
            Value::Object(p) => p,
            _ => {
                self.pop(thr)?;
                return Err(Error::type_error("function prototype is not an object"));
            }
        };
        let Value::Object(o) = val else {
            self.pop(thr)?;
            return Ok(false);
        };
        let start = self.heap.object(o)?.proto;
        let mut walk = ProtoWalk::new(start, self.config.proto_sanity);
        let mut found = false;
        while let Some(cur) = walk.next(&self.heap)? {
            if cur == proto {
                found = true;
                break;
            }
        }
        self.pop(thr)?;
        Ok(found)
    }

    /// Rebuild the property storage of the object at `obj_idx` without
    /// spare capacity
    pub fn compact(&mut self, thr: ObjRef, obj_idx: isize) -> Result<()> {
        let obj = self.object_at(thr, obj_idx)?;
        self.heap.object_mut(obj)?.props.compact();
        self.heap.recharge(obj.0);
        Ok(())
    }

    // Convenience variants keyed by `&str` or an index

    /// Push `key` as an interned string key
    fn push_key_str(&mut self, thr: ObjRef, key: &str) -> Result<()> {
        self.push_string(thr, key).map(|_| ())
    }

    pub fn get_prop_str(&mut self, thr: ObjRef, obj_idx: isize, key: &str) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)? as isize;
        self.push_key_str(thr, key)?;
        self.get_prop(thr, obj_idx)
    }

    /// `[value]` -> `[]`
    pub fn put_prop_str(&mut self, thr: ObjRef, obj_idx: isize, key: &str, strict: bool) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)? as isize;
        self.push_key_str(thr, key)?;
        self.insert(thr, -2)?;
        self.put_prop(thr, obj_idx, strict)
    }

    pub fn del_prop_str(&mut self, thr: ObjRef, obj_idx: isize, key: &str, strict: bool) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)? as isize;
        self.push_key_str(thr, key)?;
        self.del_prop(thr, obj_idx, strict)
    }

    pub fn has_prop_str(&mut self, thr: ObjRef, obj_idx: isize, key: &str) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)? as isize;
        self.push_key_str(thr, key)?;
        self.has_prop(thr, obj_idx)
    }

    /// `[value]` -> `[]`, strict define
    pub fn define_prop_str(&mut self, thr: ObjRef, obj_idx: isize, key: &str, flags: PropFlags) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)? as isize;
        self.push_key_str(thr, key)?;
        self.insert(thr, -2)?;
        self.define_prop(thr, obj_idx, flags, true)
    }

    pub fn get_prop_index(&mut self, thr: ObjRef, obj_idx: isize, idx: u32) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)? as isize;
        self.push(thr, Value::Number(idx as f64))?;
        self.get_prop(thr, obj_idx)
    }

    /// `[value]` -> `[]`
    pub fn put_prop_index(&mut self, thr: ObjRef, obj_idx: isize, idx: u32, strict: bool) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)? as isize;
        self.push(thr, Value::Number(idx as f64))?;
        self.insert(thr, -2)?;
        self.put_prop(thr, obj_idx, strict)
    }

    pub fn del_prop_index(&mut self, thr: ObjRef, obj_idx: isize, idx: u32, strict: bool) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)? as isize;
        self.push(thr, Value::Number(idx as f64))?;
        self.del_prop(thr, obj_idx, strict)
    }

    pub fn has_prop_index(&mut self, thr: ObjRef, obj_idx: isize, idx: u32) -> Result<bool> {
        let obj_idx = self.require_index(thr, obj_idx)? as isize;
        self.push(thr, Value::Number(idx as f64))?;
        self.has_prop(thr, obj_idx)
    }
}
