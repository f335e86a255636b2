//! Property enumeration
//!
//! An enumerator is a heap object holding a snapshot of the keys to visit.
//! Keys are collected per object along the prototype chain: array part
//! indices, then index-like entry keys in ascending order, then the
//! remaining entry keys in insertion order. A key already seen on a nearer
//! object (even a non-enumerable one) shadows the same key further up.
//!
//! `enumerator_next` re-checks each key before yielding it, so keys deleted
//! after the snapshot are skipped.

use std::collections::HashSet;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::object::{ClassId, HObject, ObjectKind};
use crate::runtime::props::{PropKey, ProtoWalk};
use crate::util::dtoa;
use crate::value::{HeapRef, ObjRef, StrRef, Value};

/// Enumeration flags
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EnumFlags(u8);

impl EnumFlags {
    pub const NONE: EnumFlags = EnumFlags(0);
    /// Skip the prototype chain
    pub const OWN_ONLY: EnumFlags = EnumFlags(1 << 0);
    pub const INCLUDE_NONENUMERABLE: EnumFlags = EnumFlags(1 << 1);
    /// Include `\xFF`-prefixed keys
    pub const INCLUDE_INTERNAL: EnumFlags = EnumFlags(1 << 2);
    pub const ARRAY_INDICES_ONLY: EnumFlags = EnumFlags(1 << 3);
    /// Move every index key in front of string keys, ascending
    pub const SORT_ARRAY_INDICES: EnumFlags = EnumFlags(1 << 4);

    #[inline]
    pub const fn contains(self, other: EnumFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EnumFlags {
    type Output = EnumFlags;

    fn bitor(self, rhs: EnumFlags) -> EnumFlags {
        EnumFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for EnumFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnumFlags({:#07b})", self.0)
    }
}

/// Enumerator payload
#[derive(Debug)]
pub struct EnumState {
    pub target: ObjRef,
    /// `Number` for index keys, `String` otherwise
    pub keys: Vec<Value>,
    pub pos: usize,
    pub flags: EnumFlags,
}

impl EnumState {
    pub(crate) fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        out.push(self.target.0);
        out.extend(self.keys.iter().filter_map(Value::heap_ref));
    }

    /// Keys not yet visited
    pub fn remaining(&self) -> usize {
        self.keys.len().saturating_sub(self.pos)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Seen {
    Index(u32),
    Str(StrRef),
}

impl Context {
    /// Collect the key snapshot for `target`
    fn collect_enum_keys(&self, target: ObjRef, flags: EnumFlags) -> Result<Vec<Value>> {
        let mut keys = Vec::new();
        let mut seen: HashSet<Seen> = HashSet::new();
        let include_hidden = flags.contains(EnumFlags::INCLUDE_NONENUMERABLE);
        let indices_only = flags.contains(EnumFlags::ARRAY_INDICES_ONLY);

        let mut walk = ProtoWalk::new(Some(target), self.config.proto_sanity);
        while let Some(cur) = walk.next(&self.heap)? {
            let obj = self.heap.object(cur)?;

            for (i, _) in obj.props.array_items() {
                if seen.insert(Seen::Index(i)) {
                    keys.push(Value::Number(i as f64));
                }
            }
            if include_hidden && !indices_only && obj.array_data().is_some() {
                let length = self.keys.length;
                if seen.insert(Seen::Str(length)) {
                    keys.push(Value::String(length));
                }
            }

            let mut index_keys = Vec::new();
            let mut string_keys = Vec::new();
            for (_, e) in obj.props.entries() {
                let Some(key) = e.key else { continue };
                let s = self.heap.string(key)?;
                if s.is_internal() && !flags.contains(EnumFlags::INCLUDE_INTERNAL) {
                    continue;
                }
                let id = match s.array_index() {
                    Some(i) => Seen::Index(i),
                    None => Seen::Str(key),
                };
                // Non-enumerable keys still shadow inherited ones
                if !seen.insert(id) || (!e.flags.is_enumerable() && !include_hidden) {
                    continue;
                }
                match id {
                    Seen::Index(i) => index_keys.push(i),
                    Seen::Str(_) if !indices_only => string_keys.push(key),
                    Seen::Str(_) => {}
                }
            }
            index_keys.sort_unstable();
            keys.extend(index_keys.into_iter().map(|i| Value::Number(i as f64)));
            keys.extend(string_keys.into_iter().map(Value::String));

            if flags.contains(EnumFlags::OWN_ONLY) {
                break;
            }
        }

        if flags.contains(EnumFlags::SORT_ARRAY_INDICES) {
            keys.sort_by_key(|k| match k {
                Value::Number(n) => *n as u64,
                _ => u64::MAX,
            });
        }
        Ok(keys)
    }

    /// Push an enumerator over the object at `obj_idx`.
    ///
    /// Proxies enumerate their target.
    pub fn enumerator_create(&mut self, thr: ObjRef, obj_idx: isize, flags: EnumFlags) -> Result<ObjRef> {
        let mut target = self
            .get(thr, obj_idx)?
            .as_object()
            .ok_or_else(|| Error::type_error("cannot enumerate a non-object"))?;
        if let Some(p) = self.proxy_data(target)? {
            target = p.target;
        }
        let keys = self.collect_enum_keys(target, flags)?;
        let state = EnumState {
            target,
            keys,
            pos: 0,
            flags,
        };
        let obj = HObject::new(ClassId::Enumerator, None, ObjectKind::Enumerator(Box::new(state)));
        self.push_new_object(thr, obj)
    }

    fn enum_state_mut(&mut self, e: ObjRef) -> Result<&mut EnumState> {
        match &mut self.heap.object_mut(e)?.kind {
            ObjectKind::Enumerator(s) => Ok(s),
            _ => Err(Error::type_error("not an enumerator")),
        }
    }

    /// Push the next key (and its value when `get_value` is set).
    ///
    /// Returns `false` with nothing pushed once the keys are exhausted.
    pub fn enumerator_next(&mut self, thr: ObjRef, enum_idx: isize, get_value: bool) -> Result<bool> {
        let e = self
            .get(thr, enum_idx)?
            .as_object()
            .ok_or_else(|| Error::type_error("not an enumerator"))?;
        loop {
            let state = self.enum_state_mut(e)?;
            let Some(&key) = state.keys.get(state.pos) else {
                return Ok(false);
            };
            state.pos += 1;
            let target = state.target;
            let own_only = state.flags.contains(EnumFlags::OWN_ONLY);

            // Deleted since the snapshot
            let present = if own_only {
                let pk = match key {
                    Value::Number(n) => PropKey::Index(n as u32),
                    Value::String(s) => PropKey::Str(s),
                    _ => continue,
                };
                self.own_prop(target, pk)?.is_some() || self.virtual_own_key(target, pk)?
            } else {
                self.has_raw(thr, Value::Object(target), key)?
            };
            if !present {
                continue;
            }

            match key {
                Value::Number(n) => {
                    let mut buf = [0u8; 10];
                    let bytes = dtoa::u32_to_str(&mut buf, n as u32);
                    self.push_string_bytes(thr, bytes)?;
                }
                _ => self.push(thr, key)?,
            }
            if get_value {
                self.get_raw(thr, Value::Object(target), key)?;
            }
            return Ok(true);
        }
    }
}
