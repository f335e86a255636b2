//! Proxy objects
//!
//! A proxy forwards `get`, `set`, `has` and `deleteProperty` to handler
//! traps. A trap is called with the handler as `this` and
//! `(target, key[, value], receiver)`; a missing trap falls through to the
//! target. Proxies of proxies are rejected at creation.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::object::{ClassId, HObject, ObjectKind};
use crate::value::{HeapRef, ObjRef, StrRef, Value};

/// Proxy payload
#[derive(Debug, Clone, Copy)]
pub struct ProxyData {
    pub target: ObjRef,
    pub handler: ObjRef,
}

impl ProxyData {
    pub(crate) fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        out.push(self.target.0);
        out.push(self.handler.0);
    }
}

/// Traps a proxy handler may define
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trap {
    Get,
    Set,
    Has,
    DeleteProperty,
}

impl Context {
    /// `[target handler]` -> `[proxy]`
    pub fn push_proxy(&mut self, thr: ObjRef) -> Result<ObjRef> {
        let target = self.get(thr, -2)?;
        let handler = self.get(thr, -1)?;
        let (Value::Object(target), Value::Object(handler)) = (target, handler) else {
            return Err(Error::type_error("proxy target and handler must be objects"));
        };
        if self.proxy_data(target)?.is_some() || self.proxy_data(handler)?.is_some() {
            return Err(Error::type_error("proxy target or handler is itself a proxy"));
        }

        let obj = HObject::new(
            ClassId::Proxy,
            None,
            ObjectKind::Proxy(ProxyData { target, handler }),
        );
        let p = self.push_new_object(thr, obj)?;
        self.replace(thr, -3)?;
        self.pop(thr)?;
        Ok(p)
    }

    pub(crate) fn proxy_data(&self, obj: ObjRef) -> Result<Option<ProxyData>> {
        Ok(self.heap.object(obj)?.proxy().copied())
    }

    fn trap_key(&self, trap: Trap) -> StrRef {
        match trap {
            Trap::Get => self.keys.get,
            Trap::Set => self.keys.set,
            Trap::Has => self.keys.has,
            Trap::DeleteProperty => self.keys.delete_property,
        }
    }

    /// Push the trap function if the handler defines one.
    ///
    /// Returns `false` with nothing pushed when the trap is absent.
    fn push_trap(&mut self, thr: ObjRef, data: ProxyData, trap: Trap) -> Result<bool> {
        let key = Value::String(self.trap_key(trap));
        self.get_raw(thr, Value::Object(data.handler), key)?;
        let f = self.get(thr, -1)?;
        if f.is_nullish() {
            self.pop(thr)?;
            return Ok(false);
        }
        if !self.is_callable(f) {
            self.pop(thr)?;
            return Err(Error::type_error("proxy trap is not callable"));
        }
        Ok(true)
    }

    /// Call the trap on top of the stack: `[trap]` -> `[result]`
    fn call_trap(
        &mut self,
        thr: ObjRef,
        data: ProxyData,
        key: Value,
        value: Option<Value>,
        receiver: Value,
    ) -> Result<()> {
        self.push(thr, Value::Object(data.handler))?;
        self.push(thr, Value::Object(data.target))?;
        self.push(thr, key)?;
        let mut nargs = 3;
        if let Some(v) = value {
            self.push(thr, v)?;
            nargs += 1;
        }
        self.push(thr, receiver)?;
        self.call(thr, nargs)
    }

    /// Proxy `get`; pushes the result
    pub(crate) fn proxy_get(&mut self, thr: ObjRef, proxy: ObjRef, key: Value) -> Result<bool> {
        let data = self.proxy_data(proxy)?.ok_or_else(|| Error::internal("not a proxy"))?;
        if self.push_trap(thr, data, Trap::Get)? {
            self.call_trap(thr, data, key, None, Value::Object(proxy))?;
            return Ok(true);
        }
        self.get_raw(thr, Value::Object(data.target), key)
    }

    /// Proxy `set`
    pub(crate) fn proxy_set(
        &mut self,
        thr: ObjRef,
        proxy: ObjRef,
        key: Value,
        value: Value,
        strict: bool,
    ) -> Result<bool> {
        let data = self.proxy_data(proxy)?.ok_or_else(|| Error::internal("not a proxy"))?;
        if self.push_trap(thr, data, Trap::Set)? {
            self.call_trap(thr, data, key, Some(value), Value::Object(proxy))?;
            let ok = self.to_boolean(self.get(thr, -1)?);
            self.pop(thr)?;
            if !ok && strict {
                return Err(Error::type_error("proxy set trap rejected"));
            }
            return Ok(ok);
        }
        self.put_raw(thr, Value::Object(data.target), key, value, strict)
    }

    /// Proxy `has`
    pub(crate) fn proxy_has(&mut self, thr: ObjRef, proxy: ObjRef, key: Value) -> Result<bool> {
        let data = self.proxy_data(proxy)?.ok_or_else(|| Error::internal("not a proxy"))?;
        if self.push_trap(thr, data, Trap::Has)? {
            self.call_trap(thr, data, key, None, Value::Object(proxy))?;
            let found = self.to_boolean(self.get(thr, -1)?);
            self.pop(thr)?;
            return Ok(found);
        }
        self.has_raw(thr, Value::Object(data.target), key)
    }

    /// Proxy `deleteProperty`
    pub(crate) fn proxy_delete(&mut self, thr: ObjRef, proxy: ObjRef, key: Value, strict: bool) -> Result<bool> {
        let data = self.proxy_data(proxy)?.ok_or_else(|| Error::internal("not a proxy"))?;
        if self.push_trap(thr, data, Trap::DeleteProperty)? {
            self.call_trap(thr, data, key, None, Value::Object(proxy))?;
            let ok = self.to_boolean(self.get(thr, -1)?);
            self.pop(thr)?;
            if !ok && strict {
                return Err(Error::type_error("proxy deleteProperty trap rejected"));
            }
            return Ok(ok);
        }
        self.del_raw(thr, Value::Object(data.target), key, strict)
    }
}
