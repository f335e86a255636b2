//! Environment records
//!
//! Scopes are objects. A declarative record keeps its bindings as its own
//! properties; an object record resolves names against a target object
//! (the global environment is an object record over the global object).
//! The outer environment is the record's prototype link, so chain walks
//! share the bounded prototype traversal.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::object::{ClassId, HObject, ObjectKind};
use crate::runtime::property::{PropFlags, PropSlot};
use crate::runtime::props::{PropKey, ProtoWalk};
use crate::value::{HeapRef, ObjRef, StrRef, Value};

/// Environment record payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvRecord {
    Declarative,
    Object { target: ObjRef, has_this: bool },
}

impl EnvRecord {
    pub(crate) fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        if let EnvRecord::Object { target, .. } = self {
            out.push(target.0);
        }
    }
}

/// Where a name resolved to
#[derive(Debug, Clone, Copy)]
enum Binding {
    /// Own property of a declarative record
    Declarative(ObjRef),
    /// Property reachable from an object record's target
    Object(ObjRef),
}

impl Context {
    fn env_record(&self, env: ObjRef) -> Result<EnvRecord> {
        match self.heap.object(env)?.kind {
            ObjectKind::Environment(rec) => Ok(rec),
            _ => Err(Error::type_error("not an environment record")),
        }
    }

    /// Push a declarative environment whose outer record is `outer`
    pub fn push_declarative_env(&mut self, thr: ObjRef, outer: Option<ObjRef>) -> Result<ObjRef> {
        let obj = HObject::new(
            ClassId::DeclarativeEnv,
            outer,
            ObjectKind::Environment(EnvRecord::Declarative),
        );
        self.push_new_object(thr, obj)
    }

    /// `[target]` -> `[env]`: object environment over `target`
    pub fn push_object_env(&mut self, thr: ObjRef, outer: Option<ObjRef>, has_this: bool) -> Result<ObjRef> {
        let target = self
            .get(thr, -1)?
            .as_object()
            .ok_or_else(|| Error::type_error("object environment target must be an object"))?;
        let obj = HObject::new(
            ClassId::ObjectEnv,
            outer,
            ObjectKind::Environment(EnvRecord::Object { target, has_this }),
        );
        let env = self.push_new_object(thr, obj)?;
        self.replace(thr, -2)?;
        Ok(env)
    }

    /// Find the record binding `name`, walking outwards from `env`
    fn resolve(&mut self, thr: ObjRef, env: Option<ObjRef>, name: StrRef) -> Result<Option<Binding>> {
        let start = env.unwrap_or(self.roots.global_env);
        let mut walk = ProtoWalk::new(Some(start), self.config.proto_sanity);
        while let Some(cur) = walk.next(&self.heap)? {
            match self.env_record(cur)? {
                EnvRecord::Declarative => {
                    if self.own_prop(cur, PropKey::Str(name))?.is_some() {
                        return Ok(Some(Binding::Declarative(cur)));
                    }
                }
                EnvRecord::Object { target, .. } => {
                    if self.has_raw(thr, Value::Object(target), Value::String(name))? {
                        return Ok(Some(Binding::Object(target)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Read a variable and push its value.
    ///
    /// An unresolvable name is a `ReferenceError` when `throw` is set;
    /// otherwise `undefined` is pushed and `false` returned.
    pub fn get_var(&mut self, thr: ObjRef, env: Option<ObjRef>, name: StrRef, throw: bool) -> Result<bool> {
        match self.resolve(thr, env, name)? {
            Some(Binding::Declarative(rec)) => {
                let v = match self.own_prop(rec, PropKey::Str(name))? {
                    Some(p) => match p.slot {
                        PropSlot::Data(v) => v,
                        PropSlot::Accessor { .. } => Value::Undefined,
                    },
                    None => Value::Undefined,
                };
                self.push(thr, v)?;
                Ok(true)
            }
            Some(Binding::Object(target)) => {
                self.get_raw(thr, Value::Object(target), Value::String(name))?;
                Ok(true)
            }
            None if throw => Err(Error::reference(format!(
                "identifier '{}' undefined",
                self.string_display(name)
            ))),
            None => {
                self.push(thr, Value::Undefined)?;
                Ok(false)
            }
        }
    }

    /// `[value]` -> `[]`: assign a variable.
    ///
    /// An unresolvable name is a `ReferenceError` in strict code and
    /// creates a property on the global object otherwise.
    pub fn put_var(&mut self, thr: ObjRef, env: Option<ObjRef>, name: StrRef, strict: bool) -> Result<()> {
        let value = self.get(thr, -1)?;
        match self.resolve(thr, env, name)? {
            Some(Binding::Declarative(rec)) => {
                let prop = self.own_prop(rec, PropKey::Str(name))?;
                match prop {
                    Some(p) if p.flags.is_writable() => self.write_own(rec, p.loc, value)?,
                    _ if strict => {
                        return Err(Error::type_error(format!(
                            "binding '{}' is not writable",
                            self.string_display(name)
                        )));
                    }
                    _ => {}
                }
            }
            Some(Binding::Object(target)) => {
                self.put_raw(thr, Value::Object(target), Value::String(name), value, strict)?;
            }
            None if strict => {
                return Err(Error::reference(format!(
                    "identifier '{}' undefined",
                    self.string_display(name)
                )));
            }
            None => {
                let global = Value::Object(self.roots.global);
                self.put_raw(thr, global, Value::String(name), value, false)?;
            }
        }
        self.pop(thr)
    }

    /// `[value]` -> `[]`: declare a binding in `env` itself.
    ///
    /// Object records declare on their target.
    pub fn declare_var(&mut self, thr: ObjRef, env: Option<ObjRef>, name: StrRef, flags: PropFlags) -> Result<()> {
        let env = env.unwrap_or(self.roots.global_env);
        let holder = match self.env_record(env)? {
            EnvRecord::Declarative => env,
            EnvRecord::Object { target, .. } => target,
        };
        let value = self.get(thr, -1)?;
        self.define_raw(thr, holder, PropKey::Str(name), PropSlot::Data(value), flags, true)?;
        self.pop(thr)
    }

    /// Delete a binding. Non-configurable bindings report `false`.
    pub fn delete_var(&mut self, thr: ObjRef, env: Option<ObjRef>, name: StrRef) -> Result<bool> {
        match self.resolve(thr, env, name)? {
            Some(Binding::Declarative(rec)) => {
                self.del_raw(thr, Value::Object(rec), Value::String(name), false)
            }
            Some(Binding::Object(target)) => {
                self.del_raw(thr, Value::Object(target), Value::String(name), false)
            }
            None => Ok(true),
        }
    }

    /// `this` binding provided by an environment, if any
    pub fn env_this(&self, env: ObjRef) -> Result<Option<ObjRef>> {
        Ok(match self.env_record(env)? {
            EnvRecord::Object { target, has_this: true } => Some(target),
            _ => None,
        })
    }
}
