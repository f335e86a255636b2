//! Thrown values and error objects
//!
//! `Error::Thrown` carries no payload; the thrown value waits in the
//! context's counted `thrown` slot until a catch point takes it. Native
//! error variants stay plain Rust values until something catches them and
//! needs an object.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::object::{ClassId, HObject, ObjectKind};
use crate::runtime::property::{PropFlags, PropSlot};
use crate::runtime::props::PropKey;
use crate::util::dtoa;
use crate::value::{ObjRef, Value};

impl Context {
    /// Park `v` as the in-flight thrown value and return the error to
    /// propagate: `return Err(ctx.throw(v))`
    pub fn throw(&mut self, v: Value) -> Error {
        self.incref(v);
        let old = std::mem::replace(&mut self.thrown, v);
        self.decref(old);
        Error::Thrown
    }

    /// Pop the top value and throw it
    pub fn throw_top(&mut self, thr: ObjRef) -> Error {
        match self.take_top(thr) {
            Ok(v) => {
                let old = std::mem::replace(&mut self.thrown, v);
                self.decref(old);
                Error::Thrown
            }
            Err(e) => e,
        }
    }

    /// The in-flight thrown value, `undefined` when none
    #[inline]
    pub fn thrown_value(&self) -> Value {
        self.thrown
    }

    /// Move the in-flight thrown value onto the stack
    pub fn push_thrown(&mut self, thr: ObjRef) -> Result<()> {
        let v = std::mem::replace(&mut self.thrown, Value::Undefined);
        self.push_owned(thr, v)
    }

    /// Push a new error object with the given `name` and `message`
    pub fn push_error_object(&mut self, thr: ObjRef, name: &str, message: &str) -> Result<ObjRef> {
        let proto = Some(self.roots.error_proto);
        let obj = self.push_new_object(thr, HObject::new(ClassId::Error, proto, ObjectKind::Plain))?;
        let flags = PropFlags::WRITABLE | PropFlags::CONFIGURABLE;
        self.push_string(thr, name)?;
        self.define_prop_str(thr, -2, "name", flags)?;
        self.push_string(thr, message)?;
        self.define_prop_str(thr, -2, "message", flags)?;
        Ok(obj)
    }

    /// Push the value a caught error stands for.
    ///
    /// `Thrown` yields the parked value; native variants become error
    /// objects. When building the object fails the preallocated double
    /// error is pushed instead.
    pub fn push_error_value(&mut self, thr: ObjRef, err: &Error) -> Result<()> {
        if let Error::Thrown = err {
            return self.push_thrown(thr);
        }
        let top = self.get_top(thr)?;
        if self.push_error_object(thr, err.class_name(), err.message()).is_ok() {
            return Ok(());
        }
        self.set_top(thr, top)?;
        self.push(thr, Value::Object(self.roots.double_error))
    }

    fn own_data_string(&self, obj: ObjRef, key: PropKey) -> Option<String> {
        let prop = self.own_prop(obj, key).ok()??;
        match prop.slot {
            PropSlot::Data(Value::String(s)) => Some(self.string_display(s)),
            _ => None,
        }
    }

    /// Short printable description of a value, for logs and the shell.
    /// Never calls into script code.
    pub fn value_summary(&self, v: Value) -> String {
        match v {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => dtoa::number_to_string(n),
            Value::String(s) => format!("{:?}", self.string_display(s)),
            Value::Buffer(b) => match self.heap.buffer(b) {
                Ok(buf) => format!("[buffer {}]", buf.len()),
                Err(_) => "[buffer]".into(),
            },
            Value::Pointer(p) => format!("{p:p}"),
            Value::LightFunc(_) => "[lightfunc]".into(),
            Value::Object(o) => {
                let Ok(obj) = self.heap.object(o) else {
                    return "[stale object]".into();
                };
                if obj.class == ClassId::Error {
                    let name = self
                        .own_data_string(o, PropKey::Str(self.keys.name))
                        .unwrap_or_else(|| "Error".into());
                    return match self.own_data_string(o, PropKey::Str(self.keys.message)) {
                        Some(m) if !m.is_empty() => format!("{name}: {m}"),
                        _ => name,
                    };
                }
                format!("[object {}]", obj.class.name())
            }
        }
    }
}
