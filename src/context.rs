//! Runtime context
//!
//! The `Context` owns the heap arena, the string table and every runtime
//! root. There are no statics: two contexts never share anything, and a
//! context is confined to the thread that created it.
//!
//! ```ignore
//! use tinyrt::{Context, Value};
//!
//! let mut ctx = Context::new()?;
//! let thr = ctx.heap_thread();
//! ctx.push_object(thr)?;
//! ctx.push(thr, Value::number(42.0))?;
//! ctx.put_prop_str(thr, -2, "answer", true)?;
//! ```

use std::rc::Rc;

use crate::config::HeapConfig;
use crate::error::{Error, Result};
use crate::gc::{GcFlags, GcState, Heap, HeapBody, HeapHeader, WeakTable};
use crate::runtime::env::EnvRecord;
use crate::runtime::object::{ArrayData, ClassId, HObject, ObjectKind};
use crate::runtime::property::PropFlags;
use crate::runtime::string::{HString, StringTable};
use crate::util::hash;
use crate::value::{HeapRef, ObjRef, StrRef, Value};
use crate::vm::call::{Executor, NullExecutor};
use crate::vm::thread::HThread;

/// Upper bound on teardown finalizer rounds
const DESTROY_FINALIZER_ROUNDS: usize = 16;

/// Handle that never resolves, used before bootstrap fills a root in
const UNSET: HeapRef = HeapRef::new(u32::MAX, u32::MAX);

/// Runtime-owned objects. Each holds one counted reference.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Roots {
    pub global: ObjRef,
    pub object_proto: ObjRef,
    pub function_proto: ObjRef,
    pub array_proto: ObjRef,
    pub error_proto: ObjRef,
    pub global_env: ObjRef,
    pub heap_thread: ObjRef,
    /// Preallocated error used when materializing an error runs out of memory
    pub double_error: ObjRef,
    /// Host-pinned values
    pub stash: ObjRef,
}

impl Roots {
    fn unset() -> Self {
        let o = ObjRef(UNSET);
        Roots {
            global: o,
            object_proto: o,
            function_proto: o,
            array_proto: o,
            error_proto: o,
            global_env: o,
            heap_thread: o,
            double_error: o,
            stash: o,
        }
    }

    fn all(&self) -> [ObjRef; 9] {
        [
            self.global,
            self.object_proto,
            self.function_proto,
            self.array_proto,
            self.error_proto,
            self.global_env,
            self.heap_thread,
            self.double_error,
            self.stash,
        ]
    }

    pub(crate) fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        out.extend(self.all().iter().map(|o| o.0));
    }
}

/// Pinned strings the runtime looks up by handle
#[derive(Debug, Clone, Copy)]
pub(crate) struct BuiltinKeys {
    pub length: StrRef,
    pub name: StrRef,
    pub message: StrRef,
    pub prototype: StrRef,
    pub constructor: StrRef,
    /// Internal finalizer slot, `\xFFFinalizer`
    pub finalizer: StrRef,
    pub get: StrRef,
    pub set: StrRef,
    pub has: StrRef,
    pub delete_property: StrRef,
}

impl BuiltinKeys {
    const SOURCES: [&'static [u8]; 10] = [
        b"length",
        b"name",
        b"message",
        b"prototype",
        b"constructor",
        b"\xffFinalizer",
        b"get",
        b"set",
        b"has",
        b"deleteProperty",
    ];

    fn unset() -> Self {
        let s = StrRef(UNSET);
        BuiltinKeys {
            length: s,
            name: s,
            message: s,
            prototype: s,
            constructor: s,
            finalizer: s,
            get: s,
            set: s,
            has: s,
            delete_property: s,
        }
    }

    fn from_interned(k: [StrRef; 10]) -> Self {
        BuiltinKeys {
            length: k[0],
            name: k[1],
            message: k[2],
            prototype: k[3],
            constructor: k[4],
            finalizer: k[5],
            get: k[6],
            set: k[7],
            has: k[8],
            delete_property: k[9],
        }
    }

    pub(crate) fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        out.extend(
            [
                self.length,
                self.name,
                self.message,
                self.prototype,
                self.constructor,
                self.finalizer,
                self.get,
                self.set,
                self.has,
                self.delete_property,
            ]
            .iter()
            .map(|s| s.0),
        );
    }
}

/// Heap and execution context
pub struct Context {
    pub(crate) heap: Heap,
    pub(crate) strings: StringTable,
    pub(crate) config: HeapConfig,
    pub(crate) roots: Roots,
    pub(crate) keys: BuiltinKeys,
    /// In-flight thrown value (counted)
    pub(crate) thrown: Value,
    /// Thread currently executing, if any
    pub(crate) curr_thread: Option<ObjRef>,
    /// Saved `curr_thread` values of enclosing calls and resumes
    pub(crate) thread_stack: Vec<Option<ObjRef>>,
    /// Threads detached by `suspend` (counted)
    pub(crate) detached: Vec<ObjRef>,
    /// Nesting depth of host-level calls
    pub(crate) call_depth: usize,
    pub(crate) gc: GcState,
    pub(crate) weak: WeakTable,
    pub(crate) executor: Rc<dyn Executor>,
    pub(crate) interrupt: Option<Box<dyn FnMut() -> bool>>,
    destroying: bool,
}

impl Context {
    /// Create a context with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(HeapConfig::default())
    }

    /// Create a context with an explicit configuration
    pub fn with_config(config: HeapConfig) -> Result<Self> {
        let mut ctx = Context {
            heap: Heap::new(config.max_bytes),
            strings: StringTable::new(),
            config,
            roots: Roots::unset(),
            keys: BuiltinKeys::unset(),
            thrown: Value::Undefined,
            curr_thread: None,
            thread_stack: Vec::new(),
            detached: Vec::new(),
            call_depth: 0,
            gc: GcState::default(),
            weak: WeakTable::default(),
            executor: Rc::new(NullExecutor),
            interrupt: None,
            destroying: false,
        };
        // No voluntary collection until every root exists
        ctx.gc.trigger = i64::MAX;
        ctx.bootstrap()?;
        ctx.gc.trigger = ctx.config.trigger_after(ctx.heap.counts().objects);
        Ok(ctx)
    }

    fn bootstrap(&mut self) -> Result<()> {
        let mut keys = [StrRef(UNSET); 10];
        for (slot, src) in keys.iter_mut().zip(BuiltinKeys::SOURCES) {
            let s = self.intern(src)?;
            self.heap.header_mut(s.0)?.set(HeapHeader::PINNED);
            *slot = s;
        }
        self.keys = BuiltinKeys::from_interned(keys);

        let thread = HObject::new(
            ClassId::Thread,
            None,
            ObjectKind::Thread(Box::new(HThread::new(&self.config))),
        );
        self.roots.heap_thread = self.alloc_root(thread)?;

        let object_proto = self.alloc_root(HObject::new(ClassId::Object, None, ObjectKind::Plain))?;
        self.roots.object_proto = object_proto;
        let proto = Some(object_proto);
        self.roots.function_proto = self.alloc_root(HObject::new(ClassId::Function, proto, ObjectKind::Plain))?;
        self.roots.array_proto = self.alloc_root(HObject::new(ClassId::Array, proto, ObjectKind::Plain))?;
        self.roots.error_proto = self.alloc_root(HObject::new(ClassId::Error, proto, ObjectKind::Plain))?;

        let global = self.alloc_root(HObject::new(ClassId::Object, proto, ObjectKind::Plain))?;
        self.roots.global = global;
        let env = EnvRecord::Object {
            target: global,
            has_this: false,
        };
        self.roots.global_env = self.alloc_root(HObject::new(
            ClassId::ObjectEnv,
            None,
            ObjectKind::Environment(env),
        ))?;
        self.roots.stash = self.alloc_root(HObject::new(
            ClassId::Array,
            None,
            ObjectKind::Array(ArrayData::default()),
        ))?;

        let thr = self.roots.heap_thread;
        let error_proto = self.roots.error_proto;
        self.push(thr, Value::Object(error_proto))?;
        self.push_string(thr, "Error")?;
        self.define_prop_str(thr, -2, "name", PropFlags::WRITABLE | PropFlags::CONFIGURABLE)?;
        self.push_string(thr, "")?;
        self.define_prop_str(thr, -2, "message", PropFlags::WRITABLE | PropFlags::CONFIGURABLE)?;
        self.pop(thr)?;

        let double_error = self.push_error_object(thr, "Error", "error in error handling")?;
        self.incref_ref(double_error.0);
        self.heap.header_mut(double_error.0)?.set(HeapHeader::PINNED);
        self.roots.double_error = double_error;
        self.pop(thr)?;

        tracing::debug!(
            objects = self.heap.counts().objects,
            strings = self.strings.used(),
            "context ready"
        );
        Ok(())
    }

    /// Allocate a root object and take the root's reference
    fn alloc_root(&mut self, obj: HObject) -> Result<ObjRef> {
        let o = self.alloc_object(obj)?;
        self.incref_ref(o.0);
        Ok(o)
    }

    // Root accessors

    /// The runtime's own thread, always available for host calls
    #[inline]
    pub fn heap_thread(&self) -> ObjRef {
        self.roots.heap_thread
    }

    #[inline]
    pub fn global(&self) -> ObjRef {
        self.roots.global
    }

    #[inline]
    pub fn global_env(&self) -> ObjRef {
        self.roots.global_env
    }

    #[inline]
    pub fn object_proto(&self) -> ObjRef {
        self.roots.object_proto
    }

    #[inline]
    pub fn function_proto(&self) -> ObjRef {
        self.roots.function_proto
    }

    #[inline]
    pub fn array_proto(&self) -> ObjRef {
        self.roots.array_proto
    }

    #[inline]
    pub fn error_proto(&self) -> ObjRef {
        self.roots.error_proto
    }

    /// Thread currently executing, `None` when idle
    #[inline]
    pub fn current_thread(&self) -> Option<ObjRef> {
        self.curr_thread
    }

    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Install the callback polled by `check_interrupt`
    pub fn set_interrupt_handler(&mut self, handler: Option<Box<dyn FnMut() -> bool>>) {
        self.interrupt = handler;
    }

    // Allocation

    /// Allocate a heap cell with refcount zero.
    ///
    /// Counts down the voluntary trigger first. An allocation over the byte
    /// limit is retried once after an emergency collection.
    pub(crate) fn alloc(&mut self, body: HeapBody) -> Result<HeapRef> {
        self.tick_trigger();
        let bytes = body.byte_size();
        if !self.heap.can_alloc(bytes) {
            let stats = self.collect(GcFlags::EMERGENCY);
            if stats.skipped || !self.heap.can_alloc(bytes) {
                tracing::debug!(bytes, used = self.heap.used_bytes(), "allocation failed");
                return Err(Error::OutOfMemory);
            }
        }
        self.heap.alloc(body)
    }

    /// Allocate an object and count the references its payload holds
    pub(crate) fn alloc_object(&mut self, obj: HObject) -> Result<ObjRef> {
        let mut children = Vec::new();
        obj.heap_refs(&mut children);
        let r = self.alloc(HeapBody::Object(obj))?;
        for child in children {
            self.incref_ref(child);
        }
        Ok(ObjRef(r))
    }

    /// Allocate an object and push it
    pub(crate) fn push_new_object(&mut self, thr: ObjRef, obj: HObject) -> Result<ObjRef> {
        self.require_stack(thr, 1)?;
        let o = self.alloc_object(obj)?;
        self.push(thr, Value::Object(o))?;
        Ok(o)
    }

    /// Push a new empty object inheriting from the object prototype
    pub fn push_object(&mut self, thr: ObjRef) -> Result<ObjRef> {
        let proto = Some(self.roots.object_proto);
        self.push_new_object(thr, HObject::new(ClassId::Object, proto, ObjectKind::Plain))
    }

    /// Push a new thread. It starts `Inactive` with empty stacks.
    pub fn push_thread(&mut self, thr: ObjRef) -> Result<ObjRef> {
        let mut t = HThread::new(&self.config);
        t.strict = self.thread(thr)?.strict;
        let obj = HObject::new(
            ClassId::Thread,
            Some(self.roots.object_proto),
            ObjectKind::Thread(Box::new(t)),
        );
        self.push_new_object(thr, obj)
    }

    // Strings

    /// Intern a string, returning an owned reference. Pair with `release`.
    pub fn intern(&mut self, bytes: impl AsRef<[u8]>) -> Result<StrRef> {
        let bytes = bytes.as_ref();
        let hash = hash::hash_string(bytes, self.config.hash_seed);
        if let Some(s) = self.strings.lookup(&self.heap, bytes, hash) {
            self.incref_ref(s.0);
            return Ok(s);
        }
        let r = self.alloc(HeapBody::String(HString::new(bytes.into(), hash)))?;
        let s = StrRef(r);
        if let Err(e) = self.strings.insert(&self.heap, s, hash) {
            self.heap.free(r);
            return Err(e);
        }
        self.incref_ref(r);
        Ok(s)
    }

    /// Drop a reference obtained from `intern`
    pub fn release(&mut self, s: StrRef) {
        self.decref_ref(s.0);
    }

    pub fn string_bytes(&self, s: StrRef) -> Result<&[u8]> {
        Ok(self.heap.string(s)?.as_bytes())
    }

    /// Lossy, printable form of a string
    pub fn string_display(&self, s: StrRef) -> String {
        self.heap.string(s).map(HString::to_display).unwrap_or_default()
    }

    // Stash

    /// `[value]` -> `[]`: pin a value in the stash
    pub fn stash_push(&mut self, thr: ObjRef) -> Result<()> {
        self.push(thr, Value::Object(self.roots.stash))?;
        self.swap(thr, -1, -2)?;
        self.array_append(thr, -2)?;
        self.pop(thr)
    }

    /// Unpin the most recently stashed value and push it.
    /// Returns `false`, pushing nothing, when the stash is empty.
    pub fn stash_pop(&mut self, thr: ObjRef) -> Result<bool> {
        self.push(thr, Value::Object(self.roots.stash))?;
        let found = self.array_pop(thr, -1)?;
        if found {
            self.remove(thr, -2)?;
        } else {
            self.pop(thr)?;
        }
        Ok(found)
    }

    /// Number of stashed values
    pub fn stash_len(&self) -> usize {
        self.array_length(self.roots.stash).unwrap_or(0) as usize
    }

    // Conversions

    pub fn to_boolean(&self, v: Value) -> bool {
        match v {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => b,
            Value::Number(n) => n != 0.0 && !n.is_nan(),
            Value::String(s) => self.heap.string(s).is_ok_and(|h| !h.is_empty()),
            Value::Pointer(p) => !p.is_null(),
            Value::Object(_) | Value::Buffer(_) | Value::LightFunc(_) => true,
        }
    }

    /// Hand an unrecoverable condition to the host fatal handler
    pub(crate) fn fatal(&self, msg: &str) -> ! {
        tracing::error!(message = msg, "fatal error, invoking handler");
        (self.config.fatal_handler)(msg)
    }

    /// Whether teardown has started
    #[inline]
    pub fn is_destroying(&self) -> bool {
        self.destroying
    }

    fn destroy(&mut self) {
        self.destroying = true;
        tracing::debug!(objects = self.heap.counts().objects, "context teardown");

        let threads: Vec<ObjRef> = self
            .heap
            .iter()
            .filter(|(_, c)| matches!(&c.body, HeapBody::Object(o) if o.thread().is_some()))
            .map(|(r, _)| ObjRef(r))
            .collect();
        for t in threads {
            let _ = self.reset_thread(t);
        }

        let thrown = std::mem::replace(&mut self.thrown, Value::Undefined);
        self.decref(thrown);
        while self.curr_thread.is_some() || !self.thread_stack.is_empty() {
            self.leave_thread();
        }
        for t in std::mem::take(&mut self.detached) {
            self.decref_ref(t.0);
        }

        // The heap thread stays to run finalizers
        let roots = self.roots;
        if let Ok(h) = self.heap.header_mut(roots.double_error.0) {
            h.clear(HeapHeader::PINNED);
        }
        for r in roots.all() {
            if r != roots.heap_thread {
                self.decref_ref(r.0);
            }
        }
        self.roots = Roots {
            heap_thread: roots.heap_thread,
            ..Roots::unset()
        };

        self.collect(GcFlags::NONE);
        self.collect(GcFlags::NONE);

        // Best effort: keep everything alive while the remaining finalizers run
        self.gc.ms_running = true;
        self.gc.collecting = true;
        for _ in 0..DESTROY_FINALIZER_ROUNDS {
            let pending: Vec<ObjRef> = self
                .heap
                .iter()
                .filter(|(_, c)| {
                    matches!(c.body, HeapBody::Object(_)) && !c.header.has(HeapHeader::FINALIZED)
                })
                .map(|(r, _)| ObjRef(r))
                .filter(|&o| self.finalizer_of(o).is_some())
                .collect();
            if pending.is_empty() {
                break;
            }
            for obj in pending {
                if let Ok(h) = self.heap.header_mut(obj.0) {
                    h.set(HeapHeader::FINALIZED);
                }
                self.run_finalizer(obj, true);
            }
        }
        // The arena itself frees the rest
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_context() {
        let ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        assert_eq!(ctx.get_top(thr).unwrap(), 0);
        assert!(ctx.heap.contains(ctx.global().0));
        assert_eq!(ctx.current_thread(), None);
        assert_eq!(ctx.refcount(Value::Object(ctx.global_env())), Some(1));
    }

    #[test]
    fn test_intern_identity() {
        let mut ctx = Context::new().unwrap();
        let a = ctx.intern("foo").unwrap();
        let b = ctx.intern(b"foo").unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.refcount(Value::String(a)), Some(2));
        assert_eq!(ctx.string_bytes(a).unwrap(), b"foo");
        ctx.release(a);
        ctx.release(b);
        assert_eq!(ctx.refcount(Value::String(a)), None);
    }

    #[test]
    fn test_builtin_keys_pinned() {
        let mut ctx = Context::new().unwrap();
        let length = ctx.intern("length").unwrap();
        assert_eq!(length, ctx.keys.length);
        ctx.release(length);
        ctx.release(ctx.keys.length);
        // Pinned: the count hit zero but the string stays
        assert!(ctx.heap.contains(ctx.keys.length.0));
    }

    #[test]
    fn test_to_boolean() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        let empty = ctx.push_string(thr, "").unwrap();
        let full = ctx.push_string(thr, "x").unwrap();
        assert!(!ctx.to_boolean(Value::Undefined));
        assert!(!ctx.to_boolean(Value::Number(f64::NAN)));
        assert!(!ctx.to_boolean(Value::Number(-0.0)));
        assert!(ctx.to_boolean(Value::Number(3.0)));
        assert!(!ctx.to_boolean(Value::String(empty)));
        assert!(ctx.to_boolean(Value::String(full)));
        assert!(ctx.to_boolean(Value::Object(ctx.global())));
        assert!(!ctx.to_boolean(Value::Pointer(std::ptr::null_mut())));
    }

    #[test]
    fn test_stash() {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        let obj = ctx.push_object(thr).unwrap();
        ctx.stash_push(thr).unwrap();
        assert_eq!(ctx.get_top(thr).unwrap(), 0);
        assert_eq!(ctx.stash_len(), 1);
        assert_eq!(ctx.refcount(Value::Object(obj)), Some(1));

        ctx.collect(GcFlags::NONE);
        assert!(ctx.heap.contains(obj.0));

        assert!(ctx.stash_pop(thr).unwrap());
        assert_eq!(ctx.get(thr, -1).unwrap(), Value::Object(obj));
        assert_eq!(ctx.stash_len(), 0);
        assert!(!ctx.stash_pop(thr).unwrap());
        assert_eq!(ctx.get_top(thr).unwrap(), 1);
    }

    #[test]
    fn test_out_of_memory_after_emergency_gc() {
        let cfg = HeapConfig::default().with_max_bytes(64 * 1024);
        let mut ctx = Context::with_config(cfg).unwrap();
        let thr = ctx.heap_thread();
        let mut result = Ok(());
        for i in 0..100_000 {
            result = ctx.push_string(thr, &format!("string number {i}")).map(|_| ());
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(Error::OutOfMemory));
        // Dropping the stack makes room again
        ctx.set_top(thr, 0).unwrap();
        assert!(ctx.push_string(thr, "fits again").is_ok());
    }
}
