//! Function types
//!
//! This module implements the different function types:
//! - Compiled functions (bytecode instantiated from a `FunctionTemplate`)
//! - Native functions (Rust function pointers)
//! - Bound functions (target + bound `this` + leading arguments)
//!
//! Lightweight functions (`Value::LightFunc`) have no heap object at all.

use std::rc::Rc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::object::{ClassId, HObject, ObjectFlags, ObjectKind};
use crate::runtime::property::PropFlags;
use crate::value::{HeapRef, LightFunc, ObjRef, Value};

/// Maximum number of declared arguments
pub const MAX_ARGS: u16 = 65535;

/// Native function signature.
///
/// Arguments sit on the thread's value stack starting at index 0; `this`
/// and the function itself are below the frame (see `Context::push_this`).
/// The function returns how many values it left on top of the stack as
/// results: 0 for `undefined`, otherwise the topmost value is the result.
pub type NativeFn = fn(&mut Context, ObjRef) -> Result<usize>;

/// Native function payload
#[derive(Debug, Clone, Copy)]
pub struct NativeFunction {
    pub func: NativeFn,
    /// Declared argument count; `None` means varargs
    pub nargs: Option<u16>,
    pub magic: i16,
}

/// Compiled function payload
#[derive(Debug)]
pub struct CompiledFunction {
    pub name: Option<String>,
    pub bytecode: Rc<[u8]>,
    /// Counted constants
    pub constants: Vec<Value>,
    /// Counted inner function objects
    pub inner: Vec<ObjRef>,
    pub nargs: u16,
    pub nregs: u16,
    pub var_env: Option<ObjRef>,
    pub lex_env: Option<ObjRef>,
    pub line_numbers: Rc<[(u32, u32)]>,
}

impl CompiledFunction {
    pub(crate) fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        out.extend(self.constants.iter().filter_map(Value::heap_ref));
        out.extend(self.inner.iter().map(|o| o.0));
        out.extend(self.var_env.map(|o| o.0));
        out.extend(self.lex_env.map(|o| o.0));
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.bytecode.len()
            + self.constants.len() * std::mem::size_of::<Value>()
            + self.inner.len() * std::mem::size_of::<ObjRef>()
    }

    /// Source line for a program counter
    pub fn line_number(&self, pc: u32) -> Option<u32> {
        let idx = self
            .line_numbers
            .partition_point(|&(p, _)| p <= pc)
            .checked_sub(1)?;
        self.line_numbers.get(idx).map(|&(_, line)| line)
    }
}

/// Bound function payload
#[derive(Debug)]
pub struct BoundFunction {
    pub target: Value,
    pub this: Value,
    pub args: Vec<Value>,
}

impl BoundFunction {
    pub(crate) fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        out.extend(self.target.heap_ref());
        out.extend(self.this.heap_ref());
        out.extend(self.args.iter().filter_map(Value::heap_ref));
    }
}

/// Compile-time constant
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Number(f64),
    String(String),
}

/// Compiler output: everything needed to instantiate a compiled function
#[derive(Debug, Clone, Default)]
pub struct FunctionTemplate {
    /// Function name (for debugging)
    pub name: Option<String>,
    /// Number of declared arguments
    pub nargs: u16,
    /// Number of registers (arguments included)
    pub nregs: u16,
    pub strict: bool,
    pub constructable: bool,
    /// The compiled bytecode
    pub bytecode: Vec<u8>,
    /// Constant pool
    pub constants: Vec<Constant>,
    /// Inner functions defined within this function
    pub inner: Vec<FunctionTemplate>,
    /// Debug info: line number table (pc -> line)
    pub line_numbers: Vec<(u32, u32)>,
}

impl FunctionTemplate {
    /// Create a new template
    pub fn new(nargs: u16, nregs: u16) -> Self {
        FunctionTemplate {
            nargs,
            nregs: nregs.max(nargs),
            constructable: true,
            ..Default::default()
        }
    }

    /// Set the function name
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Add a constant to the constant pool
    pub fn add_constant(&mut self, c: Constant) -> u16 {
        let idx = self.constants.len() as u16;
        self.constants.push(c);
        idx
    }

    /// Add an inner function, returning its index
    pub fn add_inner(&mut self, f: FunctionTemplate) -> u16 {
        let idx = self.inner.len() as u16;
        self.inner.push(f);
        idx
    }

    /// Emit a single byte
    pub fn emit_u8(&mut self, byte: u8) {
        self.bytecode.push(byte);
    }

    /// Emit a u16 (little-endian)
    pub fn emit_u16(&mut self, value: u16) {
        self.bytecode.extend_from_slice(&value.to_le_bytes());
    }

    /// Get current bytecode offset
    pub fn current_offset(&self) -> u32 {
        self.bytecode.len() as u32
    }

    /// Patch a u16 at a given offset
    pub fn patch_u16(&mut self, offset: u32, value: u16) {
        let bytes = value.to_le_bytes();
        self.bytecode[offset as usize] = bytes[0];
        self.bytecode[offset as usize + 1] = bytes[1];
    }

    /// Add a line number entry
    pub fn add_line_number(&mut self, pc: u32, line: u32) {
        self.line_numbers.push((pc, line));
    }
}

impl Context {
    /// Instantiate a template as a compiled function closed over `env`
    /// (the global environment when `None`) and push it.
    ///
    /// Inner templates are instantiated recursively. Every constructable
    /// function gets a fresh `prototype` object whose `constructor` points
    /// back at the function.
    pub fn push_compiled_function(
        &mut self,
        thr: ObjRef,
        tpl: &FunctionTemplate,
        env: Option<ObjRef>,
    ) -> Result<ObjRef> {
        let env = env.unwrap_or(self.roots.global_env);
        let mut flags = ObjectFlags::EXTENSIBLE;
        if tpl.strict {
            flags |= ObjectFlags::STRICT;
        }
        if tpl.constructable {
            flags |= ObjectFlags::CONSTRUCTABLE;
        }

        let body = CompiledFunction {
            name: tpl.name.clone(),
            bytecode: Rc::from(tpl.bytecode.as_slice()),
            constants: Vec::with_capacity(tpl.constants.len()),
            inner: Vec::with_capacity(tpl.inner.len()),
            nargs: tpl.nargs,
            nregs: tpl.nregs.max(tpl.nargs),
            var_env: Some(env),
            lex_env: Some(env),
            line_numbers: Rc::from(tpl.line_numbers.as_slice()),
        };
        let mut obj = HObject::new(
            ClassId::Function,
            Some(self.roots.function_proto),
            ObjectKind::CompiledFunction(Box::new(body)),
        );
        obj.flags = ObjectFlags::new(flags);
        let func = self.push_new_object(thr, obj)?;

        // The function is rooted on the stack from here on
        for c in &tpl.constants {
            let v = match c {
                Constant::Number(n) => Value::Number(*n),
                Constant::String(s) => Value::String(self.intern(s.as_bytes())?),
            };
            if let Ok(ObjectKind::CompiledFunction(f)) = self.heap.object_mut(func).map(|o| &mut o.kind) {
                // Interned strings arrive owned; numbers need no count
                f.constants.push(v);
            }
        }
        for inner in &tpl.inner {
            let child = self.push_compiled_function(thr, inner, Some(env))?;
            self.incref(Value::Object(child));
            if let Ok(ObjectKind::CompiledFunction(f)) = self.heap.object_mut(func).map(|o| &mut o.kind) {
                f.inner.push(child);
            }
            self.pop(thr)?;
        }

        if tpl.constructable {
            self.push_object(thr)?;
            self.dup(thr, -2)?;
            self.define_prop_str(thr, -2, "constructor", PropFlags::WRITABLE | PropFlags::CONFIGURABLE)?;
            self.define_prop_str(thr, -2, "prototype", PropFlags::WRITABLE)?;
        }
        self.heap.recharge(func.0);
        Ok(func)
    }

    /// Push a native function object
    pub fn push_native_function(
        &mut self,
        thr: ObjRef,
        func: NativeFn,
        nargs: Option<u16>,
        magic: i16,
    ) -> Result<ObjRef> {
        let mut obj = HObject::new(
            ClassId::Function,
            Some(self.roots.function_proto),
            ObjectKind::NativeFunction(NativeFunction { func, nargs, magic }),
        );
        obj.flags = ObjectFlags::new(ObjectFlags::EXTENSIBLE | ObjectFlags::CONSTRUCTABLE);
        self.push_new_object(thr, obj)
    }

    /// Push a lightweight function value
    pub fn push_lightfunc(&mut self, thr: ObjRef, func: NativeFn, nargs: Option<u8>, magic: i16) -> Result<()> {
        self.push(thr, Value::LightFunc(LightFunc { func, nargs, magic }))
    }

    /// `[target this arg1..argN]` -> `[bound]`
    ///
    /// The target is not flattened here; chains of bound functions are
    /// resolved at call time under the bound-chain limit.
    pub fn push_bound_function(&mut self, thr: ObjRef, nargs: usize) -> Result<ObjRef> {
        let top = self.get_top(thr)?;
        let base = top
            .checked_sub(nargs + 2)
            .ok_or_else(Error::invalid_index)?;
        let target = self.get(thr, base as isize)?;
        if !self.is_callable(target) {
            return Err(Error::type_error("bind target is not callable"));
        }
        let this = self.get(thr, base as isize + 1)?;
        let args = (0..nargs)
            .map(|i| self.get(thr, (base + 2 + i) as isize))
            .collect::<Result<Vec<_>>>()?;

        let constructable = match target {
            Value::Object(o) => self.heap.object(o)?.is_constructable(),
            _ => true,
        };
        let mut obj = HObject::new(
            ClassId::Function,
            Some(self.roots.function_proto),
            ObjectKind::BoundFunction(Box::new(BoundFunction { target, this, args })),
        );
        let mut flags = ObjectFlags::EXTENSIBLE;
        if constructable {
            flags |= ObjectFlags::CONSTRUCTABLE;
        }
        obj.flags = ObjectFlags::new(flags);
        let bound = self.push_new_object(thr, obj)?;
        // Drop the inputs, keeping the new function
        self.replace(thr, base as isize)?;
        self.set_top(thr, base + 1)?;
        Ok(bound)
    }

    /// Check whether a value can be called
    pub fn is_callable(&self, v: Value) -> bool {
        match v {
            Value::LightFunc(_) => true,
            Value::Object(o) => self.heap.object(o).is_ok_and(HObject::is_callable),
            _ => false,
        }
    }

    /// Magic value of the running native function
    pub fn get_magic(&self, thr: ObjRef) -> Result<i16> {
        let act = self
            .thread(thr)?
            .callstack
            .last()
            .ok_or_else(|| Error::type_error("no running function"))?;
        match act.func {
            Value::LightFunc(lf) => Ok(lf.magic),
            Value::Object(o) => match &self.heap.object(o)?.kind {
                ObjectKind::NativeFunction(nf) => Ok(nf.magic),
                _ => Ok(0),
            },
            _ => Ok(0),
        }
    }

    fn compiled(&self, func: ObjRef) -> Result<&CompiledFunction> {
        match &self.heap.object(func)?.kind {
            ObjectKind::CompiledFunction(f) => Ok(f),
            _ => Err(Error::type_error("not a compiled function")),
        }
    }

    /// Shared bytecode of a compiled function
    pub fn function_bytecode(&self, func: ObjRef) -> Result<Rc<[u8]>> {
        Ok(Rc::clone(&self.compiled(func)?.bytecode))
    }

    /// Constant `idx` of a compiled function
    pub fn function_constant(&self, func: ObjRef, idx: usize) -> Result<Value> {
        self.compiled(func)?
            .constants
            .get(idx)
            .copied()
            .ok_or_else(|| Error::range("constant index out of range"))
    }

    /// Inner function `idx` of a compiled function
    pub fn function_inner(&self, func: ObjRef, idx: usize) -> Result<ObjRef> {
        self.compiled(func)?
            .inner
            .get(idx)
            .copied()
            .ok_or_else(|| Error::range("inner function index out of range"))
    }

    /// Register count of a compiled function
    pub fn function_nregs(&self, func: ObjRef) -> Result<u16> {
        Ok(self.compiled(func)?.nregs)
    }

    /// Source line of a compiled function at `pc`
    pub fn function_line(&self, func: ObjRef, pc: u32) -> Result<Option<u32>> {
        Ok(self.compiled(func)?.line_number(pc))
    }
}
