//! Execution threads
//!
//! A thread owns the three execution stacks: the value stack, the call stack
//! of activation records and the catch stack of try/label records. Threads
//! are heap objects (`ObjectKind::Thread`), so coroutines are collected like
//! anything else.

use crate::config::HeapConfig;
use crate::value::{HeapRef, ObjRef, StrRef, Value};
use crate::vm::stack::ValueStack;

/// Activation flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActFlags(u8);

impl ActFlags {
    pub const STRICT: u8 = 1 << 0;
    /// Activation was reused by a tail call
    pub const TAILCALLED: u8 = 1 << 1;
    /// Called as a constructor
    pub const CONSTRUCT: u8 = 1 << 2;
    /// Entered from native code; yielding through it is not allowed
    pub const PREVENT_YIELD: u8 = 1 << 3;
    pub const NATIVE: u8 = 1 << 4;
    pub const DIRECT_EVAL: u8 = 1 << 5;

    #[inline]
    pub const fn new(bits: u8) -> Self {
        ActFlags(bits)
    }

    #[inline]
    pub const fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    #[inline]
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }
}

/// Call stack record
#[derive(Debug, Clone, Copy)]
pub struct Activation {
    /// Function being run (counted)
    pub func: Value,
    pub var_env: Option<ObjRef>,
    pub lex_env: Option<ObjRef>,
    /// Saved program counter, maintained by the executor
    pub pc: u32,
    pub flags: ActFlags,
    /// Absolute value stack index of the first argument / register
    pub idx_bottom: usize,
    /// Absolute value stack index receiving the return value
    pub idx_retval: usize,
}

impl Activation {
    pub(crate) fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        out.extend(self.func.heap_ref());
        out.extend(self.var_env.map(|o| o.0));
        out.extend(self.lex_env.map(|o| o.0));
    }
}

/// Catcher flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatchFlags(u8);

impl CatchFlags {
    pub const CATCH_ENABLED: u8 = 1 << 0;
    pub const FINALLY_ENABLED: u8 = 1 << 1;
    /// The catch clause binds the error to `varname`
    pub const CATCH_BINDING: u8 = 1 << 2;
    /// A catch binding environment is installed on the owning activation
    pub const LEXENV_ACTIVE: u8 = 1 << 3;

    #[inline]
    pub const fn new(bits: u8) -> Self {
        CatchFlags(bits)
    }

    #[inline]
    pub const fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    #[inline]
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatcherKind {
    TryCatch,
    Label,
}

/// Catch stack record
#[derive(Debug, Clone, Copy)]
pub struct Catcher {
    pub kind: CatcherKind,
    pub flags: CatchFlags,
    /// Call stack index of the owning activation
    pub callstack_index: usize,
    /// Catch entry point; the finally entry point is `pc_base + 1`
    pub pc_base: u32,
    /// Absolute value stack index receiving the caught value
    pub idx_base: usize,
    /// Catch binding name (counted)
    pub varname: Option<StrRef>,
    pub label_id: u32,
}

impl Catcher {
    /// A try record; `callstack_index` is filled in by `push_catcher`
    pub fn try_catch(flags: u8, pc_base: u32, idx_base: usize, varname: Option<StrRef>) -> Self {
        Catcher {
            kind: CatcherKind::TryCatch,
            flags: CatchFlags::new(flags),
            callstack_index: 0,
            pc_base,
            idx_base,
            varname,
            label_id: 0,
        }
    }

    /// A label record for break/continue targets
    pub fn label(label_id: u32, pc_base: u32) -> Self {
        Catcher {
            kind: CatcherKind::Label,
            flags: CatchFlags::default(),
            callstack_index: 0,
            pc_base,
            idx_base: 0,
            varname: None,
            label_id,
        }
    }
}

/// Coroutine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Fresh, or host-driven and at rest
    Inactive,
    Running,
    /// Running, but currently resuming another thread
    Resumed,
    /// Suspended at a yield point
    Yielded,
    Terminated,
}

/// Thread payload
#[derive(Debug)]
pub struct HThread {
    pub(crate) valstack: ValueStack,
    pub(crate) callstack: Vec<Activation>,
    pub(crate) catchstack: Vec<Catcher>,
    /// Thread that resumed this one (counted)
    pub(crate) resumer: Option<ObjRef>,
    pub(crate) state: ThreadState,
    /// Default strictness for code run on this thread
    pub(crate) strict: bool,
    pub(crate) callstack_max: usize,
    pub(crate) catchstack_max: usize,
}

impl HThread {
    pub fn new(cfg: &HeapConfig) -> Self {
        HThread {
            valstack: ValueStack::new(cfg.valstack_max),
            callstack: Vec::new(),
            catchstack: Vec::new(),
            resumer: None,
            state: ThreadState::Inactive,
            strict: false,
            callstack_max: cfg.callstack_max,
            catchstack_max: cfg.catchstack_max,
        }
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    #[inline]
    pub fn valstack(&self) -> &ValueStack {
        &self.valstack
    }

    #[inline]
    pub fn callstack(&self) -> &[Activation] {
        &self.callstack
    }

    #[inline]
    pub fn catchstack(&self) -> &[Catcher] {
        &self.catchstack
    }

    #[inline]
    pub fn resumer(&self) -> Option<ObjRef> {
        self.resumer
    }

    #[inline]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Number of activations that forbid yielding
    pub fn prevent_count(&self) -> usize {
        self.callstack
            .iter()
            .filter(|a| a.flags.has(ActFlags::PREVENT_YIELD))
            .count()
    }

    pub(crate) fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        out.extend(self.valstack.as_slice().iter().filter_map(Value::heap_ref));
        for act in &self.callstack {
            act.heap_refs(out);
        }
        out.extend(self.catchstack.iter().filter_map(|c| c.varname.map(|s| s.0)));
        out.extend(self.resumer.map(|o| o.0));
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.valstack.capacity() * std::mem::size_of::<Value>()
            + self.callstack.capacity() * std::mem::size_of::<Activation>()
            + self.catchstack.capacity() * std::mem::size_of::<Catcher>()
    }
}
