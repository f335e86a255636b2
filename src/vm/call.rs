//! Call handling
//!
//! Native functions run synchronously on the Rust stack. Compiled functions
//! are driven by the installed [`Executor`]: the runtime pushes the
//! activation record and the executor runs bytecode until that activation
//! returns, calling back into [`Context::setup_script_call`] and
//! [`Context::script_return`] for nested script calls so they never consume
//! native stack.
//!
//! Value stack layout of an activation:
//!
//! ```text
//! [ ... func this arg0 .. argN-1 reg .. reg | scratch ... ]
//!        ^         ^
//!        |         idx_bottom (frame index 0)
//!        idx_retval for ordinary calls
//! ```

use std::rc::Rc;

use crate::context::Context;
use crate::error::{CallStatus, Error, Result};
use crate::runtime::function::NativeFn;
use crate::runtime::object::{ClassId, HObject, ObjectKind};
use crate::runtime::property::PropFlags;
use crate::value::{ObjRef, Value};
use crate::vm::thread::{ActFlags, Activation, CatchFlags, Catcher, CatcherKind, ThreadState};

/// How the executor is entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// A fresh activation was pushed on top of the call stack. Run until it
    /// returns through `script_return`.
    Call,
    /// A yielded thread continues at the saved pc of its top activation with
    /// the resume value on top of the value stack. Run until the call stack
    /// is empty.
    Resume,
}

/// How the executor left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The entry activation returned; its value sits at its `idx_retval`
    Return,
    /// The thread yielded the value on top of its stack. With `is_error` the
    /// value is thrown into the resumer instead.
    Yield { is_error: bool },
}

/// Result of `setup_script_call`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSetup {
    /// A new activation was pushed; continue executing at its pc 0
    Script,
    /// The current activation was replaced; continue at its pc 0
    TailCall,
    /// The callee was native and already ran; the result is on top
    Native,
}

/// Bytecode executor driving compiled functions.
///
/// Contract:
/// - keep the activation pc current with `set_pc` before anything that can
///   yield or throw into a catcher
/// - script-to-script calls go through `setup_script_call`, returns through
///   `script_return`
/// - to yield, push the value, call `check_yield`, save the pc and return
///   `Completion::Yield`
/// - on an error, call `handle_catch` with the call stack index of the entry
///   activation (0 for `Entry::Resume`) and continue at the returned pc, or
///   propagate the error when it returns `Err`
pub trait Executor {
    fn execute(&self, ctx: &mut Context, thr: ObjRef, entry: Entry) -> Result<Completion>;
}

/// Executor used until the host installs one
pub(crate) struct NullExecutor;

impl Executor for NullExecutor {
    fn execute(&self, _ctx: &mut Context, _thr: ObjRef, _entry: Entry) -> Result<Completion> {
        Err(Error::type_error("no executor installed"))
    }
}

enum Callee {
    Native { func: NativeFn, nargs: Option<usize> },
    Compiled,
}

impl Context {
    /// Install the bytecode executor
    pub fn set_executor(&mut self, executor: Rc<dyn Executor>) {
        self.executor = executor;
    }

    /// Poll the host interrupt callback. Executors call this at safe points.
    pub fn check_interrupt(&mut self) -> Result<()> {
        if let Some(cb) = self.interrupt.as_mut() {
            if cb() {
                tracing::debug!("execution interrupted");
                return Err(Error::range("execution timeout"));
            }
        }
        Ok(())
    }

    // Current-thread bookkeeping. `curr_thread` and every `thread_stack`
    // entry hold one reference each.

    pub(crate) fn enter_thread(&mut self, thr: ObjRef) {
        self.incref_ref(thr.0);
        let prev = self.curr_thread.replace(thr);
        self.thread_stack.push(prev);
    }

    pub(crate) fn leave_thread(&mut self) {
        let left = self.curr_thread.take();
        self.curr_thread = self.thread_stack.pop().flatten();
        if let Some(t) = left {
            self.decref_ref(t.0);
        }
    }

    /// `[func this arg1..argN]` -> `[retval]`
    pub fn call(&mut self, thr: ObjRef, nargs: usize) -> Result<()> {
        self.call_flags(thr, nargs, 0)
    }

    /// Absolute index of the function slot for `nargs + extra` values on top
    fn call_base(&self, thr: ObjRef, nargs: usize, extra: usize) -> Result<usize> {
        let needed = nargs.checked_add(extra).ok_or_else(Error::invalid_index)?;
        let top = self.abs_top(thr)?;
        match top.checked_sub(needed) {
            Some(base) if base >= self.bottom(thr)? => Ok(base),
            _ => Err(Error::invalid_index()),
        }
    }

    /// Call with activation flags. On error the call and catch stacks are
    /// unwound to their entry levels and the stack is cut back to the
    /// function slot.
    pub(crate) fn call_flags(&mut self, thr: ObjRef, nargs: usize, flags: u8) -> Result<()> {
        let idx_func = self.call_base(thr, nargs, 2)?;
        if self.call_depth >= self.config.native_recursion_limit {
            return Err(Error::range("native recursion limit"));
        }
        let (state, callstack_level, catchstack_level) = {
            let t = self.thread(thr)?;
            (t.state, t.callstack.len(), t.catchstack.len())
        };
        match state {
            ThreadState::Inactive | ThreadState::Running | ThreadState::Resumed => {}
            ThreadState::Yielded | ThreadState::Terminated => {
                return Err(Error::type_error("thread cannot be called in its current state"));
            }
        }
        let bottom = self.bottom(thr)?;
        if state == ThreadState::Inactive {
            self.thread_mut(thr)?.state = ThreadState::Running;
        }
        self.enter_thread(thr);
        self.call_depth += 1;

        let result = self.call_inner(thr, idx_func, flags);

        self.call_depth -= 1;
        if result.is_err() {
            let _ = self.unwind_callstack(thr, callstack_level);
            let _ = self.unwind_catchstack(thr, catchstack_level);
            let _ = self.set_bottom(thr, bottom);
            let _ = self.set_top_abs(thr, idx_func);
        }
        self.leave_thread();
        if state == ThreadState::Inactive {
            if let Ok(t) = self.thread_mut(thr) {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Inactive;
                }
            }
        }
        result
    }

    fn call_inner(&mut self, thr: ObjRef, idx_func: usize, flags: u8) -> Result<()> {
        self.resolve_bound(thr, idx_func, flags)?;
        let func = self.get_abs(thr, idx_func)?;
        match self.callee(func)? {
            Callee::Native { func: f, nargs } => self.run_native(thr, idx_func, f, nargs, flags),
            Callee::Compiled => self.run_compiled(thr, idx_func, flags),
        }
    }

    fn callee(&self, func: Value) -> Result<Callee> {
        match func {
            Value::LightFunc(lf) => Ok(Callee::Native {
                func: lf.func,
                nargs: lf.nargs.map(usize::from),
            }),
            Value::Object(o) => match &self.heap.object(o)?.kind {
                ObjectKind::NativeFunction(nf) => Ok(Callee::Native {
                    func: nf.func,
                    nargs: nf.nargs.map(usize::from),
                }),
                ObjectKind::CompiledFunction(_) => Ok(Callee::Compiled),
                _ => Err(Error::type_error("not callable")),
            },
            _ => Err(Error::type_error("not callable")),
        }
    }

    /// Replace bound functions in the function slot by their targets,
    /// splicing in the bound `this` and arguments.
    fn resolve_bound(&mut self, thr: ObjRef, idx_func: usize, flags: u8) -> Result<()> {
        let mut budget = self.config.bound_chain_sanity;
        loop {
            let Value::Object(o) = self.get_abs(thr, idx_func)? else {
                return Ok(());
            };
            let (target, this, args) = match &self.heap.object(o)?.kind {
                ObjectKind::BoundFunction(b) => (b.target, b.this, b.args.clone()),
                _ => return Ok(()),
            };
            if budget == 0 {
                return Err(Error::range("bound function chain limit"));
            }
            budget -= 1;
            // The bound object stays in the slot until every part is copied
            self.insert_abs(thr, idx_func + 2, &args)?;
            if !ActFlags::new(flags).has(ActFlags::CONSTRUCT) {
                self.set_abs(thr, idx_func + 1, this)?;
            }
            self.set_abs(thr, idx_func, target)?;
        }
    }

    fn push_activation(&mut self, thr: ObjRef, act: Activation) -> Result<()> {
        let t = self.thread_mut(thr)?;
        if t.callstack.len() >= t.callstack_max {
            return Err(Error::range("callstack limit"));
        }
        let cap = t.callstack.capacity();
        t.callstack.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        t.callstack.push(act);
        let grew = t.callstack.capacity() != cap;
        self.incref(act.func);
        for env in [act.var_env, act.lex_env].into_iter().flatten() {
            self.incref_ref(env.0);
        }
        if grew {
            self.heap.recharge(thr.0);
        }
        Ok(())
    }

    fn release_activation(&mut self, act: Activation) {
        self.decref(act.func);
        for env in [act.var_env, act.lex_env].into_iter().flatten() {
            self.decref_ref(env.0);
        }
    }

    fn run_native(
        &mut self,
        thr: ObjRef,
        idx_func: usize,
        func: NativeFn,
        nargs: Option<usize>,
        flags: u8,
    ) -> Result<()> {
        let idx_bottom = idx_func + 2;
        if let Some(n) = nargs {
            let end = idx_bottom.checked_add(n).ok_or_else(|| Error::range("valstack limit"))?;
            self.set_top_abs(thr, end)?;
        }
        let saved_bottom = self.bottom(thr)?;
        let fval = self.get_abs(thr, idx_func)?;
        self.push_activation(
            thr,
            Activation {
                func: fval,
                var_env: None,
                lex_env: None,
                pc: 0,
                flags: ActFlags::new(flags | ActFlags::NATIVE | ActFlags::PREVENT_YIELD),
                idx_bottom,
                idx_retval: idx_func,
            },
        )?;
        self.set_bottom(thr, idx_bottom)?;

        let nrets = func(self, thr)?;
        let retval = if nrets > 0 { self.get(thr, -1)? } else { Value::Undefined };
        self.set_abs(thr, idx_func, retval)?;

        let level = self.callstack_depth(thr)?.saturating_sub(1);
        self.unwind_callstack(thr, level)?;
        self.set_bottom(thr, saved_bottom)?;
        self.set_top_abs(thr, idx_func + 1)
    }

    /// Push the activation for the compiled function at `idx_func`: pad the
    /// arguments out to the register count, coerce `this` for non-strict
    /// code and make the registers the current frame.
    pub(crate) fn enter_compiled(&mut self, thr: ObjRef, idx_func: usize, flags: u8, idx_retval: usize) -> Result<()> {
        let func = self.get_abs(thr, idx_func)?;
        let fobj = func.as_object().ok_or_else(|| Error::type_error("not a compiled function"))?;
        let (nregs, var_env, lex_env, strict) = {
            let o = self.heap.object(fobj)?;
            match &o.kind {
                ObjectKind::CompiledFunction(f) => (usize::from(f.nregs), f.var_env, f.lex_env, o.is_strict()),
                _ => return Err(Error::type_error("not a compiled function")),
            }
        };
        let idx_bottom = idx_func + 2;
        let end = idx_bottom.checked_add(nregs).ok_or_else(|| Error::range("valstack limit"))?;
        self.set_top_abs(thr, end)?;
        if !strict && self.get_abs(thr, idx_func + 1)?.is_nullish() {
            self.set_abs(thr, idx_func + 1, Value::Object(self.roots.global))?;
        }
        let mut act_flags = ActFlags::new(flags);
        if strict {
            act_flags.set(ActFlags::STRICT);
        }
        self.push_activation(
            thr,
            Activation {
                func,
                var_env,
                lex_env,
                pc: 0,
                flags: act_flags,
                idx_bottom,
                idx_retval,
            },
        )?;
        self.set_bottom(thr, idx_bottom)
    }

    fn run_compiled(&mut self, thr: ObjRef, idx_func: usize, flags: u8) -> Result<()> {
        let saved_bottom = self.bottom(thr)?;
        self.enter_compiled(thr, idx_func, flags | ActFlags::PREVENT_YIELD, idx_func)?;
        let depth = self.callstack_depth(thr)?;

        let executor = Rc::clone(&self.executor);
        match executor.execute(self, thr, Entry::Call)? {
            Completion::Return => {}
            Completion::Yield { .. } => return Err(Error::internal("yield across a native call")),
        }
        if self.callstack_depth(thr)? != depth - 1 {
            return Err(Error::internal("executor returned with an unbalanced call stack"));
        }
        self.set_bottom(thr, saved_bottom)?;
        self.set_top_abs(thr, idx_func + 1)
    }

    /// `[func arg1..argN]` -> `[result]`
    ///
    /// A default instance inheriting from `func.prototype` is passed as
    /// `this`; an object returned by the callee replaces it.
    pub fn construct(&mut self, thr: ObjRef, nargs: usize) -> Result<()> {
        let idx_func = self.call_base(thr, nargs, 1)?;
        let func = self.get_abs(thr, idx_func)?;
        let proto_src = self.construct_target(func)?;

        self.get_raw(thr, proto_src, Value::String(self.keys.prototype))?;
        let proto = self.get(thr, -1)?.as_object().unwrap_or(self.roots.object_proto);
        let inst = HObject::new(ClassId::Object, Some(proto), ObjectKind::Plain);
        self.push_new_object(thr, inst)?;
        self.remove(thr, -2)?;

        // [func args inst] -> [inst func inst args]
        let rel = (idx_func - self.bottom(thr)?) as isize;
        self.insert(thr, rel)?;
        self.dup(thr, rel)?;
        self.insert(thr, rel + 2)?;
        if let Err(e) = self.call_flags(thr, nargs, ActFlags::CONSTRUCT) {
            let _ = self.set_top_abs(thr, idx_func);
            return Err(e);
        }
        if self.get(thr, -1)?.is_object() {
            self.remove(thr, -2)
        } else {
            self.pop(thr)
        }
    }

    /// The function whose `prototype` a construct call uses: bound
    /// functions defer to their final target
    fn construct_target(&self, func: Value) -> Result<Value> {
        let mut cur = func;
        let mut budget = self.config.bound_chain_sanity;
        loop {
            let Value::Object(o) = cur else {
                return match cur {
                    Value::LightFunc(_) => Ok(cur),
                    _ => Err(Error::type_error("not a constructor")),
                };
            };
            let obj = self.heap.object(o)?;
            if !obj.is_callable() || !obj.is_constructable() {
                return Err(Error::type_error("not a constructor"));
            }
            match &obj.kind {
                ObjectKind::BoundFunction(b) => {
                    if budget == 0 {
                        return Err(Error::range("bound function chain limit"));
                    }
                    budget -= 1;
                    cur = b.target;
                }
                _ => return Ok(cur),
            }
        }
    }

    /// Entry point for script-to-script calls made by the executor.
    ///
    /// `[func this arg1..argN]` on top of the executor's frame. A compiled
    /// callee gets a fresh activation (or, for an allowed tail call, replaces
    /// the current one) and nothing runs yet. A native callee runs inline and
    /// leaves `[retval]`.
    pub fn setup_script_call(&mut self, thr: ObjRef, nargs: usize, tail: bool) -> Result<CallSetup> {
        let idx_func = self.call_base(thr, nargs, 2)?;
        self.resolve_bound(thr, idx_func, 0)?;
        let func = self.get_abs(thr, idx_func)?;
        match self.callee(func)? {
            Callee::Native { func: f, nargs: fixed } => {
                self.call_depth += 1;
                let r = self.run_native(thr, idx_func, f, fixed, 0);
                self.call_depth -= 1;
                r?;
                Ok(CallSetup::Native)
            }
            Callee::Compiled => {
                let cur = self.activation(thr)?;
                let may_tail = !cur.flags.has(ActFlags::PREVENT_YIELD) && !cur.flags.has(ActFlags::CONSTRUCT);
                if tail && may_tail {
                    self.replace_activation(thr, idx_func, cur)?;
                    Ok(CallSetup::TailCall)
                } else {
                    self.enter_compiled(thr, idx_func, 0, idx_func)?;
                    Ok(CallSetup::Script)
                }
            }
        }
    }

    fn replace_activation(&mut self, thr: ObjRef, idx_func: usize, cur: Activation) -> Result<()> {
        let level = self.callstack_depth(thr)? - 1;
        self.unwind_catchers_of(thr, level)?;

        // Slide [func this args] down over the current activation's slots
        let dst = cur.idx_bottom - 2;
        let top = self.abs_top(thr)?;
        let values = (idx_func..top)
            .map(|i| self.get_abs(thr, i))
            .collect::<Result<Vec<_>>>()?;
        for (i, &v) in values.iter().enumerate() {
            self.set_abs(thr, dst + i, v)?;
        }
        self.set_top_abs(thr, dst + values.len())?;

        self.unwind_callstack(thr, level)?;
        self.enter_compiled(thr, dst, ActFlags::TAILCALLED, cur.idx_retval)
    }

    /// Return from the executor's current activation with the value on top
    /// of its frame (`undefined` for an empty frame).
    pub fn script_return(&mut self, thr: ObjRef) -> Result<()> {
        let act = self.activation(thr)?;
        let level = self.callstack_depth(thr)? - 1;
        let retval = self.get_opt(thr, -1).unwrap_or(Value::Undefined);
        self.set_abs(thr, act.idx_retval, retval)?;
        self.unwind_callstack(thr, level)?;

        let bottom = self
            .thread(thr)?
            .callstack
            .last()
            .map_or(0, |a| a.idx_bottom)
            .min(act.idx_retval);
        self.set_bottom(thr, bottom)?;
        self.set_top_abs(thr, act.idx_retval + 1)
    }

    /// Protected call: `[func this arg1..argN]` -> `[retval | error]`
    pub fn pcall(&mut self, thr: ObjRef, nargs: usize) -> Result<CallStatus> {
        let idx_func = self.call_base(thr, nargs, 2)?;
        let bottom = self.bottom(thr)?;
        match self.call(thr, nargs) {
            Ok(()) => Ok(CallStatus::Success),
            Err(e) => {
                tracing::trace!(error = %e, "pcall caught");
                self.set_bottom(thr, bottom)?;
                self.set_top_abs(thr, idx_func)?;
                self.push_error_value(thr, &e)?;
                Ok(CallStatus::Error)
            }
        }
    }

    /// Run `f` in a fresh frame made of the top `nargs` values.
    ///
    /// `f` returns how many values on top of its frame are results. They
    /// replace the frame, padded with `undefined` or cut to exactly `nrets`.
    /// On error the frame is replaced by the error value, then padded.
    pub fn safe_call<F>(&mut self, thr: ObjRef, nargs: usize, nrets: usize, f: F) -> Result<CallStatus>
    where
        F: FnOnce(&mut Context, ObjRef) -> Result<usize>,
    {
        let base = self.call_base(thr, nargs, 0)?;
        let old_bottom = self.bottom(thr)?;
        let end = base.checked_add(nrets).ok_or_else(|| Error::range("valstack limit"))?;
        if self.call_depth >= self.config.native_recursion_limit {
            return Err(Error::range("native recursion limit"));
        }
        let (callstack_level, catchstack_level) = {
            let t = self.thread(thr)?;
            (t.callstack.len(), t.catchstack.len())
        };

        self.set_bottom(thr, base)?;
        self.call_depth += 1;
        let result = f(self, thr);
        self.call_depth -= 1;

        let status = match result {
            Ok(n) => {
                let top = self.abs_top(thr)?;
                let n = n.min(top.saturating_sub(base));
                let results = (top - n..top)
                    .map(|i| self.get_abs(thr, i))
                    .collect::<Result<Vec<_>>>()?;
                for (i, &v) in results.iter().enumerate() {
                    self.set_abs(thr, base + i, v)?;
                }
                self.set_top_abs(thr, base + n)?;
                CallStatus::Success
            }
            Err(e) => {
                tracing::trace!(error = %e, "safe_call caught");
                self.unwind_callstack(thr, callstack_level)?;
                self.unwind_catchstack(thr, catchstack_level)?;
                self.set_bottom(thr, base)?;
                self.set_top_abs(thr, base)?;
                self.push_error_value(thr, &e)?;
                CallStatus::Error
            }
        };
        self.set_top_abs(thr, end)?;
        self.set_bottom(thr, old_bottom)?;
        Ok(status)
    }

    // Activation access

    /// Number of activations on the call stack of `thr`
    pub fn callstack_depth(&self, thr: ObjRef) -> Result<usize> {
        Ok(self.thread(thr)?.callstack.len())
    }

    /// Copy of the current (topmost) activation
    pub fn activation(&self, thr: ObjRef) -> Result<Activation> {
        self.thread(thr)?
            .callstack
            .last()
            .copied()
            .ok_or_else(|| Error::type_error("no running function"))
    }

    /// Save the executor's pc in the current activation
    pub fn set_pc(&mut self, thr: ObjRef, pc: u32) -> Result<()> {
        let act = self
            .thread_mut(thr)?
            .callstack
            .last_mut()
            .ok_or_else(|| Error::type_error("no running function"))?;
        act.pc = pc;
        Ok(())
    }

    /// Push the `this` binding of the current activation
    pub fn push_this(&mut self, thr: ObjRef) -> Result<()> {
        let this = match self.thread(thr)?.callstack.last() {
            Some(act) => self.get_abs(thr, act.idx_bottom - 1)?,
            None => Value::Undefined,
        };
        self.push(thr, this)
    }

    /// Push the function of the current activation
    pub fn push_current_function(&mut self, thr: ObjRef) -> Result<()> {
        let func = self
            .thread(thr)?
            .callstack
            .last()
            .map_or(Value::Undefined, |a| a.func);
        self.push(thr, func)
    }

    /// Whether the current activation was entered as a constructor
    pub fn is_constructor_call(&self, thr: ObjRef) -> Result<bool> {
        Ok(self
            .thread(thr)?
            .callstack
            .last()
            .is_some_and(|a| a.flags.has(ActFlags::CONSTRUCT)))
    }

    // Catch stack

    /// Push a catcher owned by the current activation
    pub fn push_catcher(&mut self, thr: ObjRef, mut catcher: Catcher) -> Result<()> {
        let t = self.thread_mut(thr)?;
        let Some(index) = t.callstack.len().checked_sub(1) else {
            return Err(Error::type_error("no running function"));
        };
        if t.catchstack.len() >= t.catchstack_max {
            return Err(Error::range("catchstack limit"));
        }
        t.catchstack.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        catcher.callstack_index = index;
        catcher.flags.clear(CatchFlags::LEXENV_ACTIVE);
        t.catchstack.push(catcher);
        if let Some(name) = catcher.varname {
            self.incref_ref(name.0);
        }
        Ok(())
    }

    /// Pop the innermost catcher
    pub fn pop_catcher(&mut self, thr: ObjRef) -> Result<()> {
        let level = self
            .thread(thr)?
            .catchstack
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::type_error("catch stack is empty"))?;
        self.unwind_catchstack(thr, level)
    }

    /// The innermost catcher, if any
    pub fn catcher(&self, thr: ObjRef) -> Result<Option<Catcher>> {
        Ok(self.thread(thr)?.catchstack.last().copied())
    }

    /// Pop catchers until `level` remain
    pub fn unwind_catchstack(&mut self, thr: ObjRef, level: usize) -> Result<()> {
        loop {
            let t = self.thread_mut(thr)?;
            if t.catchstack.len() <= level {
                return Ok(());
            }
            let Some(c) = t.catchstack.pop() else {
                return Ok(());
            };
            self.release_catcher(thr, c)?;
        }
    }

    /// Pop activations until `level` remain, with the catchers they own
    pub fn unwind_callstack(&mut self, thr: ObjRef, level: usize) -> Result<()> {
        self.unwind_catchers_of(thr, level)?;
        loop {
            let t = self.thread_mut(thr)?;
            if t.callstack.len() <= level {
                return Ok(());
            }
            let Some(act) = t.callstack.pop() else {
                return Ok(());
            };
            self.release_activation(act);
        }
    }

    /// Drop the catchers owned by activations at `level` and above
    fn unwind_catchers_of(&mut self, thr: ObjRef, level: usize) -> Result<()> {
        let t = self.thread(thr)?;
        let keep = t
            .catchstack
            .iter()
            .position(|c| c.callstack_index >= level)
            .unwrap_or(t.catchstack.len());
        self.unwind_catchstack(thr, keep)
    }

    fn release_catcher(&mut self, thr: ObjRef, c: Catcher) -> Result<()> {
        if c.flags.has(CatchFlags::LEXENV_ACTIVE) {
            // Drop the catch binding environment, back to its outer record
            let env = self.thread(thr)?.callstack.get(c.callstack_index).and_then(|a| a.lex_env);
            if let Some(env) = env {
                let outer = self.heap.object(env)?.proto;
                self.set_lex_env(thr, c.callstack_index, outer)?;
            }
        }
        if let Some(name) = c.varname {
            self.decref_ref(name.0);
        }
        Ok(())
    }

    fn set_lex_env(&mut self, thr: ObjRef, index: usize, env: Option<ObjRef>) -> Result<()> {
        if let Some(e) = env {
            self.incref_ref(e.0);
        }
        let old = {
            let act = self
                .thread_mut(thr)?
                .callstack
                .get_mut(index)
                .ok_or_else(|| Error::internal("activation index out of range"))?;
            std::mem::replace(&mut act.lex_env, env)
        };
        if let Some(o) = old {
            self.decref_ref(o.0);
        }
        Ok(())
    }

    /// Route an error to the innermost enabled try catcher whose activation
    /// is at call stack index `base` or above.
    ///
    /// Everything above the catcher is unwound, the error value is stored
    /// at the catcher's `idx_base`, and the activation's pc is moved to the
    /// catch entry (`pc_base`) or, when the catch clause is done or absent,
    /// the finally entry (`pc_base + 1`). Returns the new pc, or hands the
    /// error back when nothing catches it.
    pub fn handle_catch(&mut self, thr: ObjRef, err: Error, base: usize) -> Result<u32> {
        let found = self.thread(thr)?.catchstack.iter().rposition(|c| {
            c.kind == CatcherKind::TryCatch
                && c.callstack_index >= base
                && (c.flags.has(CatchFlags::CATCH_ENABLED) || c.flags.has(CatchFlags::FINALLY_ENABLED))
        });
        let Some(ci) = found else {
            return Err(err);
        };
        let c = self.thread(thr)?.catchstack[ci];
        self.unwind_callstack(thr, c.callstack_index + 1)?;
        self.unwind_catchstack(thr, ci + 1)?;

        let act = self.activation(thr)?;
        let nregs = match act.func {
            Value::Object(f) => self.function_nregs(f).map_or(0, usize::from),
            _ => 0,
        };
        self.set_bottom(thr, act.idx_bottom)?;
        self.set_top_abs(thr, act.idx_bottom + nregs)?;

        self.push_error_value(thr, &err)?;
        let caught = self.get(thr, -1)?;
        self.set_abs(thr, c.idx_base, caught)?;

        let catching = c.flags.has(CatchFlags::CATCH_ENABLED);
        if catching && c.flags.has(CatchFlags::CATCH_BINDING) {
            if let Some(name) = c.varname {
                let env = self.push_declarative_env(thr, act.lex_env)?;
                self.push(thr, caught)?;
                self.declare_var(thr, Some(env), name, PropFlags::WRITABLE)?;
                self.set_lex_env(thr, c.callstack_index, Some(env))?;
                self.pop(thr)?;
                self.thread_mut(thr)?.catchstack[ci].flags.set(CatchFlags::LEXENV_ACTIVE);
            }
        }
        self.pop(thr)?;

        let pc = {
            let cat = &mut self.thread_mut(thr)?.catchstack[ci];
            if catching {
                cat.flags.clear(CatchFlags::CATCH_ENABLED);
                cat.pc_base
            } else {
                cat.flags.clear(CatchFlags::FINALLY_ENABLED);
                cat.pc_base + 1
            }
        };
        self.set_pc(thr, pc)?;
        tracing::trace!(pc, callstack_index = c.callstack_index, "error caught");
        Ok(pc)
    }
}
