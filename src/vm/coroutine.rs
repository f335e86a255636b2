//! Coroutines
//!
//! A thread object runs as a coroutine: `resume` hands it a value and
//! drives the executor on its stacks until it yields, returns or throws.
//! Yielding leaves the thread's stacks untouched, so the executor picks up
//! exactly where it left off on the next resume.
//!
//! ```text
//! Inactive --resume--> Running --yield--> Yielded --resume--> Running
//!                         |                                     |
//!                         +------ return / uncaught error ------+--> Terminated
//! ```
//!
//! While a thread drives another it is `Resumed`.

use std::rc::Rc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::runtime::object::ObjectKind;
use crate::value::{ObjRef, Value};
use crate::vm::call::{Completion, Entry};
use crate::vm::thread::ThreadState;

/// How a resumed thread gave control back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The thread yielded; its value is on the caller's stack
    Yielded,
    /// The thread's function returned; its value is on the caller's stack
    Returned,
}

/// Current-thread bookkeeping detached by `Context::suspend`.
///
/// The detached threads stay rooted until the state is handed back to
/// `Context::resume_state`.
#[derive(Debug)]
#[must_use = "a suspended state must be restored with resume_state"]
pub struct SuspendedState {
    threads: Vec<Option<ObjRef>>,
    call_depth: usize,
}

impl Context {
    /// State of a thread object
    pub fn thread_state(&self, thr: ObjRef) -> Result<ThreadState> {
        Ok(self.thread(thr)?.state)
    }

    /// Resume `target` with the value popped from `caller`'s stack.
    ///
    /// A fresh thread must hold exactly its initial compiled function; it is
    /// called with the value as its only argument. A yielded thread gets the
    /// value at its yield point, or with `is_error` has it thrown there. The
    /// yielded or returned value is pushed on `caller`. An error escaping
    /// `target` terminates it and propagates to the caller.
    pub fn resume(&mut self, caller: ObjRef, target: ObjRef, is_error: bool) -> Result<ResumeOutcome> {
        let span = tracing::debug_span!("resume", caller = ?caller.0, target = ?target.0, is_error);
        let _enter = span.enter();

        if caller == target {
            return Err(Error::type_error("a thread cannot resume itself"));
        }
        let caller_state = self.thread(caller)?.state;
        if !matches!(caller_state, ThreadState::Inactive | ThreadState::Running) {
            return Err(Error::type_error("resuming thread is not running"));
        }
        if self.call_depth >= self.config.native_recursion_limit {
            return Err(Error::range("native recursion limit"));
        }
        let target_state = self.thread(target)?.state;
        let entry = match target_state {
            ThreadState::Inactive => {
                if is_error {
                    return Err(Error::type_error("cannot throw into a thread that has not started"));
                }
                self.check_fresh(target)?;
                Entry::Call
            }
            ThreadState::Yielded => Entry::Resume,
            _ => return Err(Error::type_error("thread is not resumable")),
        };

        let value = self.take_top(caller)?;
        {
            let t = self.thread_mut(target)?;
            t.resumer = Some(caller);
            t.state = ThreadState::Running;
        }
        self.incref_ref(caller.0);
        self.thread_mut(caller)?.state = ThreadState::Resumed;
        self.enter_thread(target);
        self.call_depth += 1;
        tracing::debug!(state = ?target_state, "thread resumed");

        let result = self.drive(target, entry, value, is_error);

        self.call_depth -= 1;
        self.leave_thread();
        if let Ok(t) = self.thread_mut(caller) {
            t.state = caller_state;
        }
        self.clear_resumer(target)?;

        match result {
            Ok(Completion::Return) => {
                let v = self.take_top(target)?;
                self.finish_thread(target)?;
                tracing::debug!("thread returned");
                self.push_owned(caller, v)?;
                Ok(ResumeOutcome::Returned)
            }
            Ok(Completion::Yield { is_error }) => {
                let v = self.take_top(target)?;
                self.thread_mut(target)?.state = ThreadState::Yielded;
                tracing::debug!(is_error, "thread yielded");
                if is_error {
                    let old = std::mem::replace(&mut self.thrown, v);
                    self.decref(old);
                    return Err(Error::Thrown);
                }
                self.push_owned(caller, v)?;
                Ok(ResumeOutcome::Yielded)
            }
            Err(e) => {
                tracing::debug!(error = %e, "thread terminated by uncaught error");
                self.finish_thread(target)?;
                Err(e)
            }
        }
    }

    /// Hand the resume value to the target and run it
    fn drive(&mut self, target: ObjRef, entry: Entry, value: Value, is_error: bool) -> Result<Completion> {
        match entry {
            Entry::Call => {
                // [func] -> [func this value], then call with one argument
                self.push(target, Value::Undefined)?;
                self.push_owned(target, value)?;
                self.enter_compiled(target, 0, 0, 0)?;
            }
            Entry::Resume if is_error => {
                let old = std::mem::replace(&mut self.thrown, value);
                self.decref(old);
                self.handle_catch(target, Error::Thrown, 0)?;
            }
            Entry::Resume => self.push_owned(target, value)?,
        }
        let executor = Rc::clone(&self.executor);
        executor.execute(self, target, entry)
    }

    fn check_fresh(&self, target: ObjRef) -> Result<()> {
        let t = self.thread(target)?;
        let vs = t.valstack();
        let fresh = t.callstack.is_empty() && vs.bottom() == 0 && vs.len() == 1;
        let is_compiled = match vs.get(0) {
            Some(Value::Object(f)) => matches!(self.heap.object(f)?.kind, ObjectKind::CompiledFunction(_)),
            _ => false,
        };
        if !fresh || !is_compiled {
            return Err(Error::type_error("a new thread must hold only its initial compiled function"));
        }
        Ok(())
    }

    fn clear_resumer(&mut self, target: ObjRef) -> Result<()> {
        if let Some(r) = self.thread_mut(target)?.resumer.take() {
            self.decref_ref(r.0);
        }
        Ok(())
    }

    fn finish_thread(&mut self, target: ObjRef) -> Result<()> {
        self.reset_thread(target)?;
        self.thread_mut(target)?.state = ThreadState::Terminated;
        Ok(())
    }

    /// Yield check for the executor: the thread must be running under a
    /// resumer with no native call between the yield and the resume.
    pub fn check_yield(&self, thr: ObjRef) -> Result<()> {
        let t = self.thread(thr)?;
        if t.state != ThreadState::Running || self.curr_thread != Some(thr) {
            return Err(Error::type_error("yield from a thread that is not running"));
        }
        if t.resumer.is_none() {
            return Err(Error::type_error("yield without a resumer"));
        }
        if t.prevent_count() > 0 {
            return Err(Error::type_error("yield across a native call"));
        }
        Ok(())
    }

    /// Terminate a thread that is not running. Its stacks are unwound and
    /// it can no longer be resumed or called.
    pub fn terminate(&mut self, target: ObjRef) -> Result<()> {
        match self.thread(target)?.state {
            ThreadState::Running | ThreadState::Resumed => {
                Err(Error::type_error("cannot terminate a running thread"))
            }
            _ => {
                self.clear_resumer(target)?;
                self.finish_thread(target)
            }
        }
    }

    /// Unwind all three stacks of a thread, releasing what they hold
    pub(crate) fn reset_thread(&mut self, thr: ObjRef) -> Result<()> {
        self.unwind_callstack(thr, 0)?;
        self.unwind_catchstack(thr, 0)?;
        self.set_bottom(thr, 0)?;
        self.set_top_abs(thr, 0)?;
        self.clear_resumer(thr)
    }

    /// Detach the current-thread bookkeeping, e.g. before the host blocks
    /// outside the runtime. No script may run on this context until the
    /// state is restored.
    pub fn suspend(&mut self) -> SuspendedState {
        let mut threads = std::mem::take(&mut self.thread_stack);
        threads.push(self.curr_thread.take());
        // The references move with the handles; `detached` keeps them rooted
        self.detached.extend(threads.iter().flatten());
        let call_depth = std::mem::replace(&mut self.call_depth, 0);
        tracing::debug!(threads = threads.len(), call_depth, "suspended");
        SuspendedState { threads, call_depth }
    }

    /// Restore bookkeeping detached by `suspend`
    pub fn resume_state(&mut self, state: SuspendedState) -> Result<()> {
        if self.curr_thread.is_some() || !self.thread_stack.is_empty() {
            return Err(Error::type_error("a thread is already active"));
        }
        let SuspendedState { mut threads, call_depth } = state;
        for t in threads.iter().flatten() {
            if let Some(pos) = self.detached.iter().rposition(|d| d == t) {
                self.detached.swap_remove(pos);
            }
        }
        self.curr_thread = threads.pop().flatten();
        self.thread_stack = threads;
        self.call_depth = call_depth;
        tracing::debug!(call_depth, "resumed suspended state");
        Ok(())
    }
}
