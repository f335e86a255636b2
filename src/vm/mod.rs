//! Execution machinery
//!
//! Threads with their value, call and catch stacks, the call protocol
//! between native code and the bytecode executor, and coroutines.

pub mod call;
pub mod coroutine;
pub mod stack;
pub mod thread;

pub use call::{CallSetup, Completion, Entry, Executor};
pub use coroutine::{ResumeOutcome, SuspendedState};
pub use stack::ValueStack;
pub use thread::{ActFlags, Activation, CatchFlags, Catcher, CatcherKind, HThread, ThreadState};
