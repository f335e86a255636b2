//! tinyrt - heap and execution runtime for a small embeddable scripting engine
//!
//! tinyrt provides the memory and execution substrate a bytecode engine runs
//! on. The compiler and the bytecode executor live outside; the executor
//! plugs in through the [`Executor`] trait.
//!
//! # Features
//! - Tagged values over an arena heap with generation-checked handles
//! - Reference counting with a mark-and-sweep backup for cycles
//! - Finalizers with rescue, weak references and a host stash
//! - Interned strings in an open-addressing table
//! - Objects with an array part, accessors and prototype chains
//! - Threads with value, call and catch stacks; cooperative coroutines
//!
//! # Example
//! ```ignore
//! use tinyrt::{Context, Value};
//!
//! let mut ctx = Context::new()?;
//! let thr = ctx.heap_thread();
//! ctx.push_object(thr)?;
//! ctx.push(thr, Value::number(1.0))?;
//! ctx.put_prop_str(thr, -2, "x", true)?;
//! ctx.get_prop_str(thr, -1, "x")?;
//! assert_eq!(ctx.get(thr, -1)?, Value::number(1.0));
//! ```

// Core modules
pub mod config;
pub mod context;
pub mod error;
pub mod value;

// Memory management
pub mod gc;

// Object model and property access
pub mod runtime;

// Threads, calls and coroutines
pub mod vm;

// Utilities
pub mod util;

// Re-export main types
pub use config::HeapConfig;
pub use context::Context;
pub use error::{CallStatus, Error, FatalHandler, Result};
pub use gc::{GcFlags, GcStats, HeapStats, WeakId};
pub use runtime::{Constant, EnumFlags, FunctionTemplate, NativeFn, PropFlags};
pub use value::{BufRef, HeapRef, LightFunc, ObjRef, StrRef, Value};
pub use vm::{
    ActFlags, Activation, CallSetup, CatchFlags, Catcher, Completion, Entry, Executor, ResumeOutcome,
    SuspendedState, ThreadState,
};
