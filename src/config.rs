//! Runtime configuration
//!
//! `HeapConfig` collects every tunable limit of a `Context`. Construct it with
//! `HeapConfig::default()` and adjust with the `with_*` builders:
//!
//! ```ignore
//! use tinyrt::{Context, HeapConfig};
//!
//! let cfg = HeapConfig::default()
//!     .with_max_bytes(4 * 1024 * 1024)
//!     .with_callstack_max(256);
//! let ctx = Context::with_config(cfg).unwrap();
//! ```

use std::fmt;

use crate::error::{FatalHandler, default_fatal_handler};

/// Default maximum number of value stack slots per thread
pub const DEFAULT_VALSTACK_MAX: usize = 1_000_000;
/// Default maximum call stack depth per thread
pub const DEFAULT_CALLSTACK_MAX: usize = 10_000;
/// Default maximum catch stack depth per thread
pub const DEFAULT_CATCHSTACK_MAX: usize = 10_000;
/// Default limit for nested host-level calls
pub const DEFAULT_NATIVE_RECURSION_LIMIT: usize = 1_000;
/// Default bound on prototype chain walks
pub const DEFAULT_PROTO_SANITY: usize = 10_000;
/// Default bound on bound-function chain resolution
pub const DEFAULT_BOUND_CHAIN_SANITY: usize = 10_000;

/// Heap and execution limits
#[derive(Clone)]
pub struct HeapConfig {
    pub valstack_max: usize,
    pub callstack_max: usize,
    pub catchstack_max: usize,
    pub native_recursion_limit: usize,
    pub proto_sanity: usize,
    pub bound_chain_sanity: usize,
    /// Upper bound on accounted heap bytes; `usize::MAX` means unlimited
    pub max_bytes: usize,
    /// Voluntary GC trigger: `(kept / 256) * mult + add` allocations
    pub gc_trigger_mult: i64,
    pub gc_trigger_add: i64,
    /// Trigger used when a voluntary GC was requested during a collection
    pub gc_trigger_skip: i64,
    /// Seed mixed into every string hash
    pub hash_seed: u32,
    /// Run mark-and-sweep automatically when the trigger counter expires
    pub voluntary_gc: bool,
    pub fatal_handler: FatalHandler,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            valstack_max: DEFAULT_VALSTACK_MAX,
            callstack_max: DEFAULT_CALLSTACK_MAX,
            catchstack_max: DEFAULT_CATCHSTACK_MAX,
            native_recursion_limit: DEFAULT_NATIVE_RECURSION_LIMIT,
            proto_sanity: DEFAULT_PROTO_SANITY,
            bound_chain_sanity: DEFAULT_BOUND_CHAIN_SANITY,
            max_bytes: usize::MAX,
            gc_trigger_mult: 12_800,
            gc_trigger_add: 1_024,
            gc_trigger_skip: 256,
            hash_seed: 0x5f37_59df,
            voluntary_gc: true,
            fatal_handler: default_fatal_handler,
        }
    }
}

impl HeapConfig {
    pub fn with_valstack_max(mut self, n: usize) -> Self {
        self.valstack_max = n;
        self
    }

    pub fn with_callstack_max(mut self, n: usize) -> Self {
        self.callstack_max = n;
        self
    }

    pub fn with_catchstack_max(mut self, n: usize) -> Self {
        self.catchstack_max = n;
        self
    }

    pub fn with_native_recursion_limit(mut self, n: usize) -> Self {
        self.native_recursion_limit = n;
        self
    }

    pub fn with_proto_sanity(mut self, n: usize) -> Self {
        self.proto_sanity = n;
        self
    }

    pub fn with_bound_chain_sanity(mut self, n: usize) -> Self {
        self.bound_chain_sanity = n;
        self
    }

    pub fn with_max_bytes(mut self, n: usize) -> Self {
        self.max_bytes = n;
        self
    }

    pub fn with_hash_seed(mut self, seed: u32) -> Self {
        self.hash_seed = seed;
        self
    }

    pub fn with_voluntary_gc(mut self, enabled: bool) -> Self {
        self.voluntary_gc = enabled;
        self
    }

    pub fn with_gc_trigger(mut self, mult: i64, add: i64, skip: i64) -> Self {
        self.gc_trigger_mult = mult;
        self.gc_trigger_add = add;
        self.gc_trigger_skip = skip;
        self
    }

    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal_handler = handler;
        self
    }

    /// Trigger counter value after a collection that kept `kept` objects
    pub(crate) fn trigger_after(&self, kept: usize) -> i64 {
        let kept = i64::try_from(kept).unwrap_or(i64::MAX);
        (kept / 256)
            .saturating_mul(self.gc_trigger_mult)
            .saturating_add(self.gc_trigger_add)
    }
}

impl fmt::Debug for HeapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapConfig")
            .field("valstack_max", &self.valstack_max)
            .field("callstack_max", &self.callstack_max)
            .field("catchstack_max", &self.catchstack_max)
            .field("native_recursion_limit", &self.native_recursion_limit)
            .field("proto_sanity", &self.proto_sanity)
            .field("bound_chain_sanity", &self.bound_chain_sanity)
            .field("max_bytes", &self.max_bytes)
            .field("gc_trigger_mult", &self.gc_trigger_mult)
            .field("gc_trigger_add", &self.gc_trigger_add)
            .field("gc_trigger_skip", &self.gc_trigger_skip)
            .field("hash_seed", &format_args!("{:#x}", self.hash_seed))
            .field("voluntary_gc", &self.voluntary_gc)
            .finish_non_exhaustive()
    }
}
