//! Object representation
//!
//! Every object is an `HObject`: a class id, object flags, a counted
//! prototype link, property storage and a kind-specific payload
//! (`ObjectKind`). Arrays, functions, environments, threads, proxies and
//! enumerators are all objects distinguished by their kind.

use crate::runtime::enumerator::EnumState;
use crate::runtime::env::EnvRecord;
use crate::runtime::function::{BoundFunction, CompiledFunction, NativeFunction};
use crate::runtime::property::PropertyStorage;
use crate::runtime::proxy::ProxyData;
use crate::value::{HeapRef, ObjRef};
use crate::vm::thread::HThread;

/// Object class ids
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassId {
    /// Plain object
    Object = 0,
    /// Array with virtual `length`
    Array = 1,
    /// Compiled, native or bound function
    Function = 2,
    /// Error instance
    Error = 3,
    /// Coroutine thread
    Thread = 4,
    /// Declarative environment record
    DeclarativeEnv = 5,
    /// Object environment record
    ObjectEnv = 6,
    /// Proxy
    Proxy = 7,
    /// Property enumerator
    Enumerator = 8,
}

impl ClassId {
    /// Check if this is a function class
    #[inline]
    pub fn is_function(self) -> bool {
        self == ClassId::Function
    }

    /// Check if this is an environment record class
    #[inline]
    pub fn is_env(self) -> bool {
        matches!(self, ClassId::DeclarativeEnv | ClassId::ObjectEnv)
    }

    pub fn name(self) -> &'static str {
        match self {
            ClassId::Object => "Object",
            ClassId::Array => "Array",
            ClassId::Function => "Function",
            ClassId::Error => "Error",
            ClassId::Thread => "Thread",
            ClassId::DeclarativeEnv => "DeclarativeEnv",
            ClassId::ObjectEnv => "ObjectEnv",
            ClassId::Proxy => "Proxy",
            ClassId::Enumerator => "Enumerator",
        }
    }
}

/// Object flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectFlags(u8);

impl ObjectFlags {
    pub const EXTENSIBLE: u8 = 1 << 0;
    pub const CONSTRUCTABLE: u8 = 1 << 1;
    pub const STRICT: u8 = 1 << 2;
    pub const SPECIAL_ARRAY: u8 = 1 << 3;

    #[inline]
    pub const fn new(bits: u8) -> Self {
        ObjectFlags(bits)
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

/// Array bookkeeping: the virtual `length` property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayData {
    pub length: u32,
    pub length_writable: bool,
}

impl Default for ArrayData {
    fn default() -> Self {
        ArrayData {
            length: 0,
            length_writable: true,
        }
    }
}

/// Kind-specific payload
#[derive(Debug)]
pub enum ObjectKind {
    Plain,
    Array(ArrayData),
    CompiledFunction(Box<CompiledFunction>),
    NativeFunction(NativeFunction),
    BoundFunction(Box<BoundFunction>),
    Environment(EnvRecord),
    Thread(Box<HThread>),
    Proxy(ProxyData),
    Enumerator(Box<EnumState>),
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Plain => "plain",
            ObjectKind::Array(_) => "array",
            ObjectKind::CompiledFunction(_) => "compiled function",
            ObjectKind::NativeFunction(_) => "native function",
            ObjectKind::BoundFunction(_) => "bound function",
            ObjectKind::Environment(_) => "environment",
            ObjectKind::Thread(_) => "thread",
            ObjectKind::Proxy(_) => "proxy",
            ObjectKind::Enumerator(_) => "enumerator",
        }
    }

    /// Push every counted handle held by the payload
    fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        match self {
            ObjectKind::Plain | ObjectKind::Array(_) | ObjectKind::NativeFunction(_) => {}
            ObjectKind::CompiledFunction(f) => f.heap_refs(out),
            ObjectKind::BoundFunction(b) => b.heap_refs(out),
            ObjectKind::Environment(e) => e.heap_refs(out),
            ObjectKind::Thread(t) => t.heap_refs(out),
            ObjectKind::Proxy(p) => p.heap_refs(out),
            ObjectKind::Enumerator(e) => e.heap_refs(out),
        }
    }

    fn byte_size(&self) -> usize {
        match self {
            ObjectKind::CompiledFunction(f) => f.byte_size(),
            ObjectKind::BoundFunction(b) => b.args.len() * std::mem::size_of::<crate::Value>(),
            ObjectKind::Thread(t) => t.byte_size(),
            ObjectKind::Enumerator(e) => e.keys.len() * std::mem::size_of::<crate::Value>(),
            _ => 0,
        }
    }
}

/// Heap object
#[derive(Debug)]
pub struct HObject {
    pub class: ClassId,
    pub flags: ObjectFlags,
    /// Counted prototype link
    pub proto: Option<ObjRef>,
    pub props: PropertyStorage,
    pub kind: ObjectKind,
}

impl HObject {
    /// Create an extensible object. Arrays get an array part.
    pub fn new(class: ClassId, proto: Option<ObjRef>, kind: ObjectKind) -> Self {
        let mut flags = ObjectFlags::new(ObjectFlags::EXTENSIBLE);
        let props = if let ObjectKind::Array(_) = kind {
            flags.set(ObjectFlags::SPECIAL_ARRAY);
            PropertyStorage::with_array_part()
        } else {
            PropertyStorage::new()
        };
        HObject {
            class,
            flags,
            proto,
            props,
            kind,
        }
    }

    #[inline]
    pub fn is_extensible(&self) -> bool {
        self.flags.has(ObjectFlags::EXTENSIBLE)
    }

    #[inline]
    pub fn is_constructable(&self) -> bool {
        self.flags.has(ObjectFlags::CONSTRUCTABLE)
    }

    #[inline]
    pub fn is_strict(&self) -> bool {
        self.flags.has(ObjectFlags::STRICT)
    }

    /// Check for callable kinds
    pub fn is_callable(&self) -> bool {
        matches!(
            self.kind,
            ObjectKind::CompiledFunction(_) | ObjectKind::NativeFunction(_) | ObjectKind::BoundFunction(_)
        )
    }

    pub fn array_data(&self) -> Option<&ArrayData> {
        match &self.kind {
            ObjectKind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn array_data_mut(&mut self) -> Option<&mut ArrayData> {
        match &mut self.kind {
            ObjectKind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn thread(&self) -> Option<&HThread> {
        match &self.kind {
            ObjectKind::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn thread_mut(&mut self) -> Option<&mut HThread> {
        match &mut self.kind {
            ObjectKind::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn proxy(&self) -> Option<&ProxyData> {
        match &self.kind {
            ObjectKind::Proxy(p) => Some(p),
            _ => None,
        }
    }

    /// Every counted handle this object holds: prototype, property keys and
    /// values, and payload internals
    pub fn heap_refs(&self, out: &mut Vec<HeapRef>) {
        out.extend(self.proto.map(|p| p.0));
        self.props.heap_refs(out);
        self.kind.heap_refs(out);
    }

    /// Approximate payload bytes
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<HObject>() + self.props.byte_size() + self.kind.byte_size()
    }
}
