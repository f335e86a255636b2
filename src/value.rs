//! Tagged value representation
//!
//! `Value` is the runtime's universal value type. Primitive values are stored
//! inline; heap-allocated values (strings, objects, buffers) are referred to
//! by generation-checked handles into the heap arena.
//!
//! Values are `Copy`. Copying a `Value` in Rust code does not touch reference
//! counts: only stores into counted slots (value stacks, property slots,
//! object internals) are counted, and those go through the `Context`.

use std::fmt;

use crate::runtime::function::NativeFn;

/// Handle to a slot in the heap arena.
///
/// A handle is only valid while the slot is occupied and its generation
/// matches; freeing a slot bumps the generation so stale handles stop
/// resolving instead of aliasing a newer allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapRef {
    index: u32,
    generation: u32,
}

impl HeapRef {
    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        HeapRef { index, generation }
    }

    /// Slot index within the arena
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at the time the handle was created
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) HeapRef);

        impl $name {
            /// The untyped arena handle
            #[inline]
            pub const fn heap_ref(self) -> HeapRef {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }
    };
}

typed_handle!(
    /// Handle to an interned string
    StrRef
);
typed_handle!(
    /// Handle to an object (plain, array, function, thread, ...)
    ObjRef
);
typed_handle!(
    /// Handle to a byte buffer
    BufRef
);

/// A lightweight function: a native function pointer stored inline in a
/// value, with no heap object and no own properties.
#[derive(Clone, Copy)]
pub struct LightFunc {
    pub func: NativeFn,
    /// Declared argument count, `None` for varargs
    pub nargs: Option<u8>,
    /// Free-form value passed through to the native function
    pub magic: i16,
}

impl PartialEq for LightFunc {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::fn_addr_eq(self.func, other.func)
            && self.nargs == other.nargs
            && self.magic == other.magic
    }
}

impl fmt::Debug for LightFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LightFunc")
            .field("func", &(self.func as *const ()))
            .field("nargs", &self.nargs)
            .field("magic", &self.magic)
            .finish()
    }
}

/// Type tags, one per `Value` variant
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Undefined = 0,
    Null = 1,
    Bool = 2,
    Number = 3,
    String = 4,
    Object = 5,
    Buffer = 6,
    Pointer = 7,
    LightFunc = 8,
}

/// A runtime value
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    /// IEEE-754 double; signed zero and NaN are preserved
    Number(f64),
    String(StrRef),
    Object(ObjRef),
    Buffer(BufRef),
    /// Opaque host pointer, never dereferenced by the runtime
    Pointer(*mut ()),
    LightFunc(LightFunc),
}

impl Value {
    /// Create a number value
    #[inline]
    pub const fn number(n: f64) -> Self {
        Value::Number(n)
    }

    /// Create a boolean value
    #[inline]
    pub const fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    /// Get the type tag
    pub const fn type_tag(&self) -> TypeTag {
        match self {
            Value::Undefined => TypeTag::Undefined,
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Number(_) => TypeTag::Number,
            Value::String(_) => TypeTag::String,
            Value::Object(_) => TypeTag::Object,
            Value::Buffer(_) => TypeTag::Buffer,
            Value::Pointer(_) => TypeTag::Pointer,
            Value::LightFunc(_) => TypeTag::LightFunc,
        }
    }

    #[inline]
    pub const fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if value is null or undefined
    #[inline]
    pub const fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    #[inline]
    pub const fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    #[inline]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_object(&self) -> Option<ObjRef> {
        match self {
            Value::Object(o) => Some(*o),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_string(&self) -> Option<StrRef> {
        match self {
            Value::String(s) => Some(*s),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_buffer(&self) -> Option<BufRef> {
        match self {
            Value::Buffer(b) => Some(*b),
            _ => None,
        }
    }

    /// Arena handle for heap-allocated values
    #[inline]
    pub const fn heap_ref(&self) -> Option<HeapRef> {
        match self {
            Value::String(s) => Some(s.0),
            Value::Object(o) => Some(o.0),
            Value::Buffer(b) => Some(b.0),
            _ => None,
        }
    }

    /// Check if the value refers to a heap allocation (and is refcounted)
    #[inline]
    pub const fn is_heap_allocated(&self) -> bool {
        self.heap_ref().is_some()
    }

    /// `SameValue` comparison.
    ///
    /// Strings are interned, so handle identity is content identity.
    /// NaN equals NaN, and +0 and -0 are distinct.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => {
                if a.is_nan() && b.is_nan() {
                    return true;
                }
                a.to_bits() == b.to_bits()
            }
            _ => self == other,
        }
    }

    /// Array index of a number value: a whole number in `0..2^32-1`
    pub fn as_array_index(&self) -> Option<u32> {
        let n = self.as_number()?;
        if n >= 0.0 && n < u32::MAX as f64 && n.fract() == 0.0 {
            Some(n as u32)
        } else {
            None
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<StrRef> for Value {
    fn from(s: StrRef) -> Self {
        Value::String(s)
    }
}

impl From<ObjRef> for Value {
    fn from(o: ObjRef) -> Self {
        Value::Object(o)
    }
}

impl From<BufRef> for Value {
    fn from(b: BufRef) -> Self {
        Value::Buffer(b)
    }
}

impl From<LightFunc> for Value {
    fn from(f: LightFunc) -> Self {
        Value::LightFunc(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use crate::error::Result;

    fn native_a(_ctx: &mut Context, _thr: ObjRef) -> Result<usize> {
        Ok(0)
    }

    fn native_b(_ctx: &mut Context, _thr: ObjRef) -> Result<usize> {
        Ok(1)
    }

    #[test]
    fn test_type_tags() {
        assert_eq!(Value::Undefined.type_tag(), TypeTag::Undefined);
        assert_eq!(Value::Null.type_tag(), TypeTag::Null);
        assert_eq!(Value::bool(true).type_tag(), TypeTag::Bool);
        assert_eq!(Value::number(1.5).type_tag(), TypeTag::Number);
        let s = StrRef(HeapRef::new(3, 0));
        assert_eq!(Value::String(s).type_tag(), TypeTag::String);
        assert_eq!(Value::Pointer(std::ptr::null_mut()).type_tag(), TypeTag::Pointer);
    }

    #[test]
    fn test_default_is_undefined() {
        assert!(Value::default().is_undefined());
        assert!(Value::Null.is_nullish());
        assert!(!Value::bool(false).is_nullish());
    }

    #[test]
    fn test_same_value_numbers() {
        assert!(Value::number(f64::NAN).same_value(&Value::number(f64::NAN)));
        assert!(!Value::number(0.0).same_value(&Value::number(-0.0)));
        assert!(Value::number(-0.0).same_value(&Value::number(-0.0)));
        // Plain equality keeps IEEE semantics
        assert_ne!(Value::number(f64::NAN), Value::number(f64::NAN));
        assert_eq!(Value::number(0.0), Value::number(-0.0));
    }

    #[test]
    fn test_heap_ref() {
        let o = ObjRef(HeapRef::new(7, 2));
        let v = Value::from(o);
        assert_eq!(v.heap_ref(), Some(HeapRef::new(7, 2)));
        assert!(v.is_heap_allocated());
        assert_eq!(v.as_object(), Some(o));
        assert!(Value::number(1.0).heap_ref().is_none());
    }

    #[test]
    fn test_handles_distinguish_generation() {
        let a = ObjRef(HeapRef::new(1, 0));
        let b = ObjRef(HeapRef::new(1, 1));
        assert_ne!(a, b);
        assert_eq!(format!("{:?}", a), "ObjRef(#1@0)");
    }

    #[test]
    fn test_array_index() {
        assert_eq!(Value::number(0.0).as_array_index(), Some(0));
        assert_eq!(Value::number(42.0).as_array_index(), Some(42));
        assert_eq!(Value::number(1.5).as_array_index(), None);
        assert_eq!(Value::number(-1.0).as_array_index(), None);
        assert_eq!(Value::number(4294967295.0).as_array_index(), None);
        assert_eq!(Value::number(f64::NAN).as_array_index(), None);
    }

    #[test]
    fn test_lightfunc_eq() {
        let a = LightFunc { func: native_a, nargs: Some(1), magic: 0 };
        let a2 = LightFunc { func: native_a, nargs: Some(1), magic: 0 };
        let b = LightFunc { func: native_b, nargs: Some(1), magic: 0 };
        assert_eq!(Value::from(a), Value::from(a2));
        assert_ne!(Value::from(a), Value::from(b));
        assert_ne!(a, LightFunc { magic: 3, ..a });
    }
}
