//! Runtime support
//!
//! The heap object model and everything layered on it:
//! - strings and the intern table
//! - property storage and the property access surface
//! - arrays, buffers, functions, environments, proxies and enumerators
//! - error objects and the thrown-value slot

pub mod array;
pub mod buffer;
pub mod enumerator;
pub mod env;
pub mod errors;
pub mod function;
pub mod object;
pub mod property;
pub mod props;
pub mod proxy;
pub mod string;

pub use array::MAX_ARRAY_LENGTH;
pub use buffer::HBuffer;
pub use enumerator::EnumFlags;
pub use env::EnvRecord;
pub use function::{Constant, FunctionTemplate, NativeFn, MAX_ARGS};
pub use object::{ClassId, HObject, ObjectKind};
pub use property::{PropFlags, PropSlot};
pub use proxy::ProxyData;
pub use string::{HString, StringTable};
