//! Byte buffers
//!
//! Fixed buffers have their size set at creation; dynamic buffers can be
//! resized later. Both expose virtual `length` and index properties.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::gc::HeapBody;
use crate::value::{BufRef, Value};

/// Buffer payload
#[derive(Debug, Clone, Default)]
pub struct HBuffer {
    data: Vec<u8>,
    dynamic: bool,
}

impl HBuffer {
    /// Zero-filled buffer of fixed size
    pub fn fixed(size: usize) -> Self {
        HBuffer {
            data: vec![0; size],
            dynamic: false,
        }
    }

    /// Zero-filled resizable buffer
    pub fn dynamic(size: usize) -> Self {
        HBuffer {
            data: vec![0; size],
            dynamic: true,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Byte at `idx`
    #[inline]
    pub fn get(&self, idx: usize) -> Option<u8> {
        self.data.get(idx).copied()
    }

    /// Store a byte; out-of-range writes are ignored
    pub fn set(&mut self, idx: usize, byte: u8) -> bool {
        match self.data.get_mut(idx) {
            Some(b) => {
                *b = byte;
                true
            }
            None => false,
        }
    }

    fn resize(&mut self, size: usize) -> Result<()> {
        if !self.dynamic {
            return Err(Error::type_error("buffer is not dynamic"));
        }
        if size > self.data.len() {
            self.data
                .try_reserve_exact(size - self.data.len())
                .map_err(|_| Error::OutOfMemory)?;
        }
        self.data.resize(size, 0);
        Ok(())
    }
}

/// Byte stored by an index write: the number is truncated to an integer and
/// wrapped to 8 bits
pub(crate) fn coerce_byte(v: Value) -> u8 {
    match v {
        Value::Number(n) if n.is_finite() => (n as i64) as u8,
        Value::Bool(true) => 1,
        _ => 0,
    }
}

impl Context {
    /// Push a new zero-filled buffer
    pub fn push_buffer(&mut self, thr: crate::value::ObjRef, size: usize, dynamic: bool) -> Result<BufRef> {
        self.require_stack(thr, 1)?;
        let body = if dynamic {
            HBuffer::dynamic(size)
        } else {
            HBuffer::fixed(size)
        };
        let b = BufRef(self.alloc(HeapBody::Buffer(body))?);
        self.push(thr, Value::Buffer(b))?;
        Ok(b)
    }

    /// Resize the dynamic buffer at `idx`
    pub fn resize_buffer(&mut self, thr: crate::value::ObjRef, idx: isize, size: usize) -> Result<()> {
        let b = self
            .get(thr, idx)?
            .as_buffer()
            .ok_or_else(|| Error::type_error("not a buffer"))?;
        let grow = size.saturating_sub(self.heap.buffer(b)?.len());
        if !self.heap.can_alloc(grow) {
            self.collect(crate::gc::GcFlags::EMERGENCY);
            if !self.heap.can_alloc(grow) {
                return Err(Error::OutOfMemory);
            }
        }
        self.heap.buffer_mut(b)?.resize(size)?;
        self.heap.recharge(b.0);
        Ok(())
    }

    /// Contents of a buffer
    pub fn buffer_data(&self, b: BufRef) -> Result<&[u8]> {
        Ok(self.heap.buffer(b)?.as_bytes())
    }

    /// Mutable contents of a buffer
    pub fn buffer_data_mut(&mut self, b: BufRef) -> Result<&mut [u8]> {
        Ok(self.heap.buffer_mut(b)?.as_bytes_mut())
    }
}
