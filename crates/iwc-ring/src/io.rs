//! Copy endpoints for ring operations.
//!
//! A ring copy is always between the shared window and one of three kinds
//! of caller memory: kernel memory (cannot fault), memory owned by a user
//! address space (copies may fault part-way), or nothing at all, which only
//! advances the cursor.

use crate::error::RingError;
use crate::region::SharedRegion;

/// A buffer owned by a user address space.
///
/// Only the first `mapped` bytes are backed; touching anything past that
/// faults, which is how a partially unmapped user buffer presents itself to
/// the copy routines.
#[derive(Clone, Copy)]
pub struct UserSlice<'a> {
    bytes: &'a [u8],
    mapped: usize,
}

impl<'a> UserSlice<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            mapped: bytes.len(),
        }
    }

    pub fn partially_mapped(bytes: &'a [u8], mapped: usize) -> Self {
        Self {
            bytes,
            mapped: mapped.min(bytes.len()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Writable counterpart of [`UserSlice`].
pub struct UserSliceMut<'a> {
    bytes: &'a mut [u8],
    mapped: usize,
}

impl<'a> UserSliceMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        let mapped = bytes.len();
        Self { bytes, mapped }
    }

    pub fn partially_mapped(bytes: &'a mut [u8], mapped: usize) -> Self {
        let mapped = mapped.min(bytes.len());
        Self { bytes, mapped }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Where bytes written into a ring come from.
#[derive(Clone, Copy)]
pub enum Source<'a> {
    Kernel(&'a [u8]),
    User(UserSlice<'a>),
}

impl Source<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Source::Kernel(b) => b.len(),
            Source::User(u) => u.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `src[from..from + len]` into `dst` at `dst_off`.
    pub(crate) fn copy_to(
        &self,
        from: usize,
        len: usize,
        dst: &SharedRegion,
        dst_off: usize,
    ) -> Result<(), RingError> {
        match self {
            Source::Kernel(b) => {
                dst.copy_in(dst_off, &b[from..from + len]);
                Ok(())
            }
            Source::User(u) => {
                let end = from + len;
                if end > u.mapped {
                    let ok = u.mapped.saturating_sub(from);
                    dst.copy_in(dst_off, &u.bytes[from..from + ok]);
                    return Err(RingError::Fault);
                }
                dst.copy_in(dst_off, &u.bytes[from..end]);
                Ok(())
            }
        }
    }
}

impl<'a> From<&'a [u8]> for Source<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Source::Kernel(bytes)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Source<'a> {
    fn from(bytes: &'a [u8; N]) -> Self {
        Source::Kernel(bytes)
    }
}

/// Where bytes read out of a ring go.
pub enum Sink<'a> {
    Kernel(&'a mut [u8]),
    User(UserSliceMut<'a>),
    /// Skip this many bytes without copying.
    Discard(usize),
}

impl Sink<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Sink::Kernel(b) => b.len(),
            Sink::User(u) => u.len(),
            Sink::Discard(n) => *n,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reborrows the whole sink, so it can be handed to another attempt.
    pub fn reborrow(&mut self) -> Sink<'_> {
        let len = self.len();
        self.prefix(len)
    }

    /// Reborrows the first `len` bytes of this sink.
    pub(crate) fn prefix(&mut self, len: usize) -> Sink<'_> {
        match self {
            Sink::Kernel(b) => Sink::Kernel(&mut b[..len]),
            Sink::User(u) => Sink::User(UserSliceMut {
                mapped: u.mapped.min(len),
                bytes: &mut u.bytes[..len],
            }),
            Sink::Discard(_) => Sink::Discard(len),
        }
    }

    /// Copies `len` bytes from `src` at `src_off` into `self[to..to + len]`.
    pub(crate) fn copy_from(
        &mut self,
        to: usize,
        len: usize,
        src: &SharedRegion,
        src_off: usize,
    ) -> Result<(), RingError> {
        match self {
            Sink::Kernel(b) => {
                src.copy_out(src_off, &mut b[to..to + len]);
                Ok(())
            }
            Sink::User(u) => {
                let end = to + len;
                if end > u.mapped {
                    let ok = u.mapped.saturating_sub(to);
                    src.copy_out(src_off, &mut u.bytes[to..to + ok]);
                    return Err(RingError::Fault);
                }
                src.copy_out(src_off, &mut u.bytes[to..end]);
                Ok(())
            }
            Sink::Discard(_) => Ok(()),
        }
    }
}

impl<'a> From<&'a mut [u8]> for Sink<'a> {
    fn from(bytes: &'a mut [u8]) -> Self {
        Sink::Kernel(bytes)
    }
}

impl<'a, const N: usize> From<&'a mut [u8; N]> for Sink<'a> {
    fn from(bytes: &'a mut [u8; N]) -> Self {
        Sink::Kernel(bytes)
    }
}
