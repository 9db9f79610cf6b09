//! Byte ring shared between exactly one writer and one reader.
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────────────────────┐
//! │ write_count  │ read_count  │ storage: capacity + 1 bytes  │
//! │ (u32, LE)    │ (u32, LE)   │                              │
//! └──────────────┴─────────────┴──────────────────────────────┘
//! ```
//!
//! Both cursors count modulo `capacity + 1`. One byte of storage is never
//! filled, so `write == read` means empty and `write + 1 == read` means full.
//!
//! Each side works on a [`CircBuf`] descriptor holding local shadows of both
//! cursors. A writer builds a record with `write_local` calls and publishes
//! it with [`CircBuf::flush_write`], which orders the payload stores before
//! the cursor store. The reader side mirrors that with an acquire load of the
//! write cursor before any payload byte is copied out.
//!
//! Cursors coming from the peer are never trusted: a value outside the
//! storage range is reported as [`RingError::Corrupted`] rather than used to
//! index memory.

use core::mem::size_of;

use crate::error::RingError;
use crate::io::{Sink, Source};
use crate::region::SharedRegion;
use crate::sync::{AtomicU32, Ordering, fence};

/// Shared ring header.
#[repr(C)]
pub struct CircBufHeader {
    /// Advanced only by the writer.
    pub write_count: AtomicU32,
    /// Advanced only by the reader.
    pub read_count: AtomicU32,
}

#[cfg(not(feature = "loom"))]
static_assertions::const_assert_eq!(size_of::<CircBufHeader>(), 8);

impl CircBufHeader {
    pub fn new() -> Self {
        Self {
            write_count: AtomicU32::new(0),
            read_count: AtomicU32::new(0),
        }
    }
}

impl Default for CircBufHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes of header in front of the storage.
pub const CIRC_BUF_HEADER_SIZE: usize = size_of::<CircBufHeader>();
/// The storage byte that is never filled.
pub const CIRC_BUF_EMPTY_FLAG_SIZE: usize = 1;
/// Per-ring overhead on top of the usable capacity.
pub const CIRC_BUF_META_SIZE: usize = CIRC_BUF_HEADER_SIZE + CIRC_BUF_EMPTY_FLAG_SIZE;

#[inline]
pub const fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[inline]
pub const fn round_down(value: usize, align: usize) -> usize {
    value / align * align
}

/// Bytes a ring of `capacity` occupies, keeping the next ring 4-byte aligned.
#[inline]
pub const fn circ_buf_total_size(capacity: u32) -> usize {
    round_up(capacity as usize + CIRC_BUF_META_SIZE, 4)
}

/// Pointer-level view of a ring inside a shared region.
///
/// Copyable and stateless: it only knows where the header and storage are.
#[derive(Clone, Copy, Debug)]
pub struct CircBufRaw {
    region: SharedRegion,
    capacity: u32,
}

impl CircBufRaw {
    /// Lay out a fresh, empty ring at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the ring's bytes, which holds
    /// before the surrounding region has been published to the peer.
    pub unsafe fn init(region: SharedRegion, offset: usize, capacity: u32) -> Self {
        let raw = unsafe { Self::attach(region, offset, capacity) };
        unsafe { raw.region.init(0, CircBufHeader::new()) };
        raw
    }

    /// View a ring that was laid out by [`CircBufRaw::init`], possibly by the peer.
    ///
    /// # Safety
    ///
    /// The region must stay mapped while this view (or any copy) is used.
    pub unsafe fn attach(region: SharedRegion, offset: usize, capacity: u32) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        assert!(
            offset.is_multiple_of(core::mem::align_of::<CircBufHeader>()),
            "ring header misaligned"
        );
        let total = CIRC_BUF_HEADER_SIZE + capacity as usize + CIRC_BUF_EMPTY_FLAG_SIZE;
        assert!(
            offset + total <= region.len(),
            "region too small for ring (need {total} at {offset}, have {})",
            region.len()
        );
        Self {
            region: region.sub(offset, total),
            capacity,
        }
    }

    #[inline]
    fn header(&self) -> &CircBufHeader {
        // SAFETY: the header sits at offset 0 of our window and is all atomics.
        unsafe { self.region.atomics::<CircBufHeader>(0) }
    }

    /// Usable capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    fn storage(&self) -> u32 {
        self.capacity + 1
    }

    #[inline]
    fn distance(&self, from: u32, to: u32) -> u32 {
        (to + self.storage() - from) % self.storage()
    }

    fn checked(&self, cursor: u32) -> Result<u32, RingError> {
        if cursor < self.storage() {
            Ok(cursor)
        } else {
            Err(RingError::Corrupted)
        }
    }

    pub(crate) fn shared_write(&self) -> Result<u32, RingError> {
        self.checked(self.header().write_count.load(Ordering::Acquire))
    }

    pub(crate) fn shared_read(&self) -> Result<u32, RingError> {
        self.checked(self.header().read_count.load(Ordering::Acquire))
    }

    /// Published occupancy. A corrupted cursor is folded into range so the
    /// answer stays bounded; data operations report the corruption instead.
    pub fn bytes_used(&self) -> u32 {
        let storage = self.storage();
        let write = self.header().write_count.load(Ordering::Acquire) % storage;
        let read = self.header().read_count.load(Ordering::Acquire) % storage;
        self.distance(read, write)
    }

    #[inline]
    pub fn bytes_free(&self) -> u32 {
        self.capacity - self.bytes_used()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes_used() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.bytes_used() == self.capacity
    }

    fn copy_in(&self, at: u32, src: &Source<'_>) -> Result<(), RingError> {
        let len = src.len();
        let data = CIRC_BUF_HEADER_SIZE;
        let first = len.min((self.storage() - at) as usize);
        src.copy_to(0, first, &self.region, data + at as usize)?;
        if first < len {
            src.copy_to(first, len - first, &self.region, data)?;
        }
        Ok(())
    }

    fn copy_out(&self, at: u32, sink: &mut Sink<'_>) -> Result<(), RingError> {
        let len = sink.len();
        let data = CIRC_BUF_HEADER_SIZE;
        let first = len.min((self.storage() - at) as usize);
        sink.copy_from(0, first, &self.region, data + at as usize)?;
        if first < len {
            sink.copy_from(first, len - first, &self.region, data)?;
        }
        Ok(())
    }

    #[inline]
    fn advance(&self, cursor: u32, len: usize) -> u32 {
        ((cursor as u64 + len as u64) % self.storage() as u64) as u32
    }
}

/// One side's handle on a ring: the raw view plus local cursor shadows.
///
/// The writer side must only call write operations and the reader side only
/// read operations; a single descriptor may do both when one thread owns both
/// roles (NW-private rings and tests).
pub struct CircBuf {
    raw: CircBufRaw,
    write_count: u32,
    read_count: u32,
}

impl CircBuf {
    /// Wrap a raw ring, starting both shadows at the published cursors.
    pub fn new(raw: CircBufRaw) -> Self {
        let storage = raw.storage();
        let write_count = raw.header().write_count.load(Ordering::Acquire) % storage;
        let read_count = raw.header().read_count.load(Ordering::Acquire) % storage;
        Self {
            raw,
            write_count,
            read_count,
        }
    }

    #[inline]
    pub fn raw(&self) -> &CircBufRaw {
        &self.raw
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.raw.capacity
    }

    #[inline]
    pub fn bytes_used(&self) -> u32 {
        self.raw.bytes_used()
    }

    #[inline]
    pub fn bytes_free(&self) -> u32 {
        self.raw.bytes_free()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.raw.is_full()
    }

    /// Space a `write_local` could use right now, counting unpublished writes.
    pub fn writable(&self) -> Result<u32, RingError> {
        let read = self.raw.shared_read()?;
        Ok(self.raw.capacity - self.raw.distance(read, self.write_count))
    }

    /// Bytes a `read_local` could consume right now, counting unpublished reads.
    pub fn readable(&self) -> Result<u32, RingError> {
        let write = self.raw.shared_write()?;
        Ok(self.raw.distance(self.read_count, write))
    }

    /// Appends `src` after the local write cursor without publishing it.
    pub fn write_local(&mut self, src: Source<'_>) -> Result<usize, RingError> {
        let len = src.len();
        let capacity = self.raw.capacity as usize;
        if len > capacity {
            return Err(RingError::TooLarge { len, capacity });
        }
        if len > self.writable()? as usize {
            return Err(RingError::WouldBlock);
        }
        self.raw.copy_in(self.write_count, &src)?;
        self.write_count = self.raw.advance(self.write_count, len);
        Ok(len)
    }

    /// `write_local` followed by `flush_write`.
    pub fn write(&mut self, src: Source<'_>) -> Result<usize, RingError> {
        let n = self.write_local(src)?;
        self.flush_write();
        Ok(n)
    }

    /// Publishes every local write so far.
    pub fn flush_write(&mut self) {
        fence(Ordering::Release);
        self.raw
            .header()
            .write_count
            .store(self.write_count, Ordering::Release);
    }

    /// Forgets unpublished writes.
    pub fn rollback_write(&mut self) {
        self.write_count = self.raw.header().write_count.load(Ordering::Relaxed) % self.raw.storage();
    }

    /// Consumes exactly `sink.len()` bytes after the local read cursor
    /// without publishing the new cursor.
    pub fn read_local(&mut self, mut sink: Sink<'_>) -> Result<usize, RingError> {
        let len = sink.len();
        let capacity = self.raw.capacity as usize;
        if len > capacity {
            return Err(RingError::TooLarge { len, capacity });
        }
        if len > self.readable()? as usize {
            return Err(RingError::WouldBlock);
        }
        fence(Ordering::Acquire);
        self.raw.copy_out(self.read_count, &mut sink)?;
        self.read_count = self.raw.advance(self.read_count, len);
        Ok(len)
    }

    /// `read_local` followed by `flush_read`.
    pub fn read(&mut self, sink: Sink<'_>) -> Result<usize, RingError> {
        let n = self.read_local(sink)?;
        self.flush_read();
        Ok(n)
    }

    /// Copies the next `dst.len()` bytes without consuming them.
    pub fn peek_local(&self, dst: &mut [u8]) -> Result<(), RingError> {
        if dst.len() > self.readable()? as usize {
            return Err(RingError::WouldBlock);
        }
        fence(Ordering::Acquire);
        self.raw.copy_out(self.read_count, &mut Sink::Kernel(dst))
    }

    /// Publishes every local read so far, handing the space back to the writer.
    pub fn flush_read(&mut self) {
        fence(Ordering::Release);
        self.raw
            .header()
            .read_count
            .store(self.read_count, Ordering::Release);
    }

    /// Forgets unpublished reads.
    pub fn rollback_read(&mut self) {
        self.read_count = self.raw.header().read_count.load(Ordering::Relaxed) % self.raw.storage();
    }

    #[inline]
    pub(crate) fn local_write(&self) -> u32 {
        self.write_count
    }

    #[inline]
    pub(crate) fn set_local_write(&mut self, cursor: u32) {
        self.write_count = cursor;
    }

    #[inline]
    pub(crate) fn local_read(&self) -> u32 {
        self.read_count
    }

    #[inline]
    pub(crate) fn set_local_read(&mut self, cursor: u32) {
        self.read_count = cursor;
    }
}

impl core::fmt::Debug for CircBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CircBuf")
            .field("capacity", &self.raw.capacity)
            .field("write_count", &self.write_count)
            .field("read_count", &self.read_count)
            .field("bytes_used", &self.raw.bytes_used())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::io::{UserSlice, UserSliceMut};
    use crate::region::HeapRegion;
    use alloc::vec;
    use alloc::vec::Vec;

    fn ring(capacity: u32) -> (HeapRegion, CircBuf) {
        let heap = HeapRegion::new_zeroed(circ_buf_total_size(capacity));
        let raw = unsafe { CircBufRaw::init(heap.region(), 0, capacity) };
        (heap, CircBuf::new(raw))
    }

    #[test]
    fn round_trip_preserves_order() {
        let (_heap, mut buf) = ring(16);
        buf.write(b"abc".into()).unwrap();
        buf.write(b"defgh".into()).unwrap();
        let mut out = [0u8; 8];
        buf.read((&mut out).into()).unwrap();
        assert_eq!(&out, b"abcdefgh");
        assert!(buf.is_empty());
    }

    #[test]
    fn wraps_around_storage_end() {
        let (_heap, mut buf) = ring(8);
        for round in 0..10u8 {
            let chunk = [round, round + 1, round + 2, round + 3, round + 4];
            buf.write((&chunk).into()).unwrap();
            let mut out = [0u8; 5];
            buf.read((&mut out).into()).unwrap();
            assert_eq!(out, chunk);
        }
    }

    #[test]
    fn full_means_capacity_used() {
        let (_heap, mut buf) = ring(8);
        buf.write(b"12345678".into()).unwrap();
        assert!(buf.is_full());
        assert_eq!(buf.bytes_used(), buf.capacity());
        assert_eq!(buf.bytes_free(), 0);
        assert_eq!(buf.write(b"9".into()), Err(RingError::WouldBlock));
        assert_eq!(buf.bytes_used(), 8);
    }

    #[test]
    fn too_large_is_not_would_block() {
        let (_heap, mut buf) = ring(8);
        let big = [0u8; 9];
        assert_eq!(
            buf.write((&big).into()),
            Err(RingError::TooLarge {
                len: 9,
                capacity: 8
            })
        );
        buf.write(b"1234".into()).unwrap();
        assert_eq!(buf.write(b"12345".into()), Err(RingError::WouldBlock));
    }

    #[test]
    fn local_writes_are_invisible_until_flushed() {
        let heap = HeapRegion::new_zeroed(circ_buf_total_size(32));
        let raw = unsafe { CircBufRaw::init(heap.region(), 0, 32) };
        let mut writer = CircBuf::new(raw);
        let mut reader = CircBuf::new(raw);

        writer.write_local(b"hello".into()).unwrap();
        let mut out = [0u8; 5];
        assert_eq!(reader.read((&mut out).into()), Err(RingError::WouldBlock));
        assert_eq!(writer.writable().unwrap(), 27);

        writer.flush_write();
        reader.read((&mut out).into()).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn rollback_write_discards_local_bytes() {
        let (_heap, mut buf) = ring(16);
        buf.write(b"keep".into()).unwrap();
        buf.write_local(b"drop".into()).unwrap();
        buf.rollback_write();
        buf.flush_write();
        assert_eq!(buf.bytes_used(), 4);
    }

    #[test]
    fn rollback_read_restores_data() {
        let (_heap, mut buf) = ring(16);
        buf.write(b"data".into()).unwrap();
        let mut out = [0u8; 4];
        buf.read_local((&mut out).into()).unwrap();
        buf.rollback_read();
        let mut again = [0u8; 4];
        buf.read((&mut again).into()).unwrap();
        assert_eq!(&again, b"data");
    }

    #[test]
    fn discard_advances_without_copy() {
        let (_heap, mut buf) = ring(16);
        buf.write(b"skipkeep".into()).unwrap();
        buf.read(Sink::Discard(4)).unwrap();
        let mut out = [0u8; 4];
        buf.read((&mut out).into()).unwrap();
        assert_eq!(&out, b"keep");
    }

    #[test]
    fn user_fault_leaves_cursor_alone() {
        let (_heap, mut buf) = ring(16);
        let data = [7u8; 8];
        let src = Source::User(UserSlice::partially_mapped(&data, 3));
        assert_eq!(buf.write(src), Err(RingError::Fault));
        assert!(buf.is_empty());

        buf.write((&data).into()).unwrap();
        let mut out = vec![0u8; 8];
        let sink = Sink::User(UserSliceMut::partially_mapped(&mut out, 2));
        assert_eq!(buf.read(sink), Err(RingError::Fault));
        assert_eq!(buf.bytes_used(), 8);
    }

    #[test]
    fn corrupted_peer_cursor_is_reported() {
        let (_heap, mut buf) = ring(8);
        buf.raw()
            .header()
            .read_count
            .store(1000, Ordering::Release);
        assert_eq!(buf.write(b"x".into()), Err(RingError::Corrupted));
        assert!(buf.bytes_used() <= buf.capacity());
    }

    #[test]
    fn never_overflows_under_mixed_traffic() {
        let (_heap, mut buf) = ring(13);
        let mut model: Vec<u8> = Vec::new();
        let mut next = 0u8;
        for step in 0..200usize {
            let len = (step * 7) % 6;
            if step % 3 == 2 {
                let take = len.min(model.len());
                let mut out = vec![0u8; take];
                buf.read(Sink::Kernel(&mut out)).unwrap();
                let expected: Vec<u8> = model.drain(..take).collect();
                assert_eq!(out, expected);
            } else {
                let chunk: Vec<u8> = (0..len)
                    .map(|_| {
                        next = next.wrapping_add(1);
                        next
                    })
                    .collect();
                match buf.write(Source::Kernel(&chunk)) {
                    Ok(_) => model.extend_from_slice(&chunk),
                    Err(RingError::WouldBlock) => {}
                    Err(e) => panic!("unexpected {e}"),
                }
            }
            assert!(buf.bytes_used() <= buf.capacity());
            assert_eq!(buf.bytes_used() as usize, model.len());
        }
    }
}
