use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

/// A contiguous window of memory that another privilege domain may write at
/// any time.
///
/// Nothing here ever hands out `&[u8]` or `&mut T` into the window. Plain
/// bytes move through explicit copy accessors, and control words are only
/// reachable as atomics via [`SharedRegion::atomics`]. Ordering between the
/// two is the caller's job (see the cursor publication rules in
/// [`crate::circ_buf`]).
///
/// # Safety
///
/// The creator must ensure:
/// - `base` is valid for `len` bytes for as long as any copy of the region exists
/// - the peer never unmaps the memory while this side still holds the region
#[derive(Clone, Copy)]
pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
}

impl SharedRegion {
    /// Create a region from a raw pointer and length.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for reads and writes of `len` bytes
    /// - the memory must stay mapped for the lifetime of every copy of this region
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Returns the base pointer of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a pointer to offset `off` within the region.
    #[inline]
    pub fn offset(&self, off: usize) -> *mut u8 {
        assert!(
            off < self.len,
            "offset {off} out of bounds (len={})",
            self.len
        );
        unsafe { self.as_ptr().add(off) }
    }

    /// Returns the sub-window `[off, off + len)`.
    pub fn sub(&self, off: usize, len: usize) -> SharedRegion {
        assert!(
            off.checked_add(len).is_some_and(|end| end <= self.len),
            "sub-region {off}+{len} out of bounds (len={})",
            self.len
        );
        SharedRegion {
            // SAFETY: bounds checked above, and the result is non-null because base is.
            base: unsafe { NonNull::new_unchecked(self.as_ptr().add(off)) },
            len,
        }
    }

    /// Returns a shared reference to a control structure at `off`.
    ///
    /// # Safety
    ///
    /// `T` must consist only of atomics (the peer may change it concurrently),
    /// the offset must be aligned for `T`, and the structure must have been
    /// initialised with [`SharedRegion::init`] or by the peer.
    #[inline]
    pub unsafe fn atomics<T>(&self, off: usize) -> &T {
        debug_assert!(off + size_of::<T>() <= self.len);
        debug_assert!(off.is_multiple_of(align_of::<T>()));
        unsafe { &*(self.offset(off) as *const T) }
    }

    /// Writes a fresh control structure at `off`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to `[off, off + size_of::<T>())`,
    /// which holds before the region has been published to the peer.
    pub unsafe fn init<T>(&self, off: usize, value: T) {
        assert!(off + size_of::<T>() <= self.len, "control block out of bounds");
        assert!(off.is_multiple_of(align_of::<T>()), "control block misaligned");
        unsafe { ptr::write(self.offset(off) as *mut T, value) };
    }

    /// Volatile little-endian load of a 32-bit word.
    #[inline]
    pub fn read_u32(&self, off: usize) -> u32 {
        assert!(off + 4 <= self.len, "u32 read out of bounds");
        let mut raw = [0u8; 4];
        for (i, b) in raw.iter_mut().enumerate() {
            // SAFETY: bounds checked above.
            *b = unsafe { ptr::read_volatile(self.as_ptr().add(off + i)) };
        }
        u32::from_le_bytes(raw)
    }

    /// Volatile little-endian store of a 32-bit word.
    #[inline]
    pub fn write_u32(&self, off: usize, value: u32) {
        assert!(off + 4 <= self.len, "u32 write out of bounds");
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            // SAFETY: bounds checked above.
            unsafe { ptr::write_volatile(self.as_ptr().add(off + i), b) };
        }
    }

    /// Copies `src` into the region at `off`.
    #[inline]
    pub fn copy_in(&self, off: usize, src: &[u8]) {
        assert!(off + src.len() <= self.len, "copy_in out of bounds");
        // SAFETY: bounds checked above; src is ordinary memory and cannot overlap.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(off), src.len()) };
    }

    /// Copies bytes out of the region at `off` into `dst`.
    #[inline]
    pub fn copy_out(&self, off: usize, dst: &mut [u8]) {
        assert!(off + dst.len() <= self.len, "copy_out out of bounds");
        // SAFETY: bounds checked above; dst is ordinary memory and cannot overlap.
        unsafe { ptr::copy_nonoverlapping(self.as_ptr().add(off), dst.as_mut_ptr(), dst.len()) };
    }

    /// Zeroes `[off, off + len)`.
    pub fn zero(&self, off: usize, len: usize) {
        assert!(off + len <= self.len, "zero out of bounds");
        // SAFETY: bounds checked above.
        unsafe { ptr::write_bytes(self.as_ptr().add(off), 0, len) };
    }
}

// SAFETY: a SharedRegion is a pointer plus length; every access goes through
// atomics or explicit copies whose ordering the ring cursors establish.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use super::SharedRegion;
    use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
    use core::ptr::NonNull;

    /// Heap-backed region, used for NW-private rings and in tests.
    pub struct HeapRegion {
        base: NonNull<u8>,
        len: usize,
        layout: Layout,
    }

    impl HeapRegion {
        /// Allocate a zeroed heap region aligned to 64 bytes.
        pub fn new_zeroed(size: usize) -> Self {
            Self::new_zeroed_aligned(size, 64)
        }

        /// Allocate a zeroed heap region with the given power-of-two alignment.
        pub fn new_zeroed_aligned(size: usize, align: usize) -> Self {
            let Ok(layout) = Layout::from_size_align(size.max(1), align) else {
                panic!("invalid heap region layout: size={size} align={align}");
            };
            let ptr = unsafe { alloc_zeroed(layout) };
            let Some(base) = NonNull::new(ptr) else {
                handle_alloc_error(layout);
            };
            Self {
                base,
                len: size,
                layout,
            }
        }

        /// Returns a SharedRegion view of this allocation.
        #[inline]
        pub fn region(&self) -> SharedRegion {
            unsafe { SharedRegion::from_raw(self.base, self.len) }
        }

        /// Returns the allocation size.
        #[inline]
        pub fn len(&self) -> usize {
            self.len
        }

        /// Returns true if the allocation is zero-length.
        #[inline]
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }
    }

    impl Drop for HeapRegion {
        fn drop(&mut self) {
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }

    unsafe impl Send for HeapRegion {}
    unsafe impl Sync for HeapRegion {}
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapRegion;
