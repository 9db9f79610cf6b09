//! Page frames shared with the secure side.
//!
//! The secure side addresses NW memory by frame number only. [`FrameTable`]
//! is that physical address space: it hands out frame numbers for pages and
//! resolves them back. Frame numbers are recycled, so the frames of one
//! allocation are generally not consecutive even though the pages are mapped
//! back to back on this side.

use std::collections::{HashMap, VecDeque};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use iwc_ring::SharedRegion;
use parking_lot::Mutex;

use crate::error::IwError;

pub const PAGE_SIZE: usize = 4096;

/// Physical frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pfn(pub u64);

/// Whose pages these are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrigin {
    Kernel,
    User,
}

struct FrameInner {
    frames: HashMap<u64, usize>,
    free: VecDeque<u64>,
    next: u64,
}

pub struct FrameTable {
    inner: Mutex<FrameInner>,
}

impl FrameTable {
    /// Frame numbers below this are never handed out.
    const FIRST_PFN: u64 = 0x8_0000;

    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FrameInner {
                frames: HashMap::new(),
                free: VecDeque::new(),
                next: Self::FIRST_PFN,
            }),
        }
    }

    fn assign(&self, page: NonNull<u8>) -> Pfn {
        let mut inner = self.inner.lock();
        let pfn = match inner.free.pop_front() {
            Some(pfn) => pfn,
            None => {
                let pfn = inner.next;
                inner.next += 1;
                pfn
            }
        };
        inner.frames.insert(pfn, page.as_ptr() as usize);
        Pfn(pfn)
    }

    fn retire(&self, pfn: Pfn) {
        let mut inner = self.inner.lock();
        if inner.frames.remove(&pfn.0).is_some() {
            inner.free.push_back(pfn.0);
        }
    }

    /// Address of the page behind `pfn`, if it is live.
    pub fn resolve(&self, pfn: Pfn) -> Option<NonNull<u8>> {
        let addr = *self.inner.lock().frames.get(&pfn.0)?;
        NonNull::new(addr as *mut u8)
    }

    /// Maps a frame list as one window, the way the secure side sees a channel.
    ///
    /// Returns `None` if any frame is dead or the pages are not laid out back
    /// to back on this side.
    pub fn map_contiguous(&self, pfns: &[Pfn]) -> Option<SharedRegion> {
        let inner = self.inner.lock();
        let first = *inner.frames.get(&pfns.first()?.0)?;
        for (i, pfn) in pfns.iter().enumerate() {
            if *inner.frames.get(&pfn.0)? != first + i * PAGE_SIZE {
                return None;
            }
        }
        let base = NonNull::new(first as *mut u8)?;
        // SAFETY: every page in the window is live in the table, and pages
        // are only retired after the NW has told the secure side to drop them.
        Some(unsafe { SharedRegion::from_raw(base, pfns.len() * PAGE_SIZE) })
    }

    /// Number of live frames.
    pub fn live(&self) -> usize {
        self.inner.lock().frames.len()
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTable")
            .field("live", &self.live())
            .finish_non_exhaustive()
    }
}

/// Anonymous page mapping.
struct PageMapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory; sharing discipline is enforced by the
// rings laid out inside it.
unsafe impl Send for PageMapping {}
unsafe impl Sync for PageMapping {}

impl PageMapping {
    fn new(len: usize) -> Result<Self, IwError> {
        // SAFETY: anonymous private mapping with no address hint.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(IwError::ResourceExhausted("page mapping"));
        }
        let base = NonNull::new(addr as *mut u8).ok_or(IwError::ResourceExhausted("page mapping"))?;
        Ok(Self { base, len })
    }
}

impl Drop for PageMapping {
    fn drop(&mut self) {
        // SAFETY: base and len describe a live mapping created in new().
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Pages mapped back to back on this side, each with its own frame number.
pub struct PageList {
    mapping: PageMapping,
    pfns: Vec<Pfn>,
    frames: Arc<FrameTable>,
    origin: PageOrigin,
}

impl PageList {
    pub fn allocate(
        frames: &Arc<FrameTable>,
        count: usize,
        origin: PageOrigin,
    ) -> Result<Self, IwError> {
        if count == 0 {
            return Err(IwError::InvalidArgument("page count must be non-zero"));
        }
        let len = count
            .checked_mul(PAGE_SIZE)
            .ok_or(IwError::InvalidArgument("page count overflows"))?;
        let mapping = PageMapping::new(len)?;
        let pfns = (0..count)
            .map(|i| {
                // SAFETY: i * PAGE_SIZE < len.
                let page = unsafe { NonNull::new_unchecked(mapping.base.as_ptr().add(i * PAGE_SIZE)) };
                frames.assign(page)
            })
            .collect();
        Ok(Self {
            mapping,
            pfns,
            frames: frames.clone(),
            origin,
        })
    }

    #[inline]
    pub fn pfns(&self) -> &[Pfn] {
        &self.pfns
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.pfns.len()
    }

    #[inline]
    pub fn origin(&self) -> PageOrigin {
        self.origin
    }

    /// The whole list as one shared window.
    pub fn region(&self) -> SharedRegion {
        // SAFETY: the mapping lives as long as self; callers keep the list
        // alive for as long as they use the region.
        unsafe { SharedRegion::from_raw(self.mapping.base, self.mapping.len) }
    }
}

impl Drop for PageList {
    fn drop(&mut self) {
        for pfn in &self.pfns {
            self.frames.retire(*pfn);
        }
    }
}

impl std::fmt::Debug for PageList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageList")
            .field("pages", &self.pfns.len())
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_resolve_to_pages() {
        let frames = Arc::new(FrameTable::new());
        let list = PageList::allocate(&frames, 3, PageOrigin::Kernel).unwrap();
        assert_eq!(frames.live(), 3);
        let region = list.region();
        region.write_u32(PAGE_SIZE + 8, 0xfeed);

        let view = frames.map_contiguous(list.pfns()).unwrap();
        assert_eq!(view.len(), 3 * PAGE_SIZE);
        assert_eq!(view.read_u32(PAGE_SIZE + 8), 0xfeed);

        drop(list);
        assert_eq!(frames.live(), 0);
    }

    #[test]
    fn recycled_frames_are_scattered() {
        let frames = Arc::new(FrameTable::new());
        let a = PageList::allocate(&frames, 2, PageOrigin::Kernel).unwrap();
        let b = PageList::allocate(&frames, 2, PageOrigin::Kernel).unwrap();
        let (a0, a1, b1) = (a.pfns()[0], a.pfns()[1], b.pfns()[1]);
        drop(a);

        let c = PageList::allocate(&frames, 3, PageOrigin::User).unwrap();
        assert_eq!(c.pfns(), &[a0, a1, Pfn(b1.0 + 1)]);
        assert_ne!(c.pfns()[2].0, c.pfns()[1].0 + 1);
        assert!(frames.map_contiguous(c.pfns()).is_some());
        assert!(frames.map_contiguous(&[a0, b1]).is_none());
    }

    #[test]
    fn zero_pages_rejected() {
        let frames = Arc::new(FrameTable::new());
        assert!(PageList::allocate(&frames, 0, PageOrigin::Kernel).is_err());
    }
}
