//! Page-backed channels shared with the secure side.
//!
//! A channel is a run of pages mapped back to back on this side and named to
//! the secure side by its frame list. The caller lays out its rings inside
//! the fresh pages before any frame number is published, so the secure side
//! never sees a half-built channel.

use std::sync::Arc;

use iwc_ring::SharedRegion;
use parking_lot::Mutex;

use crate::error::IwError;
use crate::page::{FrameTable, PageList, PageOrigin, Pfn};
use crate::smc::{SmcCode, SmcRequest, WorldGate};

/// What a channel carries; the secure side dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ChannelPurpose {
    /// The pair of cross-world socket event rings.
    SocketEvents = 0,
    /// One socket's head and data rings.
    Socket = 1,
}

impl ChannelPurpose {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::SocketEvents),
            1 => Some(Self::Socket),
            _ => None,
        }
    }
}

/// A live channel. Give it back with [`ChannelAllocator::free`].
#[derive(Debug)]
pub struct Channel {
    pages: PageList,
    purpose: ChannelPurpose,
}

impl Channel {
    #[inline]
    pub fn region(&self) -> SharedRegion {
        self.pages.region()
    }

    #[inline]
    pub fn pfns(&self) -> &[Pfn] {
        self.pages.pfns()
    }

    /// The frame the secure side knows this channel by.
    #[inline]
    pub fn first_pfn(&self) -> Pfn {
        self.pages.pfns()[0]
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.page_count()
    }

    #[inline]
    pub fn purpose(&self) -> ChannelPurpose {
        self.purpose
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenChannel {
    first_pfn: Pfn,
    purpose: ChannelPurpose,
    pages: usize,
}

pub struct ChannelAllocator {
    gate: Arc<WorldGate>,
    frames: Arc<FrameTable>,
    open: Mutex<Vec<OpenChannel>>,
}

impl ChannelAllocator {
    pub fn new(gate: Arc<WorldGate>, frames: Arc<FrameTable>) -> Self {
        Self {
            gate,
            frames,
            open: Mutex::new(Vec::new()),
        }
    }

    /// Allocates `page_count` pages, lets `pre_init` lay them out, then
    /// publishes the frame list.
    ///
    /// `pre_init` runs while the pages are still private. Whatever it
    /// returns is handed back with the channel; on a later failure it is
    /// dropped before the pages are, which is where a caller undoes any
    /// protocol state it set up.
    pub fn allocate<T, F>(
        &self,
        purpose: ChannelPurpose,
        page_count: usize,
        pre_init: F,
    ) -> Result<(Channel, T), IwError>
    where
        F: FnOnce(SharedRegion) -> Result<T, IwError>,
    {
        let pages = PageList::allocate(&self.frames, page_count, PageOrigin::Kernel)?;
        let prepared = pre_init(pages.region())?;

        if let Err(e) = self
            .gate
            .stream_pfns(SmcCode::ConnectChannel, purpose as u64, pages.pfns(), &[])
        {
            tracing::warn!(?purpose, pages = page_count, error = %e, "channel publication failed");
            drop(prepared);
            return Err(e);
        }

        let channel = Channel { pages, purpose };
        self.open.lock().push(OpenChannel {
            first_pfn: channel.first_pfn(),
            purpose,
            pages: page_count,
        });
        tracing::debug!(
            ?purpose,
            pages = page_count,
            first_pfn = channel.first_pfn().0,
            "channel allocated"
        );
        Ok((channel, prepared))
    }

    /// Tells the secure side to drop the channel, then unmaps it.
    pub fn free(&self, channel: Channel) {
        let first_pfn = channel.first_pfn();
        let known = {
            let mut open = self.open.lock();
            match open.iter().position(|c| c.first_pfn == first_pfn) {
                Some(idx) => {
                    open.swap_remove(idx);
                    true
                }
                None => false,
            }
        };
        if !known {
            tracing::warn!(first_pfn = first_pfn.0, "freeing a channel that is not registered");
        }

        if let Err(e) = self
            .gate
            .call(SmcRequest::new(SmcCode::ReleaseChannel, [first_pfn.0, 0, 0, 0]))
        {
            tracing::warn!(first_pfn = first_pfn.0, error = %e, "secure world did not release channel");
        }
        tracing::debug!(
            purpose = ?channel.purpose,
            pages = channel.page_count(),
            first_pfn = first_pfn.0,
            "channel freed"
        );
        drop(channel);
    }

    /// Number of channels currently published.
    pub fn open_channels(&self) -> usize {
        self.open.lock().len()
    }

    /// Pages held by published channels of `purpose`.
    pub fn pages_in_use(&self, purpose: ChannelPurpose) -> usize {
        self.open
            .lock()
            .iter()
            .filter(|c| c.purpose == purpose)
            .map(|c| c.pages)
            .sum()
    }

    #[inline]
    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }
}

impl std::fmt::Debug for ChannelAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAllocator")
            .field("open", &self.open_channels())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{self, CpuId};
    use crate::smc::{SecureMonitor, SmcResponse};
    use crate::staging::StagingPage;

    /// Accepts channels until told to refuse, remembering what it saw.
    #[derive(Default)]
    struct Monitor {
        refuse: std::sync::atomic::AtomicBool,
        seen: Mutex<Vec<(SmcCode, u64)>>,
    }

    impl SecureMonitor for Monitor {
        fn enter(&self, _cpu: CpuId, request: &SmcRequest, _staging: &mut StagingPage) -> SmcResponse {
            self.seen.lock().push((request.code, request.args[0]));
            if self.refuse.load(std::sync::atomic::Ordering::Relaxed) {
                SmcResponse::error(-libc::ENOMEM)
            } else {
                SmcResponse::ok([0; 3])
            }
        }
    }

    fn allocator() -> (Arc<Monitor>, Arc<FrameTable>, ChannelAllocator) {
        cpu::bind_current(CpuId(0));
        let monitor = Arc::new(Monitor::default());
        let frames = Arc::new(FrameTable::new());
        let gate = Arc::new(WorldGate::new(monitor.clone(), 1, 8));
        let channels = ChannelAllocator::new(gate, frames.clone());
        (monitor, frames, channels)
    }

    #[test]
    fn pre_init_runs_before_publication() {
        let (monitor, frames, channels) = allocator();
        let (channel, marker) = channels
            .allocate(ChannelPurpose::Socket, 2, |region| {
                assert!(monitor.seen.lock().is_empty());
                region.write_u32(0, 0xabcd);
                Ok(7u32)
            })
            .unwrap();
        assert_eq!(marker, 7);
        assert_eq!(channel.region().read_u32(0), 0xabcd);
        assert_eq!(channels.open_channels(), 1);
        assert_eq!(channels.pages_in_use(ChannelPurpose::Socket), 2);
        assert_eq!(frames.live(), 2);

        let first = channel.first_pfn();
        channels.free(channel);
        assert_eq!(channels.open_channels(), 0);
        assert_eq!(frames.live(), 0);
        assert_eq!(
            monitor.seen.lock().last(),
            Some(&(SmcCode::ReleaseChannel, first.0))
        );
    }

    #[test]
    fn refused_publication_unwinds() {
        let (monitor, frames, channels) = allocator();
        monitor
            .refuse
            .store(true, std::sync::atomic::Ordering::Relaxed);

        struct Undo<'a>(&'a std::sync::atomic::AtomicBool);
        impl Drop for Undo<'_> {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::Relaxed);
            }
        }
        let undone = std::sync::atomic::AtomicBool::new(false);
        let Err(err) = channels.allocate(ChannelPurpose::Socket, 3, |_| Ok(Undo(&undone))) else {
            panic!("publication should have been refused");
        };
        assert!(matches!(err, IwError::ResourceExhausted(_)));
        assert!(undone.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(channels.open_channels(), 0);
        assert_eq!(frames.live(), 0);
    }

    #[test]
    fn failing_pre_init_publishes_nothing() {
        let (monitor, frames, channels) = allocator();
        let err = channels
            .allocate::<(), _>(ChannelPurpose::SocketEvents, 1, |_| {
                Err(IwError::InvalidArgument("layout"))
            })
            .unwrap_err();
        assert_eq!(err, IwError::InvalidArgument("layout"));
        assert!(monitor.seen.lock().is_empty());
        assert_eq!(frames.live(), 0);
    }
}
