//! Cross-world socket event queues.
//!
//! Events are bare socket ids. The NW → SW ring tells the secure side which
//! sockets to look at; the SW → NW ring does the reverse and is drained by
//! the notification worker alone. A third, NW-private ring carries ids of
//! sockets released after their secure side had already closed, so the
//! worker can unpublish them.

use std::sync::atomic::{Ordering, fence};

use iwc_ring::{CircBuf, CircBufRaw, HeapRegion, RingError, Sink, Source, circ_buf_total_size};
use parking_lot::{Mutex, RwLock};

use crate::channel::{Channel, ChannelAllocator, ChannelPurpose};
use crate::config::IwConfig;
use crate::error::{IwError, ProtocolError};
use crate::sched::EntryPool;
use crate::smc::{ReplyFlags, SmcResponse};
use crate::socket::layout::events_ring_size;
use crate::state::SubsystemState;
use crate::wait::WaitQueue;

const EVENT_SIZE: usize = size_of::<u32>();

/// One socket id taken off a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SocketEvent {
    pub id: u32,
    /// The SW → NW ring was full before this read, so the secure side may be
    /// waiting for room.
    pub swd_was_full: bool,
}

pub(crate) struct EventQueues {
    /// Present until shutdown; readers of the shared rings hold it.
    channel: RwLock<Option<Channel>>,
    nwd: Mutex<CircBuf>,
    swd: Mutex<CircBuf>,
    swd_raw: CircBufRaw,
    /// Producers blocked on a full NW → SW ring.
    full_wq: WaitQueue,
    internal: Mutex<CircBuf>,
    _internal_mem: HeapRegion,
    /// Producers blocked on a full internal ring.
    internal_wq: WaitQueue,
    /// The notification worker.
    pub(crate) notify_wq: WaitQueue,
}

impl EventQueues {
    pub(crate) fn open(channels: &ChannelAllocator, config: &IwConfig) -> Result<Self, IwError> {
        let size = events_ring_size(config.events_pages);
        let (channel, (nwd, swd)) =
            channels.allocate(ChannelPurpose::SocketEvents, config.events_pages, |region| {
                // SAFETY: the channel has not been published yet.
                let nwd = unsafe { CircBufRaw::init(region, 0, size) };
                let swd = unsafe { CircBufRaw::init(region, circ_buf_total_size(size), size) };
                Ok((nwd, swd))
            })?;

        let internal_mem = HeapRegion::new_zeroed(circ_buf_total_size(config.internal_events_size));
        // SAFETY: the ring is private to this side and its memory lives in `self`.
        let internal = unsafe { CircBufRaw::init(internal_mem.region(), 0, config.internal_events_size) };

        Ok(Self {
            channel: RwLock::new(Some(channel)),
            nwd: Mutex::new(CircBuf::new(nwd)),
            swd: Mutex::new(CircBuf::new(swd)),
            swd_raw: swd,
            full_wq: WaitQueue::new(),
            internal: Mutex::new(CircBuf::new(internal)),
            _internal_mem: internal_mem,
            internal_wq: WaitQueue::new(),
            notify_wq: WaitQueue::new(),
        })
    }

    /// Posts `id` to the secure side and asks for an entry.
    ///
    /// A full ring is retried under the NW-events lock: each attempt that
    /// would block requests an entry, and every return from the secure side
    /// wakes us to retry.
    pub(crate) fn notify_swd(&self, id: u32, state: &SubsystemState, pool: &EntryPool) {
        fence(Ordering::Release);

        let mut ring = self.nwd.lock();
        let mut outcome = Err(IwError::WouldBlock);
        self.full_wq.wait(|| {
            outcome = self.try_write_swd_event(&mut ring, id, state, pool);
            !matches!(outcome, Err(IwError::WouldBlock))
        });
        drop(ring);

        match outcome {
            Ok(()) => pool.enter_swd(),
            Err(e) => tracing::trace!(socket_id = id, error = %e, "event not posted"),
        }
    }

    /// Caller holds the NW-events lock, which `close` takes before the channel.
    fn try_write_swd_event(
        &self,
        ring: &mut CircBuf,
        id: u32,
        state: &SubsystemState,
        pool: &EntryPool,
    ) -> Result<(), IwError> {
        if !state.is_ready() || self.channel.read().is_none() {
            return Err(IwError::ConnectionReset);
        }
        match ring.write(Source::Kernel(&id.to_le_bytes())) {
            Ok(_) => Ok(()),
            Err(RingError::WouldBlock) => {
                pool.enter_swd();
                Err(IwError::WouldBlock)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Hands `id` to the notification worker.
    pub(crate) fn notify_internally(&self, id: u32, state: &SubsystemState) {
        self.internal_wq.wait(|| {
            if !state.is_ready() {
                return true;
            }
            match self.internal.lock().write(Source::Kernel(&id.to_le_bytes())) {
                Err(RingError::WouldBlock) => {
                    self.notify_wq.wake_all();
                    false
                }
                Ok(_) => true,
                Err(e) => {
                    tracing::error!(socket_id = id, error = %e, "internal event ring failed");
                    true
                }
            }
        });
        self.notify_wq.wake_all();
    }

    /// Takes the next event, secure-side events first.
    pub(crate) fn next_event(&self) -> Result<Option<SocketEvent>, IwError> {
        let live = self.channel.read();
        if live.is_some() {
            let mut swd = self.swd.lock();
            let swd_was_full = (swd.bytes_free() as usize) < EVENT_SIZE;
            let mut raw = [0u8; EVENT_SIZE];
            match swd.read(Sink::Kernel(&mut raw)) {
                Ok(_) => {
                    return Ok(Some(SocketEvent {
                        id: u32::from_le_bytes(raw),
                        swd_was_full,
                    }));
                }
                Err(RingError::WouldBlock) => {}
                Err(RingError::Corrupted) => return Err(ProtocolError::CorruptRing.into()),
                Err(e) => return Err(e.into()),
            }
        }
        drop(live);

        let mut raw = [0u8; EVENT_SIZE];
        match self.internal.lock().read(Sink::Kernel(&mut raw)) {
            Ok(_) => {
                self.internal_wq.wake_all();
                Ok(Some(SocketEvent {
                    id: u32::from_le_bytes(raw),
                    swd_was_full: false,
                }))
            }
            Err(RingError::WouldBlock) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn has_events(&self) -> bool {
        let swd_pending = self.channel.read().is_some() && !self.swd_raw.is_empty();
        swd_pending || !self.internal.lock().is_empty()
    }

    /// Called on every return from the secure side.
    pub(crate) fn on_return(&self, reply: &SmcResponse, state: &SubsystemState) {
        if !state.is_ready() {
            return;
        }
        self.full_wq.wake_all();
        if reply.flags.contains(ReplyFlags::SOCKET_EVENTS) || self.has_events() {
            self.notify_wq.wake_all();
        }
    }

    pub(crate) fn wake_all(&self) {
        self.full_wq.wake_all();
        self.internal_wq.wake_all();
        self.notify_wq.wake_all();
    }

    /// Unpublishes the events channel. Nothing touches the shared rings afterwards.
    pub(crate) fn close(&self, channels: &ChannelAllocator) {
        let channel = {
            let _nwd = self.nwd.lock();
            let _swd = self.swd.lock();
            self.channel.write().take()
        };
        if let Some(channel) = channel {
            channels.free(channel);
        }
    }

    /// Reads the NW → SW ring the way the secure side does.
    #[cfg(test)]
    pub(crate) fn drain_nwd_events(&self) -> Vec<u32> {
        let raw = *self.nwd.lock().raw();
        let mut reader = CircBuf::new(raw);
        let mut ids = Vec::new();
        let mut word = [0u8; EVENT_SIZE];
        while reader.read(Sink::Kernel(&mut word)).is_ok() {
            ids.push(u32::from_le_bytes(word));
        }
        ids
    }
}
