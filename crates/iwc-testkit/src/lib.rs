//! An in-process secure world for exercising `iwc-core` end to end.
//!
//! [`SimSecureWorld`] implements [`SecureMonitor`]. Like the real thing it
//! only ever sees the normal world through frame numbers, the staging page
//! and the rings inside published channels; it never touches a normal-world
//! lock. On every entry it:
//!
//! - handles the request (frame bursts, channel release, memory handshakes)
//! - drains the NW → SW event ring
//! - services every socket endpoint: handshakes, connection requests,
//!   relaying, close propagation
//! - posts SW → NW events and sets the reply flags
//! - hands out any CPU entry requests queued with
//!   [`SimSecureWorld::request_entry`]
//!
//! ```ignore
//! let frames = Arc::new(FrameTable::new());
//! let sim = Arc::new(SimSecureWorld::new(frames.clone()));
//! let subsystem = Subsystem::start(IwConfig::default(), sim.clone(), frames)?;
//! ```

mod memory;
mod sockets;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use iwc_core::staging::MAX_STAGED_HANDLES;
use iwc_core::{
    BurstFlags, ChannelPurpose, CpuId, CpuMask, FrameTable, IwError, Pfn, ProtocolError,
    ReplyFlags, SecureMonitor, SmcCode, SmcRequest, SmcResponse, StagingPage,
};
use parking_lot::Mutex;

pub use memory::SimRegion;

use self::memory::MemoryBroker;
use self::sockets::Broker;

/// A frame list being streamed in bursts on one CPU.
struct Assembly {
    code: SmcCode,
    tag: u64,
    total: usize,
    prefix: Vec<u8>,
    pfns: Vec<Pfn>,
}

#[derive(Default)]
struct World {
    sockets: Broker,
    memory: MemoryBroker,
    assembling: HashMap<CpuId, Assembly>,
    entries: HashMap<CpuId, u64>,
}

pub struct SimSecureWorld {
    frames: Arc<FrameTable>,
    world: Mutex<World>,
    defer_releases: AtomicBool,
    /// Deferred releases are let go of once this many have piled up.
    release_batch: AtomicUsize,
    /// Handles per FetchReleased reply.
    fetch_batch: AtomicUsize,
    refuse_registrations: AtomicBool,
    reenter: AtomicU64,
}

impl SimSecureWorld {
    pub fn new(frames: Arc<FrameTable>) -> Self {
        Self {
            frames,
            world: Mutex::new(World::default()),
            defer_releases: AtomicBool::new(false),
            release_batch: AtomicUsize::new(1),
            fetch_batch: AtomicUsize::new(MAX_STAGED_HANDLES),
            refuse_registrations: AtomicBool::new(false),
            reenter: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    /// Defers every memory release until `batch` of them are pending.
    /// A `batch` of 0 goes back to releasing at once.
    pub fn defer_releases(&self, batch: usize) {
        self.release_batch.store(batch.max(1), Ordering::Relaxed);
        self.defer_releases.store(batch > 0, Ordering::Relaxed);
    }

    pub fn set_fetch_batch(&self, handles: usize) {
        self.fetch_batch
            .store(handles.clamp(1, MAX_STAGED_HANDLES), Ordering::Relaxed);
    }

    pub fn refuse_registrations(&self, refuse: bool) {
        self.refuse_registrations.store(refuse, Ordering::Relaxed);
    }

    /// Asks for entries on `mask` in the next reply.
    pub fn request_entry(&self, mask: CpuMask) {
        self.reenter.fetch_or(mask.0, Ordering::AcqRel);
    }

    pub fn entries_on(&self, cpu: CpuId) -> u64 {
        self.world.lock().entries.get(&cpu).copied().unwrap_or(0)
    }

    pub fn total_entries(&self) -> u64 {
        self.world.lock().entries.values().sum()
    }

    /// Socket channels the secure side still knows about.
    pub fn live_endpoints(&self) -> usize {
        self.world.lock().sockets.endpoints()
    }

    pub fn has_listener(&self, name: &str) -> bool {
        self.world.lock().sockets.has_listener(name)
    }

    pub fn events_attached(&self) -> bool {
        self.world.lock().sockets.events_attached()
    }

    /// Messages copied between paired sockets so far.
    pub fn relayed(&self) -> u64 {
        self.world.lock().sockets.relayed()
    }

    /// Events the normal world has posted for socket `id` and this side has read.
    pub fn notices_from(&self, id: u32) -> u64 {
        self.world.lock().sockets.notices(id)
    }

    pub fn registered_regions(&self) -> usize {
        self.world.lock().memory.live()
    }

    pub fn region(&self, handle: u32) -> Option<SimRegion> {
        self.world.lock().memory.region(handle).cloned()
    }

    pub fn deferred_releases(&self) -> usize {
        self.world.lock().memory.deferred()
    }

    fn collect_burst(
        world: &mut World,
        cpu: CpuId,
        request: &SmcRequest,
        staging: &StagingPage,
    ) -> Result<Option<Assembly>, IwError> {
        let [tag, total, staged, flags] = request.args;
        let flags = BurstFlags::from_bits_truncate(flags);
        let burst = staging.read_burst()?;
        if burst.pfns.len() as u64 != staged {
            return Err(ProtocolError::MalformedRecord.into());
        }
        if flags.contains(BurstFlags::FIRST) {
            world.assembling.insert(
                cpu,
                Assembly {
                    code: request.code,
                    tag,
                    total: total as usize,
                    prefix: burst.prefix,
                    pfns: Vec::with_capacity((total as usize).min(1 << 16)),
                },
            );
        }
        let Some(assembly) = world
            .assembling
            .get_mut(&cpu)
            .filter(|a| a.code == request.code && a.tag == tag)
        else {
            return Err(ProtocolError::MalformedRecord.into());
        };
        assembly.pfns.extend(burst.pfns);
        if !flags.contains(BurstFlags::LAST) {
            return Ok(None);
        }
        match world.assembling.remove(&cpu) {
            Some(done) if done.pfns.len() == done.total => Ok(Some(done)),
            _ => Err(ProtocolError::MalformedRecord.into()),
        }
    }

    fn connect_channel(&self, world: &mut World, done: Assembly) -> Result<(), IwError> {
        let purpose = ChannelPurpose::from_raw(done.tag)
            .ok_or(IwError::InvalidArgument("unknown channel purpose"))?;
        let first_pfn = *done
            .pfns
            .first()
            .ok_or(IwError::InvalidArgument("empty channel"))?;
        let region = self
            .frames
            .map_contiguous(&done.pfns)
            .ok_or(IwError::InvalidArgument("channel frames do not map"))?;
        match purpose {
            ChannelPurpose::SocketEvents => {
                world.sockets.open_events(first_pfn, region, done.pfns.len());
                Ok(())
            }
            ChannelPurpose::Socket => world.sockets.open_socket(first_pfn, region),
        }
    }

    fn dispatch(
        &self,
        world: &mut World,
        cpu: CpuId,
        request: &SmcRequest,
        staging: &mut StagingPage,
    ) -> Result<SmcResponse, IwError> {
        let ok = SmcResponse::ok([0; 3]);
        match request.code {
            SmcCode::Schedule => Ok(ok),
            SmcCode::ConnectChannel => {
                if let Some(done) = Self::collect_burst(world, cpu, request, staging)? {
                    self.connect_channel(world, done)?;
                }
                Ok(ok)
            }
            SmcCode::ReleaseChannel => {
                let first_pfn = Pfn(request.args[0]);
                if !world.sockets.close_channel(first_pfn) {
                    tracing::trace!(first_pfn = first_pfn.0, "release of unknown channel");
                }
                Ok(ok)
            }
            SmcCode::RegisterMemory => {
                let Some(done) = Self::collect_burst(world, cpu, request, staging)? else {
                    return Ok(ok);
                };
                if self.refuse_registrations.load(Ordering::Relaxed) {
                    return Err(IwError::ResourceExhausted("registration refused"));
                }
                let handle = world
                    .memory
                    .register(&self.frames, done.tag, &done.prefix, done.pfns)?;
                tracing::debug!(handle, "memory registered");
                Ok(ok)
            }
            SmcCode::ReleaseMemory => {
                let defer = self.defer_releases.load(Ordering::Relaxed);
                let now = world.memory.release(request.args[0] as u32, defer)?;
                Ok(SmcResponse::ok([u64::from(now), 0, 0]))
            }
            SmcCode::FetchReleased => {
                let max = self.fetch_batch.load(Ordering::Relaxed);
                let (handles, remaining) = world.memory.fetch(max);
                staging.clear();
                staging.write_handles(&handles);
                Ok(SmcResponse::ok([handles.len() as u64, remaining as u64, 0]))
            }
        }
    }
}

impl SecureMonitor for SimSecureWorld {
    fn enter(&self, cpu: CpuId, request: &SmcRequest, staging: &mut StagingPage) -> SmcResponse {
        let mut world = self.world.lock();
        *world.entries.entry(cpu).or_default() += 1;

        let mut reply = match self.dispatch(&mut world, cpu, request, staging) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(code = ?request.code, cpu = cpu.0, error = %e, "request failed");
                SmcResponse::error(e.errno())
            }
        };

        world.sockets.pump();
        if world.sockets.flush_events() {
            reply.flags |= ReplyFlags::SOCKET_EVENTS;
        }
        let batch = if self.defer_releases.load(Ordering::Relaxed) {
            self.release_batch.load(Ordering::Relaxed)
        } else {
            1
        };
        world.memory.settle(batch);
        if world.memory.has_released() {
            reply.flags |= ReplyFlags::RELEASED_PENDING;
        }
        reply.reenter = CpuMask(self.reenter.swap(0, Ordering::AcqRel));
        reply
    }
}

impl std::fmt::Debug for SimSecureWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let world = self.world.lock();
        f.debug_struct("SimSecureWorld")
            .field("endpoints", &world.sockets.endpoints())
            .field("regions", &world.memory.live())
            .finish_non_exhaustive()
    }
}
