//! Shared-memory registrar.
//!
//! Registering a page list streams its frame numbers to the secure side and
//! hands back a small-integer handle. Releasing is a handshake: the secure
//! side either lets go at once or defers, and deferred handles come back
//! later in batches fetched through the staging page. The pages and the
//! release callback are only given up once the secure side has let go.
//!
//! ```text
//! Registering ──ack──▶ Registered ──release──▶ Releasing ──released──▶ (gone)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::arena::IdArena;
use crate::cpu::CpuId;
use crate::error::IwError;
use crate::page::{PageList, PageOrigin, Pfn};
use crate::sched::EntryPool;
use crate::smc::{ReplyFlags, ReturnObserver, SmcCode, SmcRequest, SmcResponse, WorldGate};
use crate::state::SubsystemState;
use crate::task::TaskContext;
use crate::wait::WaitQueue;

bitflags! {
    /// Access flags sent with a registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemFlags: u32 {
        const WRITABLE = 1 << 0;
        /// Pages belong to a user address space.
        const USER = 1 << 1;
    }
}

/// `results[0]` of a `ReleaseMemory` reply when the handle is gone already.
pub const RELEASED_NOW: u64 = 1;

/// Names a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemHandle(pub u32);

impl std::fmt::Display for MemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mem#{}", self.0)
    }
}

/// Runs once, after the secure side has let go of the region.
pub type ReleaseCallback = Box<dyn FnOnce(MemHandle) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionState {
    Registering,
    Registered,
    Releasing,
}

struct Region {
    pages: PageList,
    flags: MemFlags,
    state: RegionState,
    on_release: Option<ReleaseCallback>,
}

struct RegistrarShared {
    state: Arc<SubsystemState>,
    gate: Arc<WorldGate>,
    pool: Arc<EntryPool>,
    regions: Mutex<IdArena<Region>>,
    /// The secure side has released handles waiting to be fetched.
    released_pending: AtomicBool,
    wq: WaitQueue,
}

impl ReturnObserver for RegistrarShared {
    fn on_return(&self, _cpu: CpuId, reply: &SmcResponse) {
        if reply.flags.contains(ReplyFlags::RELEASED_PENDING) {
            self.released_pending.store(true, Ordering::Release);
            self.wq.wake_all();
        }
    }
}

impl RegistrarShared {
    fn is_live(&self, handle: MemHandle) -> bool {
        self.regions.lock().get(handle.0).is_some()
    }

    /// Drops the region and runs its callback. A handle is finished at most once.
    fn finish(&self, handle: MemHandle) {
        let Some(mut region) = self.regions.lock().remove(handle.0) else {
            tracing::warn!(%handle, "secure world released an unknown handle");
            return;
        };
        if region.state != RegionState::Releasing {
            tracing::warn!(%handle, state = ?region.state, "handle released without a request");
        }
        tracing::debug!(%handle, pages = region.pages.page_count(), "memory region released");
        if let Some(callback) = region.on_release.take() {
            callback(handle);
        }
        drop(region);
        self.wq.wake_all();
    }

    fn collect_released(&self) -> Result<usize, IwError> {
        let mut handles = Vec::new();
        {
            let mut session = self.gate.session()?;
            loop {
                session.page().clear();
                let reply = session.enter(SmcRequest::new(SmcCode::FetchReleased, [0; 4]))?;
                handles.extend(session.page().read_handles()?);
                if reply.results[1] == 0 {
                    break;
                }
            }
        }
        tracing::trace!(count = handles.len(), "fetched released handles");
        for handle in &handles {
            self.finish(MemHandle(*handle));
        }
        Ok(handles.len())
    }
}

pub struct Registrar {
    shared: Arc<RegistrarShared>,
}

impl Registrar {
    pub fn new(
        state: Arc<SubsystemState>,
        gate: Arc<WorldGate>,
        pool: Arc<EntryPool>,
        max_regions: u32,
    ) -> Self {
        let shared = Arc::new(RegistrarShared {
            state,
            gate: gate.clone(),
            pool,
            regions: Mutex::new(IdArena::new(max_regions)),
            released_pending: AtomicBool::new(false),
            wq: WaitQueue::new(),
        });
        let observer = Arc::downgrade(&shared);
        let observer: Weak<dyn ReturnObserver> = observer;
        gate.add_observer(observer);
        Self { shared }
    }

    /// Makes `pages` visible to the secure side.
    ///
    /// The caller's credential rides in front of the first frame burst. On
    /// failure the handle is unwound and `pages` dropped; the callback does
    /// not run.
    pub fn register(
        &self,
        task: &TaskContext,
        pages: PageList,
        writable: bool,
        on_release: Option<ReleaseCallback>,
    ) -> Result<MemHandle, IwError> {
        let shared = &self.shared;
        shared.state.check_ready()?;

        let mut flags = MemFlags::empty();
        if writable {
            flags |= MemFlags::WRITABLE;
        }
        if pages.origin() == PageOrigin::User {
            flags |= MemFlags::USER;
        }
        let pfns: Vec<Pfn> = pages.pfns().to_vec();
        let id = shared
            .regions
            .lock()
            .insert(Region {
                pages,
                flags,
                state: RegionState::Registering,
                on_release,
            })
            .map_err(|_| IwError::ResourceExhausted("region table"))?;
        let handle = MemHandle(id);

        let tag = u64::from(id) | (u64::from(flags.bits()) << 32);
        let credential = task.credential().to_bytes();
        match shared
            .gate
            .stream_pfns(SmcCode::RegisterMemory, tag, &pfns, &credential)
        {
            Ok(_) => {
                if let Some(region) = shared.regions.lock().get_mut(id) {
                    region.state = RegionState::Registered;
                }
                tracing::debug!(%handle, pages = pfns.len(), ?flags, "memory region registered");
                Ok(handle)
            }
            Err(e) => {
                let unwound = shared.regions.lock().remove(id);
                tracing::warn!(%handle, error = %e, "memory registration failed");
                drop(unwound);
                Err(e)
            }
        }
    }

    /// Asks the secure side to let go of `handle` and waits until it has.
    ///
    /// If the wait is interrupted the release still completes later, and
    /// the callback runs then.
    pub fn release(&self, task: &TaskContext, handle: MemHandle) -> Result<(), IwError> {
        let shared = &self.shared;
        shared.state.check_ready()?;
        {
            let mut regions = shared.regions.lock();
            let region = regions.get_mut(handle.0).ok_or(IwError::NotFound)?;
            match region.state {
                RegionState::Registered => region.state = RegionState::Releasing,
                RegionState::Registering => return Err(IwError::BadState),
                RegionState::Releasing => return Err(IwError::AlreadyInProgress),
            }
        }

        let request = SmcRequest::new(SmcCode::ReleaseMemory, [u64::from(handle.0), 0, 0, 0]);
        let reply = match shared.gate.call(request) {
            Ok(reply) => reply,
            Err(e) => {
                if let Some(region) = shared.regions.lock().get_mut(handle.0) {
                    region.state = RegionState::Registered;
                }
                return Err(e);
            }
        };
        if reply.results[0] == RELEASED_NOW {
            shared.finish(handle);
            return Ok(());
        }

        tracing::debug!(%handle, "memory release deferred");
        shared.pool.enter_swd();
        loop {
            shared.wq.wait_for(task, || {
                !shared.state.is_ready()
                    || !shared.is_live(handle)
                    || shared.released_pending.load(Ordering::Acquire)
            })?;
            if shared.released_pending.swap(false, Ordering::AcqRel) {
                shared.collect_released()?;
            }
            if !shared.is_live(handle) {
                return Ok(());
            }
            shared.state.check_ready()?;
        }
    }

    /// Fetches and finishes whatever the secure side has released.
    pub fn collect_released(&self) -> Result<usize, IwError> {
        self.shared.state.check_ready()?;
        self.shared.released_pending.store(false, Ordering::Release);
        self.shared.collect_released()
    }

    /// Access flags `handle` was registered with.
    pub fn flags(&self, handle: MemHandle) -> Option<MemFlags> {
        self.shared.regions.lock().get(handle.0).map(|r| r.flags)
    }

    pub fn live_regions(&self) -> usize {
        self.shared.regions.lock().len()
    }

    pub fn wake_all(&self) {
        self.shared.wq.wake_all();
    }

    /// Panic path: forgets every region, registered or mid-release, and
    /// runs each outstanding callback. Returns how many were reclaimed.
    pub fn reclaim_all(&self) -> usize {
        let drained = self.shared.regions.lock().drain();
        let count = drained.len();
        for (id, mut region) in drained {
            if let Some(callback) = region.on_release.take() {
                callback(MemHandle(id));
            }
        }
        if count > 0 {
            tracing::warn!(regions = count, "reclaimed memory regions");
        }
        self.shared.wq.wake_all();
        count
    }
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("live_regions", &self.live_regions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{self, CpuMask};
    use crate::page::FrameTable;
    use crate::smc::SecureMonitor;
    use crate::staging::StagingPage;
    use std::sync::atomic::AtomicU32;

    /// Releases synchronously unless told to refuse registrations.
    #[derive(Default)]
    struct Monitor {
        refuse: AtomicBool,
        registered: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl SecureMonitor for Monitor {
        fn enter(&self, _cpu: CpuId, request: &SmcRequest, staging: &mut StagingPage) -> SmcResponse {
            match request.code {
                SmcCode::RegisterMemory if self.refuse.load(Ordering::Relaxed) => {
                    SmcResponse::error(-libc::ENOMEM)
                }
                SmcCode::RegisterMemory => {
                    let burst = staging.read_burst().unwrap();
                    self.registered.lock().push((request.args[0], burst.prefix));
                    SmcResponse::ok([0; 3])
                }
                SmcCode::ReleaseMemory => SmcResponse::ok([RELEASED_NOW, 0, 0]),
                _ => SmcResponse::ok([0; 3]),
            }
        }
    }

    fn registrar() -> (Arc<Monitor>, Arc<FrameTable>, Registrar, Arc<EntryPool>) {
        cpu::bind_current(CpuId(0));
        let monitor = Arc::new(Monitor::default());
        let gate = Arc::new(WorldGate::new(monitor.clone(), 1, 4));
        let pool = Arc::new(EntryPool::start(gate.clone(), 1, CpuMask::first(1)).unwrap());
        let state = Arc::new(SubsystemState::new());
        state.mark_ready();
        let registrar = Registrar::new(state, gate, pool.clone(), 8);
        (monitor, Arc::new(FrameTable::new()), registrar, pool)
    }

    #[test]
    fn register_sends_credential_and_flags() {
        let (monitor, frames, registrar, _pool) = registrar();
        let task = TaskContext::user(12, 34, 56);
        let pages = PageList::allocate(&frames, 3, PageOrigin::User).unwrap();
        let handle = registrar.register(&task, pages, true, None).unwrap();

        let registered = monitor.registered.lock();
        let (tag, prefix) = &registered[0];
        assert_eq!(*tag as u32, handle.0);
        assert_eq!(
            MemFlags::from_bits_truncate((*tag >> 32) as u32),
            MemFlags::WRITABLE | MemFlags::USER
        );
        assert_eq!(prefix.as_slice(), &task.credential().to_bytes());
        assert_eq!(registrar.flags(handle), Some(MemFlags::WRITABLE | MemFlags::USER));
    }

    #[test]
    fn synchronous_release_fires_callback_once() {
        let (_monitor, frames, registrar, _pool) = registrar();
        let task = TaskContext::kernel();
        let fired = Arc::new(AtomicU32::new(0));
        let pages = PageList::allocate(&frames, 1, PageOrigin::Kernel).unwrap();
        let counter = fired.clone();
        let handle = registrar
            .register(
                &task,
                pages,
                false,
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        registrar.release(&task, handle).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(frames.live(), 0);
        assert_eq!(registrar.release(&task, handle), Err(IwError::NotFound));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refused_registration_unwinds_handle() {
        let (monitor, frames, registrar, _pool) = registrar();
        monitor.refuse.store(true, Ordering::Relaxed);
        let pages = PageList::allocate(&frames, 2, PageOrigin::Kernel).unwrap();
        let err = registrar
            .register(&TaskContext::kernel(), pages, false, None)
            .unwrap_err();
        assert!(matches!(err, IwError::ResourceExhausted(_)));
        assert_eq!(registrar.live_regions(), 0);
        assert_eq!(frames.live(), 0);
    }

    #[test]
    fn reclaim_runs_outstanding_callbacks() {
        let (_monitor, frames, registrar, _pool) = registrar();
        let fired = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let counter = fired.clone();
            let pages = PageList::allocate(&frames, 1, PageOrigin::Kernel).unwrap();
            registrar
                .register(
                    &TaskContext::kernel(),
                    pages,
                    true,
                    Some(Box::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })),
                )
                .unwrap();
        }
        assert_eq!(registrar.reclaim_all(), 3);
        assert_eq!(registrar.reclaim_all(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(frames.live(), 0);
    }

    #[test]
    fn table_is_bounded() {
        let (_monitor, frames, registrar, _pool) = registrar();
        let task = TaskContext::kernel();
        for _ in 0..8 {
            let pages = PageList::allocate(&frames, 1, PageOrigin::Kernel).unwrap();
            registrar.register(&task, pages, false, None).unwrap();
        }
        let pages = PageList::allocate(&frames, 1, PageOrigin::Kernel).unwrap();
        assert_eq!(
            registrar.register(&task, pages, false, None),
            Err(IwError::ResourceExhausted("region table"))
        );
    }
}
