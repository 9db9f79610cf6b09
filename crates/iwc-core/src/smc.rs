//! The world-switch boundary.
//!
//! [`SecureMonitor`] is the single privileged call: it blocks the calling CPU
//! until the secure side yields. Everything in this crate reaches the secure
//! side through a [`WorldGate`], which pairs each call with the calling
//! CPU's staging page and fans the reply out to return observers.
//!
//! Observers run on the returning CPU while its staging page is still held,
//! so they must only record state and wake threads. They never call back
//! into the gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{MutexGuard, RwLock};

use crate::cpu::{self, CpuId, CpuMask};
use crate::error::IwError;
use crate::page::Pfn;
use crate::staging::{StagingArea, StagingPage};

/// Request codes understood by the secure side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SmcCode {
    /// Plain entry: let the secure side run whatever it has pending.
    Schedule = 0x10,
    /// One burst of a channel's frame list. args: purpose, total, staged, burst flags.
    ConnectChannel = 0x11,
    /// Drop the channel whose first frame is args[0].
    ReleaseChannel = 0x12,
    /// One burst of a region's frame list. args: handle | mem flags << 32, total, staged, burst flags.
    RegisterMemory = 0x20,
    /// Begin releasing handle args[0].
    ReleaseMemory = 0x21,
    /// Copy released handles into the staging page.
    FetchReleased = 0x22,
}

impl SmcCode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x10 => Self::Schedule,
            0x11 => Self::ConnectChannel,
            0x12 => Self::ReleaseChannel,
            0x20 => Self::RegisterMemory,
            0x21 => Self::ReleaseMemory,
            0x22 => Self::FetchReleased,
            _ => return None,
        })
    }
}

bitflags! {
    /// Position of a burst within a streamed frame list.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BurstFlags: u64 {
        const FIRST = 1 << 0;
        const LAST = 1 << 1;
    }
}

bitflags! {
    /// Out-of-band news piggybacked on any reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplyFlags: u32 {
        /// Released memory handles are waiting to be fetched.
        const RELEASED_PENDING = 1 << 0;
        /// The SW→NW socket event ring has new entries.
        const SOCKET_EVENTS = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmcRequest {
    pub code: SmcCode,
    pub args: [u64; 4],
}

impl SmcRequest {
    pub fn new(code: SmcCode, args: [u64; 4]) -> Self {
        Self { code, args }
    }

    pub fn schedule() -> Self {
        Self::new(SmcCode::Schedule, [0; 4])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmcResponse {
    /// Zero or a negative errno.
    pub status: i32,
    pub results: [u64; 3],
    /// CPUs the secure side wants entered again.
    pub reenter: CpuMask,
    pub flags: ReplyFlags,
}

impl SmcResponse {
    pub fn ok(results: [u64; 3]) -> Self {
        Self {
            results,
            ..Self::default()
        }
    }

    pub fn error(status: i32) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn check(self) -> Result<Self, IwError> {
        if self.status < 0 {
            Err(IwError::from_secure_status(self.status))
        } else {
            Ok(self)
        }
    }
}

/// The privileged world-switch primitive.
pub trait SecureMonitor: Send + Sync + 'static {
    /// Hands `cpu` to the secure side and returns when it yields.
    ///
    /// `staging` is the CPU's staging page; the secure side may read and
    /// write it for the duration of the call.
    fn enter(&self, cpu: CpuId, request: &SmcRequest, staging: &mut StagingPage) -> SmcResponse;
}

/// Hook run after every return from the secure side.
pub trait ReturnObserver: Send + Sync {
    fn on_return(&self, cpu: CpuId, reply: &SmcResponse);
}

pub struct WorldGate {
    monitor: Arc<dyn SecureMonitor>,
    staging: StagingArea,
    observers: RwLock<Vec<Weak<dyn ReturnObserver>>>,
    burst_pfns: usize,
    calls: AtomicU64,
}

impl WorldGate {
    pub fn new(monitor: Arc<dyn SecureMonitor>, num_cpus: u32, burst_pfns: usize) -> Self {
        Self {
            monitor,
            staging: StagingArea::new(num_cpus),
            observers: RwLock::new(Vec::new()),
            burst_pfns: burst_pfns.max(1),
            calls: AtomicU64::new(0),
        }
    }

    pub fn add_observer(&self, observer: Weak<dyn ReturnObserver>) {
        self.observers.write().push(observer);
    }

    /// Takes the calling CPU's staging page.
    pub fn session(&self) -> Result<GateSession<'_>, IwError> {
        self.session_on(cpu::current())
    }

    pub fn session_on(&self, cpu: CpuId) -> Result<GateSession<'_>, IwError> {
        Ok(GateSession {
            gate: self,
            cpu,
            page: self.staging.get(cpu)?,
        })
    }

    /// One call on the calling CPU with no staged payload.
    pub fn call(&self, request: SmcRequest) -> Result<SmcResponse, IwError> {
        self.session()?.enter(request)
    }

    /// Number of world-switch calls made so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Streams `pfns` in bursts, `prefix` riding in front of the first one.
    ///
    /// The staging page stays held across all bursts so no other publisher
    /// on this CPU can interleave. Returns the reply to the last burst.
    pub fn stream_pfns(
        &self,
        code: SmcCode,
        tag: u64,
        pfns: &[Pfn],
        prefix: &[u8],
    ) -> Result<SmcResponse, IwError> {
        let mut session = self.session()?;
        let total = pfns.len();
        let mut sent = 0usize;
        let mut first = true;
        loop {
            let prefix_now: &[u8] = if first { prefix } else { &[] };
            let room = StagingPage::burst_capacity(prefix_now.len()).min(self.burst_pfns);
            if room == 0 && sent < total {
                return Err(IwError::InvalidArgument("burst prefix leaves no room"));
            }
            let end = (sent + room).min(total);
            let page = session.page();
            page.clear();
            let staged = page.write_burst(prefix_now, &pfns[sent..end])?;
            sent += staged;

            let mut flags = BurstFlags::empty();
            if first {
                flags |= BurstFlags::FIRST;
            }
            if sent == total {
                flags |= BurstFlags::LAST;
            }
            tracing::trace!(
                code = ?code,
                tag,
                staged,
                sent,
                total,
                cpu = session.cpu().0,
                "staging burst"
            );
            let reply = session.enter(SmcRequest::new(
                code,
                [tag, total as u64, staged as u64, flags.bits()],
            ))?;
            if sent == total {
                return Ok(reply);
            }
            first = false;
        }
    }

    fn dispatch(&self, cpu: CpuId, reply: &SmcResponse) {
        let observers: Vec<Arc<dyn ReturnObserver>> = self
            .observers
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.on_return(cpu, reply);
        }
    }
}

impl std::fmt::Debug for WorldGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldGate")
            .field("cpus", &self.staging.num_cpus())
            .field("burst_pfns", &self.burst_pfns)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

/// A CPU's staging page, held for one or more calls.
pub struct GateSession<'g> {
    gate: &'g WorldGate,
    cpu: CpuId,
    page: MutexGuard<'g, StagingPage>,
}

impl GateSession<'_> {
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[inline]
    pub fn page(&mut self) -> &mut StagingPage {
        &mut self.page
    }

    /// Enters the secure side on this session's CPU.
    pub fn enter(&mut self, request: SmcRequest) -> Result<SmcResponse, IwError> {
        self.gate.calls.fetch_add(1, Ordering::Relaxed);
        let reply = self.gate.monitor.enter(self.cpu, &request, &mut self.page);
        if reply.status < 0 {
            tracing::warn!(
                code = ?request.code,
                status = reply.status,
                cpu = self.cpu.0,
                "secure world call failed"
            );
        }
        self.gate.dispatch(self.cpu, &reply);
        reply.check()
    }
}
