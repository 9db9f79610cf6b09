//! The entry pool: who gets to enter the secure side, and on which CPU.
//!
//! Every eligible CPU has one worker thread parked on its own condvar. A
//! caller already on an eligible CPU enters directly; everyone else bumps
//! `pending` and wakes idle workers, at most one per pending request.
//!
//! The secure side can also ask for specific CPUs through the `reenter`
//! mask of any reply. Those requests are recorded in `requested` and served
//! by that CPU's worker, unless the thread that received the reply is itself
//! in a direct entry on that CPU, in which case it loops instead of waking
//! its own worker.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::cpu::{self, CpuId, CpuMask};
use crate::error::IwError;
use crate::smc::{ReturnObserver, SmcRequest, SmcResponse, WorldGate};

thread_local! {
    /// CPU of the direct entry this thread is running, if any.
    static DIRECT_ENTRY: Cell<Option<CpuId>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Sleeping,
    Scheduled,
    Stopping,
    /// CPU is offline; the worker is kept but never woken.
    Parked,
}

struct Slot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Sleeping),
            cv: Condvar::new(),
        }
    }

    /// Returns true if a sleeping worker was scheduled.
    fn schedule(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SlotState::Sleeping => {
                *state = SlotState::Scheduled;
                self.cv.notify_one();
                true
            }
            _ => false,
        }
    }

    fn is_parked(&self) -> bool {
        *self.state.lock() == SlotState::Parked
    }
}

/// Counters of how entries were made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Entries made directly by the calling thread.
    pub fast_path: u64,
    /// Entries made by a worker for an unspecific request.
    pub pooled: u64,
    /// Entries made because the secure side asked for that CPU.
    pub requested: u64,
}

struct PoolShared {
    gate: Arc<WorldGate>,
    eligible: CpuMask,
    slots: Vec<Slot>,
    pending: AtomicU32,
    requested: AtomicU64,
    stopping: AtomicBool,
    fast_path: AtomicU64,
    pooled: AtomicU64,
    requested_entries: AtomicU64,
}

impl PoolShared {
    fn slot(&self, cpu: CpuId) -> Option<&Slot> {
        self.slots.get(cpu.0 as usize)
    }

    /// Decrements `pending` unless it is already zero.
    fn take_pending(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_requested(&self, cpu: CpuId) -> bool {
        let bit = CpuMask::single(cpu).0;
        self.requested.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Wakes idle workers, one per pending request.
    fn kick(&self) {
        let mut budget = self.pending.load(Ordering::Acquire);
        for cpu in self.eligible.iter() {
            if budget == 0 {
                break;
            }
            if self.slot(cpu).is_some_and(Slot::schedule) {
                budget -= 1;
            }
        }
    }

    fn enter(&self, cpu: CpuId) {
        if let Err(e) = self.gate.call(SmcRequest::schedule()) {
            tracing::warn!(cpu = cpu.0, error = %e, "scheduled entry failed");
        }
    }

    fn run_worker(&self, cpu: CpuId) {
        cpu::bind_current(cpu);
        tracing::debug!(cpu = cpu.0, "entry worker started");
        let Some(slot) = self.slot(cpu) else {
            return;
        };
        loop {
            {
                let mut state = slot.state.lock();
                loop {
                    match *state {
                        SlotState::Stopping => {
                            tracing::debug!(cpu = cpu.0, "entry worker stopped");
                            return;
                        }
                        SlotState::Scheduled => {
                            *state = SlotState::Sleeping;
                            break;
                        }
                        SlotState::Sleeping | SlotState::Parked => slot.cv.wait(&mut state),
                    }
                }
            }

            loop {
                if self.stopping.load(Ordering::Acquire) {
                    break;
                }
                if self.take_requested(cpu) {
                    self.requested_entries.fetch_add(1, Ordering::Relaxed);
                } else if self.take_pending() {
                    self.pooled.fetch_add(1, Ordering::Relaxed);
                } else {
                    break;
                }
                self.enter(cpu);
            }
        }
    }
}

impl ReturnObserver for PoolShared {
    fn on_return(&self, cpu: CpuId, reply: &SmcResponse) {
        let wanted = reply.reenter.intersect(self.eligible);
        if wanted.is_empty() {
            return;
        }
        let direct = DIRECT_ENTRY.with(Cell::get);
        let mut rerouted = 0;
        for target in wanted.iter() {
            self.requested.fetch_or(CpuMask::single(target).0, Ordering::AcqRel);
            if direct == Some(target) && target == cpu {
                continue;
            }
            match self.slot(target) {
                Some(slot) if !slot.is_parked() => {
                    slot.schedule();
                }
                _ => {
                    if self.take_requested(target) {
                        rerouted += 1;
                    }
                }
            }
        }
        if rerouted > 0 {
            self.pending.fetch_add(rerouted, Ordering::AcqRel);
            self.kick();
        }
    }
}

pub struct EntryPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl EntryPool {
    /// Spawns one worker per CPU in `eligible` and hooks the pool into `gate`.
    pub fn start(gate: Arc<WorldGate>, num_cpus: u32, eligible: CpuMask) -> Result<Self, IwError> {
        let eligible = eligible.intersect(CpuMask::first(num_cpus));
        let shared = Arc::new(PoolShared {
            gate: gate.clone(),
            eligible,
            slots: (0..num_cpus).map(|_| Slot::new()).collect(),
            pending: AtomicU32::new(0),
            requested: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            fast_path: AtomicU64::new(0),
            pooled: AtomicU64::new(0),
            requested_entries: AtomicU64::new(0),
        });
        let observer = Arc::downgrade(&shared);
        let observer: Weak<dyn ReturnObserver> = observer;
        gate.add_observer(observer);

        let pool = Self {
            shared,
            workers: Mutex::new((0..num_cpus).map(|_| None).collect()),
        };
        for cpu in eligible.iter() {
            if let Err(e) = pool.spawn(cpu) {
                pool.shutdown();
                return Err(e);
            }
        }
        Ok(pool)
    }

    fn spawn(&self, cpu: CpuId) -> Result<(), IwError> {
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("iwc-entry/{}", cpu.0))
            .spawn(move || shared.run_worker(cpu))
            .map_err(|_| IwError::ResourceExhausted("entry worker thread"))?;
        if let Some(slot) = self.workers.lock().get_mut(cpu.0 as usize) {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Asks for the secure side to run.
    ///
    /// Enters directly when the calling thread is on an eligible, online CPU
    /// and not already inside a direct entry; otherwise hands the request to
    /// the workers.
    pub fn enter_swd(&self) {
        let shared = &self.shared;
        if shared.stopping.load(Ordering::Acquire) {
            return;
        }
        let cpu = cpu::current();
        let direct_ok = shared.eligible.contains(cpu)
            && DIRECT_ENTRY.with(Cell::get).is_none()
            && shared.slot(cpu).is_some_and(|slot| !slot.is_parked());

        if !direct_ok {
            shared.pending.fetch_add(1, Ordering::AcqRel);
            shared.kick();
            return;
        }

        DIRECT_ENTRY.with(|d| d.set(Some(cpu)));
        shared.fast_path.fetch_add(1, Ordering::Relaxed);
        shared.enter(cpu);
        while !shared.stopping.load(Ordering::Acquire) && shared.take_requested(cpu) {
            shared.requested_entries.fetch_add(1, Ordering::Relaxed);
            shared.enter(cpu);
        }
        DIRECT_ENTRY.with(|d| d.set(None));
    }

    /// Asks for entries on specific CPUs, as the secure side does.
    pub fn request_cpus(&self, mask: CpuMask) {
        let reply = SmcResponse {
            reenter: mask,
            ..SmcResponse::default()
        };
        self.shared.on_return(cpu::current(), &reply);
    }

    /// Quiesces the worker of `cpu`. Work requested for it moves to the pool.
    pub fn cpu_down(&self, cpu: CpuId) {
        let Some(slot) = self.shared.slot(cpu) else {
            return;
        };
        {
            let mut state = slot.state.lock();
            if *state == SlotState::Stopping {
                return;
            }
            *state = SlotState::Parked;
        }
        tracing::debug!(cpu = cpu.0, "entry worker parked");
        if self.shared.take_requested(cpu) {
            self.shared.pending.fetch_add(1, Ordering::AcqRel);
            self.shared.kick();
        }
    }

    /// Brings the worker of `cpu` back, creating it if it never existed.
    pub fn cpu_up(&self, cpu: CpuId) -> Result<(), IwError> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(IwError::SubsystemDown);
        }
        if !self.shared.eligible.contains(cpu) {
            return Err(IwError::InvalidArgument("cpu does not accept secure entries"));
        }
        let Some(slot) = self.shared.slot(cpu) else {
            return Err(IwError::InvalidArgument("no such cpu"));
        };
        {
            let mut state = slot.state.lock();
            if *state == SlotState::Parked {
                *state = SlotState::Scheduled;
                slot.cv.notify_one();
            }
        }
        let missing = self
            .workers
            .lock()
            .get(cpu.0 as usize)
            .is_some_and(Option::is_none);
        if missing {
            self.spawn(cpu)?;
        }
        tracing::debug!(cpu = cpu.0, "entry worker online");
        Ok(())
    }

    /// Stops and joins every worker. Later `enter_swd` calls do nothing.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.shared.slots {
            *slot.state.lock() = SlotState::Stopping;
            slot.cv.notify_all();
        }
        let handles: Vec<JoinHandle<()>> = self.workers.lock().iter_mut().filter_map(Option::take).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("entry worker panicked");
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            fast_path: self.shared.fast_path.load(Ordering::Relaxed),
            pooled: self.shared.pooled.load(Ordering::Relaxed),
            requested: self.shared.requested_entries.load(Ordering::Relaxed),
        }
    }

    /// Unserved unspecific requests.
    pub fn pending(&self) -> u32 {
        self.shared.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn eligible(&self) -> CpuMask {
        self.shared.eligible
    }
}

impl Drop for EntryPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EntryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPool")
            .field("eligible", &self.shared.eligible)
            .field("pending", &self.pending())
            .field("stats", &self.stats())
            .finish()
    }
}
