//! Logical CPU identities.
//!
//! The secure side reasons about which CPU entered it. Worker threads are
//! bound to their CPU for life; any other thread is assigned one on first
//! use, round-robin, and keeps it.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Largest CPU count a [`CpuMask`] can describe.
pub const MAX_CPUS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Set of CPUs, one bit per CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CpuMask(pub u64);

#[inline]
fn bit(cpu: CpuId) -> u64 {
    1u64.checked_shl(cpu.0).unwrap_or(0)
}

impl CpuMask {
    pub const EMPTY: CpuMask = CpuMask(0);

    /// The first `n` CPUs.
    pub fn first(n: u32) -> Self {
        if n >= MAX_CPUS {
            CpuMask(u64::MAX)
        } else {
            CpuMask((1u64 << n) - 1)
        }
    }

    /// Empty for a CPU past [`MAX_CPUS`].
    pub fn single(cpu: CpuId) -> Self {
        CpuMask(bit(cpu))
    }

    #[inline]
    pub fn contains(self, cpu: CpuId) -> bool {
        self.0 & bit(cpu) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn with(self, cpu: CpuId) -> Self {
        CpuMask(self.0 | bit(cpu))
    }

    #[inline]
    pub fn without(self, cpu: CpuId) -> Self {
        CpuMask(self.0 & !bit(cpu))
    }

    #[inline]
    pub fn intersect(self, other: CpuMask) -> Self {
        CpuMask(self.0 & other.0)
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS)
            .filter(move |i| self.0 & (1u64 << i) != 0)
            .map(CpuId)
    }
}

thread_local! {
    static CURRENT: Cell<Option<CpuId>> = const { Cell::new(None) };
}

static NEXT_CPU: AtomicU32 = AtomicU32::new(0);
static ONLINE_HINT: AtomicU32 = AtomicU32::new(1);

/// Tells the round-robin assignment how many CPUs exist.
pub(crate) fn set_cpu_count(n: u32) {
    ONLINE_HINT.store(n.clamp(1, MAX_CPUS), Ordering::Relaxed);
}

/// Pins the calling thread to `cpu`.
pub fn bind_current(cpu: CpuId) {
    CURRENT.with(|c| c.set(Some(cpu)));
}

/// The CPU the calling thread runs on.
pub fn current() -> CpuId {
    CURRENT.with(|c| match c.get() {
        Some(cpu) => cpu,
        None => {
            let n = ONLINE_HINT.load(Ordering::Relaxed);
            let cpu = CpuId(NEXT_CPU.fetch_add(1, Ordering::Relaxed) % n);
            c.set(Some(cpu));
            cpu
        }
    })
}
