//! Subsystem configuration.

use crate::cpu::{CpuMask, MAX_CPUS};
use crate::error::IwError;
use crate::page::PAGE_SIZE;
use crate::staging::MAX_BURST_PFNS;

/// Default out-of-band ring size for connected sockets.
pub const DEFAULT_OOB_BUFFER_SIZE: u32 = 128;
/// 0 means "no per-message limit".
pub const DEFAULT_MAX_MSG_SIZE: u32 = 0;
/// Size of the NW-private ring carrying ids of sockets whose secure side had already closed.
pub const INTERNAL_EVENTS_BUF_SIZE: u32 = 512;

/// Configuration for starting the subsystem.
#[derive(Debug, Clone)]
pub struct IwConfig {
    /// Number of CPUs; one entry-pool worker each.
    pub num_cpus: u32,
    /// CPUs the secure side accepts entries from.
    pub swd_affinity: CpuMask,
    /// Frame numbers per staging burst.
    pub burst_pfns: usize,
    /// Pages backing the two cross-world event rings.
    pub events_pages: usize,
    pub max_sockets: u32,
    pub max_regions: u32,
    pub default_oob_size: u32,
    pub default_max_msg_size: u32,
    /// Largest ring a peer's connection request may ask for.
    pub max_peer_buffer_size: u32,
    pub internal_events_size: u32,
}

impl Default for IwConfig {
    fn default() -> Self {
        Self {
            num_cpus: 4,
            swd_affinity: CpuMask::first(MAX_CPUS),
            burst_pfns: MAX_BURST_PFNS,
            events_pages: 1,
            max_sockets: 1024,
            max_regions: 1024,
            default_oob_size: DEFAULT_OOB_BUFFER_SIZE,
            default_max_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_peer_buffer_size: 256 * PAGE_SIZE as u32,
            internal_events_size: INTERNAL_EVENTS_BUF_SIZE,
        }
    }
}

impl IwConfig {
    /// Defaults overridden by `IWC_NUM_CPUS`, `IWC_SWD_AFFINITY` (hex mask),
    /// `IWC_BURST_PFNS`, `IWC_MAX_SOCKETS` and `IWC_MAX_REGIONS`.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            let raw = std::env::var(name).ok()?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(var = name, value = %raw, "ignoring unparsable setting");
                    None
                }
            }
        }

        let mut config = Self::default();
        if let Some(n) = var("IWC_NUM_CPUS") {
            config.num_cpus = n;
        }
        if let Ok(raw) = std::env::var("IWC_SWD_AFFINITY") {
            let digits = raw.trim().trim_start_matches("0x");
            match u64::from_str_radix(digits, 16) {
                Ok(mask) => config.swd_affinity = CpuMask(mask),
                Err(_) => tracing::warn!(value = %raw, "ignoring unparsable IWC_SWD_AFFINITY"),
            }
        }
        if let Some(n) = var("IWC_BURST_PFNS") {
            config.burst_pfns = n;
        }
        if let Some(n) = var("IWC_MAX_SOCKETS") {
            config.max_sockets = n;
        }
        if let Some(n) = var("IWC_MAX_REGIONS") {
            config.max_regions = n;
        }
        config
    }

    pub fn with_cpus(mut self, num_cpus: u32) -> Self {
        self.num_cpus = num_cpus;
        self
    }

    pub fn with_swd_affinity(mut self, mask: CpuMask) -> Self {
        self.swd_affinity = mask;
        self
    }

    pub fn with_burst_pfns(mut self, burst_pfns: usize) -> Self {
        self.burst_pfns = burst_pfns;
        self
    }

    pub fn with_max_sockets(mut self, max: u32) -> Self {
        self.max_sockets = max;
        self
    }

    pub fn with_max_regions(mut self, max: u32) -> Self {
        self.max_regions = max;
        self
    }

    /// CPUs that may enter the secure side.
    pub fn eligible_cpus(&self) -> CpuMask {
        CpuMask::first(self.num_cpus).intersect(self.swd_affinity)
    }

    pub fn validate(&self) -> Result<(), IwError> {
        if self.num_cpus == 0 || self.num_cpus > MAX_CPUS {
            return Err(IwError::InvalidArgument("num_cpus must be in 1..=64"));
        }
        if self.eligible_cpus().is_empty() {
            return Err(IwError::InvalidArgument("swd_affinity excludes every CPU"));
        }
        if self.burst_pfns == 0 || self.burst_pfns > MAX_BURST_PFNS {
            return Err(IwError::InvalidArgument("burst_pfns out of range"));
        }
        if self.events_pages == 0 {
            return Err(IwError::InvalidArgument("events_pages must be non-zero"));
        }
        if self.max_sockets == 0 || self.max_regions == 0 {
            return Err(IwError::InvalidArgument("id tables must have room"));
        }
        if self.internal_events_size < 4 {
            return Err(IwError::InvalidArgument("internal events ring too small"));
        }
        Ok(())
    }
}
