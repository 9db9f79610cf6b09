//! Per-CPU staging pages.
//!
//! Each CPU owns one page through which short variable-length payloads cross
//! the boundary inside a single world-switch call. Two layouts are used:
//!
//! ```text
//! frame burst:   ┌────────────┬───────┬───────────────────┬──────────────┐
//!                │ prefix_len │ count │ prefix (pad to 8) │ pfn[count]   │
//!                │ u32        │ u32   │                   │ u64 each     │
//!                └────────────┴───────┴───────────────────┴──────────────┘
//! handle list:   ┌───────┬─────┬─────────────────┐
//!                │ count │ pad │ handle[count]   │
//!                │ u32   │ u32 │ u32 each        │
//!                └───────┴─────┴─────────────────┘
//! ```
//!
//! All words are little-endian.

use iwc_ring::{HeapRegion, SharedRegion, round_up};
use parking_lot::{Mutex, MutexGuard};

use crate::cpu::CpuId;
use crate::error::{IwError, ProtocolError};
use crate::page::{PAGE_SIZE, Pfn};

const HEADER_SIZE: usize = 8;

/// Frame numbers per burst when there is no prefix.
pub const MAX_BURST_PFNS: usize = (PAGE_SIZE - HEADER_SIZE) / 8;
/// Handles per fetched list.
pub const MAX_STAGED_HANDLES: usize = (PAGE_SIZE - HEADER_SIZE) / 4;

/// One decoded frame burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Burst {
    pub prefix: Vec<u8>,
    pub pfns: Vec<Pfn>,
}

pub struct StagingPage {
    mem: HeapRegion,
}

impl StagingPage {
    pub fn new() -> Self {
        Self {
            mem: HeapRegion::new_zeroed_aligned(PAGE_SIZE, PAGE_SIZE),
        }
    }

    #[inline]
    pub fn region(&self) -> SharedRegion {
        self.mem.region()
    }

    pub fn clear(&mut self) {
        self.region().zero(0, PAGE_SIZE);
    }

    /// Frame numbers that fit next to a prefix of `prefix_len` bytes.
    pub fn burst_capacity(prefix_len: usize) -> usize {
        PAGE_SIZE.saturating_sub(HEADER_SIZE + round_up(prefix_len, 8)) / 8
    }

    /// Stages `prefix` and as many of `pfns` as fit. Returns how many were staged.
    pub fn write_burst(&mut self, prefix: &[u8], pfns: &[Pfn]) -> Result<usize, IwError> {
        if prefix.len() > PAGE_SIZE - HEADER_SIZE {
            return Err(IwError::InvalidArgument("burst prefix larger than the staging page"));
        }
        let count = pfns.len().min(Self::burst_capacity(prefix.len()));
        let region = self.region();
        region.write_u32(0, prefix.len() as u32);
        region.write_u32(4, count as u32);
        region.copy_in(HEADER_SIZE, prefix);
        let mut off = HEADER_SIZE + round_up(prefix.len(), 8);
        for pfn in &pfns[..count] {
            region.copy_in(off, &pfn.0.to_le_bytes());
            off += 8;
        }
        Ok(count)
    }

    pub fn read_burst(&self) -> Result<Burst, IwError> {
        let region = self.region();
        let prefix_len = region.read_u32(0) as usize;
        let count = region.read_u32(4) as usize;
        if prefix_len > PAGE_SIZE - HEADER_SIZE || count > Self::burst_capacity(prefix_len) {
            return Err(ProtocolError::MalformedRecord.into());
        }
        let mut prefix = vec![0u8; prefix_len];
        region.copy_out(HEADER_SIZE, &mut prefix);
        let mut off = HEADER_SIZE + round_up(prefix_len, 8);
        let mut pfns = Vec::with_capacity(count);
        for _ in 0..count {
            let mut raw = [0u8; 8];
            region.copy_out(off, &mut raw);
            pfns.push(Pfn(u64::from_le_bytes(raw)));
            off += 8;
        }
        Ok(Burst { prefix, pfns })
    }

    /// Stages as many handles as fit. Returns how many were staged.
    pub fn write_handles(&mut self, handles: &[u32]) -> usize {
        let count = handles.len().min(MAX_STAGED_HANDLES);
        let region = self.region();
        region.write_u32(0, count as u32);
        region.write_u32(4, 0);
        for (i, handle) in handles[..count].iter().enumerate() {
            region.write_u32(HEADER_SIZE + i * 4, *handle);
        }
        count
    }

    pub fn read_handles(&self) -> Result<Vec<u32>, IwError> {
        let region = self.region();
        let count = region.read_u32(0) as usize;
        if count > MAX_STAGED_HANDLES {
            return Err(ProtocolError::MalformedRecord.into());
        }
        Ok((0..count)
            .map(|i| region.read_u32(HEADER_SIZE + i * 4))
            .collect())
    }
}

impl Default for StagingPage {
    fn default() -> Self {
        Self::new()
    }
}

/// One staging page per CPU; holding a page's guard makes you its only publisher.
pub struct StagingArea {
    pages: Vec<Mutex<StagingPage>>,
}

impl StagingArea {
    pub fn new(num_cpus: u32) -> Self {
        Self {
            pages: (0..num_cpus).map(|_| Mutex::new(StagingPage::new())).collect(),
        }
    }

    pub fn get(&self, cpu: CpuId) -> Result<MutexGuard<'_, StagingPage>, IwError> {
        self.pages
            .get(cpu.0 as usize)
            .map(|page| page.lock())
            .ok_or(IwError::InvalidArgument("no staging page for cpu"))
    }

    pub fn num_cpus(&self) -> usize {
        self.pages.len()
    }
}
