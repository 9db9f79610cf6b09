//! Secure-side view of registered memory.

use std::collections::{HashMap, VecDeque};

use iwc_core::{Credential, FrameTable, IwError, MemFlags, Pfn};

#[derive(Debug, Clone)]
pub struct SimRegion {
    pub pfns: Vec<Pfn>,
    pub flags: MemFlags,
    pub owner: Credential,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryBroker {
    regions: HashMap<u32, SimRegion>,
    /// Released by the NW, not yet let go of.
    deferring: Vec<u32>,
    /// Let go of, waiting for FetchReleased.
    released: VecDeque<u32>,
}

impl MemoryBroker {
    pub(crate) fn register(
        &mut self,
        frames: &FrameTable,
        tag: u64,
        prefix: &[u8],
        pfns: Vec<Pfn>,
    ) -> Result<u32, IwError> {
        let handle = tag as u32;
        let flags = MemFlags::from_bits_truncate((tag >> 32) as u32);
        let owner: &[u8; Credential::WIRE_SIZE] = prefix
            .try_into()
            .map_err(|_| IwError::InvalidArgument("registration without credential"))?;
        if handle == 0 || self.regions.contains_key(&handle) || self.deferring.contains(&handle) {
            return Err(IwError::InvalidArgument("handle already registered"));
        }
        if pfns.iter().any(|pfn| frames.resolve(*pfn).is_none()) {
            return Err(IwError::InvalidArgument("dead frame in registration"));
        }
        self.regions.insert(
            handle,
            SimRegion {
                pfns,
                flags,
                owner: Credential::from_bytes(owner),
            },
        );
        Ok(handle)
    }

    /// Returns whether the handle was let go of at once.
    pub(crate) fn release(&mut self, handle: u32, defer: bool) -> Result<bool, IwError> {
        if self.regions.remove(&handle).is_none() {
            return Err(IwError::NotFound);
        }
        if defer {
            self.deferring.push(handle);
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Lets go of the deferred handles once `batch` of them have piled up.
    pub(crate) fn settle(&mut self, batch: usize) {
        if !self.deferring.is_empty() && self.deferring.len() >= batch {
            tracing::debug!(handles = self.deferring.len(), "releasing deferred batch");
            self.released.extend(self.deferring.drain(..));
        }
    }

    pub(crate) fn has_released(&self) -> bool {
        !self.released.is_empty()
    }

    /// Takes up to `max` released handles. Also returns how many remain.
    pub(crate) fn fetch(&mut self, max: usize) -> (Vec<u32>, usize) {
        let take = max.min(self.released.len());
        let handles: Vec<u32> = self.released.drain(..take).collect();
        (handles, self.released.len())
    }

    pub(crate) fn region(&self, handle: u32) -> Option<&SimRegion> {
        self.regions.get(&handle)
    }

    pub(crate) fn live(&self) -> usize {
        self.regions.len()
    }

    pub(crate) fn deferred(&self) -> usize {
        self.deferring.len()
    }
}
