//! Global "communication subsystem is up" state machine.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::IwError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubsystemPhase {
    NotInitialized = 0,
    Ready = 1,
    /// Terminal. Set once on shutdown or fatal secure-side failure.
    Released = 2,
}

/// `NotInitialized → Ready → Released`, never backwards.
#[derive(Debug)]
pub struct SubsystemState {
    phase: AtomicU8,
}

impl SubsystemState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(SubsystemPhase::NotInitialized as u8),
        }
    }

    pub fn phase(&self) -> SubsystemPhase {
        match self.phase.load(Ordering::Acquire) {
            0 => SubsystemPhase::NotInitialized,
            1 => SubsystemPhase::Ready,
            _ => SubsystemPhase::Released,
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.phase() == SubsystemPhase::Ready
    }

    /// Gate at the top of every public entry point.
    #[inline]
    pub fn check_ready(&self) -> Result<(), IwError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(IwError::SubsystemDown)
        }
    }

    /// Returns false if the subsystem was already released.
    pub fn mark_ready(&self) -> bool {
        self.phase
            .compare_exchange(
                SubsystemPhase::NotInitialized as u8,
                SubsystemPhase::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves to `Released`. Returns true for the caller that made the transition.
    pub fn release(&self) -> bool {
        self.phase.swap(SubsystemPhase::Released as u8, Ordering::AcqRel)
            != SubsystemPhase::Released as u8
    }
}

impl Default for SubsystemState {
    fn default() -> Self {
        Self::new()
    }
}
