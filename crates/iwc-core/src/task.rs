//! The calling context of an operation.
//!
//! A [`TaskContext`] stands for whoever is calling into the subsystem: the
//! kernel itself, or a thread of some user process. It decides how blocking
//! waits behave and what identity is stamped on outgoing data.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::wait::Signal;

/// Identity of an address space. Never reused within one boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(pub u64);

impl AddressSpaceId {
    pub const KERNEL: AddressSpaceId = AddressSpaceId(0);

    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        AddressSpaceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Privileged/internal caller: uninterruptible waits, kernel copies.
    Kernel,
    /// User-driven caller: interruptible waits.
    User,
}

/// Process identity sent to the secure side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credential {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Credential {
    pub const WIRE_SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.pid.to_le_bytes());
        out[4..8].copy_from_slice(&self.uid.to_le_bytes());
        out[8..12].copy_from_slice(&self.gid.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; Self::WIRE_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            pid: word(0),
            uid: word(4),
            gid: word(8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskContext {
    kind: TaskKind,
    credential: Credential,
    address_space: AddressSpaceId,
    signal: Signal,
}

impl TaskContext {
    pub fn kernel() -> Self {
        Self {
            kind: TaskKind::Kernel,
            credential: Credential::default(),
            address_space: AddressSpaceId::KERNEL,
            signal: Signal::new(),
        }
    }

    /// A new user process with its own address space.
    pub fn user(pid: u32, uid: u32, gid: u32) -> Self {
        Self {
            kind: TaskKind::User,
            credential: Credential { pid, uid, gid },
            address_space: AddressSpaceId::fresh(),
            signal: Signal::new(),
        }
    }

    /// Another thread of the same process: same address space, own signal.
    pub fn sibling_thread(&self) -> Self {
        Self {
            signal: Signal::new(),
            ..self.clone()
        }
    }

    #[inline]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    #[inline]
    pub fn is_kernel(&self) -> bool {
        self.kind == TaskKind::Kernel
    }

    #[inline]
    pub fn credential(&self) -> Credential {
        self.credential
    }

    #[inline]
    pub fn address_space(&self) -> AddressSpaceId {
        self.address_space
    }

    #[inline]
    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_wire_form() {
        let cred = Credential {
            pid: 42,
            uid: 1000,
            gid: 7,
        };
        assert_eq!(Credential::from_bytes(&cred.to_bytes()), cred);
        assert_eq!(&cred.to_bytes()[..4], &42u32.to_le_bytes());
    }

    #[test]
    fn user_tasks_get_distinct_address_spaces() {
        let a = TaskContext::user(10, 0, 0);
        let b = TaskContext::user(10, 0, 0);
        assert_ne!(a.address_space(), b.address_space());
        assert_eq!(a.sibling_thread().address_space(), a.address_space());
        assert!(TaskContext::kernel().is_kernel());
    }
}
