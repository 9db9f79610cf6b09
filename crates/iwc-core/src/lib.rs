//! Normal-world half of the inter-world communication subsystem.
//!
//! Everything the secure side sees goes through page-backed channels named
//! by frame number. Control flows through one call primitive, the
//! [`smc::WorldGate`]; data flows through [`iwc_ring`] rings inside the
//! channels.
//!
//! # Pieces
//!
//! - [`channel::ChannelAllocator`]: page runs published to the secure side
//!   after their rings are laid out
//! - [`socket::SocketLayer`]: connection-oriented sockets with credential
//!   headers, event queues and a notification worker
//! - [`sched::EntryPool`]: one worker per CPU entering the secure side on
//!   request, with a direct path for eligible callers
//! - [`shmem::Registrar`]: memory regions registered by frame list and
//!   released through a possibly deferred handshake
//! - [`Subsystem`]: owns all of the above and the READY state they check
//!
//! The secure side itself is behind [`smc::SecureMonitor`]; `iwc-testkit`
//! provides an in-process one.

pub mod arena;
pub mod channel;
pub mod config;
pub mod cpu;
pub mod error;
pub mod page;
pub mod sched;
pub mod shmem;
pub mod smc;
pub mod socket;
pub mod staging;
pub mod state;
pub mod subsystem;
pub mod task;
pub mod wait;

pub use channel::{Channel, ChannelAllocator, ChannelPurpose};
pub use config::IwConfig;
pub use cpu::{CpuId, CpuMask};
pub use error::{IwError, ProtocolError};
pub use page::{FrameTable, PAGE_SIZE, PageList, PageOrigin, Pfn};
pub use sched::{EntryPool, PoolStats};
pub use shmem::{MemFlags, MemHandle, Registrar, ReleaseCallback};
pub use smc::{
    BurstFlags, ReplyFlags, ReturnObserver, SecureMonitor, SmcCode, SmcRequest, SmcResponse,
    WorldGate,
};
pub use socket::{MsgFlags, SockOpt, Socket, SocketLayer, SocketState};
pub use staging::StagingPage;
pub use state::{SubsystemPhase, SubsystemState};
pub use subsystem::Subsystem;
pub use task::{AddressSpaceId, Credential, TaskContext, TaskKind};
pub use wait::{Signal, WaitQueue};
