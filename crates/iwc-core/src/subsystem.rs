//! Bring-up and teardown of the whole subsystem.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::channel::ChannelAllocator;
use crate::config::IwConfig;
use crate::cpu;
use crate::error::IwError;
use crate::page::FrameTable;
use crate::sched::EntryPool;
use crate::shmem::Registrar;
use crate::smc::{SecureMonitor, WorldGate};
use crate::socket::{Socket, SocketLayer};
use crate::state::SubsystemState;

/// Owns every component. Dropping it shuts the subsystem down.
pub struct Subsystem {
    state: Arc<SubsystemState>,
    config: IwConfig,
    gate: Arc<WorldGate>,
    channels: Arc<ChannelAllocator>,
    pool: Arc<EntryPool>,
    sockets: SocketLayer,
    registrar: Registrar,
    stopped: AtomicBool,
}

impl Subsystem {
    /// Starts the entry pool, publishes the event channel and goes READY.
    pub fn start(
        config: IwConfig,
        monitor: Arc<dyn SecureMonitor>,
        frames: Arc<FrameTable>,
    ) -> Result<Self, IwError> {
        config.validate()?;
        cpu::set_cpu_count(config.num_cpus);

        let state = Arc::new(SubsystemState::new());
        let gate = Arc::new(WorldGate::new(monitor, config.num_cpus, config.burst_pfns));
        let channels = Arc::new(ChannelAllocator::new(gate.clone(), frames));
        let pool = Arc::new(EntryPool::start(
            gate.clone(),
            config.num_cpus,
            config.eligible_cpus(),
        )?);
        let registrar = Registrar::new(state.clone(), gate.clone(), pool.clone(), config.max_regions);
        let sockets = match SocketLayer::start(
            state.clone(),
            &config,
            &gate,
            channels.clone(),
            pool.clone(),
        ) {
            Ok(sockets) => sockets,
            Err(e) => {
                tracing::error!(error = %e, "socket layer failed to start");
                pool.shutdown();
                return Err(e);
            }
        };

        let subsystem = Self {
            state,
            config,
            gate,
            channels,
            pool,
            sockets,
            registrar,
            stopped: AtomicBool::new(false),
        };
        if !subsystem.state.mark_ready() {
            return Err(IwError::SubsystemDown);
        }
        tracing::info!(
            cpus = subsystem.config.num_cpus,
            eligible = ?subsystem.config.eligible_cpus(),
            "inter-world communication ready"
        );
        Ok(subsystem)
    }

    pub fn socket(&self) -> Result<Socket, IwError> {
        self.sockets.socket()
    }

    #[inline]
    pub fn sockets(&self) -> &SocketLayer {
        &self.sockets
    }

    #[inline]
    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    #[inline]
    pub fn pool(&self) -> &Arc<EntryPool> {
        &self.pool
    }

    #[inline]
    pub fn channels(&self) -> &Arc<ChannelAllocator> {
        &self.channels
    }

    #[inline]
    pub fn gate(&self) -> &Arc<WorldGate> {
        &self.gate
    }

    #[inline]
    pub fn state(&self) -> &Arc<SubsystemState> {
        &self.state
    }

    #[inline]
    pub fn config(&self) -> &IwConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Leaves READY for good and wakes every waiter, then stops the workers.
    ///
    /// Blocked socket calls return `ConnectionRefused` or `ConnectionReset`;
    /// pending releases return `SubsystemDown`.
    pub fn shutdown(&self) {
        self.state.release();
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!("inter-world communication shutting down");
        self.registrar.wake_all();
        self.sockets.shutdown();
        self.pool.shutdown();
    }

    /// The secure side is gone: reclaim every memory region without
    /// waiting for it. Returns how many regions were reclaimed.
    pub fn panic(&self) -> usize {
        self.state.release();
        tracing::error!("secure world panicked, reclaiming shared memory");
        self.sockets.wake_all();
        self.registrar.wake_all();
        self.registrar.reclaim_all()
    }
}

impl Drop for Subsystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subsystem")
            .field("phase", &self.state.phase())
            .field("sockets", &self.sockets)
            .field("registrar", &self.registrar)
            .finish_non_exhaustive()
    }
}
