//! Connection-oriented sockets between the two worlds.
//!
//! Each connected socket owns one channel holding a [`layout::SockBufHead`]
//! and its rings. Data never crosses worlds any other way; the shared event
//! rings only say which socket to look at.
//!
//! State machine per socket:
//!
//! ```text
//! NEW ──connect──▶ CONNECTING ──peer accepts──▶ CONNECTED
//!  │
//!  └──listen───▶ LISTENING
//!
//! any ──release──▶ RELEASED
//! ```
//!
//! A released socket stays in the registry until the secure side has closed
//! its half too; the notification worker then unpublishes it.

pub mod layout;
mod events;

use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;

use bitflags::bitflags;
use iwc_ring::{CircBuf, CircBufRaw, RingError, SharedRegion, Sink, Source, size_for_packet};
use parking_lot::Mutex;

use crate::arena::IdArena;
use crate::channel::{Channel, ChannelAllocator, ChannelPurpose};
use crate::config::IwConfig;
use crate::cpu::CpuId;
use crate::error::{IwError, ProtocolError};
use crate::sched::EntryPool;
use crate::smc::{ReturnObserver, SmcResponse, WorldGate};
use crate::state::SubsystemState;
use crate::task::{AddressSpaceId, Credential, TaskContext};
use crate::wait::WaitQueue;

use self::events::EventQueues;
use self::layout::{
    BufState, CRED_HEADER_SIZE, ChannelLayout, ConnectRequest, DEFAULT_TRANSMIT_BUFFER_SIZE,
    Handshake, HandshakeOp, HandshakeTarget, MAX_NAME_LEN, SockBufHead, decode_cred_header,
    encode_cred_header, ring_size_for_payload,
};

bitflags! {
    /// Per-call flags of send, recv, connect and accept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        /// Use the out-of-band ring.
        const OOB = 0x1;
        /// Fail with `WouldBlock` (or `InProgress` for connect) instead of sleeping.
        const DONTWAIT = 0x40;
    }
}

/// Socket options. All of them are frozen once the socket leaves NEW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SockOpt {
    SndBuf = 7,
    RcvBuf = 8,
    OobBuf = 0x1001,
    MaxMsgSize = 0x1002,
}

impl SockOpt {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            7 => Some(Self::SndBuf),
            8 => Some(Self::RcvBuf),
            0x1001 => Some(Self::OobBuf),
            0x1002 => Some(Self::MaxMsgSize),
            _ => None,
        }
    }
}

impl From<SockOpt> for u32 {
    fn from(opt: SockOpt) -> Self {
        opt as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    New,
    Connecting,
    Connected,
    Listening,
    Released,
}

/// Ring capacities and the message limit.
#[derive(Debug, Clone, Copy)]
struct SockOptions {
    snd: u32,
    rcv: u32,
    /// 0 means no oob ring.
    oob: u32,
    /// 0 means unlimited.
    max_msg: u32,
}

impl SockOptions {
    fn defaults(config: &IwConfig) -> Self {
        Self {
            snd: DEFAULT_TRANSMIT_BUFFER_SIZE,
            rcv: DEFAULT_TRANSMIT_BUFFER_SIZE,
            oob: config.default_oob_size,
            max_msg: config.default_max_msg_size,
        }
    }
}

/// This side's descriptors of a channel's rings.
struct Rings {
    send: CircBuf,
    recv: CircBuf,
    oob: Option<CircBuf>,
}

struct SockInner {
    state: SocketState,
    opts: SockOptions,
    channel: Option<Channel>,
    rings: Option<Rings>,
    /// Credential header stamped for the last calling address space.
    cred: Option<(AddressSpaceId, [u8; CRED_HEADER_SIZE as usize])>,
    name: Option<String>,
}

struct SockDesc {
    id: u32,
    inner: Mutex<SockInner>,
    /// Window of the channel, set once when the channel is published.
    head: OnceLock<SharedRegion>,
    released: AtomicBool,
    wq: WaitQueue,
    channels: Arc<ChannelAllocator>,
}

impl SockDesc {
    fn new(id: u32, opts: SockOptions, channels: Arc<ChannelAllocator>) -> Self {
        Self {
            id,
            inner: Mutex::new(SockInner {
                state: SocketState::New,
                opts,
                channel: None,
                rings: None,
                cred: None,
                name: None,
            }),
            head: OnceLock::new(),
            released: AtomicBool::new(false),
            wq: WaitQueue::new(),
            channels,
        }
    }

    fn head(&self) -> Option<&SockBufHead> {
        // SAFETY: the channel stays mapped until this descriptor drops, and
        // the head is all atomics.
        self.head
            .get()
            .map(|region| unsafe { region.atomics::<SockBufHead>(0) })
    }

    fn swd_state(&self) -> Option<BufState> {
        self.head().map(SockBufHead::swd_state)
    }

    /// Lays out a channel for `layout`, writes `handshake` into its send
    /// ring and publishes it.
    fn open_channel(
        &self,
        layout: ChannelLayout,
        handshake: &Handshake,
    ) -> Result<(Channel, Rings), IwError> {
        self.channels
            .allocate(ChannelPurpose::Socket, layout.page_count(), |region| {
                // SAFETY: nothing else sees these pages until publication.
                unsafe {
                    region.init(0, SockBufHead::new(BufState::Connected, BufState::New));
                }
                let mut send =
                    CircBuf::new(unsafe { CircBufRaw::init(region, layout.send_offset(), layout.snd) });
                let recv =
                    CircBuf::new(unsafe { CircBufRaw::init(region, layout.recv_offset(), layout.rcv) });
                let oob = layout
                    .oob
                    .map(|cap| CircBuf::new(unsafe { CircBufRaw::init(region, layout.oob_offset(), cap) }));
                handshake.write_to(&mut send)?;
                Ok(Rings { send, recv, oob })
            })
    }

    fn attach(&self, inner: &mut SockInner, channel: Channel, rings: Rings) {
        // A socket is published at most once, so the head is never reset.
        let _ = self.head.set(channel.region());
        inner.channel = Some(channel);
        inner.rings = Some(rings);
    }
}

impl Drop for SockDesc {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.rings = None;
        if let Some(channel) = inner.channel.take() {
            self.channels.free(channel);
        }
    }
}

/// Registry and background state shared by every socket.
struct LayerShared {
    state: Arc<SubsystemState>,
    config: IwConfig,
    channels: Arc<ChannelAllocator>,
    pool: Arc<EntryPool>,
    sockets: Mutex<IdArena<Arc<SockDesc>>>,
    events: EventQueues,
    stopping: AtomicBool,
}

/// Whether a reader that left `free` bytes in its receive ring should tell
/// the secure side. A zero `max_msg` always does.
fn wants_room_notice(free: u32, max_msg: u32) -> bool {
    max_msg == 0 || u64::from(free) < 2 * u64::from(size_for_packet(max_msg))
}

impl LayerShared {
    fn new_socket(self: &Arc<Self>, opts: SockOptions) -> Result<Socket, IwError> {
        self.state.check_ready()?;
        let desc = {
            let mut sockets = self.sockets.lock();
            let id = sockets
                .insert_with(|id| Arc::new(SockDesc::new(id, opts, self.channels.clone())))
                .ok_or(IwError::ResourceExhausted("socket table"))?;
            sockets.get(id).cloned().ok_or(IwError::NotFound)?
        };
        tracing::debug!(socket_id = desc.id, "socket created");
        Ok(Socket {
            desc,
            layer: self.clone(),
        })
    }

    fn notify_swd(&self, id: u32) {
        self.events.notify_swd(id, &self.state, &self.pool);
    }

    /// Drops the registry's reference, if `desc` is still the one under its id.
    fn unpublish(&self, desc: &Arc<SockDesc>) {
        let removed = {
            let mut sockets = self.sockets.lock();
            match sockets.get(desc.id) {
                Some(current) if Arc::ptr_eq(current, desc) => sockets.remove(desc.id),
                _ => None,
            }
        };
        if removed.is_some() {
            tracing::debug!(socket_id = desc.id, "socket unpublished");
        }
        drop(removed);
    }

    fn handle_event(&self, id: u32) {
        let Some(desc) = self.sockets.lock().get(id).cloned() else {
            tracing::trace!(socket_id = id, "event for unknown socket");
            return;
        };
        let released = desc.released.load(Ordering::Acquire);
        if released && desc.swd_state() == Some(BufState::Closed) {
            self.unpublish(&desc);
        } else {
            tracing::trace!(socket_id = id, "socket event");
            desc.wq.wake_all();
        }
    }

    fn wake_all(&self) {
        self.events.wake_all();
        let descs: Vec<Arc<SockDesc>> = self.sockets.lock().iter().map(|(_, d)| d.clone()).collect();
        for desc in descs {
            desc.wq.wake_all();
        }
    }

    /// The events rings can no longer be trusted: take the subsystem down.
    fn fail(&self, error: &IwError) {
        tracing::error!(error = %error, "socket event queue failed, releasing subsystem");
        self.state.release();
        self.wake_all();
    }

    fn run_notifier(&self) {
        tracing::debug!("socket notification worker started");
        loop {
            self.events
                .notify_wq
                .wait(|| self.stopping.load(Ordering::Acquire) || self.events.has_events());
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            loop {
                match self.events.next_event() {
                    Ok(Some(event)) => {
                        if event.swd_was_full {
                            self.pool.enter_swd();
                        }
                        self.handle_event(event.id);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.fail(&e);
                        return;
                    }
                }
            }
        }
        tracing::debug!("socket notification worker stopped");
    }
}

impl ReturnObserver for LayerShared {
    fn on_return(&self, _cpu: CpuId, reply: &SmcResponse) {
        self.events.on_return(reply, &self.state);
    }
}

/// The socket registry, event queues and notification worker.
pub struct SocketLayer {
    shared: Arc<LayerShared>,
    notifier: Mutex<Option<JoinHandle<()>>>,
}

impl SocketLayer {
    /// Publishes the event channel and starts the notification worker.
    pub fn start(
        state: Arc<SubsystemState>,
        config: &IwConfig,
        gate: &WorldGate,
        channels: Arc<ChannelAllocator>,
        pool: Arc<EntryPool>,
    ) -> Result<Self, IwError> {
        let events = EventQueues::open(&channels, config)?;
        let shared = Arc::new(LayerShared {
            state,
            config: config.clone(),
            channels,
            pool,
            sockets: Mutex::new(IdArena::new(config.max_sockets)),
            events,
            stopping: AtomicBool::new(false),
        });
        let observer = Arc::downgrade(&shared);
        let observer: Weak<dyn ReturnObserver> = observer;
        gate.add_observer(observer);

        let worker = shared.clone();
        let notifier = std::thread::Builder::new()
            .name("iwc-sock-notify".into())
            .spawn(move || worker.run_notifier());
        let notifier = match notifier {
            Ok(handle) => handle,
            Err(_) => {
                shared.events.close(&shared.channels);
                return Err(IwError::ResourceExhausted("notification thread"));
            }
        };
        Ok(Self {
            shared,
            notifier: Mutex::new(Some(notifier)),
        })
    }

    pub fn socket(&self) -> Result<Socket, IwError> {
        self.shared.new_socket(SockOptions::defaults(&self.shared.config))
    }

    /// Sockets still in the registry, released ones awaiting the secure side included.
    pub fn live_sockets(&self) -> usize {
        self.shared.sockets.lock().len()
    }

    /// Wakes every socket waiter and the queues, so each re-checks its condition.
    pub fn wake_all(&self) {
        self.shared.wake_all();
    }

    /// Stops the notification worker, drops the registry and unpublishes
    /// the event channel.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.wake_all();
        if let Some(handle) = self.notifier.lock().take()
            && handle.join().is_err()
        {
            tracing::error!("socket notification worker panicked");
        }
        let drained = self.shared.sockets.lock().drain();
        if !drained.is_empty() {
            tracing::warn!(sockets = drained.len(), "dropping sockets at shutdown");
        }
        drop(drained);
        self.shared.events.close(&self.shared.channels);
    }
}

impl Drop for SocketLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SocketLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLayer")
            .field("live_sockets", &self.live_sockets())
            .finish_non_exhaustive()
    }
}

/// One end of a connection. Dropping it releases the socket.
pub struct Socket {
    desc: Arc<SockDesc>,
    layer: Arc<LayerShared>,
}

enum ReleaseFollowup {
    Unpublish,
    NotifySwd,
    NotifyInternally,
}

impl Socket {
    #[inline]
    pub fn id(&self) -> u32 {
        self.desc.id
    }

    pub fn state(&self) -> SocketState {
        self.desc.inner.lock().state
    }

    /// The name passed to `connect` or `listen`.
    pub fn name(&self) -> Option<String> {
        self.desc.inner.lock().name.clone()
    }

    fn check_name(name: &str) -> Result<(), IwError> {
        if name.is_empty() || name.contains('\0') {
            return Err(IwError::InvalidArgument("socket name"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(IwError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        Ok(())
    }

    /// Connects to the secure-side service `name`.
    ///
    /// With [`MsgFlags::DONTWAIT`] the handshake is published and
    /// `InProgress` returned unless the peer already answered; finish with
    /// [`Socket::wait_connection`].
    pub fn connect(&self, task: &TaskContext, name: &str, flags: MsgFlags) -> Result<(), IwError> {
        self.layer.state.check_ready()?;
        Self::check_name(name)?;
        {
            let mut inner = self.desc.inner.lock();
            match inner.state {
                SocketState::New => {}
                SocketState::Connecting => return Err(IwError::AlreadyInProgress),
                SocketState::Connected => return Err(IwError::AlreadyConnected),
                SocketState::Listening => return Err(IwError::BadState),
                SocketState::Released => return Err(IwError::ConnectionReset),
            }
            let opts = inner.opts;
            let layout = ChannelLayout::connected(opts.snd, opts.rcv, opts.oob);
            let handshake = Handshake {
                op: HandshakeOp::ConnectFromNwd,
                nwd_id: self.desc.id as i32,
                target: HandshakeTarget::Name(name.to_owned()),
                snd_size: opts.snd,
                rcv_size: opts.rcv,
                oob_size: Some(opts.oob),
            };
            let (channel, rings) = self.desc.open_channel(layout, &handshake)?;
            self.desc.attach(&mut inner, channel, rings);
            inner.name = Some(name.to_owned());
            inner.state = SocketState::Connecting;
            tracing::debug!(socket_id = self.desc.id, name, "socket connecting");

            if flags.contains(MsgFlags::DONTWAIT) {
                fence(Ordering::Acquire);
                if self.desc.swd_state() == Some(BufState::Connected) {
                    inner.state = SocketState::Connected;
                    return Ok(());
                }
                return Err(IwError::InProgress);
            }
        }
        self.wait_connection(task)
    }

    /// Blocks until a pending connect is accepted or refused.
    pub fn wait_connection(&self, task: &TaskContext) -> Result<(), IwError> {
        let desc = &self.desc;
        let state = &self.layer.state;
        desc.wq.wait_for(task, || {
            !state.is_ready()
                || desc.inner.lock().state != SocketState::Connecting
                || desc.swd_state() != Some(BufState::New)
        })?;

        let mut inner = desc.inner.lock();
        match inner.state {
            SocketState::Connected => Ok(()),
            SocketState::Released => Err(IwError::ConnectionReset),
            SocketState::New => Err(IwError::NotConnected),
            SocketState::Listening => Err(IwError::BadState),
            SocketState::Connecting => {
                if !state.is_ready() {
                    return Err(IwError::ConnectionRefused);
                }
                match desc.swd_state() {
                    Some(BufState::Connected) => {
                        inner.state = SocketState::Connected;
                        tracing::debug!(socket_id = desc.id, "socket connected");
                        Ok(())
                    }
                    _ => {
                        tracing::debug!(socket_id = desc.id, "connection refused");
                        Err(IwError::ConnectionRefused)
                    }
                }
            }
        }
    }

    /// Registers `name` with the secure side and starts taking connections.
    pub fn listen(&self, name: &str) -> Result<(), IwError> {
        self.layer.state.check_ready()?;
        Self::check_name(name)?;
        let mut inner = self.desc.inner.lock();
        match inner.state {
            SocketState::New => {}
            SocketState::Released => return Err(IwError::ConnectionReset),
            SocketState::Connected => return Err(IwError::AlreadyConnected),
            SocketState::Connecting | SocketState::Listening => return Err(IwError::BadState),
        }
        let layout = ChannelLayout::listener(DEFAULT_TRANSMIT_BUFFER_SIZE, DEFAULT_TRANSMIT_BUFFER_SIZE);
        let handshake = Handshake {
            op: HandshakeOp::NewNwdListen,
            nwd_id: self.desc.id as i32,
            target: HandshakeTarget::Name(name.to_owned()),
            snd_size: layout.snd,
            rcv_size: layout.rcv,
            oob_size: None,
        };
        let (channel, rings) = self.desc.open_channel(layout, &handshake)?;
        self.desc.attach(&mut inner, channel, rings);
        inner.name = Some(name.to_owned());
        inner.state = SocketState::Listening;
        tracing::debug!(socket_id = self.desc.id, name, "socket listening");
        Ok(())
    }

    fn try_take_request(&self) -> Result<ConnectRequest, IwError> {
        self.layer.state.check_ready()?;
        let mut inner = self.desc.inner.lock();
        match inner.state {
            SocketState::Listening => {}
            SocketState::Released => return Err(IwError::ConnectionReset),
            _ => return Err(IwError::BadState),
        }
        let swd_state = self.desc.swd_state();
        let rings = inner.rings.as_mut().ok_or(IwError::BadState)?;
        match ConnectRequest::read_from(&mut rings.recv)? {
            Some(request) => Ok(request),
            None if swd_state == Some(BufState::Closed) => Err(IwError::ConnectionReset),
            None => Err(IwError::WouldBlock),
        }
    }

    /// Takes the next connection request and builds its socket.
    ///
    /// A request that cannot be accepted is handed back to the secure side
    /// so its connector is not left waiting.
    pub fn accept(&self, task: &TaskContext, flags: MsgFlags) -> Result<Socket, IwError> {
        let mut outcome = Err(IwError::WouldBlock);
        if flags.contains(MsgFlags::DONTWAIT) {
            outcome = self.try_take_request();
        } else {
            self.desc.wq.wait_for(task, || {
                outcome = self.try_take_request();
                !matches!(outcome, Err(IwError::WouldBlock))
            })?;
        }
        let request = outcome?;

        match self.accept_request(&request) {
            Ok(socket) => {
                tracing::debug!(
                    socket_id = socket.id(),
                    listener = self.desc.id,
                    swd_id = request.swd_id,
                    "connection accepted"
                );
                Ok(socket)
            }
            Err(e) => {
                tracing::warn!(
                    listener = self.desc.id,
                    swd_id = request.swd_id,
                    error = %e,
                    "rejecting connection request"
                );
                {
                    let mut inner = self.desc.inner.lock();
                    if let Some(rings) = inner.rings.as_mut() {
                        self.write_back(&mut rings.send, request.swd_id);
                    }
                }
                self.layer.notify_swd(self.desc.id);
                Err(e)
            }
        }
    }

    fn accept_request(&self, request: &ConnectRequest) -> Result<Socket, IwError> {
        let max = self.layer.config.max_peer_buffer_size;
        let sizes = [
            request.snd_buf_size,
            request.rcv_buf_size,
            request.oob_buf_size,
            request.max_msg_size,
        ];
        if request.snd_buf_size == 0 || request.rcv_buf_size == 0 || sizes.iter().any(|s| *s > max) {
            return Err(ProtocolError::SizeMismatch.into());
        }

        let opts = SockOptions {
            snd: ring_size_for_payload(request.snd_buf_size),
            rcv: ring_size_for_payload(request.rcv_buf_size),
            oob: if request.oob_buf_size == 0 {
                0
            } else {
                ring_size_for_payload(request.oob_buf_size)
            },
            max_msg: request.max_msg_size,
        };
        let socket = self.layer.new_socket(opts)?;
        {
            let desc = &socket.desc;
            let mut inner = desc.inner.lock();
            let layout = ChannelLayout::connected(opts.snd, opts.rcv, opts.oob);
            let handshake = Handshake {
                op: HandshakeOp::AcceptFromNwd,
                nwd_id: desc.id as i32,
                target: HandshakeTarget::SwdId(request.swd_id),
                snd_size: opts.snd,
                rcv_size: opts.rcv,
                oob_size: Some(opts.oob),
            };
            let (channel, rings) = desc.open_channel(layout, &handshake)?;
            desc.attach(&mut inner, channel, rings);
            inner.name = self.desc.inner.lock().name.clone();
            inner.state = SocketState::Connected;
        }
        Ok(socket)
    }

    /// Hands `swd_id` back through a listener's send ring.
    fn write_back(&self, ring: &mut CircBuf, swd_id: i32) {
        let state = &self.layer.state;
        let pool = &self.layer.pool;
        self.desc.wq.wait(|| match ring.write(Source::Kernel(&swd_id.to_le_bytes())) {
            Ok(_) => true,
            Err(RingError::WouldBlock) if state.is_ready() => {
                pool.enter_swd();
                false
            }
            Err(e) => {
                tracing::warn!(socket_id = self.desc.id, swd_id, error = %e, "request write-back lost");
                true
            }
        });
    }

    fn cred_header(&self, task: &TaskContext) -> [u8; CRED_HEADER_SIZE as usize] {
        let mut inner = self.desc.inner.lock();
        match inner.cred {
            Some((space, header)) if space == task.address_space() => header,
            _ => {
                let header = encode_cred_header(&task.credential());
                inner.cred = Some((task.address_space(), header));
                header
            }
        }
    }

    fn try_send(
        &self,
        header: &[u8; CRED_HEADER_SIZE as usize],
        data: Source<'_>,
        flags: MsgFlags,
    ) -> Result<usize, IwError> {
        self.layer.state.check_ready()?;
        let mut inner = self.desc.inner.lock();
        match inner.state {
            SocketState::Connected => {}
            SocketState::Released => return Err(IwError::ConnectionReset),
            SocketState::Listening => return Err(IwError::BadState),
            SocketState::New | SocketState::Connecting => return Err(IwError::NotConnected),
        }
        let len = data.len();
        let max_msg = inner.opts.max_msg as usize;
        if max_msg > 0 && len > max_msg {
            return Err(IwError::MessageTooLarge { len, max: max_msg });
        }
        if self.desc.swd_state() == Some(BufState::Closed) {
            return Err(IwError::ConnectionReset);
        }

        let rings = inner.rings.as_mut().ok_or(IwError::NotConnected)?;
        let ring = if flags.contains(MsgFlags::OOB) {
            rings
                .oob
                .as_mut()
                .ok_or(IwError::InvalidArgument("socket has no out-of-band ring"))?
        } else {
            &mut rings.send
        };

        let overhead = size_for_packet(CRED_HEADER_SIZE) as usize + size_for_packet(0) as usize;
        let capacity = ring.capacity() as usize;
        if overhead + len > capacity {
            return Err(IwError::MessageTooLarge {
                len,
                max: capacity.saturating_sub(overhead),
            });
        }

        let mut txn = ring.write_txn();
        txn.write_packet(Source::Kernel(header))?;
        txn.write_packet(data)?;
        txn.commit();
        Ok(len)
    }

    /// Sends one message. Zero-length messages are delivered as such.
    pub fn send<'a>(
        &self,
        task: &TaskContext,
        data: impl Into<Source<'a>>,
        flags: MsgFlags,
    ) -> Result<usize, IwError> {
        let data = data.into();
        self.layer.state.check_ready()?;
        let header = self.cred_header(task);

        let mut outcome = Err(IwError::WouldBlock);
        if flags.contains(MsgFlags::DONTWAIT) {
            outcome = self.try_send(&header, data, flags);
        } else {
            self.desc.wq.wait_for(task, || {
                outcome = self.try_send(&header, data, flags);
                !matches!(outcome, Err(IwError::WouldBlock))
            })?;
        }
        let sent = outcome?;
        self.layer.notify_swd(self.desc.id);
        Ok(sent)
    }

    fn try_recv(&self, sink: Sink<'_>) -> Result<(usize, Option<Credential>, bool), IwError> {
        self.layer.state.check_ready()?;
        let mut inner = self.desc.inner.lock();
        match inner.state {
            SocketState::Connected => {}
            SocketState::Released => return Err(IwError::ConnectionReset),
            SocketState::Listening => return Err(IwError::BadState),
            SocketState::New | SocketState::Connecting => return Err(IwError::NotConnected),
        }
        let max_msg = inner.opts.max_msg;
        // Sampled before the ring so data published ahead of a close is not lost.
        let swd_state = self.desc.swd_state();
        let rings = inner.rings.as_mut().ok_or(IwError::NotConnected)?;

        let mut txn = rings.recv.read_txn();
        let mut raw = [0u8; CRED_HEADER_SIZE as usize];
        let raw_len = match txn.read_packet(Sink::Kernel(&mut raw)) {
            Ok(n) => n,
            Err(RingError::WouldBlock) if swd_state == Some(BufState::Closed) => {
                return Ok((0, None, false));
            }
            Err(RingError::TooLarge { .. }) => return Err(ProtocolError::CredentialMismatch.into()),
            Err(e) => return Err(e.into()),
        };
        let credential = decode_cred_header(&raw[..raw_len])?;
        let len = txn.read_packet(sink)?;
        txn.commit();

        let notify = wants_room_notice(rings.recv.bytes_free(), max_msg);
        Ok((len, Some(credential), notify))
    }

    /// Receives one message with the sender's credential.
    ///
    /// Returns `(0, None)` once the secure side has closed and the ring is
    /// drained.
    pub fn recv_with_credential(
        &self,
        task: &TaskContext,
        mut sink: Sink<'_>,
        flags: MsgFlags,
    ) -> Result<(usize, Option<Credential>), IwError> {
        self.layer.state.check_ready()?;
        if flags.contains(MsgFlags::OOB) {
            return Err(IwError::InvalidArgument("out-of-band data is send-only"));
        }

        let mut outcome = Err(IwError::WouldBlock);
        if flags.contains(MsgFlags::DONTWAIT) {
            outcome = self.try_recv(sink.reborrow());
        } else {
            self.desc.wq.wait_for(task, || {
                outcome = self.try_recv(sink.reborrow());
                !matches!(outcome, Err(IwError::WouldBlock))
            })?;
        }
        let (len, credential, notify) = outcome?;
        if notify {
            self.layer.notify_swd(self.desc.id);
        }
        Ok((len, credential))
    }

    pub fn recv<'a>(
        &self,
        task: &TaskContext,
        sink: impl Into<Sink<'a>>,
        flags: MsgFlags,
    ) -> Result<usize, IwError> {
        self.recv_with_credential(task, sink.into(), flags)
            .map(|(len, _)| len)
    }

    pub fn getsockopt(&self, opt: u32) -> Result<u32, IwError> {
        let opt = SockOpt::from_raw(opt).ok_or(IwError::NoSuchOption(opt))?;
        let opts = self.desc.inner.lock().opts;
        Ok(match opt {
            SockOpt::SndBuf => opts.snd,
            SockOpt::RcvBuf => opts.rcv,
            SockOpt::OobBuf => opts.oob,
            SockOpt::MaxMsgSize => opts.max_msg,
        })
    }

    /// Buffer sizes are payload sizes; the stored ring size adds room for
    /// the credential packet and both length prefixes.
    pub fn setsockopt(&self, opt: u32, value: u32) -> Result<(), IwError> {
        let opt = SockOpt::from_raw(opt).ok_or(IwError::NoSuchOption(opt))?;
        let max = self.layer.config.max_peer_buffer_size;
        let mut inner = self.desc.inner.lock();
        if inner.state != SocketState::New {
            return Err(IwError::Busy);
        }
        match opt {
            SockOpt::SndBuf | SockOpt::RcvBuf => {
                if value == 0 {
                    return Err(IwError::InvalidArgument("buffer size must be non-zero"));
                }
                if value > max {
                    return Err(IwError::InvalidArgument("buffer size above limit"));
                }
                let size = ring_size_for_payload(value);
                if opt == SockOpt::SndBuf {
                    inner.opts.snd = size;
                } else {
                    inner.opts.rcv = size;
                }
            }
            SockOpt::OobBuf => {
                if value > max {
                    return Err(IwError::InvalidArgument("buffer size above limit"));
                }
                inner.opts.oob = if value == 0 { 0 } else { ring_size_for_payload(value) };
            }
            SockOpt::MaxMsgSize => {
                if value > max {
                    return Err(IwError::InvalidArgument("message size above limit"));
                }
                inner.opts.max_msg = value;
            }
        }
        Ok(())
    }

    /// Closes this side. Waiters on the socket wake with `ConnectionReset`.
    ///
    /// Safe to call more than once; dropping the socket calls it too.
    pub fn release(&self) {
        let desc = &self.desc;
        let followup = {
            let mut inner = desc.inner.lock();
            let previous = inner.state;
            let followup = match previous {
                SocketState::Released => return,
                SocketState::New => ReleaseFollowup::Unpublish,
                SocketState::Listening | SocketState::Connecting | SocketState::Connected => {
                    match desc.head() {
                        None => ReleaseFollowup::Unpublish,
                        Some(head) => {
                            head.set_nwd_state(BufState::Closed);
                            fence(Ordering::SeqCst);
                            if previous == SocketState::Listening {
                                self.drain_requests(&mut inner, head);
                            }
                            if head.swd_state() != BufState::Closed {
                                ReleaseFollowup::NotifySwd
                            } else {
                                ReleaseFollowup::NotifyInternally
                            }
                        }
                    }
                }
            };
            inner.state = SocketState::Released;
            desc.released.store(true, Ordering::Release);
            tracing::debug!(socket_id = desc.id, from = ?previous, "socket released");
            followup
        };
        desc.wq.wake_all();

        match followup {
            ReleaseFollowup::Unpublish => self.layer.unpublish(desc),
            ReleaseFollowup::NotifySwd => self.layer.notify_swd(desc.id),
            ReleaseFollowup::NotifyInternally => {
                self.layer.events.notify_internally(desc.id, &self.layer.state)
            }
        }
    }

    /// Hands every pending request of a closing listener back.
    fn drain_requests(&self, inner: &mut SockInner, head: &SockBufHead) {
        let Some(rings) = inner.rings.as_mut() else {
            return;
        };
        while head.swd_state() != BufState::Closed {
            match ConnectRequest::read_from(&mut rings.recv) {
                Ok(Some(request)) => self.write_back(&mut rings.send, request.swd_id),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(socket_id = self.desc.id, error = %e, "listener ring unreadable");
                    break;
                }
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.desc.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{self, CpuMask};
    use crate::page::FrameTable;
    use crate::smc::{SecureMonitor, SmcRequest};
    use crate::staging::StagingPage;

    /// Accepts every call and never answers anything.
    struct Silent;

    impl SecureMonitor for Silent {
        fn enter(&self, _cpu: CpuId, _request: &SmcRequest, _staging: &mut StagingPage) -> SmcResponse {
            SmcResponse::ok([0; 3])
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn layer() -> SocketLayer {
        init_tracing();
        cpu::bind_current(CpuId(0));
        let config = IwConfig::default().with_cpus(1);
        let state = Arc::new(SubsystemState::new());
        state.mark_ready();
        let gate = Arc::new(WorldGate::new(Arc::new(Silent), 1, config.burst_pfns));
        let channels = Arc::new(ChannelAllocator::new(gate.clone(), Arc::new(FrameTable::new())));
        let pool = Arc::new(EntryPool::start(gate.clone(), 1, CpuMask::first(1)).unwrap());
        SocketLayer::start(state, &config, &gate, channels, pool).unwrap()
    }

    #[test]
    fn options_freeze_after_new() {
        let layer = layer();
        let task = TaskContext::kernel();
        let sock = layer.socket().unwrap();

        assert_eq!(sock.getsockopt(SockOpt::SndBuf.into()), Ok(DEFAULT_TRANSMIT_BUFFER_SIZE));
        sock.setsockopt(SockOpt::SndBuf.into(), 100).unwrap();
        assert_eq!(sock.getsockopt(SockOpt::SndBuf.into()), Ok(100 + 4 + 24 + 4));
        sock.setsockopt(SockOpt::MaxMsgSize.into(), 64).unwrap();
        assert_eq!(sock.getsockopt(SockOpt::MaxMsgSize.into()), Ok(64));
        assert_eq!(
            sock.setsockopt(SockOpt::RcvBuf.into(), 0),
            Err(IwError::InvalidArgument("buffer size must be non-zero"))
        );
        assert_eq!(sock.setsockopt(99, 1), Err(IwError::NoSuchOption(99)));

        assert_eq!(
            sock.connect(&task, "svc", MsgFlags::DONTWAIT),
            Err(IwError::InProgress)
        );
        assert_eq!(sock.state(), SocketState::Connecting);
        assert_eq!(sock.setsockopt(SockOpt::SndBuf.into(), 10), Err(IwError::Busy));
        assert_eq!(
            sock.connect(&task, "svc", MsgFlags::DONTWAIT),
            Err(IwError::AlreadyInProgress)
        );
    }

    #[test]
    fn room_notice_threshold() {
        assert!(wants_room_notice(u32::MAX, 0));
        assert!(!wants_room_notice(232, 112));
        assert!(wants_room_notice(232, 113));
        assert!(wants_room_notice(u32::MAX - 1, u32::MAX));
        assert!(wants_room_notice(0, u32::MAX - 2));
        assert!(!wants_room_notice(u32::MAX, u32::MAX / 2 - 4));
    }

    #[test]
    fn max_msg_size_is_bounded() {
        let layer = layer();
        let sock = layer.socket().unwrap();
        let max = IwConfig::default().max_peer_buffer_size;
        assert_eq!(
            sock.setsockopt(SockOpt::MaxMsgSize.into(), u32::MAX),
            Err(IwError::InvalidArgument("message size above limit"))
        );
        assert_eq!(
            sock.setsockopt(SockOpt::MaxMsgSize.into(), max + 1),
            Err(IwError::InvalidArgument("message size above limit"))
        );
        sock.setsockopt(SockOpt::MaxMsgSize.into(), max).unwrap();
        assert_eq!(sock.getsockopt(SockOpt::MaxMsgSize.into()), Ok(max));
    }

    #[test]
    fn connect_publishes_handshake() {
        let layer = layer();
        let task = TaskContext::kernel();
        let sock = layer.socket().unwrap();
        sock.setsockopt(SockOpt::OobBuf.into(), 0).unwrap();
        let _ = sock.connect(&task, "echo", MsgFlags::DONTWAIT);

        let inner = sock.desc.inner.lock();
        let opts = inner.opts;
        let layout = ChannelLayout::connected(opts.snd, opts.rcv, opts.oob);
        assert_eq!(layout.oob, None);
        let region = inner.channel.as_ref().unwrap().region();
        let mut ring = CircBuf::new(unsafe { CircBufRaw::attach(region, layout.send_offset(), layout.snd) });
        let handshake = Handshake::read_from(&mut ring).unwrap();
        assert_eq!(handshake.op, HandshakeOp::ConnectFromNwd);
        assert_eq!(handshake.nwd_id, sock.id() as i32);
        assert_eq!(handshake.target, HandshakeTarget::Name("echo".into()));
        assert_eq!(handshake.oob_size, Some(0));
        let head = sock.desc.head().unwrap();
        assert_eq!(head.nwd_state(), BufState::Connected);
        assert_eq!(head.swd_state(), BufState::New);
    }

    #[test]
    fn bad_names_are_rejected() {
        let layer = layer();
        let task = TaskContext::kernel();
        let sock = layer.socket().unwrap();
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            sock.connect(&task, &long, MsgFlags::empty()),
            Err(IwError::NameTooLong {
                len: MAX_NAME_LEN + 1,
                max: MAX_NAME_LEN
            })
        );
        assert!(matches!(sock.listen(""), Err(IwError::InvalidArgument(_))));
        assert_eq!(sock.state(), SocketState::New);
    }

    #[test]
    fn io_needs_a_connection() {
        let layer = layer();
        let task = TaskContext::kernel();
        let sock = layer.socket().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            sock.send(&task, b"hi", MsgFlags::empty()),
            Err(IwError::NotConnected)
        );
        assert_eq!(
            sock.recv(&task, &mut buf, MsgFlags::DONTWAIT),
            Err(IwError::NotConnected)
        );
        sock.listen("svc").unwrap();
        assert!(matches!(
            sock.accept(&task, MsgFlags::DONTWAIT),
            Err(IwError::WouldBlock)
        ));
        assert_eq!(
            sock.send(&task, b"hi", MsgFlags::empty()),
            Err(IwError::BadState)
        );
    }

    #[test]
    fn releasing_new_socket_unpublishes_it() {
        let layer = layer();
        let sock = layer.socket().unwrap();
        assert_eq!(layer.live_sockets(), 1);
        sock.release();
        sock.release();
        assert_eq!(sock.state(), SocketState::Released);
        assert_eq!(layer.live_sockets(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(
            sock.recv(&TaskContext::kernel(), &mut buf, MsgFlags::empty()),
            Err(IwError::ConnectionReset)
        );
    }

    #[test]
    fn releasing_open_socket_tells_secure_side() {
        let layer = layer();
        let task = TaskContext::kernel();
        let sock = layer.socket().unwrap();
        let _ = sock.connect(&task, "svc", MsgFlags::DONTWAIT);
        let id = sock.id();
        drop(sock);

        // The secure side never closed its half, so the socket stays registered.
        assert_eq!(layer.live_sockets(), 1);
        assert_eq!(layer.shared.events.drain_nwd_events(), vec![id]);
    }

    #[test]
    fn table_exhaustion() {
        let layer = layer();
        let config_max = layer.shared.config.max_sockets as usize;
        let socks: Vec<Socket> = (0..config_max).map(|_| layer.socket().unwrap()).collect();
        assert_eq!(
            layer.socket().unwrap_err(),
            IwError::ResourceExhausted("socket table")
        );
        drop(socks);
        assert_eq!(layer.live_sockets(), 0);
        layer.socket().unwrap();
    }

    #[test]
    fn shutdown_wakes_blocked_connect() {
        let layer = layer();
        let sock = Arc::new(layer.socket().unwrap());
        let waiter = {
            let sock = sock.clone();
            std::thread::spawn(move || {
                cpu::bind_current(CpuId(0));
                sock.connect(&TaskContext::kernel(), "nobody", MsgFlags::empty())
            })
        };
        while sock.state() != SocketState::Connecting {
            std::thread::yield_now();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        layer.shared.state.release();
        layer.shutdown();
        assert_eq!(waiter.join().unwrap(), Err(IwError::ConnectionRefused));
    }
}
