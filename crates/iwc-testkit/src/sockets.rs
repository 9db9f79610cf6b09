//! Secure-side socket broker.
//!
//! Every socket channel the normal world publishes becomes an [`Endpoint`].
//! Connectors are matched with listeners by name, connection requests are
//! queued into the listener's receive ring, and once the normal world
//! accepts, the two endpoints are paired and packets are copied verbatim
//! from each side's send rings into the other's receive ring.

use std::collections::{HashMap, VecDeque};

use iwc_core::socket::layout::{
    BufState, CRED_HEADER_SIZE, ChannelLayout, ConnectRequest, Handshake, HandshakeOp,
    HandshakeTarget, SOCK_BUF_HEAD_SIZE, SockBufHead, events_ring_size,
};
use iwc_core::{IwError, PAGE_SIZE, Pfn, ProtocolError};
use iwc_ring::{CircBuf, CircBufRaw, RingError, SharedRegion, Sink, Source, circ_buf_total_size, size_for_packet};

/// Send-ring window used to read a handshake before its sizes are known.
const HANDSHAKE_WINDOW: u32 = 128;

/// Payload that fits in a ring of `capacity` next to a credential packet.
fn payload_for_ring(capacity: u32) -> u32 {
    capacity.saturating_sub(size_for_packet(CRED_HEADER_SIZE) + size_for_packet(0))
}

#[derive(Debug)]
enum Role {
    /// Request offered to the listener, not yet accepted.
    Connecting { listener: Pfn },
    Listening {
        name: String,
        /// Requests that did not fit in the listener's receive ring yet.
        waiting: VecDeque<ConnectRequest>,
    },
    Paired { peer: Pfn },
    Closed,
}

struct Endpoint {
    nwd_id: u32,
    swd_id: i32,
    region: SharedRegion,
    /// NW → SW.
    send: CircBuf,
    /// SW → NW.
    recv: CircBuf,
    /// NW → SW, connected sockets only.
    oob: Option<CircBuf>,
    role: Role,
}

impl Endpoint {
    fn head(&self) -> &SockBufHead {
        // SAFETY: the channel stays mapped until the NW sends ReleaseChannel,
        // which removes this endpoint first.
        unsafe { self.region.atomics::<SockBufHead>(0) }
    }
}

struct EventRings {
    first_pfn: Pfn,
    to_swd: CircBuf,
    to_nwd: CircBuf,
}

/// Copies one credential packet and its data packet, or nothing.
fn relay_message(from: &mut CircBuf, to: &mut CircBuf) -> Result<bool, RingError> {
    let mut rx = from.read_txn();
    let cred_len = match rx.peek_packet_size() {
        Ok(n) => n,
        Err(RingError::WouldBlock) => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut cred = vec![0u8; cred_len as usize];
    rx.read_packet(Sink::Kernel(&mut cred))?;
    let data_len = match rx.peek_packet_size() {
        Ok(n) => n,
        Err(RingError::WouldBlock) => return Ok(false),
        Err(e) => return Err(e),
    };
    if to.writable()? < size_for_packet(cred_len) + size_for_packet(data_len) {
        return Ok(false);
    }
    let mut data = vec![0u8; data_len as usize];
    rx.read_packet(Sink::Kernel(&mut data))?;

    let mut tx = to.write_txn();
    tx.write_packet(Source::Kernel(&cred))?;
    tx.write_packet(Source::Kernel(&data))?;
    tx.commit();
    rx.commit();
    Ok(true)
}

#[derive(Default)]
pub(crate) struct Broker {
    events: Option<EventRings>,
    endpoints: HashMap<Pfn, Endpoint>,
    listeners: HashMap<String, Pfn>,
    next_swd_id: i32,
    /// SW → NW events not yet written.
    backlog: VecDeque<u32>,
    relayed: u64,
    /// NW → SW events seen, by socket id.
    notices: HashMap<u32, u64>,
}

impl Broker {
    pub(crate) fn open_events(&mut self, first_pfn: Pfn, region: SharedRegion, pages: usize) {
        let size = events_ring_size(pages);
        // SAFETY: the NW laid both rings out before publishing the channel.
        let to_swd = CircBuf::new(unsafe { CircBufRaw::attach(region, 0, size) });
        let to_nwd =
            CircBuf::new(unsafe { CircBufRaw::attach(region, circ_buf_total_size(size), size) });
        self.events = Some(EventRings {
            first_pfn,
            to_swd,
            to_nwd,
        });
        tracing::debug!(first_pfn = first_pfn.0, size, "event rings attached");
    }

    pub(crate) fn open_socket(&mut self, first_pfn: Pfn, region: SharedRegion) -> Result<(), IwError> {
        if region.len() < PAGE_SIZE {
            return Err(ProtocolError::SizeMismatch.into());
        }
        // SAFETY: the window lies inside the first page, which is mapped.
        let mut probe =
            CircBuf::new(unsafe { CircBufRaw::attach(region, SOCK_BUF_HEAD_SIZE, HANDSHAKE_WINDOW) });
        let handshake = Handshake::read_from(&mut probe)?;

        let layout = match handshake.op {
            HandshakeOp::NewNwdListen => ChannelLayout::listener(handshake.snd_size, handshake.rcv_size),
            HandshakeOp::ConnectFromNwd | HandshakeOp::AcceptFromNwd => ChannelLayout::connected(
                handshake.snd_size,
                handshake.rcv_size,
                handshake.oob_size.unwrap_or(0),
            ),
        };
        if handshake.snd_size == 0 || handshake.rcv_size == 0 || layout.total_size() > region.len() {
            return Err(ProtocolError::SizeMismatch.into());
        }

        // SAFETY: the layout was checked against the mapped window above.
        let attach = |offset: usize, capacity: u32| {
            CircBuf::new(unsafe { CircBufRaw::attach(region, offset, capacity) })
        };
        self.next_swd_id += 1;
        let endpoint = Endpoint {
            nwd_id: handshake.nwd_id as u32,
            swd_id: self.next_swd_id,
            region,
            send: attach(layout.send_offset(), layout.snd),
            recv: attach(layout.recv_offset(), layout.rcv),
            oob: layout.oob.map(|cap| attach(layout.oob_offset(), cap)),
            role: Role::Closed,
        };
        tracing::debug!(
            first_pfn = first_pfn.0,
            socket_id = endpoint.nwd_id,
            swd_id = endpoint.swd_id,
            op = ?handshake.op,
            "socket channel attached"
        );

        match (handshake.op, handshake.target) {
            (HandshakeOp::ConnectFromNwd, HandshakeTarget::Name(name)) => {
                self.connect(first_pfn, endpoint, &layout, &name)
            }
            (HandshakeOp::NewNwdListen, HandshakeTarget::Name(name)) => {
                self.listen(first_pfn, endpoint, name)
            }
            (HandshakeOp::AcceptFromNwd, HandshakeTarget::SwdId(target)) => {
                self.accept(first_pfn, endpoint, target)
            }
            _ => return Err(ProtocolError::MalformedRecord.into()),
        }
        Ok(())
    }

    fn connect(&mut self, pfn: Pfn, mut endpoint: Endpoint, layout: &ChannelLayout, name: &str) {
        let listener = self.listeners.get(name).copied();
        let Some(listener) = listener else {
            tracing::debug!(name, socket_id = endpoint.nwd_id, "no listener, refusing");
            self.insert_refused(pfn, endpoint);
            return;
        };
        let request = ConnectRequest {
            swd_id: endpoint.swd_id,
            snd_buf_size: payload_for_ring(layout.rcv),
            rcv_buf_size: payload_for_ring(layout.snd),
            oob_buf_size: layout.oob.map_or(0, payload_for_ring),
            max_msg_size: 0,
        };
        endpoint.role = Role::Connecting { listener };
        self.endpoints.insert(pfn, endpoint);
        if let Some(Endpoint {
            role: Role::Listening { waiting, .. },
            ..
        }) = self.endpoints.get_mut(&listener)
        {
            waiting.push_back(request);
        }
        self.deliver_requests(listener);
    }

    fn listen(&mut self, pfn: Pfn, mut endpoint: Endpoint, name: String) {
        if self.listeners.contains_key(&name) {
            tracing::debug!(name, "name already has a listener, refusing");
            self.insert_refused(pfn, endpoint);
            return;
        }
        endpoint.head().set_swd_state(BufState::Connected);
        self.listeners.insert(name.clone(), pfn);
        endpoint.role = Role::Listening {
            name,
            waiting: VecDeque::new(),
        };
        self.endpoints.insert(pfn, endpoint);
    }

    fn accept(&mut self, pfn: Pfn, mut endpoint: Endpoint, target: i32) {
        let connector = self
            .endpoints
            .iter()
            .find(|(_, e)| {
                e.swd_id == target
                    && matches!(e.role, Role::Connecting { .. })
                    && e.head().nwd_state() != BufState::Closed
            })
            .map(|(p, _)| *p);
        let Some(peer) = connector else {
            tracing::debug!(swd_id = target, "accepted connector is gone");
            self.insert_refused(pfn, endpoint);
            return;
        };

        endpoint.role = Role::Paired { peer };
        endpoint.head().set_swd_state(BufState::Connected);
        self.post(endpoint.nwd_id);
        self.endpoints.insert(pfn, endpoint);
        if let Some(connector) = self.endpoints.get_mut(&peer) {
            connector.role = Role::Paired { peer: pfn };
            connector.head().set_swd_state(BufState::Connected);
            let id = connector.nwd_id;
            self.post(id);
        }
        tracing::debug!(swd_id = target, "connection paired");
    }

    fn insert_refused(&mut self, pfn: Pfn, endpoint: Endpoint) {
        endpoint.head().set_swd_state(BufState::Closed);
        self.post(endpoint.nwd_id);
        self.endpoints.insert(pfn, endpoint);
    }

    /// Closes the SW half of `pfn`, whatever it was doing.
    fn refuse(&mut self, pfn: Pfn) {
        let Some(endpoint) = self.endpoints.get_mut(&pfn) else {
            return;
        };
        endpoint.role = Role::Closed;
        if endpoint.head().swd_state() != BufState::Closed {
            endpoint.head().set_swd_state(BufState::Closed);
            let id = endpoint.nwd_id;
            self.post(id);
        }
    }

    fn refuse_swd_id(&mut self, swd_id: i32) {
        let pfn = self
            .endpoints
            .iter()
            .find(|(_, e)| e.swd_id == swd_id && matches!(e.role, Role::Connecting { .. }))
            .map(|(p, _)| *p);
        match pfn {
            Some(pfn) => {
                tracing::debug!(swd_id, "connection request given back");
                self.refuse(pfn);
            }
            None => tracing::trace!(swd_id, "write-back for unknown connector"),
        }
    }

    fn deliver_requests(&mut self, pfn: Pfn) {
        let Some(Endpoint {
            nwd_id,
            recv,
            role: Role::Listening { waiting, .. },
            ..
        }) = self.endpoints.get_mut(&pfn)
        else {
            return;
        };
        let mut delivered = false;
        while let Some(request) = waiting.front() {
            match recv.write(Source::Kernel(&request.to_bytes())) {
                Ok(_) => {
                    waiting.pop_front();
                    delivered = true;
                }
                Err(RingError::WouldBlock) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "listener receive ring failed");
                    break;
                }
            }
        }
        let id = *nwd_id;
        if delivered {
            self.post(id);
        }
    }

    fn take_write_backs(&mut self, pfn: Pfn) {
        let Some(endpoint) = self.endpoints.get_mut(&pfn) else {
            return;
        };
        let mut ids = Vec::new();
        let mut word = [0u8; 4];
        while endpoint.send.read(Sink::Kernel(&mut word)).is_ok() {
            ids.push(i32::from_le_bytes(word));
        }
        for swd_id in ids {
            self.refuse_swd_id(swd_id);
        }
    }

    fn relay(&mut self, pfn: Pfn, peer: Pfn) {
        let [Some(from), Some(to)] = self.endpoints.get_disjoint_mut([&pfn, &peer]) else {
            return;
        };
        if to.head().nwd_state() == BufState::Closed {
            return;
        }
        let mut moved = 0u64;
        for ring in std::iter::once(&mut from.send).chain(from.oob.as_mut()) {
            loop {
                match relay_message(ring, &mut to.recv) {
                    Ok(true) => moved += 1,
                    Ok(false) => break,
                    Err(e) => {
                        tracing::warn!(socket_id = from.nwd_id, error = %e, "relay failed");
                        break;
                    }
                }
            }
        }
        if moved > 0 {
            let ids = (from.nwd_id, to.nwd_id);
            tracing::trace!(from = ids.0, to = ids.1, messages = moved, "relayed");
            self.relayed += moved;
            self.post(ids.0);
            self.post(ids.1);
        }
    }

    /// The NW closed its half: close ours and tell whoever depended on it.
    fn close_endpoint(&mut self, pfn: Pfn) {
        if matches!(
            self.endpoints.get(&pfn).map(|e| &e.role),
            Some(Role::Listening { .. })
        ) {
            self.take_write_backs(pfn);
        }
        let Some(endpoint) = self.endpoints.get_mut(&pfn) else {
            return;
        };
        let role = std::mem::replace(&mut endpoint.role, Role::Closed);
        endpoint.head().set_swd_state(BufState::Closed);
        let id = endpoint.nwd_id;
        self.post(id);
        tracing::debug!(socket_id = id, "secure half closed");

        match role {
            Role::Paired { peer } => self.refuse(peer),
            Role::Listening { name, waiting } => {
                if self.listeners.get(&name) == Some(&pfn) {
                    self.listeners.remove(&name);
                }
                for request in waiting {
                    self.refuse_swd_id(request.swd_id);
                }
                let stranded: Vec<Pfn> = self
                    .endpoints
                    .iter()
                    .filter(|(_, e)| matches!(e.role, Role::Connecting { listener } if listener == pfn))
                    .map(|(p, _)| *p)
                    .collect();
                for connector in stranded {
                    self.refuse(connector);
                }
            }
            Role::Connecting { .. } | Role::Closed => {}
        }
    }

    fn service(&mut self, pfn: Pfn) {
        let Some(endpoint) = self.endpoints.get(&pfn) else {
            return;
        };
        let nwd_closed = endpoint.head().nwd_state() == BufState::Closed;
        let swd_closed = endpoint.head().swd_state() == BufState::Closed;
        match endpoint.role {
            Role::Paired { peer } => self.relay(pfn, peer),
            Role::Listening { .. } if !nwd_closed => {
                self.take_write_backs(pfn);
                self.deliver_requests(pfn);
            }
            _ => {}
        }
        if nwd_closed && !swd_closed {
            self.close_endpoint(pfn);
        }
    }

    /// One pass over every endpoint.
    pub(crate) fn pump(&mut self) {
        if let Some(events) = self.events.as_mut() {
            let mut word = [0u8; 4];
            while events.to_swd.read(Sink::Kernel(&mut word)).is_ok() {
                let id = u32::from_le_bytes(word);
                tracing::trace!(socket_id = id, "event from normal world");
                *self.notices.entry(id).or_default() += 1;
            }
        }
        let pfns: Vec<Pfn> = self.endpoints.keys().copied().collect();
        for pfn in pfns {
            self.service(pfn);
        }
    }

    pub(crate) fn post(&mut self, id: u32) {
        if !self.backlog.contains(&id) {
            self.backlog.push_back(id);
        }
    }

    /// Writes as much of the backlog as fits. Returns whether anything was written.
    pub(crate) fn flush_events(&mut self) -> bool {
        let Some(events) = self.events.as_mut() else {
            return false;
        };
        let mut wrote = false;
        while let Some(id) = self.backlog.front() {
            match events.to_nwd.write(Source::Kernel(&id.to_le_bytes())) {
                Ok(_) => {
                    self.backlog.pop_front();
                    wrote = true;
                }
                Err(_) => break,
            }
        }
        wrote
    }

    /// The NW is about to unmap `first_pfn`.
    pub(crate) fn close_channel(&mut self, first_pfn: Pfn) -> bool {
        if self.events.as_ref().is_some_and(|e| e.first_pfn == first_pfn) {
            self.events = None;
            self.backlog.clear();
            tracing::debug!(first_pfn = first_pfn.0, "event rings detached");
            return true;
        }
        let Some(endpoint) = self.endpoints.get(&first_pfn) else {
            return false;
        };
        if endpoint.head().swd_state() != BufState::Closed || !matches!(endpoint.role, Role::Closed) {
            self.close_endpoint(first_pfn);
        }
        self.endpoints.remove(&first_pfn);
        true
    }

    pub(crate) fn endpoints(&self) -> usize {
        self.endpoints.len()
    }

    pub(crate) fn has_listener(&self, name: &str) -> bool {
        self.listeners.contains_key(name)
    }

    pub(crate) fn relayed(&self) -> u64 {
        self.relayed
    }

    pub(crate) fn notices(&self, id: u32) -> u64 {
        self.notices.get(&id).copied().unwrap_or(0)
    }

    pub(crate) fn events_attached(&self) -> bool {
        self.events.is_some()
    }
}
