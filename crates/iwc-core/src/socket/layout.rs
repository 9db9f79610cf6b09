//! Shared layouts of socket channels and the records exchanged through them.
//!
//! A connected socket's channel:
//!
//! ```text
//! ┌──────────────┬────────────────┬────────────────┬────────────────┐
//! │ SockBufHead  │ send ring      │ receive ring   │ oob ring       │
//! │ nwd │ swd    │ NW → SW        │ SW → NW        │ NW → SW        │
//! └──────────────┴────────────────┴────────────────┴────────────────┘
//! ```
//!
//! A listener's channel has no oob ring. Its receive ring carries raw
//! [`ConnectRequest`] records and its send ring carries the 4-byte ids of
//! requests this side gives up on.
//!
//! The events channel holds two rings of [`events_ring_size`] bytes, NW → SW
//! first. Both carry raw 4-byte socket ids.

use std::sync::atomic::{AtomicU32, Ordering};

use iwc_ring::{
    CIRC_BUF_META_SIZE, CircBuf, PACKET_HEADER_SIZE, RingError, Sink, Source, circ_buf_total_size,
    round_down, round_up, size_for_packet,
};
use static_assertions::const_assert_eq;

use crate::config::DEFAULT_OOB_BUFFER_SIZE;
use crate::error::{IwError, ProtocolError};
use crate::page::PAGE_SIZE;
use crate::task::Credential;

/// Longest socket name, NUL excluded.
pub const MAX_NAME_LEN: usize = 63;

/// Default send and receive ring size: a connected channel with default
/// sizes fits in one page.
pub const DEFAULT_TRANSMIT_BUFFER_SIZE: u32 = round_down(
    (PAGE_SIZE
        - 3 * round_up(CIRC_BUF_META_SIZE, 4)
        - 2 * 4
        - DEFAULT_OOB_BUFFER_SIZE as usize)
        / 2,
    4,
) as u32;

/// Ring bytes per direction in an events channel of `pages` pages.
pub const fn events_ring_size(pages: usize) -> u32 {
    round_down(pages * PAGE_SIZE / 2 - CIRC_BUF_META_SIZE, 4) as u32
}

/// One side's view of a socket channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufState {
    New = 0,
    Connected = 1,
    Closed = 2,
}

impl BufState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Connected,
            // Anything else is treated as a close.
            _ => Self::Closed,
        }
    }
}

/// First eight bytes of every socket channel.
#[repr(C)]
pub struct SockBufHead {
    nwd_state: AtomicU32,
    swd_state: AtomicU32,
}

const_assert_eq!(size_of::<SockBufHead>(), 8);

pub const SOCK_BUF_HEAD_SIZE: usize = size_of::<SockBufHead>();

impl SockBufHead {
    pub fn new(nwd: BufState, swd: BufState) -> Self {
        Self {
            nwd_state: AtomicU32::new(nwd as u32),
            swd_state: AtomicU32::new(swd as u32),
        }
    }

    #[inline]
    pub fn nwd_state(&self) -> BufState {
        BufState::from_raw(self.nwd_state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn swd_state(&self) -> BufState {
        BufState::from_raw(self.swd_state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_nwd_state(&self, state: BufState) {
        self.nwd_state.store(state as u32, Ordering::Release);
    }

    #[inline]
    pub fn set_swd_state(&self, state: BufState) {
        self.swd_state.store(state as u32, Ordering::Release);
    }
}

/// Ring capacities of one socket channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub snd: u32,
    pub rcv: u32,
    /// Present on connected sockets only.
    pub oob: Option<u32>,
}

impl ChannelLayout {
    /// A zero `oob` leaves the oob ring out.
    pub fn connected(snd: u32, rcv: u32, oob: u32) -> Self {
        Self {
            snd,
            rcv,
            oob: (oob > 0).then_some(oob),
        }
    }

    pub fn listener(snd: u32, rcv: u32) -> Self {
        Self { snd, rcv, oob: None }
    }

    #[inline]
    pub fn send_offset(&self) -> usize {
        SOCK_BUF_HEAD_SIZE
    }

    #[inline]
    pub fn recv_offset(&self) -> usize {
        self.send_offset() + circ_buf_total_size(self.snd)
    }

    #[inline]
    pub fn oob_offset(&self) -> usize {
        self.recv_offset() + circ_buf_total_size(self.rcv)
    }

    pub fn total_size(&self) -> usize {
        self.oob_offset() + self.oob.map_or(0, circ_buf_total_size)
    }

    pub fn page_count(&self) -> usize {
        self.total_size().div_ceil(PAGE_SIZE)
    }
}

/// Ring capacity that holds one credential packet and one `payload`-byte packet.
#[inline]
pub const fn ring_size_for_payload(payload: u32) -> u32 {
    size_for_packet(payload).saturating_add(size_for_packet(CRED_HEADER_SIZE))
}

/// Opening record kind of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HandshakeOp {
    ConnectFromNwd = 0,
    NewNwdListen = 1,
    AcceptFromNwd = 2,
}

impl HandshakeOp {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::ConnectFromNwd),
            1 => Some(Self::NewNwdListen),
            2 => Some(Self::AcceptFromNwd),
            _ => None,
        }
    }
}

/// Who a handshake is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeTarget {
    /// Service name to connect to or listen on.
    Name(String),
    /// Secure-side socket whose request is being accepted.
    SwdId(i32),
}

/// The packets written into a fresh channel's send ring before it is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub op: HandshakeOp,
    pub nwd_id: i32,
    pub target: HandshakeTarget,
    pub snd_size: u32,
    pub rcv_size: u32,
    /// Written for connect and accept only.
    pub oob_size: Option<u32>,
}

impl Handshake {
    /// Writes the handshake as one published batch of packets.
    pub fn write_to(&self, ring: &mut CircBuf) -> Result<(), IwError> {
        let mut txn = ring.write_txn();
        txn.write_packet(Source::Kernel(&(self.op as u32).to_le_bytes()))?;
        txn.write_packet(Source::Kernel(&self.nwd_id.to_le_bytes()))?;
        match &self.target {
            HandshakeTarget::Name(name) => {
                let mut bytes = Vec::with_capacity(name.len() + 1);
                bytes.extend_from_slice(name.as_bytes());
                bytes.push(0);
                txn.write_packet(Source::Kernel(&bytes))?;
            }
            HandshakeTarget::SwdId(id) => {
                txn.write_packet(Source::Kernel(&id.to_le_bytes()))?;
            }
        }
        txn.write_packet(Source::Kernel(&self.snd_size.to_le_bytes()))?;
        txn.write_packet(Source::Kernel(&self.rcv_size.to_le_bytes()))?;
        if let Some(oob) = self.oob_size {
            txn.write_packet(Source::Kernel(&oob.to_le_bytes()))?;
        }
        txn.commit();
        Ok(())
    }

    /// Reads a handshake the way the secure side does.
    pub fn read_from(ring: &mut CircBuf) -> Result<Self, IwError> {
        fn word(ring: &mut CircBuf) -> Result<u32, IwError> {
            let mut raw = [0u8; 4];
            if ring.read_packet_local(Sink::Kernel(&mut raw))? != 4 {
                return Err(ProtocolError::MalformedRecord.into());
            }
            Ok(u32::from_le_bytes(raw))
        }

        let result = (|| -> Result<Self, IwError> {
            let op = HandshakeOp::from_raw(word(ring)?).ok_or(ProtocolError::MalformedRecord)?;
            let nwd_id = word(ring)? as i32;
            let target = match op {
                HandshakeOp::AcceptFromNwd => HandshakeTarget::SwdId(word(ring)? as i32),
                HandshakeOp::ConnectFromNwd | HandshakeOp::NewNwdListen => {
                    let len = ring.peek_packet_size()? as usize;
                    if len == 0 || len > MAX_NAME_LEN + 1 {
                        return Err(ProtocolError::MalformedRecord.into());
                    }
                    let mut raw = vec![0u8; len];
                    ring.read_packet_local(Sink::Kernel(&mut raw))?;
                    if raw.pop() != Some(0) {
                        return Err(ProtocolError::MalformedRecord.into());
                    }
                    let name = String::from_utf8(raw).map_err(|_| ProtocolError::MalformedRecord)?;
                    HandshakeTarget::Name(name)
                }
            };
            let snd_size = word(ring)?;
            let rcv_size = word(ring)?;
            let oob_size = match op {
                HandshakeOp::NewNwdListen => None,
                _ => Some(word(ring)?),
            };
            Ok(Self {
                op,
                nwd_id,
                target,
                snd_size,
                rcv_size,
                oob_size,
            })
        })();
        match result {
            Ok(handshake) => {
                ring.flush_read();
                Ok(handshake)
            }
            Err(e) => {
                ring.rollback_read();
                Err(e)
            }
        }
    }
}

/// A pending connection from the secure side, as found in a listener's receive ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub swd_id: i32,
    pub snd_buf_size: u32,
    pub rcv_buf_size: u32,
    pub oob_buf_size: u32,
    pub max_msg_size: u32,
}

impl ConnectRequest {
    pub const WIRE_SIZE: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.swd_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.snd_buf_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.rcv_buf_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.oob_buf_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.max_msg_size.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; Self::WIRE_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            swd_id: word(0) as i32,
            snd_buf_size: word(4),
            rcv_buf_size: word(8),
            oob_buf_size: word(12),
            max_msg_size: word(16),
        }
    }

    /// Reads one whole record, or nothing.
    pub fn read_from(ring: &mut CircBuf) -> Result<Option<Self>, RingError> {
        if (ring.readable()? as usize) < Self::WIRE_SIZE {
            return Ok(None);
        }
        let mut raw = [0u8; Self::WIRE_SIZE];
        ring.read(Sink::Kernel(&mut raw))?;
        Ok(Some(Self::from_bytes(&raw)))
    }
}

/// Bytes of the credential packet preceding every data packet.
pub const CRED_HEADER_SIZE: u32 = 24;
/// `cmsg_level` of a credential header.
pub const SOL_IWSOCK: u32 = 1;
/// `cmsg_type` of a credential header.
pub const SCM_CREDENTIALS: u32 = 1;

const_assert_eq!(CRED_HEADER_SIZE as usize, 12 + Credential::WIRE_SIZE);
const_assert_eq!(PACKET_HEADER_SIZE, 4);

/// `{cmsg_len, cmsg_level, cmsg_type}` followed by the credential.
pub fn encode_cred_header(cred: &Credential) -> [u8; CRED_HEADER_SIZE as usize] {
    let mut out = [0u8; CRED_HEADER_SIZE as usize];
    out[0..4].copy_from_slice(&CRED_HEADER_SIZE.to_le_bytes());
    out[4..8].copy_from_slice(&SOL_IWSOCK.to_le_bytes());
    out[8..12].copy_from_slice(&SCM_CREDENTIALS.to_le_bytes());
    out[12..24].copy_from_slice(&cred.to_bytes());
    out
}

pub fn decode_cred_header(raw: &[u8]) -> Result<Credential, ProtocolError> {
    let raw: &[u8; CRED_HEADER_SIZE as usize] =
        raw.try_into().map_err(|_| ProtocolError::CredentialMismatch)?;
    let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
    if word(0) != CRED_HEADER_SIZE || word(4) != SOL_IWSOCK || word(8) != SCM_CREDENTIALS {
        return Err(ProtocolError::CredentialMismatch);
    }
    let mut cred = [0u8; Credential::WIRE_SIZE];
    cred.copy_from_slice(&raw[12..24]);
    Ok(Credential::from_bytes(&cred))
}

#[cfg(test)]
mod tests {
    use super::*;
    use iwc_ring::{CircBufRaw, HeapRegion};

    fn ring(capacity: u32) -> (HeapRegion, CircBuf) {
        let heap = HeapRegion::new_zeroed(circ_buf_total_size(capacity));
        let raw = unsafe { CircBufRaw::init(heap.region(), 0, capacity) };
        (heap, CircBuf::new(raw))
    }

    #[test]
    fn default_connected_channel_fits_one_page() {
        assert_eq!(DEFAULT_TRANSMIT_BUFFER_SIZE, 1960);
        let layout = ChannelLayout::connected(
            DEFAULT_TRANSMIT_BUFFER_SIZE,
            DEFAULT_TRANSMIT_BUFFER_SIZE,
            DEFAULT_OOB_BUFFER_SIZE,
        );
        assert_eq!(layout.total_size(), 4092);
        assert_eq!(layout.page_count(), 1);
        assert_eq!(layout.recv_offset(), 8 + 1972);
    }

    #[test]
    fn events_rings_fill_the_channel() {
        let size = events_ring_size(1);
        assert_eq!(size, 2036);
        assert_eq!(2 * circ_buf_total_size(size), PAGE_SIZE);
    }

    #[test]
    fn handshake_round_trip() {
        let (_heap, mut ring) = ring(512);
        let hs = Handshake {
            op: HandshakeOp::ConnectFromNwd,
            nwd_id: 3,
            target: HandshakeTarget::Name("svc".into()),
            snd_size: 100,
            rcv_size: 200,
            oob_size: Some(32),
        };
        hs.write_to(&mut ring).unwrap();
        assert_eq!(Handshake::read_from(&mut ring).unwrap(), hs);
        assert!(ring.is_empty());
    }

    #[test]
    fn listen_handshake_has_no_oob() {
        let (_heap, mut ring) = ring(512);
        let hs = Handshake {
            op: HandshakeOp::NewNwdListen,
            nwd_id: 1,
            target: HandshakeTarget::Name("echo".into()),
            snd_size: 64,
            rcv_size: 64,
            oob_size: None,
        };
        hs.write_to(&mut ring).unwrap();
        assert_eq!(ring.bytes_used(), 4 * 8 + 4 + 5);
        assert_eq!(Handshake::read_from(&mut ring).unwrap(), hs);
    }

    #[test]
    fn bad_handshake_is_rolled_back() {
        let (_heap, mut ring) = ring(128);
        ring.write_packet(Source::Kernel(&9u32.to_le_bytes())).unwrap();
        assert!(Handshake::read_from(&mut ring).is_err());
        assert_eq!(ring.bytes_used(), 8);
    }

    #[test]
    fn cred_header_validation() {
        let cred = Credential {
            pid: 5,
            uid: 6,
            gid: 7,
        };
        let raw = encode_cred_header(&cred);
        assert_eq!(decode_cred_header(&raw), Ok(cred));
        assert_eq!(
            decode_cred_header(&raw[..20]),
            Err(ProtocolError::CredentialMismatch)
        );
        let mut bad = raw;
        bad[4] = 9;
        assert_eq!(
            decode_cred_header(&bad),
            Err(ProtocolError::CredentialMismatch)
        );
    }

    #[test]
    fn connect_request_needs_a_whole_record() {
        let (_heap, mut ring) = ring(64);
        let req = ConnectRequest {
            swd_id: -4,
            snd_buf_size: 1,
            rcv_buf_size: 2,
            oob_buf_size: 3,
            max_msg_size: 4,
        };
        let bytes = req.to_bytes();
        ring.write(Source::Kernel(&bytes[..12])).unwrap();
        assert_eq!(ConnectRequest::read_from(&mut ring), Ok(None));
        ring.write(Source::Kernel(&bytes[12..])).unwrap();
        assert_eq!(ConnectRequest::read_from(&mut ring), Ok(Some(req)));
    }
}
