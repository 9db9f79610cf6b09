//! Error taxonomy for the inter-world subsystem.

use std::fmt;

use iwc_ring::RingError;

/// Something the peer sent that breaks the framing or handshake contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A cursor or length prefix outside the ring.
    CorruptRing,
    /// A record of unexpected size or shape.
    MalformedRecord,
    /// The credential header did not match the expected layout.
    CredentialMismatch,
    /// A connection request asked for buffer sizes we refuse.
    SizeMismatch,
    /// The secure side replied with something we did not ask for.
    UnexpectedReply,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptRing => write!(f, "ring cursor or length corrupted"),
            Self::MalformedRecord => write!(f, "malformed record"),
            Self::CredentialMismatch => write!(f, "credential header mismatch"),
            Self::SizeMismatch => write!(f, "connection request sizes rejected"),
            Self::UnexpectedReply => write!(f, "unexpected reply from secure world"),
        }
    }
}

/// Errors surfaced by the inter-world subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IwError {
    /// Transient: would block, only surfaced to non-blocking callers.
    WouldBlock,
    /// Non-blocking connect started but has not completed.
    InProgress,
    /// Capacity: a message or region exceeds configured limits.
    MessageTooLarge { len: usize, max: usize },
    /// The peer broke the protocol; the operation was aborted.
    Protocol(ProtocolError),
    /// The peer closed its side of the connection.
    ConnectionReset,
    /// The secure side refused or abandoned the connection.
    ConnectionRefused,
    NotConnected,
    AlreadyConnected,
    AlreadyInProgress,
    /// Options may only change before the socket leaves NEW.
    Busy,
    /// The operation does not apply to the object's current state.
    BadState,
    NameTooLong { len: usize, max: usize },
    NoSuchOption(u32),
    InvalidArgument(&'static str),
    /// Allocation failure or table exhaustion.
    ResourceExhausted(&'static str),
    /// A pending signal interrupted a blocking wait.
    Interrupted,
    /// The subsystem is down and will not come back.
    SubsystemDown,
    /// Copy through a user buffer faulted.
    Fault,
    /// No object with that handle.
    NotFound,
    /// The secure side returned a failure status.
    Secure(i32),
}

impl IwError {
    /// Negative errno equivalent.
    pub fn errno(&self) -> i32 {
        -match self {
            Self::WouldBlock => libc::EAGAIN,
            Self::InProgress => libc::EINPROGRESS,
            Self::MessageTooLarge { .. } => libc::EMSGSIZE,
            Self::Protocol(_) => libc::EPROTO,
            Self::ConnectionReset => libc::ECONNRESET,
            Self::ConnectionRefused => libc::ECONNREFUSED,
            Self::NotConnected => libc::ENOTCONN,
            Self::AlreadyConnected => libc::EISCONN,
            Self::AlreadyInProgress => libc::EALREADY,
            Self::Busy => libc::EBUSY,
            Self::BadState => libc::EBADF,
            Self::NameTooLong { .. } => libc::ENAMETOOLONG,
            Self::NoSuchOption(_) => libc::ENOPROTOOPT,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::ResourceExhausted(_) => libc::ENOMEM,
            Self::Interrupted => libc::EINTR,
            Self::SubsystemDown => libc::ENODEV,
            Self::Fault => libc::EFAULT,
            Self::NotFound => libc::ENOENT,
            Self::Secure(status) => return (*status).min(-1),
        }
    }

    /// Errors that mean "the other side went away" rather than a fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset | Self::ConnectionRefused | Self::SubsystemDown
        )
    }

    /// Maps a failure status from the secure side.
    pub fn from_secure_status(status: i32) -> Self {
        match -status {
            libc::ENOMEM => Self::ResourceExhausted("secure world out of memory"),
            libc::EINVAL => Self::InvalidArgument("rejected by secure world"),
            libc::ENOENT => Self::NotFound,
            libc::EPROTO => Self::Protocol(ProtocolError::UnexpectedReply),
            _ => Self::Secure(status),
        }
    }
}

impl fmt::Display for IwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "operation would block"),
            Self::InProgress => write!(f, "connection in progress"),
            Self::MessageTooLarge { len, max } => {
                write!(f, "message of {len} bytes exceeds limit of {max}")
            }
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::ConnectionReset => write!(f, "connection reset by peer"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::NotConnected => write!(f, "socket is not connected"),
            Self::AlreadyConnected => write!(f, "socket is already connected"),
            Self::AlreadyInProgress => write!(f, "connection already in progress"),
            Self::Busy => write!(f, "socket options are frozen"),
            Self::BadState => write!(f, "operation invalid in current state"),
            Self::NameTooLong { len, max } => write!(f, "name of {len} bytes exceeds {max}"),
            Self::NoSuchOption(opt) => write!(f, "unknown socket option {opt}"),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Self::ResourceExhausted(what) => write!(f, "out of resources: {what}"),
            Self::Interrupted => write!(f, "interrupted by signal"),
            Self::SubsystemDown => write!(f, "communication subsystem is down"),
            Self::Fault => write!(f, "bad user address"),
            Self::NotFound => write!(f, "no such handle"),
            Self::Secure(status) => write!(f, "secure world returned {status}"),
        }
    }
}

impl std::error::Error for IwError {}

impl From<RingError> for IwError {
    fn from(e: RingError) -> Self {
        match e {
            RingError::WouldBlock => Self::WouldBlock,
            RingError::TooLarge { len, capacity } => Self::MessageTooLarge { len, max: capacity },
            RingError::Fault => Self::Fault,
            RingError::Corrupted => Self::Protocol(ProtocolError::CorruptRing),
        }
    }
}

impl From<ProtocolError> for IwError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_errors_keep_their_class() {
        assert_eq!(IwError::from(RingError::WouldBlock), IwError::WouldBlock);
        assert_eq!(
            IwError::from(RingError::TooLarge {
                len: 10,
                capacity: 4
            })
            .errno(),
            -libc::EMSGSIZE
        );
        assert_eq!(
            IwError::from(RingError::Corrupted),
            IwError::Protocol(ProtocolError::CorruptRing)
        );
    }

    #[test]
    fn reset_is_distinct_from_protocol() {
        assert!(IwError::ConnectionReset.is_disconnect());
        assert!(!IwError::Protocol(ProtocolError::MalformedRecord).is_disconnect());
        assert_ne!(
            IwError::ConnectionReset.errno(),
            IwError::Protocol(ProtocolError::MalformedRecord).errno()
        );
    }

    #[test]
    fn secure_status_maps_known_codes() {
        assert_eq!(
            IwError::from_secure_status(-libc::ENOENT),
            IwError::NotFound
        );
        assert_eq!(IwError::from_secure_status(-1234).errno(), -1234);
    }
}
