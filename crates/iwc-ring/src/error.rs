use core::fmt;

/// Failure of a ring or packet operation.
///
/// None of these leave a half-written or half-consumed record behind: the
/// local cursor is exactly where it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Not enough free space (or published data) right now; retry after the peer moves.
    WouldBlock,
    /// The request can never be satisfied by this ring, or the destination
    /// buffer is smaller than the pending packet.
    TooLarge { len: usize, capacity: usize },
    /// Copy through a user buffer faulted.
    Fault,
    /// The peer published a cursor or length outside the ring.
    Corrupted,
}

impl RingError {
    #[inline]
    pub fn is_would_block(self) -> bool {
        matches!(self, RingError::WouldBlock)
    }
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "ring buffer would block"),
            Self::TooLarge { len, capacity } => {
                write!(f, "{len} bytes can never fit (capacity {capacity})")
            }
            Self::Fault => write!(f, "fault while copying user memory"),
            Self::Corrupted => write!(f, "ring cursor or packet length corrupted by peer"),
        }
    }
}

impl core::error::Error for RingError {}
