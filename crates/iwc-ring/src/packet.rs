//! Length-prefixed records on top of [`CircBuf`].
//!
//! Every packet is a 4-byte little-endian length followed by that many
//! payload bytes, both moved through the ring primitive itself.

use crate::circ_buf::CircBuf;
use crate::error::RingError;
use crate::io::{Sink, Source};

/// Size of the length prefix.
pub const PACKET_HEADER_SIZE: u32 = 4;

/// Ring bytes a packet with `len` payload bytes occupies.
///
/// Saturates at `u32::MAX`, which no ring can hold.
#[inline]
pub const fn size_for_packet(len: u32) -> u32 {
    len.saturating_add(PACKET_HEADER_SIZE)
}

impl CircBuf {
    /// Appends one packet without publishing it.
    ///
    /// Either the whole packet is staged or the local cursor is unchanged.
    pub fn write_packet_local(&mut self, src: Source<'_>) -> Result<usize, RingError> {
        let len = src.len();
        let capacity = self.capacity() as usize;
        let Ok(len32) = u32::try_from(len) else {
            return Err(RingError::TooLarge { len, capacity });
        };
        let total = size_for_packet(len32) as usize;
        if total > capacity {
            return Err(RingError::TooLarge {
                len: total,
                capacity,
            });
        }
        if total > self.writable()? as usize {
            return Err(RingError::WouldBlock);
        }

        let start = self.local_write();
        let staged = self
            .write_local(Source::Kernel(&len32.to_le_bytes()))
            .and_then(|_| self.write_local(src));
        if let Err(e) = staged {
            self.set_local_write(start);
            return Err(e);
        }
        Ok(len)
    }

    /// `write_packet_local` followed by `flush_write`.
    pub fn write_packet(&mut self, src: Source<'_>) -> Result<usize, RingError> {
        let n = self.write_packet_local(src)?;
        self.flush_write();
        Ok(n)
    }

    /// Payload size of the next packet, without consuming anything.
    pub fn peek_packet_size(&self) -> Result<u32, RingError> {
        let mut header = [0u8; PACKET_HEADER_SIZE as usize];
        self.peek_local(&mut header)?;
        let size = u32::from_le_bytes(header);
        let max = self.capacity() - PACKET_HEADER_SIZE.min(self.capacity());
        if size > max {
            return Err(RingError::Corrupted);
        }
        if size_for_packet(size) > self.readable()? {
            // The writer publishes whole packets, so a short one is a lie.
            return Err(RingError::Corrupted);
        }
        Ok(size)
    }

    /// Consumes the next packet into `sink` without publishing the read.
    ///
    /// A sink smaller than the packet fails with [`RingError::TooLarge`] and
    /// leaves the packet in place. Returns the payload size.
    pub fn read_packet_local(&mut self, mut sink: Sink<'_>) -> Result<usize, RingError> {
        let size = self.peek_packet_size()? as usize;
        if !matches!(sink, Sink::Discard(_)) && sink.len() < size {
            return Err(RingError::TooLarge {
                len: size,
                capacity: sink.len(),
            });
        }

        let start = self.local_read();
        let consumed = self
            .read_local(Sink::Discard(PACKET_HEADER_SIZE as usize))
            .and_then(|_| self.read_local(sink.prefix(size)));
        if let Err(e) = consumed {
            self.set_local_read(start);
            return Err(e);
        }
        Ok(size)
    }

    /// `read_packet_local` followed by `flush_read`.
    pub fn read_packet(&mut self, sink: Sink<'_>) -> Result<usize, RingError> {
        let n = self.read_packet_local(sink)?;
        self.flush_read();
        Ok(n)
    }

    /// Skips the next packet locally; publish with `flush_read`.
    pub fn drop_packet(&mut self) -> Result<usize, RingError> {
        self.read_packet_local(Sink::Discard(0))
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::circ_buf::{CircBufRaw, circ_buf_total_size};
    use crate::region::HeapRegion;

    fn ring(capacity: u32) -> (HeapRegion, CircBuf) {
        let heap = HeapRegion::new_zeroed(circ_buf_total_size(capacity));
        let raw = unsafe { CircBufRaw::init(heap.region(), 0, capacity) };
        (heap, CircBuf::new(raw))
    }

    #[test]
    fn ten_byte_packet_uses_fourteen_bytes() {
        let (_heap, mut buf) = ring(4096);
        buf.write_packet(b"0123456789".into()).unwrap();
        assert_eq!(buf.bytes_used(), 14);
        assert_eq!(buf.bytes_free(), buf.capacity() - 14);

        let mut out = [0u8; 10];
        assert_eq!(buf.read_packet((&mut out).into()), Ok(10));
        assert_eq!(&out, b"0123456789");
        assert_eq!(buf.bytes_used(), 0);
    }

    #[test]
    fn short_buffer_is_capacity_error_and_keeps_packet() {
        let (_heap, mut buf) = ring(64);
        buf.write_packet(b"twelve bytes".into()).unwrap();
        let mut small = [0u8; 5];
        assert_eq!(
            buf.read_packet((&mut small).into()),
            Err(RingError::TooLarge {
                len: 12,
                capacity: 5
            })
        );
        assert_eq!(buf.bytes_used(), 16);

        let mut out = [0u8; 32];
        assert_eq!(buf.read_packet((&mut out).into()), Ok(12));
        assert_eq!(&out[..12], b"twelve bytes");
    }

    #[test]
    fn packet_larger_than_ring_is_too_large() {
        let (_heap, mut buf) = ring(16);
        let payload = [1u8; 13];
        assert!(matches!(
            buf.write_packet((&payload).into()),
            Err(RingError::TooLarge { .. })
        ));
        let fits = [1u8; 12];
        buf.write_packet((&fits).into()).unwrap();
        assert!(buf.is_full());
    }

    #[test]
    fn packet_that_does_not_fit_yet_would_block() {
        let (_heap, mut buf) = ring(16);
        buf.write_packet(b"abcd".into()).unwrap();
        assert_eq!(
            buf.write_packet(b"abcdefgh".into()),
            Err(RingError::WouldBlock)
        );
        assert_eq!(buf.bytes_used(), 8);
    }

    #[test]
    fn largest_payload_saturates() {
        assert_eq!(size_for_packet(10), 14);
        assert_eq!(size_for_packet(u32::MAX - PACKET_HEADER_SIZE), u32::MAX);
        assert_eq!(size_for_packet(u32::MAX), u32::MAX);
    }

    #[test]
    fn peek_does_not_consume() {
        let (_heap, mut buf) = ring(32);
        assert_eq!(buf.peek_packet_size(), Err(RingError::WouldBlock));
        buf.write_packet(b"xyz".into()).unwrap();
        assert_eq!(buf.peek_packet_size(), Ok(3));
        assert_eq!(buf.peek_packet_size(), Ok(3));
        assert_eq!(buf.bytes_used(), 7);
    }

    #[test]
    fn drop_is_uncommitted_until_flush() {
        let (_heap, mut buf) = ring(32);
        buf.write_packet(b"one".into()).unwrap();
        buf.write_packet(b"two".into()).unwrap();
        assert_eq!(buf.drop_packet(), Ok(3));
        assert_eq!(buf.bytes_used(), 14);
        buf.flush_read();
        assert_eq!(buf.bytes_used(), 7);

        let mut out = [0u8; 3];
        buf.read_packet((&mut out).into()).unwrap();
        assert_eq!(&out, b"two");
    }

    #[test]
    fn zero_length_packet_round_trips() {
        let (_heap, mut buf) = ring(32);
        buf.write_packet(Source::Kernel(&[])).unwrap();
        assert_eq!(buf.bytes_used(), 4);
        let mut out = [0u8; 8];
        assert_eq!(buf.read_packet((&mut out).into()), Ok(0));
        assert!(buf.is_empty());
    }

    #[test]
    fn lying_length_prefix_is_corruption() {
        let (_heap, mut buf) = ring(32);
        buf.write(Source::Kernel(&100u32.to_le_bytes())).unwrap();
        assert_eq!(buf.peek_packet_size(), Err(RingError::Corrupted));
        let mut out = [0u8; 128];
        assert_eq!(
            buf.read_packet((&mut out).into()),
            Err(RingError::Corrupted)
        );
        assert_eq!(buf.bytes_used(), 4);
    }
}
