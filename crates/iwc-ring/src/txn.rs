//! Cursor transactions.
//!
//! A transaction snapshots one local cursor when it is opened. Committing
//! publishes everything done through it; dropping it without committing
//! puts the local cursor back, so the peer can never observe part of a
//! multi-step record.

use crate::circ_buf::CircBuf;
use crate::error::RingError;
use crate::io::{Sink, Source};

/// Pending writes on a ring. See [`CircBuf::write_txn`].
pub struct WriteTxn<'a> {
    buf: &'a mut CircBuf,
    snapshot: u32,
    armed: bool,
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn new(buf: &'a mut CircBuf) -> Self {
        let snapshot = buf.local_write();
        Self {
            buf,
            snapshot,
            armed: true,
        }
    }

    pub fn write(&mut self, src: Source<'_>) -> Result<usize, RingError> {
        self.buf.write_local(src)
    }

    pub fn write_packet(&mut self, src: Source<'_>) -> Result<usize, RingError> {
        self.buf.write_packet_local(src)
    }

    /// Space left for further writes in this transaction.
    pub fn writable(&self) -> Result<u32, RingError> {
        self.buf.writable()
    }

    /// Publishes all writes made through this transaction.
    pub fn commit(mut self) {
        self.buf.flush_write();
        self.armed = false;
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.buf.set_local_write(self.snapshot);
        }
    }
}

/// Pending reads on a ring. See [`CircBuf::read_txn`].
pub struct ReadTxn<'a> {
    buf: &'a mut CircBuf,
    snapshot: u32,
    armed: bool,
}

impl<'a> ReadTxn<'a> {
    pub(crate) fn new(buf: &'a mut CircBuf) -> Self {
        let snapshot = buf.local_read();
        Self {
            buf,
            snapshot,
            armed: true,
        }
    }

    pub fn read(&mut self, sink: Sink<'_>) -> Result<usize, RingError> {
        self.buf.read_local(sink)
    }

    pub fn read_packet(&mut self, sink: Sink<'_>) -> Result<usize, RingError> {
        self.buf.read_packet_local(sink)
    }

    pub fn peek_packet_size(&self) -> Result<u32, RingError> {
        self.buf.peek_packet_size()
    }

    pub fn drop_packet(&mut self) -> Result<usize, RingError> {
        self.buf.drop_packet()
    }

    /// Publishes all reads made through this transaction.
    pub fn commit(mut self) {
        self.buf.flush_read();
        self.armed = false;
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.buf.set_local_read(self.snapshot);
        }
    }
}

impl CircBuf {
    /// Opens a write transaction on this descriptor.
    pub fn write_txn(&mut self) -> WriteTxn<'_> {
        WriteTxn::new(self)
    }

    /// Opens a read transaction on this descriptor.
    pub fn read_txn(&mut self) -> ReadTxn<'_> {
        ReadTxn::new(self)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use crate::circ_buf::{CircBuf, CircBufRaw, circ_buf_total_size};
    use crate::error::RingError;
    use crate::region::HeapRegion;

    #[test]
    fn uncommitted_writes_roll_back_on_drop() {
        let heap = HeapRegion::new_zeroed(circ_buf_total_size(32));
        let mut buf = CircBuf::new(unsafe { CircBufRaw::init(heap.region(), 0, 32) });
        {
            let mut txn = buf.write_txn();
            txn.write_packet(b"first".into()).unwrap();
            let big = [0u8; 20];
            assert_eq!(txn.write_packet((&big).into()), Err(RingError::WouldBlock));
        }
        assert_eq!(buf.writable().unwrap(), 32);
        assert!(buf.is_empty());
    }

    #[test]
    fn committed_pair_is_published_together() {
        let heap = HeapRegion::new_zeroed(circ_buf_total_size(64));
        let raw = unsafe { CircBufRaw::init(heap.region(), 0, 64) };
        let mut writer = CircBuf::new(raw);
        let mut reader = CircBuf::new(raw);

        let mut txn = writer.write_txn();
        txn.write_packet(b"cred".into()).unwrap();
        txn.write_packet(b"payload".into()).unwrap();
        assert!(reader.is_empty());
        txn.commit();

        let mut cred = [0u8; 4];
        let mut payload = [0u8; 16];
        let mut rtxn = reader.read_txn();
        assert_eq!(rtxn.read_packet((&mut cred).into()), Ok(4));
        assert_eq!(rtxn.read_packet((&mut payload).into()), Ok(7));
        rtxn.commit();
        assert_eq!(&payload[..7], b"payload");
        assert!(writer.is_empty());
    }

    #[test]
    fn failed_read_leaves_both_packets() {
        let heap = HeapRegion::new_zeroed(circ_buf_total_size(64));
        let mut buf = CircBuf::new(unsafe { CircBufRaw::init(heap.region(), 0, 64) });
        buf.write_packet(b"head".into()).unwrap();
        buf.write_packet(b"a longer body".into()).unwrap();
        {
            let mut txn = buf.read_txn();
            let mut head = [0u8; 4];
            txn.read_packet((&mut head).into()).unwrap();
            let mut small = [0u8; 3];
            assert!(matches!(
                txn.read_packet((&mut small).into()),
                Err(RingError::TooLarge { .. })
            ));
        }
        assert_eq!(buf.peek_packet_size(), Ok(4));
    }
}
