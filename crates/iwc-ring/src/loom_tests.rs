#![cfg(all(test, feature = "loom"))]

use crate::circ_buf::{CircBuf, CircBufRaw, circ_buf_total_size};
use crate::error::RingError;
use crate::region::HeapRegion;
use crate::sync::thread;
use alloc::vec;
use alloc::vec::Vec;
use loom::sync::Arc;

/// Explores interleavings with at most two preemptions per execution.
fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    let mut builder = loom::model::Builder::new();
    builder.preemption_bound = Some(2);
    builder.check(f);
}

fn shared_ring(capacity: u32) -> (Arc<HeapRegion>, CircBufRaw) {
    let owner = Arc::new(HeapRegion::new_zeroed(circ_buf_total_size(capacity) + 64));
    let raw = unsafe { CircBufRaw::init(owner.region(), 0, capacity) };
    (owner, raw)
}

#[test]
fn packets_arrive_whole_and_in_order() {
    model(|| {
        let (owner, raw) = shared_ring(8);

        let producer_owner = owner.clone();
        let producer = thread::spawn(move || {
            let _keep = producer_owner;
            let mut writer = CircBuf::new(raw);
            for i in 0..2u8 {
                let payload = [i; 3];
                loop {
                    match writer.write_packet((&payload).into()) {
                        Ok(_) => break,
                        Err(RingError::WouldBlock) => thread::yield_now(),
                        Err(e) => panic!("unexpected {e}"),
                    }
                }
            }
        });

        let consumer_owner = owner.clone();
        let consumer = thread::spawn(move || {
            let _keep = consumer_owner;
            let mut reader = CircBuf::new(raw);
            let mut received = Vec::new();
            while received.len() < 2 {
                let mut out = [0u8; 3];
                match reader.read_packet((&mut out).into()) {
                    Ok(3) => received.push(out),
                    Ok(n) => panic!("short packet {n}"),
                    Err(RingError::WouldBlock) => thread::yield_now(),
                    Err(e) => panic!("unexpected {e}"),
                }
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        assert_eq!(received, vec![[0u8; 3], [1u8; 3]]);
    });
}

#[test]
fn used_never_exceeds_capacity() {
    model(|| {
        let (owner, raw) = shared_ring(4);

        let producer_owner = owner.clone();
        let producer = thread::spawn(move || {
            let _keep = producer_owner;
            let mut writer = CircBuf::new(raw);
            let mut sent = 0;
            while sent < 4 {
                match writer.write(b"ab".into()) {
                    Ok(_) => sent += 2,
                    Err(RingError::WouldBlock) => thread::yield_now(),
                    Err(e) => panic!("unexpected {e}"),
                }
                assert!(raw.bytes_used() <= raw.capacity());
            }
        });

        let mut reader = CircBuf::new(raw);
        let mut got = 0;
        while got < 4 {
            let mut out = [0u8; 1];
            match reader.read((&mut out).into()) {
                Ok(_) => {
                    assert_eq!(out[0], if got % 2 == 0 { b'a' } else { b'b' });
                    got += 1;
                }
                Err(RingError::WouldBlock) => thread::yield_now(),
                Err(e) => panic!("unexpected {e}"),
            }
        }

        producer.join().unwrap();
        assert!(raw.is_empty());
    });
}
