use std::sync::Arc;
use std::thread;

use crate::RING_CAPACITY;
use crate::ring::RingBuffer;

fn boxed_ring(capacity: i32) -> Box<RingBuffer> {
    let mut ring = unsafe { Box::<RingBuffer>::new_zeroed().assume_init() };
    ring.init(capacity);
    ring
}

#[test]
fn fresh_ring_reports_full_capacity() {
    let ring = boxed_ring(4096);
    assert_eq!(ring.capacity(), 4096);
    assert_eq!(ring.available_read(), 0);
    assert_eq!(ring.available_write(), 4095);
}

#[test]
fn round_trip_preserves_byte_stream() {
    let ring = boxed_ring(4096);

    // Mismatched write/read block sizes force plenty of wrap-arounds.
    let total = 100_000usize;
    let source: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let mut received = Vec::with_capacity(total);

    let mut write_pos = 0usize;
    let mut buf = [0u8; 613];
    while received.len() < total {
        if write_pos < total {
            let n = 389.min(total - write_pos);
            if ring.write(&source[write_pos..write_pos + n]) {
                write_pos += n;
            }
        }
        let n = (buf.len()).min(ring.available_read() as usize);
        if n > 0 && ring.read(&mut buf[..n]) {
            received.extend_from_slice(&buf[..n]);
        }
    }

    assert_eq!(received, source);
}

#[test]
fn oversize_write_fails_atomically() {
    let ring = boxed_ring(RING_CAPACITY as i32);

    let block = vec![0xABu8; RING_CAPACITY];
    assert!(!ring.write(&block), "capacity-sized write must be refused");
    assert_eq!(ring.available_read(), 0);
    assert_eq!(ring.available_write(), RING_CAPACITY as i32 - 1);

    // The failed attempt left the indices untouched; a fitting write works.
    assert!(ring.write(&block[..RING_CAPACITY - 1]));
    assert_eq!(ring.available_read(), RING_CAPACITY as i32 - 1);
}

#[test]
fn short_read_fails_atomically() {
    let ring = boxed_ring(1024);
    assert!(ring.write(&[1, 2, 3, 4, 5, 6, 7, 8]));

    let mut buf = [0u8; 9];
    assert!(!ring.read(&mut buf), "reading more than buffered must fail");
    assert_eq!(ring.available_read(), 8, "failed read must consume nothing");

    let mut buf = [0u8; 8];
    assert!(ring.read(&mut buf));
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(ring.available_read(), 0);
}

#[test]
fn clear_resets_to_empty() {
    let ring = boxed_ring(1024);
    assert!(ring.write(&[9u8; 100]));
    ring.clear();
    assert_eq!(ring.available_read(), 0);
    assert_eq!(ring.available_write(), 1023);

    let mut buf = [0u8; 1];
    assert!(!ring.read(&mut buf));
}

#[test]
fn empty_transfers_are_noops() {
    let ring = boxed_ring(64);
    assert!(ring.write(&[]));
    assert!(ring.read(&mut []));
    assert_eq!(ring.available_read(), 0);
}

// A writer and a reader on separate threads must never observe interleaved
// bytes within one transfer: every block read back is uniform and blocks
// arrive in order.
#[test]
fn concurrent_producer_consumer_never_tears() {
    const BLOCK: usize = 64;
    const BLOCKS: usize = 20_000;

    let ring: Arc<RingBuffer> = Arc::from(boxed_ring(4096));
    let producer_ring = Arc::clone(&ring);

    let producer = thread::spawn(move || {
        for i in 0..BLOCKS {
            let block = [(i % 256) as u8; BLOCK];
            while !producer_ring.write(&block) {
                thread::yield_now();
            }
        }
    });

    let mut expected = 0usize;
    let mut block = [0u8; BLOCK];
    while expected < BLOCKS {
        if ring.available_read() < BLOCK as i32 {
            thread::yield_now();
            continue;
        }
        assert!(ring.read(&mut block));
        let first = block[0];
        assert!(
            block.iter().all(|&b| b == first),
            "torn block at index {expected}: {block:?}"
        );
        assert_eq!(first, (expected % 256) as u8, "blocks out of order");
        expected += 1;
    }

    producer.join().expect("producer thread");
    assert_eq!(ring.available_read(), 0);
}
