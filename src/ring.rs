//! Lock-free SPSC byte ring buffer living inside the shared memory region.
//!
//! One producer process, one consumer process. Indices use modular arithmetic
//! on atomic head/tail; the data bytes are inline so a ring is a single
//! contiguous span of the shared allocation. One byte of capacity is reserved
//! to disambiguate full from empty.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::RING_CAPACITY;

/// Ring index on its own cache line so producer and consumer never share one.
#[repr(C, align(64))]
struct Index(AtomicI32);

/// SPSC byte ring with inline storage.
///
/// `head` advances only on the producer side, `tail` only on the consumer
/// side. All transfers are all-or-nothing; a failed [`write`](Self::write) or
/// [`read`](Self::read) leaves indices and bytes untouched. Overrun and
/// underrun are expected conditions during startup and drift-tracker warmup,
/// not errors.
#[repr(C, align(64))]
pub struct RingBuffer {
    head: Index,
    tail: Index,
    capacity: i32,
    data: UnsafeCell<[u8; RING_CAPACITY]>,
}

// One process writes through `data` while another reads it; the acquire /
// release pairing on head and tail is what makes those accesses race-free.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Initialize in place on fresh (zeroed) shared pages.
    ///
    /// `capacity` must be at most [`RING_CAPACITY`]; usable space is
    /// `capacity - 1` bytes.
    pub fn init(&mut self, capacity: i32) {
        debug_assert!(capacity > 1 && capacity as usize <= RING_CAPACITY);
        self.capacity = capacity;
        self.head.0.store(0, Ordering::Relaxed);
        self.tail.0.store(0, Ordering::Relaxed);
        self.data.get_mut().fill(0);
    }

    /// Configured capacity in bytes (one byte of which stays reserved).
    pub fn capacity(&self) -> i32 {
        self.capacity
    }

    /// Bytes ready for the consumer.
    pub fn available_read(&self) -> i32 {
        // Acquire on both indices so either side may call this.
        let h = self.head.0.load(Ordering::Acquire);
        let t = self.tail.0.load(Ordering::Acquire);
        let avail = h - t;
        if avail < 0 { avail + self.capacity } else { avail }
    }

    /// Bytes the producer can still write.
    pub fn available_write(&self) -> i32 {
        self.capacity - 1 - self.available_read()
    }

    /// Write `src` into the ring. Returns `false` (and does nothing) when the
    /// ring lacks space for the whole slice.
    pub fn write(&self, src: &[u8]) -> bool {
        let Ok(len) = i32::try_from(src.len()) else {
            return false;
        };
        if len == 0 {
            return true;
        }
        if len > self.available_write() {
            return false;
        }

        let h = self.head.0.load(Ordering::Relaxed);
        let data = self.data.get() as *mut u8;

        // Up to two copies when the span wraps.
        let first = (self.capacity - h).min(len);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), data.add(h as usize), first as usize);
            if first < len {
                ptr::copy_nonoverlapping(src.as_ptr().add(first as usize), data, (len - first) as usize);
            }
        }

        self.head.0.store((h + len) % self.capacity, Ordering::Release);
        true
    }

    /// Read exactly `dst.len()` bytes. Returns `false` (and does nothing) when
    /// the ring holds less data than requested; the caller fills silence.
    pub fn read(&self, dst: &mut [u8]) -> bool {
        let Ok(len) = i32::try_from(dst.len()) else {
            return false;
        };
        if len == 0 {
            return true;
        }
        if len > self.available_read() {
            return false;
        }

        let t = self.tail.0.load(Ordering::Relaxed);
        let data = self.data.get() as *const u8;

        let first = (self.capacity - t).min(len);
        unsafe {
            ptr::copy_nonoverlapping(data.add(t as usize), dst.as_mut_ptr(), first as usize);
            if first < len {
                ptr::copy_nonoverlapping(data, dst.as_mut_ptr().add(first as usize), (len - first) as usize);
            }
        }

        self.tail.0.store((t + len) % self.capacity, Ordering::Release);
        true
    }

    /// Drop everything buffered. Consumer-side only.
    pub fn clear(&self) {
        self.tail
            .0
            .store(self.head.0.load(Ordering::Acquire), Ordering::Release);
    }
}
