//! Shared memory layout exchanged between the helper daemon and the plugin.
//!
//! The helper allocates the region, initializes this layout in place, and
//! hands a map capability to the plugin through [`crate::ipc`]. Both
//! processes then address the same physical pages, so every field here is
//! either an atomic or written once before the region is published, and the
//! struct layout must stay bit-exact on both sides.
//!
//! Write ownership is fixed: the helper writes the status words, the clock
//! record, the drift ratio, and the three input rings; the plugin writes the
//! two output rings. Each ring has exactly one producer process and one
//! consumer process.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::RING_CAPACITY;
use crate::ring::RingBuffer;

/// Helper daemon status published in the region header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum HelperStatus {
    /// Helper not running (or shut down).
    Offline = 0,
    /// Helper running and serving audio.
    Running = 1,
    /// Helper hit a fatal error; restart required.
    Error = 2,
}

impl HelperStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Error,
            _ => Self::Offline,
        }
    }
}

/// Per-device connection state published in the region header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceState {
    /// Device absent or closed.
    Disconnected = 0,
    /// Device opened but I/O not yet started.
    Connected = 1,
    /// Device delivering I/O callbacks.
    Running = 2,
}

impl DeviceState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Connected,
            2 => Self::Running,
            _ => Self::Disconnected,
        }
    }
}

/// Master clock record: written by the helper on every master I/O tick, read
/// by the plugin on every virtual-device clock query.
///
/// The two halves are independent atomics read relaxed; momentary incoherence
/// between sample time and host time is within the host's tolerance because
/// the consumer only extrapolates from them. Rust has no `AtomicF64`, so the
/// sample time travels as bits.
#[repr(C, align(64))]
pub struct ClockRecord {
    sample_time_bits: AtomicU64,
    host_time: AtomicU64,
    seed: AtomicU64,
}

impl ClockRecord {
    /// Publish a new (sample time, host time) observation.
    pub fn publish(&self, sample_time: f64, host_time: u64) {
        self.sample_time_bits
            .store(sample_time.to_bits(), Ordering::Relaxed);
        self.host_time.store(host_time, Ordering::Relaxed);
    }

    /// Read the record as (sample time, host time, seed).
    pub fn load(&self) -> (f64, u64, u64) {
        (
            f64::from_bits(self.sample_time_bits.load(Ordering::Relaxed)),
            self.host_time.load(Ordering::Relaxed),
            self.seed.load(Ordering::Relaxed),
        )
    }

    /// Advance the seed, marking a timeline discontinuity to clock consumers.
    pub fn bump_seed(&self) {
        self.seed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Top-level layout placed at the start of the page-aligned shared region.
///
/// Field order is part of the cross-process contract. Each ring starts at a
/// 64-byte boundary with its head and tail on their own cache lines.
#[repr(C)]
pub struct SharedLayout {
    helper_status: AtomicU32,
    master_state: AtomicU32,
    slave_state: AtomicU32,
    // Keeps the 64-bit fields that follow 8-byte aligned even if the clock
    // record's alignment were relaxed.
    _pad0: u32,

    clock: ClockRecord,
    drift_ratio_bits: AtomicU64,

    // Helper writes, plugin reads.
    master_input: RingBuffer,
    slave_input: RingBuffer,
    // Plugin writes, helper reads.
    master_output: RingBuffer,
    slave_output: RingBuffer,
    // Helper writes (tap), plugin reads.
    cue_input: RingBuffer,
}

impl SharedLayout {
    /// Initialize the layout in place on fresh zeroed pages.
    pub fn init(&mut self) {
        self.helper_status
            .store(HelperStatus::Offline as u32, Ordering::Relaxed);
        self.master_state
            .store(DeviceState::Disconnected as u32, Ordering::Relaxed);
        self.slave_state
            .store(DeviceState::Disconnected as u32, Ordering::Relaxed);
        self._pad0 = 0;
        self.clock.sample_time_bits.store(0, Ordering::Relaxed);
        self.clock.host_time.store(0, Ordering::Relaxed);
        self.clock.seed.store(0, Ordering::Relaxed);
        self.drift_ratio_bits
            .store(1.0f64.to_bits(), Ordering::Relaxed);
        self.master_input.init(RING_CAPACITY as i32);
        self.slave_input.init(RING_CAPACITY as i32);
        self.master_output.init(RING_CAPACITY as i32);
        self.slave_output.init(RING_CAPACITY as i32);
        self.cue_input.init(RING_CAPACITY as i32);
    }

    /// Publish the helper status. Helper-side only.
    pub fn set_helper_status(&self, status: HelperStatus) {
        self.helper_status.store(status as u32, Ordering::Release);
    }

    /// Current helper status.
    pub fn helper_status(&self) -> HelperStatus {
        HelperStatus::from_u32(self.helper_status.load(Ordering::Acquire))
    }

    /// Publish the master device state. Helper-side only.
    pub fn set_master_state(&self, state: DeviceState) {
        self.master_state.store(state as u32, Ordering::Release);
    }

    /// Current master device state.
    pub fn master_state(&self) -> DeviceState {
        DeviceState::from_u32(self.master_state.load(Ordering::Acquire))
    }

    /// Publish the slave device state. Helper-side only.
    pub fn set_slave_state(&self, state: DeviceState) {
        self.slave_state.store(state as u32, Ordering::Release);
    }

    /// Current slave device state.
    pub fn slave_state(&self) -> DeviceState {
        DeviceState::from_u32(self.slave_state.load(Ordering::Acquire))
    }

    /// Master clock record.
    pub fn clock(&self) -> &ClockRecord {
        &self.clock
    }

    /// Publish the informational master/slave drift ratio.
    pub fn set_drift_ratio(&self, ratio: f64) {
        self.drift_ratio_bits
            .store(ratio.to_bits(), Ordering::Relaxed);
    }

    /// Last published drift ratio (master rate / slave rate).
    pub fn drift_ratio(&self) -> f64 {
        f64::from_bits(self.drift_ratio_bits.load(Ordering::Relaxed))
    }

    /// Master hardware input → plugin. Helper produces, plugin consumes.
    pub fn master_input(&self) -> &RingBuffer {
        &self.master_input
    }

    /// Slave hardware input (master clock domain) → plugin.
    pub fn slave_input(&self) -> &RingBuffer {
        &self.slave_input
    }

    /// Plugin output → master hardware. Plugin produces, helper consumes.
    pub fn master_output(&self) -> &RingBuffer {
        &self.master_output
    }

    /// Plugin output (master clock domain) → slave hardware.
    pub fn slave_output(&self) -> &RingBuffer {
        &self.slave_output
    }

    /// Tapped cue audio (master clock domain) → plugin.
    pub fn cue_input(&self) -> &RingBuffer {
        &self.cue_input
    }
}

/// Non-owning pointer to a mapped [`SharedLayout`].
///
/// Copies of this handle are passed into the realtime callbacks; the process
/// that owns the mapping must outlive every copy.
#[derive(Clone, Copy, Debug)]
pub struct SharedRegion {
    ptr: NonNull<SharedLayout>,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Wrap a raw pointer to an initialized layout.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live, initialized `SharedLayout` that stays
    /// mapped for as long as any copy of the returned handle is used.
    pub unsafe fn from_ptr(ptr: *mut SharedLayout) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    /// Borrow the layout.
    pub fn layout(&self) -> &SharedLayout {
        unsafe { self.ptr.as_ref() }
    }
}
