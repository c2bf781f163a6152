//! Second-order delay-locked loop for USB clock rate estimation.
//!
//! Filters noisy host-time stamps from I/O callbacks to extract the true
//! sample rate of a free-running USB audio device, after Fons Adriaensen's
//! technique (JACK zita-a2j). The output ratio of two trackers drives the
//! adaptive resamplers on the slave path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use once_cell::sync::Lazy;

#[cfg(target_os = "macos")]
use mach::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

/// Updates after which a tracker's estimate is considered usable.
const STABLE_THRESHOLD: u32 = 50;

/// Saturation point for the stability counter.
const STABLE_CEILING: u32 = 200;

/// Critically damped second-order DLL tracking one device's sample rate.
///
/// One instance per physical device, created at engine start and mutated only
/// on that device's own I/O thread. The caller resets it when the device is
/// reopened; transient timestamp outliers are absorbed by the integrator and
/// must not trigger a reset.
#[derive(Debug, Clone)]
pub struct DriftTracker {
    nominal_rate: f64,
    bandwidth: f64,
    rate: f64,
    predicted_time: f64,
    integral: f64,
    initialized: bool,
    stable_count: u32,
}

impl DriftTracker {
    /// Tracker with the default 1 Hz loop bandwidth.
    pub fn new(nominal_rate: f64) -> Self {
        Self::with_bandwidth(nominal_rate, 1.0)
    }

    /// Tracker with an explicit loop bandwidth in Hz.
    pub fn with_bandwidth(nominal_rate: f64, bandwidth: f64) -> Self {
        Self {
            nominal_rate,
            bandwidth,
            rate: nominal_rate,
            predicted_time: 0.0,
            integral: 0.0,
            initialized: false,
            stable_count: 0,
        }
    }

    /// Feed one I/O callback observation.
    pub fn update(&mut self, host_time: u64, buffer_frames: u32) {
        let t = host_time_to_seconds(host_time);
        let frames = f64::from(buffer_frames);

        if !self.initialized {
            // Predict the next callback, not this one; seeding with the bare
            // observation would start the loop a full period in error.
            self.predicted_time = t + frames / self.nominal_rate;
            self.rate = self.nominal_rate;
            self.integral = 0.0;
            self.initialized = true;
            self.stable_count = 0;
            return;
        }

        let period = frames / self.rate;
        let omega = 2.0 * std::f64::consts::PI * self.bandwidth * period;
        let b = omega * std::f64::consts::SQRT_2;
        let c = omega * omega;

        let error = t - self.predicted_time;
        self.predicted_time += period + b * error;
        self.integral += c * error;
        // The integrator is the total correction to the nominal period;
        // `period` above already carries it, so the denominator must build
        // on the nominal period or the correction would stack twice.
        self.rate = frames / (frames / self.nominal_rate + self.integral);

        if self.stable_count < STABLE_CEILING {
            self.stable_count += 1;
        }
    }

    /// Return the tracker to its uninitialized state.
    pub fn reset(&mut self) {
        self.initialized = false;
        self.rate = self.nominal_rate;
        self.predicted_time = 0.0;
        self.integral = 0.0;
        self.stable_count = 0;
    }

    /// Current rate estimate in Hz.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Rate the tracker was constructed with.
    pub fn nominal_rate(&self) -> f64 {
        self.nominal_rate
    }

    /// True once the estimate has had ~1-2 seconds of callbacks to settle.
    pub fn is_stable(&self) -> bool {
        self.initialized && self.stable_count > STABLE_THRESHOLD
    }
}

/// Lock-free mirror of one tracker's estimate for readers on other realtime
/// threads (the slave and cue callbacks consult the master's rate).
pub struct SharedRate {
    rate_bits: AtomicU64,
    stable: AtomicBool,
}

impl SharedRate {
    /// Mirror seeded with a nominal rate and marked unstable.
    pub fn new(nominal_rate: f64) -> Self {
        Self {
            rate_bits: AtomicU64::new(nominal_rate.to_bits()),
            stable: AtomicBool::new(false),
        }
    }

    /// Publish the owning thread's latest estimate.
    pub fn publish(&self, rate: f64, stable: bool) {
        self.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
        self.stable.store(stable, Ordering::Relaxed);
    }

    /// Last published rate in Hz.
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    /// Whether the owning tracker reported itself stable.
    pub fn is_stable(&self) -> bool {
        self.stable.load(Ordering::Relaxed)
    }
}

#[cfg(target_os = "macos")]
fn timebase() -> (u64, u64) {
    static TIMEBASE: Lazy<(u64, u64)> = Lazy::new(|| unsafe {
        let mut info = mach_timebase_info_data_t::default();
        mach_timebase_info(&mut info);
        (u64::from(info.numer), u64::from(info.denom))
    });
    *TIMEBASE
}

/// Convert a host time stamp to seconds on the monotonic clock.
///
/// Apple Silicon has a non-trivial mach timebase (not 1:1 like Intel); on
/// other platforms host time is taken to be nanoseconds.
pub fn host_time_to_seconds(host_time: u64) -> f64 {
    #[cfg(target_os = "macos")]
    {
        let (numer, denom) = timebase();
        host_time as f64 * numer as f64 / denom as f64 / 1e9
    }
    #[cfg(not(target_os = "macos"))]
    {
        host_time as f64 / 1e9
    }
}

/// Current host time in the unit [`host_time_to_seconds`] expects.
pub fn monotonic_host_time() -> u64 {
    #[cfg(target_os = "macos")]
    {
        unsafe { mach_absolute_time() }
    }
    #[cfg(not(target_os = "macos"))]
    {
        static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
        let elapsed = START.elapsed();
        elapsed.as_secs() * 1_000_000_000 + u64::from(elapsed.subsec_nanos())
    }
}
