#![deny(missing_docs)]

//! Drift-locked aggregate bridge for two free-running USB audio devices.
//!
//! Two cooperating processes present a pair of USB audio interfaces — a clock
//! master ("Push") and a clock slave ("FLX4") — to the host audio stack as one
//! virtual device. The helper daemon (`driftlinkd`) owns all hardware I/O and
//! continuously estimates each device's true sample rate with a
//! [`drift::DriftTracker`]; the slave path is pulled into the master's clock
//! domain by adaptive resampling. The plugin half, loaded into the OS audio
//! daemon, never touches hardware: it serves audio out of lock-free
//! [`ring::RingBuffer`]s in a shared memory region handed over through
//! [`ipc`], and derives the virtual device's clock from the master clock
//! record the helper publishes in [`shm::SharedLayout`].

pub mod device;
pub mod drift;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod plugin;
pub mod resample;
pub mod ring;
pub mod shm;
pub mod tap;

#[cfg(test)]
mod tests;

/// Well-known service name the helper registers and the plugin looks up.
pub const SERVICE_NAME: &str = "com.driftlink.aggregate.helper";

/// Ring buffer capacity per stream, in bytes.
///
/// 65536 bytes is roughly 340 ms at 48 kHz stereo float32 — enough runway for
/// drift-tracker convergence (one to two seconds) without underruns at typical
/// hardware buffer sizes, while keeping the worst-case latency low.
pub const RING_CAPACITY: usize = 65536;

/// Channels per device stream (stereo only).
pub const CHANNELS: usize = 2;

/// Bytes per interleaved stereo float32 frame.
pub const BYTES_PER_FRAME: usize = CHANNELS * size_of::<f32>();

/// Nominal sample rate shared by both devices.
pub const NOMINAL_SAMPLE_RATE: f64 = 48000.0;

/// Maximum frames a resampler staging buffer will accept per callback.
pub const STAGE_MAX_FRAMES: usize = 4096;

/// Latency in frames reported for the slave streams so the host can delay
/// compensate: ring target fill (~1024 frames) plus resampler group delay.
pub const SLAVE_STREAM_LATENCY_FRAMES: u32 = 1088;

/// Zero-based output stream index carrying the slave device's cue channels.
pub const CUE_STREAM_INDEX: u32 = 1;

/// Bundle identifier substring selecting the cue tap's source process.
pub const CUE_PROCESS_SUBSTRING: &str = "algoriddim";

/// Default UID for the master device.
pub const DEFAULT_PUSH_UID: &str = "AppleUSBAudioEngine:Ableton:Ableton Push 3:37589272:2,3";

/// Default UID for the slave device.
pub const DEFAULT_FLX4_UID: &str =
    "AppleUSBAudioEngine:AlphaTheta Corporation:DDJ-FLX4:DKVC227610NN:2,1";

/// Handshake message id: plugin asks the helper for the shared region.
pub const MSG_REQUEST_MEMORY: u32 = 100;

/// Handshake message id: helper replies with the map capability and size.
pub const MSG_MEMORY_REPLY: u32 = 101;
