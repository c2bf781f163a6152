//! Plugin-side engine: the virtual device surface over the shared region.
//!
//! Loaded into the OS audio daemon, where hardware APIs are off limits — the
//! plugin only maps the helper's region and moves bytes between the host's
//! stream buffers and the rings. The host framework expects a control
//! capability (start/stop) and an I/O capability (read input, write mixed
//! output); both live on this one handler value, with streams told apart by
//! [`StreamId`] tags rather than separate handler objects.
//!
//! The C-ABI surface at the bottom is what the framework shim calls; the
//! audio daemon offers no usable stderr, so diagnostics accumulate in a
//! bounded in-memory buffer the shim drains via
//! [`driftlink_plugin_pop_log`].

use std::collections::VecDeque;
use std::ffi::{CString, c_char};
use std::ptr;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::SLAVE_STREAM_LATENCY_FRAMES;
use crate::error::HandshakeError;
use crate::ipc::RegionClient;
use crate::shm::HelperStatus;

/// Tags for the virtual device's four-or-five streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamId {
    /// Master device capture.
    MasterInput = 0,
    /// Slave device capture, already in the master clock domain.
    SlaveInput = 1,
    /// Tapped cue capture, already in the master clock domain.
    CueInput = 2,
    /// Master device playback.
    MasterOutput = 3,
    /// Slave device playback; the helper resamples it to the slave clock.
    SlaveOutput = 4,
}

impl StreamId {
    /// Tag for a wire value, if it names a stream.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::MasterInput),
            1 => Some(Self::SlaveInput),
            2 => Some(Self::CueInput),
            3 => Some(Self::MasterOutput),
            4 => Some(Self::SlaveOutput),
            _ => None,
        }
    }
}

/// Handler realizing the framework's control and I/O capabilities.
pub struct PluginEngine {
    client: RegionClient,
}

impl Default for PluginEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginEngine {
    /// A handler with no region mapped yet.
    pub fn new() -> Self {
        Self {
            client: RegionClient::new(),
        }
    }

    /// Control capability, start: connect to the helper on first use and gate
    /// on it actually running. Failure here makes the host's start fail; the
    /// host retries on its next start.
    pub fn on_start_io(&mut self) -> Result<(), HandshakeError> {
        let region = self.client.connect()?;
        if region.layout().helper_status() != HelperStatus::Running {
            push_log("start io refused: helper not running");
            return Err(HandshakeError::ServiceUnavailable);
        }
        push_log("start io: helper running");
        Ok(())
    }

    /// Control capability, stop. The mapping stays for the next start.
    pub fn on_stop_io(&mut self) {
        push_log("stop io");
    }

    /// Clock query: the master clock record as (sample time, host time,
    /// seed). Both halves are read relaxed; the host only extrapolates from
    /// them, so momentary incoherence is tolerated.
    pub fn zero_timestamp(&self) -> (f64, u64, u64) {
        match self.client.region() {
            Some(region) => region.layout().clock().load(),
            None => (0.0, 0, 0),
        }
    }

    /// I/O capability, input: fill `dst` from the stream's ring, silence on
    /// underrun. Runs on the HAL realtime thread — just ring reads.
    pub fn read_client_input(&self, stream: StreamId, dst: &mut [u8]) {
        let Some(region) = self.client.region() else {
            dst.fill(0);
            return;
        };
        let layout = region.layout();
        let ring = match stream {
            StreamId::MasterInput => layout.master_input(),
            StreamId::SlaveInput => layout.slave_input(),
            StreamId::CueInput => layout.cue_input(),
            StreamId::MasterOutput | StreamId::SlaveOutput => {
                dst.fill(0);
                return;
            }
        };
        if !ring.read(dst) {
            dst.fill(0);
        }
    }

    /// I/O capability, output: push the host's mixed buffer into the stream's
    /// ring. A full ring drops the block.
    pub fn write_mixed_output(&self, stream: StreamId, src: &[u8]) {
        let Some(region) = self.client.region() else {
            return;
        };
        let layout = region.layout();
        let _ = match stream {
            StreamId::MasterOutput => layout.master_output().write(src),
            StreamId::SlaveOutput => layout.slave_output().write(src),
            StreamId::MasterInput | StreamId::SlaveInput | StreamId::CueInput => false,
        };
    }

    /// Latency in frames the host should report for a stream. The master
    /// path adds none; the slave paths cover their ring fill and resampler
    /// group delay.
    pub fn stream_latency(stream: StreamId) -> u32 {
        match stream {
            StreamId::MasterInput | StreamId::MasterOutput => 0,
            StreamId::SlaveInput | StreamId::SlaveOutput | StreamId::CueInput => {
                SLAVE_STREAM_LATENCY_FRAMES
            }
        }
    }

    /// Drop the mapping. A later start reconnects.
    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }
}

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static LOG_CACHE: Lazy<Mutex<Option<CString>>> = Lazy::new(|| Mutex::new(None));

fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > 256 {
        guard.pop_front();
    }
}

/// Create a plugin handler. The shim owns the returned pointer.
#[unsafe(no_mangle)]
pub extern "C" fn driftlink_plugin_new() -> *mut PluginEngine {
    Box::into_raw(Box::new(PluginEngine::new()))
}

/// Destroy a handler created by [`driftlink_plugin_new`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn driftlink_plugin_free(handle: *mut PluginEngine) {
    if !handle.is_null() {
        unsafe { drop(Box::from_raw(handle)) };
    }
}

/// OnStartIO entry. Returns 0 on success, -1 when the helper is unavailable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn driftlink_plugin_start_io(handle: *mut PluginEngine) -> i32 {
    let Some(engine) = (unsafe { handle.as_mut() }) else {
        return -1;
    };
    match engine.on_start_io() {
        Ok(()) => 0,
        Err(err) => {
            push_log(format!("start io failed: {err}"));
            -1
        }
    }
}

/// OnStopIO entry.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn driftlink_plugin_stop_io(handle: *mut PluginEngine) {
    if let Some(engine) = unsafe { handle.as_mut() } {
        engine.on_stop_io();
    }
}

/// Clock query entry. Writes the master clock record into the out params.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn driftlink_plugin_zero_timestamp(
    handle: *const PluginEngine,
    out_sample_time: *mut f64,
    out_host_time: *mut u64,
    out_seed: *mut u64,
) {
    let record = match unsafe { handle.as_ref() } {
        Some(engine) => engine.zero_timestamp(),
        None => (0.0, 0, 0),
    };
    unsafe {
        if !out_sample_time.is_null() {
            *out_sample_time = record.0;
        }
        if !out_host_time.is_null() {
            *out_host_time = record.1;
        }
        if !out_seed.is_null() {
            *out_seed = record.2;
        }
    }
}

/// Input I/O entry: fill `buf` (`len` bytes) from `stream`'s ring.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn driftlink_plugin_read_input(
    handle: *const PluginEngine,
    stream: u32,
    buf: *mut u8,
    len: usize,
) {
    if buf.is_null() || len == 0 {
        return;
    }
    let dst = unsafe { std::slice::from_raw_parts_mut(buf, len) };
    match (unsafe { handle.as_ref() }, StreamId::from_u32(stream)) {
        (Some(engine), Some(stream)) => engine.read_client_input(stream, dst),
        _ => dst.fill(0),
    }
}

/// Output I/O entry: push `buf` (`len` bytes) into `stream`'s ring.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn driftlink_plugin_write_output(
    handle: *const PluginEngine,
    stream: u32,
    buf: *const u8,
    len: usize,
) {
    if buf.is_null() || len == 0 {
        return;
    }
    let src = unsafe { std::slice::from_raw_parts(buf, len) };
    if let (Some(engine), Some(stream)) = (unsafe { handle.as_ref() }, StreamId::from_u32(stream)) {
        engine.write_mixed_output(stream, src);
    }
}

/// Reported latency in frames for the given stream tag.
#[unsafe(no_mangle)]
pub extern "C" fn driftlink_plugin_stream_latency(stream: u32) -> u32 {
    StreamId::from_u32(stream).map_or(0, PluginEngine::stream_latency)
}

/// Pop the next buffered log line, or `NULL` when none remain. The returned
/// pointer stays valid until the next call.
#[unsafe(no_mangle)]
pub extern "C" fn driftlink_plugin_pop_log() -> *const c_char {
    if let Some(message) = LOG_BUFFER.lock().pop_front() {
        let mut cache = LOG_CACHE.lock();
        *cache = Some(CString::new(message).unwrap_or_default());
        cache.as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null())
    } else {
        ptr::null()
    }
}
