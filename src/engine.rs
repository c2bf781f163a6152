//! Helper-side engine: composes the device adapters, drift trackers,
//! resamplers, and shared rings into the master and slave audio paths.
//!
//! Each physical device's realtime callback owns its path state outright
//! (tracker, resamplers, staging); the only things crossing threads are the
//! [`SharedRates`] mirrors and the shared region itself. The ring buffers are
//! the queue — there are no internal pools or locks.

use std::sync::Arc;

use tracing::{info, warn};

use crate::device::HardwareDevice;
use crate::drift::{DriftTracker, SharedRate};
use crate::error::EngineError;
use crate::resample::{PullResampler, PushResampler};
use crate::shm::{DeviceState, HelperStatus, SharedRegion};
use crate::tap::ProcessTap;
use crate::{BYTES_PER_FRAME, CHANNELS, CUE_PROCESS_SUBSTRING, CUE_STREAM_INDEX, NOMINAL_SAMPLE_RATE};

/// Fallback hardware buffer size when the device does not report one.
const DEFAULT_CHUNK_FRAMES: usize = 512;

/// One hardware I/O callback's worth of borrowed buffers and timestamps.
pub struct IoTick<'a> {
    /// Host time of the callback ("now"); 0 when the stamp was invalid.
    pub host_time: u64,
    /// Interleaved input frames captured this tick, if the device has inputs.
    pub input: Option<&'a [f32]>,
    /// (sample time, host time) stamp for the input buffer, when valid.
    pub input_stamp: Option<(f64, u64)>,
    /// Interleaved output frames to fill, if the device has outputs.
    pub output: Option<&'a mut [f32]>,
}

/// Rate mirrors linking the master, slave, and cue callbacks.
pub struct SharedRates {
    /// Master device estimate, written by the master callback.
    pub master: SharedRate,
    /// Slave device estimate, written by the slave callback.
    pub slave: SharedRate,
}

impl SharedRates {
    /// Mirrors seeded at the nominal rate and marked unstable.
    pub fn new(nominal_rate: f64) -> Self {
        Self {
            master: SharedRate::new(nominal_rate),
            slave: SharedRate::new(nominal_rate),
        }
    }

    fn both_stable(&self) -> bool {
        self.master.is_stable() && self.slave.is_stable()
    }
}

pub(crate) fn frames_as_bytes(frames: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(frames.as_ptr().cast(), size_of_val(frames)) }
}

pub(crate) fn frames_as_bytes_mut(frames: &mut [f32]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(frames.as_mut_ptr().cast(), size_of_val(frames)) }
}

/// Master path: direct passthrough between hardware and the shared rings,
/// plus clock publication. Zero added latency — no resampling here.
pub struct MasterPath {
    dll: DriftTracker,
    rates: Arc<SharedRates>,
    region: SharedRegion,
}

impl MasterPath {
    /// Path state for the master device's callback.
    pub fn new(region: SharedRegion, rates: Arc<SharedRates>, nominal_rate: f64) -> Self {
        Self {
            dll: DriftTracker::new(nominal_rate),
            rates,
            region,
        }
    }

    /// Handle one master I/O tick.
    pub fn process(&mut self, tick: IoTick<'_>) {
        let frames = tick.input.map_or(0, |buf| buf.len() / CHANNELS) as u32;
        if tick.host_time != 0 && frames > 0 {
            self.dll.update(tick.host_time, frames);
            self.rates
                .master
                .publish(self.dll.rate(), self.dll.is_stable());
        }

        let layout = self.region.layout();

        // The plugin extrapolates the virtual device's clock from this.
        if let Some((sample_time, host_time)) = tick.input_stamp {
            layout.clock().publish(sample_time, host_time);
        }

        if let Some(input) = tick.input {
            // Overrun while the plugin is absent just drops the block.
            let _ = layout.master_input().write(frames_as_bytes(input));
        }

        if let Some(output) = tick.output {
            if !layout.master_output().read(frames_as_bytes_mut(output)) {
                output.fill(0.0);
            }
        }
    }
}

/// Slave path: resampled into and out of the master clock domain once both
/// trackers are stable; raw passthrough during warmup.
pub struct SlavePath {
    dll: DriftTracker,
    rates: Arc<SharedRates>,
    region: SharedRegion,
    input_rs: PushResampler,
    output_rs: PullResampler,
    stage: Vec<f32>,
}

impl SlavePath {
    /// Path state for the slave device's callback.
    pub fn new(
        region: SharedRegion,
        rates: Arc<SharedRates>,
        nominal_rate: f64,
        input_rs: PushResampler,
        output_rs: PullResampler,
    ) -> Self {
        let stage = vec![0.0; crate::STAGE_MAX_FRAMES * CHANNELS];
        Self {
            dll: DriftTracker::new(nominal_rate),
            rates,
            region,
            input_rs,
            output_rs,
            stage,
        }
    }

    /// Handle one slave I/O tick.
    pub fn process(&mut self, tick: IoTick<'_>) {
        let frames = tick.input.map_or(0, |buf| buf.len() / CHANNELS) as u32;
        if tick.host_time != 0 && frames > 0 {
            self.dll.update(tick.host_time, frames);
            self.rates
                .slave
                .publish(self.dll.rate(), self.dll.is_stable());
        }

        let layout = self.region.layout();
        let ready = self.rates.master.is_stable() && self.dll.is_stable();
        if ready {
            layout.set_drift_ratio(self.rates.master.rate() / self.dll.rate());
        }

        // Slave hardware input → master clock domain → shared ring.
        if let Some(input) = tick.input {
            if ready {
                let ratio = self.rates.master.rate() / self.dll.rate();
                self.input_rs.set_ratio(ratio);
                let resampled = self.input_rs.process(input);
                let _ = layout.slave_input().write(frames_as_bytes(resampled));
            } else {
                // Warmup: nominal-rate audio beats silence; it drifts until
                // both trackers converge.
                let _ = layout.slave_input().write(frames_as_bytes(input));
            }
        }

        // Shared ring (master clock domain) → slave hardware output.
        if let Some(output) = tick.output {
            let out_frames = output.len() / CHANNELS;
            if ready && out_frames == self.output_rs.chunk_frames() {
                let ratio = self.dll.rate() / self.rates.master.rate();
                self.output_rs.set_ratio(ratio);

                let needed = self.output_rs.input_frames_needed();
                let needed_samples = needed * CHANNELS;
                let ring = layout.slave_output();
                let have = ring.available_read() as usize;
                if needed_samples <= self.stage.len()
                    && have >= needed * BYTES_PER_FRAME
                    && ring.read(frames_as_bytes_mut(&mut self.stage[..needed_samples]))
                {
                    let produced = self.output_rs.pull(&self.stage[..needed_samples], output);
                    // Short resampler output never reaches the hardware: pad.
                    output[produced * CHANNELS..].fill(0.0);
                } else {
                    output.fill(0.0);
                }
            } else if !layout.slave_output().read(frames_as_bytes_mut(output)) {
                output.fill(0.0);
            }
        }
    }
}

/// Cue path: mirrors the slave input but sources audio from the process tap.
pub struct CuePath {
    resampler: PushResampler,
    rates: Arc<SharedRates>,
    region: SharedRegion,
}

impl CuePath {
    /// Path state for the tap's callback.
    pub fn new(region: SharedRegion, rates: Arc<SharedRates>, resampler: PushResampler) -> Self {
        Self {
            resampler,
            rates,
            region,
        }
    }

    /// Handle one tap delivery of interleaved frames at the slave clock.
    pub fn process(&mut self, input: &[f32]) {
        let layout = self.region.layout();
        if self.rates.both_stable() {
            let ratio = self.rates.master.rate() / self.rates.slave.rate();
            self.resampler.set_ratio(ratio);
            let resampled = self.resampler.process(input);
            let _ = layout.cue_input().write(frames_as_bytes(resampled));
        } else {
            let _ = layout.cue_input().write(frames_as_bytes(input));
        }
    }
}

/// Helper engine tying both devices, the optional tap, and the shared region
/// into one lifecycle.
pub struct HelperEngine {
    region: SharedRegion,
    rates: Arc<SharedRates>,
    master: HardwareDevice,
    slave: HardwareDevice,
    tap: ProcessTap,
    master_uid: String,
    slave_uid: String,
    running: bool,
}

impl HelperEngine {
    /// Engine bound to an initialized shared region and two device UIDs.
    pub fn new(
        region: SharedRegion,
        master_uid: impl Into<String>,
        slave_uid: impl Into<String>,
    ) -> Self {
        Self {
            region,
            rates: Arc::new(SharedRates::new(NOMINAL_SAMPLE_RATE)),
            master: HardwareDevice::new(),
            slave: HardwareDevice::new(),
            tap: ProcessTap::new(),
            master_uid: master_uid.into(),
            slave_uid: slave_uid.into(),
            running: false,
        }
    }

    /// Open both devices, start their I/O, and publish Running status.
    ///
    /// A missing device is not fatal — its path serves silence until the next
    /// start. A failed main-path resampler is fatal. The cue tap is attempted
    /// last and any failure there is ignored.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running {
            return Ok(());
        }
        // Borrow the layout through a copy of the handle so the borrow does
        // not pin `self` across the `&mut self` calls below.
        let region = self.region;
        let layout = region.layout();
        layout.clock().bump_seed();

        // Master: the clock authority, straight passthrough.
        if self.master.open(&self.master_uid) {
            let reported = self.master.nominal_sample_rate();
            let nominal = if reported > 0.0 { reported } else { NOMINAL_SAMPLE_RATE };
            info!(uid = %self.master_uid, rate = nominal, "master device open");
            layout.set_master_state(DeviceState::Connected);
            let mut path = MasterPath::new(self.region, self.rates.clone(), nominal);
            if self.master.start(move |tick| path.process(tick)) {
                layout.set_master_state(DeviceState::Running);
            }
        } else {
            warn!(uid = %self.master_uid, "master device not found, will retry on next start");
        }

        // Slave: pulled into the master clock domain.
        if self.slave.open(&self.slave_uid) {
            let reported = self.slave.nominal_sample_rate();
            let nominal = if reported > 0.0 { reported } else { NOMINAL_SAMPLE_RATE };
            let chunk = match self.slave.buffer_frame_size() {
                0 => DEFAULT_CHUNK_FRAMES,
                n => n as usize,
            };

            let input_rs = match PushResampler::new(chunk) {
                Ok(rs) => rs,
                Err(err) => return Err(self.abort_start(err)),
            };
            let output_rs = match PullResampler::new(chunk) {
                Ok(rs) => rs,
                Err(err) => return Err(self.abort_start(err)),
            };

            info!(uid = %self.slave_uid, rate = nominal, chunk, "slave device open");
            layout.set_slave_state(DeviceState::Connected);
            let mut path =
                SlavePath::new(self.region, self.rates.clone(), nominal, input_rs, output_rs);
            if self.slave.start(move |tick| path.process(tick)) {
                layout.set_slave_state(DeviceState::Running);
            }

            if self.slave.is_running() {
                self.start_cue_tap(chunk);
            }
        } else {
            warn!(uid = %self.slave_uid, "slave device not found, will retry on next start");
        }

        layout.set_helper_status(HelperStatus::Running);
        self.running = true;
        info!(
            master = self.master.is_running(),
            slave = self.slave.is_running(),
            cue = self.tap.is_running(),
            "engine started"
        );
        Ok(())
    }

    fn start_cue_tap(&mut self, chunk: usize) {
        let resampler = match PushResampler::new(chunk) {
            Ok(rs) => rs,
            Err(err) => {
                warn!(%err, "cue resampler unavailable, continuing without cue");
                return;
            }
        };
        let mut cue = CuePath::new(self.region, self.rates.clone(), resampler);
        if self
            .tap
            .create(&self.slave_uid, CUE_STREAM_INDEX, CUE_PROCESS_SUBSTRING)
            && self.tap.start(move |frames| cue.process(frames))
        {
            info!(stream = CUE_STREAM_INDEX, "cue tap running");
        } else {
            info!("cue tap unavailable, continuing without cue");
        }
    }

    fn abort_start(&mut self, err: EngineError) -> EngineError {
        self.master.stop();
        self.slave.stop();
        let layout = self.region.layout();
        layout.set_master_state(DeviceState::Disconnected);
        layout.set_slave_state(DeviceState::Disconnected);
        layout.set_helper_status(HelperStatus::Error);
        err
    }

    /// Stop the tap and both devices, then publish Disconnected/Offline.
    ///
    /// Device stop is synchronous, and dropping a device's callback drops the
    /// path state it owns — so the resamplers are torn down strictly after
    /// the last realtime tick has returned.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.tap.stop();
        self.master.stop();
        self.slave.stop();

        let layout = self.region.layout();
        layout.set_master_state(DeviceState::Disconnected);
        layout.set_slave_state(DeviceState::Disconnected);
        layout.set_helper_status(HelperStatus::Offline);
        self.running = false;
        info!("engine stopped");
    }

    /// Whether `start` has completed and `stop` has not run since.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the master device is delivering callbacks.
    pub fn master_running(&self) -> bool {
        self.master.is_running()
    }

    /// Whether the slave device is delivering callbacks.
    pub fn slave_running(&self) -> bool {
        self.slave.is_running()
    }

    /// Whether tapped cue audio is flowing.
    pub fn cue_running(&self) -> bool {
        self.tap.is_running()
    }
}

impl Drop for HelperEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
