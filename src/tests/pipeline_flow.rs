use std::sync::Arc;

use super::TestRegion;
use crate::engine::{
    CuePath, IoTick, MasterPath, SharedRates, SlavePath, frames_as_bytes, frames_as_bytes_mut,
};
use crate::resample::{PullResampler, PushResampler};
use crate::{BYTES_PER_FRAME, CHANNELS, NOMINAL_SAMPLE_RATE};

const CHUNK: usize = 512;

fn ramp(frames: usize) -> Vec<f32> {
    (0..frames * CHANNELS).map(|i| (i as f32) * 1e-4).collect()
}

/// With a unit ratio, audio cycled master hardware → ring → plugin must come
/// back bit-identical: the master path never resamples.
#[test]
fn master_path_is_bit_exact() {
    let mut tr = TestRegion::new();
    let region = tr.region();
    let rates = Arc::new(SharedRates::new(NOMINAL_SAMPLE_RATE));
    let mut path = MasterPath::new(region, rates, NOMINAL_SAMPLE_RATE);

    let input = ramp(CHUNK * 4);
    let mut host = 1_000_000_000u64;
    for chunk in input.chunks(CHUNK * CHANNELS) {
        path.process(IoTick {
            host_time: host,
            input: Some(chunk),
            input_stamp: Some((0.0, host)),
            output: None,
        });
        host += (CHUNK as f64 / NOMINAL_SAMPLE_RATE * 1e9) as u64;
    }

    let mut cycled = vec![0f32; input.len()];
    assert!(
        tr.region()
            .layout()
            .master_input()
            .read(frames_as_bytes_mut(&mut cycled))
    );
    assert_eq!(cycled, input);
}

#[test]
fn master_path_publishes_clock_and_silences_underrun() {
    let mut tr = TestRegion::new();
    let region = tr.region();
    let rates = Arc::new(SharedRates::new(NOMINAL_SAMPLE_RATE));
    let mut path = MasterPath::new(region, rates, NOMINAL_SAMPLE_RATE);

    let input = ramp(CHUNK);
    let mut output = vec![0.5f32; CHUNK * CHANNELS];
    path.process(IoTick {
        host_time: 2_000_000_000,
        input: Some(&input),
        input_stamp: Some((12_288.0, 2_000_000_000)),
        output: Some(&mut output),
    });

    let (sample_time, host_time, _seed) = tr.region().layout().clock().load();
    assert_eq!(sample_time, 12_288.0);
    assert_eq!(host_time, 2_000_000_000);

    // Nothing was queued for playback, so the output tick got silence.
    assert!(output.iter().all(|&s| s == 0.0));
}

/// Until both trackers are stable the slave input path must pass bytes
/// through untouched rather than resampling (or going silent).
#[test]
fn slave_input_passes_through_raw_during_warmup() {
    let mut tr = TestRegion::new();
    let region = tr.region();
    let rates = Arc::new(SharedRates::new(NOMINAL_SAMPLE_RATE));
    let mut path = SlavePath::new(
        region,
        rates,
        NOMINAL_SAMPLE_RATE,
        PushResampler::new(CHUNK).expect("input resampler"),
        PullResampler::new(CHUNK).expect("output resampler"),
    );

    let input = ramp(CHUNK);
    path.process(IoTick {
        host_time: 1_000_000_000,
        input: Some(&input),
        input_stamp: None,
        output: None,
    });

    let mut cycled = vec![0f32; input.len()];
    assert!(
        tr.region()
            .layout()
            .slave_input()
            .read(frames_as_bytes_mut(&mut cycled))
    );
    assert_eq!(cycled, input, "warmup must be a raw passthrough");
}

/// The cue path mirrors the slave input: raw during warmup, resampled once
/// both rate estimates are stable.
#[test]
fn cue_path_passes_through_then_resamples() {
    let mut tr = TestRegion::new();
    let region = tr.region();
    let rates = Arc::new(SharedRates::new(NOMINAL_SAMPLE_RATE));
    let mut cue = CuePath::new(
        region,
        Arc::clone(&rates),
        PushResampler::new(CHUNK).expect("cue resampler"),
    );

    let input = ramp(CHUNK);
    cue.process(&input);

    let mut cycled = vec![0f32; input.len()];
    let layout = region.layout();
    assert!(layout.cue_input().read(frames_as_bytes_mut(&mut cycled)));
    assert_eq!(cycled, input);

    // Stable estimates switch the path over to the resampler; with a unit
    // ratio it still produces one chunk per chunk once primed.
    rates.master.publish(NOMINAL_SAMPLE_RATE, true);
    rates.slave.publish(NOMINAL_SAMPLE_RATE, true);
    let mut produced = 0usize;
    for _ in 0..8 {
        cue.process(&input);
        produced += layout.cue_input().available_read() as usize / BYTES_PER_FRAME;
        layout.cue_input().clear();
    }
    assert!(
        produced >= CHUNK * 6,
        "resampled cue produced only {produced} frames over 8 chunks"
    );
}

/// Scenario: a 1% clock mismatch held for ten simulated seconds. Once the
/// trackers settle, the slave-output ring neither fills to capacity nor
/// starves persistently, and the path keeps producing audio.
#[test]
fn slave_output_fill_stays_bounded_under_drift() {
    const MASTER_RATE: f64 = 48000.0;
    const SLAVE_RATE: f64 = 48480.0;

    let mut tr = TestRegion::new();
    let region = tr.region();
    let rates = Arc::new(SharedRates::new(NOMINAL_SAMPLE_RATE));
    rates.master.publish(MASTER_RATE, true);

    let mut path = SlavePath::new(
        region,
        Arc::clone(&rates),
        NOMINAL_SAMPLE_RATE,
        PushResampler::new(CHUNK).expect("input resampler"),
        PullResampler::new(CHUNK).expect("output resampler"),
    );
    let layout = region.layout();

    let block = vec![0.25f32; CHUNK * CHANNELS];
    let capture = ramp(CHUNK);
    let mut out = vec![0f32; CHUNK * CHANNELS];

    let master_period = CHUNK as f64 / MASTER_RATE;
    let slave_period = CHUNK as f64 / SLAVE_RATE;
    let mut master_t = 0.0f64;
    let mut slave_t = 0.0f64;

    let mut overruns = 0usize;
    let mut silent_ticks = 0usize;
    let mut measured_ticks = 0usize;
    let mut max_fill = 0i32;

    while master_t < 10.0 || slave_t < 10.0 {
        // Whichever side's clock is due next fires, like two free-running
        // callbacks interleaving in real time.
        if master_t <= slave_t {
            let settled = slave_t > 5.0;
            if !layout.slave_output().write(frames_as_bytes(&block)) && settled {
                overruns += 1;
            }
            master_t += master_period;
        } else {
            // The capture half of the tick is what feeds the tracker, same
            // as the real device callback delivering input and output.
            path.process(IoTick {
                host_time: ((1.0 + slave_t) * 1e9) as u64,
                input: Some(&capture),
                input_stamp: None,
                output: Some(&mut out),
            });
            slave_t += slave_period;

            if slave_t > 5.0 {
                measured_ticks += 1;
                max_fill = max_fill.max(layout.slave_output().available_read());
                if out.iter().all(|&s| s == 0.0) {
                    silent_ticks += 1;
                }
            }
        }
    }

    assert!(rates.slave.is_stable(), "slave tracker never settled");
    let drift = layout.drift_ratio();
    assert!(
        (drift - MASTER_RATE / SLAVE_RATE).abs() < 1e-3,
        "published drift ratio {drift}"
    );

    assert_eq!(overruns, 0, "slave-output ring overran after settling");
    assert!(
        max_fill < (crate::RING_CAPACITY / 2) as i32,
        "ring fill ran away: {max_fill}"
    );
    assert!(
        measured_ticks > 0 && silent_ticks * 3 < measured_ticks,
        "{silent_ticks}/{measured_ticks} settled ticks were silent"
    );
}

/// The engine must come up (and report Running) even with no devices and no
/// cue source present; both paths just stay disconnected until a restart.
#[test]
#[cfg(not(target_os = "macos"))]
fn engine_runs_without_devices_or_cue() {
    use crate::engine::HelperEngine;
    use crate::shm::{DeviceState, HelperStatus};

    let mut tr = TestRegion::new();
    let region = tr.region();
    let mut engine = HelperEngine::new(region, "uid:master", "uid:slave");

    engine.start().expect("start without devices");
    let layout = region.layout();
    assert!(engine.is_running());
    assert!(!engine.cue_running());
    assert_eq!(layout.helper_status(), HelperStatus::Running);
    assert_eq!(layout.master_state(), DeviceState::Disconnected);
    assert_eq!(layout.slave_state(), DeviceState::Disconnected);

    engine.stop();
    assert!(!engine.is_running());
    assert_eq!(layout.helper_status(), HelperStatus::Offline);
}
