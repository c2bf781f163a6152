//! Stereo adaptive resampler wrappers for the slave clock domain.
//!
//! The polyphase-sinc engine is rubato; these wrappers adapt it to the
//! interleaved float32 frames the rings and hardware buffers carry, with all
//! staging preallocated so the realtime callbacks never allocate. Ratios
//! follow rubato's convention: output rate divided by input rate.

use rubato::{
    Resampler, SincFixedIn, SincFixedOut, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};

use crate::error::EngineError;
use crate::{CHANNELS, STAGE_MAX_FRAMES};

/// Largest ratio swing the resamplers accept relative to unity. USB clock
/// drift is parts-per-million; anything past a few percent is a glitch.
const MAX_RATIO_DEVIATION: f64 = 1.05;

fn sinc_params() -> SincInterpolationParameters {
    // Medium-quality polyphase sinc: comfortably transparent for stereo
    // program material without blowing the realtime budget.
    SincInterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    }
}

fn clamp_ratio(ratio: f64) -> f64 {
    ratio.clamp(1.0 / MAX_RATIO_DEVIATION, MAX_RATIO_DEVIATION)
}

fn deinterleave(input: &[f32], planar: &mut [Vec<f32>; CHANNELS], frames: usize) {
    for ch in planar.iter_mut() {
        ch.clear();
    }
    for frame in input[..frames * CHANNELS].chunks_exact(CHANNELS) {
        planar[0].push(frame[0]);
        planar[1].push(frame[1]);
    }
}

/// Input-driven resampler: feed whatever the hardware delivered, collect
/// however many master-clock frames that produced. Used on the slave-input
/// and cue paths.
pub struct PushResampler {
    inner: SincFixedIn<f32>,
    chunk: usize,
    pending: Vec<f32>,
    in_planar: [Vec<f32>; CHANNELS],
    out_planar: [Vec<f32>; CHANNELS],
    out_interleaved: Vec<f32>,
}

impl PushResampler {
    /// Build for a fixed per-callback chunk of `chunk_frames` input frames.
    pub fn new(chunk_frames: usize) -> Result<Self, EngineError> {
        let chunk = chunk_frames.clamp(32, STAGE_MAX_FRAMES);
        let inner = SincFixedIn::<f32>::new(1.0, MAX_RATIO_DEVIATION, sinc_params(), chunk, CHANNELS)
            .map_err(|err| EngineError::ResamplerCreation(err.to_string()))?;
        let out_max = inner.output_frames_max();
        let pending_cap = (STAGE_MAX_FRAMES + chunk) * CHANNELS;
        let out_cap = out_max * (STAGE_MAX_FRAMES / chunk + 2) * CHANNELS;
        Ok(Self {
            inner,
            chunk,
            pending: Vec::with_capacity(pending_cap),
            in_planar: [Vec::with_capacity(chunk), Vec::with_capacity(chunk)],
            out_planar: [Vec::with_capacity(out_max), Vec::with_capacity(out_max)],
            out_interleaved: Vec::with_capacity(out_cap),
        })
    }

    /// Set the instantaneous ratio (output rate / input rate) for subsequent
    /// chunks. Values are clamped into the constructed range.
    pub fn set_ratio(&mut self, ratio: f64) {
        self.inner.set_resample_ratio(clamp_ratio(ratio), true).ok();
    }

    /// Feed interleaved input frames; returns the interleaved output produced
    /// this call. Input beyond the staging limit is truncated; leftovers
    /// smaller than one chunk carry over to the next call.
    pub fn process(&mut self, input: &[f32]) -> &[f32] {
        self.out_interleaved.clear();

        let room = self.pending.capacity() - self.pending.len();
        let take = input.len().min(room) & !1;
        self.pending.extend_from_slice(&input[..take]);

        let chunk_samples = self.chunk * CHANNELS;
        while self.pending.len() >= chunk_samples {
            deinterleave(&self.pending, &mut self.in_planar, self.chunk);

            let out_next = self.inner.output_frames_next();
            for ch in self.out_planar.iter_mut() {
                ch.resize(out_next, 0.0);
            }

            if let Ok((_, produced)) =
                self.inner
                    .process_into_buffer(&self.in_planar[..], &mut self.out_planar[..], None)
            {
                for i in 0..produced {
                    self.out_interleaved.push(self.out_planar[0][i]);
                    self.out_interleaved.push(self.out_planar[1][i]);
                }
            }

            self.pending.drain(..chunk_samples);
        }

        &self.out_interleaved
    }
}

/// Output-driven resampler: produces exactly one hardware buffer of slave
/// clock frames per pull, reporting beforehand how many master-clock frames
/// it must consume. Used on the slave-output path.
pub struct PullResampler {
    inner: SincFixedOut<f32>,
    chunk: usize,
    in_planar: [Vec<f32>; CHANNELS],
    out_planar: [Vec<f32>; CHANNELS],
}

impl PullResampler {
    /// Build for a fixed per-callback chunk of `chunk_frames` output frames.
    pub fn new(chunk_frames: usize) -> Result<Self, EngineError> {
        let chunk = chunk_frames.clamp(32, STAGE_MAX_FRAMES);
        let inner =
            SincFixedOut::<f32>::new(1.0, MAX_RATIO_DEVIATION, sinc_params(), chunk, CHANNELS)
                .map_err(|err| EngineError::ResamplerCreation(err.to_string()))?;
        let in_max = inner.input_frames_max();
        Ok(Self {
            inner,
            chunk,
            in_planar: [Vec::with_capacity(in_max), Vec::with_capacity(in_max)],
            out_planar: [vec![0.0; chunk], vec![0.0; chunk]],
        })
    }

    /// Output frames produced per pull.
    pub fn chunk_frames(&self) -> usize {
        self.chunk
    }

    /// Set the instantaneous ratio (output rate / input rate) for the next
    /// pull. Values are clamped into the constructed range.
    pub fn set_ratio(&mut self, ratio: f64) {
        self.inner.set_resample_ratio(clamp_ratio(ratio), true).ok();
    }

    /// Exact number of input frames the next pull will consume. The caller
    /// re-checks ring availability against this before committing.
    pub fn input_frames_needed(&self) -> usize {
        self.inner.input_frames_next()
    }

    /// Consume `input` (at least [`Self::input_frames_needed`] interleaved
    /// frames) and fill `output` with up to one chunk of interleaved frames.
    /// Returns frames produced; the caller zero-pads any shortfall.
    pub fn pull(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let needed = self.inner.input_frames_next();
        if input.len() / CHANNELS < needed {
            return 0;
        }
        deinterleave(input, &mut self.in_planar, needed);

        for ch in self.out_planar.iter_mut() {
            ch.resize(self.chunk, 0.0);
        }

        match self
            .inner
            .process_into_buffer(&self.in_planar[..], &mut self.out_planar[..], None)
        {
            Ok((_, produced)) => {
                let frames = produced.min(output.len() / CHANNELS);
                for i in 0..frames {
                    output[i * CHANNELS] = self.out_planar[0][i];
                    output[i * CHANNELS + 1] = self.out_planar[1][i];
                }
                frames
            }
            Err(_) => 0,
        }
    }
}
