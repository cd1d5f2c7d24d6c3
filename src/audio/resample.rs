//! Capture-side conditioning: mono mixdown, rate conversion and framing
//!
//! Capture devices rarely run at exactly 16 kHz mono with a convenient
//! buffer size. The capture callback pushes whatever the device delivers
//! through a [`FrameAssembler`], which hands back fixed-length frames at the
//! call's capture rate.
//!
//! Device callbacks arrive in blocks of arbitrary size, so conversion state
//! (the partial averaging group, or the interpolation phase and the last
//! input sample) carries over from one block to the next. Over any run of
//! pushes the output count stays within one source sample of
//! `input * target / source`.

/// Take channel 0 of interleaved samples.
pub fn first_channel(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved.iter().step_by(channels).copied().collect()
}

#[derive(Debug)]
enum Mode {
    Passthrough,
    /// Integer downsampling ratio: average each group of `ratio` samples
    Average { ratio: usize, sum: f32, count: usize },
    /// Any other ratio: linear interpolation
    Interpolate {
        /// Input samples per output sample
        step: f64,
        /// Position of the next output, in input samples after `last`
        phase: f64,
        /// Final sample of the previous block
        last: Option<f32>,
    },
}

/// Streaming sample-rate converter
#[derive(Debug)]
pub struct Resampler {
    mode: Mode,
}

impl Resampler {
    /// Integer downsampling ratios (48kHz → 16kHz) average each group of
    /// samples; any other ratio uses linear interpolation.
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        let mode = if source_rate == 0 || target_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), passing samples through",
                source_rate,
                target_rate
            );
            Mode::Passthrough
        } else if source_rate == target_rate {
            Mode::Passthrough
        } else if source_rate > target_rate && source_rate % target_rate == 0 {
            Mode::Average {
                ratio: (source_rate / target_rate) as usize,
                sum: 0.0,
                count: 0,
            }
        } else {
            Mode::Interpolate {
                step: source_rate as f64 / target_rate as f64,
                phase: 0.0,
                last: None,
            }
        };
        Self { mode }
    }

    /// Convert one block, appending the output to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        match &mut self.mode {
            Mode::Passthrough => out.extend_from_slice(input),
            Mode::Average { ratio, sum, count } => {
                for &sample in input {
                    *sum += sample;
                    *count += 1;
                    if *count == *ratio {
                        out.push(*sum / *ratio as f32);
                        *sum = 0.0;
                        *count = 0;
                    }
                }
            }
            Mode::Interpolate { step, phase, last } => {
                if input.is_empty() {
                    return;
                }

                // Index 0 is the previous block's last sample, when there is one
                let offset = usize::from(last.is_some());
                let at = |i: usize| -> f32 {
                    match (i, *last) {
                        (0, Some(previous)) => previous,
                        _ => input[i - offset],
                    }
                };
                let len = input.len() + offset;

                while (*phase as usize) + 1 < len {
                    let idx = *phase as usize;
                    let frac = (*phase - idx as f64) as f32;
                    let s1 = at(idx);
                    let s2 = at(idx + 1);
                    out.push(s1 + (s2 - s1) * frac);
                    *phase += *step;
                }

                *phase -= (len - 1) as f64;
                *last = input.last().copied();
            }
        }
    }
}

/// Accumulates conditioned samples and releases fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    resampler: Resampler,
    channels: usize,
    frame_len: usize,
    buffer: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(source_rate: u32, target_rate: u32, channels: usize, frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            resampler: Resampler::new(source_rate, target_rate),
            channels: channels.max(1),
            frame_len,
            buffer: Vec::with_capacity(frame_len * 2),
        }
    }

    /// Push one device callback's worth of interleaved samples.
    ///
    /// Returns every frame that became complete, oldest first.
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<Vec<f32>> {
        let mono = first_channel(interleaved, self.channels);
        self.resampler.process(&mono, &mut self.buffer);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_len {
            frames.push(self.buffer.drain(..self.frame_len).collect());
        }
        frames
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
