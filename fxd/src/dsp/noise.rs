use std::fmt::{self, Display};

use fxd_protocol::types::AudioConfig;

use super::{param_f32, samples_from_f32, samples_to_f32, Effect, ParamError};

/// RMS level below which a block counts as noise, 0.0..=1.0 full scale.
pub const PARAM_THRESHOLD: u32 = 1;
/// Gain applied to noise blocks, 0.0..=1.0.
pub const PARAM_ATTENUATION: u32 = 2;

/// Per-block smoothing toward the target gain; keeps the gate from
/// clicking at block boundaries.
const GAIN_SLEW: f32 = 0.2;

/// A block-level noise gate: blocks whose RMS falls under the threshold
/// are attenuated, with the gain slewed between blocks.
pub struct NoiseReduction {
    format: u32,
    threshold: f32,
    attenuation: f32,
    gain: f32,
    scratch: Vec<f32>,
}

impl NoiseReduction {
    pub fn new(config: &AudioConfig) -> NoiseReduction {
        NoiseReduction {
            format: config.format,
            threshold: 0.02,
            attenuation: 0.1,
            gain: 1.0,
            scratch: Vec::with_capacity(config.block_size()),
        }
    }
}

impl Effect for NoiseReduction {
    fn process(&mut self, input: &[u8], output: &mut [u8], _frames: u32, _bytes_per_frame: u32) {
        samples_to_f32(self.format, input, &mut self.scratch);

        let power: f32 = self.scratch.iter().map(|s| s * s).sum();
        let rms = (power / self.scratch.len().max(1) as f32).sqrt();

        let target = if rms < self.threshold { self.attenuation } else { 1.0 };
        self.gain += (target - self.gain) * GAIN_SLEW;

        for sample in &mut self.scratch {
            *sample *= self.gain;
        }

        samples_from_f32(self.format, &self.scratch, output);
    }

    fn set_param(&mut self, key: u32, value: &[u8]) -> Result<(), ParamError> {
        match key {
            PARAM_THRESHOLD => {
                self.threshold = param_f32(value)?.clamp(0.0, 1.0);
                Ok(())
            }
            PARAM_ATTENUATION => {
                self.attenuation = param_f32(value)?.clamp(0.0, 1.0);
                Ok(())
            }
            _ => Err(ParamError::UnknownKey(key)),
        }
    }
}

impl Display for NoiseReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "noise-reduction (threshold {:.3}, attenuation {:.2})",
            self.threshold, self.attenuation
        )
    }
}
