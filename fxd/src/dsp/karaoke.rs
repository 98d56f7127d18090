use std::fmt::{self, Display};

use fxd_protocol::types::AudioConfig;

use super::{param_f32, samples_from_f32, samples_to_f32, Effect, ParamError};

/// Blend between the dry signal and full center cancellation, 0.0..=1.0.
pub const PARAM_STRENGTH: u32 = 1;

/// Center-channel cancellation for stereo material: vocals mixed equally
/// into both channels cancel out of the side signal. Mono and multichannel
/// streams pass through untouched.
pub struct Karaoke {
    channels: u32,
    format: u32,
    strength: f32,
    scratch_in: Vec<f32>,
    scratch_out: Vec<f32>,
}

impl Karaoke {
    pub fn new(config: &AudioConfig) -> Karaoke {
        Karaoke {
            channels: config.channels,
            format: config.format,
            strength: 1.0,
            scratch_in: Vec::with_capacity(config.block_size()),
            scratch_out: Vec::with_capacity(config.block_size()),
        }
    }
}

impl Effect for Karaoke {
    fn process(&mut self, input: &[u8], output: &mut [u8], _frames: u32, _bytes_per_frame: u32) {
        if self.channels != 2 {
            output.copy_from_slice(input);
            return;
        }

        samples_to_f32(self.format, input, &mut self.scratch_in);
        self.scratch_out.clear();

        for frame in self.scratch_in.chunks_exact(2) {
            let (left, right) = (frame[0], frame[1]);
            let side = (left - right) * 0.5;

            self.scratch_out.push(left * (1.0 - self.strength) + side * self.strength);
            self.scratch_out.push(right * (1.0 - self.strength) - side * self.strength);
        }

        samples_from_f32(self.format, &self.scratch_out, output);
    }

    fn set_param(&mut self, key: u32, value: &[u8]) -> Result<(), ParamError> {
        match key {
            PARAM_STRENGTH => {
                self.strength = param_f32(value)?.clamp(0.0, 1.0);
                Ok(())
            }
            _ => Err(ParamError::UnknownKey(key)),
        }
    }
}

impl Display for Karaoke {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "karaoke (strength {:.2})", self.strength)
    }
}
