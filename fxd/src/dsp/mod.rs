//! Effect implementations the daemon dispatches to. Each effect consumes
//! and produces interleaved little-endian PCM and must keep up with the
//! session's block rate; heavyweight setup belongs in the constructor.

pub mod karaoke;
pub mod noise;
pub mod passthrough;

use std::fmt::Display;

use thiserror::Error;

use fxd_protocol::types::{AudioConfig, EffectKind};

pub use karaoke::Karaoke;
pub use noise::NoiseReduction;
pub use passthrough::Passthrough;

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("unknown parameter key {0}")]
    UnknownKey(u32),
    #[error("invalid parameter value")]
    InvalidValue,
}

pub trait Effect: Display + Send {
    /// Transforms one block. `input` and `output` both hold exactly
    /// `frames * bytes_per_frame` bytes.
    fn process(&mut self, input: &[u8], output: &mut [u8], frames: u32, bytes_per_frame: u32);

    fn set_param(&mut self, key: u32, value: &[u8]) -> Result<(), ParamError> {
        let _ = value;
        Err(ParamError::UnknownKey(key))
    }
}

pub fn create(kind: EffectKind, config: &AudioConfig, passthrough: bool) -> Box<dyn Effect> {
    if passthrough {
        return Box::new(Passthrough);
    }

    match kind {
        EffectKind::Karaoke => Box::new(Karaoke::new(config)),
        EffectKind::NoiseReduction => Box::new(NoiseReduction::new(config)),
    }
}

/// Reads a parameter value as a little-endian f32.
pub(crate) fn param_f32(value: &[u8]) -> Result<f32, ParamError> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| ParamError::InvalidValue)?;
    let value = f32::from_le_bytes(bytes);
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ParamError::InvalidValue)
    }
}

/// Normalized sample access for the two supported widths, alignment-safe.
pub(crate) fn samples_to_f32(format: u32, bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();
    match format {
        16 => {
            for pair in bytes.chunks_exact(2) {
                let sample = i16::from_le_bytes([pair[0], pair[1]]);
                out.push(sample as f32 / i16::MAX as f32);
            }
        }
        _ => {
            for quad in bytes.chunks_exact(4) {
                let sample = i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
                out.push(sample as f32 / i32::MAX as f32);
            }
        }
    }
}

pub(crate) fn samples_from_f32(format: u32, samples: &[f32], out: &mut [u8]) {
    match format {
        16 => {
            for (sample, bytes) in samples.iter().zip(out.chunks_exact_mut(2)) {
                let scaled = (sample * i16::MAX as f32)
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                bytes.copy_from_slice(&scaled.to_le_bytes());
            }
        }
        _ => {
            for (sample, bytes) in samples.iter().zip(out.chunks_exact_mut(4)) {
                let scaled = (sample * i32::MAX as f32)
                    .clamp(i32::MIN as f32, i32::MAX as f32) as i32;
                bytes.copy_from_slice(&scaled.to_le_bytes());
            }
        }
    }
}
