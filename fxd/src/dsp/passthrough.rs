use std::fmt::{self, Display};

use super::Effect;

/// The null effect: output equals input. Stands in when a session should
/// not touch the audio, and serves as the reference for transport tests.
pub struct Passthrough;

impl Effect for Passthrough {
    fn process(&mut self, input: &[u8], output: &mut [u8], _frames: u32, _bytes_per_frame: u32) {
        output.copy_from_slice(input);
    }
}

impl Display for Passthrough {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "passthrough")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_equals_input() {
        let input: Vec<u8> = (0..64).collect();
        let mut output = vec![0u8; 64];

        Passthrough.process(&input, &mut output, 16, 4);
        assert_eq!(output, input);
    }
}
