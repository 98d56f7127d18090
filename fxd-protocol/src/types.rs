use bytemuck::{Pod, Zeroable};

pub mod stats;

#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(transparent)]
pub struct Magic(u32);

impl Magic {
    const fn tag(tag: u8) -> Self {
        Magic(((tag as u32) << 24) | 0x00effec7)
    }

    pub const OPEN: Magic        = Magic::tag(0x01);
    pub const START: Magic       = Magic::tag(0x02);
    pub const STOP: Magic        = Magic::tag(0x03);
    pub const CLOSE: Magic       = Magic::tag(0x04);
    pub const SET_PARAM: Magic   = Magic::tag(0x05);
    pub const QUERY_STATE: Magic = Magic::tag(0x06);
    pub const QUERY_STATS: Magic = Magic::tag(0x07);

    pub const OPEN_REPLY: Magic  = Magic::tag(0x81);
    pub const REPLY: Magic       = Magic::tag(0x82);
    pub const STATE_REPLY: Magic = Magic::tag(0x83);
    pub const STATS_REPLY: Magic = Magic::tag(0x84);
}

/// Stable result codes shared by the client API and the control wire.
#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(transparent)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const OK: ResultCode                = ResultCode(0);
    pub const INVALID_ARGUMENTS: ResultCode = ResultCode(-1);
    pub const NO_MEMORY: ResultCode         = ResultCode(-2);
    pub const INVALID_STATE: ResultCode     = ResultCode(-3);
    pub const NOT_SUPPORTED: ResultCode     = ResultCode(-4);
    pub const TIMEOUT: ResultCode           = ResultCode(-5);
    pub const DEAD_OBJECT: ResultCode       = ResultCode(-6);

    pub fn is_ok(self) -> bool {
        self == ResultCode::OK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EffectKind {
    #[display(fmt = "karaoke")]
    Karaoke,
    #[display(fmt = "noise-reduction")]
    NoiseReduction,
}

impl EffectKind {
    pub fn to_wire(self) -> u32 {
        match self {
            EffectKind::Karaoke => 0,
            EffectKind::NoiseReduction => 1,
        }
    }

    pub fn from_wire(value: u32) -> Option<EffectKind> {
        match value {
            0 => Some(EffectKind::Karaoke),
            1 => Some(EffectKind::NoiseReduction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SessionState {
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "opened")]
    Opened,
    #[display(fmt = "started")]
    Started,
    #[display(fmt = "stopped")]
    Stopped,
    #[display(fmt = "error")]
    Error,
}

impl SessionState {
    pub fn to_wire(self) -> u32 {
        match self {
            SessionState::Idle => 0,
            SessionState::Opened => 1,
            SessionState::Started => 2,
            SessionState::Stopped => 3,
            SessionState::Error => 4,
        }
    }

    pub fn from_wire(value: u32) -> Option<SessionState> {
        match value {
            0 => Some(SessionState::Idle),
            1 => Some(SessionState::Opened),
            2 => Some(SessionState::Started),
            3 => Some(SessionState::Stopped),
            4 => Some(SessionState::Error),
            _ => None,
        }
    }
}

/// PCM stream parameters, agreed by both sides at open. `format` is the
/// sample width in bits: 16 for s16le, 32 for s32le, interleaved channels.
#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(C)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u32,
    pub format: u32,
    pub frames_per_buffer: u32,
}

impl AudioConfig {
    pub fn bytes_per_sample(&self) -> u32 {
        if self.format == 16 { 2 } else { 4 }
    }

    pub fn bytes_per_frame(&self) -> u32 {
        self.channels * self.bytes_per_sample()
    }

    /// Bytes moved per worker iteration.
    pub fn block_size(&self) -> usize {
        self.frames_per_buffer as usize * self.bytes_per_frame() as usize
    }

    pub fn is_supported_format(&self) -> bool {
        self.format == 16 || self.format == 32
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0
            && self.sample_rate <= 768_000
            && self.channels > 0
            && self.channels <= 32
            && self.frames_per_buffer > 0
            && self.frames_per_buffer <= 1 << 20
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct DescriptorFlags: u32 {
        const SYNCHRONIZED = 0x01;
    }
}

/// Everything the peer needs to reconstruct the shared transport, minus the
/// file descriptors themselves. The fds ride alongside as SCM_RIGHTS in the
/// fixed order `[shared memory, eventFdIn, eventFdOut]`.
///
/// Offsets locate each ring's header within the region; the ring's backing
/// bytes follow its header directly.
#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(C)]
pub struct TransportDescriptor {
    pub region_size: u64,
    pub input_ring_offset: u64,
    pub output_ring_offset: u64,
    pub input_ring_capacity: u32,
    pub output_ring_capacity: u32,
    pub flags: DescriptorFlags,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TimestampMicros(pub u64);

impl TimestampMicros {
    /// Microseconds elapsed since `earlier`, tolerating counter wrap.
    pub fn micros_since(self, earlier: TimestampMicros) -> u64 {
        self.0.wrapping_sub(earlier.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_are_stable() {
        assert_eq!(ResultCode::OK.0, 0);
        assert_eq!(ResultCode::INVALID_ARGUMENTS.0, -1);
        assert_eq!(ResultCode::NO_MEMORY.0, -2);
        assert_eq!(ResultCode::INVALID_STATE.0, -3);
        assert_eq!(ResultCode::NOT_SUPPORTED.0, -4);
        assert_eq!(ResultCode::TIMEOUT.0, -5);
        assert_eq!(ResultCode::DEAD_OBJECT.0, -6);
    }

    #[test]
    fn bytes_per_frame_follows_format() {
        let mut config = AudioConfig {
            sample_rate: 48000,
            channels: 2,
            format: 16,
            frames_per_buffer: 480,
        };
        assert_eq!(config.bytes_per_frame(), 4);
        assert_eq!(config.block_size(), 480 * 4);

        config.format = 32;
        assert_eq!(config.bytes_per_frame(), 8);
    }

    #[test]
    fn effect_kind_round_trips() {
        for kind in [EffectKind::Karaoke, EffectKind::NoiseReduction] {
            assert_eq!(EffectKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(EffectKind::from_wire(7), None);
    }

    #[test]
    fn timestamp_delta_tolerates_wrap() {
        let earlier = TimestampMicros(u64::MAX - 5);
        let later = TimestampMicros(10);
        assert_eq!(later.micros_since(earlier), 16);
    }
}
