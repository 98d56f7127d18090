#![no_std]

pub mod message;
pub mod types;

/// Hard ceiling for the client's wait on processed output. A `Process` call
/// returns within this bound plus the passthrough copy time.
pub const PROCESS_TIMEOUT_MS: i32 = 20;

/// Heartbeat interval for the daemon worker's wait on input. Bounds the
/// latency of observing a stop request.
pub const WORKER_POLL_MS: i32 = 100;

/// Default capacity of each ring, one per direction.
pub const DEFAULT_RING_CAPACITY: u32 = 1024 * 1024;

/// Each ring must hold at least this many blocks of audio.
pub const MIN_RING_BLOCKS: u32 = 4;

/// Inline limit for `setParam` values.
pub const MAX_PARAM_VALUE: usize = 128;

/// Upper bound on any control message, requests and replies alike.
pub const MAX_MESSAGE_SIZE: usize = 256;
