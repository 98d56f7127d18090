//! HAL-facing client for the effect daemon.
//!
//! `Session::open` exchanges the transport descriptor over the daemon's
//! control socket and maps the shared rings. `Session::process` is the
//! real-time entry point: it never allocates, never logs, never makes a
//! control call, and always returns within the wait deadline plus a copy.
//! Whatever the daemon does, the output buffer always holds audio.

mod session;

use thiserror::Error;

use fxd_protocol::types::ResultCode;

pub use fxd_protocol::types::{AudioConfig, EffectKind, SessionState};
pub use fxd_protocol::types::stats::SessionStats;
pub use session::{FallbackReason, ProcessStatus, Session, SessionOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid arguments")]
    InvalidArguments,
    #[error("out of memory")]
    NoMemory,
    #[error("invalid state")]
    InvalidState,
    #[error("not supported")]
    NotSupported,
    #[error("timed out")]
    Timeout,
    #[error("effect daemon is gone")]
    DeadObject,
}

impl Error {
    pub fn code(self) -> ResultCode {
        match self {
            Error::InvalidArguments => ResultCode::INVALID_ARGUMENTS,
            Error::NoMemory => ResultCode::NO_MEMORY,
            Error::InvalidState => ResultCode::INVALID_STATE,
            Error::NotSupported => ResultCode::NOT_SUPPORTED,
            Error::Timeout => ResultCode::TIMEOUT,
            Error::DeadObject => ResultCode::DEAD_OBJECT,
        }
    }

    pub(crate) fn from_code(code: ResultCode) -> Error {
        match code {
            ResultCode::INVALID_ARGUMENTS => Error::InvalidArguments,
            ResultCode::NO_MEMORY => Error::NoMemory,
            ResultCode::INVALID_STATE => Error::InvalidState,
            ResultCode::NOT_SUPPORTED => Error::NotSupported,
            ResultCode::TIMEOUT => Error::Timeout,
            _ => Error::DeadObject,
        }
    }
}
