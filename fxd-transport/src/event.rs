//! Kernel wake primitive over eventfd. `signal` is async-signal-safe and
//! allocation-free, fit for the real-time path; `wait` is not. Multiple
//! signals before a wait coalesce into one wakeup.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{eventfd, EfdFlags};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("creating eventfd: {0}")]
    Create(Errno),
    #[error("invalid wait timeout")]
    Timeout,
    #[error("polling eventfd: {0}")]
    Poll(Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Signalled,
    TimedOut,
}

pub struct EventFd(OwnedFd);

impl EventFd {
    pub fn new() -> Result<EventFd, EventError> {
        let fd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(EventError::Create)?;
        Ok(EventFd(fd))
    }

    /// Increments the counter, waking a pending wait. A saturated counter
    /// (EAGAIN) already implies a pending wake, so the error is dropped.
    pub fn signal(&self) {
        let value: u64 = 1;
        let bytes = value.to_ne_bytes();
        let _ = unsafe {
            libc::write(self.0.as_raw_fd(), bytes.as_ptr().cast(), bytes.len())
        };
    }

    /// Blocks until signalled or until `timeout_ms` elapses. `0` polls,
    /// `-1` waits indefinitely. On wake the counter is drained to zero.
    pub fn wait(&self, timeout_ms: i32) -> Result<Wait, EventError> {
        let timeout = if timeout_ms < 0 {
            PollTimeout::NONE
        } else {
            PollTimeout::try_from(timeout_ms).map_err(|_| EventError::Timeout)?
        };

        loop {
            let mut fds = [PollFd::new(self.0.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(Wait::TimedOut),
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(EventError::Poll(e)),
            }
        }

        self.drain();
        Ok(Wait::Signalled)
    }

    fn drain(&self) {
        let mut bytes = [0u8; 8];
        let _ = unsafe {
            libc::read(self.0.as_raw_fd(), bytes.as_mut_ptr().cast(), bytes.len())
        };
    }
}

impl From<OwnedFd> for EventFd {
    fn from(fd: OwnedFd) -> EventFd {
        EventFd(fd)
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
