//! Seqpacket control channel. One request per packet, one reply per
//! packet; fds for the open reply travel as SCM_RIGHTS ancillary data.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept, bind, connect, listen, recvmsg, sendmsg, socket, socketpair, AddressFamily, Backlog,
    ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("creating control socket: {0}")]
    Socket(Errno),
    #[error("binding {}: {}", .0.display(), .1)]
    Bind(PathBuf, Errno),
    #[error("connecting {}: {}", .0.display(), .1)]
    Connect(PathBuf, Errno),
    #[error("accepting connection: {0}")]
    Accept(Errno),
    #[error("sending control message: {0}")]
    Send(Errno),
    #[error("receiving control message: {0}")]
    Recv(Errno),
    #[error("peer closed the control socket")]
    Closed,
    #[error("timed out waiting for a control reply")]
    ReplyTimeout,
}

fn new_seqpacket() -> Result<OwnedFd, ControlError> {
    socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(ControlError::Socket)
}

pub struct Listener {
    fd: OwnedFd,
    path: PathBuf,
}

impl Listener {
    pub fn bind(path: &Path) -> Result<Listener, ControlError> {
        let fd = new_seqpacket()?;

        // a previous daemon instance may have left its socket behind
        let _ = std::fs::remove_file(path);

        let addr = UnixAddr::new(path).map_err(|e| ControlError::Bind(path.into(), e))?;
        bind(fd.as_raw_fd(), &addr).map_err(|e| ControlError::Bind(path.into(), e))?;
        listen(&fd, Backlog::new(8).unwrap()).map_err(|e| ControlError::Bind(path.into(), e))?;

        Ok(Listener { fd, path: path.into() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits up to `timeout_ms` for an incoming connection. Returns `None`
    /// on timeout or interruption so the caller can re-check its shutdown
    /// flag.
    pub fn poll_accept(&self, timeout_ms: i32) -> Result<Option<Channel>, ControlError> {
        let timeout =
            PollTimeout::try_from(timeout_ms).map_err(|_| ControlError::Accept(Errno::EINVAL))?;

        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(None),
            Err(e) => return Err(ControlError::Accept(e)),
        }

        let fd = accept(self.fd.as_raw_fd()).map_err(ControlError::Accept)?;
        Ok(Some(Channel {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    pub fn connect(path: &Path) -> Result<Channel, ControlError> {
        let fd = new_seqpacket()?;
        let addr = UnixAddr::new(path).map_err(|e| ControlError::Connect(path.into(), e))?;
        connect(fd.as_raw_fd(), &addr).map_err(|e| ControlError::Connect(path.into(), e))?;
        Ok(Channel { fd })
    }

    /// A connected pair in this process; handy for exercising the daemon
    /// without touching the filesystem.
    pub fn pair() -> Result<(Channel, Channel), ControlError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(ControlError::Socket)?;
        Ok((Channel { fd: a }, Channel { fd: b }))
    }

    pub fn send(&self, bytes: &[u8], fds: &[RawFd]) -> Result<(), ControlError> {
        let iov = [IoSlice::new(bytes)];
        let rights = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &rights };

        sendmsg::<()>(self.fd.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
            .map_err(ControlError::Send)?;
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>), ControlError> {
        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg = nix::cmsg_space!([RawFd; 3]);

        let msg = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .map_err(ControlError::Recv)?;

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for fd in received {
                    fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }

        if msg.bytes == 0 && fds.is_empty() {
            return Err(ControlError::Closed);
        }

        Ok((msg.bytes, fds))
    }

    /// Like `recv`, but gives up after `timeout_ms` so a wedged peer
    /// cannot hang a control call forever.
    pub fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout_ms: i32,
    ) -> Result<(usize, Vec<OwnedFd>), ControlError> {
        let timeout =
            PollTimeout::try_from(timeout_ms).map_err(|_| ControlError::Recv(Errno::EINVAL))?;

        loop {
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Err(ControlError::ReplyTimeout),
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ControlError::Recv(e)),
            }
        }

        self.recv(buf)
    }
}
