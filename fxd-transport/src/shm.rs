//! Anonymous shared-memory regions. Creation probes memfd_create first,
//! then the ashmem device on Android builds, then POSIX shm_open with an
//! immediate unlink so the region stays anonymous. The region is destroyed
//! by the kernel once every handle and mapping is gone.

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("region size must be non-zero")]
    ZeroSize,
    #[error("invalid region name")]
    Name,
    #[error("no shared memory backend accepted the region: {0}")]
    Create(io::Error),
    #[error("sizing shared region: {0}")]
    Truncate(io::Error),
    #[error("mapping shared region: {0}")]
    Map(io::Error),
}

pub struct ShmHandle {
    fd: OwnedFd,
    size: usize,
}

impl ShmHandle {
    pub fn create(name: &str, size: usize) -> Result<ShmHandle, ShmError> {
        if size == 0 {
            return Err(ShmError::ZeroSize);
        }

        let cname = CString::new(name).map_err(|_| ShmError::Name)?;
        let fd = create_anon_fd(&cname, size)?;

        Ok(ShmHandle { fd, size })
    }

    /// Wraps a handle received from the peer.
    pub fn from_fd(fd: OwnedFd, size: usize) -> ShmHandle {
        ShmHandle { fd, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn map(&self) -> Result<ShmMapping, ShmError> {
        ShmMapping::new(self.fd.as_fd(), self.size)
    }
}

impl AsFd for ShmHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn create_anon_fd(name: &CStr, size: usize) -> Result<OwnedFd, ShmError> {
    // memfd_create, Linux 3.17+
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd >= 0 {
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        return truncate(fd, size);
    }
    log::debug!("memfd_create unavailable, falling back: {}", io::Error::last_os_error());

    #[cfg(target_os = "android")]
    if let Ok(fd) = ashmem_create(name, size) {
        return Ok(fd);
    }

    shm_open_anon(size)
}

fn truncate(fd: OwnedFd, size: usize) -> Result<OwnedFd, ShmError> {
    let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
    if rc < 0 {
        return Err(ShmError::Truncate(io::Error::last_os_error()));
    }
    Ok(fd)
}

fn shm_open_anon(size: usize) -> Result<OwnedFd, ShmError> {
    static SEQ: AtomicU32 = AtomicU32::new(0);

    let name = format!(
        "/fxd-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let cname = CString::new(name).map_err(|_| ShmError::Name)?;

    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        return Err(ShmError::Create(io::Error::last_os_error()));
    }

    // unlink right away so the region dies with its last fd
    unsafe { libc::shm_unlink(cname.as_ptr()) };

    truncate(unsafe { OwnedFd::from_raw_fd(fd) }, size)
}

#[cfg(target_os = "android")]
fn ashmem_create(name: &CStr, size: usize) -> Result<OwnedFd, ShmError> {
    const ASHMEM_NAME_LEN: usize = 256;

    // _IOW(0x77, nr, size)
    const fn iow(nr: u32, len: u32) -> libc::c_ulong {
        ((1 << 30) | (len << 16) | (0x77 << 8) | nr) as libc::c_ulong
    }
    let set_name = iow(1, ASHMEM_NAME_LEN as u32);
    let set_size = iow(3, std::mem::size_of::<libc::size_t>() as u32);

    let device = CString::new("/dev/ashmem").map_err(|_| ShmError::Name)?;
    let fd = unsafe { libc::open(device.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(ShmError::Create(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut buf = [0u8; ASHMEM_NAME_LEN];
    let bytes = name.to_bytes_with_nul();
    let len = bytes.len().min(ASHMEM_NAME_LEN - 1);
    buf[..len].copy_from_slice(&bytes[..len]);
    unsafe {
        libc::ioctl(fd.as_raw_fd(), set_name, buf.as_ptr());
        if libc::ioctl(fd.as_raw_fd(), set_size, size as libc::size_t) < 0 {
            return Err(ShmError::Truncate(io::Error::last_os_error()));
        }
    }

    Ok(fd)
}

pub struct ShmMapping {
    addr: NonNull<u8>,
    size: usize,
}

// The mapping is shared between processes on purpose; all mutation inside it
// goes through the ring's atomic indices.
unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    pub fn new(fd: BorrowedFd<'_>, size: usize) -> Result<ShmMapping, ShmError> {
        if size == 0 {
            return Err(ShmError::ZeroSize);
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ShmError::Map(io::Error::last_os_error()));
        }

        let addr = NonNull::new(addr as *mut u8).ok_or_else(|| {
            ShmError::Map(io::Error::new(io::ErrorKind::Other, "mmap returned null"))
        })?;

        Ok(ShmMapping { addr, size })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}
