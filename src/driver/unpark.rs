use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Cross-thread wakeup handle for a parked worker.
///
/// The worker keeps a read on this eventfd in flight inside its ring; any
/// thread can complete that read with a write, which pops the worker out of
/// `submit_and_wait`.
#[derive(Clone)]
pub(crate) struct Unpark {
    fd: Arc<OwnedFd>,
}

impl Unpark {
    pub(crate) fn try_new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }),
        })
    }

    pub(crate) fn unpark(&self) {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is already saturated; the wakeup is
        // pending either way.
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                log::error!("eventfd wakeup failed: {err}");
            }
        }
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
