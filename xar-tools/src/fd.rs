//! Raw file descriptor ownership helpers.

use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use anyhow::Error;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::io::close_no_int;

/// An owned file descriptor, closed on drop.
///
/// Does not impose close-on-exec: callers that need an fd to survive `exec`
/// open it without `O_CLOEXEC` and release ownership with `into_raw_fd`.
#[derive(Debug)]
pub struct Fd(RawFd);

impl Fd {
    /// Take ownership of `fd`.
    pub fn new(fd: RawFd) -> Self {
        Fd(fd)
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close_no_int(self.0);
    }
}

/// Change the `O_CLOEXEC` flag of an existing file descriptor.
pub fn fd_change_cloexec(fd: RawFd, on: bool) -> Result<(), Error> {
    let mut flags = unsafe { FdFlag::from_bits_unchecked(fcntl(fd, FcntlArg::F_GETFD)?) };
    flags.set(FdFlag::FD_CLOEXEC, on);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}
