//! EINTR-safe I/O primitives.
//!
//! Thin wrappers over the raw syscalls which retry on `EINTR`, plus
//! `read_full`/`write_full` which loop until completion or error.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd;
use nix::NixPath;

/// `open(2)`, retrying on `EINTR`.
pub fn open_no_int<P: ?Sized + NixPath>(
    path: &P,
    oflag: OFlag,
    mode: Mode,
) -> nix::Result<RawFd> {
    loop {
        match nix::fcntl::open(path, oflag, mode) {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

/// `close(2)`. An `EINTR` result is reported as success; the fd state is
/// unspecified afterwards either way, and retrying risks closing a reused fd.
pub fn close_no_int(fd: RawFd) -> nix::Result<()> {
    match unistd::close(fd) {
        Err(Errno::EINTR) => Ok(()),
        res => res,
    }
}

/// `read(2)`, retrying on `EINTR`.
pub fn read_no_int(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    loop {
        match unistd::read(fd, buf) {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

/// `write(2)`, retrying on `EINTR`.
pub fn write_no_int(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    loop {
        match unistd::write(fd, buf) {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

/// Read until `buf` is full or EOF is reached. Returns the number of bytes
/// actually read, which is less than `buf.len()` only at EOF.
pub fn read_full(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let count = read_no_int(fd, &mut buf[done..])?;
        if count == 0 {
            break;
        }
        done += count;
    }
    Ok(done)
}

/// Write all of `buf`.
pub fn write_full(fd: RawFd, buf: &[u8]) -> nix::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        done += write_no_int(fd, &buf[done..])?;
    }
    Ok(())
}
