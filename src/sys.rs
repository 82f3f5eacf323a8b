//! Thin wrappers over the POSIX calls the rest of the crate needs: raw
//! non-blocking read/write with the EAGAIN/EINTR split the dispatcher
//! relies on, descriptor flag twiddling, and the one-time SIGPIPE policy.

use std::ffi::c_void;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Once;

use crate::error::{Error, Result};

/// Set `O_NONBLOCK` on `fd`, preserving any other flags already set.
pub fn set_nonblock(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::IoSystem(io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::IoSystem(io::Error::last_os_error()));
    }
    Ok(())
}

/// Set `FD_CLOEXEC` on `fd`.
pub fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
    if flags < 0 {
        return Err(Error::IoSystem(io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(Error::IoSystem(io::Error::last_os_error()));
    }
    Ok(())
}

/// Address family of a bound/connected socket, via `getsockname`.
pub fn get_family(fd: RawFd) -> Result<libc::sa_family_t> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Error::IoSystem(io::Error::last_os_error()));
    }
    Ok(storage.ss_family)
}

static SIGPIPE_IGNORED: Once = Once::new();

/// Ignore `SIGPIPE` for the lifetime of the process. Idempotent; called the
/// first time any channel is created (see [`crate::runtime::Runtime::reopen`]).
/// Global and irreversible by design — see the crate's design notes on why no
/// opt-out is provided.
pub fn ensure_sigpipe_ignored() {
    SIGPIPE_IGNORED.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// One non-blocking `read(2)`, retrying internally on `EINTR`. Returns
/// `Ok(0)` on EOF, bubbles `EAGAIN`/`EWOULDBLOCK` as
/// [`Error::IoSystem`] with [`io::ErrorKind::WouldBlock`] so callers can tell
/// "nothing to read right now" from "the peer hung up".
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EINTR => continue,
            Some(code) if code == libc::EBADF => return Err(Error::BadFd),
            _ => return Err(Error::IoSystem(err)),
        }
    }
}

/// One non-blocking `write(2)`, retrying internally on `EINTR`.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EINTR => continue,
            Some(code) if code == libc::EBADF => return Err(Error::BadFd),
            _ => return Err(Error::IoSystem(err)),
        }
    }
}

/// Close `fd`, ignoring `EINTR` (the descriptor is closed either way per
/// POSIX, so retrying `close` after `EINTR` is itself a bug).
pub fn close(fd: RawFd) {
    let rc = unsafe { libc::close(fd) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EBADF) {
            log::warn!("close({fd}) failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nonblock_marks_fd() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_nonblock(r).unwrap();
        let flags = unsafe { libc::fcntl(r, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        close(r);
        close(w);
    }

    #[test]
    fn set_cloexec_marks_fd() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_cloexec(r).unwrap();
        let flags = unsafe { libc::fcntl(r, libc::F_GETFD, 0) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
        close(r);
        close(w);
    }

    #[test]
    fn get_family_reports_unix_domain_socket() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixDatagram;

        let (a, b) = UnixDatagram::pair().unwrap();
        let family = get_family(a.as_raw_fd()).unwrap();
        assert_eq!(family as i32, libc::AF_UNIX);
        drop(b);
    }

    #[test]
    fn read_on_empty_nonblocking_pipe_is_would_block() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_nonblock(r).unwrap();
        let mut buf = [0u8; 16];
        let err = read(r, &mut buf).unwrap_err();
        assert!(err.is_would_block());
        close(r);
        close(w);
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_nonblock(r).unwrap();
        set_nonblock(w).unwrap();
        let n = write(w, b"hello").unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 16];
        let n = read(r, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        close(r);
        close(w);
    }
}
