use std::io;
use std::os::unix::io::RawFd;

/// Puts a descriptor into non-blocking mode, leaving other status flags
/// untouched.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK != 0 {
            return Ok(());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// One read(2), retried on EINTR. Would-block surfaces as an error of kind
/// `WouldBlock`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let count = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if count >= 0 {
            return Ok(count as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// One write(2), retried on EINTR.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let count = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if count >= 0 {
            return Ok(count as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Borrowed view of a raw descriptor as an `io::Read` source.
pub struct Fd(pub RawFd);

impl io::Read for Fd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.0, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_nonblocking_read_would_block() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        set_nonblocking(ours.as_raw_fd()).unwrap();

        let mut buf = [0u8; 4];
        let err = read(ours.as_raw_fd(), &mut buf).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_read_returns_available_bytes() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(b"abc").unwrap();

        let mut buf = [0u8; 8];
        let count = read(ours.as_raw_fd(), &mut buf).unwrap();

        assert_eq!(&buf[..count], b"abc");
    }
}
