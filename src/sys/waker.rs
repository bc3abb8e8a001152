use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use log::error;

/// Cross-thread wakeup primitive backed by `eventfd(2)`.
///
/// An eventfd is effectively a 64-bit counter: writes of 8 bytes add to the
/// count and make the descriptor read-ready, reads of 8 bytes return and
/// reset the count. The value itself is opaque here; only the
/// write-to-read-ready edge matters.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a valid descriptor that we exclusively own.
        Ok(Waker {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    /// Makes the descriptor read-ready, forcing a blocked poller out of its
    /// wait.
    #[allow(clippy::unused_io_amount)] // An eventfd write is all-or-nothing.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter would overflow; reset it
                // and wake again.
                self.consume();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Consumes pending wakeups so the descriptor stops reading ready.
    pub(crate) fn consume(&self) {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(n) if n != buf.len() => {
                error!("wakeup read returned {} bytes instead of 8", n);
            }
            Ok(_) => {}
            // Not woken since the last consume; nothing to do.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("wakeup read failed: {}", err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
