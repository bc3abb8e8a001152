// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::fs::File;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Once;
use std::time::{Duration, Instant};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

/// Spins until `condition` holds, panicking after `timeout`.
pub fn wait_until<F>(mut condition: F, timeout: Duration, what: &str)
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < timeout,
            "timed out after {:?} waiting for {}",
            timeout,
            what
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Deterministic, compare-friendly payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Blocking client connection with sane timeouts.
pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("unable to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("unable to set read timeout");
    stream
}

/// A close-on-exec pipe; `(read, write)`.
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(res, 0, "pipe2 failed: {}", io::Error::last_os_error());
    // SAFETY: `pipe2(2)` initialised both descriptors and we own them.
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// A pipe whose read end is non-blocking.
pub fn nonblocking_pipe() -> (OwnedFd, OwnedFd) {
    let (read, write) = pipe();
    let res = unsafe { libc::fcntl(read.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
    assert_eq!(res, 0, "fcntl failed: {}", io::Error::last_os_error());
    (read, write)
}

/// Grows the pipe buffer so large writes complete without a reader.
pub fn set_pipe_capacity(fd: &OwnedFd, bytes: usize) {
    let res = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETPIPE_SZ, bytes as libc::c_int) };
    assert!(res >= 0, "F_SETPIPE_SZ failed: {}", io::Error::last_os_error());
}

/// Writes the whole payload into the pipe's write end.
pub fn fill_pipe(write: OwnedFd, data: &[u8]) {
    use io::Write;
    let mut file = File::from(write);
    file.write_all(data).expect("unable to fill pipe");
}
