use std::fmt;
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::sys::net::{socket_addr, to_socket_addr};

/// Size of the pending-connection queue handed to `listen(2)`.
const LISTEN_BACKLOG: libc::c_int = 1024;

/// An owned, non-blocking, close-on-exec TCP socket.
///
/// The descriptor is closed on drop. Every operation is a thin `io::Result`
/// wrapper over the corresponding syscall; the socket never retries and
/// never logs, so callers decide what an error means.
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a new stream socket for `addr`'s address family, with
    /// `SOCK_NONBLOCK | SOCK_CLOEXEC` set atomically at creation.
    pub fn new(addr: SocketAddr) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        let ty = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
        let fd = syscall!(socket(domain, ty, 0))?;
        // SAFETY: `socket(2)` returned a valid descriptor that we exclusively own.
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Binds the socket to `addr`.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (raw_addr, raw_addr_length) = socket_addr(&addr);
        syscall!(bind(self.as_raw_fd(), raw_addr.as_ptr(), raw_addr_length)).map(|_| ())
    }

    /// Marks the socket as a passive listener.
    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), LISTEN_BACKLOG)).map(|_| ())
    }

    /// Accepts one pending connection.
    ///
    /// The returned socket has `SOCK_NONBLOCK | SOCK_CLOEXEC` applied
    /// atomically by `accept4(2)`. Returns `WouldBlock` when the queue is
    /// empty.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.as_raw_fd(),
            storage.as_mut_ptr().cast(),
            &mut length,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        // SAFETY: `accept4(2)` returned a valid descriptor that we exclusively own.
        let socket = Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        // SAFETY: the kernel initialised `storage` with the peer address.
        let peer_addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((socket, peer_addr))
    }

    /// Writes `buf` with a single `write(2)`.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(self.as_raw_fd(), buf.as_ptr().cast(), buf.len()))?;
        Ok(n as usize)
    }

    /// Shuts down the write half, sending FIN once in-kernel data drains.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.as_raw_fd(), libc::SHUT_WR)).map(|_| ())
    }

    /// Returns the local address via `getsockname(2)`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.as_raw_fd(),
            storage.as_mut_ptr().cast(),
            &mut length,
        ))?;
        // SAFETY: the kernel initialised `storage` with the local address.
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    /// Takes the pending `SO_ERROR` value, clearing it in the process.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut errno: libc::c_int = 0;
        let mut length = size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut errno as *mut libc::c_int).cast(),
            &mut length,
        ))?;
        if errno == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(errno)))
        }
    }

    pub fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        self.set_flag_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_flag_option(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_flag_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    /// Enables or disables Nagle's algorithm.
    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_flag_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    fn set_flag_option(&self, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
        let value: libc::c_int = on as libc::c_int;
        syscall!(setsockopt(
            self.as_raw_fd(),
            level,
            name,
            (&value as *const libc::c_int).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").field("fd", &self.as_raw_fd()).finish()
    }
}
