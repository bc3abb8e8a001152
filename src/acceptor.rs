use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::sys::Socket;
use crate::timestamp::Timestamp;

/// Hook invoked on the acceptor loop for every accepted connection, with the
/// connected socket and the peer address.
pub type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddr) + Send + Sync>;

/// Owns the listening socket and its channel on the acceptor loop.
///
/// Construction creates, configures and binds the socket; [`listen`] makes
/// it passive and registers for read readiness. Each readiness callback
/// accepts a single connection (level-triggered polling reports the rest on
/// the next iteration) and hands it to the new-connection hook; with no hook
/// installed, the accepted socket is dropped, which closes it.
///
/// The acceptor's channel holds its handler strongly rather than through a
/// weak tie: the acceptor is owned by the server on the same loop and
/// outlives every accept event.
///
/// [`listen`]: Acceptor::listen
pub struct Acceptor {
    socket: Socket,
    listening: AtomicBool,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Creates the listening socket, applies address reuse options and binds
    /// `listen_addr`.
    pub fn new(listen_addr: SocketAddr, reuse_port: bool) -> io::Result<Acceptor> {
        let socket = Socket::new(listen_addr)?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;
        Ok(Acceptor {
            socket,
            listening: AtomicBool::new(false),
            new_connection_callback: Mutex::new(None),
        })
    }

    pub fn set_new_connection_callback<F>(&self, callback: F)
    where
        F: Fn(Socket, SocketAddr) + Send + Sync + 'static,
    {
        *self.new_connection_callback.lock() = Some(Box::new(callback));
    }

    /// The bound address, with the real port when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Starts listening and registers for read readiness on `event_loop`
    /// (the acceptor loop).
    pub fn listen(self: Arc<Self>, event_loop: &EventLoop) {
        if let Err(err) = self.socket.listen() {
            error!("listen on {:?} failed: {}", self.socket, err);
            return;
        }
        self.listening.store(true, Ordering::Release);
        let fd = self.fd();
        event_loop.add_channel(Channel::with_handler(fd, self));
        event_loop.enable_reading(fd);
    }
}

impl EventHandler for Acceptor {
    fn handle_read(&self, _event_loop: &EventLoop, _receive_time: Timestamp) {
        match self.socket.accept() {
            Ok((socket, peer_addr)) => {
                let callback = self.new_connection_callback.lock();
                match callback.as_ref() {
                    Some(callback) => callback(socket, peer_addr),
                    // No hook installed: dropping the socket closes it.
                    None => drop(socket),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("accept failed: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    // Distinguish descriptor exhaustion from transient
                    // accept failures.
                    error!("accept hit the open file descriptor limit");
                }
            }
        }
    }
}
