use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, info};
use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::event_loop::LoopHandle;
use crate::loop_thread::{LoopPool, ThreadInitCallback};
use crate::sys::Socket;

/// Whether the listening socket sets `SO_REUSEPORT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

/// A multi-reactor TCP server.
///
/// Composes an [`Acceptor`] on the base ("acceptor") loop, a pool of I/O
/// loops, and a registry of live connections. Freshly accepted connections
/// are handed to the I/O loops round robin; from then on every event for a
/// connection runs on that one loop.
///
/// Configure callbacks and the thread count, then call [`start`]. Dropping
/// the server tears down every live connection and joins the I/O loop
/// threads.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use muxio::{EventLoop, ServerOption, TcpServer};
///
/// # fn main() -> std::io::Result<()> {
/// let event_loop = EventLoop::new()?;
/// let addr = "127.0.0.1:8000".parse().unwrap();
/// let server = TcpServer::new(event_loop.handle(), addr, "echo", ServerOption::NoReusePort)?;
/// server.set_message_callback(Arc::new(|conn, buffer, _when| {
///     let payload = buffer.retrieve_all_as_bytes();
///     conn.send(&payload);
/// }));
/// server.set_thread_num(4);
/// server.start()?;
/// event_loop.run();
/// # Ok(())
/// # }
/// ```
///
/// [`start`]: TcpServer::start
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    base_loop: LoopHandle,
    name: String,
    ip_port: String,
    local_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    pool: Mutex<LoopPool>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    next_conn_id: AtomicUsize,
    started: AtomicUsize,
}

impl TcpServer {
    /// Binds a listening socket for `listen_addr` on `base_loop` and
    /// prepares a loop pool named after the server. Nothing is accepted
    /// until [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn new(
        base_loop: LoopHandle,
        listen_addr: SocketAddr,
        name: &str,
        option: ServerOption,
    ) -> io::Result<TcpServer> {
        let acceptor = Arc::new(Acceptor::new(
            listen_addr,
            option == ServerOption::ReusePort,
        )?);
        // Re-query the bound address so an ephemeral port 0 resolves to the
        // real one; it also feeds the connection names.
        let local_addr = acceptor.local_addr()?;
        let inner = Arc::new(ServerInner {
            base_loop: base_loop.clone(),
            name: name.to_string(),
            ip_port: local_addr.to_string(),
            local_addr,
            acceptor,
            pool: Mutex::new(LoopPool::new(base_loop, name)),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
            started: AtomicUsize::new(0),
        });
        let server = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(move |socket, peer_addr| {
                if let Some(inner) = server.upgrade() {
                    ServerInner::new_connection(&inner, socket, peer_addr);
                }
            });
        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Configures the number of I/O loop threads; `0` keeps everything on
    /// the acceptor loop (single reactor). Call before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        *self.inner.thread_init_callback.lock() = Some(callback);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.inner.connection_callback.lock() = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.inner.message_callback.lock() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.inner.write_complete_callback.lock() = Some(callback);
    }

    /// Starts the loop pool and schedules the acceptor's `listen` on the
    /// acceptor loop. Idempotent: only the first call does anything.
    pub fn start(&self) -> io::Result<()> {
        if self.inner.started.fetch_add(1, Ordering::AcqRel) == 0 {
            let init = self.inner.thread_init_callback.lock().clone();
            self.inner.pool.lock().start(init)?;
            let acceptor = Arc::clone(&self.inner.acceptor);
            self.inner
                .base_loop
                .run_in_loop(move |event_loop| acceptor.listen(event_loop));
        }
        Ok(())
    }
}

impl ServerInner {
    /// Runs on the acceptor loop for every accepted socket.
    fn new_connection(inner: &Arc<ServerInner>, socket: Socket, peer_addr: SocketAddr) {
        let io_loop = inner.pool.lock().get_next_loop();
        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", inner.name, inner.ip_port, conn_id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            inner.name, conn_name, peer_addr
        );
        let local_addr = socket.local_addr().unwrap_or_else(|err| {
            error!("getsockname for {} failed: {}", conn_name, err);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });
        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        );
        if let Some(callback) = inner.connection_callback.lock().clone() {
            conn.set_connection_callback(callback);
        }
        if let Some(callback) = inner.message_callback.lock().clone() {
            conn.set_message_callback(callback);
        }
        if let Some(callback) = inner.write_complete_callback.lock().clone() {
            conn.set_write_complete_callback(callback);
        }
        let server = Arc::downgrade(inner);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = server.upgrade() {
                ServerInner::remove_connection(&inner, conn);
            }
        }));
        inner
            .connections
            .lock()
            .insert(conn_name, Arc::clone(&conn));
        io_loop.run_in_loop(move |event_loop| conn.connect_established(event_loop));
    }

    /// May run on any I/O loop (it is the connection's close callback);
    /// reposts the actual removal to the acceptor loop, which owns the
    /// registry.
    fn remove_connection(inner: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        let inner_for_loop = Arc::clone(inner);
        let conn = Arc::clone(conn);
        inner.base_loop.run_in_loop(move |_| {
            ServerInner::remove_connection_in_loop(&inner_for_loop, &conn);
        });
    }

    fn remove_connection_in_loop(inner: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            inner.name,
            conn.name()
        );
        inner.connections.lock().remove(conn.name());
        let conn = Arc::clone(conn);
        let io_loop = conn.loop_handle().clone();
        // The queued task holds the last strong reference; the connection is
        // freed after its channel is removed from the poller.
        io_loop.queue_in_loop(move |event_loop| conn.connect_destroyed(event_loop));
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        info!("TcpServer::drop [{}]", self.name);
        let connections = mem::take(&mut *self.connections.lock());
        for (_, conn) in connections {
            let io_loop = conn.loop_handle().clone();
            io_loop.queue_in_loop(move |event_loop| conn.connect_destroyed(event_loop));
        }
        // Unregister the listening socket; the task keeps the acceptor alive
        // until its channel (which holds the other strong reference) is gone.
        let acceptor = Arc::clone(&self.acceptor);
        self.base_loop.run_in_loop(move |event_loop| {
            let fd = acceptor.fd();
            event_loop.disable_all(fd);
            event_loop.remove_channel(fd);
        });
        // The pool drops after this body: it quits and joins every I/O loop
        // thread, so queued teardown tasks get their chance to run first.
    }
}
