use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::channel::{Channel, EventHandler};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::Socket;
use crate::timestamp::Timestamp;

/// Shared handle to a [`TcpConnection`], as handed to every callback.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Called on both connection-up and connection-down transitions; query
/// [`TcpConnection::connected`] to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Called after new input landed in the connection's input buffer. Framing
/// is this callback's business: consume what is complete and leave the rest.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;

/// Called each time the output buffer drains to empty after having held
/// data.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Called when buffered output crosses the high-water mark, with the number
/// of bytes now buffered. Fires on the crossing edge only.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Internal: the server's removal hook.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

/// One established TCP connection, pinned to one I/O loop.
///
/// Every connection owns its socket, an input buffer and an output buffer,
/// and runs a small state machine:
///
/// ```text
/// Connecting --(connect_established)--> Connected
/// Connected  --(local shutdown)-------> Disconnecting
/// Connected  --(peer close / error)---> Disconnected
/// Disconnecting --(output drained)----> Disconnected
/// ```
///
/// All buffer and channel mutation happens on the owning loop;
/// [`send`] and [`shutdown`] may be called from any thread and funnel into
/// that loop. Output buffering is unbounded; the high-water-mark callback
/// is the backpressure signal, and the application responds by pausing its
/// own producer.
///
/// [`send`]: TcpConnection::send
/// [`shutdown`]: TcpConnection::shutdown
pub struct TcpConnection {
    event_loop: LoopHandle,
    name: String,
    state: AtomicU8,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
    self_ref: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Wraps an accepted socket. The connection starts in the `Connecting`
    /// state; the server schedules [`connect_established`] on the owning
    /// loop to bring it up.
    ///
    /// [`connect_established`]: TcpConnection::connect_established
    pub(crate) fn new(
        event_loop: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        info!("TcpConnection::new [{}] fd={}", name, socket.as_raw_fd());
        if let Err(err) = socket.set_keep_alive(true) {
            warn!("enabling SO_KEEPALIVE for {} failed: {}", name, err);
        }
        Arc::new_cyclic(|self_ref| TcpConnection {
            event_loop,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            socket,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Returns `true` while the connection is in the `Connected` state.
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Handle to the I/O loop this connection lives on.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.event_loop
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock() = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock() = Some(callback);
    }

    /// Installs the backpressure callback and its threshold in bytes.
    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
        *self.high_water_mark_callback.lock() = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.lock() = Some(callback);
    }

    /// Enables or disables Nagle's algorithm on the underlying socket.
    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.socket.set_nodelay(on)
    }

    /// Sends `data` to the peer.
    ///
    /// May be called from any thread: on the owning loop it writes directly,
    /// elsewhere it hands the bytes to the owning loop. If the connection is
    /// in any state other than `Connected` the data is dropped silently.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            if EventLoop::with_current(|event_loop| self.send_in_loop(event_loop, data)).is_some()
            {
                return;
            }
        }
        let conn = self.shared();
        let data = data.to_vec();
        self.event_loop
            .queue_in_loop(move |event_loop| conn.send_in_loop(event_loop, &data));
    }

    /// Closes the write half once all buffered output has been sent.
    ///
    /// May be called from any thread. In-flight data is never truncated: if
    /// the output buffer still holds bytes, the FIN is deferred until the
    /// write side drains.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.shared();
            self.event_loop
                .run_in_loop(move |event_loop| conn.shutdown_in_loop(event_loop));
        }
    }

    /// Brings the connection up on its owning loop: registers the channel
    /// with a weak tie back to this connection, enables reading and fires
    /// the connection callback.
    pub(crate) fn connect_established(&self, event_loop: &EventLoop) {
        self.set_state(State::Connected);
        let tie: Weak<dyn EventHandler> = self.self_ref.clone();
        let fd = self.fd();
        event_loop.add_channel(Channel::with_tied_handler(fd, tie));
        event_loop.enable_reading(fd);
        self.run_connection_callback();
    }

    /// Final teardown on the owning loop; the scheduled task running this
    /// typically holds the last shared reference. Idempotent.
    pub(crate) fn connect_destroyed(&self, event_loop: &EventLoop) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            event_loop.disable_all(self.fd());
            self.run_connection_callback();
        }
        event_loop.remove_channel(self.fd());
    }

    fn send_in_loop(&self, event_loop: &EventLoop, data: &[u8]) {
        if self.state() == State::Disconnected {
            error!("{}: disconnected, give up writing", self.name);
            return;
        }
        let fd = self.fd();
        let mut written = 0;
        let mut fault = false;
        let mut output = self.output_buffer.lock();
        // Nothing queued and no write interest: the kernel buffer may have
        // room, so try the direct write first.
        if !event_loop.is_writing(fd) && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() && !data.is_empty() {
                        if let Some(callback) = self.write_complete_callback.lock().clone() {
                            let conn = self.shared();
                            event_loop.queue_in_loop(move |_| callback(&conn));
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("{}: send_in_loop write failed: {}", self.name, err);
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        fault = true;
                    }
                }
            }
        }
        let remaining = &data[written..];
        if !fault && !remaining.is_empty() {
            let old_len = output.readable_bytes();
            let new_len = old_len + remaining.len();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len < mark && new_len >= mark {
                if let Some(callback) = self.high_water_mark_callback.lock().clone() {
                    let conn = self.shared();
                    event_loop.queue_in_loop(move |_| callback(&conn, new_len));
                }
            }
            output.append(remaining);
            if !event_loop.is_writing(fd) {
                event_loop.enable_writing(fd);
            }
        }
    }

    fn shutdown_in_loop(&self, event_loop: &EventLoop) {
        // Write interest still on means the output buffer has not drained;
        // handle_write issues the shutdown after the last chunk.
        if !event_loop.is_writing(self.fd()) {
            if let Err(err) = self.socket.shutdown_write() {
                error!("{}: shutdown_write failed: {}", self.name, err);
            }
        }
    }

    fn run_connection_callback(&self) {
        let callback = self.connection_callback.lock().clone();
        if let Some(callback) = callback {
            callback(&self.shared());
        }
    }

    /// Upgrades the self-reference. Succeeds whenever some owner still holds
    /// the connection, which is the case in every dispatch and task.
    fn shared(&self) -> TcpConnectionPtr {
        self.self_ref
            .upgrade()
            .expect("connection used after the last shared owner dropped it")
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl EventHandler for TcpConnection {
    fn handle_read(&self, event_loop: &EventLoop, receive_time: Timestamp) {
        let mut input = self.input_buffer.lock();
        match input.read_fd(self.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close(event_loop);
            }
            Ok(_) => {
                let callback = self.message_callback.lock().clone();
                if let Some(callback) = callback {
                    callback(&self.shared(), &mut input, receive_time);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(input);
                error!("{}: handle_read failed: {}", self.name, err);
                self.handle_error(event_loop);
            }
        }
    }

    fn handle_write(&self, event_loop: &EventLoop) {
        let fd = self.fd();
        if !event_loop.is_writing(fd) {
            error!("{}: fd={} is down, no more writing", self.name, fd);
            return;
        }
        let mut output = self.output_buffer.lock();
        match output.write_fd(fd) {
            Ok(n) if n > 0 => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    event_loop.disable_writing(fd);
                    if let Some(callback) = self.write_complete_callback.lock().clone() {
                        let conn = self.shared();
                        event_loop.queue_in_loop(move |_| callback(&conn));
                    }
                }
                if self.state() == State::Disconnecting {
                    self.shutdown_in_loop(event_loop);
                }
            }
            Ok(_) => error!("{}: handle_write wrote nothing", self.name),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("{}: handle_write failed: {}", self.name, err),
        }
    }

    fn handle_close(&self, event_loop: &EventLoop) {
        info!(
            "{}: handle_close fd={} state={:?}",
            self.name,
            self.fd(),
            self.state()
        );
        self.set_state(State::Disconnected);
        event_loop.disable_all(self.fd());
        // Keep a strong reference across both callbacks: the close callback
        // drops the server's registry entry, which may be the second-to-last
        // owner.
        let conn = self.shared();
        let connection_callback = self.connection_callback.lock().clone();
        if let Some(callback) = connection_callback {
            callback(&conn);
        }
        let close_callback = self.close_callback.lock().clone();
        if let Some(callback) = close_callback {
            callback(&conn);
        }
    }

    fn handle_error(&self, _event_loop: &EventLoop) {
        match self.socket.take_error() {
            Ok(Some(err)) => error!("{}: SO_ERROR: {}", self.name, err),
            Ok(None) => error!("{}: handle_error with no pending socket error", self.name),
            Err(err) => error!("{}: reading SO_ERROR failed: {}", self.name, err),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        info!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.socket.as_raw_fd(),
            self.state()
        );
    }
}
