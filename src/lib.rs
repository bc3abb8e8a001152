//! Multi-reactor non-blocking TCP server framework.
//!
//! muxio implements the "one loop per thread" pattern: an acceptor
//! [`EventLoop`] takes new connections off a listening socket and hands them
//! round robin to a pool of I/O loops, where each [`TcpConnection`] lives
//! for the rest of its life. Applications drive everything through
//! callbacks for connection up/down, message arrival, write completion and
//! outbound backpressure, and never touch a socket directly.
//!
//! The readiness backend is level-triggered `epoll(7)` behind the [`Poller`]
//! trait; Linux and Android are the supported platforms. Callbacks run on
//! their connection's loop thread, must not block, and are totally ordered
//! per connection. The framework is payload-agnostic: framing is the message
//! callback's business.
//!
//! # Examples
//!
//! An echo server on three I/O loops:
//!
//! ```no_run
//! use std::sync::Arc;
//! use muxio::{EventLoop, ServerOption, TcpServer};
//!
//! # fn main() -> std::io::Result<()> {
//! let event_loop = EventLoop::new()?;
//! let addr = "0.0.0.0:8000".parse().unwrap();
//! let server = TcpServer::new(event_loop.handle(), addr, "echo", ServerOption::NoReusePort)?;
//! server.set_message_callback(Arc::new(|conn, buffer, _when| {
//!     let payload = buffer.retrieve_all_as_bytes();
//!     conn.send(&payload);
//!     conn.shutdown();
//! }));
//! server.set_thread_num(3);
//! server.start()?;
//! event_loop.run();
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod event;
mod event_loop;
mod interest;
mod loop_thread;
mod poller;
mod server;
mod sys;
mod timestamp;

pub use crate::acceptor::{Acceptor, NewConnectionCallback};
pub use crate::buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use crate::channel::{Channel, EventHandler};
pub use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use crate::event::Ready;
pub use crate::event_loop::{EventLoop, LoopHandle, Task};
pub use crate::interest::Interest;
pub use crate::loop_thread::{LoopPool, LoopThread, ThreadInitCallback};
pub use crate::poller::{EpollPoller, Poller};
pub use crate::server::{ServerOption, TcpServer};
pub use crate::sys::Socket;
pub use crate::timestamp::Timestamp;
