//! An echo server: send a line, get it back, connection closes.
//!
//! Run with `cargo run --example echo`, then:
//!
//! ```sh
//! $ echo hello | nc 127.0.0.1 8000
//! ```

use std::io;
use std::sync::Arc;

use log::info;
use muxio::{EventLoop, ServerOption, TcpServer};

fn main() -> io::Result<()> {
    env_logger::init();

    // The loop running in this thread is the acceptor loop.
    let event_loop = EventLoop::new()?;
    let addr = "0.0.0.0:8000".parse().expect("hard-coded address");
    let server = TcpServer::new(event_loop.handle(), addr, "EchoServer-01", ServerOption::NoReusePort)?;

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            info!("Connection UP : {}", conn.peer_addr());
        } else {
            info!("Connection DOWN : {}", conn.peer_addr());
        }
    }));
    server.set_message_callback(Arc::new(|conn, buffer, _receive_time| {
        let message = buffer.retrieve_all_as_bytes();
        conn.send(&message);
        conn.shutdown();
    }));
    server.set_thread_num(3);

    println!("echoing on {}", server.local_addr());
    server.start()?;
    event_loop.run();
    Ok(())
}
