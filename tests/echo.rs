use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use muxio::{LoopThread, ServerOption, TcpServer};

mod util;
use util::{connect, init, payload, wait_until};

struct Fixture {
    // Declaration order matters: the server must drop (and join its I/O
    // loops) while the acceptor loop below is still running.
    server: TcpServer,
    _base: LoopThread,
}

fn start_server(num_threads: usize, name: &str) -> Fixture {
    init();
    let base = LoopThread::start_loop("test-acceptor", None).expect("unable to start base loop");
    let server = TcpServer::new(
        base.handle().clone(),
        "127.0.0.1:0".parse().expect("hard-coded address"),
        name,
        ServerOption::NoReusePort,
    )
    .expect("unable to bind server");
    server.set_thread_num(num_threads);
    Fixture {
        server,
        _base: base,
    }
}

#[test]
fn echoes_one_short_message() {
    let fixture = start_server(1, "echo-short");
    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    {
        let ups = Arc::clone(&ups);
        let downs = Arc::clone(&downs);
        fixture.server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                ups.fetch_add(1, Ordering::AcqRel);
            } else {
                downs.fetch_add(1, Ordering::AcqRel);
            }
        }));
    }
    fixture.server.set_message_callback(Arc::new(|conn, buffer, _when| {
        let message = buffer.retrieve_all_as_bytes();
        conn.send(&message);
        conn.shutdown();
    }));
    fixture.server.start().expect("unable to start server");

    let mut client = connect(fixture.server.local_addr());
    client.write_all(b"hello").expect("write failed");

    let mut received = Vec::new();
    client.read_to_end(&mut received).expect("read failed");
    assert_eq!(received, b"hello");
    drop(client);

    wait_until(
        || ups.load(Ordering::Acquire) == 1 && downs.load(Ordering::Acquire) == 1,
        Duration::from_secs(5),
        "one connection up and one down",
    );
}

#[test]
fn single_reactor_serves_connections_on_the_base_loop() {
    // Zero I/O threads: the acceptor loop carries the connections too.
    let fixture = start_server(0, "echo-single");
    fixture.server.set_message_callback(Arc::new(|conn, buffer, _when| {
        let message = buffer.retrieve_all_as_bytes();
        conn.send(&message);
        conn.shutdown();
    }));
    fixture.server.start().expect("unable to start server");

    let mut client = connect(fixture.server.local_addr());
    client.write_all(b"lonely").expect("write failed");
    let mut received = Vec::new();
    client.read_to_end(&mut received).expect("read failed");
    assert_eq!(received, b"lonely");
}

#[test]
fn echoes_large_payload_through_scatter_read() {
    const LEN: usize = 200_000;

    let fixture = start_server(1, "echo-large");
    fixture.server.set_message_callback(Arc::new(|conn, buffer, _when| {
        // Accumulate: the 200 kB arrive over several readiness events.
        if buffer.readable_bytes() >= LEN {
            let message = buffer.retrieve_all_as_bytes();
            conn.send(&message);
            conn.shutdown();
        }
    }));
    fixture.server.start().expect("unable to start server");

    let data = payload(LEN);
    let mut client = connect(fixture.server.local_addr());
    let writer_data = data.clone();
    let mut writer = client.try_clone().expect("clone failed");
    let writer = thread::spawn(move || {
        writer.write_all(&writer_data).expect("write failed");
    });

    let mut received = Vec::new();
    client.read_to_end(&mut received).expect("read failed");
    writer.join().expect("writer panicked");
    assert_eq!(received.len(), LEN);
    assert_eq!(received, data);
}

#[test]
fn high_water_mark_fires_once_on_the_crossing_edge() {
    const LEN: usize = 16 * 1024 * 1024;
    const MARK: usize = 1024 * 1024;

    let fixture = start_server(1, "echo-pressure");
    let fired = Arc::new(AtomicUsize::new(0));
    let buffered_at_crossing = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        let buffered = Arc::clone(&buffered_at_crossing);
        fixture.server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let fired = Arc::clone(&fired);
                let buffered = Arc::clone(&buffered);
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, buffered_bytes| {
                        fired.fetch_add(1, Ordering::AcqRel);
                        buffered.store(buffered_bytes, Ordering::Release);
                    }),
                    MARK,
                );
            }
        }));
    }
    fixture.server.set_message_callback(Arc::new(|conn, buffer, _when| {
        buffer.retrieve_all();
        conn.send(&payload(LEN));
    }));
    fixture.server.set_write_complete_callback(Arc::new(|conn| {
        conn.shutdown();
    }));
    fixture.server.start().expect("unable to start server");

    let mut client = connect(fixture.server.local_addr());
    client.write_all(b"go").expect("write failed");
    // Do not read yet: the server must buffer most of the payload and
    // signal backpressure exactly once.
    wait_until(
        || fired.load(Ordering::Acquire) == 1,
        Duration::from_secs(5),
        "the high-water-mark callback",
    );

    let mut received = Vec::new();
    client.read_to_end(&mut received).expect("read failed");
    assert_eq!(received, payload(LEN));
    assert_eq!(fired.load(Ordering::Acquire), 1, "must fire on the crossing edge only");
    let buffered = buffered_at_crossing.load(Ordering::Acquire);
    assert!(buffered >= MARK && buffered <= LEN);
}

#[test]
fn send_and_shutdown_from_a_foreign_thread() {
    let fixture = start_server(1, "echo-cross");
    fixture.server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            let conn = Arc::clone(conn);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                conn.send(b"ping");
                conn.shutdown();
            });
        }
    }));
    fixture.server.start().expect("unable to start server");

    let mut client = connect(fixture.server.local_addr());
    let mut received = Vec::new();
    client.read_to_end(&mut received).expect("read failed");
    assert_eq!(received, b"ping");
}

#[test]
fn connections_fan_out_round_robin_and_stay_pinned() {
    const LOOPS: usize = 4;
    const CONNECTIONS: usize = 16;

    let fixture = start_server(LOOPS, "echo-fanout");
    let up_threads: Arc<Mutex<HashMap<String, ThreadId>>> = Arc::new(Mutex::new(HashMap::new()));
    let message_threads: Arc<Mutex<HashMap<String, ThreadId>>> =
        Arc::new(Mutex::new(HashMap::new()));
    {
        let up_threads = Arc::clone(&up_threads);
        fixture.server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                up_threads
                    .lock()
                    .unwrap()
                    .insert(conn.name().to_string(), thread::current().id());
            }
        }));
    }
    {
        let message_threads = Arc::clone(&message_threads);
        fixture.server.set_message_callback(Arc::new(move |conn, buffer, _when| {
            message_threads
                .lock()
                .unwrap()
                .insert(conn.name().to_string(), thread::current().id());
            let message = buffer.retrieve_all_as_bytes();
            conn.send(&message);
        }));
    }
    fixture.server.start().expect("unable to start server");

    let mut clients = Vec::new();
    for _ in 0..CONNECTIONS {
        let mut client = connect(fixture.server.local_addr());
        client.write_all(b"hi").expect("write failed");
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).expect("read failed");
        assert_eq!(&reply, b"hi");
        clients.push(client);
    }

    let up_threads = up_threads.lock().unwrap();
    let message_threads = message_threads.lock().unwrap();
    assert_eq!(up_threads.len(), CONNECTIONS);
    assert_eq!(message_threads.len(), CONNECTIONS);

    // Every callback of a connection observed the same thread.
    let mut per_thread: HashMap<ThreadId, usize> = HashMap::new();
    for (name, up_thread) in up_threads.iter() {
        assert_eq!(Some(up_thread), message_threads.get(name), "{}", name);
        *per_thread.entry(*up_thread).or_default() += 1;
    }

    // Round robin: each of the 4 loops hosts exactly 4 connections.
    assert_eq!(per_thread.len(), LOOPS);
    for (_, count) in per_thread {
        assert_eq!(count, CONNECTIONS / LOOPS);
    }
}

#[test]
fn dropping_the_server_closes_live_connections() {
    const CONNECTIONS: usize = 8;

    let fixture = start_server(2, "echo-teardown");
    let ups = Arc::new(AtomicUsize::new(0));
    {
        let ups = Arc::clone(&ups);
        fixture.server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                ups.fetch_add(1, Ordering::AcqRel);
            }
        }));
    }
    fixture.server.start().expect("unable to start server");

    let mut clients: Vec<TcpStream> = (0..CONNECTIONS)
        .map(|_| connect(fixture.server.local_addr()))
        .collect();
    wait_until(
        || ups.load(Ordering::Acquire) == CONNECTIONS,
        Duration::from_secs(5),
        "all connections up",
    );

    // Tear the server down with every connection live; the pool joins its
    // loop threads, and every client observes an orderly end of stream.
    drop(fixture.server);
    for client in &mut clients {
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).expect("read failed");
        assert!(rest.is_empty());
    }
}

#[test]
fn shutdown_defers_until_the_output_drains() {
    const LEN: usize = 8 * 1024 * 1024;

    let fixture = start_server(1, "echo-drain");
    fixture.server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            // Most of this lands in the output buffer; the FIN must wait
            // for the drain.
            conn.send(&payload(LEN));
            conn.shutdown();
        }
    }));
    fixture.server.start().expect("unable to start server");

    let mut client = connect(fixture.server.local_addr());
    thread::sleep(Duration::from_millis(200));
    let mut received = Vec::new();
    client.read_to_end(&mut received).expect("read failed");
    assert_eq!(received.len(), LEN);
    assert_eq!(received, payload(LEN));
}
