use std::io;
use std::os::fd::AsRawFd;

use muxio::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

mod util;
use util::{fill_pipe, nonblocking_pipe, payload, pipe, set_pipe_capacity};

const EXTRA_BUF_SIZE: usize = 65536;

fn region_sum(buffer: &Buffer) -> usize {
    buffer.prependable_bytes() + buffer.readable_bytes() + buffer.writable_bytes()
}

#[test]
fn fresh_buffer_layout() {
    let buffer = Buffer::new();
    assert_eq!(buffer.readable_bytes(), 0);
    assert_eq!(buffer.writable_bytes(), INITIAL_SIZE);
    assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);
    assert_eq!(buffer.capacity(), CHEAP_PREPEND + INITIAL_SIZE);
}

#[test]
fn append_retrieve_round_trip() {
    let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
    let mut buffer = Buffer::new();
    buffer.append(&data);
    assert_eq!(buffer.readable_bytes(), data.len());
    assert_eq!(buffer.peek(), &data[..]);
    assert_eq!(buffer.retrieve_all_as_bytes(), data);
    assert_eq!(buffer.readable_bytes(), 0);
}

#[test]
fn retrieve_all_resets_to_prepend_floor() {
    let mut buffer = Buffer::new();
    buffer.append(&payload(100));
    buffer.retrieve(40);
    assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND + 40);
    buffer.retrieve_all();
    assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);
    assert_eq!(buffer.readable_bytes(), 0);
    // Retrieving more than is readable also resets both cursors.
    buffer.append(&payload(10));
    buffer.retrieve(100);
    assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);
}

#[test]
fn partial_retrieve_as_string() {
    let mut buffer = Buffer::new();
    buffer.append(b"hello world");
    assert_eq!(buffer.retrieve_as_string(5), "hello");
    assert_eq!(buffer.readable_bytes(), 6);
    assert_eq!(buffer.retrieve_all_as_string(), " world");
}

#[test]
fn regions_always_sum_to_capacity() {
    let data = payload(100);
    let mut buffer = Buffer::new();
    for round in 0..200 {
        buffer.append(&data);
        assert_eq!(region_sum(&buffer), buffer.capacity());
        if round % 3 == 0 {
            buffer.retrieve(buffer.readable_bytes() / 2);
            assert_eq!(region_sum(&buffer), buffer.capacity());
        }
    }
    buffer.retrieve_all();
    assert_eq!(region_sum(&buffer), buffer.capacity());
}

#[test]
fn growth_reclaims_consumed_prepend_space() {
    let mut buffer = Buffer::new();
    buffer.append(&payload(INITIAL_SIZE));
    let capacity = buffer.capacity();
    // Consume most of the readable region, then append more than the
    // writable tail can hold but less than tail + reclaimed prepend space:
    // the buffer must slide instead of allocating.
    buffer.retrieve(900);
    let kept = buffer.peek().to_vec();
    buffer.append(&payload(500));
    assert_eq!(buffer.capacity(), capacity);
    assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);
    assert_eq!(buffer.readable_bytes(), kept.len() + 500);
    assert_eq!(&buffer.peek()[..kept.len()], &kept[..]);
}

#[test]
fn growth_resizes_when_sliding_is_not_enough() {
    let mut buffer = Buffer::new();
    buffer.append(&payload(INITIAL_SIZE));
    let capacity = buffer.capacity();
    buffer.append(&payload(INITIAL_SIZE));
    assert!(buffer.capacity() > capacity);
    assert_eq!(buffer.readable_bytes(), 2 * INITIAL_SIZE);
    assert_eq!(region_sum(&buffer), buffer.capacity());
}

#[test]
fn scatter_read_below_extra_buffer_boundary() {
    let data = payload(60_000);
    let (read, write) = pipe();
    set_pipe_capacity(&write, 1 << 20);
    fill_pipe(write, &data);

    let mut buffer = Buffer::new();
    let n = buffer.read_fd(read.as_raw_fd()).expect("read_fd failed");
    assert_eq!(n, data.len());
    assert_eq!(buffer.retrieve_all_as_bytes(), data);
}

#[test]
fn scatter_read_overflows_into_extra_buffer() {
    let data = payload(200_000);
    let (read, write) = pipe();
    set_pipe_capacity(&write, 1 << 20);
    fill_pipe(write, &data);

    // A fresh buffer offers 1024 writable bytes plus the 64 KiB stack area,
    // so a single scatter read caps out at exactly that.
    let mut buffer = Buffer::new();
    let n = buffer.read_fd(read.as_raw_fd()).expect("read_fd failed");
    assert_eq!(n, INITIAL_SIZE + EXTRA_BUF_SIZE);
    assert_eq!(buffer.readable_bytes(), n);
    assert_eq!(buffer.peek(), &data[..n]);

    // Draining the rest reassembles the payload byte for byte.
    let mut received = buffer.retrieve_all_as_bytes();
    while received.len() < data.len() {
        let n = buffer.read_fd(read.as_raw_fd()).expect("read_fd failed");
        assert!(n > 0);
        received.extend(buffer.retrieve_all_as_bytes());
    }
    assert_eq!(received, data);
}

#[test]
fn read_fd_reports_would_block() {
    let (read, _write) = nonblocking_pipe();
    let mut buffer = Buffer::new();
    let err = buffer.read_fd(read.as_raw_fd()).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    assert_eq!(buffer.readable_bytes(), 0);
}

#[test]
fn write_fd_round_trip() {
    use std::io::Read;

    let data = payload(30_000);
    let (read, write) = pipe();
    set_pipe_capacity(&write, 1 << 20);

    let mut buffer = Buffer::new();
    buffer.append(&data);
    let n = buffer.write_fd(write.as_raw_fd()).expect("write_fd failed");
    buffer.retrieve(n);
    assert_eq!(n, data.len());
    assert_eq!(buffer.readable_bytes(), 0);
    drop(write);

    let mut received = Vec::new();
    std::fs::File::from(read)
        .read_to_end(&mut received)
        .expect("unable to read pipe");
    assert_eq!(received, data);
}
