use std::io;
use std::os::fd::RawFd;

/// Number of bytes reserved in front of the readable region so that
/// application-level headers can be prepended without copying the payload.
pub const CHEAP_PREPEND: usize = 8;

/// Default initial payload capacity.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack overflow area used by [`read_fd`].
///
/// [`read_fd`]: Buffer::read_fd
const EXTRA_BUF_SIZE: usize = 65536;

/// A growable byte buffer with separate reader and writer cursors.
///
/// The underlying storage is partitioned into three regions:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index   <=   writer_index    <=    capacity
/// ```
///
/// Initially both cursors sit at [`CHEAP_PREPEND`]. Appends advance the
/// writer cursor, retrieves advance the reader cursor, and retrieving
/// everything resets both cursors back to the prepend floor. When the
/// writable tail is too small for an append, consumed prepend space is
/// reclaimed by sliding the readable region down before the storage is
/// actually grown.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    /// Creates a buffer with the default initial capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer able to hold `initial_size` payload bytes before
    /// growing.
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes in front of the readable region.
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// Total size of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Returns the readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes `len` readable bytes. Consuming everything (or more than is
    /// readable) resets both cursors to the prepend floor.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes the whole readable region, resetting both cursors.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consumes and returns `len` readable bytes.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let bytes = self.peek()[..len].to_vec();
        self.retrieve(len);
        bytes
    }

    /// Consumes and returns the whole readable region.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Consumes and returns `len` readable bytes as a string, replacing
    /// invalid UTF-8 sequences.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(len)).into_owned()
    }

    /// Consumes and returns the whole readable region as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Appends `data` to the writable tail, growing the buffer if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Makes sure at least `len` bytes are writable.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Enough room overall: reclaim consumed prepend space by sliding
            // the readable region down to the prepend floor.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Reads from `fd` with a single `readv(2)` into the writable tail plus
    /// a 64 KiB stack overflow area, appending any overflow afterwards.
    ///
    /// One syscall usually drains even a bursty socket while the steady-state
    /// buffer stays small. Returns the number of bytes read; `0` means the
    /// peer closed its write half. `WouldBlock` means no data was available;
    /// there is no retry loop in here.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr().cast(),
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr().cast(),
                iov_len: extra_buf.len(),
            },
        ];
        let iov_count = if writable < extra_buf.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_mut_ptr(), iov_count))? as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `fd` with a single `write(2)`.
    ///
    /// Partial writes are expected; the caller consumes what was written via
    /// [`retrieve`]. `WouldBlock` means the descriptor accepted nothing.
    ///
    /// [`retrieve`]: Buffer::retrieve
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = syscall!(write(fd, self.peek().as_ptr().cast(), readable))?;
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}
