//! Raw OS plumbing: socket syscalls, sockaddr conversions and the eventfd
//! wakeup primitive. Everything in here speaks `io::Result`; policy lives in
//! the layers above.

mod net;
mod socket;
mod waker;

pub use self::socket::Socket;
pub(crate) use self::waker::Waker;
