use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use log::{debug, error, trace};

use crate::channel::{Channel, ChannelState};
use crate::event::Ready;
use crate::interest::Interest;
use crate::timestamp::Timestamp;

/// Initial number of event slots handed to a single wait.
const INIT_EVENT_LIST_SIZE: usize = 16;

/// A readiness demultiplexer owning the descriptor-to-channel map of one
/// event loop.
///
/// The contract is level-triggered: as long as a registered descriptor is
/// ready and its interest covers that readiness, every wait reports it
/// again. The loop relies on this: handlers perform a single `accept`,
/// `readv` or `write` per callback and leave the rest for the next
/// iteration.
///
/// The concrete implementation is [`EpollPoller`]; an edge-triggered or
/// `poll(2)`-style backend can substitute behind this trait without any
/// other component changing.
pub trait Poller {
    /// Blocks until readiness arrives or `timeout_ms` elapses.
    ///
    /// For every ready channel, writes the returned readiness into the
    /// channel and appends its descriptor to `active_channels`. Returns the
    /// time at which the wait returned. Interruption (`EINTR`) is not an
    /// error; backend failures are logged and contained.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<RawFd>) -> Timestamp;

    /// Places `channel` into the descriptor map.
    ///
    /// The channel starts unregistered; the first interest edit performs the
    /// backend registration.
    fn add_channel(&mut self, channel: Channel);

    /// Reconciles the backend registration of `fd` with the channel's
    /// current interest set and status tag.
    fn update_channel(&mut self, fd: RawFd);

    /// Erases `fd` from the descriptor map, deregistering it first if it is
    /// currently registered.
    fn remove_channel(&mut self, fd: RawFd);

    /// Returns `true` if `fd` is in the descriptor map.
    fn has_channel(&self, fd: RawFd) -> bool;

    /// Returns the channel bound to `fd`, if any.
    fn channel_mut(&mut self, fd: RawFd) -> Option<&mut Channel>;
}

/// Level-triggered demultiplexer over `epoll(7)`.
pub struct EpollPoller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Channel>,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(EpollPoller {
            ep,
            events: Vec::with_capacity(INIT_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Option<Interest>) {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        let event_ptr: *mut libc::epoll_event = if op == libc::EPOLL_CTL_DEL {
            ptr::null_mut()
        } else {
            &mut event
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, event_ptr)) {
            if op == libc::EPOLL_CTL_DEL {
                debug!("epoll_ctl del for fd {} failed: {}", fd, err);
            } else {
                error!("epoll_ctl add/mod for fd {} failed: {}", fd, err);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<RawFd>) -> Timestamp {
        trace!("polling {} registered fds", self.channels.len());
        self.events.clear();
        let n_events = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ms,
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => 0,
            Err(err) => {
                error!("epoll_wait failed: {}", err);
                0
            }
        };
        // SAFETY: `epoll_wait` initialised `n_events` slots.
        unsafe { self.events.set_len(n_events) };
        let now = Timestamp::now();
        if n_events > 0 {
            trace!("{} events happened", n_events);
            for event in &self.events {
                let fd = event.u64 as RawFd;
                if let Some(channel) = self.channels.get_mut(&fd) {
                    channel.set_ready(ready_from_epoll(event.events));
                    active_channels.push(fd);
                }
            }
            if n_events == self.events.capacity() {
                // A single wait filled the buffer; double it for the next one.
                self.events.reserve(n_events);
            }
        }
        now
    }

    fn add_channel(&mut self, channel: Channel) {
        trace!("adding channel for fd {}", channel.fd());
        self.channels.insert(channel.fd(), channel);
    }

    fn update_channel(&mut self, fd: RawFd) {
        let (op, interest) = match self.channels.get_mut(&fd) {
            Some(channel) => match channel.state() {
                ChannelState::New | ChannelState::Deleted => {
                    channel.set_state(ChannelState::Added);
                    (libc::EPOLL_CTL_ADD, channel.interest())
                }
                ChannelState::Added => {
                    if channel.is_none_event() {
                        channel.set_state(ChannelState::Deleted);
                        (libc::EPOLL_CTL_DEL, None)
                    } else {
                        (libc::EPOLL_CTL_MOD, channel.interest())
                    }
                }
            },
            None => return,
        };
        trace!("updating fd {} with interest {:?}", fd, interest);
        self.ctl(op, fd, interest);
    }

    fn remove_channel(&mut self, fd: RawFd) {
        if let Some(channel) = self.channels.remove(&fd) {
            trace!("removing channel for fd {}", fd);
            if channel.state() == ChannelState::Added {
                self.ctl(libc::EPOLL_CTL_DEL, fd, None);
            }
        }
    }

    fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    fn channel_mut(&mut self, fd: RawFd) -> Option<&mut Channel> {
        self.channels.get_mut(&fd)
    }
}

/// Maps an interest set to a level-triggered epoll mask.
fn interest_to_epoll(interest: Option<Interest>) -> u32 {
    let mut kind = 0;
    if let Some(interest) = interest {
        if interest.is_readable() {
            kind |= libc::EPOLLIN | libc::EPOLLPRI;
        }
        if interest.is_writable() {
            kind |= libc::EPOLLOUT;
        }
    }
    kind as u32
}

fn ready_from_epoll(events: u32) -> Ready {
    let events = events as libc::c_int;
    let mut ready = Ready::EMPTY;
    if events & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        ready = ready.add(Ready::READABLE);
    }
    if events & libc::EPOLLOUT != 0 {
        ready = ready.add(Ready::WRITABLE);
    }
    if events & libc::EPOLLERR != 0 {
        ready = ready.add(Ready::ERROR);
    }
    if events & libc::EPOLLHUP != 0 {
        ready = ready.add(Ready::HANGUP);
    }
    ready
}
