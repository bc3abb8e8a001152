use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use log::trace;

use crate::event::Ready;
use crate::event_loop::EventLoop;
use crate::interest::Interest;
use crate::timestamp::Timestamp;

/// Receiver of readiness callbacks for one channel.
///
/// All four methods default to doing nothing, so a handler only implements
/// the events it cares about. Methods run on the channel's owning loop
/// thread and must not block; the dispatching loop holds a strong reference
/// to the handler for the duration of a dispatch.
pub trait EventHandler {
    /// The descriptor became readable. `receive_time` is when the poll call
    /// that reported the event returned.
    fn handle_read(&self, event_loop: &EventLoop, receive_time: Timestamp) {
        let _ = (event_loop, receive_time);
    }

    /// The descriptor became writable.
    fn handle_write(&self, event_loop: &EventLoop) {
        let _ = event_loop;
    }

    /// The peer hung up without anything left to read.
    fn handle_close(&self, event_loop: &EventLoop) {
        let _ = event_loop;
    }

    /// The descriptor is in an error state.
    fn handle_error(&self, event_loop: &EventLoop) {
        let _ = event_loop;
    }
}

/// How a channel holds on to its handler.
///
/// The acceptor and wakeup channels hold their handlers strongly: those
/// objects outlive every event they can receive. A connection's channel only
/// pins its handler weakly and upgrades per dispatch, because readiness can
/// outlive the last shared owner of the connection; dispatching into a
/// destroyed connection is the lifetime hazard this encodes away.
enum HandlerSlot {
    Strong(Arc<dyn EventHandler>),
    Tied(Weak<dyn EventHandler>),
}

impl HandlerSlot {
    fn upgrade(&self) -> Option<Arc<dyn EventHandler>> {
        match self {
            HandlerSlot::Strong(handler) => Some(Arc::clone(handler)),
            HandlerSlot::Tied(handler) => handler.upgrade(),
        }
    }
}

/// Registration bookkeeping state, maintained by the poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelState {
    /// Never registered with the backend.
    New,
    /// Currently registered.
    Added,
    /// Was registered, currently has no interests.
    Deleted,
}

/// Binds one file descriptor to its interest set and its event handler
/// within one [`EventLoop`].
///
/// A channel does not own its descriptor and never closes it. Channels live
/// in the descriptor map of their loop's poller; interest edits go through
/// the loop (for example [`EventLoop::enable_reading`]), which updates the
/// mask and reconciles the backend registration in one step.
pub struct Channel {
    fd: RawFd,
    interest: Option<Interest>,
    ready: Ready,
    state: ChannelState,
    handler: HandlerSlot,
}

impl Channel {
    /// Creates a channel whose handler is held strongly.
    pub fn with_handler(fd: RawFd, handler: Arc<dyn EventHandler>) -> Channel {
        Channel {
            fd,
            interest: None,
            ready: Ready::EMPTY,
            state: ChannelState::New,
            handler: HandlerSlot::Strong(handler),
        }
    }

    /// Creates a channel tied to its handler through a weak reference.
    ///
    /// Each dispatch upgrades the reference and skips the event if the
    /// handler is already gone.
    pub fn with_tied_handler(fd: RawFd, handler: Weak<dyn EventHandler>) -> Channel {
        Channel {
            fd,
            interest: None,
            ready: Ready::EMPTY,
            state: ChannelState::New,
            handler: HandlerSlot::Tied(handler),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Option<Interest> {
        self.interest
    }

    /// Readiness reported by the most recent poll that returned this channel.
    pub fn ready(&self) -> Ready {
        self.ready
    }

    pub fn is_reading(&self) -> bool {
        self.interest.map_or(false, Interest::is_readable)
    }

    pub fn is_writing(&self) -> bool {
        self.interest.map_or(false, Interest::is_writable)
    }

    pub fn is_none_event(&self) -> bool {
        self.interest.is_none()
    }

    pub(crate) fn set_ready(&mut self, ready: Ready) {
        self.ready = ready;
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    pub(crate) fn enable_reading(&mut self) {
        self.add_interest(Interest::READABLE);
    }

    pub(crate) fn disable_reading(&mut self) {
        self.remove_interest(Interest::READABLE);
    }

    pub(crate) fn enable_writing(&mut self) {
        self.add_interest(Interest::WRITABLE);
    }

    pub(crate) fn disable_writing(&mut self) {
        self.remove_interest(Interest::WRITABLE);
    }

    pub(crate) fn disable_all(&mut self) {
        self.interest = None;
    }

    fn add_interest(&mut self, interest: Interest) {
        self.interest = Some(match self.interest {
            Some(current) => current | interest,
            None => interest,
        });
    }

    fn remove_interest(&mut self, interest: Interest) {
        self.interest = self.interest.and_then(|current| current.remove(interest));
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.handler.upgrade()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .field("ready", &self.ready)
            .field("state", &self.state)
            .finish()
    }
}

/// Fires the handler callbacks matching `ready`, in the fixed order
/// close → error → read → write.
///
/// Close only fires for a hangup with nothing left to read; a hangup with
/// pending data is delivered through the read path first so the input is not
/// lost. Several callbacks may fire for a single dispatch.
pub(crate) fn dispatch(
    handler: &Arc<dyn EventHandler>,
    event_loop: &EventLoop,
    ready: Ready,
    receive_time: Timestamp,
) {
    trace!("dispatching events: {:?}", ready);
    if ready.is_hangup() && !ready.is_readable() {
        handler.handle_close(event_loop);
    }
    if ready.is_error() {
        handler.handle_error(event_loop);
    }
    if ready.is_readable() {
        handler.handle_read(event_loop, receive_time);
    }
    if ready.is_writable() {
        handler.handle_write(event_loop);
    }
}
