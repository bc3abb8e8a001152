use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{debug, error};
use parking_lot::Mutex;

use crate::channel::{self, Channel, EventHandler};
use crate::poller::{EpollPoller, Poller};
use crate::sys::Waker;
use crate::timestamp::Timestamp;

/// How long one poll call may block before the loop re-checks its quit flag.
const POLL_TIMEOUT_MS: i32 = 10_000;

/// A unit of work executed on a loop's thread, with the loop in hand.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send>;

thread_local! {
    /// Guards the one-loop-per-thread invariant across the loop's lifetime.
    static INSTALLED: Cell<bool> = const { Cell::new(false) };
    /// Address of the loop currently inside [`EventLoop::run`] on this
    /// thread; null outside of `run`.
    static CURRENT: Cell<*const EventLoop> = const { Cell::new(ptr::null()) };
}

/// A single-threaded event loop: one poller, one wakeup descriptor, one
/// pending-task queue.
///
/// A loop is bound to the thread that created it for its whole lifetime (the
/// type is deliberately `!Send`), and at most one loop may exist per thread.
/// All channels, buffers and connection state managed by a loop are touched
/// only from its thread; the sanctioned cross-thread entry points are
/// [`queue_in_loop`], [`run_in_loop`] and [`quit`], reachable from other
/// threads through the [`LoopHandle`] returned by [`handle`].
///
/// [`queue_in_loop`]: EventLoop::queue_in_loop
/// [`run_in_loop`]: EventLoop::run_in_loop
/// [`quit`]: EventLoop::quit
/// [`handle`]: EventLoop::handle
pub struct EventLoop {
    poller: RefCell<Box<dyn Poller>>,
    shared: Arc<LoopShared>,
    looping: Cell<bool>,
    poll_return_time: Cell<Timestamp>,
}

/// The part of a loop that other threads may touch.
struct LoopShared {
    thread: ThreadId,
    quit: AtomicBool,
    waker: Waker,
    pending_tasks: Mutex<Vec<Task>>,
    executing_pending_tasks: AtomicBool,
}

impl LoopShared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            error!("event loop wakeup failed: {}", err);
        }
    }

    fn queue(&self, task: Task) {
        self.pending_tasks.lock().push(task);
        // Wake when the submitter is foreign, and also when the loop is
        // draining its queue right now: otherwise it could go back to a full
        // poll wait before seeing this task.
        if !self.is_in_loop_thread() || self.executing_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }
}

/// Consumes wakeup tokens so the wakeup descriptor stops reading ready.
struct WakeupHandler {
    shared: Arc<LoopShared>,
}

impl EventHandler for WakeupHandler {
    fn handle_read(&self, _event_loop: &EventLoop, _receive_time: Timestamp) {
        self.shared.waker.consume();
    }
}

/// Clears the running-loop address when `run` exits, even by panic.
struct CurrentLoopGuard;

impl CurrentLoopGuard {
    fn install(event_loop: &EventLoop) -> CurrentLoopGuard {
        CURRENT.with(|current| current.set(event_loop as *const EventLoop));
        CurrentLoopGuard
    }
}

impl Drop for CurrentLoopGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(ptr::null()));
    }
}

impl EventLoop {
    /// Creates the event loop for the current thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already has an `EventLoop`; one loop per
    /// thread is a hard invariant.
    pub fn new() -> io::Result<EventLoop> {
        INSTALLED.with(|installed| {
            assert!(
                !installed.get(),
                "another EventLoop already exists in this thread"
            );
        });
        let poller = EpollPoller::new()?;
        let waker = Waker::new()?;
        let wakeup_fd = waker.as_raw_fd();
        let shared = Arc::new(LoopShared {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            waker,
            pending_tasks: Mutex::new(Vec::new()),
            executing_pending_tasks: AtomicBool::new(false),
        });
        let event_loop = EventLoop {
            poller: RefCell::new(Box::new(poller)),
            shared: Arc::clone(&shared),
            looping: Cell::new(false),
            poll_return_time: Cell::new(Timestamp::now()),
        };
        debug!("EventLoop created in {:?}", shared.thread);
        // Every loop listens on its own wakeup descriptor so that foreign
        // threads can knock it out of a poll wait.
        let handler = Arc::new(WakeupHandler { shared });
        event_loop.add_channel(Channel::with_handler(wakeup_fd, handler));
        event_loop.enable_reading(wakeup_fd);
        INSTALLED.with(|installed| installed.set(true));
        Ok(event_loop)
    }

    /// Runs the loop until [`quit`] is observed.
    ///
    /// Each iteration waits for readiness (up to 10 s), dispatches every
    /// active channel, then drains the pending-task queue. While `run` is
    /// active, tasks submitted from this thread via a [`LoopHandle`] execute
    /// inline.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&self) {
        self.looping.set(true);
        // A quit issued between construction and `run` must still take
        // effect, so the flag is not reset here.
        let _guard = CurrentLoopGuard::install(self);
        debug!("EventLoop start looping");

        let mut active_channels = Vec::new();
        while !self.shared.quit.load(Ordering::Acquire) {
            active_channels.clear();
            let receive_time = self
                .poller
                .borrow_mut()
                .poll(POLL_TIMEOUT_MS, &mut active_channels);
            self.poll_return_time.set(receive_time);
            for &fd in &active_channels {
                let ready_handler = {
                    let mut poller = self.poller.borrow_mut();
                    poller
                        .channel_mut(fd)
                        .and_then(|channel| channel.handler().map(|h| (h, channel.ready())))
                };
                // A handler earlier in this iteration may have removed the
                // channel, and a tied handler may be gone; both are skipped.
                if let Some((handler, ready)) = ready_handler {
                    channel::dispatch(&handler, self, ready, receive_time);
                }
            }
            self.execute_pending_tasks();
        }

        debug!("EventLoop stop looping");
        self.looping.set(false);
    }

    /// Asks the loop to exit after its current iteration.
    ///
    /// Callable from any thread; a foreign caller also wakes the loop so the
    /// flag is observed before the next poll wait. Tasks already queued when
    /// the loop exits may or may not run.
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Runs `task` on the loop's thread: inline when called from it,
    /// otherwise via [`queue_in_loop`].
    ///
    /// [`queue_in_loop`]: EventLoop::queue_in_loop
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task(self);
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue, waking the loop if necessary.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.shared.queue(Box::new(task));
    }

    /// Forces the loop out of its poll wait.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Returns `true` iff the current thread owns this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Returns `true` while [`run`] is executing.
    ///
    /// [`run`]: EventLoop::run
    pub fn is_looping(&self) -> bool {
        self.looping.get()
    }

    /// Returns a cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The time at which the most recent poll wait returned.
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }

    /// Calls `f` with the loop currently running on this thread, if any.
    pub fn with_current<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&EventLoop) -> R,
    {
        CURRENT.with(|current| {
            let current = current.get();
            if current.is_null() {
                None
            } else {
                // SAFETY: the pointer is installed by `run` for exactly the
                // duration of its borrow of the loop, and is only ever read
                // from the loop's own thread.
                Some(f(unsafe { &*current }))
            }
        })
    }

    fn execute_pending_tasks(&self) {
        self.shared
            .executing_pending_tasks
            .store(true, Ordering::Release);
        // Swap the queue into a local so arbitrary task bodies never run
        // under the queue mutex and may themselves enqueue further tasks;
        // those run on the next iteration.
        let tasks = std::mem::take(&mut *self.shared.pending_tasks.lock());
        for task in tasks {
            task(self);
        }
        self.shared
            .executing_pending_tasks
            .store(false, Ordering::Release);
    }

    // ===== Channel management, owning thread only =====

    /// Places `channel` under this loop's management.
    pub fn add_channel(&self, channel: Channel) {
        debug_assert!(self.is_in_loop_thread());
        self.poller.borrow_mut().add_channel(channel);
    }

    /// Reconciles `fd`'s backend registration with its current interest set.
    pub fn update_channel(&self, fd: RawFd) {
        debug_assert!(self.is_in_loop_thread());
        self.poller.borrow_mut().update_channel(fd);
    }

    /// Removes `fd`'s channel entirely. No-op for an unknown descriptor.
    pub fn remove_channel(&self, fd: RawFd) {
        debug_assert!(self.is_in_loop_thread());
        self.poller.borrow_mut().remove_channel(fd);
    }

    /// Returns `true` if `fd` has a channel on this loop.
    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.poller.borrow_mut().has_channel(fd)
    }

    pub fn enable_reading(&self, fd: RawFd) {
        self.edit_channel(fd, Channel::enable_reading);
    }

    pub fn disable_reading(&self, fd: RawFd) {
        self.edit_channel(fd, Channel::disable_reading);
    }

    pub fn enable_writing(&self, fd: RawFd) {
        self.edit_channel(fd, Channel::enable_writing);
    }

    pub fn disable_writing(&self, fd: RawFd) {
        self.edit_channel(fd, Channel::disable_writing);
    }

    /// Clears every interest of `fd`, deregistering it from the backend.
    pub fn disable_all(&self, fd: RawFd) {
        self.edit_channel(fd, Channel::disable_all);
    }

    /// Returns `true` if `fd`'s channel currently has write interest.
    pub fn is_writing(&self, fd: RawFd) -> bool {
        self.poller
            .borrow_mut()
            .channel_mut(fd)
            .map_or(false, |channel| channel.is_writing())
    }

    fn edit_channel<F>(&self, fd: RawFd, edit: F)
    where
        F: FnOnce(&mut Channel),
    {
        debug_assert!(self.is_in_loop_thread());
        let mut poller = self.poller.borrow_mut();
        if let Some(channel) = poller.channel_mut(fd) {
            edit(channel);
            poller.update_channel(fd);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let wakeup_fd = self.shared.waker.as_raw_fd();
        {
            let mut poller = self.poller.borrow_mut();
            if let Some(channel) = poller.channel_mut(wakeup_fd) {
                channel.disable_all();
                poller.update_channel(wakeup_fd);
            }
            poller.remove_channel(wakeup_fd);
        }
        INSTALLED.with(|installed| installed.set(false));
    }
}

/// Cloneable, `Send + Sync` handle to an [`EventLoop`] on another (or the
/// same) thread.
///
/// This is how loops are passed around: the pool hands them out for
/// round-robin assignment, connections keep one to funnel work back to their
/// owning loop. The handle reaches only the cross-thread-safe part of the
/// loop; a task handed to [`run_in_loop`] or [`queue_in_loop`] receives
/// `&EventLoop` once it executes on the owning thread.
///
/// [`run_in_loop`]: LoopHandle::run_in_loop
/// [`queue_in_loop`]: LoopHandle::queue_in_loop
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Returns `true` iff the current thread owns the loop behind this
    /// handle.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Runs `task` on the owning loop: inline when called from its thread
    /// while the loop is running, otherwise queued.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() && has_current() {
            EventLoop::with_current(|current| task(current));
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the owning loop's pending queue, waking it if
    /// necessary.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.shared.queue(Box::new(task));
    }

    /// Asks the owning loop to exit; wakes it when called from a foreign
    /// thread.
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Forces the owning loop out of its poll wait.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }
}

fn has_current() -> bool {
    CURRENT.with(|current| !current.get().is_null())
}
