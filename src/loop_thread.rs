use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::event_loop::{EventLoop, LoopHandle};

/// Callback run against every freshly created loop before it starts
/// processing events: a hook for per-loop setup such as registering
/// thread-wide state.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// One OS thread hosting one [`EventLoop`].
///
/// The loop lives on the stack of the spawned thread ("one loop per
/// thread"); what crosses back to the creator is the loop's [`LoopHandle`].
/// Dropping a `LoopThread` asks the hosted loop to quit and joins the
/// thread.
pub struct LoopThread {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

/// Publish slot for the handshake between `start_loop` and the new thread.
type LoopPublish = Arc<(Mutex<Option<io::Result<LoopHandle>>>, Condvar)>;

impl LoopThread {
    /// Spawns a thread named `name` hosting a new event loop and blocks
    /// until the loop is constructed, returning once its handle is
    /// published.
    ///
    /// `init` runs on the new thread, against the new loop, before the loop
    /// starts.
    pub fn start_loop(name: &str, init: Option<ThreadInitCallback>) -> io::Result<LoopThread> {
        let publish: LoopPublish = Arc::new((Mutex::new(None), Condvar::new()));
        let published = Arc::clone(&publish);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop_thread_main(init, published))?;

        let (slot, condvar) = &*publish;
        let mut slot = slot.lock();
        while slot.is_none() {
            condvar.wait(&mut slot);
        }
        // The slot is filled exactly once, by the loop thread.
        match slot.take() {
            Some(Ok(handle)) => Ok(LoopThread {
                handle,
                thread: Some(thread),
            }),
            Some(Err(err)) => {
                drop(slot);
                let _ = thread.join();
                Err(err)
            }
            None => unreachable!("loop handle published without a value"),
        }
    }

    /// Handle to the hosted loop.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn loop_thread_main(init: Option<ThreadInitCallback>, publish: LoopPublish) {
    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            error!("failed to create event loop: {}", err);
            let (slot, condvar) = &*publish;
            *slot.lock() = Some(Err(err));
            condvar.notify_one();
            return;
        }
    };
    if let Some(init) = init {
        init(&event_loop);
    }
    {
        let (slot, condvar) = &*publish;
        *slot.lock() = Some(Ok(event_loop.handle()));
        condvar.notify_one();
    }
    event_loop.run();
    debug!("loop thread {:?} finished", thread::current().name());
}

/// A pool of I/O loop threads with round-robin hand-out.
///
/// With zero threads configured the pool degenerates to the single-reactor
/// case: [`get_next_loop`] always returns the base loop and the init
/// callback runs once against it.
///
/// [`get_next_loop`]: LoopPool::get_next_loop
pub struct LoopPool {
    base_loop: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<LoopThread>,
    loops: Vec<LoopHandle>,
}

impl LoopPool {
    pub fn new(base_loop: LoopHandle, name: &str) -> LoopPool {
        LoopPool {
            base_loop,
            name: name.to_string(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Configures the number of I/O loop threads. Must be called before
    /// [`start`].
    ///
    /// [`start`]: LoopPool::start
    pub fn set_thread_num(&mut self, num_threads: usize) {
        debug_assert!(!self.started);
        self.num_threads = num_threads;
    }

    /// Spawns the configured loop threads, running `init` against each new
    /// loop (or once against the base loop when no threads are configured).
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        debug_assert!(!self.started);
        self.started = true;
        for i in 0..self.num_threads {
            let name = format!("{}{}", self.name, i);
            let thread = LoopThread::start_loop(&name, init.clone())?;
            self.loops.push(thread.handle().clone());
            self.threads.push(thread);
        }
        if self.num_threads == 0 {
            if let Some(init) = init {
                self.base_loop.run_in_loop(move |event_loop| init(event_loop));
            }
        }
        Ok(())
    }

    /// Returns the loop for the next connection.
    ///
    /// Plain modular rotation; callers serialize access (the server only
    /// calls this from the acceptor loop).
    pub fn get_next_loop(&mut self) -> LoopHandle {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let handle = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        handle
    }
}
