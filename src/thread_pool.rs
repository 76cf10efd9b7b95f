//! Round-robin pool of loop threads.

use crate::event_loop::EventLoop;
use crate::loop_thread::{EventLoopThread, ThreadInitCallback};
use std::sync::Arc;
use tracing::debug;

/// Owns the subordinate loops and deals them out round-robin.
///
/// With zero threads the pool degenerates to the base loop: every
/// connection shares the caller's loop, which is the single-threaded mode.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> Self {
        Self {
            base_loop,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Number of subordinate loops to spawn. Must be called before `start`.
    pub fn set_num_threads(&mut self, num_threads: usize) {
        assert!(!self.started, "pool already started");
        self.num_threads = num_threads;
    }

    /// Spawn the loop threads, named `<pool_name>0`, `<pool_name>1`, ….
    ///
    /// With zero threads and an init callback, the callback runs on the
    /// base loop instead.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started, "pool already started");
        self.started = true;
        debug!(name = %self.name, threads = self.num_threads, "starting loop thread pool");

        for i in 0..self.num_threads {
            let mut thread = EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }

        if self.num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }
    }

    /// Pick the next loop, round-robin with no load awareness. Falls back
    /// to the base loop while the pool is empty.
    pub fn next_loop(&mut self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let io_loop = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        io_loop
    }

    /// Every loop in the pool, or the base loop alone when empty.
    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }
}
