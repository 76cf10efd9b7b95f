//! Pairs one OS thread with one event loop.

use crate::event_loop::EventLoop;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::error;

/// Invoked once on each subordinate loop right after its thread starts.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

struct Shared {
    io_loop: Mutex<Option<Arc<EventLoop>>>,
    ready: Condvar,
}

/// Owns a named thread whose entire life is one `EventLoop::run`.
pub struct EventLoopThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    name: String,
    init: Option<ThreadInitCallback>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> Self {
        Self {
            shared: Arc::new(Shared {
                io_loop: Mutex::new(None),
                ready: Condvar::new(),
            }),
            handle: None,
            name: name.into(),
            init,
        }
    }

    /// Spawn the thread and block until its loop has been constructed and
    /// published. Returns the loop handle.
    ///
    /// # Panics
    ///
    /// Panics if called twice, or if the OS refuses to spawn the thread.
    pub fn start_loop(&mut self) -> Arc<EventLoop> {
        assert!(self.handle.is_none(), "loop thread already started");

        let shared = self.shared.clone();
        let init = self.init.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let io_loop = match EventLoop::new() {
                    Ok(io_loop) => io_loop,
                    Err(e) => {
                        error!("failed to create event loop: {e}");
                        panic!("event loop creation failed: {e}");
                    }
                };
                if let Some(init) = &init {
                    init(&io_loop);
                }
                {
                    let mut slot = shared.io_loop.lock();
                    *slot = Some(io_loop.clone());
                    shared.ready.notify_one();
                }

                io_loop.run();

                // The loop has exited; drop the published handle so the
                // owner cannot address a dead loop.
                *shared.io_loop.lock() = None;
            })
            .expect("failed to spawn loop thread");
        self.handle = Some(handle);

        let mut slot = self.shared.io_loop.lock();
        loop {
            if let Some(io_loop) = slot.as_ref() {
                return io_loop.clone();
            }
            self.shared.ready.wait(&mut slot);
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let io_loop = self.shared.io_loop.lock().clone();
        if let Some(io_loop) = io_loop {
            io_loop.quit();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_start_loop_publishes_running_loop() {
        let mut loop_thread = EventLoopThread::new("test-loop0", None);
        let io_loop = loop_thread.start_loop();
        assert!(!io_loop.is_in_loop_thread());

        let (tx, rx) = mpsc::channel();
        io_loop.queue_in_loop(move || tx.send(thread::current().name().map(String::from)).unwrap());
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-loop0"));
    }

    #[test]
    fn test_init_callback_runs_before_publication() {
        let (tx, rx) = mpsc::channel::<()>();
        let tx = Mutex::new(Some(tx));
        let init: ThreadInitCallback = Arc::new(move |_| {
            if let Some(tx) = tx.lock().take() {
                drop(tx); // closing the channel marks the callback as done
            }
        });

        let mut loop_thread = EventLoopThread::new("test-loop1", Some(init));
        let _io_loop = loop_thread.start_loop();
        // By the time start_loop returns the init callback must have run.
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_drop_quits_and_joins() {
        let mut loop_thread = EventLoopThread::new("test-loop2", None);
        let io_loop = loop_thread.start_loop();
        drop(loop_thread);
        // After drop the thread is joined, so the loop is no longer running.
        assert!(!io_loop.is_in_loop_thread());
    }
}
