//! The event loop: one per thread, the thread owned by the loop's creator.
//!
//! A loop owns a readiness poller, an eventfd used to interrupt a blocked
//! poll from other threads, and a queue of cross-thread tasks. Channel
//! dispatch and pending tasks run only on the owner thread; `run_in_loop`,
//! `queue_in_loop`, `quit`, and `wakeup` may be called from anywhere.
//!
//! One loop per thread is a process-wide invariant, enforced through a
//! thread-local slot at construction. Violating it is a fatal programmer
//! error.

use crate::channel::Channel;
use crate::metrics::LOOP_WAKEUPS;
use crate::poller::{self, Poller};
use parking_lot::Mutex;
use std::cell::Cell;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace};

/// Poll timeout. Bounds how long a quit request can go unnoticed when no
/// wakeup is written.
pub(crate) const POLL_TIMEOUT_MS: i32 = 10_000;

/// A cross-thread task marshalled into the owner thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Id of the loop constructed in this thread, 0 when none.
    static LOOP_IN_THIS_THREAD: Cell<u64> = const { Cell::new(0) };
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A single-threaded reactor driving channels and pending tasks.
pub struct EventLoop {
    id: u64,
    owner_thread: ThreadId,
    /// Touched only by the owner thread; every access is preceded by a
    /// thread assertion, so the lock is never contended.
    poller: Mutex<Box<dyn Poller + Send>>,
    wakeup_fd: OwnedFd,
    wakeup_channel: Mutex<Option<Arc<Channel>>>,
    looping: AtomicBool,
    quitting: AtomicBool,
    running_pending_tasks: AtomicBool,
    pending_tasks: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Create the loop for the current thread.
    ///
    /// The calling thread becomes the owner: `run`, channel updates, and
    /// handler dispatch are restricted to it from here on.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns an event loop.
    pub fn new() -> io::Result<Arc<Self>> {
        LOOP_IN_THIS_THREAD.with(|slot| {
            if slot.get() != 0 {
                error!(
                    existing = slot.get(),
                    "another event loop already exists in thread {:?}",
                    thread::current().id()
                );
                panic!(
                    "one loop per thread: thread {:?} already owns event loop {}",
                    thread::current().id(),
                    slot.get()
                );
            }
        });

        let poller = poller::new_default_poller()?;
        let wakeup_fd = create_eventfd()?;
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);

        let event_loop = Arc::new(Self {
            id,
            owner_thread: thread::current().id(),
            poller: Mutex::new(poller),
            wakeup_fd,
            wakeup_channel: Mutex::new(None),
            looping: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
            running_pending_tasks: AtomicBool::new(false),
            pending_tasks: Mutex::new(Vec::new()),
        });

        LOOP_IN_THIS_THREAD.with(|slot| slot.set(id));
        debug!(id, "event loop created in {:?}", thread::current().id());

        // The wakeup channel rearms itself by draining the eventfd counter.
        let raw_wakeup = event_loop.wakeup_fd.as_raw_fd();
        let channel = Channel::new(&event_loop, raw_wakeup);
        channel.set_read_handler(move |_| drain_wakeup(raw_wakeup));
        channel.enable_reading();
        *event_loop.wakeup_channel.lock() = Some(channel);

        Ok(event_loop)
    }

    /// Whether the calling thread is the loop's owner.
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.owner_thread
    }

    /// # Panics
    ///
    /// Panics when called off the owner thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            error!(
                id = self.id,
                "event loop touched from foreign thread {:?}",
                thread::current().id()
            );
            panic!(
                "event loop {} owned by {:?} used from {:?}",
                self.id,
                self.owner_thread,
                thread::current().id()
            );
        }
    }

    /// Drive the loop until `quit` is observed. Owner thread only.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        self.quitting.store(false, Ordering::Release);
        debug!(id = self.id, "event loop starts looping");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quitting.load(Ordering::Acquire) {
            active.clear();
            let poll_return_time = self.poller.lock().poll(POLL_TIMEOUT_MS, &mut active);
            for channel in &active {
                channel.handle_event(poll_return_time);
            }
            self.run_pending_tasks();
        }

        debug!(id = self.id, "event loop stops looping");
        self.looping.store(false, Ordering::Release);
    }

    /// Request the loop to exit after its current iteration.
    ///
    /// Callable from any thread. In-flight handlers are not interrupted; a
    /// foreign caller additionally wakes the loop so a blocked poll notices
    /// promptly.
    pub fn quit(&self) {
        self.quitting.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` in the owner thread: immediately when already there,
    /// otherwise via the task queue.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Append `task` to the pending queue for the next iteration.
    ///
    /// Wakes the loop when the caller is foreign, or when the owner is
    /// currently inside the pending-task phase: a task queued from within
    /// a task must not wait out a full poll timeout.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending_tasks.lock().push(Box::new(task));

        if !self.is_in_loop_thread() || self.running_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Interrupt a blocked poll by bumping the eventfd counter.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != 8 {
            error!(id = self.id, "wakeup write returned {n} instead of 8");
        }
        LOOP_WAKEUPS.increment();
    }

    /// Synchronize `channel`'s interest with the poller. Owner thread only.
    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().update_channel(channel);
    }

    /// Remove `channel` from the poller. Owner thread only.
    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.lock().remove_channel(channel);
    }

    /// Whether `channel` is registered with this loop's poller.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.lock().has_channel(channel)
    }

    /// Swap the queue out under the lock, then execute without it, so
    /// producers never wait on a running callback.
    fn run_pending_tasks(&self) {
        self.running_pending_tasks.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.pending_tasks.lock());
        trace!(id = self.id, count = tasks.len(), "running pending tasks");
        for task in tasks {
            task();
        }
        self.running_pending_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Release the one-loop-per-thread slot when the owner thread is the
        // one dropping the loop; a foreign drop means the owner thread has
        // already exited and its slot with it.
        LOOP_IN_THIS_THREAD.with(|slot| {
            if slot.get() == self.id {
                slot.set(0);
            }
        });
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id)
            .field("owner_thread", &self.owner_thread)
            .finish()
    }
}

fn drain_wakeup(fd: RawFd) {
    let mut counter: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            &mut counter as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n != 8 {
        error!("wakeup read returned {n} instead of 8");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn spawn_loop() -> (thread::JoinHandle<()>, Arc<EventLoop>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let io_loop = EventLoop::new().unwrap();
            tx.send(io_loop.clone()).unwrap();
            io_loop.run();
        });
        (handle, rx.recv().unwrap())
    }

    #[test]
    fn test_run_in_loop_executes_synchronously_on_owner() {
        let io_loop = EventLoop::new().unwrap();
        assert!(io_loop.is_in_loop_thread());

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        io_loop.run_in_loop(move || *flag.lock() = true);
        assert!(*ran.lock(), "owner-thread task must run synchronously");
    }

    #[test]
    fn test_queued_tasks_run_once_in_fifo_order() {
        let (handle, io_loop) = spawn_loop();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            io_loop.queue_in_loop(move || seen.lock().push(i));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().len() < 3 {
            assert!(Instant::now() < deadline, "tasks did not run");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2]);

        io_loop.quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_task_queued_from_task_runs_next_iteration() {
        let (handle, io_loop) = spawn_loop();

        let (tx, rx) = mpsc::channel();
        let inner_loop = io_loop.clone();
        io_loop.queue_in_loop(move || {
            let tx = tx.clone();
            inner_loop.queue_in_loop(move || tx.send(()).unwrap());
        });

        // Well under the poll timeout: the inner queue must self-wake.
        rx.recv_timeout(Duration::from_secs(2))
            .expect("nested task was not picked up promptly");

        io_loop.quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_quit_from_foreign_thread_interrupts_poll() {
        let (handle, io_loop) = spawn_loop();

        // Let the loop reach its blocking poll.
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        io_loop.quit();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_second_loop_in_same_thread_panics() {
        let _first = EventLoop::new().unwrap();
        let result = catch_unwind(AssertUnwindSafe(EventLoop::new));
        assert!(result.is_err());
    }

    #[test]
    fn test_loop_slot_released_on_owner_drop() {
        let first = EventLoop::new().unwrap();
        drop(first);
        let second = EventLoop::new().unwrap();
        drop(second);
    }
}
