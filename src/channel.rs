//! Channel: the poller's unit of work.
//!
//! A channel binds a file descriptor to an interest mask and a set of event
//! handlers. It never owns the descriptor; the owner (acceptor, connection,
//! or the loop's own wakeup fd) creates the channel, installs handlers, and
//! flips interest bits, each of which re-synchronizes the owning loop's
//! poller. The poller writes the observed event mask back onto the channel
//! before the loop dispatches it.

use crate::event_loop::EventLoop;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{trace, warn};

/// No interest.
pub(crate) const EVENT_NONE: u32 = 0;
/// Readable interest: normal plus urgent data.
pub(crate) const EVENT_READ: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
/// Writable interest.
pub(crate) const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;
/// Reported when the peer hung up.
pub(crate) const EVENT_HUP: u32 = libc::EPOLLHUP as u32;
/// Reported on socket error.
pub(crate) const EVENT_ERROR: u32 = libc::EPOLLERR as u32;

/// Where a channel currently stands with its poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    /// Never registered.
    New = 0,
    /// Present in the readiness handle.
    Registered = 1,
    /// Known to the poller but currently removed from the readiness handle.
    Deregistered = 2,
}

impl PollerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Registered,
            2 => Self::Deregistered,
            _ => Self::New,
        }
    }
}

type ReadHandler = Arc<dyn Fn(Instant) + Send + Sync>;
type EventHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
struct Handlers {
    read: Option<ReadHandler>,
    write: Option<EventHandler>,
    close: Option<EventHandler>,
    error: Option<EventHandler>,
}

/// Binding of a file descriptor to interest events and handlers, registered
/// with exactly one loop's poller.
pub struct Channel {
    io_loop: Weak<EventLoop>,
    fd: RawFd,
    events: AtomicU32,
    revents: AtomicU32,
    poller_state: AtomicU8,
    handlers: RwLock<Handlers>,
    /// Liveness guard: upgraded before every dispatch once tied.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    me: Weak<Channel>,
}

impl Channel {
    /// Create a channel over `fd`, owned by `io_loop`.
    ///
    /// The descriptor stays owned by the caller; the channel only watches it.
    pub fn new(io_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            io_loop: Arc::downgrade(io_loop),
            fd,
            events: AtomicU32::new(EVENT_NONE),
            revents: AtomicU32::new(EVENT_NONE),
            poller_state: AtomicU8::new(PollerState::New as u8),
            handlers: RwLock::new(Handlers::default()),
            tie: Mutex::new(None),
            me: me.clone(),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn events(&self) -> u32 {
        self.events.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.events() == EVENT_NONE
    }

    /// True while write interest is registered.
    #[inline]
    pub fn is_writing(&self) -> bool {
        self.events() & EVENT_WRITE != 0
    }

    /// True while read interest is registered.
    #[inline]
    pub fn is_reading(&self) -> bool {
        self.events() & EVENT_READ != 0
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        PollerState::from_u8(self.poller_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.poller_state.store(state as u8, Ordering::Release);
    }

    pub fn set_read_handler(&self, handler: impl Fn(Instant) + Send + Sync + 'static) {
        self.handlers.write().read = Some(Arc::new(handler));
    }

    pub fn set_write_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.handlers.write().write = Some(Arc::new(handler));
    }

    pub fn set_close_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.handlers.write().close = Some(Arc::new(handler));
    }

    pub fn set_error_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.handlers.write().error = Some(Arc::new(handler));
    }

    /// Install a weak observer of the channel's logical owner.
    ///
    /// Once tied, every dispatch first upgrades the observer; when the owner
    /// is gone the dispatch is skipped entirely.
    pub fn tie<T: Send + Sync + 'static>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&owner);
        *self.tie.lock() = Some(weak);
    }

    pub fn enable_reading(&self) {
        self.events.fetch_or(EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.events.fetch_and(!EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.events.fetch_or(EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.events.fetch_and(!EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.store(EVENT_NONE, Ordering::Release);
        self.update();
    }

    /// Synchronize the current interest mask with the owning loop's poller.
    fn update(&self) {
        match (self.io_loop.upgrade(), self.me.upgrade()) {
            (Some(io_loop), Some(me)) => io_loop.update_channel(&me),
            _ => warn!(fd = self.fd, "channel update after its loop was dropped"),
        }
    }

    /// Deregister from the poller entirely. The owner must call this before
    /// dropping the channel.
    pub fn remove(&self) {
        debug_assert!(self.is_none_event());
        match (self.io_loop.upgrade(), self.me.upgrade()) {
            (Some(io_loop), Some(me)) => io_loop.remove_channel(&me),
            _ => warn!(fd = self.fd, "channel remove after its loop was dropped"),
        }
    }

    /// Set the interest mask directly, bypassing poller synchronization.
    #[cfg(test)]
    pub(crate) fn force_events(&self, events: u32) {
        self.events.store(events, Ordering::Release);
    }

    /// Dispatch the events last reported by the poller.
    ///
    /// Handlers run in a fixed order: close (hang-up without readable data),
    /// error, read, write. Each runs only if its bit is set and a handler is
    /// installed.
    pub(crate) fn handle_event(&self, now: Instant) {
        let mut _guard: Option<Arc<dyn Any + Send + Sync>> = None;
        if let Some(weak) = self.tie.lock().clone() {
            match weak.upgrade() {
                Some(owner) => _guard = Some(owner),
                // The owner has been destroyed; its handlers must not run.
                None => return,
            }
        }

        let revents = self.revents.load(Ordering::Acquire);
        trace!(fd = self.fd, revents, "channel dispatch");

        // Clone the handler set out so no lock is held across a callback.
        let handlers = self.handlers.read().clone();

        if revents & EVENT_HUP != 0 && revents & libc::EPOLLIN as u32 == 0 {
            if let Some(close) = &handlers.close {
                close();
            }
        }
        if revents & EVENT_ERROR != 0 {
            if let Some(error) = &handlers.error {
                error();
            }
        }
        if revents & EVENT_READ != 0 {
            if let Some(read) = &handlers.read {
                read(now);
            }
        }
        if revents & EVENT_WRITE != 0 {
            if let Some(write) = &handlers.write {
                write();
            }
        }
    }
}
