//! Epoll-backed readiness poller.
//!
//! The default backend. Registrations carry the raw fd in the epoll user
//! data; ready events are resolved back to channels through the poller's
//! fd map. The map holds only weak references: the channel's owner, not
//! the poller, controls its lifetime.

use super::Poller;
use crate::channel::{Channel, PollerState};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{error, trace};

/// Initial size of the ready-event array; grown geometrically when filled.
const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    fn fill_active(&self, num_events: usize, active: &mut Vec<Arc<Channel>>) {
        for ev in &self.events[..num_events] {
            let revents = ev.events;
            let fd = ev.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd).and_then(Weak::upgrade) {
                channel.set_revents(revents);
                active.push(channel);
            }
        }
    }

    fn update(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut ev = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut ev) } < 0 {
            let e = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd, "epoll_ctl DEL error: {e}");
            } else {
                error!(fd, "epoll_ctl ADD/MOD error: {e}");
                panic!("epoll_ctl failed for fd {fd}: {e}");
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        trace!(total = self.channels.len(), "epoll_wait");

        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Instant::now();

        if num_events > 0 {
            trace!(num_events, "events ready");
            self.fill_active(num_events as usize, active);
            if num_events as usize == self.events.len() {
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if num_events == 0 {
            trace!("epoll_wait timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("epoll_wait error: {saved}");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.poller_state();
        trace!(fd = channel.fd(), events = channel.events(), ?state, "update channel");

        match state {
            PollerState::New | PollerState::Deregistered => {
                if state == PollerState::New {
                    self.channels.insert(channel.fd(), Arc::downgrade(channel));
                }
                channel.set_poller_state(PollerState::Registered);
                self.update(libc::EPOLL_CTL_ADD, channel);
            }
            PollerState::Registered => {
                if channel.is_none_event() {
                    self.update(libc::EPOLL_CTL_DEL, channel);
                    channel.set_poller_state(PollerState::Deregistered);
                } else {
                    self.update(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        trace!(fd = channel.fd(), "remove channel");
        debug_assert!(self.has_channel(channel));
        self.channels.remove(&channel.fd());
        if channel.poller_state() == PollerState::Registered {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_poller_state(PollerState::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), channel))
    }
}
