//! poll(2)-backed readiness poller.
//!
//! The level-triggered fallback, selected by setting `LOOMIO_USE_POLL` in
//! the environment. Keeps a dense pollfd array; deregistration swap-removes
//! and patches the index of the element that moved.

use super::Poller;
use crate::channel::{Channel, EVENT_ERROR, EVENT_HUP, PollerState};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{error, trace, warn};

struct PollEntry {
    channel: Weak<Channel>,
    /// Position in `pollfds` while registered; unused otherwise.
    index: usize,
}

pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, PollEntry>,
}

fn to_poll_events(events: u32) -> libc::c_short {
    let mut out = 0;
    if events & libc::EPOLLIN as u32 != 0 {
        out |= libc::POLLIN;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        out |= libc::POLLPRI;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        out |= libc::POLLOUT;
    }
    out
}

fn from_poll_revents(revents: libc::c_short) -> u32 {
    let mut out = 0;
    if revents & libc::POLLIN != 0 {
        out |= libc::EPOLLIN as u32;
    }
    if revents & libc::POLLPRI != 0 {
        out |= libc::EPOLLPRI as u32;
    }
    if revents & libc::POLLOUT != 0 {
        out |= libc::EPOLLOUT as u32;
    }
    if revents & libc::POLLHUP != 0 {
        out |= EVENT_HUP;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        out |= EVENT_ERROR;
    }
    out
}

impl PollPoller {
    pub(crate) fn new() -> Self {
        Self {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    /// Swap-remove the pollfd at `index`, repointing whichever entry the
    /// swap moved into its place.
    fn remove_pollfd(&mut self, index: usize) {
        self.pollfds.swap_remove(index);
        if index < self.pollfds.len() {
            let moved_fd = self.pollfds[index].fd;
            if let Some(entry) = self.channels.get_mut(&moved_fd) {
                entry.index = index;
            }
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        trace!(total = self.channels.len(), "poll");

        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Instant::now();

        if num_events > 0 {
            trace!(num_events, "events ready");
            let mut remaining = num_events as usize;
            for pfd in &self.pollfds {
                if remaining == 0 {
                    break;
                }
                if pfd.revents == 0 {
                    continue;
                }
                remaining -= 1;
                if pfd.revents & libc::POLLNVAL != 0 {
                    warn!(fd = pfd.fd, "poll reported POLLNVAL");
                }
                if let Some(channel) = self
                    .channels
                    .get(&pfd.fd)
                    .and_then(|entry| entry.channel.upgrade())
                {
                    channel.set_revents(from_poll_revents(pfd.revents));
                    active.push(channel);
                }
            }
        } else if num_events == 0 {
            trace!("poll timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("poll error: {saved}");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.poller_state();
        let fd = channel.fd();
        trace!(fd, events = channel.events(), ?state, "update channel");

        match state {
            PollerState::New | PollerState::Deregistered => {
                self.pollfds.push(libc::pollfd {
                    fd,
                    events: to_poll_events(channel.events()),
                    revents: 0,
                });
                let index = self.pollfds.len() - 1;
                self.channels.insert(
                    fd,
                    PollEntry {
                        channel: Arc::downgrade(channel),
                        index,
                    },
                );
                channel.set_poller_state(PollerState::Registered);
            }
            PollerState::Registered => {
                let index = match self.channels.get(&fd) {
                    Some(entry) => entry.index,
                    None => {
                        error!(fd, "registered channel missing from poll map");
                        return;
                    }
                };
                if channel.is_none_event() {
                    self.remove_pollfd(index);
                    channel.set_poller_state(PollerState::Deregistered);
                } else {
                    self.pollfds[index].events = to_poll_events(channel.events());
                    self.pollfds[index].revents = 0;
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        trace!(fd = channel.fd(), "remove channel");
        debug_assert!(self.has_channel(channel));
        if let Some(entry) = self.channels.remove(&channel.fd()) {
            if channel.poller_state() == PollerState::Registered {
                self.remove_pollfd(entry.index);
            }
        }
        channel.set_poller_state(PollerState::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|entry| std::ptr::eq(entry.channel.as_ptr(), channel))
    }
}
