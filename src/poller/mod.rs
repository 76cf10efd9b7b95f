//! Readiness pollers.
//!
//! The event loop depends on a small capability set: block until readiness,
//! register/modify/deregister a channel's interest, and answer membership
//! queries. Two backends implement it: an epoll-backed poller (the default,
//! capable of edge-triggered operation) and a poll(2)-backed level-triggered
//! poller. The `LOOMIO_USE_POLL` environment variable selects the latter.

mod epoll;
mod poll;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

use crate::channel::Channel;
use std::io;
use std::sync::Arc;
use std::time::Instant;

/// Environment variable that selects the level-triggered poll(2) backend.
pub const USE_POLL_ENV: &str = "LOOMIO_USE_POLL";

/// Capability set the event loop requires from its readiness backend.
///
/// All methods run on the owning loop's thread only.
pub(crate) trait Poller: Send {
    /// Block up to `timeout_ms` and append the ready channels to `active`,
    /// after writing each one's observed event mask onto it. Returns the
    /// time captured right after the wait returned, whatever the outcome.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Register, modify, or deregister `channel` according to its state tag
    /// and current interest mask.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Forget `channel` entirely and reset its state tag to new.
    fn remove_channel(&mut self, channel: &Channel);

    /// Whether `channel` is known to this poller.
    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Build the poller selected by the environment.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller + Send>> {
    if std::env::var_os(USE_POLL_ENV).is_some() {
        Ok(Box::new(PollPoller::new()))
    } else {
        Ok(Box::new(EpollPoller::new()?))
    }
}
