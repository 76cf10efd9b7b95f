//! Multi-reactor TCP networking.
//!
//! One event loop per thread: a main loop accepts connections and deals
//! each one out, round-robin, to a pool of subordinate loops. A connection
//! then lives entirely on its assigned loop, where all of its reads,
//! writes, and state changes happen, so per-connection state needs no
//! locking. Cross-thread work (a `send` from elsewhere, `quit`) is
//! marshalled in through a task queue and an eventfd wakeup.
//!
//! Applications supply connection-lifecycle, message, and write-complete
//! callbacks and never touch the multiplexing machinery:
//!
//! ```no_run
//! use loomio::{EventLoop, Server};
//!
//! let main_loop = EventLoop::new().unwrap();
//! let server = Server::new(&main_loop, "0.0.0.0:9999".parse().unwrap(), "echo", false).unwrap();
//! server.set_io_threads(4);
//! server.set_message_callback(|conn, buffer, _receive_time| {
//!     let data = buffer.retrieve_all_as_bytes();
//!     conn.send(&data);
//! });
//! server.start();
//! main_loop.run();
//! ```

mod acceptor;
mod buffer;
mod channel;
pub mod config;
mod connection;
mod event_loop;
pub mod logging;
mod loop_thread;
pub mod metrics;
mod poller;
mod server;
mod socket;
mod thread_pool;

pub use buffer::Buffer;
pub use channel::Channel;
pub use config::Config;
pub use connection::{
    Connection, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
pub use event_loop::{EventLoop, Task};
pub use loop_thread::{EventLoopThread, ThreadInitCallback};
pub use poller::USE_POLL_ENV;
pub use server::Server;
pub use socket::Socket;
pub use thread_pool::EventLoopThreadPool;
