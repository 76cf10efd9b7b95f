//! Accepts inbound connections on behalf of the server facade.

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::{ACCEPT_ERRORS, CONNECTIONS_ACCEPTED};
use crate::socket::Socket;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

/// Receives each accepted socket together with the peer's address.
pub(crate) type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddrV4) + Send + Sync>;

/// Owns the listening socket and its channel on the main loop.
pub(crate) struct Acceptor {
    io_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
}

impl Acceptor {
    /// Create the listening socket, bind it, and wire the read handler.
    /// Listening itself is deferred to `listen`.
    pub(crate) fn new(
        io_loop: &Arc<EventLoop>,
        listen_addr: SocketAddrV4,
        reuse_port: bool,
    ) -> io::Result<Arc<Self>> {
        let socket = Socket::new_nonblocking()?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(listen_addr)?;

        let channel = Channel::new(io_loop, socket.raw_fd());
        let acceptor = Arc::new(Self {
            io_loop: io_loop.clone(),
            socket,
            channel,
            new_connection_callback: Mutex::new(None),
            listening: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_handler(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.lock() = Some(callback);
    }

    /// The address actually bound, which resolves a port-0 request.
    pub(crate) fn listen_addr(&self) -> io::Result<SocketAddrV4> {
        self.socket.local_addr()
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Start listening and watch the socket for incoming connections.
    /// Runs on the main loop.
    ///
    /// # Panics
    ///
    /// A listen failure is a fatal setup error.
    pub(crate) fn listen(&self) {
        self.io_loop.assert_in_loop_thread();
        if let Err(e) = self.socket.listen() {
            error!(fd = self.socket.raw_fd(), "listen failed: {e}");
            panic!("listen failed: {e}");
        }
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
    }

    fn handle_read(&self) {
        self.io_loop.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((socket, peer_addr)) => {
                CONNECTIONS_ACCEPTED.increment();
                let callback = self.new_connection_callback.lock();
                if let Some(callback) = callback.as_ref() {
                    callback(socket, peer_addr);
                } else {
                    // Nothing can take ownership; drop closes the fd.
                    warn!(peer = %peer_addr, "no new-connection callback installed, closing");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                ACCEPT_ERRORS.increment();
                error!("accept error: {e}");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    error!("file descriptor limit reached, pausing accept");
                    self.pause_reading_for_one_iteration();
                }
            }
        }
    }

    /// Under EMFILE the listening fd stays readable forever; spinning on it
    /// would starve the loop. Drop read interest and rearm only after a
    /// complete loop turn has passed.
    fn pause_reading_for_one_iteration(&self) {
        self.channel.disable_reading();
        let channel = self.channel.clone();
        let io_loop = self.io_loop.clone();
        // Two queue hops: the first runs at the tail of this iteration,
        // the second only after the next poll returns.
        self.io_loop.queue_in_loop(move || {
            let channel = channel.clone();
            io_loop.queue_in_loop(move || channel.enable_reading());
        });
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Deregistration must happen on the owner thread. When the acceptor
        // is dropped elsewhere its loop is being torn down with it, taking
        // the poller registration along.
        if self.io_loop.is_in_loop_thread() {
            self.channel.disable_all();
            self.channel.remove();
        }
    }
}
