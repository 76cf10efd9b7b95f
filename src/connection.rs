//! Per-connection state machine and I/O.
//!
//! A connection owns the accepted socket, its channel, and an input/output
//! buffer pair, and is pinned to one subordinate loop from creation to
//! destruction. `send` and `shutdown` are callable from any thread; they
//! marshal themselves onto the owning loop. Everything else runs in that
//! loop's thread only.
//!
//! Connections are handed around as `Arc<Connection>`. Channel handlers
//! capture a `Weak` and upgrade it at dispatch time, so every in-flight
//! handler holds a strong reference for exactly the duration of the
//! dispatch, and a destroyed connection's events are silently skipped.

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE};
use crate::socket::Socket;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Fired on connection establishment and teardown; `connected()` tells the
/// two apart.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Fired on every successful non-empty read.
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut Buffer, Instant) + Send + Sync>;
/// Fired when the output buffer fully drains after a send, and after any
/// fully-consumed direct send.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Fired when a send pushes the output buffer past the high-water mark from
/// below; the second argument is the buffered byte total.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<Connection>, usize) + Send + Sync>;
/// Installed by the server to unregister the connection.
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Clone, Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// An accepted TCP connection bound to one event loop.
pub struct Connection {
    io_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddrV4,
    peer_addr: SocketAddrV4,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: RwLock<Callbacks>,
    me: Weak<Connection>,
}

impl Connection {
    /// Wrap an accepted socket. The connection starts in the connecting
    /// state; the server schedules `establish` onto `io_loop` to activate
    /// it.
    pub(crate) fn new(
        io_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddrV4,
        peer_addr: SocketAddrV4,
    ) -> Arc<Self> {
        if let Err(e) = socket.set_keep_alive(true) {
            warn!(name = %name, "failed to enable keepalive: {e}");
        }
        let channel = Channel::new(&io_loop, socket.raw_fd());
        debug!(name = %name, fd = socket.raw_fd(), "connection created");

        Arc::new_cyclic(|me| Self {
            io_loop,
            name,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: RwLock::new(Callbacks::default()),
            me: me.clone(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.peer_addr
    }

    /// The loop this connection is pinned to.
    #[inline]
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.io_loop
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    #[inline]
    pub fn disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = self.socket.set_tcp_nodelay(on) {
            warn!(name = %self.name, "failed to set TCP_NODELAY: {e}");
        }
    }

    pub(crate) fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.write().connection = Some(callback);
    }

    pub(crate) fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.write().message = Some(callback);
    }

    pub(crate) fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.write().write_complete = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        self.callbacks.write().close = Some(callback);
    }

    /// Install the back-pressure callback and its threshold in bytes.
    ///
    /// The callback fires when a send moves the output buffer's length from
    /// below `mark` to at or above it.
    pub fn set_high_water_mark_callback(
        &self,
        callback: impl Fn(&Arc<Connection>, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.high_water_mark.store(mark, Ordering::Release);
        self.callbacks.write().high_water_mark = Some(Arc::new(callback));
    }

    /// Send by copy. Thread-safe; a foreign caller's payload is copied into
    /// a task on the owning loop. Dropped with a log line unless connected.
    pub fn send(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.state() != ConnectionState::Connected {
            warn!(
                name = %self.name,
                "send on a connection that is not connected, dropping {} bytes",
                data.len()
            );
            return;
        }
        if self.io_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let weak = self.me.clone();
            let data = data.to_vec();
            self.io_loop.run_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.send_in_loop(&data);
                }
            });
        }
    }

    /// Send by move: the payload is surrendered to the owning loop without
    /// another copy.
    pub fn send_owned(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if self.state() != ConnectionState::Connected {
            warn!(
                name = %self.name,
                "send on a connection that is not connected, dropping {} bytes",
                data.len()
            );
            return;
        }
        if self.io_loop.is_in_loop_thread() {
            self.send_in_loop(&data);
        } else {
            let weak = self.me.clone();
            self.io_loop.run_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.send_in_loop(&data);
                }
            });
        }
    }

    /// Half-close the write side once buffered output has drained.
    /// Thread-safe.
    pub fn shutdown(&self) {
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnecting);
            let weak = self.me.clone();
            self.io_loop.run_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.shutdown_in_loop();
                }
            });
        }
    }

    fn shutdown_in_loop(&self) {
        self.io_loop.assert_in_loop_thread();
        // Still write-interested means the output buffer has not drained;
        // handle_write performs the half-close once it has.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.io_loop.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            error!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;
        let mut output = self.output_buffer.lock();

        // Nothing queued and no write interest: try the direct write and
        // skip the copy into the output buffer entirely.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    BYTES_SENT.add(n as u64);
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        if let Some(callback) = self.callbacks.read().write_complete.clone() {
                            if let Some(conn) = self.me.upgrade() {
                                self.io_loop.queue_in_loop(move || callback(&conn));
                            }
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!(name = %self.name, "send_in_loop write error: {e}");
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= mark && old_len < mark {
                if let Some(callback) = self.callbacks.read().high_water_mark.clone() {
                    if let Some(conn) = self.me.upgrade() {
                        let total = old_len + remaining;
                        self.io_loop.queue_in_loop(move || callback(&conn, total));
                    }
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Activate the connection on its owning loop: tie the channel, start
    /// reading, and announce establishment.
    pub(crate) fn establish(self: Arc<Self>) {
        self.io_loop.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);

        let weak = Arc::downgrade(&self);
        self.channel.set_read_handler({
            let weak = weak.clone();
            move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            }
        });
        self.channel.set_write_handler({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        });
        self.channel.set_close_handler({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        });
        self.channel.set_error_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        self.channel.tie(&self);
        self.channel.enable_reading();

        CONNECTIONS_ACTIVE.increment();
        info!(
            name = %self.name,
            peer = %self.peer_addr,
            local = %self.local_addr,
            "connection up"
        );
        if let Some(callback) = self.callbacks.read().connection.clone() {
            callback(&self);
        }
    }

    /// Final teardown, scheduled by the server after the registry entry is
    /// gone. Fires the teardown notification when the close path has not
    /// already done so, then removes the channel from the poller.
    pub(crate) fn destroy(self: Arc<Self>) {
        self.io_loop.assert_in_loop_thread();
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            CONNECTIONS_ACTIVE.decrement();
            info!(name = %self.name, "connection down");
            if let Some(callback) = self.callbacks.read().connection.clone() {
                callback(&self);
            }
        }
        self.channel.remove();
        debug!(name = %self.name, "connection destroyed");
    }

    fn handle_read(self: Arc<Self>, receive_time: Instant) {
        self.io_loop.assert_in_loop_thread();
        let mut input = self.input_buffer.lock();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                let message = self.callbacks.read().message.clone();
                if let Some(callback) = message {
                    callback(&self, &mut input, receive_time);
                } else {
                    // No consumer installed; discard so the buffer cannot
                    // grow without bound.
                    trace!(name = %self.name, "discarding {n} bytes, no message callback");
                    input.retrieve_all();
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                // Zero progress; the next readiness notification retries.
            }
            Err(e) => {
                drop(input);
                error!(name = %self.name, "read error: {e}");
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(self: Arc<Self>) {
        self.io_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(name = %self.name, "write interest already cleared, skipping");
            return;
        }

        let mut output = self.output_buffer.lock();
        match output.write_fd(self.channel.fd()) {
            Ok(n) => {
                BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    // Write interest must go away with the empty buffer or
                    // the loop spins on a permanently-writable socket.
                    self.channel.disable_writing();
                    if let Some(callback) = self.callbacks.read().write_complete.clone() {
                        let conn = self.clone();
                        self.io_loop.queue_in_loop(move || callback(&conn));
                    }
                    if self.state() == ConnectionState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!(name = %self.name, "handle_write error: {e}");
            }
        }
    }

    fn handle_close(self: Arc<Self>) {
        self.io_loop.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        trace!(name = %self.name, state = ?self.state(), "handle_close");
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();
        CONNECTIONS_ACTIVE.decrement();
        info!(name = %self.name, "connection down");

        let callbacks = self.callbacks.read().clone();
        if let Some(callback) = &callbacks.connection {
            callback(&self);
        }
        if let Some(callback) = &callbacks.close {
            callback(&self);
        }
    }

    fn handle_error(&self) {
        let err = self.socket.take_error();
        error!(
            name = %self.name,
            "SO_ERROR = {err} ({})",
            io::Error::from_raw_os_error(err)
        );
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("peer", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
    use std::os::unix::io::OwnedFd;

    fn tcp_pair() -> (Socket, SocketAddrV4, SocketAddrV4, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        let local = match server_side.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            other => panic!("unexpected family: {other}"),
        };
        let peer = match server_side.peer_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            other => panic!("unexpected family: {other}"),
        };
        (
            Socket::from_owned(OwnedFd::from(server_side)),
            local,
            peer,
            client,
        )
    }

    #[test]
    fn test_establish_then_destroy_lifecycle() {
        let io_loop = EventLoop::new().unwrap();
        let (socket, local, peer, _client) = tcp_pair();
        let conn = Connection::new(io_loop.clone(), "test-conn#1".into(), socket, local, peer);

        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.connected());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        conn.set_connection_callback(Arc::new(move |c: &Arc<Connection>| {
            sink.lock().push(c.connected());
        }));

        conn.clone().establish();
        assert!(conn.connected());
        // While connected, read interest stays enabled.
        assert!(conn.channel.is_reading());
        assert!(io_loop.has_channel(&conn.channel));

        conn.clone().destroy();
        assert!(conn.disconnected());
        assert!(!io_loop.has_channel(&conn.channel));

        // Up once with connected() true, down once with connected() false.
        assert_eq!(*events.lock(), vec![true, false]);
    }

    #[test]
    fn test_send_on_unestablished_connection_drops() {
        let io_loop = EventLoop::new().unwrap();
        let (socket, local, peer, client) = tcp_pair();
        let conn = Connection::new(io_loop, "test-conn#2".into(), socket, local, peer);

        conn.send(b"dropped");

        drop(conn);
        client.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 16];
        use std::io::Read;
        let mut client = client;
        // The connection never wrote anything; the socket just closes.
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_direct_send_reaches_peer() {
        let io_loop = EventLoop::new().unwrap();
        let (socket, local, peer, mut client) = tcp_pair();
        let conn = Connection::new(io_loop, "test-conn#3".into(), socket, local, peer);
        conn.clone().establish();

        conn.send(b"hello");
        let mut buf = [0u8; 5];
        use std::io::Read;
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Zero-length sends are no-ops.
        conn.send(b"");
        conn.clone().destroy();
        assert_eq!(Ipv4Addr::LOCALHOST, *conn.local_addr().ip());
    }
}
