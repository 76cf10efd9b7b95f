//! Server facade: wires the acceptor, the loop-thread pool, and the
//! connection registry together.

use crate::acceptor::Acceptor;
use crate::connection::{
    Connection, ConnectionCallback, MessageCallback, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::loop_thread::ThreadInitCallback;
use crate::socket::Socket;
use crate::thread_pool::EventLoopThreadPool;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{error, info};

/// A multi-reactor TCP server.
///
/// The acceptor runs on the main loop passed to `new`; each accepted
/// connection is pinned round-robin to one of the pool's subordinate loops
/// (or to the main loop itself when the pool is empty).
///
/// # Example
///
/// ```no_run
/// use loomio::{EventLoop, Server};
///
/// let main_loop = EventLoop::new().unwrap();
/// let server = Server::new(
///     &main_loop,
///     "127.0.0.1:9999".parse().unwrap(),
///     "echo",
///     false,
/// )
/// .unwrap();
/// server.set_io_threads(4);
/// server.set_message_callback(|conn, buffer, _time| {
///     let data = buffer.retrieve_all_as_bytes();
///     conn.send(&data);
/// });
/// server.start();
/// main_loop.run();
/// ```
pub struct Server {
    io_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    listen_addr: SocketAddrV4,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    connection_callback: RwLock<Option<ConnectionCallback>>,
    message_callback: RwLock<Option<MessageCallback>>,
    write_complete_callback: RwLock<Option<WriteCompleteCallback>>,
    thread_init_callback: RwLock<Option<ThreadInitCallback>>,
    started: AtomicUsize,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    me: Weak<Server>,
}

impl Server {
    /// Bind `listen_addr` and assemble the server around `io_loop`, which
    /// becomes the main (accepting) loop. Listening starts with `start`.
    pub fn new(
        io_loop: &Arc<EventLoop>,
        listen_addr: SocketAddrV4,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<Arc<Self>> {
        let name = name.into();
        let acceptor = Acceptor::new(io_loop, listen_addr, reuse_port)?;
        // Resolves a port-0 request to the port actually assigned.
        let bound_addr = acceptor.listen_addr()?;

        let pool = EventLoopThreadPool::new(io_loop.clone(), name.clone());
        let server = Arc::new_cyclic(|me| Self {
            io_loop: io_loop.clone(),
            ip_port: bound_addr.to_string(),
            listen_addr: bound_addr,
            name,
            acceptor,
            pool: Mutex::new(pool),
            connection_callback: RwLock::new(None),
            message_callback: RwLock::new(None),
            write_complete_callback: RwLock::new(None),
            thread_init_callback: RwLock::new(None),
            started: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            me: me.clone(),
        });

        let weak = server.me.clone();
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            }));
        Ok(server)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address the listening socket is bound to.
    #[inline]
    pub fn listen_addr(&self) -> SocketAddrV4 {
        self.listen_addr
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Number of subordinate I/O loops. Zero means every connection shares
    /// the main loop. Must be called before `start`.
    pub fn set_io_threads(&self, num_threads: usize) {
        self.pool.lock().set_num_threads(num_threads);
    }

    pub fn set_connection_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.connection_callback.write() = Some(Arc::new(callback));
    }

    pub fn set_message_callback(
        &self,
        callback: impl Fn(&Arc<Connection>, &mut crate::Buffer, Instant) + Send + Sync + 'static,
    ) {
        *self.message_callback.write() = Some(Arc::new(callback));
    }

    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.write_complete_callback.write() = Some(Arc::new(callback));
    }

    /// Invoked once on each subordinate loop as its thread starts.
    pub fn set_thread_init_callback(
        &self,
        callback: impl Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    ) {
        *self.thread_init_callback.write() = Some(Arc::new(callback));
    }

    /// Start the pool and schedule the acceptor's listen onto the main
    /// loop. Idempotent: only the first call does anything.
    pub fn start(&self) {
        if self.started.fetch_add(1, Ordering::SeqCst) == 0 {
            info!(server = %self.name, addr = %self.ip_port, "starting");
            let init = self.thread_init_callback.read().clone();
            self.pool.lock().start(init);

            let acceptor = self.acceptor.clone();
            self.io_loop.run_in_loop(move || acceptor.listen());
        }
    }

    /// Runs on the main loop for every accepted connection.
    fn new_connection(&self, socket: Socket, peer_addr: SocketAddrV4) {
        self.io_loop.assert_in_loop_thread();

        let io_loop = self.pool.lock().next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        info!(
            server = %self.name,
            conn = %conn_name,
            peer = %peer_addr,
            "new connection"
        );

        let local_addr = socket.local_addr().unwrap_or_else(|e| {
            error!("getsockname failed: {e}");
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
        });

        let conn = Connection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        self.connections.lock().insert(conn_name, conn.clone());

        if let Some(callback) = self.connection_callback.read().clone() {
            conn.set_connection_callback(callback);
        }
        if let Some(callback) = self.message_callback.read().clone() {
            conn.set_message_callback(callback);
        }
        if let Some(callback) = self.write_complete_callback.read().clone() {
            conn.set_write_complete_callback(callback);
        }

        let weak = self.me.clone();
        conn.set_close_callback(Arc::new(move |conn: &Arc<Connection>| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        io_loop.run_in_loop(move || conn.establish());
    }

    /// The connection's close callback; may fire on any subordinate loop,
    /// so hop to the main loop before touching the registry.
    fn remove_connection(&self, conn: &Arc<Connection>) {
        let weak = self.me.clone();
        let conn = conn.clone();
        self.io_loop.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: Arc<Connection>) {
        self.io_loop.assert_in_loop_thread();
        info!(server = %self.name, conn = %conn.name(), "removing connection");
        self.connections.lock().remove(conn.name());

        let io_loop = conn.owner_loop().clone();
        // Queued, not run inline: the handler that triggered the close may
        // still be executing on that loop.
        io_loop.queue_in_loop(move || conn.destroy());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_is_idempotent() {
        let main_loop = EventLoop::new().unwrap();
        let server = Server::new(
            &main_loop,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            "test",
            false,
        )
        .unwrap();

        // The caller owns the main loop, so listen() runs synchronously.
        server.start();
        assert!(server.acceptor.listening());

        // Re-entrant calls are no-ops; a second pool start would panic.
        server.start();
        server.start();
        assert_eq!(server.started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_listen_addr_resolves_port_zero() {
        let main_loop = EventLoop::new().unwrap();
        let server = Server::new(
            &main_loop,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            "test",
            false,
        )
        .unwrap();
        assert_ne!(server.listen_addr().port(), 0);
        assert_eq!(server.connection_count(), 0);
    }
}
