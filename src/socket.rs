//! RAII socket ownership and option plumbing.
//!
//! Wraps an `OwnedFd` so every socket is closed exactly when its owner goes
//! away. Socket creation and the portable options go through `socket2`;
//! `SO_REUSEPORT`, `accept4`, and `SO_ERROR` drop to `libc` where the std
//! surface stops.

use socket2::{Domain, Protocol, SockRef, Type};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::error;

/// Listen backlog used by every listening socket.
pub const LISTEN_BACKLOG: i32 = 1024;

/// An owned socket file descriptor.
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Create a non-blocking, close-on-exec IPv4 TCP socket.
    ///
    /// `socket2::Socket::new` opens the descriptor with `SOCK_CLOEXEC`.
    pub fn new_nonblocking() -> io::Result<Self> {
        let socket = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        Ok(Self { fd: socket.into() })
    }

    /// Wrap an already-connected descriptor.
    pub(crate) fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Bind to a local IPv4 endpoint.
    pub fn bind(&self, addr: SocketAddrV4) -> io::Result<()> {
        SockRef::from(&self.fd).bind(&SocketAddr::V4(addr).into())
    }

    /// Put the socket into listening mode with the standard backlog.
    pub fn listen(&self) -> io::Result<()> {
        SockRef::from(&self.fd).listen(LISTEN_BACKLOG)
    }

    /// Accept one pending connection.
    ///
    /// Uses `accept4` so the returned descriptor is non-blocking and
    /// close-on-exec atomically, without a follow-up `fcntl`.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddrV4)> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let socket = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        Ok((socket, sockaddr_in_to_v4(&addr)))
    }

    /// Close the write half, leaving the read half open.
    pub fn shutdown_write(&self) {
        if let Err(e) = SockRef::from(&self.fd).shutdown(std::net::Shutdown::Write) {
            error!(fd = self.raw_fd(), "shutdown_write error: {e}");
        }
    }

    /// Local address the socket is bound to, via getsockname.
    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        let addr = SockRef::from(&self.fd).local_addr()?;
        match addr.as_socket() {
            Some(SocketAddr::V4(v4)) => Ok(v4),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "socket is not bound to an IPv4 address",
            )),
        }
    }

    /// Single `write` of `data`, returning the kernel's count.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Pending asynchronous error, via `getsockopt(SO_ERROR)`.
    ///
    /// Returns the errno value; reading it clears the pending error. When
    /// the getsockopt itself fails, its errno is reported instead.
    pub fn take_error(&self) -> i32 {
        let mut optval: libc::c_int = 0;
        let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut optval as *mut libc::c_int as *mut libc::c_void,
                &mut optlen,
            )
        };
        if rc < 0 {
            io::Error::last_os_error().raw_os_error().unwrap_or(0)
        } else {
            optval
        }
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_reuse_address(on)
    }

    /// Enable `SO_REUSEPORT` so several listeners can share one port.
    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        let optval: libc::c_int = if on { 1 } else { 0 };
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_keepalive(on)
    }

    /// Disable Nagle's algorithm for latency-sensitive traffic.
    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_nodelay(on)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("fd", &self.raw_fd()).finish()
    }
}

/// Convert a kernel `sockaddr_in` into the std address value.
pub(crate) fn sockaddr_in_to_v4(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    )
}
