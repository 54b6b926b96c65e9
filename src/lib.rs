//! Connection management for a hostname-routed TCP proxy.
//!
//! Each accepted client is driven through a small state machine: the first
//! bytes it sends are peeked (never consumed) and handed to the listener's
//! parser, which extracts a routing hostname from a TLS ClientHello SNI
//! extension or an HTTP Host header. The listener resolves the hostname to a
//! connected upstream socket and from then on bytes are relayed in both
//! directions until either peer closes. A close on one side half-closes the
//! connection: bytes already buffered for the other side keep draining before
//! the record is torn down.
//!
//! The crate is the inner loop only. The embedder owns the listening sockets,
//! the hostname parser, the upstream lookup, and the blocking
//! `select`/`poll` call; it implements [`Listener`] and drives a
//! [`ConnectionList`] like this:
//!
//! ```no_run
//! use std::io;
//! use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
//! use std::rc::Rc;
//!
//! use nix::sys::select::{select, FdSet};
//! use nix::sys::time::TimeVal;
//!
//! use snirelay::{Config, ConnectionList, Listener, ParseOutcome, Readiness};
//!
//! /// Routes on the SNI extension of a TLS ClientHello.
//! #[derive(Debug)]
//! struct SniListener {
//!     sock: std::net::TcpListener,
//! }
//!
//! impl Listener for SniListener {
//!     fn socket(&self) -> BorrowedFd<'_> {
//!         self.sock.as_fd()
//!     }
//!
//!     fn parse_packet(&self, _data: &[u8]) -> ParseOutcome {
//!         // a real implementation parses the ClientHello here
//!         ParseOutcome::Hostname("svc.example".to_string())
//!     }
//!
//!     fn lookup_server_socket(&self, hostname: &str) -> io::Result<OwnedFd> {
//!         let upstream = std::net::TcpStream::connect((hostname, 443))?;
//!         upstream.set_nonblocking(true)?;
//!         Ok(upstream.into())
//!     }
//! }
//!
//! fn main() -> nix::Result<()> {
//!     let sock = std::net::TcpListener::bind("0.0.0.0:443").unwrap();
//!     let listener: Rc<dyn Listener> = Rc::new(SniListener { sock });
//!     let mut connections = ConnectionList::new(Config::default());
//!
//!     loop {
//!         let (ready, accept) = {
//!             let mut rfds = FdSet::new();
//!             let mut wfds = FdSet::new();
//!             let lfd = listener.socket();
//!             rfds.insert(&lfd);
//!             let max = connections.fd_set_connections(&mut rfds, &mut wfds, lfd.as_raw_fd());
//!             select(max + 1, &mut rfds, &mut wfds, None::<&mut FdSet>, None::<&mut TimeVal>)?;
//!             (Readiness::capture(&rfds, &wfds), rfds.contains(&lfd))
//!         };
//!
//!         if accept {
//!             connections.accept_connection(&listener);
//!         }
//!         connections.handle_connections(&ready);
//!     }
//! }
//! ```
//!
//! Logging goes through the [`log`] facade; the crate never installs a
//! logger. Errors that affect a single connection are contained to that
//! connection (and at most one of its two sockets) and logged, never
//! propagated out of the dispatch loop.

use std::os::fd::RawFd;

mod buffer;
mod connection;
mod list;
mod listener;
mod sockaddr;
mod states;

pub use buffer::Buffer;
pub use connection::{Connection, StateKind};
pub use list::{ConnectionList, Readiness};
pub use listener::{Listener, ParseOutcome};
pub use sockaddr::peer_address;

/// Default per-direction buffer size for each connection, in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// How many of the client's first bytes are offered to the hostname parser:
/// one TCP maximum segment size on standard Ethernet and IPv4.
pub(crate) const CLIENT_HELLO_PEEK: usize = 1460;

// the parser must be able to see a full initial segment in one peek
static_assertions::const_assert!(CLIENT_HELLO_PEEK <= DEFAULT_BUFFER_CAPACITY);

// a cloned connection would alias its file descriptors across two records
static_assertions::assert_not_impl_any!(Connection: Clone);

bitflags::bitflags! {
    /// The directions a connection wants watched. Received client bytes land
    /// in the client-side buffer and are transmitted on the server socket,
    /// and symmetrically for the server side.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        /// Watch the client socket for readability.
        const CLIENT_RECV = 1 << 0;
        /// Watch the client socket for writability.
        const CLIENT_SEND = 1 << 1;
        /// Watch the server socket for readability.
        const SERVER_RECV = 1 << 2;
        /// Watch the server socket for writability.
        const SERVER_SEND = 1 << 3;
    }
}

/// Knobs for a [`ConnectionList`].
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    pub(crate) buffer_capacity: usize,
    pub(crate) fd_ceiling: RawFd,
}

impl Config {
    /// Per-direction buffer size for new connections, in bytes.
    pub fn buffer_capacity(&mut self, capacity: usize) {
        self.buffer_capacity = capacity;
    }

    /// Reject any descriptor at or above this value, at accept time and at
    /// upstream-connect time. Bitset-based readiness facilities cannot
    /// represent descriptors past `FD_SETSIZE`; with an event-queue reactor
    /// this is simply the resource bound on descriptors per process.
    pub fn fd_ceiling(&mut self, ceiling: RawFd) {
        self.fd_ceiling = ceiling;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            fd_ceiling: libc::FD_SETSIZE as RawFd,
        }
    }
}
