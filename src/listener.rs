use std::fmt::Debug;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

/// What the hostname parser made of the bytes peeked from a fresh client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Not enough bytes yet; try again once more arrive.
    Incomplete,
    /// A well-formed request that carries no hostname; the client is rejected.
    NoHostname,
    /// Bytes the parser could not make sense of. The inner code is a
    /// parser-specific diagnostic, logged at debug level.
    Unparseable(i32),
    /// The routing key was found.
    Hostname(String),
}

/// The capabilities a connection needs from the listener that accepted it:
/// the accepting socket itself, a hostname parser for the first client bytes,
/// and a way to turn a hostname into a connected upstream socket.
///
/// Distinct implementations exist per protocol — a TLS listener extracts the
/// ClientHello SNI extension, an HTTP listener the Host header. The core never
/// looks inside the bytes itself.
pub trait Listener: Debug {
    /// The accepting socket.
    fn socket(&self) -> BorrowedFd<'_>;

    /// Extract a routing hostname from the first bytes a client sent. The
    /// bytes are a peek; the same prefix will be offered again (possibly
    /// extended) if the parse is [incomplete](ParseOutcome::Incomplete).
    fn parse_packet(&self, data: &[u8]) -> ParseOutcome;

    /// Resolve `hostname` to a backend and return a connected socket to it.
    fn lookup_server_socket(&self, hostname: &str) -> io::Result<OwnedFd>;
}
