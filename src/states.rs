use std::fmt::Debug;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::socket::{accept4, getpeername, SockFlag, SockaddrStorage};

use crate::buffer::Buffer;
use crate::connection::StateKind;
use crate::list::Readiness;
use crate::listener::{Listener, ParseOutcome};
use crate::sockaddr::peer_address;
use crate::{Config, Interest, CLIENT_HELLO_PEEK};

// There are three related state types here, following the same layering as
// the connection wrapper in connection.rs:
//
// - `Connection` — public take/put wrapper, holds a `StateEnum`.
// - `StateEnum` — an enum of the individual state types. Its methods usually
//   take owned state objects and return owned `StateEnum` objects, so that
//   closing a socket is an ownership transition rather than a flag.
// - `StateTrait` — implemented by each individual state type as well as the
//   enum that encapsulates them.

/// One half of a proxied connection: the socket, the peer's address, and the
/// buffer holding bytes received from that peer (and destined for the
/// opposite socket).
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) sock: OwnedFd,
    pub(crate) addr: Option<SockaddrStorage>,
    pub(crate) buffer: Buffer,
}

impl Endpoint {
    fn raw(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

/// Fields every state carries: the back-reference to the listener that
/// accepted the client, and the knobs the connection was created with.
#[derive(Debug)]
pub(crate) struct Common {
    pub(crate) listener: Rc<dyn Listener>,
    pub(crate) cfg: Config,
}

#[enum_dispatch::enum_dispatch]
pub(crate) trait StateTrait: Debug + Sized
where
    StateEnum: From<Self>,
{
    fn kind(&self) -> StateKind;

    /// Which of this connection's file descriptors should be watched, and in
    /// which directions.
    fn interest(&self) -> Interest {
        Interest::empty()
    }

    /// Run one dispatch tick against the readiness snapshot. Returns the next
    /// state and whether any I/O progressed (which moves the connection to
    /// the head of the activity list).
    fn service(self, _ready: &Readiness) -> (StateEnum, bool) {
        warn!("connection serviced in invalid state {:?}", self.kind());
        (self.into(), false)
    }

    /// Close the client-side socket. The caller must know it is open.
    fn close_client_socket(self) -> StateEnum {
        warn!("close of client socket in invalid state {:?}", self.kind());
        self.into()
    }

    /// Close the server-side socket. The caller must know it is open.
    fn close_server_socket(self) -> StateEnum {
        warn!("close of server socket in invalid state {:?}", self.kind());
        self.into()
    }

    /// Tear the connection down: close whichever sockets are still open.
    fn close(self) -> StateEnum {
        self.into()
    }

    fn client_fd(&self) -> Option<&OwnedFd> {
        None
    }

    fn server_fd(&self) -> Option<&OwnedFd> {
        None
    }

    fn hostname(&self) -> Option<&str> {
        None
    }
}

#[enum_dispatch::enum_dispatch(StateTrait)]
#[derive(Debug)]
pub(crate) enum StateEnum {
    New(NewState),
    Accepted(AcceptedState),
    Connected(ConnectedState),
    ServerClosed(ServerClosedState),
    ClientClosed(ClientClosedState),
    Closed(ClosedState),
}

/// A record that has been allocated but not yet tied to a client socket.
/// Records in this state are never linked into the connection list.
#[derive(Debug)]
pub(crate) struct NewState {
    pub(crate) common: Common,
}

/// A client socket is open and we are waiting for enough initial bytes to
/// extract a routing hostname. No server socket exists yet.
#[derive(Debug)]
pub(crate) struct AcceptedState {
    pub(crate) common: Common,
    pub(crate) client: Endpoint,
}

/// Both sockets are open and bytes flow in both directions.
#[derive(Debug)]
pub(crate) struct ConnectedState {
    pub(crate) common: Common,
    pub(crate) client: Endpoint,
    pub(crate) server: Endpoint,
    pub(crate) hostname: String,
}

/// The server socket has been closed by us; bytes it already delivered keep
/// draining to the client until the buffer empties or the client errors.
#[derive(Debug)]
pub(crate) struct ServerClosedState {
    pub(crate) common: Common,
    pub(crate) client: Endpoint,
    pub(crate) server_buffer: Buffer,
    pub(crate) hostname: String,
}

/// Mirror of [`ServerClosedState`]: the client socket has been closed by us
/// and its buffered bytes drain to the server.
#[derive(Debug)]
pub(crate) struct ClientClosedState {
    pub(crate) common: Common,
    pub(crate) server: Endpoint,
    pub(crate) client_buffer: Buffer,
    pub(crate) hostname: String,
}

/// Terminal state: both sockets are gone. The record is unlinked and dropped
/// by the dispatch loop.
#[derive(Debug)]
pub(crate) struct ClosedState {
    pub(crate) common: Common,
}

// EAGAIN and EINTR only interrupt this attempt; the next readiness event
// retries. EWOULDBLOCK aliases EAGAIN on every platform we run on.
fn is_temporary(errno: Errno) -> bool {
    matches!(errno, Errno::EAGAIN | Errno::EINTR)
}

/// Close an owned descriptor, logging (but otherwise ignoring) a failing
/// close(2). The descriptor is gone either way.
fn close_logged(fd: OwnedFd) {
    let raw = fd.into_raw_fd();
    if let Err(e) = nix::unistd::close(raw) {
        info!("close failed: {e}");
    }
}

enum IoStep {
    Ok,
    Failed,
}

fn rx_step(buffer: &mut Buffer, fd: RawFd) -> IoStep {
    match buffer.recv_from_fd(fd) {
        // orderly close by the peer
        Ok(0) => IoStep::Failed,
        Ok(_) => IoStep::Ok,
        Err(e) if is_temporary(e) => IoStep::Ok,
        Err(e) => {
            info!("recv failed: {e}");
            IoStep::Failed
        }
    }
}

fn tx_step(buffer: &mut Buffer, fd: RawFd) -> IoStep {
    match buffer.send_to_fd(fd) {
        Ok(_) => IoStep::Ok,
        Err(e) if is_temporary(e) => IoStep::Ok,
        Err(e) => {
            info!("send failed: {e}");
            IoStep::Failed
        }
    }
}

impl NewState {
    pub(crate) fn new(listener: Rc<dyn Listener>, cfg: Config) -> Self {
        Self {
            common: Common { listener, cfg },
        }
    }

    /// Accept one client from the listening socket. On success the record
    /// moves to `Accepted`; on failure it stays `New` and the caller drops
    /// it without ever linking it into the list.
    pub(crate) fn accept(self) -> (StateEnum, bool) {
        let lfd = self.common.listener.socket().as_raw_fd();

        let raw = match accept4(lfd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(raw) => raw,
            Err(e) => {
                info!("accept failed: {e}");
                return (self.into(), false);
            }
        };

        // SAFETY: accept4 returned a fresh descriptor that nothing else owns.
        let sock = unsafe { OwnedFd::from_raw_fd(raw) };

        if raw >= self.common.cfg.fd_ceiling {
            warn!("file descriptor {raw} above the readiness ceiling, closing incoming connection");
            close_logged(sock);
            return (self.into(), false);
        }

        let addr = match getpeername::<SockaddrStorage>(raw) {
            Ok(addr) => Some(addr),
            Err(e) => {
                info!("getpeername failed: {e}");
                None
            }
        };

        let buffer = Buffer::with_capacity(self.common.cfg.buffer_capacity);
        let accepted = AcceptedState {
            common: self.common,
            client: Endpoint { sock, addr, buffer },
        };

        (accepted.into(), true)
    }
}

impl StateTrait for NewState {
    fn kind(&self) -> StateKind {
        StateKind::New
    }
}

impl AcceptedState {
    /// Peek at the client's first bytes and try to route them. Consumes
    /// nothing from the buffer: on success the buffered bytes are forwarded
    /// verbatim to the upstream by the next `Connected` dispatch.
    pub(crate) fn handle_client_hello(self) -> StateEnum {
        let (peer_ip, peer_port) = peer_address(self.client.addr.as_ref());

        let mut scratch = [0u8; CLIENT_HELLO_PEEK];
        let len = self.client.buffer.peek(&mut scratch);

        let hostname = match self.common.listener.parse_packet(&scratch[..len]) {
            ParseOutcome::Incomplete => return self.into(),
            ParseOutcome::NoHostname => {
                info!("request from {peer_ip}:{peer_port} did not include a hostname");
                return self.close();
            }
            ParseOutcome::Unparseable(code) => {
                info!("unable to parse request from {peer_ip}:{peer_port}");
                debug!("parse_packet returned {code}");
                return self.close();
            }
            ParseOutcome::Hostname(hostname) => hostname,
        };

        info!("request for {hostname} from {peer_ip}:{peer_port}");

        let sock = match self.common.listener.lookup_server_socket(&hostname) {
            Ok(sock) => sock,
            Err(e) => {
                info!("server connection failed to {hostname}: {e}");
                return self.close();
            }
        };

        let raw = sock.as_raw_fd();
        if raw >= self.common.cfg.fd_ceiling {
            warn!("file descriptor {raw} above the readiness ceiling, closing server connection");
            close_logged(sock);
            return self.close();
        }

        let addr = match getpeername::<SockaddrStorage>(raw) {
            Ok(addr) => Some(addr),
            Err(e) => {
                info!("getpeername failed: {e}");
                None
            }
        };

        let buffer = Buffer::with_capacity(self.common.cfg.buffer_capacity);
        let connected = ConnectedState {
            common: self.common,
            client: self.client,
            server: Endpoint { sock, addr, buffer },
            hostname,
        };

        connected.into()
    }
}

impl StateTrait for AcceptedState {
    fn kind(&self) -> StateKind {
        StateKind::Accepted
    }

    fn interest(&self) -> Interest {
        let mut rv = Interest::empty();
        if self.client.buffer.room() > 0 {
            rv |= Interest::CLIENT_RECV;
        }
        rv
    }

    fn service(mut self, ready: &Readiness) -> (StateEnum, bool) {
        let cfd = self.client.raw();

        if ready.readable(cfd) && self.client.buffer.room() > 0 {
            return match rx_step(&mut self.client.buffer, cfd) {
                IoStep::Failed => (self.close_client_socket(), false),
                // the parse is retried on every read until it resolves;
                // nothing to transmit can exist before a server socket does
                IoStep::Ok => (self.handle_client_hello(), true),
            };
        }

        (self.into(), false)
    }

    fn close_client_socket(self) -> StateEnum {
        close_logged(self.client.sock);
        ClosedState {
            common: self.common,
        }
        .into()
    }

    fn close(self) -> StateEnum {
        self.close_client_socket()
    }

    fn client_fd(&self) -> Option<&OwnedFd> {
        Some(&self.client.sock)
    }
}

impl StateTrait for ConnectedState {
    fn kind(&self) -> StateKind {
        StateKind::Connected
    }

    fn interest(&self) -> Interest {
        let mut rv = Interest::empty();
        if self.server.buffer.room() > 0 {
            rv |= Interest::SERVER_RECV;
        }
        if self.client.buffer.len() > 0 {
            rv |= Interest::SERVER_SEND;
        }
        if self.client.buffer.room() > 0 {
            rv |= Interest::CLIENT_RECV;
        }
        if self.server.buffer.len() > 0 {
            rv |= Interest::CLIENT_SEND;
        }
        rv
    }

    fn service(mut self, ready: &Readiness) -> (StateEnum, bool) {
        let cfd = self.client.raw();
        let sfd = self.server.raw();
        let mut touched = false;

        // server half first, so writes toward the upstream complete before
        // fresh client bytes are consumed
        let mut server_err = false;
        if ready.readable(sfd) && self.server.buffer.room() > 0 {
            match rx_step(&mut self.server.buffer, sfd) {
                IoStep::Failed => server_err = true,
                IoStep::Ok => touched = true,
            }
        }
        if !server_err && ready.writable(sfd) && self.client.buffer.len() > 0 {
            match tx_step(&mut self.client.buffer, sfd) {
                IoStep::Failed => server_err = true,
                IoStep::Ok => touched = true,
            }
        }

        // the client half runs regardless: an error on one side never stops
        // the other side from making progress this tick
        let mut client_err = false;
        if ready.readable(cfd) && self.client.buffer.room() > 0 {
            match rx_step(&mut self.client.buffer, cfd) {
                IoStep::Failed => client_err = true,
                IoStep::Ok => touched = true,
            }
        }
        if !client_err && ready.writable(cfd) && self.server.buffer.len() > 0 {
            match tx_step(&mut self.server.buffer, cfd) {
                IoStep::Failed => client_err = true,
                IoStep::Ok => touched = true,
            }
        }

        let next = match (client_err, server_err) {
            (false, false) => self.into(),
            (true, false) => self.close_client_socket(),
            (false, true) => self.close_server_socket(),
            (true, true) => self.close(),
        };

        (next, touched)
    }

    fn close_client_socket(self) -> StateEnum {
        close_logged(self.client.sock);
        ClientClosedState {
            common: self.common,
            server: self.server,
            client_buffer: self.client.buffer,
            hostname: self.hostname,
        }
        .into()
    }

    fn close_server_socket(self) -> StateEnum {
        close_logged(self.server.sock);
        ServerClosedState {
            common: self.common,
            client: self.client,
            server_buffer: self.server.buffer,
            hostname: self.hostname,
        }
        .into()
    }

    fn close(self) -> StateEnum {
        close_logged(self.client.sock);
        close_logged(self.server.sock);
        ClosedState {
            common: self.common,
        }
        .into()
    }

    fn client_fd(&self) -> Option<&OwnedFd> {
        Some(&self.client.sock)
    }

    fn server_fd(&self) -> Option<&OwnedFd> {
        Some(&self.server.sock)
    }

    fn hostname(&self) -> Option<&str> {
        Some(&self.hostname)
    }
}

impl StateTrait for ServerClosedState {
    fn kind(&self) -> StateKind {
        StateKind::ServerClosed
    }

    fn interest(&self) -> Interest {
        // watched even with nothing buffered, so the drained connection can
        // be closed promptly
        Interest::CLIENT_SEND
    }

    fn service(mut self, ready: &Readiness) -> (StateEnum, bool) {
        let cfd = self.client.raw();
        let mut failed = false;
        let mut touched = false;

        if ready.writable(cfd) && self.server_buffer.len() > 0 {
            match tx_step(&mut self.server_buffer, cfd) {
                IoStep::Failed => failed = true,
                IoStep::Ok => touched = true,
            }
        }

        if failed || self.server_buffer.is_empty() {
            return (self.close_client_socket(), touched);
        }

        (self.into(), touched)
    }

    fn close_client_socket(self) -> StateEnum {
        close_logged(self.client.sock);
        ClosedState {
            common: self.common,
        }
        .into()
    }

    fn close(self) -> StateEnum {
        self.close_client_socket()
    }

    fn client_fd(&self) -> Option<&OwnedFd> {
        Some(&self.client.sock)
    }

    fn hostname(&self) -> Option<&str> {
        Some(&self.hostname)
    }
}

impl StateTrait for ClientClosedState {
    fn kind(&self) -> StateKind {
        StateKind::ClientClosed
    }

    fn interest(&self) -> Interest {
        Interest::SERVER_SEND
    }

    fn service(mut self, ready: &Readiness) -> (StateEnum, bool) {
        let sfd = self.server.raw();
        let mut failed = false;
        let mut touched = false;

        if ready.writable(sfd) && self.client_buffer.len() > 0 {
            match tx_step(&mut self.client_buffer, sfd) {
                IoStep::Failed => failed = true,
                IoStep::Ok => touched = true,
            }
        }

        if failed || self.client_buffer.is_empty() {
            return (self.close_server_socket(), touched);
        }

        (self.into(), touched)
    }

    fn close_server_socket(self) -> StateEnum {
        close_logged(self.server.sock);
        ClosedState {
            common: self.common,
        }
        .into()
    }

    fn close(self) -> StateEnum {
        self.close_server_socket()
    }

    fn server_fd(&self) -> Option<&OwnedFd> {
        Some(&self.server.sock)
    }

    fn hostname(&self) -> Option<&str> {
        Some(&self.hostname)
    }
}

impl StateTrait for ClosedState {
    fn kind(&self) -> StateKind {
        StateKind::Closed
    }
}

impl StateEnum {
    /// One line of the connection dump. The layout is stable for inspection
    /// tooling; see the crate docs.
    pub(crate) fn write_summary<W: Write>(&self, out: &mut W) -> io::Result<()> {
        match self {
            StateEnum::Accepted(s) => {
                let (ip, port) = peer_address(s.client.addr.as_ref());
                writeln!(
                    out,
                    "ACCEPTED      {} {} {}/{}\t-",
                    ip,
                    port,
                    s.client.buffer.len(),
                    s.client.buffer.size()
                )
            }
            StateEnum::Connected(s) => {
                let (cip, cport) = peer_address(s.client.addr.as_ref());
                let (sip, sport) = peer_address(s.server.addr.as_ref());
                writeln!(
                    out,
                    "CONNECTED     {} {} {}/{}\t{} {} {}/{}",
                    cip,
                    cport,
                    s.client.buffer.len(),
                    s.client.buffer.size(),
                    sip,
                    sport,
                    s.server.buffer.len(),
                    s.server.buffer.size()
                )
            }
            StateEnum::ServerClosed(s) => {
                let (ip, port) = peer_address(s.client.addr.as_ref());
                writeln!(
                    out,
                    "SERVER_CLOSED {} {} {}/{}\t-",
                    ip,
                    port,
                    s.client.buffer.len(),
                    s.client.buffer.size()
                )
            }
            StateEnum::ClientClosed(s) => {
                let (ip, port) = peer_address(s.server.addr.as_ref());
                writeln!(
                    out,
                    "CLIENT_CLOSED -\t{} {} {}/{}",
                    ip,
                    port,
                    s.server.buffer.len(),
                    s.server.buffer.size()
                )
            }
            StateEnum::Closed(_) => writeln!(out, "CLOSED        -\t-"),
            StateEnum::New(_) => writeln!(out, "NEW           -\t-"),
        }
    }
}
