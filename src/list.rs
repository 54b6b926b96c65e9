use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;

use log::{info, warn};
use nix::sys::select::FdSet;
use slotmap::{new_key_type, SlotMap};

use crate::connection::{Connection, StateKind};
use crate::listener::Listener;
use crate::{Config, Interest};

new_key_type! {
    pub(crate) struct ConnKey;
}

struct Entry {
    conn: Connection,
    prev: Option<ConnKey>,
    next: Option<ConnKey>,
}

/// The file descriptors that fired in one reactor tick, captured out of the
/// kernel-facing sets so dispatch can consume them while mutating the
/// connection list.
#[derive(Clone, Debug, Default)]
pub struct Readiness {
    read: Vec<RawFd>,
    write: Vec<RawFd>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the descriptors remaining in a pair of post-select sets.
    pub fn capture(rfds: &FdSet<'_>, wfds: &FdSet<'_>) -> Self {
        Self {
            read: rfds.fds(None).map(|fd| fd.as_raw_fd()).collect(),
            write: wfds.fds(None).map(|fd| fd.as_raw_fd()).collect(),
        }
    }

    pub fn add_readable(&mut self, fd: RawFd) {
        self.read.push(fd);
    }

    pub fn add_writable(&mut self, fd: RawFd) {
        self.write.push(fd);
    }

    pub fn readable(&self, fd: RawFd) -> bool {
        self.read.contains(&fd)
    }

    pub fn writable(&self, fd: RawFd) -> bool {
        self.write.contains(&fd)
    }
}

/// All live connections, most recently active first.
///
/// Connections live in a slot arena; the activity order is an intrusive
/// doubly-linked list threaded through the slots, so detaching a connection
/// and reinserting it at the head on every I/O event is O(1), and iteration
/// survives removal of the current element.
pub struct ConnectionList {
    slots: SlotMap<ConnKey, Entry>,
    head: Option<ConnKey>,
    tail: Option<ConnKey>,
    cfg: Config,
}

impl ConnectionList {
    pub fn new(cfg: Config) -> Self {
        Self {
            slots: SlotMap::with_key(),
            head: None,
            tail: None,
            cfg,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate the connections, most recently active first.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        std::iter::successors(self.head, |&key| self.slots[key].next)
            .map(|key| &self.slots[key].conn)
    }

    /// The least recently active connection, if any. An embedder that wants
    /// idle timeouts evicts from this end.
    pub fn last_active(&self) -> Option<&Connection> {
        self.tail.map(|key| &self.slots[key].conn)
    }

    /// Accept one pending client on `listener` and link it at the head of the
    /// list. A failed accept, or an accepted descriptor above the configured
    /// ceiling, leaves the list unchanged.
    pub fn accept_connection(&mut self, listener: &Rc<dyn Listener>) {
        let mut conn = Connection::new(Rc::clone(listener), self.cfg);
        if !conn.accept() {
            return;
        }

        let key = self.slots.insert(Entry {
            conn,
            prev: None,
            next: None,
        });
        self.push_front(key);
    }

    /// Add every descriptor the live connections want watched to `rfds` and
    /// `wfds`. Returns the highest descriptor seen, starting from `max` (the
    /// caller folds its own listening sockets in the same way).
    pub fn fd_set_connections<'a>(
        &'a self,
        rfds: &mut FdSet<'a>,
        wfds: &mut FdSet<'a>,
        mut max: RawFd,
    ) -> RawFd {
        for conn in self.iter() {
            let interest = conn.interest();

            if let Some(fd) = conn.client_fd() {
                if interest.contains(Interest::CLIENT_RECV) {
                    rfds.insert(fd);
                }
                if interest.contains(Interest::CLIENT_SEND) {
                    wfds.insert(fd);
                }
                max = std::cmp::max(max, fd.as_raw_fd());
            }

            if let Some(fd) = conn.server_fd() {
                if interest.contains(Interest::SERVER_RECV) {
                    rfds.insert(fd);
                }
                if interest.contains(Interest::SERVER_SEND) {
                    wfds.insert(fd);
                }
                max = std::cmp::max(max, fd.as_raw_fd());
            }
        }

        max
    }

    /// Dispatch one tick: run every connection against the readiness
    /// snapshot, touch the active ones to the head of the list, and reap the
    /// ones that finalized. After this returns no connection is `Closed`.
    pub fn handle_connections(&mut self, ready: &Readiness) {
        let mut cursor = self.head;

        while let Some(key) = cursor {
            // grab the successor first so reaping `key` cannot break the walk
            cursor = self.slots[key].next;

            match self.slots[key].conn.state() {
                StateKind::Closed => {
                    self.remove(key);
                    continue;
                }
                StateKind::New => {
                    warn!("connection list holds a record in invalid state NEW");
                    continue;
                }
                _ => {}
            }

            let touched = self.slots[key].conn.service(ready);

            if self.slots[key].conn.state() == StateKind::Closed {
                self.remove(key);
            } else if touched {
                self.move_to_head(key);
            }
        }
    }

    /// Write a one-line-per-connection snapshot to a fresh temporary file and
    /// return its path. The path is also logged, so the dump is reachable
    /// from a signal handler with no other output channel.
    pub fn print_connections(&self) -> io::Result<PathBuf> {
        let rv = self.write_dump();
        if let Err(e) = &rv {
            info!("connection dump failed: {e}");
        }
        rv
    }

    fn write_dump(&self) -> io::Result<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix(concat!(env!("CARGO_PKG_NAME"), "-connections-"))
            .tempfile()?;

        writeln!(file, "Running connections:")?;
        for conn in self.iter() {
            conn.write_summary(&mut file)?;
        }

        let (_, path) = file.keep().map_err(|e| e.error)?;
        info!("dumped connections to {}", path.display());

        Ok(path)
    }

    /// Tear down every connection, closing any sockets still open.
    pub fn free_connections(&mut self) {
        while let Some(key) = self.head {
            self.slots[key].conn.close();
            self.remove(key);
        }
    }

    fn push_front(&mut self, key: ConnKey) {
        let old_head = self.head;

        let entry = &mut self.slots[key];
        entry.prev = None;
        entry.next = old_head;

        match old_head {
            Some(old) => self.slots[old].prev = Some(key),
            None => self.tail = Some(key),
        }
        self.head = Some(key);
    }

    fn unlink(&mut self, key: ConnKey) {
        let (prev, next) = {
            let entry = &self.slots[key];
            (entry.prev, entry.next)
        };

        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }

        let entry = &mut self.slots[key];
        entry.prev = None;
        entry.next = None;
    }

    fn move_to_head(&mut self, key: ConnKey) {
        if self.head == Some(key) {
            return;
        }
        self.unlink(key);
        self.push_front(key);
    }

    fn remove(&mut self, key: ConnKey) {
        self.unlink(key);
        self.slots.remove(key);
    }
}

impl Drop for ConnectionList {
    fn drop(&mut self) {
        self.free_connections();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
    use std::time::Duration;

    use crate::listener::ParseOutcome;
    use crate::DEFAULT_BUFFER_CAPACITY;

    use super::*;

    #[derive(Debug)]
    struct ParseListener {
        sock: TcpListener,
        outcome: ParseOutcome,
    }

    impl Listener for ParseListener {
        fn socket(&self) -> BorrowedFd<'_> {
            self.sock.as_fd()
        }

        fn parse_packet(&self, _data: &[u8]) -> ParseOutcome {
            self.outcome.clone()
        }

        fn lookup_server_socket(&self, _hostname: &str) -> io::Result<OwnedFd> {
            Err(io::ErrorKind::ConnectionRefused.into())
        }
    }

    fn listener_with(outcome: ParseOutcome) -> (Rc<dyn Listener>, std::net::SocketAddr) {
        let sock = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        (Rc::new(ParseListener { sock, outcome }), addr)
    }

    fn settle() {
        std::thread::sleep(Duration::from_millis(200));
    }

    fn connect_and_accept(
        list: &mut ConnectionList,
        listener: &Rc<dyn Listener>,
        addr: std::net::SocketAddr,
        count: usize,
    ) -> Vec<TcpStream> {
        let mut streams = Vec::new();
        for _ in 0..count {
            let stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            list.accept_connection(listener);
            streams.push(stream);
        }
        streams
    }

    #[test]
    fn test_accept_links_at_head() {
        let (listener, addr) = listener_with(ParseOutcome::Incomplete);
        let mut list = ConnectionList::new(Config::default());

        let _streams = connect_and_accept(&mut list, &listener, addr, 2);

        assert_eq!(list.len(), 2);
        for conn in list.iter() {
            assert_eq!(conn.state(), StateKind::Accepted);
        }
    }

    #[test]
    fn test_fd_ceiling_rejects_at_accept() {
        let (listener, addr) = listener_with(ParseOutcome::Incomplete);
        let mut cfg = Config::default();
        // every descriptor is at or above a zero ceiling
        cfg.fd_ceiling(0);
        let mut list = ConnectionList::new(cfg);

        let mut streams = connect_and_accept(&mut list, &listener, addr, 1);

        assert_eq!(list.len(), 0);
        let mut scratch = [0u8; 1];
        assert_eq!(streams[0].read(&mut scratch).unwrap(), 0);
    }

    #[test]
    fn test_fd_set_connections_and_max() {
        let (listener, addr) = listener_with(ParseOutcome::Incomplete);
        let mut list = ConnectionList::new(Config::default());
        let _streams = connect_and_accept(&mut list, &listener, addr, 1);

        let mut rfds = FdSet::new();
        let mut wfds = FdSet::new();
        let max = list.fd_set_connections(&mut rfds, &mut wfds, -1);

        let fd = list.iter().next().unwrap().client_fd().unwrap();
        assert!(rfds.contains(fd));
        assert!(!wfds.contains(fd));
        assert_eq!(max, fd.as_raw_fd());
    }

    #[test]
    fn test_lru_touch_moves_active_connection_to_head() {
        use std::io::Write;

        let (listener, addr) = listener_with(ParseOutcome::Incomplete);
        let mut list = ConnectionList::new(Config::default());
        let mut streams = connect_and_accept(&mut list, &listener, addr, 3);

        // list order is newest-first, so the first stream maps to the tail
        let fds: Vec<RawFd> = list
            .iter()
            .map(|conn| conn.client_fd().unwrap().as_raw_fd())
            .collect();
        let tail_fd = fds[2];

        streams[0].write_all(b"x").unwrap();
        settle();

        let mut ready = Readiness::new();
        ready.add_readable(tail_fd);
        list.handle_connections(&ready);

        let fds_after: Vec<RawFd> = list
            .iter()
            .map(|conn| conn.client_fd().unwrap().as_raw_fd())
            .collect();
        assert_eq!(fds_after, vec![fds[2], fds[0], fds[1]]);
        assert_eq!(
            list.iter().next().unwrap().client_buffer_usage(),
            Some((1, DEFAULT_BUFFER_CAPACITY))
        );
        let tail_fd_after = list
            .last_active()
            .unwrap()
            .client_fd()
            .unwrap()
            .as_raw_fd();
        assert_eq!(tail_fd_after, fds[1]);
    }

    #[test]
    fn test_rejected_connection_is_reaped_in_the_same_tick() {
        use std::io::Write;

        let (listener, addr) = listener_with(ParseOutcome::NoHostname);
        let mut list = ConnectionList::new(Config::default());
        let mut streams = connect_and_accept(&mut list, &listener, addr, 1);
        let fd = list.iter().next().unwrap().client_fd().unwrap().as_raw_fd();

        streams[0].write_all(b"no hostname here").unwrap();
        settle();

        let mut ready = Readiness::new();
        ready.add_readable(fd);
        list.handle_connections(&ready);

        assert_eq!(list.len(), 0);
        let mut scratch = [0u8; 1];
        assert_eq!(streams[0].read(&mut scratch).unwrap(), 0);
    }

    #[test]
    fn test_dump_lists_every_connection() {
        let (listener, addr) = listener_with(ParseOutcome::Incomplete);
        let mut list = ConnectionList::new(Config::default());
        let _streams = connect_and_accept(&mut list, &listener, addr, 2);

        let path = list.print_connections().unwrap();
        let dump = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut lines = dump.lines();
        assert_eq!(lines.next(), Some("Running connections:"));

        let mut count = 0;
        for line in lines {
            assert!(line.starts_with("ACCEPTED      127.0.0.1 "), "line: {line}");
            assert!(line.ends_with(&format!("0/{DEFAULT_BUFFER_CAPACITY}\t-")));
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_free_connections_closes_everything() {
        let (listener, addr) = listener_with(ParseOutcome::Incomplete);
        let mut list = ConnectionList::new(Config::default());
        let mut streams = connect_and_accept(&mut list, &listener, addr, 2);

        list.free_connections();

        assert!(list.is_empty());
        for stream in &mut streams {
            let mut scratch = [0u8; 1];
            assert_eq!(stream.read(&mut scratch).unwrap(), 0);
        }
    }
}
