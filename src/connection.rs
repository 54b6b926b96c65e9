use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::rc::Rc;

use crate::list::Readiness;
use crate::listener::Listener;
use crate::states::{NewState, StateEnum, StateTrait};
use crate::{Config, Interest};

/// The lifecycle stage a [`Connection`] is in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateKind {
    New,
    Accepted,
    Connected,
    ServerClosed,
    ClientClosed,
    Closed,
}

/// One proxied client, from accept to teardown.
///
/// A connection owns its sockets and buffers through its current state
/// object; which sockets exist is decided by the state, so a socket can never
/// be closed twice or leak past teardown.
#[derive(Debug)]
pub struct Connection(Option<StateEnum>);

impl Connection {
    pub(crate) fn new(listener: Rc<dyn Listener>, cfg: Config) -> Self {
        Self(Some(NewState::new(listener, cfg).into()))
    }

    #[inline]
    fn with_state<T>(&mut self, f: impl FnOnce(StateEnum) -> (StateEnum, T)) -> T {
        // take the current state, pass it to `f`, and put back whatever state
        // `f` produced
        let state = self.0.take().unwrap();
        let (state, rv) = f(state);
        self.0 = Some(state);

        rv
    }

    /// Accept one client from the listening socket. Returns whether the
    /// record is now `Accepted` and ready to be linked into the list.
    pub(crate) fn accept(&mut self) -> bool {
        self.with_state(|state| match state {
            StateEnum::New(new) => new.accept(),
            state => {
                log::warn!("accept on connection in invalid state {:?}", state.kind());
                (state, false)
            }
        })
    }

    /// Run one dispatch tick. Returns whether any I/O progressed.
    pub(crate) fn service(&mut self, ready: &Readiness) -> bool {
        self.with_state(|state| state.service(ready))
    }

    /// Close whichever sockets are still open.
    pub(crate) fn close(&mut self) {
        self.with_state(|state| (state.close(), ()))
    }

    pub(crate) fn interest(&self) -> Interest {
        self.0.as_ref().unwrap().interest()
    }

    pub(crate) fn client_fd(&self) -> Option<&OwnedFd> {
        self.0.as_ref().unwrap().client_fd()
    }

    pub(crate) fn server_fd(&self) -> Option<&OwnedFd> {
        self.0.as_ref().unwrap().server_fd()
    }

    pub(crate) fn write_summary<W: Write>(&self, out: &mut W) -> io::Result<()> {
        self.0.as_ref().unwrap().write_summary(out)
    }

    #[inline]
    pub fn state(&self) -> StateKind {
        self.0.as_ref().unwrap().kind()
    }

    /// The routing hostname, present once the parse has succeeded and until
    /// the record is freed.
    #[inline]
    pub fn hostname(&self) -> Option<&str> {
        self.0.as_ref().unwrap().hostname()
    }

    /// `(len, size)` of the buffer holding bytes received from the client,
    /// while one exists.
    pub fn client_buffer_usage(&self) -> Option<(usize, usize)> {
        match self.0.as_ref().unwrap() {
            StateEnum::Accepted(s) => Some((s.client.buffer.len(), s.client.buffer.size())),
            StateEnum::Connected(s) => Some((s.client.buffer.len(), s.client.buffer.size())),
            StateEnum::ServerClosed(s) => Some((s.client.buffer.len(), s.client.buffer.size())),
            StateEnum::ClientClosed(s) => Some((s.client_buffer.len(), s.client_buffer.size())),
            StateEnum::New(_) | StateEnum::Closed(_) => None,
        }
    }

    /// `(len, size)` of the buffer holding bytes received from the server,
    /// while one exists.
    pub fn server_buffer_usage(&self) -> Option<(usize, usize)> {
        match self.0.as_ref().unwrap() {
            StateEnum::Connected(s) => Some((s.server.buffer.len(), s.server.buffer.size())),
            StateEnum::ServerClosed(s) => Some((s.server_buffer.len(), s.server_buffer.size())),
            StateEnum::ClientClosed(s) => Some((s.server.buffer.len(), s.server.buffer.size())),
            StateEnum::New(_) | StateEnum::Accepted(_) | StateEnum::Closed(_) => None,
        }
    }
}
