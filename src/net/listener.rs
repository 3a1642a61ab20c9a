//! Listening endpoint.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::driver::{DriverHandle, EventSink};
use crate::error::{Error, Result};
use crate::events::Readiness;
use crate::sock::{SocketOps, is_would_block};

/// Callbacks for a listening endpoint.
pub trait ListenerCallbacks {
    /// At least one connection is ready to accept. The callback should
    /// drain with [`ListeningSocket::accept`] until it returns `None`.
    fn on_incoming_connections(&mut self, listener: &ListeningSocket) {
        let _ = listener;
    }

    /// The listener reached a terminal condition (reset or local close).
    fn on_disconnected(&mut self, listener: &ListeningSocket) {
        let _ = listener;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Bound,
    Listening,
    Disconnected,
}

impl ListenerState {
    fn name(self) -> &'static str {
        match self {
            ListenerState::Created => "created",
            ListenerState::Bound => "bound",
            ListenerState::Listening => "listening",
            ListenerState::Disconnected => "disconnected",
        }
    }
}

struct ListenerShared {
    me: Weak<ListenerShared>,
    afd: DriverHandle,
    socket: RefCell<Option<Box<dyn SocketOps>>>,
    callbacks: RefCell<Box<dyn ListenerCallbacks>>,
    state: Cell<ListenerState>,
    interest: Cell<Readiness>,
    dispatching: Cell<bool>,
    queued: Cell<Readiness>,
    disconnect_delivered: Cell<bool>,
}

/// A listening socket endpoint bound to one driver slot.
#[derive(Clone)]
pub struct ListeningSocket {
    shared: Rc<ListenerShared>,
}

impl ListeningSocket {
    pub fn new(
        afd: DriverHandle,
        socket: Box<dyn SocketOps>,
        callbacks: Box<dyn ListenerCallbacks>,
    ) -> Result<ListeningSocket> {
        let base = socket.base_handle();
        let shared = Rc::new_cyclic(|me| ListenerShared {
            me: me.clone(),
            afd,
            socket: RefCell::new(Some(socket)),
            callbacks: RefCell::new(callbacks),
            state: Cell::new(ListenerState::Created),
            interest: Cell::new(Readiness::empty()),
            dispatching: Cell::new(false),
            queued: Cell::new(Readiness::empty()),
            disconnect_delivered: Cell::new(false),
        });
        let sink: Rc<dyn EventSink> = shared.clone();
        shared.afd.associate(base, Rc::downgrade(&sink))?;
        Ok(ListeningSocket { shared })
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state.get()
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let sh = &self.shared;
        if sh.state.get() != ListenerState::Created {
            return Err(Error::InvalidState {
                op: "bind",
                state: sh.state.get().name(),
            });
        }
        {
            let socket = sh.socket.borrow();
            let socket = socket.as_ref().expect("created endpoint holds its socket");
            socket.bind(addr).map_err(Error::Socket)?;
        }
        sh.state.set(ListenerState::Bound);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.shared.socket.borrow();
        let Some(socket) = socket.as_ref() else {
            return Err(Error::InvalidState {
                op: "local_addr",
                state: "closed",
            });
        };
        socket.local_addr().map_err(Error::Socket)
    }

    /// Start listening and arm the full interest set.
    pub fn listen(&self, backlog: u32) -> Result<()> {
        let sh = &self.shared;
        if sh.state.get() != ListenerState::Bound {
            return Err(Error::InvalidState {
                op: "listen",
                state: sh.state.get().name(),
            });
        }
        {
            let socket = sh.socket.borrow();
            let socket = socket.as_ref().expect("bound endpoint holds its socket");
            socket.listen(backlog).map_err(Error::Socket)?;
        }
        sh.state.set(ListenerState::Listening);
        sh.interest.set(Readiness::ALL);
        debug!(slot = sh.afd.slot(), backlog, "listening");
        sh.afd.arm(Readiness::ALL)?;
        Ok(())
    }

    /// Accept one pending connection; `None` means the backlog is
    /// drained.
    pub fn accept(&self) -> Result<Option<(Box<dyn SocketOps>, SocketAddr)>> {
        let sh = &self.shared;
        if sh.state.get() != ListenerState::Listening {
            return Err(Error::InvalidState {
                op: "accept",
                state: sh.state.get().name(),
            });
        }
        let socket = sh.socket.borrow();
        let Some(socket) = socket.as_ref() else {
            return Err(Error::InvalidState {
                op: "accept",
                state: "closed",
            });
        };
        match socket.accept() {
            Ok(pair) => Ok(Some(pair)),
            Err(e) if is_would_block(&e) => Ok(None),
            Err(e) => Err(Error::Socket(e)),
        }
    }

    /// Close the listening socket, synthesizing `local-closed` when no
    /// poll is in flight.
    pub fn close(&self) -> Result<()> {
        let sh = &self.shared;
        let Some(socket) = sh.socket.borrow_mut().take() else {
            return Ok(());
        };
        let poll_outstanding = sh.afd.covered();
        debug!(slot = sh.afd.slot(), poll_outstanding, "close listener");
        socket.close().map_err(Error::Socket)?;
        drop(socket);
        if sh.dispatching.get() {
            sh.queued.set(sh.queued.get() | Readiness::LOCAL_CLOSE);
        } else if !poll_outstanding {
            sh.dispatch(Readiness::LOCAL_CLOSE, None);
        }
        Ok(())
    }
}

impl ListenerShared {
    fn view(&self) -> ListeningSocket {
        ListeningSocket {
            shared: self.me.upgrade().expect("dispatch keeps the endpoint alive"),
        }
    }

    fn dispatch(&self, outcome: Readiness, _status: Option<io::Error>) -> Readiness {
        self.dispatching.set(true);
        self.run_rules(outcome);
        loop {
            let queued = self.queued.take();
            if queued.is_empty() {
                break;
            }
            self.run_rules(queued);
        }
        self.dispatching.set(false);
        self.interest.get()
    }

    fn run_rules(&self, outcome: Readiness) {
        trace!(
            slot = self.afd.slot(),
            ?outcome,
            state = self.state.get().name(),
            "listener dispatch"
        );
        self.interest.set(self.interest.get() - outcome);
        let mut ev = outcome;
        let view = self.view();

        if ev.contains(Readiness::ACCEPT) && self.state.get() == ListenerState::Listening {
            ev.remove(Readiness::ACCEPT);
            self.callbacks.borrow_mut().on_incoming_connections(&view);
            // Keep accepting: the accept edge was consumed above, so a
            // fresh full mask covers the next burst.
            if self.state.get() == ListenerState::Listening {
                self.interest.set(Readiness::ALL);
            }
        }

        if ev.intersects(Readiness::RESET | Readiness::LOCAL_CLOSE) {
            self.state.set(ListenerState::Disconnected);
            self.interest.set(Readiness::empty());
            if !self.disconnect_delivered.get() {
                self.disconnect_delivered.set(true);
                debug!(slot = self.afd.slot(), "listener disconnected");
                self.callbacks.borrow_mut().on_disconnected(&view);
            }
        }
    }
}

impl EventSink for ListenerShared {
    fn handle_events(&self, outcome: Readiness, status: Option<io::Error>) -> Readiness {
        self.dispatch(outcome, status)
    }
}

impl Drop for ListenerShared {
    fn drop(&mut self) {
        let _ = self.afd.disassociate();
        if let Some(socket) = self.socket.borrow_mut().take() {
            let _ = socket.close();
        }
    }
}
