//! Connectionless datagram endpoint.
//!
//! Shaped like the stream endpoint minus the connection state machine. A
//! datagram socket is host-writable from the moment it exists; the
//! endpoint still requires `bind` before transfer, and only arms readable
//! interest once bound. Writable interest is armed on demand when a send
//! hits the non-blocking limit.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::driver::{DriverHandle, EventSink};
use crate::error::{Error, Result};
use crate::events::Readiness;
use crate::sock::{SocketOps, is_would_block};

/// Callbacks for a datagram endpoint.
pub trait DatagramCallbacks {
    /// A datagram can be received without blocking.
    fn on_readable(&mut self, sock: &DatagramSocket) {
        let _ = sock;
    }

    /// The socket can take more outgoing datagrams.
    fn on_writable(&mut self, sock: &DatagramSocket) {
        let _ = sock;
    }

    /// The socket was closed locally; terminal.
    fn on_disconnected(&mut self, sock: &DatagramSocket) {
        let _ = sock;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramState {
    Created,
    Bound,
    Disconnected,
}

impl DatagramState {
    fn name(self) -> &'static str {
        match self {
            DatagramState::Created => "created",
            DatagramState::Bound => "bound",
            DatagramState::Disconnected => "disconnected",
        }
    }
}

struct DatagramShared {
    me: Weak<DatagramShared>,
    afd: DriverHandle,
    socket: RefCell<Option<Box<dyn SocketOps>>>,
    callbacks: RefCell<Box<dyn DatagramCallbacks>>,
    state: Cell<DatagramState>,
    interest: Cell<Readiness>,
    dispatching: Cell<bool>,
    queued: Cell<Readiness>,
    disconnect_delivered: Cell<bool>,
}

/// A datagram socket endpoint bound to one driver slot.
#[derive(Clone)]
pub struct DatagramSocket {
    shared: Rc<DatagramShared>,
}

impl DatagramSocket {
    pub fn new(
        afd: DriverHandle,
        socket: Box<dyn SocketOps>,
        callbacks: Box<dyn DatagramCallbacks>,
    ) -> Result<DatagramSocket> {
        let base = socket.base_handle();
        let shared = Rc::new_cyclic(|me| DatagramShared {
            me: me.clone(),
            afd,
            socket: RefCell::new(Some(socket)),
            callbacks: RefCell::new(callbacks),
            state: Cell::new(DatagramState::Created),
            interest: Cell::new(Readiness::empty()),
            dispatching: Cell::new(false),
            queued: Cell::new(Readiness::empty()),
            disconnect_delivered: Cell::new(false),
        });
        let sink: Rc<dyn EventSink> = shared.clone();
        shared.afd.associate(base, Rc::downgrade(&sink))?;
        Ok(DatagramSocket { shared })
    }

    pub fn state(&self) -> DatagramState {
        self.shared.state.get()
    }

    /// The interest mask the endpoint last requested.
    pub fn interest(&self) -> Readiness {
        self.shared.interest.get()
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

    /// Bind and arm readable interest.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let sh = &self.shared;
        if sh.state.get() != DatagramState::Created {
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
        sh.state.set(DatagramState::Bound);
        sh.interest.set(Readiness::READABLE | Readiness::LOCAL_CLOSE);
        debug!(slot = sh.afd.slot(), %addr, "datagram bound");
        sh.afd.arm(sh.interest.get())?;
        Ok(())
    }

    /// Send one datagram. A refused send reports zero bytes and arms
    /// writable interest so `on_writable` follows when the socket drains.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        let sh = &self.shared;
        if sh.state.get() != DatagramState::Bound {
            return Err(Error::InvalidState {
                op: "send_to",
                state: sh.state.get().name(),
            });
        }
        let result = {
            let socket = sh.socket.borrow();
            let Some(socket) = socket.as_ref() else {
                return Err(Error::InvalidState {
                    op: "send_to",
                    state: "closed",
                });
            };
            socket.send_to(data, addr)
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) if is_would_block(&e) => {
                trace!(slot = sh.afd.slot(), "datagram send refused");
                sh.add_interest(Readiness::WRITABLE)?;
                Ok(0)
            }
            Err(e) => Err(Error::Socket(e)),
        }
    }

    /// Receive one datagram; `None` means nothing is available and
    /// readable interest has been re-armed.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        let sh = &self.shared;
        if sh.state.get() != DatagramState::Bound {
            return Err(Error::InvalidState {
                op: "recv_from",
                state: sh.state.get().name(),
            });
        }
        let result = {
            let socket = sh.socket.borrow();
            let Some(socket) = socket.as_ref() else {
                return Err(Error::InvalidState {
                    op: "recv_from",
                    state: "closed",
                });
            };
            socket.recv_from(buf)
        };
        match result {
            Ok(pair) => Ok(Some(pair)),
            Err(e) if is_would_block(&e) => {
                sh.add_interest(Readiness::READABLE)?;
                Ok(None)
            }
            Err(e) => Err(Error::Socket(e)),
        }
    }

    /// Close the socket, synthesizing `local-closed` when no poll is in
    /// flight.
    pub fn close(&self) -> Result<()> {
        let sh = &self.shared;
        let Some(socket) = sh.socket.borrow_mut().take() else {
            return Ok(());
        };
        let poll_outstanding = sh.afd.covered();
        debug!(slot = sh.afd.slot(), poll_outstanding, "close datagram");
        socket.close().map_err(Error::Socket)?;
        drop(socket);
        if sh.dispatching.get() {
            sh.queued.set(sh.queued.get() | Readiness::LOCAL_CLOSE);
        } else if !poll_outstanding {
            sh.dispatch(Readiness::LOCAL_CLOSE);
        }
        Ok(())
    }
}

impl DatagramShared {
    fn view(&self) -> DatagramSocket {
        DatagramSocket {
            shared: self.me.upgrade().expect("dispatch keeps the endpoint alive"),
        }
    }

    fn add_interest(&self, cond: Readiness) -> Result<()> {
        let had = self.interest.get().contains(cond);
        self.interest.set(self.interest.get() | cond);
        if self.dispatching.get() {
            return Ok(());
        }
        if !had || !self.afd.covered() {
            self.afd.arm(self.interest.get())?;
        }
        Ok(())
    }

    fn dispatch(&self, outcome: Readiness) -> Readiness {
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
            "datagram dispatch"
        );
        self.interest.set(self.interest.get() - outcome);
        let ev = outcome;
        let view = self.view();

        if ev.contains(Readiness::WRITABLE) && self.state.get() == DatagramState::Bound {
            self.callbacks.borrow_mut().on_writable(&view);
        }

        if ev.contains(Readiness::READABLE) && self.state.get() == DatagramState::Bound {
            self.callbacks.borrow_mut().on_readable(&view);
        }

        if ev.contains(Readiness::LOCAL_CLOSE) {
            self.state.set(DatagramState::Disconnected);
            self.interest.set(Readiness::empty());
            if !self.disconnect_delivered.get() {
                self.disconnect_delivered.set(true);
                debug!(slot = self.afd.slot(), "datagram disconnected");
                self.callbacks.borrow_mut().on_disconnected(&view);
            }
        }
    }
}

impl EventSink for DatagramShared {
    fn handle_events(&self, outcome: Readiness, _status: Option<io::Error>) -> Readiness {
        self.dispatch(outcome)
    }
}

impl Drop for DatagramShared {
    fn drop(&mut self) {
        let _ = self.afd.disassociate();
        if let Some(socket) = self.socket.borrow_mut().take() {
            let _ = socket.close();
        }
    }
}
