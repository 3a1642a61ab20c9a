//! Connection-oriented stream endpoint.
//!
//! A [`StreamSocket`] drives one connection through its lifecycle
//! (connect or adopt-accepted, read, write, half-close, close) and
//! translates readiness outcomes into [`StreamCallbacks`] invocations.
//! Kernel-side polling is level-triggered; the endpoint strips each
//! handled condition from its interest mask so callbacks see edges, and
//! `read`/`write` re-add the corresponding condition when they run into
//! the non-blocking limit.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::driver::{DriverHandle, EventSink};
use crate::error::{Error, Result};
use crate::events::Readiness;
use crate::sock::{SocketOps, is_connection_error, is_would_block};

/// Callbacks for a stream endpoint.
///
/// All callbacks run on the event-loop thread, strictly serialized per
/// endpoint. A callback may call back into the endpoint it was handed
/// (`read`, `write`, `close`, `shutdown`); such calls update the interest
/// mask but never re-arm mid-dispatch; the driver re-arms once the whole
/// completion has been handled.
pub trait StreamCallbacks {
    /// The connection attempt (or adopted accept) completed.
    fn on_connected(&mut self, sock: &StreamSocket) {
        let _ = sock;
    }

    /// The connection attempt failed; the endpoint is now disconnected.
    fn on_connection_failed(&mut self, sock: &StreamSocket, error: io::Error) {
        let _ = (sock, error);
    }

    /// Data can be read without blocking.
    fn on_readable(&mut self, sock: &StreamSocket) {
        let _ = sock;
    }

    /// Out-of-band data can be read.
    fn on_readable_oob(&mut self, sock: &StreamSocket) {
        let _ = sock;
    }

    /// The socket can accept more outgoing data.
    fn on_writable(&mut self, sock: &StreamSocket) {
        let _ = sock;
    }

    /// The peer shut down its sending side.
    fn on_client_close(&mut self, sock: &StreamSocket) {
        let _ = sock;
    }

    /// The connection was reset; the endpoint is now disconnected.
    fn on_connection_reset(&mut self, sock: &StreamSocket) {
        let _ = sock;
    }

    /// The socket was closed locally; terminal.
    fn on_disconnected(&mut self, sock: &StreamSocket) {
        let _ = sock;
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    PendingConnect,
    PendingAccept,
    Connected,
    PeerClosed,
    Disconnected,
}

impl StreamState {
    fn name(self) -> &'static str {
        match self {
            StreamState::Created => "created",
            StreamState::PendingConnect => "pending-connect",
            StreamState::PendingAccept => "pending-accept",
            StreamState::Connected => "connected",
            StreamState::PeerClosed => "peer-closed",
            StreamState::Disconnected => "disconnected",
        }
    }

    fn is_pending(self) -> bool {
        matches!(self, StreamState::PendingConnect | StreamState::PendingAccept)
    }

    fn readable(self) -> bool {
        matches!(self, StreamState::Connected | StreamState::PeerClosed)
    }
}

struct StreamShared {
    me: Weak<StreamShared>,
    afd: DriverHandle,
    socket: RefCell<Option<Box<dyn SocketOps>>>,
    callbacks: RefCell<Box<dyn StreamCallbacks>>,
    state: Cell<StreamState>,
    interest: Cell<Readiness>,
    /// A dispatch for this endpoint is on the stack.
    dispatching: Cell<bool>,
    /// Conditions synthesized during a dispatch, handled when the current
    /// rule pass finishes so callbacks stay serialized.
    queued: Cell<Readiness>,
    /// `on_disconnected` has been delivered.
    disconnect_delivered: Cell<bool>,
}

/// A stream socket endpoint bound to one driver slot.
///
/// Handles are cheap clones of one shared endpoint; the underlying socket
/// closes and the slot disassociates when the last handle drops.
#[derive(Clone)]
pub struct StreamSocket {
    shared: Rc<StreamShared>,
}

impl StreamSocket {
    /// Bind `socket` into the driver slot behind `afd` and register the
    /// callback object. The endpoint starts in the `created` state.
    pub fn new(
        afd: DriverHandle,
        socket: Box<dyn SocketOps>,
        callbacks: Box<dyn StreamCallbacks>,
    ) -> Result<StreamSocket> {
        let base = socket.base_handle();
        let shared = Rc::new_cyclic(|me| StreamShared {
            me: me.clone(),
            afd,
            socket: RefCell::new(Some(socket)),
            callbacks: RefCell::new(callbacks),
            state: Cell::new(StreamState::Created),
            interest: Cell::new(Readiness::empty()),
            dispatching: Cell::new(false),
            queued: Cell::new(Readiness::empty()),
            disconnect_delivered: Cell::new(false),
        });
        let sink: Rc<dyn EventSink> = shared.clone();
        shared.afd.associate(base, Rc::downgrade(&sink))?;
        Ok(StreamSocket { shared })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.shared.state.get()
    }

    /// The interest mask the endpoint last requested.
    pub fn interest(&self) -> Readiness {
        self.shared.interest.get()
    }

    /// Issue a non-blocking connect and arm the full interest set.
    ///
    /// Resolution arrives as exactly one of `on_connected` or
    /// `on_connection_failed`.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        let sh = &self.shared;
        if sh.state.get() != StreamState::Created {
            return Err(Error::InvalidState {
                op: "connect",
                state: sh.state.get().name(),
            });
        }
        {
            let socket = sh.socket.borrow();
            let socket = socket.as_ref().expect("created endpoint holds its socket");
            match socket.connect(addr) {
                Ok(()) => {}
                Err(e) if is_would_block(&e) => {}
                Err(e) => return Err(Error::Socket(e)),
            }
        }
        sh.state.set(StreamState::PendingConnect);
        sh.interest.set(Readiness::ALL);
        debug!(slot = sh.afd.slot(), %addr, "connect issued");
        sh.afd.arm(Readiness::ALL)?;
        Ok(())
    }

    /// Adopt an already-accepted connection.
    ///
    /// The endpoint enters `pending-accept` and arms the full interest
    /// set; `on_connected` fires on the writable edge.
    pub fn accepted(&self) -> Result<()> {
        let sh = &self.shared;
        if sh.state.get() != StreamState::Created {
            return Err(Error::InvalidState {
                op: "accepted",
                state: sh.state.get().name(),
            });
        }
        sh.state.set(StreamState::PendingAccept);
        sh.interest.set(Readiness::ALL);
        debug!(slot = sh.afd.slot(), "adopting accepted connection");
        sh.afd.arm(Readiness::ALL)?;
        Ok(())
    }

    /// Attempt an immediate non-blocking send.
    ///
    /// Returns the bytes actually accepted. A short or refused write adds
    /// writable interest so `on_writable` follows when the socket drains;
    /// a connection error during send reports zero bytes and is observed
    /// through the poll channel.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let sh = &self.shared;
        if sh.state.get() != StreamState::Connected {
            return Err(Error::InvalidState {
                op: "write",
                state: sh.state.get().name(),
            });
        }
        let result = {
            let socket = sh.socket.borrow();
            let Some(socket) = socket.as_ref() else {
                return Err(Error::InvalidState {
                    op: "write",
                    state: "closed",
                });
            };
            socket.send(data)
        };
        let bytes = match result {
            Ok(n) => n,
            Err(e) if is_would_block(&e) || is_connection_error(&e) => 0,
            Err(e) => return Err(Error::Socket(e)),
        };
        if bytes != data.len() {
            trace!(slot = sh.afd.slot(), bytes, requested = data.len(), "short write");
            sh.add_interest(Readiness::WRITABLE)?;
        }
        Ok(bytes)
    }

    /// Attempt an immediate non-blocking receive.
    ///
    /// Returns zero both when nothing is available and when the peer has
    /// closed; the distinction arrives through `on_client_close`. A zero
    /// read guarantees readable interest is re-armed so a later peer send
    /// cannot be missed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let sh = &self.shared;
        if !sh.state.get().readable() {
            return Err(Error::InvalidState {
                op: "read",
                state: sh.state.get().name(),
            });
        }
        let result = {
            let socket = sh.socket.borrow();
            let Some(socket) = socket.as_ref() else {
                return Err(Error::InvalidState {
                    op: "read",
                    state: "closed",
                });
            };
            socket.recv(buf)
        };
        let bytes = match result {
            Ok(n) => n,
            Err(e) if is_would_block(&e) || is_connection_error(&e) => 0,
            Err(e) => return Err(Error::Socket(e)),
        };
        if bytes == 0 {
            sh.add_interest(Readiness::READABLE)?;
        }
        Ok(bytes)
    }

    /// Close the underlying socket.
    ///
    /// If a poll is in flight the host observes the close and delivers
    /// `local-closed` through it; otherwise the condition is synthesized
    /// so `on_disconnected` still fires. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let sh = &self.shared;
        let Some(socket) = sh.socket.borrow_mut().take() else {
            return Ok(());
        };
        let poll_outstanding = sh.afd.covered();
        debug!(slot = sh.afd.slot(), poll_outstanding, "close");
        socket.close().map_err(Error::Socket)?;
        drop(socket);
        if sh.dispatching.get() {
            sh.queued.set(sh.queued.get() | Readiness::LOCAL_CLOSE);
        } else if !poll_outstanding {
            sh.dispatch(Readiness::LOCAL_CLOSE, None);
        }
        Ok(())
    }

    /// Half-close one or both directions.
    ///
    /// Local half-closes generate no callback; in particular a
    /// receive-side shutdown produces no readiness event at all.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let sh = &self.shared;
        if !sh.state.get().readable() {
            return Err(Error::InvalidState {
                op: "shutdown",
                state: sh.state.get().name(),
            });
        }
        let socket = sh.socket.borrow();
        let Some(socket) = socket.as_ref() else {
            return Err(Error::InvalidState {
                op: "shutdown",
                state: "closed",
            });
        };
        socket.shutdown(how).map_err(Error::Socket)
    }
}

impl StreamShared {
    fn view(&self) -> StreamSocket {
        StreamSocket {
            shared: self.me.upgrade().expect("dispatch keeps the endpoint alive"),
        }
    }

    /// Add a condition to the interest mask and guarantee a poll covers
    /// it, re-arming unless a dispatch is in progress (the driver re-arms
    /// once per completion).
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

    fn dispatch(&self, outcome: Readiness, status: Option<io::Error>) -> Readiness {
        self.dispatching.set(true);
        self.run_rules(outcome, status);
        loop {
            let queued = self.queued.take();
            if queued.is_empty() {
                break;
            }
            self.run_rules(queued, None);
        }
        self.dispatching.set(false);
        self.interest.get()
    }

    /// Apply the event translation rules, in order, against the state the
    /// endpoint is in when each rule is reached.
    fn run_rules(&self, outcome: Readiness, mut status: Option<io::Error>) {
        trace!(
            slot = self.afd.slot(),
            ?outcome,
            state = self.state.get().name(),
            "dispatch"
        );
        // Delivered conditions consume their interest; callbacks re-add
        // what they still want.
        self.interest.set(self.interest.get() - outcome);
        let mut ev = outcome;
        let view = self.view();

        if ev.contains(Readiness::CONNECT_FAIL) && self.state.get().is_pending() {
            ev.remove(Readiness::CONNECT_FAIL);
            self.state.set(StreamState::Disconnected);
            self.interest.set(Readiness::empty());
            let error = status
                .take()
                .unwrap_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused));
            debug!(slot = self.afd.slot(), %error, "connection failed");
            self.callbacks.borrow_mut().on_connection_failed(&view, error);
        }

        if ev.contains(Readiness::WRITABLE) && self.state.get().is_pending() {
            ev.remove(Readiness::WRITABLE);
            self.state.set(StreamState::Connected);
            debug!(slot = self.afd.slot(), "connected");
            self.callbacks.borrow_mut().on_connected(&view);
        }

        if ev.contains(Readiness::WRITABLE) && self.state.get() == StreamState::Connected {
            ev.remove(Readiness::WRITABLE);
            self.callbacks.borrow_mut().on_writable(&view);
        }

        if ev.contains(Readiness::READABLE) && self.state.get().readable() {
            self.callbacks.borrow_mut().on_readable(&view);
        }

        if ev.contains(Readiness::READABLE_OOB) && self.state.get().readable() {
            self.callbacks.borrow_mut().on_readable_oob(&view);
        }

        if ev.contains(Readiness::RESET) && self.state.get() != StreamState::Disconnected {
            self.state.set(StreamState::Disconnected);
            self.interest.set(Readiness::empty());
            debug!(slot = self.afd.slot(), "connection reset");
            self.callbacks.borrow_mut().on_connection_reset(&view);
        }

        if ev.contains(Readiness::PEER_CLOSED) && self.state.get() == StreamState::Connected {
            debug!(slot = self.afd.slot(), "peer closed");
            self.callbacks.borrow_mut().on_client_close(&view);
            if self.state.get() == StreamState::Connected {
                self.state.set(StreamState::PeerClosed);
            }
        }

        if ev.contains(Readiness::LOCAL_CLOSE) {
            self.state.set(StreamState::Disconnected);
            self.interest.set(Readiness::empty());
            if !self.disconnect_delivered.get() {
                self.disconnect_delivered.set(true);
                debug!(slot = self.afd.slot(), "disconnected");
                self.callbacks.borrow_mut().on_disconnected(&view);
            }
        }
    }
}

impl EventSink for StreamShared {
    fn handle_events(&self, outcome: Readiness, status: Option<io::Error>) -> Readiness {
        self.dispatch(outcome, status)
    }
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        let _ = self.afd.disassociate();
        if let Some(socket) = self.socket.borrow_mut().take() {
            let _ = socket.close();
        }
    }
}
