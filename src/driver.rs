//! The poll driver: one in-flight readiness request over a fixed slot
//! table.
//!
//! A [`PollDriver`] owns the descriptor buffers and status record shared
//! with the host poll device, a fixed-capacity table of slots (kernel
//! handle, interest mask, event sink), and the lifecycle of the single
//! request it keeps in flight. Endpoints reach their slot through a
//! [`DriverHandle`].
//!
//! Interest changes that arrive while a request is in flight cannot touch
//! the shared buffers; the driver cancels the outstanding request once and
//! re-issues a fresh poll covering all active slots after the aborted
//! completion drains. Completions dispatch to sinks in ascending slot
//! order, resolving compacted output entries back to slots by kernel
//! handle.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::device::{
    CompletionStatus, Cookie, PollDevice, PollEntry, PollRequest, PollSet, RawSock, StatusBlock,
    SubmitOutcome,
};
use crate::error::{Error, Result};
use crate::events::Readiness;

/// Per-socket event sink registered in a driver slot.
///
/// The driver holds a non-owning reference; the endpoint that registered
/// the sink keeps it alive and withdraws it by disassociating.
pub trait EventSink {
    /// Handle a readiness outcome for this sink's socket.
    ///
    /// `status` carries the translated per-socket status when the host
    /// reported one (a failed connect, for instance). Returns the residual
    /// interest mask; the driver records it and re-arms once the whole
    /// completion has been dispatched. Kernel polling is level-triggered,
    /// so the residual must not retain a condition the sink was just
    /// handed but did not consume, or the re-armed poll completes with
    /// it again immediately.
    fn handle_events(&self, outcome: Readiness, status: Option<io::Error>) -> Readiness;
}

/// What a consumed completion amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A readiness completion; the payload is the number of slots that
    /// received events.
    Events(usize),
    /// The aborted completion of a cancelled request.
    Aborted,
}

struct Slot {
    handle: RawSock,
    interest: Readiness,
    sink: Option<Weak<dyn EventSink>>,
    /// Whether the request currently in flight covers this slot.
    covered: bool,
}

impl Slot {
    const VACANT: Slot = Slot {
        handle: 0,
        interest: Readiness::empty(),
        sink: None,
        covered: false,
    };

    fn active(&self) -> bool {
        self.sink.is_some() && !self.interest.is_empty()
    }
}

struct DriverState {
    slots: Box<[Slot]>,
    in_flight: bool,
    cancel_requested: bool,
    /// A poll must be re-issued as soon as the driver is next idle.
    rearm_pending: bool,
}

/// Builder for a [`PollDriver`].
#[derive(Debug, Clone)]
pub struct PollDriverBuilder {
    capacity: usize,
    exclusive: bool,
}

impl Default for PollDriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PollDriverBuilder {
    pub fn new() -> Self {
        PollDriverBuilder {
            capacity: 64,
            exclusive: false,
        }
    }

    /// Fixed slot capacity of the driver. Default: 64.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Submit polls with the device's exclusive flag set, replacing any
    /// outstanding poll on the same socket. Default: off.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn build(self, device: Rc<dyn PollDevice>) -> Rc<PollDriver> {
        PollDriver::with_config(device, self.capacity, self.exclusive)
    }
}

/// A readiness poll driver over one host poll channel.
pub struct PollDriver {
    device: Rc<dyn PollDevice>,
    input: Rc<RefCell<PollSet>>,
    output: Rc<RefCell<PollSet>>,
    status: Rc<Cell<StatusBlock>>,
    state: RefCell<DriverState>,
    /// Sinks are being dispatched right now; submissions wait for the end
    /// of the iteration.
    dispatching: Cell<bool>,
}

impl PollDriver {
    /// Create a driver with `capacity` slots on the given device.
    pub fn new(device: Rc<dyn PollDevice>, capacity: usize) -> Rc<PollDriver> {
        Self::with_config(device, capacity, false)
    }

    /// Builder entry point.
    pub fn builder() -> PollDriverBuilder {
        PollDriverBuilder::new()
    }

    fn with_config(
        device: Rc<dyn PollDevice>,
        capacity: usize,
        exclusive: bool,
    ) -> Rc<PollDriver> {
        let mut input = PollSet::new(capacity);
        input.exclusive = exclusive;
        let slots = (0..capacity).map(|_| Slot::VACANT).collect::<Vec<_>>();
        Rc::new(PollDriver {
            device,
            input: Rc::new(RefCell::new(input)),
            output: Rc::new(RefCell::new(PollSet::new(capacity))),
            status: Rc::new(Cell::new(StatusBlock::default())),
            state: RefCell::new(DriverState {
                slots: slots.into_boxed_slice(),
                in_flight: false,
                cancel_requested: false,
                rearm_pending: false,
            }),
            dispatching: Cell::new(false),
        })
    }

    /// The identity this driver's completions carry: the address of its
    /// embedded status record.
    pub fn cookie(&self) -> Cookie {
        Rc::as_ptr(&self.status) as Cookie
    }

    /// Fixed slot capacity.
    pub fn capacity(&self) -> usize {
        self.state.borrow().slots.len()
    }

    /// Whether a request is currently in flight.
    pub fn in_flight(&self) -> bool {
        self.state.borrow().in_flight
    }

    /// Whether the in-flight request (if any) covers `slot`.
    pub fn slot_covered(&self, slot: usize) -> bool {
        let state = self.state.borrow();
        state.in_flight && state.slots.get(slot).is_some_and(|s| s.covered)
    }

    /// Number of slots with a registered sink.
    pub fn occupied_slots(&self) -> usize {
        self.state
            .borrow()
            .slots
            .iter()
            .filter(|s| s.sink.is_some())
            .count()
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        let capacity = self.capacity();
        if slot >= capacity {
            return Err(Error::InvalidSlot { slot, capacity });
        }
        Ok(())
    }

    /// Bind a socket's base handle and its event sink to `slot`.
    ///
    /// No poll is issued; the slot becomes active once armed with a
    /// non-empty interest mask.
    pub fn associate(
        &self,
        slot: usize,
        handle: RawSock,
        sink: Weak<dyn EventSink>,
    ) -> Result<()> {
        self.check_slot(slot)?;
        let mut state = self.state.borrow_mut();
        trace!(slot, handle, "associate");
        state.slots[slot] = Slot {
            handle,
            interest: Readiness::empty(),
            sink: Some(sink),
            covered: false,
        };
        Ok(())
    }

    /// Withdraw the socket and sink bound to `slot`.
    ///
    /// If the request in flight covers the slot, it is cancelled; the poll
    /// over the remaining slots is re-issued once the aborted completion
    /// drains.
    pub fn disassociate(&self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        let cancel = {
            let mut state = self.state.borrow_mut();
            trace!(slot, "disassociate");
            let covered = state.slots[slot].covered;
            state.slots[slot] = Slot::VACANT;
            if state.in_flight && covered {
                state.rearm_pending = true;
            }
            state.in_flight && covered
        };
        if cancel {
            self.request_cancel()?;
        }
        Ok(())
    }

    /// Record `interest` for `slot` and schedule a poll covering all
    /// active slots.
    ///
    /// Returns `true` when the host satisfied the poll synchronously and
    /// the outcome was dispatched before returning. Arming while a request
    /// is in flight cancels it and re-issues after the aborted completion
    /// drains; arming while a dispatch iteration is running defers to the
    /// end of that iteration. In both deferred cases the return value is
    /// `false`.
    pub fn arm(&self, slot: usize, interest: Readiness) -> Result<bool> {
        self.check_slot(slot)?;
        let deferred = {
            let mut state = self.state.borrow_mut();
            if state.slots[slot].sink.is_none() {
                return Err(Error::InvalidState {
                    op: "arm",
                    state: "vacant slot",
                });
            }
            state.slots[slot].interest = interest;
            if self.dispatching.get() || state.in_flight {
                state.rearm_pending = true;
            }
            self.dispatching.get() || state.in_flight
        };
        if deferred {
            // Mid-flight changes must not touch the shared buffers; cancel
            // the outstanding request and let the abort drain re-issue.
            if !self.dispatching.get() {
                self.request_cancel()?;
            }
            trace!(slot, ?interest, "arm deferred");
            return Ok(false);
        }
        if !self.any_active() {
            return Err(Error::EmptyInterest);
        }
        self.submit_active()
    }

    /// Ask the host to abort the in-flight request.
    ///
    /// The request still completes; its completion carries an aborted
    /// status and an all-zero outcome, and must be drained through
    /// [`handle_completion`](Self::handle_completion) before the driver is
    /// reusable.
    pub fn cancel(&self) -> Result<()> {
        if !self.state.borrow().in_flight {
            return Ok(());
        }
        self.request_cancel()
    }

    fn request_cancel(&self) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if !state.in_flight || state.cancel_requested {
                return Ok(());
            }
            state.cancel_requested = true;
        }
        debug!(cookie = self.cookie(), "cancel in-flight poll");
        self.device.cancel(self.cookie()).map_err(Error::Socket)
    }

    /// Consume the completion for this driver's in-flight request.
    ///
    /// Invoked by the demultiplexer when a record carrying this driver's
    /// cookie is pulled from the queue. Dispatches per-slot outcomes in
    /// ascending slot order, records each sink's residual interest, and
    /// re-arms exactly once if any interest remains.
    pub fn handle_completion(&self) -> Result<Dispatch> {
        {
            let mut state = self.state.borrow_mut();
            if !state.in_flight {
                warn!(cookie = self.cookie(), "completion for idle driver");
            }
            state.in_flight = false;
            for slot in state.slots.iter_mut() {
                slot.covered = false;
            }
        }
        self.device.finish(self.cookie());

        let request_status = self.status.get();
        match self.device.interpret(request_status.status) {
            CompletionStatus::Aborted => {
                debug!(cookie = self.cookie(), "aborted completion drained");
                let rearm = {
                    let mut state = self.state.borrow_mut();
                    state.cancel_requested = false;
                    std::mem::take(&mut state.rearm_pending)
                };
                if rearm && self.any_active() {
                    self.submit_active()?;
                }
                Ok(Dispatch::Aborted)
            }
            CompletionStatus::Failed(err) => {
                self.state.borrow_mut().cancel_requested = false;
                Err(Error::DriverFatal(err.to_string()))
            }
            CompletionStatus::Success => {
                self.state.borrow_mut().cancel_requested = false;
                let dispatched = self.process_output()?;
                {
                    let mut state = self.state.borrow_mut();
                    state.rearm_pending = false;
                }
                if self.any_active() {
                    self.submit_active()?;
                }
                Ok(Dispatch::Events(dispatched))
            }
        }
    }

    fn any_active(&self) -> bool {
        self.state.borrow().slots.iter().any(Slot::active)
    }

    /// Build the input descriptor from the slot table. Returns `false`
    /// when no slot is active.
    fn build_input(&self) -> bool {
        let mut state = self.state.borrow_mut();
        let mut highest = None;
        for (i, slot) in state.slots.iter_mut().enumerate() {
            slot.covered = slot.active();
            if slot.covered {
                highest = Some(i);
            }
        }
        let Some(highest) = highest else {
            return false;
        };

        let mut input = self.input.borrow_mut();
        let entries = input.entries_mut();
        for (i, slot) in state.slots.iter().enumerate() {
            entries[i] = if slot.covered {
                PollEntry {
                    handle: slot.handle,
                    events: slot.interest,
                    status: 0,
                }
            } else {
                PollEntry::default()
            };
        }
        input.set_len(highest + 1);
        drop(input);

        self.output.borrow_mut().clear();
        self.status.set(StatusBlock::default());
        true
    }

    /// Issue one poll over the active slots, dispatching inline for as
    /// long as the host keeps satisfying the request synchronously.
    fn submit_active(&self) -> Result<bool> {
        let mut dispatched_any = false;
        loop {
            if !self.build_input() {
                return Ok(dispatched_any);
            }
            let request = PollRequest {
                input: self.input.clone(),
                output: self.output.clone(),
                status: self.status.clone(),
                cookie: self.cookie(),
            };
            debug!(
                cookie = request.cookie,
                covered = self.input.borrow().len(),
                "submit poll"
            );
            match self.device.submit(&request).map_err(Error::Socket)? {
                SubmitOutcome::Pending => {
                    self.state.borrow_mut().in_flight = true;
                    return Ok(dispatched_any);
                }
                SubmitOutcome::Immediate => {
                    for slot in self.state.borrow_mut().slots.iter_mut() {
                        slot.covered = false;
                    }
                    match self.device.interpret(self.status.get().status) {
                        CompletionStatus::Failed(err) => {
                            return Err(Error::DriverFatal(err.to_string()));
                        }
                        CompletionStatus::Aborted => return Ok(dispatched_any),
                        CompletionStatus::Success => {
                            self.process_output()?;
                            dispatched_any = true;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch the output descriptor to the slot sinks.
    ///
    /// The host may compact the output, so entries are resolved back to
    /// slots by kernel handle; active-slot lookup keeps this linear in the
    /// number of active slots. Sinks are invoked without any driver borrow
    /// held, so a sink destroying its endpoint (disassociating its own or
    /// another slot) leaves the remaining iteration intact.
    fn process_output(&self) -> Result<usize> {
        let entries: Vec<PollEntry> = {
            let output = self.output.borrow();
            output.entries().to_vec()
        };

        self.dispatching.set(true);
        let mut dispatched = 0usize;
        for (out_index, entry) in entries.iter().enumerate() {
            if entry.events.is_empty() && entry.status == 0 {
                continue;
            }
            let resolved = {
                let state = self.state.borrow();
                self.resolve_slot(&state, out_index, entry.handle)
                    .map(|slot| (slot, state.slots[slot].sink.clone()))
            };
            let Some((slot, Some(weak))) = resolved else {
                trace!(handle = entry.handle, "outcome for unassociated handle");
                continue;
            };
            let Some(sink) = weak.upgrade() else {
                continue;
            };

            let status = match self.device.interpret(entry.status) {
                CompletionStatus::Success | CompletionStatus::Aborted => None,
                CompletionStatus::Failed(err) => Some(err),
            };
            trace!(slot, outcome = ?entry.events, "dispatch");
            let residual = sink.handle_events(entry.events, status);

            let mut state = self.state.borrow_mut();
            if state.slots[slot].sink.is_some() {
                state.slots[slot].interest = residual;
            }
            dispatched += 1;
        }
        self.dispatching.set(false);
        Ok(dispatched)
    }

    /// Map an output entry back to its slot.
    ///
    /// Fast path: the host preserved positions and the handle matches.
    /// Otherwise scan the occupied slots for the handle.
    fn resolve_slot(&self, state: &DriverState, out_index: usize, handle: RawSock) -> Option<usize> {
        if handle == 0 {
            return None;
        }
        if let Some(slot) = state.slots.get(out_index)
            && slot.sink.is_some()
            && slot.handle == handle
        {
            return Some(out_index);
        }
        state
            .slots
            .iter()
            .position(|s| s.sink.is_some() && s.handle == handle)
    }
}

impl Drop for PollDriver {
    fn drop(&mut self) {
        if self.state.borrow().in_flight {
            let _ = self.device.cancel(self.cookie());
        }
    }
}

/// An endpoint's view of one slot in a driver.
#[derive(Clone)]
pub struct DriverHandle {
    driver: Rc<PollDriver>,
    slot: usize,
}

impl DriverHandle {
    pub fn new(driver: &Rc<PollDriver>, slot: usize) -> DriverHandle {
        DriverHandle {
            driver: driver.clone(),
            slot,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn driver(&self) -> &Rc<PollDriver> {
        &self.driver
    }

    pub fn associate(&self, handle: RawSock, sink: Weak<dyn EventSink>) -> Result<()> {
        self.driver.associate(self.slot, handle, sink)
    }

    pub fn disassociate(&self) -> Result<()> {
        self.driver.disassociate(self.slot)
    }

    pub fn arm(&self, interest: Readiness) -> Result<bool> {
        self.driver.arm(self.slot, interest)
    }

    /// Whether a poll covering this slot is in flight.
    pub fn covered(&self) -> bool {
        self.driver.slot_covered(self.slot)
    }
}
