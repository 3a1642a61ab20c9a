//! A deterministic in-memory host.
//!
//! `SimNet` models the three collaborator surfaces (poll channel,
//! completion queue, and non-blocking sockets) inside one process, with
//! no wall-clock dependence: readiness is re-evaluated after every state
//! change and completions are delivered in a fixed order. The test suite
//! drives the reactor against it; fault injection and abortive closes
//! cover paths a live network makes awkward to reproduce.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use slab::Slab;

use crate::device::{
    CompletionStatus, Cookie, PollDevice, PollEntry, PollRequest, RawSock, StatusBlock,
    SubmitOutcome,
};
use crate::events::Readiness;
use crate::queue::{CompletionQueue, CompletionRecord};
use crate::sock::SocketOps;

/// Request-wide and per-socket status codes used by the simulated host.
pub mod status {
    /// Completed with a readiness outcome.
    pub const OK: i32 = 0;
    /// Cancelled before any condition became true.
    pub const ABORTED: i32 = 1;
    /// The connection attempt was refused.
    pub const REFUSED: i32 = 0x10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockKind {
    Stream,
    Datagram,
}

#[derive(Debug)]
enum ConnState {
    Idle,
    Listening {
        backlog: usize,
        pending: VecDeque<usize>,
    },
    Connected {
        peer: usize,
    },
    Refused,
}

struct SockState {
    kind: SockKind,
    open: bool,
    bound: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    conn: ConnState,
    rcv: VecDeque<u8>,
    oob: VecDeque<u8>,
    dgrams: VecDeque<(Vec<u8>, SocketAddr)>,
    rcvbuf: usize,
    dgram_cap: usize,
    fin_received: bool,
    fin_sent: bool,
    reset: bool,
    /// Datagram socket whose last send was refused because this target's
    /// buffer was full; writability returns once it drains.
    blocked_on: Option<usize>,
}

impl SockState {
    fn new(kind: SockKind, rcvbuf: usize) -> SockState {
        SockState {
            kind,
            open: true,
            bound: None,
            peer_addr: None,
            conn: ConnState::Idle,
            rcv: VecDeque::new(),
            oob: VecDeque::new(),
            dgrams: VecDeque::new(),
            rcvbuf,
            dgram_cap: 16,
            fin_received: false,
            fin_sent: false,
            reset: false,
            blocked_on: None,
        }
    }
}

struct PendingPoll {
    request: PollRequest,
    tag: u64,
    queue: Weak<SimQueue>,
}

struct Host {
    socks: Slab<SockState>,
    tcp_listeners: HashMap<SocketAddr, usize>,
    udp_bound: HashMap<SocketAddr, usize>,
    pending: Vec<PendingPoll>,
    next_eph: u16,
    next_tag: u64,
    default_rcvbuf: usize,
    fail_next_poll: Option<i32>,
}

impl Host {
    fn id_of(&self, handle: RawSock) -> Option<usize> {
        let id = (handle as usize).checked_sub(1)?;
        self.socks.contains(id).then_some(id)
    }

    fn ephemeral_addr(&mut self) -> SocketAddr {
        let port = self.next_eph;
        self.next_eph = self.next_eph.wrapping_add(1).max(49152);
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    /// Current readiness of a socket, with the per-socket status that
    /// accompanies it in an output descriptor.
    fn readiness(&self, id: usize) -> (Readiness, i32) {
        let s = &self.socks[id];
        if !s.open {
            return (Readiness::LOCAL_CLOSE, status::OK);
        }
        let mut ready = Readiness::empty();
        let mut slot_status = status::OK;
        match s.kind {
            SockKind::Stream => match &s.conn {
                ConnState::Listening { pending, .. } => {
                    if !pending.is_empty() {
                        ready |= Readiness::ACCEPT;
                    }
                }
                ConnState::Connected { peer } => {
                    if s.reset {
                        // A send on a reset connection fails without
                        // blocking, so the socket reports writable
                        // alongside the reset.
                        ready |= Readiness::RESET | Readiness::WRITABLE;
                    }
                    if s.fin_received {
                        ready |= Readiness::PEER_CLOSED;
                    }
                    if !s.rcv.is_empty() {
                        ready |= Readiness::READABLE;
                    }
                    if !s.oob.is_empty() {
                        ready |= Readiness::READABLE_OOB;
                    }
                    if !s.reset && !s.fin_sent {
                        let peer_free = self
                            .socks
                            .get(*peer)
                            .filter(|p| p.open)
                            .map(|p| p.rcvbuf.saturating_sub(p.rcv.len()))
                            .unwrap_or(0);
                        if peer_free > 0 {
                            ready |= Readiness::WRITABLE;
                        }
                    }
                }
                ConnState::Refused => {
                    ready |= Readiness::CONNECT_FAIL;
                    slot_status = status::REFUSED;
                }
                ConnState::Idle => {}
            },
            SockKind::Datagram => {
                let unblocked = s.blocked_on.is_none_or(|target| {
                    self.socks
                        .get(target)
                        .is_none_or(|t| t.dgrams.len() < t.dgram_cap)
                });
                if unblocked {
                    ready |= Readiness::WRITABLE;
                }
                if !s.dgrams.is_empty() {
                    ready |= Readiness::READABLE;
                }
            }
        }
        (ready, slot_status)
    }

    /// Evaluate one poll request against current socket state. The output
    /// is compacted: only entries with a visible outcome appear, in input
    /// order.
    fn evaluate(&self, request: &PollRequest) -> Vec<PollEntry> {
        let input = request.input.borrow();
        let mut out = Vec::new();
        for entry in input.entries() {
            if entry.handle == 0 || entry.events.is_empty() {
                continue;
            }
            let Some(id) = self.id_of(entry.handle) else {
                continue;
            };
            let (ready, slot_status) = self.readiness(id);
            let visible = ready & entry.events;
            if visible.is_empty() {
                continue;
            }
            out.push(PollEntry {
                handle: entry.handle,
                events: visible,
                status: if visible.contains(Readiness::CONNECT_FAIL) {
                    slot_status
                } else {
                    status::OK
                },
            });
        }
        out
    }

    fn write_outcome(request: &PollRequest, entries: &[PollEntry], code: i32) -> u32 {
        {
            let mut output = request.output.borrow_mut();
            for (i, entry) in entries.iter().enumerate() {
                output.entries_mut()[i] = *entry;
            }
            output.set_len(entries.len());
        }
        let bytes = (entries.len() * std::mem::size_of::<PollEntry>()) as u32;
        request.status.set(StatusBlock {
            status: code,
            information: bytes as usize,
        });
        bytes
    }

    /// Complete the pending poll at `idx` and deliver its record.
    fn finish_poll(&mut self, idx: usize, entries: &[PollEntry], code: i32) {
        let p = self.pending.remove(idx);
        let bytes = Self::write_outcome(&p.request, entries, code);
        if let Some(queue) = p.queue.upgrade() {
            queue.push(CompletionRecord {
                bytes,
                tag: p.tag,
                cookie: p.request.cookie,
            });
        }
    }

    /// Re-evaluate every pending poll after a state change.
    fn pump(&mut self) {
        let mut idx = 0;
        while idx < self.pending.len() {
            let entries = self.evaluate(&self.pending[idx].request);
            if entries.is_empty() {
                idx += 1;
            } else {
                self.finish_poll(idx, &entries, status::OK);
            }
        }
    }
}

/// Completion queue of the simulated host.
///
/// Never blocks: an empty queue reports a timeout immediately, keeping
/// tests deterministic.
pub struct SimQueue {
    records: RefCell<VecDeque<CompletionRecord>>,
}

impl SimQueue {
    fn push(&self, record: CompletionRecord) {
        self.records.borrow_mut().push_back(record);
    }

    /// Records currently waiting to be pulled.
    pub fn depth(&self) -> usize {
        self.records.borrow().len()
    }
}

impl CompletionQueue for SimQueue {
    fn wait(&self, _timeout: Option<Duration>) -> io::Result<Option<CompletionRecord>> {
        Ok(self.records.borrow_mut().pop_front())
    }

    fn wait_batch(
        &self,
        max: usize,
        _timeout: Option<Duration>,
    ) -> io::Result<Vec<CompletionRecord>> {
        let mut records = self.records.borrow_mut();
        let n = records.len().min(max);
        Ok(records.drain(..n).collect())
    }
}

/// Poll channel of the simulated host, bound to one [`SimQueue`].
pub struct SimDevice {
    host: Rc<RefCell<Host>>,
    queue: Rc<SimQueue>,
    tag: u64,
}

impl PollDevice for SimDevice {
    fn tag(&self) -> u64 {
        self.tag
    }

    fn submit(&self, request: &PollRequest) -> io::Result<SubmitOutcome> {
        let mut host = self.host.borrow_mut();

        if let Some(code) = host.fail_next_poll.take() {
            Host::write_outcome(request, &[], code);
            return Ok(SubmitOutcome::Immediate);
        }

        // Replace-semantics: an exclusive poll aborts outstanding polls
        // from the same channel that cover any of the same sockets.
        if request.input.borrow().exclusive {
            let handles: Vec<RawSock> = request
                .input
                .borrow()
                .entries()
                .iter()
                .map(|e| e.handle)
                .filter(|&h| h != 0)
                .collect();
            let mut idx = 0;
            while idx < host.pending.len() {
                let overlaps = host.pending[idx].tag == self.tag
                    && host.pending[idx]
                        .request
                        .input
                        .borrow()
                        .entries()
                        .iter()
                        .any(|e| e.handle != 0 && handles.contains(&e.handle));
                if overlaps {
                    host.finish_poll(idx, &[], status::ABORTED);
                } else {
                    idx += 1;
                }
            }
        }

        let entries = host.evaluate(request);
        if !entries.is_empty() {
            Host::write_outcome(request, &entries, status::OK);
            return Ok(SubmitOutcome::Immediate);
        }

        host.pending.push(PendingPoll {
            request: request.clone(),
            tag: self.tag,
            queue: Rc::downgrade(&self.queue),
        });
        Ok(SubmitOutcome::Pending)
    }

    fn cancel(&self, cookie: Cookie) -> io::Result<()> {
        let mut host = self.host.borrow_mut();
        if let Some(idx) = host
            .pending
            .iter()
            .position(|p| p.request.cookie == cookie)
        {
            host.finish_poll(idx, &[], status::ABORTED);
        }
        Ok(())
    }

    fn interpret(&self, raw: i32) -> CompletionStatus {
        match raw {
            status::OK => CompletionStatus::Success,
            status::ABORTED => CompletionStatus::Aborted,
            status::REFUSED => CompletionStatus::Failed(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )),
            other => {
                CompletionStatus::Failed(io::Error::other(format!("device fault {other:#06x}")))
            }
        }
    }
}

/// Handle onto a simulated host instance.
#[derive(Clone)]
pub struct SimNet {
    host: Rc<RefCell<Host>>,
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNet {
    pub fn new() -> SimNet {
        SimNet {
            host: Rc::new(RefCell::new(Host {
                socks: Slab::new(),
                tcp_listeners: HashMap::new(),
                udp_bound: HashMap::new(),
                pending: Vec::new(),
                next_eph: 49152,
                next_tag: 1,
                default_rcvbuf: 64 * 1024,
                fail_next_poll: None,
            })),
        }
    }

    /// Create a completion queue.
    pub fn queue(&self) -> Rc<SimQueue> {
        Rc::new(SimQueue {
            records: RefCell::new(VecDeque::new()),
        })
    }

    /// Open a poll channel delivering to `queue`.
    pub fn device(&self, queue: &Rc<SimQueue>) -> Rc<SimDevice> {
        let tag = {
            let mut host = self.host.borrow_mut();
            let tag = host.next_tag;
            host.next_tag += 1;
            tag
        };
        Rc::new(SimDevice {
            host: self.host.clone(),
            queue: queue.clone(),
            tag,
        })
    }

    /// Create a non-blocking stream socket.
    pub fn stream(&self) -> SimSocket {
        self.socket(SockKind::Stream)
    }

    /// Create a non-blocking datagram socket.
    pub fn datagram(&self) -> SimSocket {
        self.socket(SockKind::Datagram)
    }

    fn socket(&self, kind: SockKind) -> SimSocket {
        let mut host = self.host.borrow_mut();
        let rcvbuf = host.default_rcvbuf;
        let id = host.socks.insert(SockState::new(kind, rcvbuf));
        SimSocket {
            host: self.host.clone(),
            id,
        }
    }

    /// Shrink or grow a socket's receive buffer (back-pressure modeling).
    pub fn set_recv_buffer(&self, handle: RawSock, bytes: usize) {
        let mut host = self.host.borrow_mut();
        if let Some(id) = host.id_of(handle) {
            host.socks[id].rcvbuf = bytes;
            host.pump();
        }
    }

    /// Cap the number of datagrams a socket buffers before senders see
    /// the non-blocking limit.
    pub fn set_dgram_capacity(&self, handle: RawSock, dgrams: usize) {
        let mut host = self.host.borrow_mut();
        if let Some(id) = host.id_of(handle) {
            host.socks[id].dgram_cap = dgrams;
            host.pump();
        }
    }

    /// Abortively close a socket (the linger-zero path): the peer observes
    /// a reset instead of an orderly shutdown.
    pub fn abort(&self, handle: RawSock) {
        let mut host = self.host.borrow_mut();
        let Some(id) = host.id_of(handle) else { return };
        host.socks[id].open = false;
        if let Some(addr) = host.socks[id].bound {
            host.tcp_listeners.remove(&addr);
        }
        if let ConnState::Connected { peer } = host.socks[id].conn {
            if host.socks.contains(peer) {
                host.socks[peer].reset = true;
            }
        }
        host.pump();
    }

    /// Deliver out-of-band data to a socket.
    pub fn push_oob(&self, handle: RawSock, data: &[u8]) {
        let mut host = self.host.borrow_mut();
        let Some(id) = host.id_of(handle) else { return };
        host.socks[id].oob.extend(data.iter().copied());
        host.pump();
    }

    /// Fail the next submitted poll with the given request status.
    pub fn fail_next_poll(&self, code: i32) {
        self.host.borrow_mut().fail_next_poll = Some(code);
    }

    /// Number of polls currently pending in the host.
    pub fn pending_poll_count(&self) -> usize {
        self.host.borrow().pending.len()
    }
}

/// A virtual non-blocking socket in a [`SimNet`].
pub struct SimSocket {
    host: Rc<RefCell<Host>>,
    id: usize,
}

impl SimSocket {
    fn with_host<T>(&self, f: impl FnOnce(&mut Host) -> T) -> T {
        f(&mut self.host.borrow_mut())
    }
}

impl SocketOps for SimSocket {
    fn base_handle(&self) -> RawSock {
        (self.id + 1) as RawSock
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.with_host(|host| {
            let kind = host.socks[self.id].kind;
            let taken = match kind {
                SockKind::Stream => host.tcp_listeners.contains_key(&addr),
                SockKind::Datagram => host.udp_bound.contains_key(&addr),
            };
            if taken {
                return Err(io::Error::from(io::ErrorKind::AddrInUse));
            }
            let addr = if addr.port() == 0 {
                host.ephemeral_addr()
            } else {
                addr
            };
            host.socks[self.id].bound = Some(addr);
            if kind == SockKind::Datagram {
                host.udp_bound.insert(addr, self.id);
            }
            host.pump();
            Ok(())
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.with_host(|host| {
            host.socks[self.id]
                .bound
                .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
        })
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        self.with_host(|host| {
            let Some(addr) = host.socks[self.id].bound else {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            };
            host.socks[self.id].conn = ConnState::Listening {
                backlog: backlog.max(1) as usize,
                pending: VecDeque::new(),
            };
            host.tcp_listeners.insert(addr, self.id);
            host.pump();
            Ok(())
        })
    }

    fn accept(&self) -> io::Result<(Box<dyn SocketOps>, SocketAddr)> {
        let host_rc = self.host.clone();
        self.with_host(|host| {
            let accepted = match &mut host.socks[self.id].conn {
                ConnState::Listening { pending, .. } => pending.pop_front(),
                _ => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
            };
            let Some(peer_id) = accepted else {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            };
            let peer_addr = host.socks[peer_id]
                .peer_addr
                .expect("accepted socket has a peer address");
            host.pump();
            let sock: Box<dyn SocketOps> = Box::new(SimSocket {
                host: host_rc,
                id: peer_id,
            });
            Ok((sock, peer_addr))
        })
    }

    fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        self.with_host(|host| {
            if !matches!(host.socks[self.id].conn, ConnState::Idle) {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            let local = match host.socks[self.id].bound {
                Some(a) => a,
                None => {
                    let a = host.ephemeral_addr();
                    host.socks[self.id].bound = Some(a);
                    a
                }
            };

            let listener = host.tcp_listeners.get(&addr).copied().and_then(|lid| {
                match &host.socks[lid].conn {
                    ConnState::Listening { backlog, pending }
                        if host.socks[lid].open && pending.len() < *backlog =>
                    {
                        Some(lid)
                    }
                    _ => None,
                }
            });

            match listener {
                Some(lid) => {
                    let rcvbuf = host.default_rcvbuf;
                    let mut server = SockState::new(SockKind::Stream, rcvbuf);
                    server.bound = Some(addr);
                    server.peer_addr = Some(local);
                    server.conn = ConnState::Connected { peer: self.id };
                    let sid = host.socks.insert(server);

                    host.socks[self.id].conn = ConnState::Connected { peer: sid };
                    host.socks[self.id].peer_addr = Some(addr);
                    if let ConnState::Listening { pending, .. } = &mut host.socks[lid].conn {
                        pending.push_back(sid);
                    }
                }
                None => {
                    host.socks[self.id].conn = ConnState::Refused;
                }
            }
            host.pump();
            // The attempt resolves through readiness, as a non-blocking
            // connect does.
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        })
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.with_host(|host| {
            let s = &host.socks[self.id];
            if !s.open {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            if s.reset {
                return Err(io::Error::from(io::ErrorKind::ConnectionReset));
            }
            if s.fin_sent {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            let ConnState::Connected { peer } = s.conn else {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            };
            if !host.socks.get(peer).is_some_and(|p| p.open) {
                host.socks[self.id].reset = true;
                host.pump();
                return Err(io::Error::from(io::ErrorKind::ConnectionReset));
            }
            let free = host.socks[peer].rcvbuf.saturating_sub(host.socks[peer].rcv.len());
            if free == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = free.min(data.len());
            host.socks[peer].rcv.extend(data[..n].iter().copied());
            host.pump();
            Ok(n)
        })
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_host(|host| {
            let s = &mut host.socks[self.id];
            if !s.open {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            if s.reset {
                return Err(io::Error::from(io::ErrorKind::ConnectionReset));
            }
            if !s.rcv.is_empty() {
                let n = buf.len().min(s.rcv.len());
                for b in buf.iter_mut().take(n) {
                    *b = s.rcv.pop_front().expect("length checked");
                }
                host.pump();
                return Ok(n);
            }
            if s.fin_received {
                return Ok(0);
            }
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        })
    }

    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.with_host(|host| {
            if host.socks[self.id].kind != SockKind::Datagram {
                return Err(io::Error::from(io::ErrorKind::Unsupported));
            }
            if !host.socks[self.id].open {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            let local = match host.socks[self.id].bound {
                Some(a) => a,
                None => {
                    let a = host.ephemeral_addr();
                    host.socks[self.id].bound = Some(a);
                    host.udp_bound.insert(a, self.id);
                    a
                }
            };
            if let Some(&target) = host.udp_bound.get(&addr) {
                if host.socks[target].dgrams.len() >= host.socks[target].dgram_cap {
                    host.socks[self.id].blocked_on = Some(target);
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                host.socks[self.id].blocked_on = None;
                host.socks[target].dgrams.push_back((data.to_vec(), local));
                host.pump();
            }
            // No receiver: the datagram is silently dropped.
            Ok(data.len())
        })
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.with_host(|host| {
            if host.socks[self.id].kind != SockKind::Datagram {
                return Err(io::Error::from(io::ErrorKind::Unsupported));
            }
            let Some((data, from)) = host.socks[self.id].dgrams.pop_front() else {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            };
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            host.pump();
            Ok((n, from))
        })
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.with_host(|host| {
            if !host.socks[self.id].open {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            if matches!(how, Shutdown::Write | Shutdown::Both) {
                host.socks[self.id].fin_sent = true;
                if let ConnState::Connected { peer } = host.socks[self.id].conn {
                    if host.socks.contains(peer) {
                        host.socks[peer].fin_received = true;
                    }
                }
            }
            // A receive-side shutdown is purely local: no readiness event
            // is generated for it.
            host.pump();
            Ok(())
        })
    }

    fn close(&self) -> io::Result<()> {
        self.with_host(|host| {
            if !host.socks[self.id].open {
                return Ok(());
            }
            host.socks[self.id].open = false;
            if let Some(addr) = host.socks[self.id].bound {
                if host.tcp_listeners.get(&addr) == Some(&self.id) {
                    host.tcp_listeners.remove(&addr);
                }
                if host.udp_bound.get(&addr) == Some(&self.id) {
                    host.udp_bound.remove(&addr);
                }
            }
            // An orderly close delivers a fin to the peer.
            if let ConnState::Connected { peer } = host.socks[self.id].conn {
                if host.socks.contains(peer) {
                    host.socks[peer].fin_received = true;
                }
            }
            host.pump();
            Ok(())
        })
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_refused_without_listener() {
        let net = SimNet::new();
        let sock = net.stream();
        let err = sock
            .connect("127.0.0.1:1".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let host = net.host.borrow();
        let id = host.id_of(sock.base_handle()).unwrap();
        let (ready, status) = host.readiness(id);
        assert!(ready.contains(Readiness::CONNECT_FAIL));
        assert_eq!(status, status::REFUSED);
    }

    #[test]
    fn test_loopback_establishment_and_transfer() {
        let net = SimNet::new();
        let listener = net.stream();
        let addr: SocketAddr = "127.0.0.1:5050".parse().unwrap();
        listener.bind(addr).unwrap();
        listener.listen(16).unwrap();

        let client = net.stream();
        assert_eq!(
            client.connect(addr).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        let (server, peer_addr) = listener.accept().unwrap();
        assert_eq!(peer_addr, client.local_addr().unwrap());

        assert_eq!(server.send(b"test").unwrap(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(client.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"test");
        assert_eq!(
            client.recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_accept_on_empty_backlog_would_block() {
        let net = SimNet::new();
        let listener = net.stream();
        listener.bind("127.0.0.1:6000".parse().unwrap()).unwrap();
        listener.listen(4).unwrap();
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_backpressure_and_drain() {
        let net = SimNet::new();
        let listener = net.stream();
        let addr: SocketAddr = "127.0.0.1:6010".parse().unwrap();
        listener.bind(addr).unwrap();
        listener.listen(4).unwrap();
        let client = net.stream();
        let _ = client.connect(addr);
        let (server, _) = listener.accept().unwrap();

        net.set_recv_buffer(server.base_handle(), 10);
        assert_eq!(client.send(b"0123456789abcdef").unwrap(), 10);
        assert_eq!(
            client.send(b"more").unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        let mut buf = [0u8; 10];
        assert_eq!(server.recv(&mut buf).unwrap(), 10);
        assert_eq!(client.send(b"more").unwrap(), 4);
    }

    #[test]
    fn test_abort_marks_peer_reset() {
        let net = SimNet::new();
        let listener = net.stream();
        let addr: SocketAddr = "127.0.0.1:6020".parse().unwrap();
        listener.bind(addr).unwrap();
        listener.listen(4).unwrap();
        let client = net.stream();
        let _ = client.connect(addr);
        let (server, _) = listener.accept().unwrap();

        net.abort(server.base_handle());
        let mut buf = [0u8; 4];
        assert_eq!(
            client.recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn test_graceful_close_delivers_fin() {
        let net = SimNet::new();
        let listener = net.stream();
        let addr: SocketAddr = "127.0.0.1:6030".parse().unwrap();
        listener.bind(addr).unwrap();
        listener.listen(4).unwrap();
        let client = net.stream();
        let _ = client.connect(addr);
        let (server, _) = listener.accept().unwrap();

        server.close().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(client.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_udp_delivery() {
        let net = SimNet::new();
        let rx = net.datagram();
        let rx_addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        rx.bind(rx_addr).unwrap();

        let tx = net.datagram();
        assert_eq!(tx.send_to(b"ping", rx_addr).unwrap(), 4);

        let mut buf = [0u8; 16];
        let (n, from) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, tx.local_addr().unwrap());
    }
}
