//! Shared fixtures for the integration tests: a simulated host, an event
//! loop bound to it, and callback recorders.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use afdio::sim::{SimNet, SimQueue, SimSocket};
use afdio::{
    DatagramCallbacks, DatagramSocket, DriverHandle, EventLoop, ListenerCallbacks,
    ListeningSocket, PollDriver, SocketOps, StreamCallbacks, StreamSocket, Turn,
};

/// One observed callback, tagged with the endpoint id that saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connected,
    ConnectionFailed(io::ErrorKind),
    Readable,
    ReadableOob,
    Writable,
    ClientClose,
    ConnectionReset,
    Disconnected,
    Incoming,
}

/// Shared, ordered log of callbacks across all endpoints of a test.
#[derive(Clone, Default)]
pub struct Log {
    entries: Rc<RefCell<Vec<(usize, Event)>>>,
}

impl Log {
    pub fn new() -> Log {
        Log::default()
    }

    pub fn push(&self, id: usize, event: Event) {
        self.entries.borrow_mut().push((id, event));
    }

    pub fn all(&self) -> Vec<(usize, Event)> {
        self.entries.borrow().clone()
    }

    pub fn for_id(&self, id: usize) -> Vec<Event> {
        self.entries
            .borrow()
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, e)| *e)
            .collect()
    }

    pub fn count(&self, id: usize, event: Event) -> usize {
        self.for_id(id).iter().filter(|e| **e == event).count()
    }
}

/// Stream callbacks that only record.
pub struct Recorder {
    pub id: usize,
    pub log: Log,
}

impl Recorder {
    pub fn boxed(id: usize, log: &Log) -> Box<Recorder> {
        Box::new(Recorder {
            id,
            log: log.clone(),
        })
    }
}

impl StreamCallbacks for Recorder {
    fn on_connected(&mut self, _sock: &StreamSocket) {
        self.log.push(self.id, Event::Connected);
    }

    fn on_connection_failed(&mut self, _sock: &StreamSocket, error: io::Error) {
        self.log.push(self.id, Event::ConnectionFailed(error.kind()));
    }

    fn on_readable(&mut self, _sock: &StreamSocket) {
        self.log.push(self.id, Event::Readable);
    }

    fn on_readable_oob(&mut self, _sock: &StreamSocket) {
        self.log.push(self.id, Event::ReadableOob);
    }

    fn on_writable(&mut self, _sock: &StreamSocket) {
        self.log.push(self.id, Event::Writable);
    }

    fn on_client_close(&mut self, _sock: &StreamSocket) {
        self.log.push(self.id, Event::ClientClose);
    }

    fn on_connection_reset(&mut self, _sock: &StreamSocket) {
        self.log.push(self.id, Event::ConnectionReset);
    }

    fn on_disconnected(&mut self, _sock: &StreamSocket) {
        self.log.push(self.id, Event::Disconnected);
    }
}

/// Connections drained by a [`ListenerRecorder`].
pub type AcceptedList = Rc<RefCell<Vec<(Box<dyn SocketOps>, SocketAddr)>>>;

/// Listener callbacks that record and drain the backlog.
pub struct ListenerRecorder {
    pub id: usize,
    pub log: Log,
    pub accepted: AcceptedList,
}

impl ListenerRecorder {
    pub fn boxed(id: usize, log: &Log) -> (Box<ListenerRecorder>, AcceptedList) {
        let accepted = Rc::new(RefCell::new(Vec::new()));
        (
            Box::new(ListenerRecorder {
                id,
                log: log.clone(),
                accepted: accepted.clone(),
            }),
            accepted,
        )
    }
}

impl ListenerCallbacks for ListenerRecorder {
    fn on_incoming_connections(&mut self, listener: &ListeningSocket) {
        self.log.push(self.id, Event::Incoming);
        while let Ok(Some(pair)) = listener.accept() {
            self.accepted.borrow_mut().push(pair);
        }
    }

    fn on_disconnected(&mut self, _listener: &ListeningSocket) {
        self.log.push(self.id, Event::Disconnected);
    }
}

/// Datagram callbacks that only record.
pub struct DatagramRecorder {
    pub id: usize,
    pub log: Log,
}

impl DatagramRecorder {
    pub fn boxed(id: usize, log: &Log) -> Box<DatagramRecorder> {
        Box::new(DatagramRecorder {
            id,
            log: log.clone(),
        })
    }
}

impl DatagramCallbacks for DatagramRecorder {
    fn on_readable(&mut self, _sock: &DatagramSocket) {
        self.log.push(self.id, Event::Readable);
    }

    fn on_writable(&mut self, _sock: &DatagramSocket) {
        self.log.push(self.id, Event::Writable);
    }

    fn on_disconnected(&mut self, _sock: &DatagramSocket) {
        self.log.push(self.id, Event::Disconnected);
    }
}

/// A simulated host with one driver and one event loop.
pub struct Fixture {
    pub net: SimNet,
    pub queue: Rc<SimQueue>,
    pub driver: Rc<PollDriver>,
    pub event_loop: EventLoop,
}

impl Fixture {
    pub fn new(capacity: usize) -> Fixture {
        let net = SimNet::new();
        let queue = net.queue();
        let device = net.device(&queue);
        let driver = PollDriver::new(device, capacity);
        let mut event_loop = EventLoop::new(queue.clone());
        event_loop.register(&driver);
        Fixture {
            net,
            queue,
            driver,
            event_loop,
        }
    }

    pub fn handle(&self, slot: usize) -> DriverHandle {
        DriverHandle::new(&self.driver, slot)
    }

    /// Run loop turns until the queue reports a timeout. Returns the
    /// non-timeout turns observed.
    pub fn pump(&mut self) -> Vec<Turn> {
        let mut turns = Vec::new();
        for _ in 0..64 {
            match self
                .event_loop
                .poll_once(Some(Duration::from_millis(10)))
                .expect("loop turn")
            {
                Turn::TimedOut => return turns,
                turn => turns.push(turn),
            }
        }
        panic!("event loop failed to go idle: {turns:?}");
    }

    /// A raw listening socket outside any endpoint, acting as the remote
    /// peer.
    pub fn remote_listener(&self, addr: SocketAddr) -> SimSocket {
        let listener = self.net.stream();
        listener.bind(addr).expect("bind remote listener");
        listener.listen(16).expect("listen remote listener");
        listener
    }

    /// Connect a recording stream endpoint to `addr` on `slot`. Returns
    /// the endpoint, the raw peer socket accepted on the remote side, and
    /// the endpoint socket's base handle.
    pub fn connected_pair(
        &mut self,
        slot: usize,
        addr: SocketAddr,
        log: &Log,
    ) -> (StreamSocket, Box<dyn SocketOps>, afdio::RawSock) {
        let listener = self.remote_listener(addr);
        let endpoint_sock = self.net.stream();
        let base = endpoint_sock.base_handle();
        let stream = StreamSocket::new(
            self.handle(slot),
            Box::new(endpoint_sock),
            Recorder::boxed(slot, log),
        )
        .expect("stream endpoint");
        stream.connect(addr).expect("connect");
        self.pump();
        assert_eq!(log.count(slot, Event::Connected), 1, "connected once");
        let (peer, _) = listener.accept().expect("peer accept");
        (stream, peer, base)
    }
}

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("address")
}
