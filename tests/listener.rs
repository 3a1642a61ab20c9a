//! Listening endpoint scenarios against the simulated host.

mod common;

use afdio::{Error, ListenerState, ListeningSocket, SocketOps};
use common::{Event, Fixture, ListenerRecorder, Log, addr};

fn listener_fixture(fx: &Fixture, slot: usize, log: &Log) -> (ListeningSocket, common::AcceptedList) {
    let (callbacks, accepted) = ListenerRecorder::boxed(slot, log);
    let listener = ListeningSocket::new(fx.handle(slot), Box::new(fx.net.stream()), callbacks)
        .expect("listener endpoint");
    (listener, accepted)
}

#[test]
fn test_bind_listen_accept_flow() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (listener, accepted) = listener_fixture(&fx, 0, &log);

    listener.bind(addr(5070)).unwrap();
    assert_eq!(listener.state(), ListenerState::Bound);
    listener.listen(16).unwrap();
    assert_eq!(listener.state(), ListenerState::Listening);

    let client = fx.net.stream();
    let _ = client.connect(addr(5070));
    fx.pump();

    assert_eq!(log.count(0, Event::Incoming), 1);
    assert_eq!(accepted.borrow().len(), 1);
    assert_eq!(accepted.borrow()[0].1, client.local_addr().unwrap());
}

#[test]
fn test_accept_drains_backlog() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (listener, accepted) = listener_fixture(&fx, 0, &log);

    listener.bind(addr(5071)).unwrap();
    listener.listen(16).unwrap();
    fx.pump();

    let a = fx.net.stream();
    let b = fx.net.stream();
    let _ = a.connect(addr(5071));
    let _ = b.connect(addr(5071));
    fx.pump();

    // One accept burst drains both pending connections.
    assert_eq!(accepted.borrow().len(), 2);
    // Further incoming connections still get reported.
    let c = fx.net.stream();
    let _ = c.connect(addr(5071));
    fx.pump();
    assert_eq!(accepted.borrow().len(), 3);
}

#[test]
fn test_listen_requires_bound() {
    let fx = Fixture::new(4);
    let log = Log::new();
    let (listener, _accepted) = listener_fixture(&fx, 0, &log);

    let err = listener.listen(16).unwrap_err();
    assert!(matches!(err, Error::InvalidState { op: "listen", .. }));
}

#[test]
fn test_accept_requires_listening() {
    let fx = Fixture::new(4);
    let log = Log::new();
    let (listener, _accepted) = listener_fixture(&fx, 0, &log);
    listener.bind(addr(5072)).unwrap();

    let err = listener.accept().unwrap_err();
    assert!(matches!(err, Error::InvalidState { op: "accept", .. }));
}

#[test]
fn test_close_synthesizes_disconnect_when_idle() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (listener, _accepted) = listener_fixture(&fx, 0, &log);
    listener.bind(addr(5073)).unwrap();
    listener.listen(16).unwrap();

    fx.driver.cancel().unwrap();
    fx.pump();

    listener.close().unwrap();
    fx.pump();
    assert_eq!(log.count(0, Event::Disconnected), 1);
    assert_eq!(listener.state(), ListenerState::Disconnected);

    listener.close().unwrap();
    fx.pump();
    assert_eq!(log.count(0, Event::Disconnected), 1);
}

#[test]
fn test_close_with_poll_reports_through_loop() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (listener, _accepted) = listener_fixture(&fx, 0, &log);
    listener.bind(addr(5074)).unwrap();
    listener.listen(16).unwrap();
    fx.pump();

    assert!(fx.driver.slot_covered(0));
    listener.close().unwrap();
    assert_eq!(log.count(0, Event::Disconnected), 0);
    fx.pump();
    assert_eq!(log.count(0, Event::Disconnected), 1);
}
