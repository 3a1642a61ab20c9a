//! Stream endpoint scenarios against the simulated host.

mod common;

use std::io;

use afdio::{Error, Readiness, SocketOps, StreamSocket, StreamState};
use common::{Event, Fixture, Log, Recorder, addr};

#[test]
fn test_connect_failure() {
    let mut fx = Fixture::new(4);
    let log = Log::new();

    let stream = StreamSocket::new(
        fx.handle(0),
        Box::new(fx.net.stream()),
        Recorder::boxed(0, &log),
    )
    .unwrap();

    // Nothing listens on port 1.
    stream.connect(addr(1)).unwrap();
    fx.pump();

    assert_eq!(
        log.for_id(0),
        vec![Event::ConnectionFailed(io::ErrorKind::ConnectionRefused)]
    );
    assert_eq!(stream.state(), StreamState::Disconnected);
}

#[test]
fn test_connect_exchange_and_close() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, peer, _base) = fx.connected_pair(0, addr(5050), &log);

    assert_eq!(peer.send(b"test").unwrap(), 4);
    fx.pump();
    assert_eq!(log.count(0, Event::Readable), 1);

    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"test");

    // Nothing left: zero bytes, readable interest re-armed.
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    assert!(stream.interest().contains(Readiness::READABLE));
    fx.pump();

    peer.close().unwrap();
    fx.pump();
    assert_eq!(log.count(0, Event::ClientClose), 1);
    assert_eq!(stream.state(), StreamState::PeerClosed);

    stream.close().unwrap();
    fx.pump();
    assert_eq!(log.count(0, Event::Disconnected), 1);
    assert_eq!(stream.state(), StreamState::Disconnected);

    assert_eq!(
        log.for_id(0),
        vec![
            Event::Connected,
            Event::Readable,
            Event::ClientClose,
            Event::Disconnected
        ]
    );
}

#[test]
fn test_peer_reset_with_poll_outstanding() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, peer, _base) = fx.connected_pair(0, addr(5051), &log);

    // The residual interest after connect keeps a poll in flight.
    assert!(fx.driver.in_flight());
    fx.net.abort(peer.base_handle());
    fx.pump();

    assert_eq!(log.count(0, Event::ConnectionReset), 1);
    assert_eq!(stream.state(), StreamState::Disconnected);
}

#[test]
fn test_peer_reset_detected_on_read() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, peer, _base) = fx.connected_pair(0, addr(5052), &log);

    // Park the driver so no poll is outstanding when the reset lands.
    fx.driver.cancel().unwrap();
    fx.pump();
    assert!(!fx.driver.in_flight());

    fx.net.abort(peer.base_handle());
    fx.pump();
    assert_eq!(log.count(0, Event::ConnectionReset), 0);

    // The read observes the reset, reports zero bytes, and re-arms; the
    // poll then delivers the condition.
    let mut buf = [0u8; 4];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    fx.pump();
    assert_eq!(log.count(0, Event::ConnectionReset), 1);
    assert_eq!(stream.state(), StreamState::Disconnected);
}

#[test]
fn test_peer_reset_detected_on_write() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, peer, _base) = fx.connected_pair(0, addr(5053), &log);

    fx.driver.cancel().unwrap();
    fx.pump();

    fx.net.abort(peer.base_handle());
    assert_eq!(stream.write(b"data").unwrap(), 0);
    fx.pump();

    // The writable edge fires before the reset is translated.
    let events = log.for_id(0);
    let writable_at = events.iter().position(|e| *e == Event::Writable);
    let reset_at = events.iter().position(|e| *e == Event::ConnectionReset);
    assert!(writable_at.is_some(), "events: {events:?}");
    assert!(reset_at.is_some(), "events: {events:?}");
    assert!(writable_at < reset_at);
    assert_eq!(stream.state(), StreamState::Disconnected);
}

#[test]
fn test_send_backpressure_accounting() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, peer, base) = fx.connected_pair(0, addr(5054), &log);

    fx.net.set_recv_buffer(peer.base_handle(), 10);
    fx.net.set_recv_buffer(base, 10);

    let message = b"This message will be sent until it can't be sent";
    let mut sent_total = 0;
    loop {
        let accepted = stream.write(message).unwrap();
        sent_total += accepted;
        if accepted == 0 {
            break;
        }
    }
    assert!(sent_total >= 10);
    assert!(stream.interest().contains(Readiness::WRITABLE));

    // Drain the peer completely and count what it observed.
    fx.pump();
    let mut received_total = 0;
    let mut buf = [0u8; 64];
    loop {
        match peer.recv(&mut buf) {
            Ok(n) => received_total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("peer recv: {e}"),
        }
    }
    assert_eq!(sent_total, received_total);

    // Draining freed the window: writable comes back.
    fx.pump();
    assert!(log.count(0, Event::Writable) >= 1);
    assert!(stream.write(message).unwrap() > 0);
}

#[test]
fn test_local_close_synthesizes_disconnect() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, _peer, _base) = fx.connected_pair(0, addr(5055), &log);

    // Park the driver: no poll in flight for the slot.
    fx.driver.cancel().unwrap();
    fx.pump();
    assert!(!fx.driver.in_flight());

    stream.close().unwrap();
    fx.pump();

    assert_eq!(log.count(0, Event::Disconnected), 1);
    assert_eq!(stream.state(), StreamState::Disconnected);

    // Closing again changes nothing.
    stream.close().unwrap();
    fx.pump();
    assert_eq!(log.count(0, Event::Disconnected), 1);
}

#[test]
fn test_close_with_poll_outstanding_reports_through_loop() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, _peer, _base) = fx.connected_pair(0, addr(5056), &log);

    assert!(fx.driver.slot_covered(0));
    stream.close().unwrap();
    // Not synthesized: nothing observed until the loop runs.
    assert_eq!(log.count(0, Event::Disconnected), 0);
    fx.pump();
    assert_eq!(log.count(0, Event::Disconnected), 1);
}

#[test]
fn test_close_after_reset_still_disconnects_once() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, peer, _base) = fx.connected_pair(0, addr(5057), &log);

    fx.net.abort(peer.base_handle());
    fx.pump();
    assert_eq!(log.count(0, Event::ConnectionReset), 1);

    stream.close().unwrap();
    fx.pump();
    assert_eq!(log.count(0, Event::Disconnected), 1);

    stream.close().unwrap();
    fx.pump();
    assert_eq!(log.count(0, Event::Disconnected), 1);
}

#[test]
fn test_read_zero_after_peer_close_exactly_one_client_close() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, peer, _base) = fx.connected_pair(0, addr(5058), &log);

    peer.close().unwrap();
    fx.pump();
    assert_eq!(log.count(0, Event::ClientClose), 1);

    // Reads in peer-closed keep returning zero and re-arming readable
    // interest, but the client-close edge never repeats.
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    fx.pump();
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    fx.pump();
    assert_eq!(log.count(0, Event::ClientClose), 1);
}

#[test]
fn test_shutdown_send_delivers_fin_without_local_callback() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, peer, _base) = fx.connected_pair(0, addr(5059), &log);
    let before = log.for_id(0);

    stream.shutdown(std::net::Shutdown::Write).unwrap();
    fx.pump();

    // The peer observes the half-close; the closing side gets no
    // callback for its own action.
    let mut buf = [0u8; 8];
    assert_eq!(peer.recv(&mut buf).unwrap(), 0);
    assert_eq!(log.for_id(0), before);
}

#[test]
fn test_shutdown_receive_produces_no_event() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, _peer, _base) = fx.connected_pair(0, addr(5060), &log);
    let before = log.for_id(0);

    stream.shutdown(std::net::Shutdown::Read).unwrap();
    let turns = fx.pump();
    assert!(turns.is_empty(), "unexpected turns: {turns:?}");
    assert_eq!(log.for_id(0), before);
}

#[test]
fn test_out_of_band_data() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, _peer, base) = fx.connected_pair(0, addr(5061), &log);

    fx.net.push_oob(base, b"!");
    fx.pump();
    assert_eq!(log.count(0, Event::ReadableOob), 1);
    assert_eq!(stream.state(), StreamState::Connected);
}

#[test]
fn test_invalid_state_operations() {
    let fx = Fixture::new(4);
    let log = Log::new();

    let stream = StreamSocket::new(
        fx.handle(0),
        Box::new(fx.net.stream()),
        Recorder::boxed(0, &log),
    )
    .unwrap();

    let mut buf = [0u8; 4];
    assert!(matches!(
        stream.read(&mut buf).unwrap_err(),
        Error::InvalidState { op: "read", .. }
    ));
    assert!(matches!(
        stream.write(b"x").unwrap_err(),
        Error::InvalidState { op: "write", .. }
    ));
    assert!(matches!(
        stream.shutdown(std::net::Shutdown::Both).unwrap_err(),
        Error::InvalidState { op: "shutdown", .. }
    ));
}

#[test]
fn test_connect_twice_is_rejected() {
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (stream, _peer, _base) = fx.connected_pair(0, addr(5062), &log);

    let err = stream.connect(addr(5062)).unwrap_err();
    assert!(matches!(err, Error::InvalidState { op: "connect", .. }));
}

#[test]
fn test_connect_resolves_exactly_once() {
    // Success path: one on_connected, no on_connection_failed.
    let mut fx = Fixture::new(4);
    let log = Log::new();
    let (_stream, _peer, _base) = fx.connected_pair(0, addr(5063), &log);
    fx.pump();
    assert_eq!(log.count(0, Event::Connected), 1);
    assert_eq!(
        log.count(0, Event::ConnectionFailed(io::ErrorKind::ConnectionRefused)),
        0
    );

    // Failure path: one on_connection_failed, no on_connected.
    let log2 = Log::new();
    let stream = StreamSocket::new(
        fx.handle(1),
        Box::new(fx.net.stream()),
        Recorder::boxed(1, &log2),
    )
    .unwrap();
    stream.connect(addr(9)).unwrap();
    fx.pump();
    assert_eq!(log2.count(1, Event::Connected), 0);
    assert_eq!(
        log2.count(1, Event::ConnectionFailed(io::ErrorKind::ConnectionRefused)),
        1
    );
}

#[test]
fn test_accepted_adoption_reaches_connected() {
    let mut fx = Fixture::new(4);
    let log = Log::new();

    let listener = fx.remote_listener(addr(5064));
    let client = fx.net.stream();
    let _ = client.connect(addr(5064));
    let (server_sock, _peer_addr) = listener.accept().unwrap();

    let server = StreamSocket::new(fx.handle(0), server_sock, Recorder::boxed(0, &log)).unwrap();
    server.accepted().unwrap();
    fx.pump();

    assert_eq!(log.count(0, Event::Connected), 1);
    assert_eq!(server.state(), StreamState::Connected);

    // Traffic flows both ways on the adopted connection.
    assert_eq!(client.send(b"hi").unwrap(), 2);
    fx.pump();
    let mut buf = [0u8; 4];
    assert_eq!(server.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"hi");
}
