// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A length-prefixed message sent over a real TCP loopback connection,
//! plus a reactor heartbeat timer running alongside it. The heartbeat
//! interval here is milliseconds rather than the many-second interval a
//! production deployment would use; what's under test is that the timer
//! fires repeatedly for as long as the connection stays open, not the
//! specific interval value.

use corenet::reactor::Reactor;
use corenet::transport::tcp::{TcpConfig, TcpConnection};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn tcp_framed_message_delivered_with_heartbeat_running() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_side = std::thread::spawn(move || {
        let (socket, peer) = listener.accept().unwrap();
        socket.set_nonblocking(true).unwrap();
        let config = TcpConfig::default();
        let mut conn = TcpConnection::new(Box::new(socket), peer, false, &config).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(msg) = conn.recv().unwrap() {
                return msg;
            }
            assert!(Instant::now() < deadline, "server never received a message");
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    let client_socket = std::net::TcpStream::connect(addr).unwrap();
    client_socket.set_nonblocking(true).unwrap();
    let config = TcpConfig::default();
    let mut client = TcpConnection::new(Box::new(client_socket), addr, true, &config).unwrap();

    let reactor = Reactor::new(1);
    let beats = Arc::new(AtomicUsize::new(0));
    let beats_clone = beats.clone();
    let heartbeat_id = reactor.schedule_heartbeat(Duration::from_millis(20), move || {
        beats_clone.fetch_add(1, Ordering::SeqCst);
    });

    client.send(b"hello over tcp").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match client.flush().unwrap() {
            corenet::transport::tcp::FlushResult::Complete => break,
            corenet::transport::tcp::FlushResult::Empty => break,
            corenet::transport::tcp::FlushResult::WouldBlock => {
                assert!(Instant::now() < deadline, "client never finished flushing");
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    let received = server_side.join().unwrap();
    assert_eq!(received, b"hello over tcp");

    // Give the heartbeat timer a chance to fire a few times while the
    // connection sits idle, proving it keeps re-slotting rather than firing
    // only once.
    std::thread::sleep(Duration::from_millis(120));
    assert!(beats.load(Ordering::SeqCst) >= 3);

    reactor.cancel_timer(heartbeat_id);
    reactor.stop();
}
