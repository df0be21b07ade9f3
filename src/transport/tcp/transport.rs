// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! [`Transport`] adapter over [`TcpConnection`].
//!
//! Wraps the stream state machine the same way [`crate::transport::udp::UdpTransport`]
//! wraps a bare UDP socket: the connection lives behind a session-wide lock,
//! a cloned descriptor is registered with the reactor purely for readiness,
//! and `EventHandler` translates raw readability/writability into
//! `TransportObserver` upcalls.

use crate::error::NetError;
use crate::reactor::{EventHandler, HandlerId, Reactor, TimerId};
use crate::transport::tcp::byte_stream::ByteStream;
use crate::transport::tcp::config::TcpConfig;
use crate::transport::tcp::connection::TcpConnection;
use crate::transport::{Transport, TransportObserver};
use mio::net::TcpStream as MioTcpStream;
use std::io;
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub struct TcpTransport {
    connection: Mutex<TcpConnection>,
    observer: Mutex<Weak<dyn TransportObserver>>,
    suspended: AtomicBool,
    send_armed: AtomicBool,
    handler_id: Mutex<Option<HandlerId>>,
}

impl TcpTransport {
    /// Wrap an already-connected socket and register it with `reactor`.
    /// `is_initiator` feeds [`TcpConnection`]'s own handshake bookkeeping,
    /// not this crate's session handshake.
    pub fn new(
        reactor: &Reactor,
        socket: StdTcpStream,
        is_initiator: bool,
        config: &TcpConfig,
    ) -> io::Result<Arc<Self>> {
        let remote_addr = socket.peer_addr()?;
        socket.set_nonblocking(true)?;
        let mio_socket = MioTcpStream::from_std(socket.try_clone()?);

        let connection = TcpConnection::new(
            Box::new(socket) as Box<dyn ByteStream>,
            remote_addr,
            is_initiator,
            config,
        )?;

        let transport = Arc::new(Self {
            connection: Mutex::new(connection),
            observer: Mutex::new(Weak::new()),
            suspended: AtomicBool::new(false),
            send_armed: AtomicBool::new(false),
            handler_id: Mutex::new(None),
        });

        let handler: Arc<dyn EventHandler> = transport.clone();
        let id = reactor.add_handler(
            handler,
            mio_socket,
            mio::Interest::READABLE | mio::Interest::WRITABLE,
        )?;
        *transport.handler_id.lock().unwrap() = Some(id);
        Ok(transport)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().unwrap().is_connected()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.lock().unwrap().remote_addr()
    }
}

impl Transport for TcpTransport {
    fn send(&self, buf: &[u8]) -> Result<usize, NetError> {
        let mut conn = self.connection.lock().unwrap();
        conn.send(buf).map_err(NetError::Io)?;
        match conn.flush() {
            Ok(_) => Ok(buf.len()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(buf.len()),
            Err(e) => Err(NetError::Io(e)),
        }
    }

    fn suspend_recv(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    fn resume_recv(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    fn request_on_send(&self) {
        self.send_armed.store(true, Ordering::Release);
    }

    fn start_heartbeat(&self, reactor: &Reactor, interval: Duration) -> TimerId {
        reactor.schedule_heartbeat(interval, || {})
    }

    fn stop_heartbeat(&self, reactor: &Reactor, id: TimerId) {
        reactor.cancel_timer(id);
    }

    fn set_observer(&self, observer: Weak<dyn TransportObserver>) {
        *self.observer.lock().unwrap() = observer;
    }
}

impl EventHandler for TcpTransport {
    fn on_readable(&self) {
        if self.suspended.load(Ordering::Acquire) {
            return;
        }
        let mut conn = self.connection.lock().unwrap();
        let result = conn.recv_all();
        drop(conn);
        match result {
            Ok(frames) => {
                let obs = self.observer.lock().unwrap().upgrade();
                if let Some(obs) = obs {
                    for frame in frames {
                        obs.on_recv(&frame, None);
                    }
                }
            }
            Err(e) => {
                if let Some(obs) = self.observer.lock().unwrap().upgrade() {
                    obs.on_close(Some(NetError::Io(e)));
                }
            }
        }
    }

    fn on_writable(&self) {
        {
            let mut conn = self.connection.lock().unwrap();
            let _ = conn.flush();
        }
        if self.send_armed.swap(false, Ordering::AcqRel) {
            if let Some(obs) = self.observer.lock().unwrap().upgrade() {
                obs.on_send();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;

    struct Echo {
        received: Arc<AtomicUsize>,
    }
    impl TransportObserver for Echo {
        fn on_recv(&self, buf: &[u8], _remote: Option<SocketAddr>) {
            self.received.fetch_add(buf.len(), Ordering::SeqCst);
        }
    }

    #[test]
    fn wraps_connection_and_delivers_frames() {
        let reactor = Reactor::new(1);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || StdTcpStream::connect(addr).unwrap());
        let (server_sock, _) = listener.accept().unwrap();
        let client_sock = client.join().unwrap();

        let config = TcpConfig::default();
        let transport = TcpTransport::new(&reactor, server_sock, false, &config).unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn TransportObserver> = Arc::new(Echo { received: received.clone() });
        transport.set_observer(Arc::downgrade(&observer));

        let mut client_conn = TcpConnection::new(
            Box::new(client_sock) as Box<dyn ByteStream>,
            addr,
            true,
            &TcpConfig::default(),
        )
        .unwrap();
        client_conn.send(b"hello").unwrap();
        client_conn.flush().unwrap();

        sleep(Duration::from_millis(100));
        assert_eq!(received.load(Ordering::SeqCst), 5);
        reactor.stop();
    }
}
