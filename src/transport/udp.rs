// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram transport.
//!
//! A [`UdpTransport`] wraps one bound UDP socket registered with a
//! [`Reactor`]. It can receive from any peer (upcalling [`TransportObserver::on_recv`]
//! with the sender's address) while optionally holding a "connected" default
//! peer for [`Transport::send`]; arbitrary peers are reachable at any time
//! through [`UdpTransport::send_to`].

use crate::error::NetError;
use crate::reactor::{EventHandler, HandlerId, Reactor, TimerId};
use crate::transport::{Transport, TransportObserver};
use mio::net::UdpSocket as MioUdpSocket;
use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub struct UdpTransport {
    socket: StdUdpSocket,
    peer: Mutex<Option<SocketAddr>>,
    observer: Mutex<Weak<dyn TransportObserver>>,
    suspended: AtomicBool,
    send_armed: AtomicBool,
    handler_id: Mutex<Option<HandlerId>>,
}

impl UdpTransport {
    /// Bind a UDP socket to `local_addr` and register it with `reactor`.
    ///
    /// The bound socket is kept for send/recv; a cloned descriptor is handed
    /// to the reactor purely for readiness registration, the same split
    /// `RtpSession` uses for its TCP stream.
    pub fn bind(reactor: &Reactor, local_addr: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = StdUdpSocket::bind(local_addr)?;
        socket.set_nonblocking(true)?;
        let mio_socket = MioUdpSocket::from_std(socket.try_clone()?);

        let transport = Arc::new(Self {
            socket,
            peer: Mutex::new(None),
            observer: Mutex::new(Weak::new()),
            suspended: AtomicBool::new(false),
            send_armed: AtomicBool::new(false),
            handler_id: Mutex::new(None),
        });

        let handler: Arc<dyn EventHandler> = transport.clone();
        // Always register both interests; `send_armed` gates whether a
        // writable wakeup is actually forwarded to the observer, since
        // datagram sockets are writable far more often than callers care.
        let id = reactor.add_handler(
            handler,
            mio_socket,
            mio::Interest::READABLE | mio::Interest::WRITABLE,
        )?;
        *transport.handler_id.lock().unwrap() = Some(id);
        Ok(transport)
    }

    /// Set the default peer used by [`Transport::send`]. Mirrors
    /// `UdpSocket::connect`'s filtering effect at the application layer:
    /// datagrams from other senders still arrive via `on_recv`.
    pub fn connect(&self, peer: SocketAddr) {
        *self.peer.lock().unwrap() = Some(peer);
    }

    /// Send to an explicit address, bypassing the default peer.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, NetError> {
        self.socket.send_to(buf, addr).map_err(NetError::Io)
    }

    /// The address this transport is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send(&self, buf: &[u8]) -> Result<usize, NetError> {
        let peer = self.peer.lock().unwrap();
        match *peer {
            Some(addr) => self.socket.send_to(buf, addr).map_err(NetError::Io),
            None => Err(NetError::Protocol("udp transport has no connected peer")),
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

impl EventHandler for UdpTransport {
    fn on_readable(&self) {
        if self.suspended.load(Ordering::Acquire) {
            return;
        }
        let mut buf = [0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Some(obs) = self.observer.lock().unwrap().upgrade() {
                        obs.on_recv(&buf[..n], Some(from));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn on_writable(&self) {
        if self.send_armed.swap(false, Ordering::AcqRel) {
            if let Some(obs) = self.observer.lock().unwrap().upgrade() {
                obs.on_send();
            }
        }
    }
}
