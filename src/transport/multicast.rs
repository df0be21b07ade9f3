// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast group membership.
//!
//! A [`McastTransport`] joins a single caller-specified IPv4 multicast
//! group on a chosen local interface, exposing the same [`Transport`]
//! surface as [`super::udp::UdpTransport`] — `send` addresses the group
//! itself, `on_recv` delivers datagrams from any member.

use crate::error::NetError;
use crate::reactor::{EventHandler, HandlerId, Reactor, TimerId};
use crate::transport::{Transport, TransportObserver};
use mio::net::UdpSocket as MioUdpSocket;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub struct McastTransport {
    socket: StdUdpSocket,
    group: Ipv4Addr,
    port: u16,
    iface: Ipv4Addr,
    observer: Mutex<Weak<dyn TransportObserver>>,
    suspended: AtomicBool,
    send_armed: AtomicBool,
    handler_id: Mutex<Option<HandlerId>>,
}

impl McastTransport {
    /// Bind `port` and join `group` on `iface` (use
    /// [`Ipv4Addr::UNSPECIFIED`] to let the kernel pick the interface),
    /// registering the socket with `reactor`.
    pub fn join(
        reactor: &Reactor,
        group: Ipv4Addr,
        port: u16,
        iface: Ipv4Addr,
    ) -> io::Result<Arc<Self>> {
        // Multiple sockets (potentially in different processes) bind the
        // same multicast port; SO_REUSEADDR is what lets the join succeed
        // for all of them rather than just the first.
        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket2.set_reuse_address(true)?;
        socket2.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        let socket: StdUdpSocket = socket2.into();
        socket.join_multicast_v4(&group, &iface)?;
        socket.set_nonblocking(true)?;
        let mio_socket = MioUdpSocket::from_std(socket.try_clone()?);

        let transport = Arc::new(Self {
            socket,
            group,
            port,
            iface,
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

    /// Leave the group. The transport remains registered and bound, but
    /// stops receiving group traffic; drop it to release the socket
    /// entirely.
    pub fn leave(&self) -> io::Result<()> {
        self.socket.leave_multicast_v4(&self.group, &self.iface)
    }

    /// Set the outgoing multicast TTL (hop count).
    pub fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.socket.set_multicast_ttl_v4(ttl)
    }

    /// Enable or disable receiving this transport's own sends back on the
    /// joined group.
    pub fn set_loopback(&self, enabled: bool) -> io::Result<()> {
        self.socket.set_multicast_loop_v4(enabled)
    }

    /// The multicast group this transport joined.
    pub fn group(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

impl Transport for McastTransport {
    fn send(&self, buf: &[u8]) -> Result<usize, NetError> {
        self.socket
            .send_to(buf, SocketAddrV4::new(self.group, self.port))
            .map_err(NetError::Io)
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

impl EventHandler for McastTransport {
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
