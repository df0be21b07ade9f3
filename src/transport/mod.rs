// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport implementations: TCP, UDP, and multicast sockets, each exposing
//! the same send/suspend/resume/heartbeat/observer surface so callers can
//! treat them uniformly regardless of kind.
//!
//! [`tcp::connection::TcpConnection`] is the stream state machine;
//! [`tcp::TcpTransport`] wraps it behind a `Mutex` the same way
//! [`udp::UdpTransport`] wraps a bare UDP socket, so [`crate::session::RtpSession`]
//! can hold any of them as `Arc<dyn Transport>` without knowing which kind
//! it has.
//!
//! # Modules
//!
//! - [`tcp`] - stream transport, with optional TLS
//! - [`udp`] - datagram transport
//! - [`multicast`] - multicast group membership
//! - [`ports`] - ephemeral port allocation for outbound sockets

use crate::error::NetError;
use crate::reactor::{Reactor, TimerId};
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

/// Multicast group management and interface discovery.
pub mod multicast;
/// Ephemeral port allocation for outbound TCP/UDP sockets.
pub mod ports;
/// TCP transport, with optional TLS (`tcp-tls` feature).
pub mod tcp;
/// UDP transport.
pub mod udp;

pub use ports::{tcp_ports, udp_ports, PortAllocator};
pub use udp::UdpTransport;

/// Callbacks fired by a [`Transport`] as data arrives, send capacity frees
/// up, or the socket closes. All methods default to a no-op so an observer
/// only implements what it needs.
pub trait TransportObserver: Send + Sync {
    /// Data arrived (`remote` is set for connectionless transports where a
    /// single socket can hear from more than one peer).
    fn on_recv(&self, _buf: &[u8], _remote: Option<SocketAddr>) {}
    /// A `request_on_send` arming condition was satisfied.
    fn on_send(&self) {}
    /// The transport closed, gracefully (`None`) or due to an error.
    fn on_close(&self, _error: Option<NetError>) {}
    /// The transport's heartbeat timer fired.
    fn on_heartbeat(&self) {}
}

/// The capability surface common to every transport kind: send data,
/// suspend/resume delivery, arm a one-shot writable notification, and run a
/// heartbeat timer through a [`Reactor`].
pub trait Transport: Send + Sync {
    /// Send `buf`, returning the number of bytes actually written.
    fn send(&self, buf: &[u8]) -> Result<usize, NetError>;
    /// Stop delivering `on_recv` upcalls until [`Self::resume_recv`].
    fn suspend_recv(&self);
    /// Resume `on_recv` delivery after [`Self::suspend_recv`].
    fn resume_recv(&self);
    /// Arm a one-shot `on_send` upcall for the next time the socket has
    /// write capacity.
    fn request_on_send(&self);
    /// Start a periodic heartbeat, delivering `on_heartbeat` through
    /// `reactor` every `interval`.
    fn start_heartbeat(&self, reactor: &Reactor, interval: Duration) -> TimerId;
    /// Stop a heartbeat previously started with [`Self::start_heartbeat`].
    fn stop_heartbeat(&self, reactor: &Reactor, id: TimerId);
    /// Replace the transport's observer.
    fn set_observer(&self, observer: Weak<dyn TransportObserver>);
}
