// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # corenet
//!
//! An asynchronous networking runtime: a multi-worker reactor over `mio`,
//! TCP/UDP/multicast transports with optional TLS, a cross-process service
//! hub for handing off live sockets between processes, and an RTP-style
//! framed media session layer with flow-control buckets and packet
//! reordering.
//!
//! ## Quick start
//!
//! ```no_run
//! use corenet::reactor::Reactor;
//! use std::time::Duration;
//!
//! let reactor = Reactor::new(4);
//! let _timer = reactor.schedule_timer(Duration::from_secs(1), None, || {
//!     println!("fired");
//! });
//! reactor.stop();
//! ```
//!
//! ## Modules
//!
//! - [`reactor`] - worker-pool event loop and timer wheel
//! - [`socket`] - platform socket helpers, including fd passing on Unix
//! - [`buffer`] - arena-backed buffer pool for I/O
//! - [`handshake`] - move-semantics connection handshaking
//! - [`acceptor_connector`] - listen-only/connect-only socket roles
//! - [`transport`] - TCP, UDP, and multicast transports
//! - [`hub`] - cross-process service hub wire protocol
//! - [`rtp`] - RTP-style framed media packets
//! - [`bucket`] - per-flow-class flow-control queues
//! - [`reorder`] - sequence-ordered delivery buffer
//! - [`session`] - wires a handshaken connection to a bucket, reorder
//!   buffer, and the reactor
//! - [`congestion`] - rate limiting primitives
//! - [`reliability`] - gap tracking and sequence number allocation
//! - [`config`] - runtime configuration
//! - [`logging`] - compile-time configurable logging macros
//! - [`error`] - subsystem error types
//! - [`core`] - low-level infrastructure (buffer arenas, waitsets)

/// Runtime configuration: timeouts, buffer sizes, worker counts.
pub mod config;
/// Rate-limiting primitives used by [`bucket`].
pub mod congestion;
/// Low-level infrastructure: arena-backed slab pool, waitset readiness driver.
pub mod core;
/// Subsystem error types (`NetError`, `HubError`, `RtpError`).
pub mod error;
/// Compile-time configurable logging macros (`debug!`, `info!`, `warn!`, `error!`).
pub mod logging;
/// Sequence gap tracking and id allocation shared across the reorder buffer
/// and the reactor's internal bookkeeping.
pub mod reliability;

/// Arena-backed buffer pool for socket I/O.
pub mod buffer;
/// Platform socket helpers, including Unix file descriptor passing.
pub mod socket;
/// Multi-worker reactor: readiness-driven dispatch plus a timer thread.
pub mod reactor;

/// Move-semantics connection handshaking.
pub mod handshake;
/// Listen-only acceptors and connect-only connectors.
pub mod acceptor_connector;
/// TCP, UDP, and multicast transports.
pub mod transport;

/// Cross-process service hub: hands live sockets off between processes.
pub mod hub;

/// RTP-style framed media packets.
pub mod rtp;
/// Per-flow-class flow-control queues (audio, video, plain).
pub mod bucket;
/// Sequence-ordered delivery buffer for unreliable transports.
pub mod reorder;
/// Wires a handshaken connection to a bucket, reorder buffer, and the reactor.
pub mod session;

pub use error::{HubError, NetError, RtpError};
pub use reactor::{EventHandler, HandlerId, Reactor, TimerId};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
