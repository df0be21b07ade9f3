// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Media sessions: a handshaken transport wired to a flow-control bucket, an
//! optional reorder buffer, and the reactor.
//!
//! [`RtpSession`] is the glue between [`crate::rtp`] (wire format),
//! [`crate::bucket`] (outbound flow control), [`crate::reorder`] (inbound
//! reordering), and any [`crate::transport::Transport`] implementation. It
//! registers itself as the transport's [`TransportObserver`] and drives both
//! directions from there; callers interact with it only through
//! [`RtpSession::send`] and the [`SessionObserver`] callbacks. Holding the
//! transport as `Arc<dyn Transport>` rather than a concrete `TcpConnection`
//! means the same session type rides TCP, UDP, or multicast without caring
//! which.
//!
//! The observer is held by [`Weak`] reference: a session outliving its
//! observer (e.g. the application tore down a connection's owner before
//! the socket finished closing) degrades to silently dropping callbacks
//! rather than keeping the observer alive past its intended lifetime.

use crate::bucket::BaseBucket;
use crate::error::NetError;
use crate::reactor::{Reactor, TimerId};
use crate::reorder::ReorderBuffer;
use crate::rtp::{RtpPacket, RtpSessionInfo};
use crate::transport::tcp::transport::TcpTransport;
use crate::transport::tcp::TcpConfig;
use crate::transport::{Transport, TransportObserver};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Callbacks a session driver implements to receive session lifecycle and
/// media events. All methods have empty default bodies so an observer only
/// needs to implement what it cares about.
pub trait SessionObserver: Send + Sync {
    /// The handshake completed and the session is ready to send/receive.
    fn on_ok(&self, _session: &RtpSession) {}
    /// A packet was decoded off the wire.
    fn on_recv(&self, _session: &RtpSession, _packet: RtpPacket) {}
    /// Send capacity freed up; a caller with buffered packets can retry.
    fn on_send(&self, _session: &RtpSession) {}
    /// The session's transport closed, gracefully or otherwise.
    fn on_close(&self, _session: &RtpSession, _error: Option<io::Error>) {}
    /// A heartbeat arrived (extended sessions only).
    fn on_heartbeat(&self, _session: &RtpSession, _peer_alive_tick: i64) {}
}

struct SessionState {
    bucket: BaseBucket,
    reorder: Option<ReorderBuffer>,
    recv_accum: Vec<u8>,
    input_enabled: bool,
    output_enabled: bool,
    /// Packets queued by `send_packet_by_timer`, paced into `bucket` by the
    /// 1 ms ticker started the first time the deque goes non-empty.
    timed_queue: VecDeque<RtpPacket>,
    timed_duration_ms: u64,
    timed_elapsed_ms: u64,
    timed_timer: Option<TimerId>,
}

/// A live media session over a handshaken transport.
///
/// Always reached through an `Arc` held by the caller and by the transport
/// it registered itself with as observer; every method only needs `&self`
/// because mutable session state lives behind the internal [`Mutex`].
pub struct RtpSession {
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    observer: Weak<dyn SessionObserver>,
    info: RtpSessionInfo,
    connected: AtomicBool,
    self_weak: Mutex<Weak<RtpSession>>,
}

impl RtpSession {
    /// Wrap an already-connected, already-handshaken TCP socket as a session
    /// and register it with `reactor`. `reorder_window` enables inbound
    /// reordering (useful for UDP-style delivery even though this
    /// constructor rides TCP); pass `None` to deliver packets strictly in
    /// arrival order.
    pub fn new(
        reactor: &Reactor,
        socket: TcpStream,
        is_initiator: bool,
        info: RtpSessionInfo,
        observer: Weak<dyn SessionObserver>,
        bucket_rate_bps: u32,
        bucket_capacity: u64,
        reorder_window: Option<u16>,
    ) -> io::Result<Arc<Self>> {
        let config = TcpConfig::default();
        let transport = TcpTransport::new(reactor, socket, is_initiator, &config)?;
        Self::from_transport(
            transport,
            info,
            observer,
            bucket_rate_bps,
            bucket_capacity,
            reorder_window,
        )
    }

    /// Wrap any already-connected [`Transport`] as a session. This is the
    /// generic entry point `RtpSession::new` is a TCP-flavored convenience
    /// wrapper around; UDP- and multicast-backed sessions go through this
    /// directly with their own [`crate::transport::udp::UdpTransport`] or
    /// [`crate::transport::multicast::McastTransport`].
    pub fn from_transport(
        transport: Arc<dyn Transport>,
        info: RtpSessionInfo,
        observer: Weak<dyn SessionObserver>,
        bucket_rate_bps: u32,
        bucket_capacity: u64,
        reorder_window: Option<u16>,
    ) -> io::Result<Arc<Self>> {
        let session = Arc::new(Self {
            transport,
            state: Mutex::new(SessionState {
                bucket: BaseBucket::new(bucket_rate_bps, bucket_capacity),
                reorder: reorder_window.map(ReorderBuffer::new),
                recv_accum: Vec::new(),
                input_enabled: true,
                output_enabled: true,
                timed_queue: VecDeque::new(),
                timed_duration_ms: 0,
                timed_elapsed_ms: 0,
                timed_timer: None,
            }),
            observer,
            info,
            connected: AtomicBool::new(true),
            self_weak: Mutex::new(Weak::new()),
        });

        *session.self_weak.lock().unwrap() = Arc::downgrade(&session);
        let as_observer: Weak<dyn TransportObserver> = Arc::downgrade(&session);
        session.transport.set_observer(as_observer);

        if let Some(obs) = session.observer.upgrade() {
            obs.on_ok(&session);
        }

        Ok(session)
    }

    pub fn info(&self) -> &RtpSessionInfo {
        &self.info
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue `packet` for sending, encoded per the session's pack mode.
    /// Backpressure is handled by the bucket's redline, not by blocking.
    pub fn send(&self, packet: RtpPacket) -> Result<(), NetError> {
        let mut state = self.state.lock().unwrap();
        if !state.output_enabled {
            return Ok(());
        }
        if !state.bucket.push_back(packet) {
            return Err(NetError::ResourceExhausted);
        }
        self.drain_bucket(&mut state)
    }

    /// Queue `packet` onto a time-scheduled deque served by a 1 ms ticker:
    /// each tick releases `ceil(len / remaining_ms)` packets from the deque
    /// into the bucket, so the whole batch clears the deque within
    /// `duration_ms` of the first packet that started it. `duration_ms`
    /// only takes effect when it starts a new batch (the deque was empty);
    /// packets appended to an in-flight batch ride its existing deadline.
    pub fn send_packet_by_timer(&self, packet: RtpPacket, duration_ms: u64, reactor: &Reactor) {
        let mut state = self.state.lock().unwrap();
        let starting_new_batch = state.timed_queue.is_empty();
        state.timed_queue.push_back(packet);
        if starting_new_batch {
            state.timed_duration_ms = duration_ms.max(1);
            state.timed_elapsed_ms = 0;
        }
        if state.timed_timer.is_none() {
            let weak = self.self_weak.lock().unwrap().clone();
            let id = reactor.schedule_timer(Duration::from_millis(1), Some(Duration::from_millis(1)), move || {
                if let Some(session) = weak.upgrade() {
                    session.tick_timed_queue();
                }
            });
            state.timed_timer = Some(id);
        }
    }

    /// Stop the 1 ms ticker started by [`Self::send_packet_by_timer`]. A
    /// no-op if no batch is in flight. The reactor has no self-cancelling
    /// timer primitive, so whoever holds it is responsible for calling this
    /// before dropping the session if a batch might still be pending.
    pub fn stop_timed_queue(&self, reactor: &Reactor) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.timed_timer.take() {
            reactor.cancel_timer(id);
        }
    }

    fn tick_timed_queue(&self) {
        let mut state = self.state.lock().unwrap();
        if state.timed_queue.is_empty() || !state.output_enabled {
            return;
        }
        state.timed_elapsed_ms += 1;
        let remaining_ms = state.timed_duration_ms.saturating_sub(state.timed_elapsed_ms).max(1);
        let queued = state.timed_queue.len() as u64;
        let release = queued.div_ceil(remaining_ms).max(1) as usize;
        for _ in 0..release {
            let Some(packet) = state.timed_queue.pop_front() else {
                break;
            };
            state.bucket.push_back(packet);
        }
        let _ = self.drain_bucket(&mut state);
    }

    /// Pause upcalls to the observer without suspending the transport: bytes
    /// keep arriving and keep being parsed off the wire, they're just not
    /// forwarded to [`SessionObserver::on_recv`] while disabled.
    pub fn enable_input(&self, enabled: bool) {
        self.state.lock().unwrap().input_enabled = enabled;
    }

    /// Empty the outbound bucket and, while disabled, hold it empty: neither
    /// [`Self::send`] nor a running [`Self::send_packet_by_timer`] batch
    /// pushes anything onto it until re-enabled.
    pub fn enable_output(&self, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        state.output_enabled = enabled;
        if !enabled {
            state.bucket.reset();
        } else {
            let _ = self.drain_bucket(&mut state);
        }
    }

    fn drain_bucket(&self, state: &mut SessionState) -> Result<(), NetError> {
        if !state.output_enabled {
            return Ok(());
        }
        while state.bucket.can_send_front() {
            let Some(packet) = state.bucket.front().cloned() else {
                break;
            };
            let bytes = packet.to_bytes();
            match self.transport.send(&bytes) {
                Ok(_) => {
                    state.bucket.consume_front_tokens();
                    state.bucket.pop_front();
                }
                Err(NetError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn deliver(&self, state: &mut SessionState, packet: RtpPacket) {
        match state.reorder.as_mut() {
            Some(reorder) => {
                reorder.push(packet.rfc.sequence, packet.to_bytes());
                let force = reorder.gap_is_broken();
                for (_seq, bytes) in reorder.drain(force) {
                    if let Some((reassembled, _)) = RtpPacket::parse(self.info.pack_mode, &bytes) {
                        if state.input_enabled {
                            if let Some(obs) = self.observer.upgrade() {
                                obs.on_recv(self, reassembled);
                            }
                        }
                    }
                }
            }
            None => {
                if state.input_enabled {
                    if let Some(obs) = self.observer.upgrade() {
                        obs.on_recv(self, packet);
                    }
                }
            }
        }
    }
}

impl TransportObserver for RtpSession {
    fn on_recv(&self, buf: &[u8], _remote: Option<SocketAddr>) {
        let mut state = self.state.lock().unwrap();
        state.recv_accum.extend_from_slice(buf);
        while let Some((packet, consumed)) = RtpPacket::parse(self.info.pack_mode, &state.recv_accum) {
            state.recv_accum.drain(0..consumed);
            self.deliver(&mut state, packet);
        }
    }

    fn on_send(&self) {
        let mut state = self.state.lock().unwrap();
        let _ = self.drain_bucket(&mut state);
        drop(state);
        if let Some(obs) = self.observer.upgrade() {
            obs.on_send(self);
        }
    }

    fn on_close(&self, error: Option<NetError>) {
        self.connected.store(false, Ordering::Release);
        if let Some(obs) = self.observer.upgrade() {
            let io_err = error.map(|e| match e {
                NetError::Io(e) => e,
                other => io::Error::other(other.to_string()),
            });
            obs.on_close(self, io_err);
        }
    }

    fn on_heartbeat(&self) {
        if let Some(obs) = self.observer.upgrade() {
            obs.on_heartbeat(self, 0);
        }
    }
}
