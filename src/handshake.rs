// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-setup handshakers.
//!
//! A handshaker owns a raw socket for the duration of connection setup and
//! yields it back on completion along with whatever came with it: an
//! optional context (a TLS setup, or an extended-handshake nonce) and any
//! payload bytes that arrived piggy-backed on the handshake itself.
//! Ownership moves rather than being borrowed back and forth, so a caller
//! can never accidentally touch a socket mid-handshake from two places at
//! once.
//!
//! Two distinct handshakes live here:
//!
//! - [`TcpHandshaker`] (§4.4.1-style): optionally send a fixed payload,
//!   optionally receive a fixed number of bytes, in either order.
//! - [`ServerExtHandshaker`] / [`ClientExtHandshaker`] (§4.5): the extended
//!   handshake used by [`crate::acceptor_connector`] and the service hub to
//!   carry a `serviceId`/`serviceOpt`/nonce past the raw TCP connect.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

/// Outcome of a completed handshake: the raw socket, an optional context
/// (only meaningful for handshakers that produce one, e.g. the extended
/// handshake's nonce or a TLS setup), and bytes that were already read off
/// the wire while completing the handshake and must not be discarded.
pub struct HandshakeOutcome<Ctx = ()> {
    pub socket: TcpStream,
    pub ctx: Option<Ctx>,
    pub leftover: Vec<u8>,
}

/// A handshaker drives zero or more socket round-trips to completion and
/// then gives the socket back.
pub trait Handshaker {
    type Context;

    /// Advance the handshake. Returns `Ok(None)` if more I/O is needed
    /// (caller should wait for readability/writability and call again),
    /// `Ok(Some(outcome))` once complete.
    fn poll(&mut self) -> std::io::Result<Option<HandshakeOutcome<Self::Context>>>;

    /// Whether the handshake is still in progress.
    fn is_handshaking(&self) -> bool;
}

/// The plain TCP handshake (§4.4.1): convert a freshly accepted/connected
/// socket into a transport by optionally sending a fixed payload and/or
/// receiving a fixed number of bytes. The initial interest mask a caller
/// should register for is determined by the same parameters:
///
/// - `recv_data_size == 0` -> WRITE only
/// - no `send_data` -> READ only
/// - `recv_first` true -> READ only (then flip to WRITE)
/// - otherwise -> READ | WRITE
pub struct TcpHandshaker {
    socket: Option<TcpStream>,
    send_data: Option<Vec<u8>>,
    sent: usize,
    recv_data_size: usize,
    recv_first: bool,
    buf: Vec<u8>,
    deadline: Instant,
}

impl TcpHandshaker {
    pub fn new(
        socket: TcpStream,
        send_data: Option<Vec<u8>>,
        recv_data_size: usize,
        recv_first: bool,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Some(socket),
            send_data,
            sent: 0,
            recv_data_size,
            recv_first,
            buf: Vec::with_capacity(recv_data_size),
            deadline: Instant::now() + timeout,
        })
    }

    fn drive_send(&mut self) -> std::io::Result<bool> {
        let Some(data) = self.send_data.as_ref() else {
            return Ok(true);
        };
        let socket = self.socket.as_mut().expect("poll called after completion");
        while self.sent < data.len() {
            match socket.write(&data[self.sent..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed during handshake send",
                    ))
                }
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn drive_recv(&mut self) -> std::io::Result<bool> {
        if self.recv_data_size == 0 {
            return Ok(true);
        }
        let socket = self.socket.as_mut().expect("poll called after completion");
        let mut chunk = [0u8; 4096];
        while self.buf.len() < self.recv_data_size {
            let want = (self.recv_data_size - self.buf.len()).min(chunk.len());
            match socket.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed during handshake recv",
                    ))
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl Handshaker for TcpHandshaker {
    type Context = ();

    fn poll(&mut self) -> std::io::Result<Option<HandshakeOutcome<()>>> {
        if Instant::now() > self.deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "tcp handshake timed out",
            ));
        }

        let done = if self.recv_first {
            self.drive_recv()? && self.drive_send()?
        } else {
            self.drive_send()? && self.drive_recv()?
        };
        if !done {
            return Ok(None);
        }

        let socket = self.socket.take().unwrap();
        Ok(Some(HandshakeOutcome {
            socket,
            ctx: None,
            leftover: std::mem::take(&mut self.buf),
        }))
    }

    fn is_handshaking(&self) -> bool {
        self.socket.is_some()
    }
}

impl TcpHandshaker {
    /// Borrow the socket this handshaker is driving, for registering a
    /// duplicated readiness source without taking I/O ownership away from
    /// the handshaker itself.
    pub(crate) fn peek_socket(&self) -> &TcpStream {
        self.socket.as_ref().expect("peek_socket called after completion")
    }
}

/// A 32-byte nonce carried by the extended handshake.
pub type Nonce = [u8; 32];

/// `serviceId`, `serviceOpt`, and the nonce `r` a completed extended
/// handshake produces -- `on_accept_ex`/`on_connect_ok_ex`'s payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtHandshakeInfo {
    pub service_id: u8,
    pub service_opt: u8,
    pub nonce: Nonce,
}

/// `r` viewed as a big-endian 256-bit integer, incremented by 1 and wrapped
/// back to big-endian bytes.
fn increment_nonce(r: &Nonce) -> Nonce {
    let mut out = *r;
    for byte in out.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
    out
}

fn random_nonce() -> Nonce {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let mut out = [0u8; 32];
    for chunk in out.chunks_mut(8) {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u128(Instant::now().elapsed().as_nanos());
        hasher.write_usize(chunk.as_ptr() as usize);
        chunk.copy_from_slice(&hasher.finish().to_ne_bytes()[..chunk.len()]);
    }
    out
}

const EXT_CLIENT_REPLY_LEN: usize = 1 + 1 + 32 + 32;

/// Server side of the extended handshake (§4.5): send a 32-byte nonce `r`,
/// then receive `serviceId:u8 ‖ serviceOpt:u8 ‖ r:[u8;32] ‖ r_plus_1:[u8;32]`
/// and verify `r_plus_1 == r + 1`. A client that replies with a non-
/// incremented `r_plus_1` is never rejected outright -- the handshake
/// simply never completes, and the caller observes a timeout at `deadline`,
/// same as a client that never replies at all.
pub struct ServerExtHandshaker {
    socket: Option<TcpStream>,
    nonce: Nonce,
    sent: usize,
    buf: Vec<u8>,
    verified: Option<ExtHandshakeInfo>,
    deadline: Instant,
}

impl ServerExtHandshaker {
    pub fn new(socket: TcpStream, timeout: Duration) -> std::io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Some(socket),
            nonce: random_nonce(),
            sent: 0,
            buf: Vec::with_capacity(EXT_CLIENT_REPLY_LEN),
            verified: None,
            deadline: Instant::now() + timeout,
        })
    }
}

impl Handshaker for ServerExtHandshaker {
    type Context = ExtHandshakeInfo;

    fn poll(&mut self) -> std::io::Result<Option<HandshakeOutcome<ExtHandshakeInfo>>> {
        if Instant::now() > self.deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "extended handshake timed out",
            ));
        }

        let socket = self.socket.as_mut().expect("poll called after completion");

        while self.sent < self.nonce.len() {
            match socket.write(&self.nonce[self.sent..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed while receiving server nonce",
                    ))
                }
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        if self.verified.is_none() {
            let mut chunk = [0u8; EXT_CLIENT_REPLY_LEN];
            while self.buf.len() < EXT_CLIENT_REPLY_LEN {
                match socket.read(&mut chunk[self.buf.len()..]) {
                    Ok(0) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "peer closed during extended handshake reply",
                        ))
                    }
                    Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(e),
                }
            }

            let service_id = self.buf[0];
            let service_opt = self.buf[1];
            let r: Nonce = self.buf[2..34].try_into().unwrap();
            let r_plus_1: Nonce = self.buf[34..66].try_into().unwrap();

            if r != self.nonce || r_plus_1 != increment_nonce(&r) {
                // Not incremented (or doesn't echo our nonce): per the
                // protocol this is left to resolve by timing out, not an
                // immediate protocol error, so nothing is accepted and we
                // simply wait until the deadline above fires.
                self.buf.clear();
                return Ok(None);
            }
            self.verified = Some(ExtHandshakeInfo {
                service_id,
                service_opt,
                nonce: r,
            });
        }

        let socket = self.socket.take().unwrap();
        Ok(Some(HandshakeOutcome {
            socket,
            ctx: self.verified,
            leftover: Vec::new(),
        }))
    }

    fn is_handshaking(&self) -> bool {
        self.socket.is_some()
    }
}

impl ServerExtHandshaker {
    pub(crate) fn peek_socket(&self) -> &TcpStream {
        self.socket.as_ref().expect("peek_socket called after completion")
    }
}

/// Client side of the extended handshake (§4.5): receive the server's
/// 32-byte nonce `r`, then send `serviceId ‖ serviceOpt ‖ r ‖ r+1`.
pub struct ClientExtHandshaker {
    socket: Option<TcpStream>,
    service_id: u8,
    service_opt: u8,
    recv_buf: Vec<u8>,
    reply: Vec<u8>,
    sent: usize,
    nonce: Option<Nonce>,
    deadline: Instant,
}

impl ClientExtHandshaker {
    pub fn new(
        socket: TcpStream,
        service_id: u8,
        service_opt: u8,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Some(socket),
            service_id,
            service_opt,
            recv_buf: Vec::with_capacity(32),
            reply: Vec::new(),
            sent: 0,
            nonce: None,
            deadline: Instant::now() + timeout,
        })
    }
}

impl Handshaker for ClientExtHandshaker {
    type Context = ExtHandshakeInfo;

    fn poll(&mut self) -> std::io::Result<Option<HandshakeOutcome<ExtHandshakeInfo>>> {
        if Instant::now() > self.deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "extended handshake timed out",
            ));
        }

        let socket = self.socket.as_mut().expect("poll called after completion");

        if self.nonce.is_none() {
            let mut chunk = [0u8; 32];
            while self.recv_buf.len() < 32 {
                match socket.read(&mut chunk[self.recv_buf.len()..]) {
                    Ok(0) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "peer closed before sending server nonce",
                        ))
                    }
                    Ok(n) => self.recv_buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
            let r: Nonce = self.recv_buf[..32].try_into().unwrap();
            self.nonce = Some(r);

            let mut reply = Vec::with_capacity(EXT_CLIENT_REPLY_LEN);
            reply.push(self.service_id);
            reply.push(self.service_opt);
            reply.extend_from_slice(&r);
            reply.extend_from_slice(&increment_nonce(&r));
            self.reply = reply;
        }

        while self.sent < self.reply.len() {
            match socket.write(&self.reply[self.sent..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed while sending extended handshake reply",
                    ))
                }
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        let socket = self.socket.take().unwrap();
        Ok(Some(HandshakeOutcome {
            socket,
            ctx: Some(ExtHandshakeInfo {
                service_id: self.service_id,
                service_opt: self.service_opt,
                nonce: self.nonce.unwrap(),
            }),
            leftover: Vec::new(),
        }))
    }

    fn is_handshaking(&self) -> bool {
        self.socket.is_some()
    }
}

impl ClientExtHandshaker {
    pub(crate) fn peek_socket(&self) -> &TcpStream {
        self.socket.as_ref().expect("peek_socket called after completion")
    }
}

#[cfg(feature = "tcp-tls")]
pub use crate::transport::tcp::tls::{TlsAcceptor, TlsConnector};

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn nonce_increments_across_byte_boundary() {
        let mut r = [0u8; 32];
        r[31] = 0xFF;
        let r_plus_1 = increment_nonce(&r);
        assert_eq!(r_plus_1[31], 0x00);
        assert_eq!(r_plus_1[30], 1);
    }

    #[test]
    fn nonce_increment_wraps_at_all_ones() {
        let r = [0xFFu8; 32];
        let r_plus_1 = increment_nonce(&r);
        assert_eq!(r_plus_1, [0u8; 32]);
    }

    #[test]
    fn extended_handshake_completes_with_matching_service_and_nonce() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut h = ServerExtHandshaker::new(sock, Duration::from_secs(2)).unwrap();
            loop {
                if let Some(outcome) = h.poll().unwrap() {
                    return outcome.ctx.unwrap();
                }
                thread::sleep(Duration::from_millis(2));
            }
        });

        let client_sock = TcpStream::connect(addr).unwrap();
        let mut c = ClientExtHandshaker::new(client_sock, 7, 0, Duration::from_secs(2)).unwrap();
        let client_info = loop {
            if let Some(outcome) = c.poll().unwrap() {
                break outcome.ctx.unwrap();
            }
            thread::sleep(Duration::from_millis(2));
        };

        let server_info = server.join().unwrap();
        assert_eq!(server_info, client_info);
        assert_eq!(server_info.service_id, 7);
        assert_eq!(server_info.service_opt, 0);
    }

    #[test]
    fn non_incremented_reply_times_out_rather_than_erroring_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut h = ServerExtHandshaker::new(sock, Duration::from_millis(100)).unwrap();
            loop {
                match h.poll() {
                    Ok(Some(_)) => panic!("handshake should not have completed"),
                    Ok(None) => thread::sleep(Duration::from_millis(2)),
                    Err(e) => return e.kind(),
                }
            }
        });

        let mut client_sock = TcpStream::connect(addr).unwrap();
        let mut r = [0u8; 32];
        client_sock.read_exact(&mut r).unwrap();
        // Echo r back as r_plus_1 unmodified -- the malformed reply.
        let mut bad_reply = Vec::new();
        bad_reply.push(7u8);
        bad_reply.push(0u8);
        bad_reply.extend_from_slice(&r);
        bad_reply.extend_from_slice(&r);
        client_sock.write_all(&bad_reply).unwrap();

        let kind = server.join().unwrap();
        assert_eq!(kind, std::io::ErrorKind::TimedOut);
    }
}
