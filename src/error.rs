// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types.
//!
//! One enum per subsystem rather than a single crate-wide error: `NetError`
//! covers the reactor/transport/handshake surface, `HubError` the service
//! hub, `RtpError` the packet/session layer. `EWOULDBLOCK`-class I/O errors
//! are handled inline by callers and never become a `NetError::Io` — by the
//! time one reaches here it's something the caller couldn't recover from.

use std::fmt;
use std::net::SocketAddr;

/// Errors raised by the reactor, transports, acceptors/connectors, and
/// handshakers.
#[derive(Debug)]
pub enum NetError {
    /// An operation did not complete within its deadline.
    Timeout,
    /// The peer closed the connection, or we closed it ourselves.
    Closed { peer: Option<SocketAddr> },
    /// An I/O error that wasn't `WouldBlock`.
    Io(std::io::Error),
    /// A TLS-layer error.
    #[cfg(feature = "tcp-tls")]
    Tls(crate::transport::tcp::tls::TlsError),
    /// A malformed or unexpected protocol element (bad frame, bad handshake
    /// nonce, unsupported pack mode).
    Protocol(&'static str),
    /// A resource (slab handle, worker slot, file descriptor) was not
    /// available.
    ResourceExhausted,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Timeout => write!(f, "operation timed out"),
            NetError::Closed { peer: Some(addr) } => write!(f, "connection to {addr} closed"),
            NetError::Closed { peer: None } => write!(f, "connection closed"),
            NetError::Io(e) => write!(f, "I/O error: {e}"),
            #[cfg(feature = "tcp-tls")]
            NetError::Tls(e) => write!(f, "TLS error: {e}"),
            NetError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            NetError::ResourceExhausted => write!(f, "resource exhausted"),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetError::Io(e) => Some(e),
            #[cfg(feature = "tcp-tls")]
            NetError::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Io(e)
    }
}

/// Errors raised by [`crate::hub::ServiceHub`] and [`crate::hub::ServiceHost`].
#[derive(Debug)]
pub enum HubError {
    /// `ServicePacket::check_magic` failed on a received frame.
    BadMagic,
    /// The frame was shorter than a full `ServicePacket`.
    Truncated,
    /// No host is registered for the requested service id.
    UnknownService(u8),
    /// Passing a file descriptor to the peer process failed.
    FdPassing(std::io::Error),
    /// Underlying I/O error on the control pipe.
    Io(std::io::Error),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::BadMagic => write!(f, "service packet magic mismatch"),
            HubError::Truncated => write!(f, "service packet truncated"),
            HubError::UnknownService(id) => write!(f, "no host registered for service {id}"),
            HubError::FdPassing(e) => write!(f, "fd passing failed: {e}"),
            HubError::Io(e) => write!(f, "hub I/O error: {e}"),
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HubError::FdPassing(e) | HubError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::Io(e)
    }
}

/// Errors raised while encoding/decoding or admitting RTP packets.
#[derive(Debug)]
pub enum RtpError {
    /// The buffer was too short to contain a full header for the given pack
    /// mode.
    Truncated,
    /// The pack-mode tag in the header didn't match any known mode.
    UnsupportedPackMode(u8),
    /// The payload length exceeded the pack mode's length-prefix width.
    PayloadTooLarge { len: usize, max: usize },
    /// The session's bucket rejected the packet (over budget, not at a GOP
    /// boundary for video).
    BucketRejected,
}

impl fmt::Display for RtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtpError::Truncated => write!(f, "RTP packet truncated"),
            RtpError::UnsupportedPackMode(tag) => write!(f, "unsupported pack mode tag {tag}"),
            RtpError::PayloadTooLarge { len, max } => {
                write!(f, "payload length {len} exceeds maximum {max}")
            }
            RtpError::BucketRejected => write!(f, "rejected by flow-control bucket"),
        }
    }
}

impl std::error::Error for RtpError {}
