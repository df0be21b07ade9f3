// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP stream transport.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                    TcpConnection                              |
//! |  +-------------+ +-------------+ +-----------------+        |
//! |  | ByteStream  | | FrameCodec  | | ConnectionState |        |
//! |  +-------------+ +-------------+ +-----------------+        |
//! +-------------------------------------------------------------+
//! ```
//!
//! One `TcpConnection` per peer; a caller holding several peers keeps its
//! own `HashMap<SocketAddr, TcpConnection>`, the way [`crate::session`] does.
//! Readiness and dispatch live in [`crate::reactor`]; this module owns only
//! the framing and connection state, not its own event loop.
//!
//! # Wire Format
//!
//! TCP requires framing since it's a stream protocol. Each message is
//! prefixed with a 4-byte big-endian length:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Payload           |
//! +----------------+-------------------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use corenet::transport::tcp::{TcpConfig, TcpConnection};
//!
//! let config = TcpConfig {
//!     enabled: true,
//!     listen_port: 7410,
//!     ..Default::default()
//! };
//! ```
//!
//! # Modules
//!
//! - `config` - Configuration types (`TcpConfig`, `TcpRole`)
//! - `frame_codec` - Length-prefix framing codec
//! - `byte_stream` - Stream abstraction for TCP/TLS
//! - `connection` - TCP connection state machine
//! - `transport` - [`Transport`](crate::transport::Transport) adapter over `connection`
//! - `tls` - TLS encryption support (requires `tcp-tls` feature)

pub mod byte_stream;
pub mod config;
pub mod frame_codec;

pub mod connection;
pub mod transport;

pub mod tls;

// ============================================================================
// Re-exports
// ============================================================================

// Config types
pub use config::{TcpConfig, TcpRole};

// Frame codec
pub use frame_codec::{
    extract_frame, peek_frame_header, FrameCodec, ParseResult, DEFAULT_MAX_MESSAGE_SIZE,
    FRAME_HEADER_SIZE, MIN_RTPS_MESSAGE_SIZE,
};

// Byte stream
pub use byte_stream::{BoxedByteStream, ByteStream};

// Connection types
pub use connection::{ConnectionState, FlushResult, TcpConnection, TcpConnectionStats};

// Transport adapter
pub use transport::TcpTransport;

// TLS
#[cfg(feature = "tcp-tls")]
pub use tls::{TlsAcceptor, TlsConnector, TlsStream};
pub use tls::{TlsConfig, TlsConfigBuilder, TlsError, TlsVersion};

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify key types are accessible
        let _ = TcpConfig::default();
        let _ = TcpRole::Both;
        let _ = FrameCodec::new(1024);
    }

    #[test]
    fn test_constants() {
        assert_eq!(FRAME_HEADER_SIZE, 4);
    }
}
