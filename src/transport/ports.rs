// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ephemeral port allocation for outbound sockets.
//!
//! One process-wide [`PortAllocator`] per transport kind hands out ports
//! from a configurable range by walking forward from a random starting
//! offset, wrapping at the top of the range. `rfc`-mode allocation always
//! returns an even port, leaving the odd port above it free for a paired
//! control channel (the RTP/RTCP convention in RFC 3550).

use std::sync::{Mutex, OnceLock};

const DEFAULT_MIN_PORT: u16 = 3000;
const DEFAULT_MAX_PORT: u16 = 5999;

struct AllocatorState {
    base: u16,
    span: u16,
    cursor: u16,
}

impl AllocatorState {
    fn new(base: u16, span: u16) -> Self {
        Self {
            base,
            span,
            cursor: (fastrand::u16(..) % span.max(1)) / 2 * 2,
        }
    }
}

/// A process-wide pool of ephemeral ports for one transport kind.
pub struct PortAllocator {
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState::new(DEFAULT_MIN_PORT, DEFAULT_MAX_PORT - DEFAULT_MIN_PORT)),
        }
    }

    /// Restrict future allocations to `[min_port, max_port]`. Both bounds are
    /// rounded inward to an even/odd pair so `rfc`-mode allocation always has
    /// room for a paired port above it. Returns `false` and leaves the
    /// current range untouched if the range is degenerate after rounding.
    pub fn set_port_range(&self, mut min_port: u16, mut max_port: u16) -> bool {
        if min_port == 0 || min_port >= max_port {
            return false;
        }
        if min_port % 2 != 0 {
            min_port += 1;
        }
        if max_port % 2 == 0 {
            max_port -= 1;
        }
        if min_port >= max_port {
            return false;
        }

        let mut state = self.state.lock().unwrap();
        *state = AllocatorState::new(min_port, max_port - min_port);
        true
    }

    /// The current `(min_port, max_port)` range.
    pub fn port_range(&self) -> (u16, u16) {
        let state = self.state.lock().unwrap();
        (state.base, state.base + state.span)
    }

    /// Allocate the next port in the range. If `rfc` is set, the result is
    /// always even (so the caller can reserve the following odd port for a
    /// companion RTCP-style control channel).
    pub fn alloc_port(&self, rfc: bool) -> u16 {
        let mut state = self.state.lock().unwrap();
        let span = state.span.max(1);
        let mut port = state.base + state.cursor % span;
        state.cursor = state.cursor.wrapping_add(2);
        if rfc && port % 2 != 0 {
            port -= 1;
        }
        port
    }
}

static UDP_PORTS: OnceLock<PortAllocator> = OnceLock::new();
static TCP_PORTS: OnceLock<PortAllocator> = OnceLock::new();

/// The process-wide UDP ephemeral port allocator.
pub fn udp_ports() -> &'static PortAllocator {
    UDP_PORTS.get_or_init(PortAllocator::new)
}

/// The process-wide TCP ephemeral port allocator.
pub fn tcp_ports() -> &'static PortAllocator {
    TCP_PORTS.get_or_init(PortAllocator::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_range_matches_original() {
        let (min, max) = PortAllocator::new().port_range();
        assert_eq!((min, max), (DEFAULT_MIN_PORT, DEFAULT_MAX_PORT));
    }

    #[test]
    fn rfc_mode_always_returns_even_port() {
        let alloc = PortAllocator::new();
        for _ in 0..32 {
            assert_eq!(alloc.alloc_port(true) % 2, 0);
        }
    }

    #[test]
    fn set_port_range_rounds_inward() {
        let alloc = PortAllocator::new();
        assert!(alloc.set_port_range(4001, 4100));
        let (min, max) = alloc.port_range();
        assert_eq!(min, 4002);
        assert_eq!(max, 4099);
    }

    #[test]
    fn rejects_degenerate_range() {
        let alloc = PortAllocator::new();
        assert!(!alloc.set_port_range(100, 100));
        assert!(!alloc.set_port_range(0, 1000));
    }

    #[test]
    fn allocations_stay_within_range() {
        let alloc = PortAllocator::new();
        assert!(alloc.set_port_range(6000, 6010));
        for _ in 0..64 {
            let port = alloc.alloc_port(false);
            assert!((6000..=6010).contains(&port));
        }
    }
}
