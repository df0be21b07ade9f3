// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Arena-backed send/receive buffer pools.
//!
//! Sockets and RTP sessions borrow fixed-size buffers from a shared
//! [`SlabPool`](crate::core::rt::SlabPool) instead of allocating per-message.
//! A [`SlabHandle`] is a cheap `Copy` token (pool id + slot id packed into a
//! `u32`); the backing bytes live until [`BufferPool::release`] is called.
//!
//! This wraps the same pool [`crate::core::rt`] already exposes, giving it
//! socket-buffer-shaped naming so transport code doesn't reach into
//! `core::rt` directly.

use crate::core::rt::{SlabHandle, SlabPool};
use std::sync::Arc;

/// A pool of reusable, size-classed byte buffers.
///
/// Cloning is cheap (`Arc` internally); every transport and the reactor
/// share one instance via [`BufferPool::shared`].
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<SlabPool>,
}

impl BufferPool {
    /// Wrap the process-wide slab pool.
    pub fn shared() -> Self {
        Self {
            inner: crate::core::rt::get_slab_pool(),
        }
    }

    /// Create a private pool, useful in tests that want isolation from the
    /// process-wide singleton.
    pub fn private() -> Self {
        Self {
            inner: Arc::new(SlabPool::new()),
        }
    }

    /// Reserve a buffer able to hold at least `len` bytes, returning a handle
    /// and the mutable slice to fill. Returns `None` if every pool at or
    /// above the matching size class is full.
    pub fn reserve(&self, len: usize) -> Option<(SlabHandle, &mut [u8])> {
        self.inner.reserve(len)
    }

    /// Borrow the committed bytes backing `handle`.
    pub fn get(&self, handle: SlabHandle) -> &[u8] {
        self.inner.get_buffer(handle)
    }

    /// Return a buffer to the pool.
    pub fn release(&self, handle: SlabHandle) {
        self.inner.release(handle);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_roundtrip() {
        let pool = BufferPool::private();
        let (handle, slice) = pool.reserve(64).expect("reserve should succeed");
        slice[0] = 0xAB;
        pool.release(handle);
    }

    #[test]
    fn shared_pool_is_actually_shared() {
        let a = BufferPool::shared();
        let b = BufferPool::shared();
        let (handle, _) = a.reserve(16).unwrap();
        let _ = b.get(handle);
        b.release(handle);
    }
}
