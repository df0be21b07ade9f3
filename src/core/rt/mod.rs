// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime primitives: the arena-backed buffer pool and the waitset
//! readiness driver, both shared by [`crate::reactor`] and [`crate::buffer`].

pub mod slabpool;
pub mod waitset;

pub use slabpool::{SlabHandle, SlabPool};
pub use waitset::{
    WaitsetDriver, WaitsetRegistration, WaitsetSignal, WaitsetWaitError, WAITSET_DEFAULT_MAX_SLOTS,
};

use std::sync::{Arc, OnceLock};

static GLOBAL_SLAB_POOL: OnceLock<Arc<SlabPool>> = OnceLock::new();

/// Initialize the process-wide slab pool backing socket send/receive
/// buffers. Idempotent: subsequent calls return the already-initialized
/// instance.
pub fn init_slab_pool() -> Arc<SlabPool> {
    GLOBAL_SLAB_POOL
        .get_or_init(|| Arc::new(SlabPool::new()))
        .clone()
}

/// Get the process-wide slab pool, creating it on first access.
pub fn get_slab_pool() -> Arc<SlabPool> {
    GLOBAL_SLAB_POOL
        .get()
        .cloned()
        .unwrap_or_else(init_slab_pool)
}
