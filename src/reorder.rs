// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet reordering for unreliable transports.
//!
//! A playback consumer reading media over UDP needs packets delivered in
//! sequence order even though the network doesn't guarantee that; a
//! [`ReorderBuffer`] holds a sliding window of out-of-order arrivals and
//! drains them in order once the gap in front of them is filled -- or once
//! `force` is requested, for a consumer that would rather skip a stuck gap
//! than stall.
//!
//! Packets arrive carrying only a 16-bit wire sequence number, which wraps
//! every 65536 packets. Keying the buffer directly by that `u16` breaks
//! ordering the moment a run of pushes straddles the wrap (e.g. 65530 then
//! 2 sort as `{2, 65530}` in a plain `BTreeMap<u16, _>`, backwards from
//! arrival/temporal order). Instead every incoming `seq16` is extended to a
//! monotonic 64-bit key relative to the last extended value seen (biased
//! well away from zero so the extension can walk backward across a few
//! wrap boundaries without underflowing): the 16-bit circular direction
//! (forward or backward) within `MAX_LOSS_COUNT` of that anchor is assumed
//! correct, and a gap wider than that in both directions means the stream
//! reset (a restart, a long stall) rather than ordinary reordering.
//!
//! The window-height and broken-duration limits mirror the reader-side
//! gap-tracking idea in [`crate::reliability::GapTracker`]: bound memory by
//! capping how far the window can grow, and force a drain after a gap has
//! been open too long instead of waiting forever for a packet that was
//! dropped by the network.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Ceiling on the circular distance between a newly-extended 64-bit
/// sequence and the extension anchor; past this, the stream is treated as
/// reset rather than merely reordered.
pub const MAX_LOSS_COUNT: u32 = 15_000;

/// Starting offset for the extended 64-bit sequence space, chosen so a
/// stream that walks backward across a wrap boundary never underflows.
const SEQ_BIAS: u64 = 1 << 32;

struct Slot {
    seq16: u16,
    payload: Vec<u8>,
    arrived_at: Instant,
}

/// Holds out-of-order packets until they can be drained in sequence order.
pub struct ReorderBuffer {
    window: u16,
    max_broken: Duration,
    /// Anchor for extending the next `seq16` into 64-bit space; tracks the
    /// most recently extended value regardless of whether that packet was
    /// ultimately queued or dropped as a duplicate.
    last_seq64: Option<u64>,
    /// The next sequence expected, in extended 64-bit space. `None` until
    /// the first successful drain establishes it -- nothing pushed before
    /// that point is "too old" yet, however small its sequence number.
    min_seq64: Option<u64>,
    last_activity: Option<Instant>,
    last_drain_at: Instant,
    slots: BTreeMap<u64, Slot>,
}

impl ReorderBuffer {
    /// `window` bounds how many distinct sequence numbers can be held
    /// before the oldest is force-evicted to make room.
    pub fn new(window: u16) -> Self {
        Self {
            window,
            max_broken: Duration::from_secs(5),
            last_seq64: None,
            min_seq64: None,
            last_activity: None,
            last_drain_at: Instant::now(),
            slots: BTreeMap::new(),
        }
    }

    /// How long a gap may stay open before [`Self::drain`] should be called
    /// with `force = true` by the caller's timer. Also the silence window
    /// after which the next push resynchronizes the buffer from scratch.
    pub fn set_max_broken_duration(&mut self, d: Duration) {
        self.max_broken = d;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the current gap has been open at least as long as the
    /// configured broken-duration limit (a caller's periodic timer checks
    /// this to decide whether to force-drain).
    pub fn gap_is_broken(&self) -> bool {
        !self.slots.is_empty() && self.last_drain_at.elapsed() >= self.max_broken
    }

    /// Insert a packet arriving out of order. A duplicate or already-drained
    /// sequence is silently dropped.
    pub fn push(&mut self, seq16: u16, payload: Vec<u8>) {
        let now = Instant::now();
        let silent = self
            .last_activity
            .map(|t| now.duration_since(t) >= self.max_broken)
            .unwrap_or(true);
        if self.last_seq64.is_none() || silent {
            self.resync(seq16);
        }
        self.last_activity = Some(now);

        let seq64 = match self.extend(seq16) {
            Some(v) => v,
            None => {
                // Drift past MAX_LOSS_COUNT in either direction: the stream
                // has reset (restart, long stall), not just reordered.
                self.resync(seq16);
                self.last_seq64.expect("resync always sets last_seq64")
            }
        };
        self.last_seq64 = Some(seq64);

        if let Some(min) = self.min_seq64 {
            if seq64 < min {
                return; // already consumed
            }
        }
        if self.slots.contains_key(&seq64) {
            return; // duplicate
        }
        self.slots.insert(
            seq64,
            Slot {
                seq16,
                payload,
                arrived_at: now,
            },
        );
        self.evict_past_window();
    }

    /// Extend a wire sequence relative to the current anchor, choosing the
    /// circular direction (ahead of or behind it) implied by the signed
    /// 16-bit difference. Returns `None` if that distance is at or past
    /// `MAX_LOSS_COUNT`.
    fn extend(&self, seq16: u16) -> Option<u64> {
        let anchor = self.last_seq64?;
        let base16 = (anchor & 0xFFFF) as u16;
        let diff = seq16.wrapping_sub(base16) as i16;
        if diff.unsigned_abs() as u32 >= MAX_LOSS_COUNT {
            return None;
        }
        Some((anchor as i64 + diff as i64) as u64)
    }

    fn resync(&mut self, seq16: u16) {
        self.slots.clear();
        self.last_seq64 = Some(SEQ_BIAS + seq16 as u64);
        self.min_seq64 = None;
        self.last_drain_at = Instant::now();
    }

    fn evict_past_window(&mut self) {
        while self.slots.len() as u32 > self.window as u32 {
            if let Some((&oldest, _)) = self.slots.iter().next() {
                self.slots.remove(&oldest);
                self.advance_min(oldest + 1);
            } else {
                break;
            }
        }
    }

    fn advance_min(&mut self, to: u64) {
        self.min_seq64 = Some(match self.min_seq64 {
            Some(cur) if cur > to => cur,
            _ => to,
        });
    }

    /// Drain every packet that's now contiguous from the current low-water
    /// mark, in sequence order. Before the first packet has ever drained,
    /// the low-water mark is established from the lowest sequence present.
    /// If `force` is set and no contiguous run exists, drains the single
    /// lowest-sequence packet instead, skipping the gap in front of it.
    pub fn drain(&mut self, force: bool) -> Vec<(u16, Vec<u8>)> {
        let mut out = Vec::new();

        loop {
            let next = self
                .min_seq64
                .or_else(|| self.slots.keys().next().copied());
            let Some(next) = next else { break };

            match self.slots.remove(&next) {
                Some(slot) => {
                    out.push((slot.seq16, slot.payload));
                    self.min_seq64 = Some(next + 1);
                    self.last_drain_at = Instant::now();
                }
                None => break,
            }
        }

        if out.is_empty() && force && !self.slots.is_empty() {
            if let Some((&seq64, _)) = self.slots.iter().next() {
                let slot = self.slots.remove(&seq64).unwrap();
                out.push((slot.seq16, slot.payload));
                self.min_seq64 = Some(seq64 + 1);
                self.last_drain_at = Instant::now();
            }
        }

        out
    }

    pub fn reset(&mut self) {
        self.slots.clear();
        self.last_seq64 = None;
        self.min_seq64 = None;
        self.last_activity = None;
        self.last_drain_at = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_arrivals_drain_immediately() {
        let mut buf = ReorderBuffer::new(64);
        buf.push(1, vec![1]);
        assert_eq!(buf.drain(false), vec![(1, vec![1])]);
        buf.push(2, vec![2]);
        assert_eq!(buf.drain(false), vec![(2, vec![2])]);
    }

    #[test]
    fn out_of_order_batch_drains_once_gap_fills() {
        let mut buf = ReorderBuffer::new(64);
        buf.push(1, vec![1]);
        assert_eq!(buf.drain(false), vec![(1, vec![1])]);

        buf.push(3, vec![3]);
        buf.push(4, vec![4]);
        assert!(buf.drain(false).is_empty()); // 2 still missing

        buf.push(2, vec![2]);
        assert_eq!(
            buf.drain(false),
            vec![(2, vec![2]), (3, vec![3]), (4, vec![4])]
        );
    }

    #[test]
    fn force_drain_skips_a_stuck_gap() {
        let mut buf = ReorderBuffer::new(64);
        buf.push(1, vec![1]);
        buf.drain(false);

        buf.push(5, vec![5]);
        assert!(buf.drain(false).is_empty());
        assert_eq!(buf.drain(true), vec![(5, vec![5])]);
    }

    #[test]
    fn sequence_wraps_past_u16_max() {
        let mut buf = ReorderBuffer::new(64);
        buf.push(u16::MAX, vec![0xff]);
        assert_eq!(buf.drain(false), vec![(u16::MAX, vec![0xff])]);

        buf.push(0, vec![0x00]);
        assert_eq!(buf.drain(false), vec![(0, vec![0x00])]);
    }

    #[test]
    fn window_eviction_bounds_memory() {
        let mut buf = ReorderBuffer::new(4);
        for seq in (10u16..30).step_by(3) {
            buf.push(seq, vec![seq as u8]);
        }
        assert!(buf.len() <= 4);
    }

    #[test]
    fn rotated_permutation_all_drain_in_order() {
        let mut buf = ReorderBuffer::new(1024);
        let seqs: Vec<u16> = (0..16).collect();
        let mut rotated = seqs.clone();
        rotated.rotate_left(5);
        for &seq in &rotated {
            buf.push(seq, vec![seq as u8]);
        }
        let drained = buf.drain(false);
        let got: Vec<u16> = drained.iter().map(|(s, _)| *s).collect();
        assert_eq!(got, seqs);
    }

    #[test]
    fn permutation_spanning_the_16bit_wrap_still_drains_in_temporal_order() {
        // 65530..=65535 then 0..=5, pushed in reverse arrival order. A plain
        // BTreeMap<u16,_> would sort this as {0..5, 65530..65535} -- the
        // 64-bit extension must keep the wrap-spanning run in the order the
        // wire actually presented it.
        let mut buf = ReorderBuffer::new(1024);
        let seqs: Vec<u16> = (65530..=65535u32)
            .chain(0..=5u32)
            .map(|s| s as u16)
            .collect();
        for &seq in seqs.iter().rev() {
            buf.push(seq, vec![seq as u8]);
        }
        let drained = buf.drain(false);
        let got: Vec<u16> = drained.iter().map(|(s, _)| *s).collect();
        assert_eq!(got, seqs);
    }

    #[test]
    fn a_gap_past_max_loss_count_resets_the_stream() {
        let mut buf = ReorderBuffer::new(1024);
        buf.push(0, vec![0]);
        assert_eq!(buf.drain(false), vec![(0, vec![0])]);

        // A jump far bigger than MAX_LOSS_COUNT in either circular direction
        // can't be explained by reordering; the buffer treats it as a fresh
        // stream starting at this sequence.
        let far = (MAX_LOSS_COUNT as u16).wrapping_add(5000);
        buf.push(far, vec![0xAA]);
        assert_eq!(buf.drain(false), vec![(far, vec![0xAA])]);
    }

    #[test]
    fn silence_past_broken_duration_resyncs_on_the_next_push() {
        let mut buf = ReorderBuffer::new(64);
        buf.set_max_broken_duration(Duration::from_millis(30));
        buf.push(10, vec![10]);
        assert_eq!(buf.drain(false), vec![(10, vec![10])]);

        std::thread::sleep(Duration::from_millis(50));
        // Silence exceeded max_broken: this push resynchronizes rather than
        // being treated as a 15000+ gap from sequence 11.
        buf.push(11, vec![11]);
        assert_eq!(buf.drain(false), vec![(11, vec![11])]);
    }
}
