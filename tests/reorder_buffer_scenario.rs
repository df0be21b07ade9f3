// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packets pushed in reverse sequence order still drain in ascending order
//! once the whole run has arrived, and the window/broken-duration limits
//! bound how long the buffer waits for a gap to fill.

use corenet::reorder::ReorderBuffer;
use std::time::Duration;

#[test]
fn reverse_order_push_drains_ascending() {
    let mut buf = ReorderBuffer::new(100);
    buf.set_max_broken_duration(Duration::from_millis(500));

    for seq in (0u16..=5).rev() {
        buf.push(seq, vec![seq as u8]);
    }

    let drained = buf.drain(false);
    let got: Vec<u16> = drained.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(got, vec![0, 1, 2, 3, 4, 5]);
    assert!(buf.is_empty());
}

#[test]
fn partial_run_waits_for_the_missing_seq_then_drains_the_rest() {
    let mut buf = ReorderBuffer::new(100);
    buf.set_max_broken_duration(Duration::from_millis(500));

    for seq in [5u16, 4, 3, 1, 0] {
        buf.push(seq, vec![seq as u8]);
    }

    // 2 is still missing, so only the contiguous prefix drains.
    let first = buf.drain(false);
    let got: Vec<u16> = first.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(got, vec![0, 1]);
    assert_eq!(buf.len(), 3); // 3, 4, 5 still held back behind the gap

    buf.push(2, vec![2]);
    let rest = buf.drain(false);
    let got: Vec<u16> = rest.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(got, vec![2, 3, 4, 5]);
    assert!(buf.is_empty());
}

#[test]
fn gap_broken_duration_flags_a_stuck_gap_for_force_drain() {
    let mut buf = ReorderBuffer::new(100);
    buf.set_max_broken_duration(Duration::from_millis(30));

    buf.push(0, vec![0]);
    buf.drain(false);
    buf.push(5, vec![5]); // 1..4 never arrive

    assert!(!buf.gap_is_broken());
    std::thread::sleep(Duration::from_millis(50));
    assert!(buf.gap_is_broken());

    let forced = buf.drain(true);
    assert_eq!(forced, vec![(5, vec![5])]);
}
