// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flow-control buckets.
//!
//! A bucket queues outbound [`RtpPacket`](crate::rtp::RtpPacket)s in front
//! of a [`TokenBucket`](crate::congestion::token_bucket::TokenBucket) rate
//! limiter and applies a redline so a slow peer can't make the queue grow
//! without bound: once the queue passes its byte/frame/delay redline,
//! the oldest packet is dropped to make room for the new one rather than
//! blocking the producer.
//!
//! [`VideoBucket`] additionally tracks whole frames instead of individual
//! packets, since dropping half of a video frame is as useless as dropping
//! all of it. Frames are keyframe-rooted GOPs: nothing is admitted until a
//! keyframe's first packet starts a new frame, an I-frame's completion
//! implicitly discards every frame still queued (a decoder doesn't need a
//! stale GOP once a fresh reference frame has landed), and any redline drop
//! throws the bucket back into `AwaitingKeyframe` since the queue can no
//! longer promise a clean GOP boundary.

use crate::congestion::token_bucket::TokenBucket;
use crate::rtp::RtpPacket;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-frame ceiling enforced by [`VideoBucket`]; a frame that grows past
/// this before its marker packet arrives is discarded and the bucket
/// resyncs, rather than risk buffering an unbounded in-progress frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Window over which [`FlowStat`] rates are computed.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// When a redline byte/frame/delay limit is exceeded, at most one item is
/// dropped per push so a brief burst doesn't empty the whole queue.
#[derive(Debug, Clone, Copy)]
pub struct Redline {
    pub bytes: usize,
    pub frames: usize,
    pub delay: Duration,
}

impl Default for Redline {
    fn default() -> Self {
        Self {
            bytes: 0,
            frames: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Frame-rate / bit-rate / queue-depth snapshot, refreshed lazily on read.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowStat {
    pub frame_rate: f32,
    pub bit_rate: f32,
    pub cached_bytes: usize,
    pub cached_frames: usize,
}

/// Sliding-window frame/bit rate accumulator shared by every bucket variant.
/// Each accepted unit (packet for base/audio, whole frame for video) is
/// recorded once; `rate` evicts anything older than the window and reports
/// the rate over what's left.
struct RateTracker {
    events: VecDeque<(Instant, usize)>,
}

impl RateTracker {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    fn record(&mut self, bytes: usize) {
        let now = Instant::now();
        self.events.push_back((now, bytes));
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, _)) = self.events.front() {
            if now.duration_since(*at) > RATE_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(units_per_sec, bits_per_sec)` over the trailing window.
    fn rate(&mut self) -> (f32, f32) {
        let now = Instant::now();
        self.evict(now);
        let secs = RATE_WINDOW.as_secs_f32();
        let units = self.events.len() as f32;
        let bytes: usize = self.events.iter().map(|(_, b)| *b).sum();
        (units / secs, (bytes as f32 * 8.0) / secs)
    }
}

struct QueuedPacket {
    packet: RtpPacket,
    queued_at: Instant,
}

/// The plain packet-oriented bucket: every packet is queued and redlined
/// independently.
pub struct BaseBucket {
    queue: VecDeque<QueuedPacket>,
    total_bytes: usize,
    redline: Redline,
    limiter: TokenBucket,
    push_rate: RateTracker,
}

impl BaseBucket {
    pub fn new(rate_bps: u32, capacity: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            total_bytes: 0,
            redline: Redline::default(),
            limiter: TokenBucket::new(rate_bps, capacity),
            push_rate: RateTracker::new(),
        }
    }

    pub fn set_redline(&mut self, redline: Redline) {
        self.redline = redline;
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn total_frames(&self) -> usize {
        self.queue.len()
    }

    /// Queue a packet, trimming the oldest queued packet if a redline is
    /// now exceeded. Returns `true` unless the bucket had to drop the very
    /// packet being pushed (queue depth 0 and the packet alone breaches a
    /// byte redline).
    pub fn push_back(&mut self, packet: RtpPacket) -> bool {
        self.drop_expired();
        let bytes = packet.payload.len();
        if self.redline.bytes > 0 && bytes > self.redline.bytes && self.queue.is_empty() {
            return false;
        }
        self.push_rate.record(bytes);
        self.total_bytes += bytes;
        self.queue.push_back(QueuedPacket {
            packet,
            queued_at: Instant::now(),
        });
        self.enforce_redline();
        true
    }

    pub fn front(&self) -> Option<&RtpPacket> {
        self.queue.front().map(|q| &q.packet)
    }

    pub fn pop_front(&mut self) -> Option<RtpPacket> {
        let item = self.queue.pop_front()?;
        self.total_bytes -= item.packet.payload.len();
        Some(item.packet)
    }

    /// Whether the limiter currently has enough tokens to send the packet
    /// at the front of the queue.
    pub fn can_send_front(&mut self) -> bool {
        match self.queue.front() {
            Some(q) => self.limiter.has_tokens(q.packet.payload.len() as u64),
            None => false,
        }
    }

    pub fn consume_front_tokens(&mut self) {
        if let Some(q) = self.queue.front() {
            self.limiter.force_consume(q.packet.payload.len() as u64);
        }
    }

    /// Drop expired packets (`now - enqueue_tick > redline.delay`) from the
    /// head before considering a new push, per the base-bucket contract.
    fn drop_expired(&mut self) {
        if self.redline.delay.is_zero() {
            return;
        }
        let now = Instant::now();
        while let Some(front) = self.queue.front() {
            if now.duration_since(front.queued_at) > self.redline.delay {
                self.pop_front();
            } else {
                break;
            }
        }
    }

    fn enforce_redline(&mut self) {
        while self.redline.bytes > 0 && self.total_bytes > self.redline.bytes {
            if self.pop_front().is_none() {
                break;
            }
        }
        while self.redline.frames > 0 && self.queue.len() > self.redline.frames {
            if self.pop_front().is_none() {
                break;
            }
        }
        self.drop_expired();
    }

    pub fn flow_stat(&mut self) -> FlowStat {
        let (frame_rate, bit_rate) = self.push_rate.rate();
        FlowStat {
            frame_rate,
            bit_rate,
            cached_bytes: self.total_bytes,
            cached_frames: self.queue.len(),
        }
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.total_bytes = 0;
    }
}

/// An audio-flavored base bucket: identical queueing, but `push_back`
/// additionally resets the rate limiter back to full whenever the queue
/// was empty, so a burst after silence isn't immediately throttled.
pub struct AudioBucket {
    inner: BaseBucket,
}

impl AudioBucket {
    pub fn new(rate_bps: u32, capacity: u64) -> Self {
        Self {
            inner: BaseBucket::new(rate_bps, capacity),
        }
    }

    /// Never refuses the push: drops from the head until the new packet
    /// fits within the byte redline or the queue is empty, so the newest
    /// audio always wins over stale audio.
    pub fn push_back(&mut self, packet: RtpPacket) {
        if self.inner.queue.is_empty() {
            self.inner.limiter.reset();
        }
        let bytes = packet.payload.len();
        if self.inner.redline.bytes > 0 {
            while self.inner.total_bytes + bytes > self.inner.redline.bytes && !self.inner.queue.is_empty() {
                self.inner.pop_front();
            }
        }
        self.inner.push_rate.record(bytes);
        self.inner.total_bytes += bytes;
        self.inner.queue.push_back(QueuedPacket {
            packet,
            queued_at: Instant::now(),
        });
        self.inner.enforce_redline();
    }

    pub fn pop_front(&mut self) -> Option<RtpPacket> {
        self.inner.pop_front()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.total_bytes()
    }

    pub fn set_redline(&mut self, redline: Redline) {
        self.inner.set_redline(redline);
    }

    pub fn flow_stat(&mut self) -> FlowStat {
        self.inner.flow_stat()
    }
}

/// Where a [`VideoBucket`] is in the keyframe-synced stream: packets
/// arriving before the next keyframe are dropped, since a decoder can't
/// usefully consume a GOP fragment that's missing its reference frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopState {
    AwaitingKeyframe,
    InGop,
}

/// A queued, fully-assembled frame: its packets in arrival order, when it
/// was completed, and whether it's a keyframe (an I-frame's own completion
/// never gets timed out by the delay redline the way a P-frame's does).
struct QueuedFrame {
    packets: Vec<RtpPacket>,
    completed_at: Instant,
    is_key: bool,
}

/// Queues whole video frames (sequences of packets sharing a frame
/// boundary) rather than individual packets, and redlines by dropping the
/// oldest complete frame.
pub struct VideoBucket {
    frames: VecDeque<QueuedFrame>,
    current_frame: Vec<RtpPacket>,
    current_bytes: usize,
    current_is_key: bool,
    total_bytes: usize,
    redline: Redline,
    state: GopState,
    push_rate: RateTracker,
}

impl VideoBucket {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            current_frame: Vec::new(),
            current_bytes: 0,
            current_is_key: false,
            total_bytes: 0,
            redline: Redline::default(),
            state: GopState::AwaitingKeyframe,
            push_rate: RateTracker::new(),
        }
    }

    pub fn set_redline(&mut self, redline: Redline) {
        self.redline = redline;
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn state(&self) -> GopState {
        self.state
    }

    /// Feed one packet. A frame is delimited by `first_packet_of_frame` on
    /// open and the current packet's own `marker` flag on close -- not by
    /// the *next* packet's flags, so a frame completes the instant its
    /// marker packet arrives rather than waiting on whatever comes after.
    pub fn push_back(&mut self, packet: RtpPacket) {
        if self.state == GopState::AwaitingKeyframe
            && !(packet.ext.key_frame && packet.ext.first_packet_of_frame)
        {
            return;
        }

        if packet.ext.first_packet_of_frame {
            // A still-open current frame here means the previous frame never
            // saw its marker packet; discard the incomplete fragment rather
            // than splice two frames together.
            self.current_frame.clear();
            self.current_bytes = 0;
            self.current_is_key = packet.ext.key_frame;
            self.state = GopState::InGop;
        } else if self.current_frame.is_empty() {
            // Stray continuation packet with nothing open: resync.
            self.state = GopState::AwaitingKeyframe;
            return;
        }

        let marker = packet.rfc.marker;
        self.current_bytes += packet.payload.len();
        self.current_frame.push(packet);

        if self.current_bytes > MAX_FRAME_SIZE {
            self.current_frame.clear();
            self.current_bytes = 0;
            self.state = GopState::AwaitingKeyframe;
            return;
        }

        if marker {
            self.complete_current_frame();
        }
    }

    fn complete_current_frame(&mut self) {
        let packets = std::mem::take(&mut self.current_frame);
        let bytes = self.current_bytes;
        self.current_bytes = 0;
        let is_key = self.current_is_key;

        if is_key {
            // An I-frame's completion is an implicit flush: nothing queued
            // before it can still be useful once a fresh reference frame
            // has landed.
            for old in self.frames.drain(..) {
                self.total_bytes -= old.packets.iter().map(|p| p.payload.len()).sum::<usize>();
            }
        }

        self.push_rate.record(bytes);
        self.total_bytes += bytes;
        self.frames.push_back(QueuedFrame {
            packets,
            completed_at: Instant::now(),
            is_key,
        });
        self.enforce_redline();
    }

    /// Pop the next packet of the oldest queued frame.
    pub fn pop_front(&mut self) -> Option<RtpPacket> {
        let frame = self.frames.front_mut()?;
        let packet = frame.packets.remove(0);
        self.total_bytes -= packet.payload.len();
        if frame.packets.is_empty() {
            self.frames.pop_front();
        }
        Some(packet)
    }

    /// Byte/frame-count/delay redline overflow drops the oldest queued
    /// frame(s) and forces a resync: the queue can no longer promise a
    /// clean GOP boundary once a frame from the middle of it is gone.
    fn enforce_redline(&mut self) {
        let mut dropped = false;
        while self.redline.bytes > 0 && self.total_bytes > self.redline.bytes && !self.frames.is_empty() {
            self.drop_oldest_frame();
            dropped = true;
        }
        while self.redline.frames > 0 && self.frames.len() > self.redline.frames {
            self.drop_oldest_frame();
            dropped = true;
        }
        if !self.redline.delay.is_zero() {
            let now = Instant::now();
            while let Some(front) = self.frames.front() {
                if now.duration_since(front.completed_at) > self.redline.delay {
                    self.drop_oldest_frame();
                    dropped = true;
                } else {
                    break;
                }
            }
        }
        if dropped {
            self.state = GopState::AwaitingKeyframe;
        }
    }

    fn drop_oldest_frame(&mut self) {
        if let Some(frame) = self.frames.pop_front() {
            self.total_bytes -= frame.packets.iter().map(|p| p.payload.len()).sum::<usize>();
        }
    }

    pub fn flow_stat(&mut self) -> FlowStat {
        let (frame_rate, bit_rate) = self.push_rate.rate();
        FlowStat {
            frame_rate,
            bit_rate,
            cached_bytes: self.total_bytes,
            cached_frames: self.frames.len(),
        }
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.current_frame.clear();
        self.current_bytes = 0;
        self.total_bytes = 0;
        self.state = GopState::AwaitingKeyframe;
    }
}

impl Default for VideoBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{ExtHeader, PackMode, RfcHeader};

    fn packet(key_frame: bool, first: bool) -> RtpPacket {
        RtpPacket::new(
            PackMode::Default,
            ExtHeader {
                key_frame,
                first_packet_of_frame: first,
                ..Default::default()
            },
            RfcHeader {
                marker: first, // closes immediately: every packet is its own single-packet frame
                payload_type: 96,
                sequence: 0,
                timestamp: 0,
                ssrc: 0,
            },
            vec![1, 2, 3],
        )
        .unwrap()
    }

    #[test]
    fn base_bucket_drops_oldest_past_byte_redline() {
        let mut bucket = BaseBucket::new(1_000_000, 1_000_000);
        bucket.set_redline(Redline {
            bytes: 5,
            frames: 0,
            delay: Duration::ZERO,
        });
        bucket.push_back(packet(true, true));
        bucket.push_back(packet(true, true));
        assert!(bucket.total_bytes() <= 5);
    }

    #[test]
    fn base_bucket_flow_stat_tracks_pushed_bytes() {
        let mut bucket = BaseBucket::new(1_000_000, 1_000_000);
        bucket.push_back(packet(true, true));
        bucket.push_back(packet(true, true));
        let stat = bucket.flow_stat();
        assert_eq!(stat.cached_frames, 2);
        assert_eq!(stat.cached_bytes, 6);
        assert!(stat.bit_rate > 0.0);
    }

    #[test]
    fn audio_bucket_never_refuses_newest_push() {
        let mut bucket = AudioBucket::new(1_000_000, 1_000_000);
        bucket.set_redline(Redline {
            bytes: 3,
            frames: 0,
            delay: Duration::ZERO,
        });
        bucket.push_back(packet(true, true));
        bucket.push_back(packet(true, true));
        assert!(bucket.total_bytes() <= 3);
    }

    #[test]
    fn video_bucket_drops_packets_before_first_keyframe() {
        let mut bucket = VideoBucket::new();
        bucket.push_back(packet(false, true));
        assert_eq!(bucket.total_frames(), 0);
        assert_eq!(bucket.total_bytes(), 0);

        bucket.push_back(packet(true, true)); // marker=true: completes alone
        assert_eq!(bucket.total_frames(), 1);
    }

    #[test]
    fn video_bucket_continuation_packet_with_nothing_open_resyncs() {
        let mut bucket = VideoBucket::new();
        bucket.push_back(packet(true, true)); // I-frame, completes alone
        assert_eq!(bucket.total_frames(), 1);
        assert_eq!(bucket.state(), GopState::InGop);

        // A non-first packet with no open current frame is a stray
        // continuation: resync, and the next non-keyframe is dropped.
        let stray = RtpPacket::new(
            PackMode::Default,
            ExtHeader {
                key_frame: false,
                first_packet_of_frame: false,
                ..Default::default()
            },
            RfcHeader {
                marker: false,
                payload_type: 96,
                sequence: 1,
                timestamp: 0,
                ssrc: 0,
            },
            vec![9],
        )
        .unwrap();
        bucket.push_back(stray);
        assert_eq!(bucket.state(), GopState::AwaitingKeyframe);
        assert_eq!(bucket.total_frames(), 1); // unchanged: stray was dropped
    }

    #[test]
    fn video_bucket_keyframe_completion_flushes_queued_frames() {
        let mut bucket = VideoBucket::new();
        bucket.push_back(packet(true, true)); // I-frame 1
        bucket.push_back(packet(false, true)); // P-frame, queued alongside it
        assert_eq!(bucket.total_frames(), 2);

        bucket.push_back(packet(true, true)); // I-frame 2: implicit flush
        assert_eq!(bucket.total_frames(), 1);
        assert_eq!(bucket.pop_front().map(|p| p.ext.key_frame), Some(true));
    }

    #[test]
    fn video_bucket_redline_drop_forces_resync() {
        let mut bucket = VideoBucket::new();
        bucket.set_redline(Redline {
            bytes: 0,
            frames: 1,
            delay: Duration::ZERO,
        });
        bucket.push_back(packet(true, true)); // frame 1 (key)
        bucket.push_back(packet(false, true)); // frame 2 (P), over the frames:1 redline -> frame 1 dropped
        assert_eq!(bucket.total_frames(), 1);
        assert_eq!(bucket.state(), GopState::AwaitingKeyframe);
    }

    #[test]
    fn video_bucket_oversized_frame_resyncs_without_queuing() {
        // A single Default-mode packet can't exceed MAX_FRAME_SIZE on its
        // own (its own wire cap is far smaller), so build one in-progress
        // frame out of enough continuation packets to cross it instead.
        let mut bucket = VideoBucket::new();
        let chunk = vec![0u8; 64_000];
        let mut seq = 0u16;
        let mut push = |bucket: &mut VideoBucket, first: bool| {
            let p = RtpPacket::new(
                PackMode::Default,
                ExtHeader {
                    key_frame: true,
                    first_packet_of_frame: first,
                    ..Default::default()
                },
                RfcHeader {
                    marker: false,
                    payload_type: 96,
                    sequence: seq,
                    timestamp: 0,
                    ssrc: 0,
                },
                chunk.clone(),
            )
            .unwrap();
            seq += 1;
            bucket.push_back(p);
        };

        push(&mut bucket, true);
        for _ in 0..16 {
            push(&mut bucket, false);
        }
        // 17 * 64000 = 1,088,000 bytes, past the 1 MiB MAX_FRAME_SIZE.
        assert_eq!(bucket.total_frames(), 0);
        assert_eq!(bucket.state(), GopState::AwaitingKeyframe);
    }
}
