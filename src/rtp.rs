// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTP-style framed media packets.
//!
//! [`RtpPacket`] layers a small PRO-specific extension on top of an
//! RFC-3550 fixed header: media-node id, media type, and a keyframe /
//! first-packet-of-frame pair of flags a video bucket ([`crate::bucket`])
//! needs to admit or drop whole frames instead of individual packets. The
//! wire encoding differs by [`PackMode`], matching the three framings the
//! original media layer supports: a bare RFC header for UDP, and two
//! length-prefixed TCP framings sized for small and large payloads
//! respectively.

use std::convert::TryInto;

/// Maximum payload for [`PackMode::Default`]: the ext+RFC header framing
/// carries its length in `ext.hdr_and_payload_size`, sized to leave header
/// room inside a 64KiB field rather than the bare 16-bit ceiling.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 63;
/// Maximum payload for [`PackMode::Tcp2`]: a bare 16-bit network-order
/// length prefix with no header bytes to share the field with, so it goes
/// all the way to the field's ceiling.
pub const TCP2_MAX_PAYLOAD: usize = 0xFFFF;
/// Maximum payload for [`PackMode::Tcp4`], which uses a 32-bit length
/// prefix. The field itself could address up to `u32::MAX` bytes; the
/// application-level ceiling is capped at 100 MiB to bound whole-video-frame
/// buffers.
pub const TCP4_MAX_PAYLOAD: usize = 100 * 1024 * 1024;

const RFC_HEADER_LEN: usize = 12;
const EXT_HEADER_LEN: usize = 4 + 1 + 1 + 8; // mmId + mmType + flags + magic

/// How an [`RtpPacket`] is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackMode {
    /// `ext8 + rfc12 + payload`: the PRO extension header followed by a
    /// standard 12-byte RTP header, used over UDP and raw TCP streams.
    Default,
    /// `len2 + payload`: a bare 16-bit length prefix, no RTP header at all.
    /// Used for small control/message traffic over TCP.
    Tcp2,
    /// `len4 + payload`: a 32-bit length prefix for large payloads such as
    /// whole encoded video frames.
    Tcp4,
}

impl PackMode {
    fn max_payload(self) -> usize {
        match self {
            PackMode::Default => DEFAULT_MAX_PAYLOAD,
            PackMode::Tcp2 => TCP2_MAX_PAYLOAD,
            PackMode::Tcp4 => TCP4_MAX_PAYLOAD,
        }
    }
}

/// Media type carried in a packet; 0 is invalid, 1-127 reserved, 128-255
/// available for application use.
pub type MmType = u8;

pub const MMT_MSG: MmType = 11;
pub const MMT_AUDIO: MmType = 71;
pub const MMT_VIDEO: MmType = 81;
pub const MMT_CTRL: MmType = 91;

/// The fixed RFC-3550 fields every [`PackMode::Default`] packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfcHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RfcHeader {
    fn write(&self, out: &mut Vec<u8>) {
        let b0 = 0x80; // version 2, no padding, no extension, cc=0
        out.push(b0);
        out.push((self.marker as u8) << 7 | (self.payload_type & 0x7f));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }

    fn read(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < RFC_HEADER_LEN {
            return None;
        }
        let (head, rest) = buf.split_at(RFC_HEADER_LEN);
        let marker = head[1] & 0x80 != 0;
        let payload_type = head[1] & 0x7f;
        let sequence = u16::from_be_bytes([head[2], head[3]]);
        let timestamp = u32::from_be_bytes(head[4..8].try_into().unwrap());
        let ssrc = u32::from_be_bytes(head[8..12].try_into().unwrap());
        Some((
            Self {
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
            },
            rest,
        ))
    }
}

/// PRO-specific extension fields riding ahead of the RFC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtHeader {
    pub mm_id: u32,
    pub mm_type: MmType,
    pub key_frame: bool,
    pub first_packet_of_frame: bool,
    pub magic: i64,
}

impl ExtHeader {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mm_id.to_be_bytes());
        out.push(self.mm_type);
        out.push((self.key_frame as u8) << 1 | self.first_packet_of_frame as u8);
        out.extend_from_slice(&self.magic.to_be_bytes());
    }

    fn read(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < EXT_HEADER_LEN {
            return None;
        }
        let (mm_id, rest) = buf.split_at(4);
        let (mm_type, rest) = rest.split_at(1);
        let (flags, rest) = rest.split_at(1);
        let (magic, rest) = rest.split_at(8);
        Some((
            Self {
                mm_id: u32::from_be_bytes(mm_id.try_into().unwrap()),
                mm_type: mm_type[0],
                key_frame: flags[0] & 0b10 != 0,
                first_packet_of_frame: flags[0] & 0b01 != 0,
                magic: i64::from_be_bytes(magic.try_into().unwrap()),
            },
            rest,
        ))
    }
}

/// A single media packet: header fields plus an owned payload buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub pack_mode: PackMode,
    pub ext: ExtHeader,
    pub rfc: RfcHeader,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Build a packet around `payload`, rejecting payloads too large for
    /// `pack_mode`'s length prefix.
    pub fn new(pack_mode: PackMode, ext: ExtHeader, rfc: RfcHeader, payload: Vec<u8>) -> Option<Self> {
        if payload.is_empty() || payload.len() > pack_mode.max_payload() {
            return None;
        }
        Some(Self {
            pack_mode,
            ext,
            rfc,
            payload,
        })
    }

    /// Serialize to the wire format dictated by `self.pack_mode`.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.pack_mode {
            PackMode::Default => {
                let mut out = Vec::with_capacity(EXT_HEADER_LEN + RFC_HEADER_LEN + self.payload.len());
                self.ext.write(&mut out);
                self.rfc.write(&mut out);
                out.extend_from_slice(&self.payload);
                out
            }
            PackMode::Tcp2 => {
                let len: u16 = self.payload.len().try_into().expect("validated by new()");
                let mut out = Vec::with_capacity(2 + self.payload.len());
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&self.payload);
                out
            }
            PackMode::Tcp4 => {
                let len: u32 = self.payload.len().try_into().expect("validated by new()");
                let mut out = Vec::with_capacity(4 + self.payload.len());
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&self.payload);
                out
            }
        }
    }

    /// Parse a single `pack_mode`-framed packet out of `buf`, returning the
    /// packet and the number of bytes consumed. For `Tcp2`/`Tcp4`, `buf` may
    /// contain trailing bytes belonging to the next frame.
    pub fn parse(pack_mode: PackMode, buf: &[u8]) -> Option<(Self, usize)> {
        match pack_mode {
            PackMode::Default => {
                let (ext, rest) = ExtHeader::read(buf)?;
                let (rfc, payload) = RfcHeader::read(rest)?;
                if payload.is_empty() {
                    return None;
                }
                Some((
                    Self {
                        pack_mode,
                        ext,
                        rfc,
                        payload: payload.to_vec(),
                    },
                    buf.len(),
                ))
            }
            PackMode::Tcp2 => {
                if buf.len() < 2 {
                    return None;
                }
                let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                if buf.len() < 2 + len || len == 0 {
                    return None;
                }
                let payload = buf[2..2 + len].to_vec();
                Some((
                    Self {
                        pack_mode,
                        ext: ExtHeader::default(),
                        rfc: default_rfc(),
                        payload,
                    },
                    2 + len,
                ))
            }
            PackMode::Tcp4 => {
                if buf.len() < 4 {
                    return None;
                }
                let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
                if buf.len() < 4 + len || len == 0 {
                    return None;
                }
                let payload = buf[4..4 + len].to_vec();
                Some((
                    Self {
                        pack_mode,
                        ext: ExtHeader::default(),
                        rfc: default_rfc(),
                        payload,
                    },
                    4 + len,
                ))
            }
        }
    }
}

fn default_rfc() -> RfcHeader {
    RfcHeader {
        marker: false,
        payload_type: 0,
        sequence: 0,
        timestamp: 0,
        ssrc: 0,
    }
}

/// Per-session negotiated parameters exchanged during the extended
/// handshake, before any media flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpSessionInfo {
    pub local_version: u16,
    pub remote_version: u16,
    pub mm_type: MmType,
    pub pack_mode: PackMode,
    pub password_hash: [u8; 32],
    pub some_id: u32,
    pub mm_id: u32,
}

impl RtpSessionInfo {
    pub fn new(mm_type: MmType, pack_mode: PackMode) -> Self {
        Self {
            local_version: 2,
            remote_version: 0,
            mm_type,
            pack_mode,
            password_hash: [0; 32],
            some_id: 0,
            mm_id: 0,
        }
    }
}
