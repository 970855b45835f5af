// Copyright (C) 2019  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Generic segmentation offload.
//!
//! A GSO frame is an Ethernet frame whose transport payload is larger than what can be put on
//! the wire in one go. It is accompanied with a [`GsoContext`] that describes where the headers
//! are and the maximum size of each segment. Carving a GSO frame produces the individual frames
//! that the sender would have had to build itself had it not used GSO.
//!
//! # Context layout
//!
//! | Offset | Size | Field                                                         |
//! |--------|------|---------------------------------------------------------------|
//! | 0      | 1    | Type, see [`GsoType`]                                         |
//! | 1      | 1    | Total size of the headers (Ethernet + IP + TCP/UDP)           |
//! | 2      | 2    | Maximum segment size, little-endian                           |
//! | 4      | 1    | Offset of the IP header                                       |
//! | 5      | 1    | Offset of the TCP/UDP header                              |
//! | 6      | 1    | Size of the headers repeated in front of every segment        |
//! | 7      | 1    | Unused                                                        |
//!
//! For TCP and for UDP over IPv6, every segment gets a copy of all the headers, and the maximum
//! segment size is the maximum size of the transport payload of each segment.
//!
//! UDP over IPv4 is handled as *UDP fragmentation offload*. The datagram is split into IP
//! fragments. Only the first fragment contains the UDP header, and the maximum segment size is
//! the size of the IP payload of each fragment.

use crate::checksum::{self, Checksum};
use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use std::fmt;

/// Size of an encoded [`GsoContext`].
pub const GSO_CONTEXT_SIZE: usize = 8;
/// Minimum size of the scratch buffer passed to [`GsoContext::carve_segment`].
pub const MIN_SCRATCH_SIZE: usize = 256;

const ETHERNET_HEADER_LEN: u8 = 14;
const IPV4_MIN_HEADER_LEN: u8 = 20;
const IPV6_HEADER_LEN: u8 = 40;
const TCP_MIN_HEADER_LEN: u8 = 20;
const UDP_HEADER_LEN: u8 = 8;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_PSH: u8 = 0x08;
const IPV4_FLAG_MF: u16 = 0x2000;

/// Kind of offload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GsoType {
    Ipv4Tcp = 1,
    Ipv6Tcp = 2,
    /// UDP fragmentation offload.
    Ipv4Udp = 3,
    Ipv6Udp = 4,
    /// IPv4 and TCP, tunneled over IPv6. Recognized but not supported.
    Ipv4TcpInIpv6 = 5,
    /// IPv4 and UDP, tunneled over IPv6. Recognized but not supported.
    Ipv4UdpInIpv6 = 6,
}

impl GsoType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => GsoType::Ipv4Tcp,
            2 => GsoType::Ipv6Tcp,
            3 => GsoType::Ipv4Udp,
            4 => GsoType::Ipv6Udp,
            5 => GsoType::Ipv4TcpInIpv6,
            6 => GsoType::Ipv4UdpInIpv6,
            _ => return None,
        })
    }

    fn is_ipv4(self) -> bool {
        match self {
            GsoType::Ipv4Tcp | GsoType::Ipv4Udp => true,
            _ => false,
        }
    }

    fn is_tcp(self) -> bool {
        match self {
            GsoType::Ipv4Tcp | GsoType::Ipv6Tcp | GsoType::Ipv4TcpInIpv6 => true,
            _ => false,
        }
    }

    /// Returns true if segments are IP fragments rather than independent datagrams.
    fn fragments(self) -> bool {
        self == GsoType::Ipv4Udp
    }
}

/// What to do with the TCP or UDP checksum of carved segments.
///
/// The IPv4 header checksum is always recomputed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChecksumPolicy {
    /// Compute the full checksum. Segments can be put on the wire as they are.
    Complete,
    /// Only put the folded, non-inverted, pseudo-header sum in the checksum field. Whoever
    /// receives the segment is expected to finish the job, as with hardware checksum offload.
    Pseudo,
    /// Leave the checksum field as found in the super-frame.
    Untouched,
}

impl Default for ChecksumPolicy {
    fn default() -> Self {
        ChecksumPolicy::Complete
    }
}

/// Reason why a context was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GsoError {
    #[error("entry too short to contain a GSO context")]
    ContextTruncated,
    #[error("unknown GSO type {0}")]
    UnknownType(u8),
    #[error("unsupported GSO type {0:?}")]
    Unsupported(GsoType),
    #[error("invalid header layout: {0}")]
    BadHeaders(&'static str),
    #[error("maximum segment size is zero")]
    ZeroSegmentSize,
    #[error("frame of {frame_len} bytes too short, needs at least {needed}")]
    FrameTooShort { frame_len: usize, needed: usize },
    #[error("fragment size {0} isn't a multiple of 8")]
    BadFragmentSize(u16),
    #[error("segments would exceed the maximum IP packet size")]
    SegmentTooLarge,
    #[error("scratch buffer of {0} bytes is too small")]
    ScratchTooSmall(usize),
    #[error("segment {index} out of {count}")]
    BadSegmentIndex { index: u32, count: u32 },
}

/// Description of a GSO super-frame.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct GsoContext {
    /// Raw type, see [`GsoType`].
    pub kind: u8,
    pub hdrs_total: u8,
    pub max_seg: u16,
    pub off_hdr1: u8,
    pub off_hdr2: u8,
    pub hdrs_seg: u8,
}

/// Position of a carved segment.
///
/// The segment on the wire consists of the first `header_len` bytes of the scratch buffer,
/// followed by `payload_len` bytes of the super-frame starting at `payload_offset`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CarvedSegment {
    pub header_len: usize,
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl CarvedSegment {
    /// Writes the segment as it should appear on the wire into `out`, replacing its content.
    pub fn assemble(&self, scratch: &[u8], frame: &[u8], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.header_len + self.payload_len);
        out.extend_from_slice(&scratch[..self.header_len]);
        out.extend_from_slice(&frame[self.payload_offset..self.payload_offset + self.payload_len]);
    }
}

impl GsoContext {
    /// Builds a context. The size of the per-segment headers is deduced from the type.
    pub fn new(
        ty: GsoType,
        off_hdr1: u8,
        off_hdr2: u8,
        hdrs_total: u8,
        max_seg: u16,
    ) -> GsoContext {
        GsoContext {
            kind: ty as u8,
            hdrs_total,
            max_seg,
            off_hdr1,
            off_hdr2,
            hdrs_seg: if ty.fragments() { off_hdr2 } else { hdrs_total },
        }
    }

    /// Decodes a context. `raw` must be at least [`GSO_CONTEXT_SIZE`] bytes.
    pub fn from_bytes(raw: &[u8]) -> GsoContext {
        GsoContext {
            kind: raw[0],
            hdrs_total: raw[1],
            max_seg: LittleEndian::read_u16(&raw[2..4]),
            off_hdr1: raw[4],
            off_hdr2: raw[5],
            hdrs_seg: raw[6],
        }
    }

    /// Encodes the context. `out` must be at least [`GSO_CONTEXT_SIZE`] bytes.
    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = self.kind;
        out[1] = self.hdrs_total;
        LittleEndian::write_u16(&mut out[2..4], self.max_seg);
        out[4] = self.off_hdr1;
        out[5] = self.off_hdr2;
        out[6] = self.hdrs_seg;
        out[7] = 0;
    }

    pub fn gso_type(&self) -> Option<GsoType> {
        GsoType::from_u8(self.kind)
    }

    /// Returns true if the context can be used to carve a super-frame of `frame_len` bytes.
    ///
    /// `entry_len` is the number of bytes available where the context was read from.
    pub fn is_valid(&self, entry_len: usize, frame_len: usize) -> bool {
        self.validate(entry_len, frame_len).is_ok()
    }

    /// Same as [`GsoContext::is_valid`], but indicates what is wrong.
    pub fn validate(&self, entry_len: usize, frame_len: usize) -> Result<GsoType, GsoError> {
        if entry_len < GSO_CONTEXT_SIZE {
            return Err(GsoError::ContextTruncated);
        }

        let ty = self.gso_type().ok_or(GsoError::UnknownType(self.kind))?;
        match ty {
            GsoType::Ipv4TcpInIpv6 | GsoType::Ipv4UdpInIpv6 => {
                return Err(GsoError::Unsupported(ty))
            }
            _ => {}
        }

        if self.off_hdr1 < ETHERNET_HEADER_LEN {
            return Err(GsoError::BadHeaders("IP header overlaps the Ethernet header"));
        }
        if self.off_hdr2 <= self.off_hdr1 {
            return Err(GsoError::BadHeaders("transport header before the IP header"));
        }
        if self.hdrs_total <= self.off_hdr2 {
            return Err(GsoError::BadHeaders("headers end before the transport header"));
        }

        let l3_len = self.off_hdr2 - self.off_hdr1;
        let l3_min = if ty.is_ipv4() {
            IPV4_MIN_HEADER_LEN
        } else {
            IPV6_HEADER_LEN
        };
        if l3_len < l3_min {
            return Err(GsoError::BadHeaders("IP header too short"));
        }

        let l4_len = self.hdrs_total - self.off_hdr2;
        if ty.is_tcp() {
            if l4_len < TCP_MIN_HEADER_LEN {
                return Err(GsoError::BadHeaders("TCP header too short"));
            }
        } else if l4_len != UDP_HEADER_LEN {
            return Err(GsoError::BadHeaders("UDP header has the wrong size"));
        }

        let expected_seg = if ty.fragments() {
            self.off_hdr2
        } else {
            self.hdrs_total
        };
        if self.hdrs_seg != expected_seg {
            return Err(GsoError::BadHeaders("per-segment headers don't match the type"));
        }

        if self.max_seg == 0 {
            return Err(GsoError::ZeroSegmentSize);
        }

        let needed = usize::from(self.hdrs_total);
        if frame_len < needed {
            return Err(GsoError::FrameTooShort { frame_len, needed });
        }

        if ty.fragments() {
            if self.max_seg % 8 != 0 {
                return Err(GsoError::BadFragmentSize(self.max_seg));
            }
            // The UDP length field covers the whole datagram.
            if frame_len - usize::from(self.off_hdr2) > 0xffff {
                return Err(GsoError::SegmentTooLarge);
            }
        }

        // IP length field of the biggest segment.
        let biggest = usize::from(self.hdrs_seg - self.off_hdr1) + usize::from(self.max_seg);
        let biggest = if ty.is_ipv4() {
            biggest
        } else {
            biggest - usize::from(IPV6_HEADER_LEN)
        };
        if biggest > 0xffff {
            return Err(GsoError::SegmentTooLarge);
        }

        Ok(ty)
    }

    /// Number of segments that a super-frame of `frame_len` bytes is split into.
    ///
    /// The result is only meaningful if the context is valid for this frame length, in which
    /// case it is always at least 1.
    pub fn segment_count(&self, frame_len: usize) -> u32 {
        if self.max_seg == 0 {
            return 0;
        }
        let data = frame_len.saturating_sub(usize::from(self.hdrs_seg));
        let mss = usize::from(self.max_seg);
        ((data + mss - 1) / mss).max(1) as u32
    }

    /// Builds the headers of segment `index` of `count` in `scratch`, and returns where to find
    /// the payload of that segment in `frame`.
    ///
    /// `count` must be the value returned by [`GsoContext::segment_count`]. `frame` isn't
    /// modified. `scratch` must be at least [`MIN_SCRATCH_SIZE`] bytes.
    pub fn carve_segment(
        &self,
        frame: &[u8],
        index: u32,
        count: u32,
        scratch: &mut [u8],
        policy: ChecksumPolicy,
    ) -> Result<CarvedSegment, GsoError> {
        let ty = self.validate(GSO_CONTEXT_SIZE, frame.len())?;
        let hdrs_total = usize::from(self.hdrs_total);
        if scratch.len() < MIN_SCRATCH_SIZE.max(hdrs_total) {
            return Err(GsoError::ScratchTooSmall(scratch.len()));
        }
        if index >= count || count != self.segment_count(frame.len()) {
            return Err(GsoError::BadSegmentIndex { index, count });
        }

        let off1 = usize::from(self.off_hdr1);
        let off2 = usize::from(self.off_hdr2);
        let mss = usize::from(self.max_seg);
        let last = index + 1 == count;
        let seg_start = index as usize * mss + usize::from(self.hdrs_seg);
        let seg_len = if last { frame.len() - seg_start } else { mss };

        scratch[..hdrs_total].copy_from_slice(&frame[..hdrs_total]);

        if ty.fragments() {
            let ip = &mut scratch[off1..off2];
            BigEndian::write_u16(&mut ip[2..4], ((off2 - off1) + seg_len) as u16);
            let mut frag = ((index as usize * mss) >> 3) as u16;
            if !last {
                frag |= IPV4_FLAG_MF;
            }
            BigEndian::write_u16(&mut ip[6..8], frag);
            update_ipv4_checksum(ip);

            if index != 0 {
                return Ok(CarvedSegment {
                    header_len: off2,
                    payload_offset: seg_start,
                    payload_len: seg_len,
                });
            }

            // The first fragment carries the UDP header, which describes the whole datagram.
            let udp_len = frame.len() - off2;
            let udp_header_len = hdrs_total - off2;
            BigEndian::write_u16(&mut scratch[off2 + 4..off2 + 6], udp_len as u16);
            update_transport_checksum(ty, scratch, off1, off2, hdrs_total, &frame[hdrs_total..], policy);
            return Ok(CarvedSegment {
                header_len: hdrs_total,
                payload_offset: hdrs_total,
                payload_len: seg_len - udp_header_len,
            });
        }

        let ip_len = hdrs_total - off1 + seg_len;
        {
            let ip = &mut scratch[off1..off2];
            if ty.is_ipv4() {
                BigEndian::write_u16(&mut ip[2..4], ip_len as u16);
                let id = BigEndian::read_u16(&ip[4..6]).wrapping_add(index as u16);
                BigEndian::write_u16(&mut ip[4..6], id);
                update_ipv4_checksum(ip);
            } else {
                let payload_len = ip_len - usize::from(IPV6_HEADER_LEN);
                BigEndian::write_u16(&mut ip[4..6], payload_len as u16);
            }
        }

        if ty.is_tcp() {
            let tcp = &mut scratch[off2..hdrs_total];
            let seq = BigEndian::read_u32(&tcp[4..8]).wrapping_add((index as usize * mss) as u32);
            BigEndian::write_u32(&mut tcp[4..8], seq);
            if !last {
                tcp[13] &= !(TCP_FLAG_FIN | TCP_FLAG_PSH);
            }
        } else {
            let udp_len = hdrs_total - off2 + seg_len;
            BigEndian::write_u16(&mut scratch[off2 + 4..off2 + 6], udp_len as u16);
        }

        let payload = &frame[seg_start..seg_start + seg_len];
        update_transport_checksum(ty, scratch, off1, off2, hdrs_total, payload, policy);

        Ok(CarvedSegment {
            header_len: hdrs_total,
            payload_offset: seg_start,
            payload_len: seg_len,
        })
    }
}

impl fmt::Debug for GsoContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut dbg = f.debug_struct("GsoContext");
        match self.gso_type() {
            Some(ty) => dbg.field("type", &ty),
            None => dbg.field("type", &self.kind),
        };
        dbg.field("hdrs_total", &self.hdrs_total)
            .field("max_seg", &self.max_seg)
            .field("off_hdr1", &self.off_hdr1)
            .field("off_hdr2", &self.off_hdr2)
            .field("hdrs_seg", &self.hdrs_seg)
            .finish()
    }
}

fn update_ipv4_checksum(header: &mut [u8]) {
    header[10] = 0;
    header[11] = 0;
    let sum = checksum::checksum(header);
    BigEndian::write_u16(&mut header[10..12], sum);
}

/// Updates the TCP or UDP checksum of the headers in `scratch`, whose transport header is
/// `scratch[off2..hdrs_total]` and is followed by `payload` on the wire.
fn update_transport_checksum(
    ty: GsoType,
    scratch: &mut [u8],
    off1: usize,
    off2: usize,
    hdrs_total: usize,
    payload: &[u8],
    policy: ChecksumPolicy,
) {
    let (protocol, field) = if ty.is_tcp() {
        (IPPROTO_TCP, off2 + 16)
    } else {
        (IPPROTO_UDP, off2 + 6)
    };

    let (src, dst) = if ty.is_ipv4() {
        (&scratch[off1 + 12..off1 + 16], &scratch[off1 + 16..off1 + 20])
    } else {
        (&scratch[off1 + 8..off1 + 24], &scratch[off1 + 24..off1 + 40])
    };
    let len = (hdrs_total - off2 + payload.len()) as u32;
    let pseudo = checksum::pseudo_header(protocol, src, dst, len);

    let value = match policy {
        ChecksumPolicy::Untouched => return,
        ChecksumPolicy::Pseudo => pseudo.fold(),
        ChecksumPolicy::Complete => {
            scratch[field] = 0;
            scratch[field + 1] = 0;
            let mut sum: Checksum = pseudo;
            sum.add_bytes(&scratch[off2..hdrs_total]);
            sum.add_bytes(payload);
            match sum.finish() {
                // A zero UDP checksum means "no checksum".
                0 if protocol == IPPROTO_UDP => 0xffff,
                v => v,
            }
        }
    };
    BigEndian::write_u16(&mut scratch[field..field + 2], value);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an Ethernet + IPv4 + TCP super-frame.
    fn tcp4_frame(payload_len: usize, flags: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 54 + payload_len];
        frame[12] = 0x08;
        frame[13] = 0x00;
        let ip = &mut frame[14..34];
        ip[0] = 0x45;
        BigEndian::write_u16(&mut ip[2..4], (40 + payload_len) as u16);
        BigEndian::write_u16(&mut ip[4..6], 0x1234);
        ip[6] = 0x40;
        ip[8] = 64;
        ip[9] = IPPROTO_TCP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let tcp = &mut frame[34..54];
        BigEndian::write_u16(&mut tcp[0..2], 40000);
        BigEndian::write_u16(&mut tcp[2..4], 80);
        BigEndian::write_u32(&mut tcp[4..8], 0xffff_ff00);
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        for (n, byte) in frame[54..].iter_mut().enumerate() {
            *byte = (n % 251) as u8;
        }
        frame
    }

    /// Builds an Ethernet + IPv6 + UDP or TCP super-frame.
    fn ipv6_frame(tcp: bool, payload_len: usize) -> (Vec<u8>, usize) {
        let l4 = if tcp { 20 } else { 8 };
        let hdrs = 54 + l4;
        let mut frame = vec![0u8; hdrs + payload_len];
        frame[12] = 0x86;
        frame[13] = 0xdd;
        frame[14] = 0x60;
        frame[20] = if tcp { IPPROTO_TCP } else { IPPROTO_UDP };
        frame[21] = 64;
        frame[22..38].copy_from_slice(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        frame[38..54].copy_from_slice(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
        if tcp {
            frame[54 + 12] = 5 << 4;
        }
        for (n, byte) in frame[hdrs..].iter_mut().enumerate() {
            *byte = (n * 7 % 256) as u8;
        }
        (frame, hdrs)
    }

    /// Straightforward checksum, independent of the `checksum` module.
    fn reference_sum(parts: &[&[u8]]) -> u16 {
        let bytes: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
        let mut sum = 0u32;
        for i in (0..bytes.len()).step_by(2) {
            let hi = u32::from(bytes[i]) << 8;
            let lo = bytes.get(i + 1).map_or(0, |b| u32::from(*b));
            sum += hi | lo;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    fn carve_all(ctx: &GsoContext, frame: &[u8], policy: ChecksumPolicy) -> Vec<(CarvedSegment, Vec<u8>)> {
        let count = ctx.segment_count(frame.len());
        let mut scratch = [0u8; MIN_SCRATCH_SIZE];
        (0..count)
            .map(|index| {
                let seg = ctx.carve_segment(frame, index, count, &mut scratch, policy).unwrap();
                let mut wire = Vec::new();
                seg.assemble(&scratch, frame, &mut wire);
                (seg, wire)
            })
            .collect()
    }

    #[test]
    fn context_encoding() {
        let ctx = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 1460);
        let mut raw = [0xffu8; GSO_CONTEXT_SIZE];
        ctx.write_to(&mut raw);
        assert_eq!(raw, [1, 54, 0xb4, 0x05, 14, 34, 54, 0]);
        assert_eq!(GsoContext::from_bytes(&raw), ctx);
    }

    #[test]
    fn validity() {
        let ctx = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 1000);
        assert!(ctx.is_valid(8, 54 + 2500));
        assert_eq!(ctx.validate(4, 3000), Err(GsoError::ContextTruncated));

        // Headers longer than the frame.
        assert!(matches!(ctx.validate(8, 50), Err(GsoError::FrameTooShort { .. })));

        let zero = GsoContext { max_seg: 0, ..ctx };
        assert_eq!(zero.validate(8, 3000), Err(GsoError::ZeroSegmentSize));

        let unknown = GsoContext { kind: 9, ..ctx };
        assert_eq!(unknown.validate(8, 3000), Err(GsoError::UnknownType(9)));

        let tunnel = GsoContext { kind: 5, ..ctx };
        assert_eq!(
            tunnel.validate(8, 3000),
            Err(GsoError::Unsupported(GsoType::Ipv4TcpInIpv6))
        );

        let short_ip = GsoContext::new(GsoType::Ipv4Tcp, 14, 30, 50, 1000);
        assert!(matches!(short_ip.validate(8, 3000), Err(GsoError::BadHeaders(_))));

        let v6_short = GsoContext::new(GsoType::Ipv6Tcp, 14, 34, 54, 1000);
        assert!(matches!(v6_short.validate(8, 3000), Err(GsoError::BadHeaders(_))));

        let ufo_odd = GsoContext::new(GsoType::Ipv4Udp, 14, 34, 42, 1001);
        assert_eq!(ufo_odd.validate(8, 3000), Err(GsoError::BadFragmentSize(1001)));

        let bad_seg = GsoContext { hdrs_seg: 34, ..ctx };
        assert!(matches!(bad_seg.validate(8, 3000), Err(GsoError::BadHeaders(_))));
    }

    #[test]
    fn invalid_context_never_carved() {
        let frame = tcp4_frame(100, 0);
        let ctx = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 0);
        let mut scratch = [0u8; MIN_SCRATCH_SIZE];
        assert_eq!(
            ctx.carve_segment(&frame, 0, 1, &mut scratch, ChecksumPolicy::Complete),
            Err(GsoError::ZeroSegmentSize)
        );
        assert!(scratch.iter().all(|b| *b == 0));
    }

    #[test]
    fn segment_count_law() {
        for mss in &[1u16, 7, 536, 1000, 1460] {
            let ctx = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, *mss);
            for payload in 0..usize::from(*mss) * 5 + 3 {
                let frame_len = 54 + payload;
                assert!(ctx.is_valid(8, frame_len));
                let expected = ((payload + usize::from(*mss) - 1) / usize::from(*mss)).max(1);
                assert_eq!(ctx.segment_count(frame_len) as usize, expected);
            }
        }
    }

    #[test]
    fn payload_shorter_than_one_segment() {
        let frame = tcp4_frame(100, TCP_FLAG_PSH);
        let ctx = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 1460);
        assert_eq!(ctx.validate(8, frame.len()), Ok(GsoType::Ipv4Tcp));
        assert_eq!(ctx.segment_count(frame.len()), 1);

        let segments = carve_all(&ctx, &frame, ChecksumPolicy::Complete);
        assert_eq!(segments.len(), 1);
        let (seg, wire) = &segments[0];
        assert_eq!(seg.payload_len, 100);
        assert_eq!(&wire[54..], &frame[54..]);
        assert_eq!(wire[34 + 13] & TCP_FLAG_PSH, TCP_FLAG_PSH);
    }

    #[test]
    fn two_full_segments_and_a_half() {
        let frame = tcp4_frame(2500, TCP_FLAG_FIN | TCP_FLAG_PSH);
        let ctx = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 1000);
        assert_eq!(ctx.segment_count(frame.len()), 3);

        let segments = carve_all(&ctx, &frame, ChecksumPolicy::Complete);
        let lens: Vec<_> = segments.iter().map(|(s, _)| s.payload_len).collect();
        assert_eq!(lens, vec![1000, 1000, 500]);

        let mut replayed = Vec::new();
        for (index, (seg, wire)) in segments.iter().enumerate() {
            assert_eq!(seg.header_len, 54);
            assert_eq!(wire.len(), 54 + seg.payload_len);
            replayed.extend_from_slice(&wire[54..]);

            let ip = &wire[14..34];
            assert_eq!(usize::from(BigEndian::read_u16(&ip[2..4])), 40 + seg.payload_len);
            assert_eq!(BigEndian::read_u16(&ip[4..6]), 0x1234 + index as u16);
            assert_eq!(checksum::checksum(ip), 0);

            let tcp = &wire[34..54];
            let seq = BigEndian::read_u32(&tcp[4..8]);
            assert_eq!(seq, 0xffff_ff00u32.wrapping_add(index as u32 * 1000));
            let fin_psh = tcp[13] & (TCP_FLAG_FIN | TCP_FLAG_PSH);
            if index == 2 {
                assert_eq!(fin_psh, TCP_FLAG_FIN | TCP_FLAG_PSH);
            } else {
                assert_eq!(fin_psh, 0);
            }
        }
        assert_eq!(&replayed[..], &frame[54..]);
    }

    #[test]
    fn carve_coverage() {
        let cases = vec![
            (GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 536), tcp4_frame(5000, 0)),
            (GsoContext::new(GsoType::Ipv6Tcp, 14, 54, 74, 1440), ipv6_frame(true, 4321).0),
            (GsoContext::new(GsoType::Ipv6Udp, 14, 54, 62, 1000), ipv6_frame(false, 1000).0),
        ];

        for (ctx, frame) in cases {
            let hdrs = usize::from(ctx.hdrs_seg);
            let segments = carve_all(&ctx, &frame, ChecksumPolicy::Complete);
            let mut next = hdrs;
            for (seg, _) in &segments {
                assert_eq!(seg.payload_offset, next);
                next += seg.payload_len;
            }
            assert_eq!(next, frame.len());
            let total: usize = segments.iter().map(|(s, _)| s.payload_len).sum();
            assert_eq!(total, frame.len() - hdrs);
        }
    }

    #[test]
    fn tcp_checksum_round_trip() {
        let frame = tcp4_frame(3000, 0);
        let ctx = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 1460);
        for (seg, wire) in carve_all(&ctx, &frame, ChecksumPolicy::Complete) {
            let tcp_len = (20 + seg.payload_len) as u16;
            let mut pseudo = Vec::new();
            pseudo.extend_from_slice(&wire[26..34]);
            pseudo.extend_from_slice(&[0, IPPROTO_TCP]);
            pseudo.extend_from_slice(&tcp_len.to_be_bytes());
            assert_eq!(reference_sum(&[&pseudo[..], &wire[34..]]), 0);
            assert_eq!(reference_sum(&[&wire[14..34]]), 0);
        }
    }

    #[test]
    fn ipv6_udp_segments() {
        let (frame, hdrs) = ipv6_frame(false, 2500);
        let ctx = GsoContext::new(GsoType::Ipv6Udp, 14, 54, 62, 1000);
        for (seg, wire) in carve_all(&ctx, &frame, ChecksumPolicy::Complete) {
            assert_eq!(seg.header_len, hdrs);
            let udp_len = 8 + seg.payload_len;
            assert_eq!(usize::from(BigEndian::read_u16(&wire[18..20])), udp_len);
            assert_eq!(usize::from(BigEndian::read_u16(&wire[58..60])), udp_len);

            let mut pseudo = Vec::new();
            pseudo.extend_from_slice(&wire[22..54]);
            pseudo.extend_from_slice(&(udp_len as u32).to_be_bytes());
            pseudo.extend_from_slice(&[0, 0, 0, IPPROTO_UDP]);
            assert_eq!(reference_sum(&[&pseudo[..], &wire[54..]]), 0);
        }
    }

    #[test]
    fn udp_fragmentation() {
        // Ethernet + IPv4 + UDP with a 3000 bytes payload, fragmented by 1480 bytes.
        let payload_len = 3000;
        let mut frame = vec![0u8; 42 + payload_len];
        frame[14] = 0x45;
        frame[14 + 9] = IPPROTO_UDP;
        BigEndian::write_u16(&mut frame[18..20], 0x4242);
        frame[26..30].copy_from_slice(&[192, 168, 0, 1]);
        frame[30..34].copy_from_slice(&[192, 168, 0, 2]);
        for (n, byte) in frame[42..].iter_mut().enumerate() {
            *byte = (n % 199) as u8;
        }

        let ctx = GsoContext::new(GsoType::Ipv4Udp, 14, 34, 42, 1480);
        assert_eq!(ctx.hdrs_seg, 34);
        assert_eq!(ctx.segment_count(frame.len()), 3);

        let segments = carve_all(&ctx, &frame, ChecksumPolicy::Complete);
        let mut datagram = Vec::new();
        for (index, (seg, wire)) in segments.iter().enumerate() {
            let ip = &wire[14..34];
            assert_eq!(checksum::checksum(ip), 0);
            assert_eq!(BigEndian::read_u16(&ip[4..6]), 0x4242);
            let frag = BigEndian::read_u16(&ip[6..8]);
            assert_eq!(usize::from(frag & 0x1fff) * 8, index * 1480);
            assert_eq!(frag & IPV4_FLAG_MF != 0, index != 2);
            assert_eq!(usize::from(BigEndian::read_u16(&ip[2..4])), wire.len() - 14);
            if index == 0 {
                assert_eq!(seg.header_len, 42);
            } else {
                assert_eq!(seg.header_len, 34);
            }
            datagram.extend_from_slice(&wire[34..]);
        }

        // Reassembled datagram: UDP header followed by the original payload.
        assert_eq!(datagram.len(), 8 + payload_len);
        assert_eq!(usize::from(BigEndian::read_u16(&datagram[4..6])), 8 + payload_len);
        assert_eq!(&datagram[8..], &frame[42..]);

        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&frame[26..34]);
        pseudo.extend_from_slice(&[0, IPPROTO_UDP]);
        pseudo.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
        assert_eq!(reference_sum(&[&pseudo[..], &datagram]), 0);
    }

    #[test]
    fn pseudo_policy() {
        let frame = tcp4_frame(2000, 0);
        let ctx = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 1000);
        for (seg, wire) in carve_all(&ctx, &frame, ChecksumPolicy::Pseudo) {
            let expected = checksum::pseudo_header(
                IPPROTO_TCP,
                &wire[26..30],
                &wire[30..34],
                (20 + seg.payload_len) as u32,
            )
            .fold();
            assert_eq!(BigEndian::read_u16(&wire[50..52]), expected);
        }

        for (_, wire) in carve_all(&ctx, &frame, ChecksumPolicy::Untouched) {
            assert_eq!(&wire[50..52], &frame[50..52]);
        }
    }

    #[test]
    fn bad_carve_arguments() {
        let frame = tcp4_frame(2000, 0);
        let ctx = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 1000);
        let mut small = [0u8; 64];
        assert_eq!(
            ctx.carve_segment(&frame, 0, 2, &mut small, ChecksumPolicy::Complete),
            Err(GsoError::ScratchTooSmall(64))
        );
        let mut scratch = [0u8; MIN_SCRATCH_SIZE];
        assert_eq!(
            ctx.carve_segment(&frame, 2, 2, &mut scratch, ChecksumPolicy::Complete),
            Err(GsoError::BadSegmentIndex { index: 2, count: 2 })
        );
    }
}
