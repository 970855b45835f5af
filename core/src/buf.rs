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

//! Layout of the buffer shared by a client and the switch.
//!
//! The buffer starts with a header of [`BUF_HEADER_SIZE`] bytes:
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | Magic ([`BUF_MAGIC`])                   |
//! | 4      | 4    | Total size of the buffer                |
//! | 8      | 4    | Size of the receive ring data           |
//! | 12     | 4    | Size of the send ring data              |
//! | 16     | 48   | Receive ring header                     |
//! | 64     | 48   | Send ring header                        |
//! | 112    | 8    | Number of bad frames seen               |
//! | 120    | 8    | Number of frames lost                   |
//! | 128    | 8    | Number of successful yields             |
//! | 136    | 8    | Number of failed yields                 |
//!
//! The data of the receive ring immediately follows the header, and is itself followed by the
//! data of the send ring. See the [`ring`](crate::ring) module for the ring headers.
//!
//! All the offsets stored in a ring header are relative to the ring header itself, not to the
//! start of the buffer.

use crate::region::SharedRegion;
use crate::ring::{self, Ring};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Value of the first field of an initialized buffer.
pub const BUF_MAGIC: u32 = 0x1975_0621;
/// Size of the header of the buffer.
pub const BUF_HEADER_SIZE: u32 = 144;
/// Alignment of the ring sizes, and of every entry in the rings.
pub const RING_ALIGNMENT: u32 = 8;
/// Smallest size of the data of a ring.
pub const MIN_RING_SIZE: u32 = 4 * ring::HDR_SIZE;

const OFF_MAGIC: usize = 0;
const OFF_SIZE: usize = 4;
const OFF_RECV_SIZE: usize = 8;
const OFF_SEND_SIZE: usize = 12;
const OFF_RECV_RING: u32 = 16;
const OFF_SEND_RING: u32 = 64;
const OFF_STAT_BAD_FRAMES: usize = 112;
const OFF_STAT_LOST: usize = 120;
const OFF_STAT_YIELDS_OK: usize = 128;
const OFF_STAT_YIELDS_NOK: usize = 136;

/// Error while initializing or attaching to a buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("buffer of {actual} bytes, expected at least {needed}")]
    TooSmall { needed: usize, actual: usize },
    #[error("bad buffer magic {0:#x}")]
    BadMagic(u32),
    #[error("ring size {0} is invalid")]
    BadRingSize(u32),
    #[error("inconsistent buffer header: {0}")]
    Inconsistent(&'static str),
    #[error("null or misaligned buffer address")]
    BadAddress,
}

/// Rounds a requested ring size the way the switch does.
///
/// Returns `None` if the size overflows.
pub fn ring_size(requested: u32) -> Option<u32> {
    requested
        .max(MIN_RING_SIZE)
        .checked_add(RING_ALIGNMENT - 1)
        .map(|n| n & !(RING_ALIGNMENT - 1))
}

/// Size of a buffer whose rings have the given (already rounded) sizes.
pub fn required_size(recv_size: u32, send_size: u32) -> usize {
    BUF_HEADER_SIZE as usize + recv_size as usize + send_size as usize
}

/// Boundaries of the data of one ring, relative to the ring header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Bounds {
    /// Offset of the ring header from the start of the buffer.
    pub header: u32,
    pub start: u32,
    pub end: u32,
}

/// Snapshot of the buffer-wide counters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BufStats {
    pub bad_frames: u64,
    pub lost_frames: u64,
    pub yields_ok: u64,
    pub yields_nok: u64,
}

/// View over a shared buffer.
///
/// The ring boundaries are read once, when the view is created, and are never read again from
/// the shared memory. Everything else is read from the shared memory whenever needed and
/// checked against these boundaries.
#[derive(Debug)]
pub struct IntNetBuf {
    region: SharedRegion,
    size: u32,
    recv: Bounds,
    send: Bounds,
}

impl IntNetBuf {
    /// Writes a fresh buffer header in `region`. This is what the switch does when an interface
    /// is opened.
    ///
    /// The ring sizes are rounded with [`ring_size`].
    pub fn init(region: SharedRegion, recv_size: u32, send_size: u32) -> Result<IntNetBuf, BufferError> {
        let recv_size = ring_size(recv_size).ok_or(BufferError::BadRingSize(recv_size))?;
        let send_size = ring_size(send_size).ok_or(BufferError::BadRingSize(send_size))?;
        let needed = required_size(recv_size, send_size);
        if needed > region.len() || needed > u32::max_value() as usize {
            return Err(BufferError::TooSmall {
                needed,
                actual: region.len(),
            });
        }
        if (region.as_ptr() as usize) % 8 != 0 {
            return Err(BufferError::BadAddress);
        }

        let recv = Bounds {
            header: OFF_RECV_RING,
            start: BUF_HEADER_SIZE - OFF_RECV_RING,
            end: BUF_HEADER_SIZE - OFF_RECV_RING + recv_size,
        };
        let send = Bounds {
            header: OFF_SEND_RING,
            start: BUF_HEADER_SIZE + recv_size - OFF_SEND_RING,
            end: BUF_HEADER_SIZE + recv_size - OFF_SEND_RING + send_size,
        };

        let buf = IntNetBuf {
            region,
            size: needed as u32,
            recv,
            send,
        };

        buf.u32_at(OFF_SIZE).store(buf.size, Ordering::Relaxed);
        buf.u32_at(OFF_RECV_SIZE).store(recv_size, Ordering::Relaxed);
        buf.u32_at(OFF_SEND_SIZE).store(send_size, Ordering::Relaxed);
        buf.recv().reset();
        buf.send().reset();
        for off in &[
            OFF_STAT_BAD_FRAMES,
            OFF_STAT_LOST,
            OFF_STAT_YIELDS_OK,
            OFF_STAT_YIELDS_NOK,
        ] {
            buf.u64_at(*off).store(0, Ordering::Relaxed);
        }
        buf.u32_at(OFF_MAGIC).store(BUF_MAGIC, Ordering::Release);

        log::trace!(
            "initialized buffer of {} bytes (recv: {}, send: {})",
            buf.size,
            recv_size,
            send_size
        );
        Ok(buf)
    }

    /// Attaches to a buffer previously initialized by [`IntNetBuf::init`], possibly by somebody
    /// else, and checks that its header is consistent.
    pub fn attach(region: SharedRegion) -> Result<IntNetBuf, BufferError> {
        if region.len() < BUF_HEADER_SIZE as usize {
            return Err(BufferError::TooSmall {
                needed: BUF_HEADER_SIZE as usize,
                actual: region.len(),
            });
        }
        if (region.as_ptr() as usize) % 8 != 0 {
            return Err(BufferError::BadAddress);
        }

        let read = |off: usize| -> u32 {
            // SAFETY: `off` is inside the header, which we checked is inside the region.
            unsafe { (*(region.as_ptr().add(off) as *const AtomicU32)).load(Ordering::Acquire) }
        };

        let magic = read(OFF_MAGIC);
        if magic != BUF_MAGIC {
            return Err(BufferError::BadMagic(magic));
        }

        let size = read(OFF_SIZE);
        let recv_size = read(OFF_RECV_SIZE);
        let send_size = read(OFF_SEND_SIZE);
        if size as usize > region.len() {
            return Err(BufferError::TooSmall {
                needed: size as usize,
                actual: region.len(),
            });
        }
        if (size as usize) < required_size(recv_size, send_size) {
            return Err(BufferError::Inconsistent("ring sizes exceed the buffer size"));
        }

        let recv = Bounds {
            header: OFF_RECV_RING,
            start: read(OFF_RECV_RING as usize + ring::OFF_START),
            end: read(OFF_RECV_RING as usize + ring::OFF_END),
        };
        let send = Bounds {
            header: OFF_SEND_RING,
            start: read(OFF_SEND_RING as usize + ring::OFF_START),
            end: read(OFF_SEND_RING as usize + ring::OFF_END),
        };

        let (recv_abs_start, recv_abs_end) = check_bounds(&recv, size)?;
        let (send_abs_start, send_abs_end) = check_bounds(&send, size)?;
        if recv_abs_start < send_abs_end && send_abs_start < recv_abs_end {
            return Err(BufferError::Inconsistent("rings overlap"));
        }
        if recv_abs_end - recv_abs_start != u64::from(recv_size)
            || send_abs_end - send_abs_start != u64::from(send_size)
        {
            return Err(BufferError::Inconsistent("ring sizes don't match the header"));
        }

        let buf = IntNetBuf {
            region,
            size,
            recv,
            send,
        };
        buf.recv()
            .check_cursors()
            .map_err(|_| BufferError::Inconsistent("receive ring cursors out of bounds"))?;
        buf.send()
            .check_cursors()
            .map_err(|_| BufferError::Inconsistent("send ring cursors out of bounds"))?;
        Ok(buf)
    }

    /// Attaches to a buffer given only its address, reading its size from the header.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a buffer initialized by [`IntNetBuf::init`] that stays valid for as
    /// long as the returned value is alive.
    pub unsafe fn attach_raw(ptr: *mut u8) -> Result<IntNetBuf, BufferError> {
        let header = SharedRegion::from_raw(ptr, BUF_HEADER_SIZE as usize)
            .ok_or(BufferError::BadAddress)?;
        let magic = (*(header.as_ptr() as *const AtomicU32)).load(Ordering::Acquire);
        if magic != BUF_MAGIC {
            return Err(BufferError::BadMagic(magic));
        }
        let size = (*(header.as_ptr().add(OFF_SIZE) as *const AtomicU32)).load(Ordering::Relaxed);
        let region = SharedRegion::from_raw(ptr, size as usize).ok_or(BufferError::BadAddress)?;
        IntNetBuf::attach(region)
    }

    /// Ring written by the switch and read by the client.
    pub fn recv(&self) -> Ring<'_> {
        // SAFETY: The bounds have been checked against the region.
        unsafe { Ring::new(self.region.as_ptr(), self.recv) }
    }

    /// Ring written by the client and read by the switch.
    pub fn send(&self) -> Ring<'_> {
        // SAFETY: The bounds have been checked against the region.
        unsafe { Ring::new(self.region.as_ptr(), self.send) }
    }

    /// Total size of the buffer, as found in its header.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Memory backing the buffer.
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn stats(&self) -> BufStats {
        BufStats {
            bad_frames: self.u64_at(OFF_STAT_BAD_FRAMES).load(Ordering::Relaxed),
            lost_frames: self.u64_at(OFF_STAT_LOST).load(Ordering::Relaxed),
            yields_ok: self.u64_at(OFF_STAT_YIELDS_OK).load(Ordering::Relaxed),
            yields_nok: self.u64_at(OFF_STAT_YIELDS_NOK).load(Ordering::Relaxed),
        }
    }

    /// Counts an entry that was dropped because it couldn't be interpreted.
    pub fn record_bad_frame(&self) {
        self.u64_at(OFF_STAT_BAD_FRAMES).fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a frame that couldn't be delivered because a ring was full.
    pub fn record_lost_frame(&self) {
        self.u64_at(OFF_STAT_LOST).fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an attempt at waiting for the other side to make room in a ring.
    pub fn record_yield(&self, success: bool) {
        let off = if success {
            OFF_STAT_YIELDS_OK
        } else {
            OFF_STAT_YIELDS_NOK
        };
        self.u64_at(off).fetch_add(1, Ordering::Relaxed);
    }

    fn u32_at(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off + 4 <= BUF_HEADER_SIZE as usize && off % 4 == 0);
        // SAFETY: Header fields are within the region, which is 8-bytes-aligned.
        unsafe { &*(self.region.as_ptr().add(off) as *const AtomicU32) }
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off + 8 <= BUF_HEADER_SIZE as usize && off % 8 == 0);
        // SAFETY: Same as above.
        unsafe { &*(self.region.as_ptr().add(off) as *const AtomicU64) }
    }
}

/// Checks the boundaries of a ring and returns them relative to the start of the buffer.
fn check_bounds(bounds: &Bounds, buf_size: u32) -> Result<(u64, u64), BufferError> {
    let abs_start = u64::from(bounds.header) + u64::from(bounds.start);
    let abs_end = u64::from(bounds.header) + u64::from(bounds.end);
    if abs_start < u64::from(BUF_HEADER_SIZE) || abs_end > u64::from(buf_size) {
        return Err(BufferError::Inconsistent("ring outside of the buffer"));
    }
    if bounds.start % RING_ALIGNMENT != 0 || bounds.end % RING_ALIGNMENT != 0 {
        return Err(BufferError::Inconsistent("misaligned ring"));
    }
    if abs_end < abs_start + u64::from(MIN_RING_SIZE) {
        return Err(BufferError::Inconsistent("ring too small"));
    }
    Ok((abs_start, abs_end))
}
