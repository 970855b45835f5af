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

//! Single-producer single-consumer ring of frames.
//!
//! # Ring header
//!
//! | Offset | Size | Field                                                   |
//! |--------|------|---------------------------------------------------------|
//! | 0      | 4    | Offset of the first byte of data                        |
//! | 4      | 4    | Offset of the end of the data                           |
//! | 8      | 4    | Write cursor, internal to the writer                    |
//! | 12     | 4    | Committed write cursor                                  |
//! | 16     | 4    | Read cursor                                             |
//! | 20     | 4    | Padding                                                 |
//! | 24     | 8    | Number of bytes written                                 |
//! | 32     | 8    | Number of frames written                                |
//! | 40     | 8    | Number of times the writer found the ring full          |
//!
//! All offsets are relative to the ring header. The ring is empty when the read cursor is equal
//! to the committed write cursor.
//!
//! # Entries
//!
//! Each entry starts with an 8 bytes header, aligned on 8 bytes:
//!
//! - A little-endian `u32` whose 24 lower bits are the length of the frame, and 8 upper bits
//! are the type of entry (see [`TYPE_FRAME`], [`TYPE_GSO`] and [`TYPE_PADDING`]).
//! - A little-endian `i32` containing the offset of the frame relative to the entry header.
//!
//! The frame is normally found right after its header. However, when there isn't enough space
//! left between the header and the end of the ring, the frame is instead written at the start of
//! the ring, in which case its offset is negative. A frame is never split in two.
//!
//! After the frame comes the next entry, aligned on 8 bytes. When the end of the ring is
//! reached, the next entry is at the start of the ring.
//!
//! > **Note**: The writer never fills the ring completely, as a full ring would be
//! >           indistinguishable from an empty one.
//!
//! Since frames are never split, a frame is only accepted if it can be placed in the empty ring
//! whatever the position of the cursors. This is the case when twice its aligned length plus
//! the size of a header fits in the ring. Larger frames are rejected with
//! [`RingError::FrameTooLarge`] rather than [`RingError::TryAgain`], as waiting for the reader
//! wouldn't help.

use crate::buf::Bounds;
use crate::gso::{GsoContext, GSO_CONTEXT_SIZE};
use byteorder::{ByteOrder as _, LittleEndian};
use std::{
    convert::TryFrom,
    fmt,
    marker::PhantomData,
    slice,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

/// Size of the header of each entry.
pub const HDR_SIZE: u32 = 8;
/// Alignment of each entry.
pub const HDR_ALIGNMENT: u32 = 8;
/// Largest frame length that fits in an entry header.
pub const MAX_FRAME_LEN: u32 = 0x00ff_ffff;

/// Regular Ethernet frame.
pub const TYPE_FRAME: u8 = 0x42;
/// GSO context followed by an Ethernet super-frame.
pub const TYPE_GSO: u8 = 0x43;
/// Space to skip.
pub const TYPE_PADDING: u8 = 0x53;

pub(crate) const OFF_START: usize = 0;
pub(crate) const OFF_END: usize = 4;
const OFF_WRITE_INT: usize = 8;
const OFF_WRITE_COM: usize = 12;
const OFF_READ: usize = 16;
const OFF_STAT_WRITTEN: usize = 24;
const OFF_STAT_FRAMES: usize = 32;
const OFF_STAT_OVERFLOWS: usize = 40;

/// Error while reading from or writing to a ring.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// Not enough free space right now. The reader must consume some entries first.
    #[error("not enough space in the ring")]
    TryAgain,
    /// The frame would never fit, even in an empty ring.
    #[error("frame of {0} bytes can't fit in the ring")]
    FrameTooLarge(u32),
    #[error("ring is empty")]
    Empty,
    /// Reservations must be committed in the order they were made.
    #[error("reservation committed out of order")]
    OutOfOrder,
    #[error("can't commit {used} bytes of a {reserved} bytes reservation")]
    BadLength { used: u32, reserved: u32 },
    /// The shared memory contains values that can't possibly be right.
    #[error("ring corrupted: {0}")]
    Corrupted(&'static str),
}

/// Entry header, as found in the ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    /// Position of the header in the ring.
    position: u32,
    /// One of the `TYPE_*` constants, or something else if the writer is misbehaving.
    pub kind: u8,
    /// Length of the frame.
    pub frame_len: u32,
    /// Offset of the frame relative to `position`.
    pub frame_offset: i32,
}

/// Decoded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingEntry<'a> {
    /// Ethernet frame, without CRC.
    Frame(&'a [u8]),
    /// Super-frame to carve according to `context`. Not validated.
    Gso {
        context: GsoContext,
        frame: &'a [u8],
    },
    /// Space to skip, of the given length.
    Padding(u32),
    /// Unknown type, or GSO entry too short to contain a context.
    Other { kind: u8, len: u32 },
}

/// Space reserved in a ring but not committed yet.
///
/// Must be passed back to [`Ring::commit`], [`Ring::commit_partial`] or [`Ring::abandon`]. If
/// it is simply dropped, the ring is stuck as nothing can be committed after it.
#[must_use]
pub struct Reservation {
    /// Address of the header of the ring the reservation belongs to.
    ring: usize,
    /// Position of the entry header.
    header: u32,
    /// Position of the frame as announced in the header, relative to the ring header.
    frame: u32,
    /// Bytes at the start of the frame that aren't part of the payload.
    prefix: u32,
    /// Length of the payload.
    len: u32,
}

impl Reservation {
    /// Number of bytes available to the caller.
    pub fn len(&self) -> u32 {
        self.len
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("header", &self.header)
            .field("len", &self.len)
            .finish()
    }
}

/// Snapshot of the counters of a ring.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RingStats {
    pub bytes_written: u64,
    pub frames_written: u64,
    pub overflows: u64,
}

/// Access to one of the two rings of a buffer.
///
/// A `Ring` can be used either as a reader or as a writer, but a given side must stick to one
/// role. The client reads the receive ring and writes the send ring, and the switch does the
/// opposite.
pub struct Ring<'a> {
    /// Address of the ring header.
    base: *mut u8,
    start: u32,
    end: u32,
    marker: PhantomData<&'a crate::buf::IntNetBuf>,
}

impl<'a> Ring<'a> {
    /// # Safety
    ///
    /// `buf + bounds.header` must point to a ring header, and the range between `start` and `end`
    /// must be valid memory.
    pub(crate) unsafe fn new(buf: *mut u8, bounds: Bounds) -> Ring<'a> {
        Ring {
            base: buf.add(bounds.header as usize),
            start: bounds.start,
            end: bounds.end,
            marker: PhantomData,
        }
    }

    /// Number of bytes of data in the ring, including entry headers.
    pub fn capacity(&self) -> u32 {
        self.end - self.start
    }

    /// Returns true if no entry is available for reading.
    pub fn is_empty(&self) -> bool {
        self.cursor(OFF_READ).load(Ordering::Relaxed)
            == self.cursor(OFF_WRITE_COM).load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            bytes_written: self.stat(OFF_STAT_WRITTEN).load(Ordering::Relaxed),
            frames_written: self.stat(OFF_STAT_FRAMES).load(Ordering::Relaxed),
            overflows: self.stat(OFF_STAT_OVERFLOWS).load(Ordering::Relaxed),
        }
    }

    /// Returns the header of the next entry to read, or `None` if the ring is empty.
    pub fn peek_header(&self) -> Result<Option<EntryHeader>, RingError> {
        let read = self.load_cursor(OFF_READ, Ordering::Relaxed)?;
        let committed = self.load_cursor(OFF_WRITE_COM, Ordering::Acquire)?;
        if read == committed {
            return Ok(None);
        }

        let header = self.read_header(read)?;
        // Makes sure that the frame is within bounds before anyone tries to access it.
        self.span(frame_position(&header), header.frame_len)?;
        Ok(Some(header))
    }

    /// Returns the next entry to read, or `None` if the ring is empty. Doesn't advance the read
    /// cursor.
    pub fn peek(&self) -> Result<Option<RingEntry<'_>>, RingError> {
        let header = match self.peek_header()? {
            Some(h) => h,
            None => return Ok(None),
        };

        Ok(Some(match header.kind {
            TYPE_FRAME => RingEntry::Frame(self.frame(&header)?),
            TYPE_GSO if header.frame_len as usize >= GSO_CONTEXT_SIZE => {
                let (context, frame) = self.gso_frame(&header)?;
                RingEntry::Gso { context, frame }
            }
            TYPE_PADDING => RingEntry::Padding(header.frame_len),
            kind => RingEntry::Other {
                kind,
                len: header.frame_len,
            },
        }))
    }

    /// Returns the frame of an entry.
    pub fn frame(&self, header: &EntryHeader) -> Result<&[u8], RingError> {
        self.bytes(frame_position(header), header.frame_len)
    }

    /// Returns the GSO context of an entry and the super-frame that follows it.
    pub fn gso_frame(&self, header: &EntryHeader) -> Result<(GsoContext, &[u8]), RingError> {
        let raw = self.frame(header)?;
        if raw.len() < GSO_CONTEXT_SIZE {
            return Err(RingError::Corrupted("GSO entry shorter than its context"));
        }
        let (context, frame) = raw.split_at(GSO_CONTEXT_SIZE);
        Ok((GsoContext::from_bytes(context), frame))
    }

    /// Advances the read cursor past the next entry, whatever its type.
    pub fn skip(&mut self) -> Result<(), RingError> {
        let header = self.peek_header()?.ok_or(RingError::Empty)?;
        let next = self.entry_end(&header);
        self.cursor(OFF_READ).store(next, Ordering::Release);
        Ok(())
    }

    /// Reserves space for a frame of `len` bytes.
    pub fn allocate_frame(&mut self, len: u32) -> Result<Reservation, RingError> {
        self.allocate(TYPE_FRAME, len, 0)
    }

    /// Reserves space for a GSO super-frame of `len` bytes, and writes its context.
    pub fn allocate_gso_frame(
        &mut self,
        context: &GsoContext,
        len: u32,
    ) -> Result<Reservation, RingError> {
        let prefix = GSO_CONTEXT_SIZE as u32;
        let total = len
            .checked_add(prefix)
            .ok_or(RingError::FrameTooLarge(len))?;
        let reservation = self.allocate(TYPE_GSO, total, prefix)?;
        let dest = self.raw_mut(reservation.frame, prefix);
        context.write_to(dest);
        Ok(reservation)
    }

    /// Gives access to the payload of a reservation.
    ///
    /// # Panic
    ///
    /// Panics if the reservation belongs to a different ring.
    pub fn payload_mut(&mut self, reservation: &Reservation) -> &mut [u8] {
        assert_eq!(reservation.ring, self.base as usize);
        self.raw_mut(reservation.frame + reservation.prefix, reservation.len)
    }

    /// Publishes a reservation to the reader.
    pub fn commit(&mut self, reservation: Reservation) -> Result<(), RingError> {
        let len = reservation.len;
        self.commit_partial(reservation, len)
    }

    /// Publishes a reservation to the reader, but only the first `used` bytes of its payload.
    ///
    /// The rest of the reserved space is turned into padding.
    pub fn commit_partial(&mut self, reservation: Reservation, used: u32) -> Result<(), RingError> {
        assert_eq!(reservation.ring, self.base as usize);
        if used > reservation.len {
            return Err(RingError::BadLength {
                used,
                reserved: reservation.len,
            });
        }
        self.check_commit_order(&reservation)?;

        let reserved = align(reservation.prefix + reservation.len);
        let kept = align(reservation.prefix + used);
        let header = self.read_header(reservation.header)?;
        self.write_header(reservation.header, header.kind, reservation.prefix + used, header.frame_offset);
        if kept < reserved {
            let padding = reservation.frame + kept;
            self.write_header(
                padding,
                TYPE_PADDING,
                reserved - kept - HDR_SIZE,
                HDR_SIZE as i32,
            );
        }

        let next = wrap(reservation.frame + reserved, self.start, self.end);
        self.cursor(OFF_WRITE_COM).store(next, Ordering::Release);
        self.stat(OFF_STAT_WRITTEN)
            .fetch_add(u64::from(reservation.prefix + used), Ordering::Relaxed);
        self.stat(OFF_STAT_FRAMES).fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Gives up on a reservation. The reserved space is turned into padding and committed.
    pub fn abandon(&mut self, reservation: Reservation) -> Result<(), RingError> {
        assert_eq!(reservation.ring, self.base as usize);
        self.check_commit_order(&reservation)?;
        let header = self.read_header(reservation.header)?;
        self.write_header(
            reservation.header,
            TYPE_PADDING,
            header.frame_len,
            header.frame_offset,
        );
        let next = self.entry_end(&header);
        self.cursor(OFF_WRITE_COM).store(next, Ordering::Release);
        Ok(())
    }

    /// Allocates, copies and commits a frame.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), RingError> {
        let len = u32::try_from(frame.len()).map_err(|_| RingError::FrameTooLarge(MAX_FRAME_LEN))?;
        let reservation = self.allocate_frame(len)?;
        self.payload_mut(&reservation).copy_from_slice(frame);
        self.commit(reservation)
    }

    /// Allocates, copies and commits a GSO super-frame.
    pub fn write_gso_frame(&mut self, context: &GsoContext, frame: &[u8]) -> Result<(), RingError> {
        let len = u32::try_from(frame.len()).map_err(|_| RingError::FrameTooLarge(MAX_FRAME_LEN))?;
        let reservation = self.allocate_gso_frame(context, len)?;
        self.payload_mut(&reservation).copy_from_slice(frame);
        self.commit(reservation)
    }

    /// Resets the header of the ring. Only the switch does this, before anyone uses the buffer.
    pub(crate) fn reset(&self) {
        self.cursor(OFF_START).store(self.start, Ordering::Relaxed);
        self.cursor(OFF_END).store(self.end, Ordering::Relaxed);
        for off in &[OFF_WRITE_INT, OFF_WRITE_COM, OFF_READ] {
            self.cursor(*off).store(self.start, Ordering::Relaxed);
        }
        for off in &[OFF_STAT_WRITTEN, OFF_STAT_FRAMES, OFF_STAT_OVERFLOWS] {
            self.stat(*off).store(0, Ordering::Relaxed);
        }
    }

    /// Checks that all the cursors are within bounds.
    pub(crate) fn check_cursors(&self) -> Result<(), RingError> {
        for off in &[OFF_WRITE_INT, OFF_WRITE_COM, OFF_READ] {
            self.load_cursor(*off, Ordering::Relaxed)?;
        }
        Ok(())
    }

    fn allocate(&mut self, kind: u8, len: u32, prefix: u32) -> Result<Reservation, RingError> {
        if len > MAX_FRAME_LEN {
            return Err(RingError::FrameTooLarge(len));
        }
        let needed = align(len);
        if 2 * needed + HDR_SIZE > self.capacity() {
            return Err(RingError::FrameTooLarge(len));
        }

        let read = self.load_cursor(OFF_READ, Ordering::Acquire)?;
        let write = self.load_cursor(OFF_WRITE_INT, Ordering::Relaxed)?;

        let placement = if read <= write {
            let fits_after = self.end - write >= needed + HDR_SIZE;
            // The write cursor wrapping back exactly onto the read cursor would make the ring
            // look empty.
            let would_meet_reader = write + HDR_SIZE + needed == self.end && read == self.start;
            if fits_after && !would_meet_reader {
                Some((write + HDR_SIZE, wrap(write + HDR_SIZE + needed, self.start, self.end)))
            } else if read - self.start > needed {
                Some((self.start, self.start + needed))
            } else {
                None
            }
        } else if read - write > needed + HDR_SIZE {
            Some((write + HDR_SIZE, write + HDR_SIZE + needed))
        } else {
            None
        };

        let (frame, next) = match placement {
            Some(p) => p,
            None => {
                self.stat(OFF_STAT_OVERFLOWS).fetch_add(1, Ordering::Relaxed);
                return Err(RingError::TryAgain);
            }
        };

        let frame_offset = i64::from(frame) - i64::from(write);
        self.write_header(write, kind, len, frame_offset as i32);
        self.cursor(OFF_WRITE_INT).store(next, Ordering::Relaxed);

        Ok(Reservation {
            ring: self.base as usize,
            header: write,
            frame,
            prefix,
            len: len - prefix,
        })
    }

    fn check_commit_order(&self, reservation: &Reservation) -> Result<(), RingError> {
        let committed = self.load_cursor(OFF_WRITE_COM, Ordering::Relaxed)?;
        if committed != reservation.header {
            return Err(RingError::OutOfOrder);
        }
        Ok(())
    }

    /// Position of the entry following the given one.
    fn entry_end(&self, header: &EntryHeader) -> u32 {
        let end = frame_position(header) + i64::from(align(header.frame_len));
        // `peek_header` has checked that the frame is within bounds.
        wrap(end as u32, self.start, self.end)
    }

    fn read_header(&self, position: u32) -> Result<EntryHeader, RingError> {
        let raw = self.bytes(i64::from(position), HDR_SIZE)?;
        let word = LittleEndian::read_u32(&raw[0..4]);
        Ok(EntryHeader {
            position,
            kind: (word >> 24) as u8,
            frame_len: word & MAX_FRAME_LEN,
            frame_offset: LittleEndian::read_i32(&raw[4..8]),
        })
    }

    fn write_header(&mut self, position: u32, kind: u8, len: u32, frame_offset: i32) {
        debug_assert!(len <= MAX_FRAME_LEN);
        let raw = self.raw_mut(position, HDR_SIZE);
        LittleEndian::write_u32(&mut raw[0..4], (u32::from(kind) << 24) | len);
        LittleEndian::write_i32(&mut raw[4..8], frame_offset);
    }

    /// Checks that `[offset, offset + len)` is within the data of the ring and returns a pointer
    /// to `offset`. Every access to the data goes through this function.
    fn span(&self, offset: i64, len: u32) -> Result<*mut u8, RingError> {
        if offset < i64::from(self.start) || offset + i64::from(len) > i64::from(self.end) {
            return Err(RingError::Corrupted("entry out of bounds"));
        }
        // SAFETY: The offset is within the bounds checked at initialization.
        Ok(unsafe { self.base.add(offset as usize) })
    }

    fn bytes(&self, offset: i64, len: u32) -> Result<&[u8], RingError> {
        let ptr = self.span(offset, len)?;
        // SAFETY: The range is within the ring and, for readers, committed by the writer, which
        // won't touch it again before we advance the read cursor.
        Ok(unsafe { slice::from_raw_parts(ptr, len as usize) })
    }

    /// Same as `bytes`, for positions that we computed ourselves.
    fn raw_mut(&mut self, offset: u32, len: u32) -> &mut [u8] {
        debug_assert!(offset >= self.start && offset + len <= self.end);
        // SAFETY: Only called with ranges derived from our own validated cursors. The range
        // belongs to the writer until it is committed.
        unsafe { slice::from_raw_parts_mut(self.base.add(offset as usize), len as usize) }
    }

    fn load_cursor(&self, off: usize, ordering: Ordering) -> Result<u32, RingError> {
        let value = self.cursor(off).load(ordering);
        if value < self.start || value >= self.end || value % HDR_ALIGNMENT != 0 {
            return Err(RingError::Corrupted("cursor out of bounds"));
        }
        Ok(value)
    }

    fn cursor(&self, off: usize) -> &AtomicU32 {
        // SAFETY: Ring header fields are 4-bytes-aligned and within the buffer header.
        unsafe { &*(self.base.add(off) as *const AtomicU32) }
    }

    fn stat(&self, off: usize) -> &AtomicU64 {
        // SAFETY: Ring header fields are 8-bytes-aligned and within the buffer header.
        unsafe { &*(self.base.add(off) as *const AtomicU64) }
    }
}

impl<'a> fmt::Debug for Ring<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ring")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("read", &self.cursor(OFF_READ).load(Ordering::Relaxed))
            .field("write", &self.cursor(OFF_WRITE_COM).load(Ordering::Relaxed))
            .finish()
    }
}

fn frame_position(header: &EntryHeader) -> i64 {
    i64::from(header.position) + i64::from(header.frame_offset)
}

fn align(len: u32) -> u32 {
    (len + HDR_ALIGNMENT - 1) & !(HDR_ALIGNMENT - 1)
}

fn wrap(position: u32, start: u32, end: u32) -> u32 {
    if position >= end {
        start
    } else {
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buf, IntNetBuf, SharedRegion};

    fn buffer(ring_size: u32) -> IntNetBuf {
        let size = buf::required_size(ring_size, ring_size);
        IntNetBuf::init(SharedRegion::zeroed(size), ring_size, ring_size).unwrap()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|n| (n as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn empty_ring() {
        let buf = buffer(256);
        let mut ring = buf.send();
        assert!(ring.is_empty());
        assert_eq!(ring.peek().unwrap(), None);
        assert_eq!(ring.skip(), Err(RingError::Empty));
    }

    #[test]
    fn plain_frame_round_trip() {
        let buf = buffer(1024);
        let data = pattern(64, 7);

        let mut writer = buf.send();
        let reservation = writer.allocate_frame(64).unwrap();
        writer.payload_mut(&reservation).copy_from_slice(&data);

        // Nothing is visible before the commit.
        let mut reader = buf.send();
        assert_eq!(reader.peek().unwrap(), None);

        writer.commit(reservation).unwrap();
        assert_eq!(reader.peek().unwrap(), Some(RingEntry::Frame(&data[..])));
        reader.skip().unwrap();
        assert!(reader.is_empty());

        let stats = writer.stats();
        assert_eq!(stats.frames_written, 1);
        assert_eq!(stats.bytes_written, 64);
    }

    #[test]
    fn wraparound_preserves_bytes() {
        // Entry sizes that are not divisors of the ring size, so that every possible
        // wrapping situation shows up.
        let buf = buffer(512);
        let mut writer = buf.recv();
        let mut reader = buf.recv();

        let mut seed = 0u8;
        for round in 0..200 {
            let len = 1 + (round * 37) % 180;
            let data = pattern(len, seed);
            seed = seed.wrapping_add(1);

            writer.write_frame(&data).unwrap();
            match reader.peek().unwrap() {
                Some(RingEntry::Frame(frame)) => assert_eq!(frame, &data[..]),
                other => panic!("unexpected entry {:?}", other),
            }
            reader.skip().unwrap();
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn fills_up_then_drains() {
        let buf = buffer(256);
        let mut writer = buf.send();
        let mut reader = buf.send();

        let mut written = Vec::new();
        loop {
            let data = pattern(40, written.len() as u8);
            match writer.write_frame(&data) {
                Ok(()) => written.push(data),
                Err(RingError::TryAgain) => break,
                Err(err) => panic!("{}", err),
            }
        }
        // 256 bytes of ring, 48 bytes per entry, and the ring can never be completely full.
        assert_eq!(written.len(), 5);
        assert_eq!(writer.stats().overflows, 1);

        for data in &written {
            assert_eq!(reader.peek().unwrap(), Some(RingEntry::Frame(&data[..])));
            reader.skip().unwrap();
        }
        assert!(reader.is_empty());

        // Space is available again, and the next frame wraps around.
        let data = pattern(100, 3);
        writer.write_frame(&data).unwrap();
        assert_eq!(reader.peek().unwrap(), Some(RingEntry::Frame(&data[..])));
    }

    #[test]
    fn frame_too_large() {
        let buf = buffer(256);
        let mut ring = buf.send();
        assert_eq!(
            ring.allocate_frame(256).unwrap_err(),
            RingError::FrameTooLarge(256)
        );
        assert_eq!(
            ring.allocate_frame(MAX_FRAME_LEN + 1).unwrap_err(),
            RingError::FrameTooLarge(MAX_FRAME_LEN + 1)
        );
    }

    #[test]
    fn accepted_frames_fit_wherever_the_cursors_are() {
        let buf = buffer(256);
        let mut writer = buf.send();
        let mut reader = buf.send();

        // Moves the cursors to the middle of the ring.
        writer.write_frame(&pattern(120, 1)).unwrap();
        reader.skip().unwrap();
        assert!(reader.is_empty());

        // Would only fit if split in two.
        assert_eq!(
            writer.write_frame(&pattern(136, 2)).unwrap_err(),
            RingError::FrameTooLarge(136)
        );
        assert_eq!(writer.stats().overflows, 0);

        // The largest accepted frame, written while the cursors move around the ring.
        let largest = 120;
        assert!(2 * largest + HDR_SIZE <= 256 && 2 * align(largest + 1) + HDR_SIZE > 256);
        for round in 0..64 {
            let data = pattern(largest as usize, round as u8);
            writer.write_frame(&data).unwrap();
            assert_eq!(reader.peek().unwrap(), Some(RingEntry::Frame(&data[..])));
            reader.skip().unwrap();
            writer.write_frame(&pattern(1 + (round % 4) * 8, 0)).unwrap();
            reader.skip().unwrap();
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn padding_skipped_once() {
        let buf = buffer(512);
        let mut writer = buf.send();
        let mut reader = buf.send();

        // Reserve 100 bytes but only use 20: the 80 remaining bytes become padding.
        let reservation = writer.allocate_frame(100).unwrap();
        writer.payload_mut(&reservation)[..20].copy_from_slice(&pattern(20, 1));
        writer.commit_partial(reservation, 20).unwrap();
        writer.write_frame(&pattern(10, 2)).unwrap();

        assert_eq!(reader.peek().unwrap(), Some(RingEntry::Frame(&pattern(20, 1)[..])));
        reader.skip().unwrap();

        let before = reader.cursor(OFF_READ).load(Ordering::Relaxed);
        // align(100) - align(20) - header size
        assert_eq!(reader.peek().unwrap(), Some(RingEntry::Padding(104 - 24 - 8)));
        reader.skip().unwrap();
        let after = reader.cursor(OFF_READ).load(Ordering::Relaxed);
        assert_eq!(after - before, 72 + HDR_SIZE);

        assert_eq!(reader.peek().unwrap(), Some(RingEntry::Frame(&pattern(10, 2)[..])));
        reader.skip().unwrap();
        assert_eq!(reader.peek().unwrap(), None);
    }

    #[test]
    fn abandon_turns_into_padding() {
        let buf = buffer(256);
        let mut writer = buf.send();
        let mut reader = buf.send();

        let reservation = writer.allocate_frame(30).unwrap();
        assert_eq!(
            format!("{:?}", reservation),
            format!("Reservation {{ header: {}, len: 30 }}", writer.start)
        );
        writer.abandon(reservation).unwrap();
        assert_eq!(reader.peek().unwrap(), Some(RingEntry::Padding(30)));
        reader.skip().unwrap();
        assert!(reader.is_empty());
        assert_eq!(writer.stats().frames_written, 0);
    }

    #[test]
    fn commits_must_be_in_order() {
        let buf = buffer(512);
        let mut writer = buf.send();
        let first = writer.allocate_frame(10).unwrap();
        let second = writer.allocate_frame(10).unwrap();
        assert_eq!(writer.commit(second).unwrap_err(), RingError::OutOfOrder);
        writer.commit(first).unwrap();
    }

    #[test]
    fn gso_entry() {
        let buf = buffer(1024);
        let mut writer = buf.recv();
        let reader = buf.recv();

        let context = GsoContext {
            kind: 1,
            hdrs_total: 54,
            max_seg: 100,
            off_hdr1: 14,
            off_hdr2: 34,
            hdrs_seg: 54,
        };
        let data = pattern(300, 9);
        writer.write_gso_frame(&context, &data).unwrap();

        match reader.peek().unwrap() {
            Some(RingEntry::Gso { context: c, frame }) => {
                assert_eq!(c, context);
                assert_eq!(frame, &data[..]);
            }
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(writer.stats().bytes_written, 308);
    }

    #[test]
    fn unknown_type_reported() {
        let buf = buffer(256);
        let mut writer = buf.send();
        let reservation = writer.allocate(0x99, 12, 0).unwrap();
        writer.commit(reservation).unwrap();
        let mut reader = buf.send();
        assert_eq!(
            reader.peek().unwrap(),
            Some(RingEntry::Other { kind: 0x99, len: 12 })
        );
        reader.skip().unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn corrupted_cursor_detected() {
        let buf = buffer(256);
        let ring = buf.send();
        ring.cursor(OFF_WRITE_COM).store(3, Ordering::Relaxed);
        assert!(matches!(ring.peek(), Err(RingError::Corrupted(_))));
    }

    #[test]
    fn corrupted_header_detected() {
        let buf = buffer(256);
        let mut writer = buf.send();
        writer.write_frame(&[1, 2, 3]).unwrap();
        let start = writer.start;
        writer.write_header(start, TYPE_FRAME, 4000, HDR_SIZE as i32);
        assert!(matches!(writer.peek(), Err(RingError::Corrupted(_))));
    }
}
