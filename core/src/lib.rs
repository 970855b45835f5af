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

//! Data plane of an internal network interface.
//!
//! Frames are exchanged between a client and the switch through a buffer of memory shared
//! between the two. This buffer contains two rings:
//!
//! - The *send* ring, written by the client and read by the switch.
//! - The *receive* ring, written by the switch and read by the client.
//!
//! Each ring has exactly one reader and one writer. The only synchronization between the two is
//! the atomic loads and stores of the read and write cursors. Consequently, the code of this
//! crate never blocks. Waiting for frames to arrive is done through requests to the switch,
//! which are out of scope here.
//!
//! # Overview
//!
//! - [`SharedRegion`] is the memory itself, either allocated on the heap, mapped from a file, or
//! borrowed from somebody else.
//! - [`IntNetBuf`] is a view over a region containing the layout described in the [`buf`]
//! module.
//! - [`Ring`] gives access to one of the two rings and lets you read and write frames.
//! - [`GsoContext`] describes a *GSO frame*, a frame that must be split into multiple frames
//! before being put on the wire. See the [`gso`] module.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod buf;
pub mod checksum;
pub mod gso;
pub mod region;
pub mod ring;

pub use buf::{BufStats, BufferError, IntNetBuf};
pub use gso::{CarvedSegment, ChecksumPolicy, GsoContext, GsoError, GsoType};
pub use region::SharedRegion;
pub use ring::{EntryHeader, Reservation, Ring, RingEntry, RingError, RingStats};
