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

//! Contract between an internal network client and the switch.
//!
//! An *internal network* is a virtual Ethernet segment whose switch lives outside of the client:
//! either in a privileged component reached through a support driver, or in a separate process
//! reached through a message-passing service. In both cases, the client and the switch talk
//! through two channels:
//!
//! - Requests. Each request is a fixed-layout little-endian structure starting with a common
//! header (a magic value and the size of the structure), followed by the session and the
//! operation-specific fields. The switch writes its output fields back into the same buffer.
//! See the [`ffi`] module.
//! - A shared memory buffer containing two ring buffers, one per direction, through which the
//! Ethernet frames themselves are exchanged. The layout of that buffer is handled by the
//! `intnet-core` crate.
//!
//! The [`SupportDriver`] trait is the seam through which requests are delivered in the direct
//! mode. The [`svc`] module describes the messages exchanged with an out-of-process switch.
//!
//! # Request lifecycle
//!
//! A client first sends an `Open` request naming the network it wants to join. The switch creates
//! the network if it doesn't exist, allocates the shared buffer, and answers with an interface
//! handle. All the other requests target that handle, until `IfClose` is sent.
//!
//! > **Note**: The handle `0` is never attributed and is used as the "no interface" sentinel.
//! >           See [`InterfaceHandle::INVALID`].

#![deny(rustdoc::broken_intra_doc_links)]

pub mod driver;
pub mod ffi;
pub mod svc;

pub use driver::SupportDriver;
pub use ffi::{
    DecodeError, InterfaceHandle, OpenFlags, Operation, Request, SessionId, Status, TrunkType,
};
