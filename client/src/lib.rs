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

//! Client side of an internal network.
//!
//! This crate lets a program attach an interface to an internal network and exchange Ethernet
//! frames with the other interfaces of that network.
//!
//! # Usage
//!
//! - Build an [`OpenConfig`] indicating how to reach the switch and which network to join, and
//! pass it to [`IntNetIf::open`].
//! - Call [`IntNetIf::set_active`] to start the flow of frames.
//! - Send frames with [`IntNetIf::send_frame`], or with [`IntNetIf::alloc_frame`] if you prefer
//! to build them in place.
//! - Receive frames by calling [`IntNetIf::pump_packets`] from a dedicated thread. It runs until
//! [`AbortHandle::abort`] is called from another thread.
//!
//! > **Note**: The pump carves GSO super-frames into regular frames, unless a GSO callback is
//! >           passed, in which case super-frames are passed to it whole.
//!
//! Dropping the [`IntNetIf`] closes the interface.

#![deny(rustdoc::broken_intra_doc_links)]

pub use config::{Backend, OpenConfig, DEFAULT_WAIT_TIMEOUT_MS};
pub use context::{AbortHandle, IntNetIf, OutputFrame, WaitStatus};
pub use error::Error;
pub use pump::{FrameCallback, GsoCallback};

pub mod config;
pub mod event;
pub mod transport;

mod context;
mod error;
mod pump;
