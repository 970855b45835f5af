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

//! Internal network switch running in the current process.
//!
//! [`LoopbackSwitch`] honours every request of the switch contract and forwards the frames sent
//! by each interface to all the other active interfaces of the same network. It implements
//! [`SupportDriver`](intnet_interface::SupportDriver), and can therefore be used directly by a
//! client in the same process.
//!
//! [`ServiceHost`] exposes a switch on a Unix socket, speaking the message-passing protocol of
//! the `intnet_interface::svc` module. Clients connected this way map the buffers of their
//! interfaces from files, which requires the switch to be created with
//! [`LoopbackSwitch::with_shared_files`].
//!
//! > **Note**: There is no MAC address learning. The switch behaves like a hub, and the MAC
//! >           address and promiscuous mode of interfaces are only recorded.

#![deny(rustdoc::broken_intra_doc_links)]

pub use service::ServiceHost;
pub use switch::LoopbackSwitch;

mod port;
mod service;
mod switch;
