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

//! Direct access to a switch living in the same address space, or behind a privileged driver.

use crate::ffi::{Operation, SessionId, Status};

/// Access to the support driver that hosts the switch.
///
/// Calls are synchronous. [`SupportDriver::call`] blocks for the duration of the operation,
/// which for [`Operation::IfWait`] can be arbitrarily long. Implementations must therefore accept
/// concurrent calls from multiple threads, so that an `IfAbortWait` can be delivered while another
/// thread is blocked in an `IfWait`.
///
/// # Safety
///
/// On success, an `IfGetBufferPtrs` request must fill `client_address` with the address of a
/// buffer initialized by `intnet_core::IntNetBuf::init`, aligned on 8 bytes, that stays valid
/// until the interface is closed with `IfClose`. The client accesses that memory directly.
pub unsafe trait SupportDriver: Send + Sync {
    /// Opens a new session with the driver.
    fn open_session(&self) -> Result<SessionId, Status>;

    /// Closes a session previously returned by `open_session`.
    fn close_session(&self, session: SessionId);

    /// Returns true if the driver can't actually host the switch, in which case the client
    /// should reach the switch through the message-passing service instead.
    fn is_driverless(&self) -> bool {
        false
    }

    /// Makes sure that the switch code is loaded. Called once per session, before any `call`.
    fn load_switch(&self, session: SessionId) -> Result<(), Status>;

    /// Performs an operation. `request` contains an encoded request whose size matches
    /// [`Operation::request_size`], and the switch writes its output fields back into it.
    fn call(&self, session: SessionId, operation: Operation, request: &mut [u8]) -> Status;
}
