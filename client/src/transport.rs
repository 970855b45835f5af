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

//! Delivery of requests to the switch.
//!
//! There are two ways to reach a switch:
//!
//! - [`DirectTransport`] calls a [`SupportDriver`](intnet_interface::SupportDriver). Requests
//! are processed synchronously, and the buffer of each interface is mapped by the driver itself.
//! - [`ServiceTransport`] exchanges messages with a separate process over a stream socket. The
//! buffer of each interface is a file that the client maps itself, and waiting is done by
//! sending a notification request then blocking on a local [`Event`](crate::event::Event) until
//! the service notifies that data is ready.
//!
//! Which one is used is decided once when opening the interface, after which the context only
//! deals with a `dyn Transport`.

use crate::error::Error;
use intnet_core::IntNetBuf;
use intnet_interface::{
    ffi::{AbortWaitRequest, WaitRequest},
    InterfaceHandle, Operation, Request, SessionId, Status,
};
use std::{fmt, io};

pub use self::direct::DirectTransport;
pub use self::service::ServiceTransport;

mod direct;
mod service;

/// Channel through which requests are delivered to the switch.
pub trait Transport: fmt::Debug + Send + Sync {
    /// Session to put in requests.
    fn session(&self) -> SessionId;

    /// Performs an operation synchronously. `request` is overwritten with the request as
    /// modified by the switch.
    ///
    /// Returns `Err` only if the request couldn't be delivered. A request that the switch
    /// processed and refused is an `Ok` containing the failure status.
    fn call(&self, operation: Operation, request: &mut [u8]) -> Result<Status, Error>;

    /// Maps the buffer of an interface in the address space of the current process.
    fn map_buffer(&self, handle: InterfaceHandle) -> Result<IntNetBuf, Error>;

    /// Blocks until the receive ring of the interface isn't empty, the wait is aborted, or the
    /// timeout is reached. Returns the status of the wait, as for an `IfWait` request.
    fn wait(&self, handle: InterfaceHandle, timeout_ms: u32) -> Result<Status, Error> {
        let mut request = WaitRequest {
            session: self.session(),
            handle,
            timeout_ms,
        }
        .encode();
        self.call(Operation::IfWait, &mut request)
    }

    /// Wakes up a thread blocked in [`Transport::wait`]. Can be called from any thread.
    fn abort_wait(&self, handle: InterfaceHandle, no_more_waits: bool) -> Result<Status, Error> {
        let mut request = AbortWaitRequest {
            session: self.session(),
            handle,
            no_more_waits,
        }
        .encode();
        self.call(Operation::IfAbortWait, &mut request)
    }
}

/// Sends a typed request and decodes the reply.
pub fn request<R: Request>(transport: &dyn Transport, request: &R) -> Result<(Status, R), Error> {
    let mut buf = request.encode();
    let status = transport.call(R::OPERATION, &mut buf)?;
    let reply = R::decode(&buf).map_err(|err| {
        Error::Transport(io::Error::new(io::ErrorKind::InvalidData, err))
    })?;
    Ok((status, reply))
}
