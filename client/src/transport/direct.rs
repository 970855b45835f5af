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

use super::{request, Transport};
use crate::error::Error;
use intnet_core::IntNetBuf;
use intnet_interface::{
    ffi::GetBufferPtrsRequest, InterfaceHandle, Operation, SessionId, Status, SupportDriver,
};
use std::{fmt, sync::Arc};

/// Transport that calls a support driver.
pub struct DirectTransport {
    driver: Arc<dyn SupportDriver>,
    session: SessionId,
}

impl DirectTransport {
    /// Opens a session with the driver and makes sure that the switch is loaded.
    pub fn connect(driver: Arc<dyn SupportDriver>) -> Result<DirectTransport, Error> {
        let session = driver.open_session().map_err(Error::Session)?;
        if let Err(status) = driver.load_switch(session) {
            driver.close_session(session);
            return Err(Error::ModuleLoad(status));
        }

        log::debug!("opened driver session {:?}", session);
        Ok(DirectTransport { driver, session })
    }
}

impl Transport for DirectTransport {
    fn session(&self) -> SessionId {
        self.session
    }

    fn call(&self, operation: Operation, request: &mut [u8]) -> Result<Status, Error> {
        Ok(self.driver.call(self.session, operation, request))
    }

    fn map_buffer(&self, handle: InterfaceHandle) -> Result<IntNetBuf, Error> {
        let (status, reply) = request(
            self,
            &GetBufferPtrsRequest {
                session: self.session,
                handle,
                client_address: 0,
                switch_address: 0,
            },
        )?;
        Error::from_status(Operation::IfGetBufferPtrs, status)?;

        // SAFETY: The contract of `SupportDriver` guarantees that the address is valid until the
        // interface is closed, which the context only does after dropping the buffer.
        let buf = unsafe { IntNetBuf::attach_raw(reply.client_address as usize as *mut u8)? };
        Ok(buf)
    }
}

impl fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DirectTransport")
            .field("session", &self.session)
            .finish()
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        log::debug!("closing driver session {:?}", self.session);
        self.driver.close_session(self.session);
    }
}
