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

use intnet_core::{BufferError, RingError};
use intnet_interface::{Operation, Status};
use std::io;

/// Error that can happen when talking to the switch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Couldn't open a session with the support driver.
    #[error("failed to open a session: {0}")]
    Session(Status),
    /// The support driver couldn't load the switch.
    #[error("failed to load the switch: {0}")]
    ModuleLoad(Status),
    /// The switch refused to open the interface.
    #[error("failed to open network {network:?}: {status}")]
    Open { network: String, status: Status },
    /// The parameters passed to open the interface are invalid. Nothing was sent to the switch.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The shared memory of the interface couldn't be mapped.
    #[error("failed to map the interface buffer: {0}")]
    Mapping(#[source] io::Error),
    /// The shared memory of the interface doesn't contain a valid buffer.
    #[error("invalid interface buffer: {0}")]
    Buffer(#[from] BufferError),
    /// A request was processed by the switch but failed.
    #[error("{operation:?} request failed: {status}")]
    Status { operation: Operation, status: Status },
    /// Error while exchanging messages with the switch service.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// The connection to the switch service has been lost. The interface is unusable, but a new
    /// one can be opened once the service is reachable again.
    #[error("connection to the switch service lost")]
    Deferred,
    /// Not enough space in the send ring at the moment.
    #[error("send ring full, try again")]
    TryAgain,
    /// The frame can never fit in the send ring.
    #[error("frame of {0} bytes too large for the send ring")]
    FrameTooLarge(u32),
    /// Waiting is no longer allowed on this interface.
    #[error("wait aborted")]
    WaitAborted,
    /// The receive ring contains invalid data.
    #[error("ring corrupted: {0}")]
    Corrupted(RingError),
    /// The interface has already been destroyed.
    #[error("interface closed")]
    Closed,
}

impl Error {
    /// Returns true if the same operation might succeed when tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TryAgain | Error::Deferred => true,
            Error::Status { status, .. } => {
                *status == Status::TRY_AGAIN
                    || *status == Status::TIMEOUT
                    || *status == Status::INTERRUPTED
            }
            _ => false,
        }
    }

    /// Returns the status code closest to this error.
    pub fn status(&self) -> Status {
        match self {
            Error::Session(s) | Error::ModuleLoad(s) => *s,
            Error::Open { status, .. } | Error::Status { status, .. } => *status,
            Error::InvalidConfig(_) => Status::INVALID_PARAMETER,
            Error::Mapping(_) => Status::NO_MEMORY,
            Error::Buffer(_) | Error::Corrupted(_) => Status::INVALID_STATE,
            Error::Transport(_) | Error::Deferred => Status::INVALID_STATE,
            Error::TryAgain => Status::TRY_AGAIN,
            Error::FrameTooLarge(_) => Status::BUFFER_OVERFLOW,
            Error::WaitAborted => Status::SEM_DESTROYED,
            Error::Closed => Status::INVALID_HANDLE,
        }
    }

    pub(crate) fn from_status(operation: Operation, status: Status) -> Result<(), Error> {
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Status { operation, status })
        }
    }
}

impl From<RingError> for Error {
    fn from(err: RingError) -> Error {
        match err {
            RingError::TryAgain => Error::TryAgain,
            RingError::FrameTooLarge(len) => Error::FrameTooLarge(len),
            err => Error::Corrupted(err),
        }
    }
}
