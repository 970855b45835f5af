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

//! Messages exchanged with an out-of-process switch.
//!
//! The client connects to a stream endpoint and sends [`ClientMessage`]s. The service answers
//! with [`ServiceMessage`]s. Each message is SCALE-encoded and preceded by its length as a
//! little-endian `u32`.
//!
//! A [`ClientMessage::Call`] is always answered with exactly one [`ServiceMessage::Reply`]
//! carrying the same `id`. The reply contains the request buffer as modified by the switch, which
//! the client copies back verbatim. The reply to `IfGetBufferPtrs` additionally names the shared
//! memory object containing the buffer of the interface.
//!
//! A [`ClientMessage::Notify`] is never answered. It is used for `IfWait`: the service sends
//! [`ServiceMessage::ReceiveReady`] as soon as the receive ring of the interface isn't empty.

use crate::ffi::Status;
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use parity_scale_codec::{Decode, Encode};
use std::{
    io::{self, Read, Write},
    path::PathBuf,
};

/// Upper half of every `rc` field of a reply.
pub const RC_MAGIC: u32 = 0x494e_5456;

/// Maximum size of a single encoded message. Requests are a few hundred bytes at most.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Name of the service endpoint when nothing else is configured.
pub const DEFAULT_SERVICE_NAME: &str = "intnet-switch";

/// Returns the path of the stream endpoint of the service with the given name.
pub fn endpoint_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.sock", name))
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ClientMessage {
    /// Performs an operation and waits for a reply.
    Call {
        /// Identifier repeated in the reply.
        id: u64,
        operation: u32,
        request: Vec<u8>,
    },
    /// Performs an operation without expecting a reply.
    Notify { operation: u32, request: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ServiceMessage {
    Reply {
        id: u64,
        /// Status of the operation, see [`encode_rc`].
        rc: u64,
        /// The request buffer after the operation.
        reply: Vec<u8>,
        /// Shared memory that the client must map.
        shared_memory: Option<SharedMemory>,
    },
    /// The receive ring of the interface isn't empty anymore.
    ReceiveReady,
}

/// Shared memory object holding the buffer of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SharedMemory {
    /// Path of the file to map.
    pub path: String,
    /// Number of bytes to map.
    pub size: u64,
}

/// Packs a status into the `rc` field of a reply.
pub fn encode_rc(status: Status) -> u64 {
    (u64::from(RC_MAGIC) << 32) | u64::from(status.0 as u32)
}

/// Unpacks the `rc` field of a reply. Returns `None` if the magic doesn't match.
pub fn decode_rc(rc: u64) -> Option<Status> {
    if (rc >> 32) as u32 != RC_MAGIC {
        return None;
    }
    Some(Status(rc as u32 as i32))
}

/// Writes a length-prefixed message.
pub fn write_message<W: Write, M: Encode>(out: &mut W, message: &M) -> io::Result<()> {
    let encoded = message.encode();
    debug_assert!(encoded.len() <= MAX_MESSAGE_SIZE);
    out.write_u32::<LittleEndian>(encoded.len() as u32)?;
    out.write_all(&encoded)?;
    out.flush()
}

/// Reads a length-prefixed message.
pub fn read_message<R: Read, M: Decode>(input: &mut R) -> io::Result<M> {
    let len = input.read_u32::<LittleEndian>()? as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {} bytes", len),
        ));
    }
    let mut buf = vec![0; len];
    input.read_exact(&mut buf)?;
    M::decode(&mut &buf[..])
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", err)))
}
