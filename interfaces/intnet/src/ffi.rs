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

//! Fixed-layout requests understood by the switch.
//!
//! Every request starts with an 8 bytes header containing [`REQUEST_MAGIC`] and the total size
//! of the request, followed by the session identifier. All integers are little-endian. Booleans
//! are a single byte. Structures are padded to a multiple of 8 bytes.

use bitflags::bitflags;
use byteorder::{ByteOrder as _, LittleEndian};
use parity_scale_codec::{Decode, Encode};
use std::{convert::TryFrom, fmt};

/// Value found in the first four bytes of every request.
pub const REQUEST_MAGIC: u32 = 0x1973_0211;
/// Size of the common header of every request.
pub const REQUEST_HEADER_SIZE: usize = 8;
/// Maximum size of a network name, including the terminating NUL byte.
pub const MAX_NETWORK_NAME: usize = 128;
/// Maximum size of a trunk name, including the terminating NUL byte.
pub const MAX_TRUNK_NAME: usize = 64;
/// Maximum size of a GSO super-frame, descriptor excluded.
pub const MAX_GSO_SIZE: u32 = 0x10000;
/// Receive ring size used when the client doesn't ask for anything specific.
pub const DEFAULT_RECV_BUFFER_SIZE: u32 = 318 * 1024;
/// Send ring size used when the client doesn't ask for anything specific. Large enough for three
/// maximal GSO frames.
pub const DEFAULT_SEND_BUFFER_SIZE: u32 = (MAX_GSO_SIZE * 3 + 1023) & !1023;
/// Smallest send ring the switch accepts.
pub const MIN_SEND_BUFFER_SIZE: u32 = 128;
/// Value of [`WaitRequest::timeout_ms`] that means "no timeout".
pub const INDEFINITE_WAIT: u32 = u32::max_value();

/// Opaque identifier of the session a request is issued on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct SessionId(pub u64);

/// Handle of an interface attached to a network, as attributed by the switch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct InterfaceHandle(pub u32);

impl InterfaceHandle {
    /// Sentinel meaning "no interface".
    pub const INVALID: InterfaceHandle = InterfaceHandle(0);

    /// Returns false for [`InterfaceHandle::INVALID`].
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

/// Identifies the operation a request buffer is meant for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    Open = 1,
    IfClose = 2,
    IfGetBufferPtrs = 3,
    IfSetPromiscuousMode = 4,
    IfSetMacAddress = 5,
    IfSetActive = 6,
    IfSend = 7,
    IfWait = 8,
    IfAbortWait = 9,
}

impl Operation {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            1 => Operation::Open,
            2 => Operation::IfClose,
            3 => Operation::IfGetBufferPtrs,
            4 => Operation::IfSetPromiscuousMode,
            5 => Operation::IfSetMacAddress,
            6 => Operation::IfSetActive,
            7 => Operation::IfSend,
            8 => Operation::IfWait,
            9 => Operation::IfAbortWait,
            _ => return None,
        })
    }

    /// Size in bytes of the request buffer that this operation expects.
    pub fn request_size(self) -> usize {
        match self {
            Operation::Open => OpenRequest::SIZE,
            Operation::IfClose => CloseRequest::SIZE,
            Operation::IfGetBufferPtrs => GetBufferPtrsRequest::SIZE,
            Operation::IfSetPromiscuousMode => SetPromiscuousRequest::SIZE,
            Operation::IfSetMacAddress => SetMacAddressRequest::SIZE,
            Operation::IfSetActive => SetActiveRequest::SIZE,
            Operation::IfSend => SendRequest::SIZE,
            Operation::IfWait => WaitRequest::SIZE,
            Operation::IfAbortWait => AbortWaitRequest::SIZE,
        }
    }
}

/// How a network is connected to the outside world.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TrunkType {
    Invalid = 0,
    /// No trunk. The network only connects its interfaces together.
    None = 1,
    /// Same as `None`, but also accepts joining a network that does have a trunk.
    WhateverNone = 2,
    /// Filter driver attached to a host network card.
    NetFlt = 3,
    /// Host-only network adapter.
    NetAdp = 4,
    /// NAT service.
    SrvNat = 5,
}

impl TrunkType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => TrunkType::Invalid,
            1 => TrunkType::None,
            2 => TrunkType::WhateverNone,
            3 => TrunkType::NetFlt,
            4 => TrunkType::NetAdp,
            5 => TrunkType::SrvNat,
            _ => return None,
        })
    }

    /// Returns true if opening a network with this trunk type requires a trunk name.
    pub fn needs_trunk_name(self) -> bool {
        match self {
            TrunkType::NetFlt | TrunkType::NetAdp | TrunkType::SrvNat => true,
            TrunkType::Invalid | TrunkType::None | TrunkType::WhateverNone => false,
        }
    }
}

bitflags! {
    /// Flags passed when opening a network.
    ///
    /// Most flags come in pairs (allow/deny, enabled/disabled). Setting both halves of a pair is
    /// rejected by the switch.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        /// Anyone can join the network. The default is restricted access.
        const ACCESS_PUBLIC = 1 << 0;
        /// The access policy can't be changed by later joiners.
        const ACCESS_FIXED = 1 << 1;
        const PROMISC_ALLOW_CLIENTS = 1 << 2;
        const PROMISC_DENY_CLIENTS = 1 << 3;
        const PROMISC_ALLOW_TRUNK_HOST = 1 << 4;
        const PROMISC_DENY_TRUNK_HOST = 1 << 5;
        const PROMISC_ALLOW_TRUNK_WIRE = 1 << 6;
        const PROMISC_DENY_TRUNK_WIRE = 1 << 7;
        const PROMISC_FIXED = 1 << 8;
        const TRUNK_HOST_ENABLED = 1 << 9;
        const TRUNK_HOST_DISABLED = 1 << 10;
        const TRUNK_HOST_PROMISC_MODE = 1 << 11;
        const TRUNK_HOST_CHASTE_MODE = 1 << 12;
        const TRUNK_WIRE_ENABLED = 1 << 13;
        const TRUNK_WIRE_DISABLED = 1 << 14;
        const TRUNK_WIRE_PROMISC_MODE = 1 << 15;
        const TRUNK_WIRE_CHASTE_MODE = 1 << 16;
        const TRUNK_FIXED = 1 << 17;
        const IF_PROMISC_ALLOW = 1 << 18;
        const IF_PROMISC_DENY = 1 << 19;
        const IF_PROMISC_SEE_TRUNK = 1 << 20;
        const IF_PROMISC_NO_TRUNK = 1 << 21;
        const IF_FIXED = 1 << 22;
        /// The host and the wire share the same MAC address, and the trunk must rewrite it.
        const SHARED_MAC_ON_WIRE = 1 << 24;
        const REQUIRE_AS_RESTRICTIVE_POLICIES = 1 << 25;
        const REQUIRE_EXACT = 1 << 26;
        /// Compatibility flag for older switches that didn't check for unknown bits.
        const WORKAROUND_1 = 1 << 31;
    }
}

impl OpenFlags {
    const PAIRS: [(OpenFlags, OpenFlags); 8] = [
        (OpenFlags::PROMISC_ALLOW_CLIENTS, OpenFlags::PROMISC_DENY_CLIENTS),
        (OpenFlags::PROMISC_ALLOW_TRUNK_HOST, OpenFlags::PROMISC_DENY_TRUNK_HOST),
        (OpenFlags::PROMISC_ALLOW_TRUNK_WIRE, OpenFlags::PROMISC_DENY_TRUNK_WIRE),
        (OpenFlags::TRUNK_HOST_ENABLED, OpenFlags::TRUNK_HOST_DISABLED),
        (OpenFlags::TRUNK_HOST_PROMISC_MODE, OpenFlags::TRUNK_HOST_CHASTE_MODE),
        (OpenFlags::TRUNK_WIRE_ENABLED, OpenFlags::TRUNK_WIRE_DISABLED),
        (OpenFlags::TRUNK_WIRE_PROMISC_MODE, OpenFlags::TRUNK_WIRE_CHASTE_MODE),
        (OpenFlags::IF_PROMISC_ALLOW, OpenFlags::IF_PROMISC_DENY),
    ];

    /// Returns the first pair of mutually exclusive flags that are both set, if any.
    pub fn conflict(&self) -> Option<(OpenFlags, OpenFlags)> {
        Self::PAIRS
            .iter()
            .find(|(a, b)| self.contains(*a) && self.contains(*b))
            .copied()
    }
}

/// Status code returned by the switch.
///
/// Negative values are errors, zero and positive values are successes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const INVALID_PARAMETER: Status = Status(-2);
    pub const INVALID_MAGIC: Status = Status(-3);
    pub const INVALID_HANDLE: Status = Status(-4);
    pub const NO_MEMORY: Status = Status(-8);
    pub const NOT_IMPLEMENTED: Status = Status(-12);
    pub const NOT_SUPPORTED: Status = Status(-37);
    pub const INTERRUPTED: Status = Status(-39);
    pub const TIMEOUT: Status = Status(-40);
    pub const BUFFER_OVERFLOW: Status = Status(-41);
    pub const TRY_AGAIN: Status = Status(-52);
    pub const NOT_FOUND: Status = Status(-78);
    pub const INVALID_STATE: Status = Status(-79);
    pub const SEM_DESTROYED: Status = Status(-363);
    /// The network exists with a different trunk.
    pub const INCOMPATIBLE_TRUNK: Status = Status(-3602);
    /// The network exists with fixed policies that the flags contradict.
    pub const INCOMPATIBLE_FLAGS: Status = Status(-3603);

    pub fn is_success(&self) -> bool {
        self.0 >= 0
    }

    /// Turns the status into a `Result`, so that it can be used with `?`.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }

    fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Status::SUCCESS => "success",
            Status::INVALID_PARAMETER => "invalid parameter",
            Status::INVALID_MAGIC => "invalid magic",
            Status::INVALID_HANDLE => "invalid handle",
            Status::NO_MEMORY => "out of memory",
            Status::NOT_IMPLEMENTED => "not implemented",
            Status::NOT_SUPPORTED => "not supported",
            Status::INTERRUPTED => "interrupted",
            Status::TIMEOUT => "timeout",
            Status::BUFFER_OVERFLOW => "buffer overflow",
            Status::TRY_AGAIN => "try again",
            Status::NOT_FOUND => "not found",
            Status::INVALID_STATE => "invalid state",
            Status::SEM_DESTROYED => "wait aborted",
            Status::INCOMPATIBLE_TRUNK => "incompatible trunk",
            Status::INCOMPATIBLE_FLAGS => "incompatible flags",
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Status {}

/// Error while decoding a request buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("request is {actual} bytes, expected {expected}")]
    BadSize { expected: usize, actual: usize },
    #[error("header announces {0} bytes")]
    BadHeaderSize(u32),
    #[error("bad request magic {0:#x}")]
    BadMagic(u32),
    #[error("name isn't NUL-terminated UTF-8")]
    BadName,
    #[error("unknown trunk type {0}")]
    BadTrunkType(u32),
}

impl From<DecodeError> for Status {
    fn from(err: DecodeError) -> Status {
        match err {
            DecodeError::BadMagic(_) => Status::INVALID_MAGIC,
            _ => Status::INVALID_PARAMETER,
        }
    }
}

/// A request structure with a fixed binary layout.
///
/// Implementations only deal with the fields that follow the session identifier. The common
/// header is handled by the provided methods.
pub trait Request: Sized {
    /// Operation this request is meant for.
    const OPERATION: Operation;
    /// Total size of the encoded request, header included.
    const SIZE: usize;

    /// Session the request is issued on.
    fn session(&self) -> SessionId;

    /// Writes the fields of the request. `buf` is exactly `SIZE` bytes long and the header has
    /// already been written.
    fn write_fields(&self, buf: &mut [u8]);

    /// Reads back the fields of the request. `buf` is exactly `SIZE` bytes long and its header
    /// has already been checked.
    fn read_fields(session: SessionId, buf: &[u8]) -> Result<Self, DecodeError>;

    /// Encodes the request into a buffer of `SIZE` bytes.
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0..4], REQUEST_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], Self::SIZE as u32);
        LittleEndian::write_u64(&mut buf[8..16], self.session().0);
        self.write_fields(&mut buf);
        buf
    }

    /// Decodes a request buffer, checking its header.
    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        check_header(buf, Self::SIZE)?;
        let session = SessionId(LittleEndian::read_u64(&buf[8..16]));
        Self::read_fields(session, buf)
    }
}

/// Checks the common header of a request buffer of the given expected size.
pub fn check_header(buf: &[u8], expected: usize) -> Result<(), DecodeError> {
    if buf.len() != expected {
        return Err(DecodeError::BadSize {
            expected,
            actual: buf.len(),
        });
    }
    let magic = LittleEndian::read_u32(&buf[0..4]);
    if magic != REQUEST_MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let size = LittleEndian::read_u32(&buf[4..8]);
    if usize::try_from(size).map_or(true, |s| s != expected) {
        return Err(DecodeError::BadHeaderSize(size));
    }
    Ok(())
}

fn write_name(out: &mut [u8], name: &str) {
    // The last byte always stays NUL.
    let len = name.len().min(out.len() - 1);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
}

fn read_name(buf: &[u8]) -> Result<String, DecodeError> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(DecodeError::BadName)?;
    String::from_utf8(buf[..end].to_vec()).map_err(|_| DecodeError::BadName)
}

fn read_handle(buf: &[u8]) -> InterfaceHandle {
    InterfaceHandle(LittleEndian::read_u32(&buf[16..20]))
}

/// Creates or joins a network. On success, `handle` is filled by the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub session: SessionId,
    pub network: String,
    pub trunk: String,
    pub trunk_type: TrunkType,
    pub flags: OpenFlags,
    pub send_size: u32,
    pub recv_size: u32,
    /// Output.
    pub handle: InterfaceHandle,
}

impl Request for OpenRequest {
    const OPERATION: Operation = Operation::Open;
    const SIZE: usize = 232;

    fn session(&self) -> SessionId {
        self.session
    }

    fn write_fields(&self, buf: &mut [u8]) {
        write_name(&mut buf[16..144], &self.network);
        write_name(&mut buf[144..208], &self.trunk);
        LittleEndian::write_u32(&mut buf[208..212], self.trunk_type as u32);
        LittleEndian::write_u32(&mut buf[212..216], self.flags.bits());
        LittleEndian::write_u32(&mut buf[216..220], self.send_size);
        LittleEndian::write_u32(&mut buf[220..224], self.recv_size);
        LittleEndian::write_u32(&mut buf[224..228], self.handle.0);
    }

    fn read_fields(session: SessionId, buf: &[u8]) -> Result<Self, DecodeError> {
        let trunk_type = LittleEndian::read_u32(&buf[208..212]);
        Ok(OpenRequest {
            session,
            network: read_name(&buf[16..144])?,
            trunk: read_name(&buf[144..208])?,
            trunk_type: TrunkType::from_u32(trunk_type)
                .ok_or(DecodeError::BadTrunkType(trunk_type))?,
            flags: OpenFlags::from_bits_retain(LittleEndian::read_u32(&buf[212..216])),
            send_size: LittleEndian::read_u32(&buf[216..220]),
            recv_size: LittleEndian::read_u32(&buf[220..224]),
            handle: InterfaceHandle(LittleEndian::read_u32(&buf[224..228])),
        })
    }
}

/// Detaches an interface from its network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub session: SessionId,
    pub handle: InterfaceHandle,
}

impl Request for CloseRequest {
    const OPERATION: Operation = Operation::IfClose;
    const SIZE: usize = 24;

    fn session(&self) -> SessionId {
        self.session
    }

    fn write_fields(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[16..20], self.handle.0);
    }

    fn read_fields(session: SessionId, buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(CloseRequest {
            session,
            handle: read_handle(buf),
        })
    }
}

/// Asks where the shared buffer of an interface lives. Only meaningful in the direct mode,
/// where the switch and the client share an address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBufferPtrsRequest {
    pub session: SessionId,
    pub handle: InterfaceHandle,
    /// Output. Address of the buffer in the client's address space.
    pub client_address: u64,
    /// Output. Address of the buffer in the switch's address space.
    pub switch_address: u64,
}

impl Request for GetBufferPtrsRequest {
    const OPERATION: Operation = Operation::IfGetBufferPtrs;
    const SIZE: usize = 40;

    fn session(&self) -> SessionId {
        self.session
    }

    fn write_fields(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[16..20], self.handle.0);
        LittleEndian::write_u64(&mut buf[24..32], self.client_address);
        LittleEndian::write_u64(&mut buf[32..40], self.switch_address);
    }

    fn read_fields(session: SessionId, buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(GetBufferPtrsRequest {
            session,
            handle: read_handle(buf),
            client_address: LittleEndian::read_u64(&buf[24..32]),
            switch_address: LittleEndian::read_u64(&buf[32..40]),
        })
    }
}

/// Generates a request made of the interface handle followed by a boolean.
macro_rules! handle_and_bool {
    ($(#[$doc:meta])* $name:ident, $op:expr, $field:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub session: SessionId,
            pub handle: InterfaceHandle,
            pub $field: bool,
        }

        impl Request for $name {
            const OPERATION: Operation = $op;
            const SIZE: usize = 24;

            fn session(&self) -> SessionId {
                self.session
            }

            fn write_fields(&self, buf: &mut [u8]) {
                LittleEndian::write_u32(&mut buf[16..20], self.handle.0);
                buf[20] = u8::from(self.$field);
            }

            fn read_fields(session: SessionId, buf: &[u8]) -> Result<Self, DecodeError> {
                Ok($name {
                    session,
                    handle: read_handle(buf),
                    $field: buf[20] != 0,
                })
            }
        }
    };
}

handle_and_bool!(
    /// Enables or disables the reception of frames not addressed to the interface.
    SetPromiscuousRequest,
    Operation::IfSetPromiscuousMode,
    promiscuous
);

handle_and_bool!(
    /// Starts or stops the flow of frames to and from an interface.
    SetActiveRequest,
    Operation::IfSetActive,
    active
);

handle_and_bool!(
    /// Wakes up a thread blocked in an `IfWait` on the same interface.
    ///
    /// If `no_more_waits` is true, every subsequent wait fails immediately.
    AbortWaitRequest,
    Operation::IfAbortWait,
    no_more_waits
);

/// Tells the switch which MAC address the interface uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetMacAddressRequest {
    pub session: SessionId,
    pub handle: InterfaceHandle,
    pub mac: [u8; 6],
}

impl Request for SetMacAddressRequest {
    const OPERATION: Operation = Operation::IfSetMacAddress;
    const SIZE: usize = 32;

    fn session(&self) -> SessionId {
        self.session
    }

    fn write_fields(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[16..20], self.handle.0);
        buf[20..26].copy_from_slice(&self.mac);
    }

    fn read_fields(session: SessionId, buf: &[u8]) -> Result<Self, DecodeError> {
        let mut mac = [0; 6];
        mac.copy_from_slice(&buf[20..26]);
        Ok(SetMacAddressRequest {
            session,
            handle: read_handle(buf),
            mac,
        })
    }
}

/// Asks the switch to process the frames committed in the send ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub session: SessionId,
    pub handle: InterfaceHandle,
}

impl Request for SendRequest {
    const OPERATION: Operation = Operation::IfSend;
    const SIZE: usize = 24;

    fn session(&self) -> SessionId {
        self.session
    }

    fn write_fields(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[16..20], self.handle.0);
    }

    fn read_fields(session: SessionId, buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(SendRequest {
            session,
            handle: read_handle(buf),
        })
    }
}

/// Blocks until the receive ring isn't empty, the timeout expires, or the wait is aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitRequest {
    pub session: SessionId,
    pub handle: InterfaceHandle,
    /// [`INDEFINITE_WAIT`] to wait forever.
    pub timeout_ms: u32,
}

impl Request for WaitRequest {
    const OPERATION: Operation = Operation::IfWait;
    const SIZE: usize = 24;

    fn session(&self) -> SessionId {
        self.session
    }

    fn write_fields(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[16..20], self.handle.0);
        LittleEndian::write_u32(&mut buf[20..24], self.timeout_ms);
    }

    fn read_fields(session: SessionId, buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(WaitRequest {
            session,
            handle: read_handle(buf),
            timeout_ms: LittleEndian::read_u32(&buf[20..24]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_layout() {
        let req = OpenRequest {
            session: SessionId(0x1122_3344_5566_7788),
            network: "intnet".to_owned(),
            trunk: String::new(),
            trunk_type: TrunkType::WhateverNone,
            flags: OpenFlags::ACCESS_PUBLIC | OpenFlags::SHARED_MAC_ON_WIRE,
            send_size: DEFAULT_SEND_BUFFER_SIZE,
            recv_size: DEFAULT_RECV_BUFFER_SIZE,
            handle: InterfaceHandle::INVALID,
        };

        let buf = req.encode();
        assert_eq!(buf.len(), 232);
        assert_eq!(&buf[0..4], &[0x11, 0x02, 0x73, 0x19]);
        assert_eq!(&buf[4..8], &[232, 0, 0, 0]);
        assert_eq!(&buf[8..16], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[16..23], b"intnet\0");
        assert_eq!(buf[144], 0);
        assert_eq!(&buf[208..212], &[2, 0, 0, 0]);
        assert_eq!(&buf[212..216], &[1, 0, 0, 1]);
        assert_eq!(&buf[216..220], &[0, 0, 3, 0]);

        assert_eq!(OpenRequest::decode(&buf).unwrap(), req);
    }

    #[test]
    fn default_sizes() {
        assert_eq!(DEFAULT_SEND_BUFFER_SIZE, 196_608);
        assert_eq!(DEFAULT_RECV_BUFFER_SIZE, 325_632);
    }

    #[test]
    fn request_sizes_match_operations() {
        assert_eq!(Operation::IfClose.request_size(), CloseRequest::SIZE);
        assert_eq!(Operation::IfGetBufferPtrs.request_size(), 40);
        assert_eq!(Operation::IfSetMacAddress.request_size(), 32);
        for code in 1..=9 {
            let op = Operation::from_u32(code).unwrap();
            assert_eq!(op as u32, code);
            assert_eq!(op.request_size() % 8, 0);
        }
        assert!(Operation::from_u32(0).is_none());
        assert!(Operation::from_u32(10).is_none());
    }

    #[test]
    fn bad_header_rejected() {
        let req = WaitRequest {
            session: SessionId(1),
            handle: InterfaceHandle(5),
            timeout_ms: 30_000,
        };
        let mut buf = req.encode();
        assert_eq!(WaitRequest::decode(&buf[..16]), Err(DecodeError::BadSize { expected: 24, actual: 16 }));
        buf[0] = 0;
        assert!(matches!(WaitRequest::decode(&buf), Err(DecodeError::BadMagic(_))));
        assert_eq!(Status::from(DecodeError::BadMagic(0)), Status::INVALID_MAGIC);
    }

    #[test]
    fn long_names_stay_terminated() {
        let name: String = std::iter::repeat('x').take(300).collect();
        let req = OpenRequest {
            session: SessionId(1),
            network: name,
            trunk: String::new(),
            trunk_type: TrunkType::None,
            flags: OpenFlags::empty(),
            send_size: 0,
            recv_size: 0,
            handle: InterfaceHandle::INVALID,
        };
        let decoded = OpenRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded.network.len(), MAX_NETWORK_NAME - 1);
    }

    #[test]
    fn conflicting_flags() {
        assert!(OpenFlags::ACCESS_PUBLIC.conflict().is_none());
        let flags = OpenFlags::TRUNK_WIRE_ENABLED | OpenFlags::TRUNK_WIRE_DISABLED;
        assert_eq!(
            flags.conflict(),
            Some((OpenFlags::TRUNK_WIRE_ENABLED, OpenFlags::TRUNK_WIRE_DISABLED))
        );
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::TRY_AGAIN.to_string(), "try again (-52)");
        assert_eq!(Status(-9999).to_string(), "status -9999");
        assert!(Status(3).is_success());
        assert_eq!(Status::TIMEOUT.into_result(), Err(Status::TIMEOUT));
    }
}
