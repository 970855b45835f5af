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

//! Parameters of an interface.

use crate::error::Error;
use intnet_interface::{
    ffi::{
        DEFAULT_RECV_BUFFER_SIZE, DEFAULT_SEND_BUFFER_SIZE, MAX_GSO_SIZE, MAX_NETWORK_NAME,
        MAX_TRUNK_NAME, MIN_SEND_BUFFER_SIZE,
    },
    svc, OpenFlags, SupportDriver, TrunkType,
};
use std::{fmt, path::PathBuf, sync::Arc};

/// Default timeout of each wait performed by the packet pump, in milliseconds.
pub const DEFAULT_WAIT_TIMEOUT_MS: u32 = 30_000;

/// How to reach the switch.
#[derive(Clone)]
pub enum Backend {
    /// Call the support driver directly.
    Driver(Arc<dyn SupportDriver>),
    /// Connect to the service listening on the given path.
    Service(PathBuf),
    /// Use the driver, unless it reports that it can't host the switch, in which case connect
    /// to the service.
    Auto {
        driver: Arc<dyn SupportDriver>,
        service: PathBuf,
    },
}

impl Backend {
    /// Service with the default name.
    pub fn default_service() -> Backend {
        Backend::Service(svc::endpoint_path(svc::DEFAULT_SERVICE_NAME))
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Backend::Driver(_) => f.debug_tuple("Driver").finish(),
            Backend::Service(path) => f.debug_tuple("Service").field(path).finish(),
            Backend::Auto { service, .. } => {
                f.debug_struct("Auto").field("service", service).finish()
            }
        }
    }
}

/// Configuration passed to [`IntNetIf::open`](crate::IntNetIf::open).
#[derive(Debug, Clone)]
pub struct OpenConfig {
    pub backend: Backend,
    /// Name of the network to create or join.
    pub network: String,
    pub trunk_type: TrunkType,
    /// Name of the trunk. Must be empty if the trunk type doesn't need one.
    pub trunk: String,
    pub flags: OpenFlags,
    /// Requested size of the send ring, in bytes.
    pub send_buffer_size: u32,
    /// Requested size of the receive ring, in bytes.
    pub recv_buffer_size: u32,
    /// Timeout of each wait performed by the packet pump, in milliseconds. The pump checks
    /// whether it has been asked to stop whenever a wait times out.
    pub wait_timeout_ms: u32,
}

impl OpenConfig {
    /// Default configuration for joining `network`.
    pub fn new(backend: Backend, network: impl Into<String>) -> OpenConfig {
        OpenConfig {
            backend,
            network: network.into(),
            trunk_type: TrunkType::None,
            trunk: String::new(),
            flags: OpenFlags::empty(),
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }

    pub fn with_trunk(mut self, trunk_type: TrunkType, trunk: impl Into<String>) -> Self {
        self.trunk_type = trunk_type;
        self.trunk = trunk.into();
        self
    }

    pub fn with_flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_buffer_sizes(mut self, send: u32, recv: u32) -> Self {
        self.send_buffer_size = send;
        self.recv_buffer_size = recv;
        self
    }

    pub fn with_wait_timeout(mut self, timeout_ms: u32) -> Self {
        self.wait_timeout_ms = timeout_ms;
        self
    }

    /// Performs the checks that the switch would do, so that obviously invalid configurations
    /// are rejected without talking to it.
    pub fn validate(&self) -> Result<(), Error> {
        if self.network.is_empty() {
            return Err(Error::InvalidConfig("empty network name"));
        }
        if self.network.len() >= MAX_NETWORK_NAME || self.network.contains('\0') {
            return Err(Error::InvalidConfig("network name too long"));
        }
        if self.trunk.len() >= MAX_TRUNK_NAME || self.trunk.contains('\0') {
            return Err(Error::InvalidConfig("trunk name too long"));
        }

        match self.trunk_type {
            TrunkType::Invalid => return Err(Error::InvalidConfig("invalid trunk type")),
            ty if ty.needs_trunk_name() && self.trunk.is_empty() => {
                return Err(Error::InvalidConfig("trunk type requires a trunk name"))
            }
            ty if !ty.needs_trunk_name() && !self.trunk.is_empty() => {
                return Err(Error::InvalidConfig("trunk name given without a trunk"))
            }
            _ => {}
        }

        if self.send_buffer_size < MIN_SEND_BUFFER_SIZE {
            return Err(Error::InvalidConfig("send buffer too small"));
        }
        if self.recv_buffer_size == 0 {
            return Err(Error::InvalidConfig("empty receive buffer"));
        }
        if self.flags.conflict().is_some() {
            return Err(Error::InvalidConfig("contradictory open flags"));
        }

        if self.send_buffer_size < MAX_GSO_SIZE * 3 {
            log::warn!(
                "send buffer of {} bytes can't hold three maximum-size GSO frames",
                self.send_buffer_size
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OpenConfig {
        OpenConfig::new(Backend::default_service(), "intnet")
    }

    #[test]
    fn defaults() {
        let config = config();
        assert_eq!(config.recv_buffer_size, 318 * 1024);
        assert_eq!(config.send_buffer_size, 196_608);
        assert_eq!(config.trunk_type, TrunkType::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn names() {
        assert!(OpenConfig::new(Backend::default_service(), "").validate().is_err());
        let long = "x".repeat(MAX_NETWORK_NAME);
        assert!(OpenConfig::new(Backend::default_service(), long).validate().is_err());
        let fits = "x".repeat(MAX_NETWORK_NAME - 1);
        assert!(OpenConfig::new(Backend::default_service(), fits).validate().is_ok());
    }

    #[test]
    fn trunks() {
        assert!(config().with_trunk(TrunkType::NetFlt, "").validate().is_err());
        assert!(config().with_trunk(TrunkType::NetFlt, "eth0").validate().is_ok());
        assert!(config().with_trunk(TrunkType::None, "eth0").validate().is_err());
        assert!(config().with_trunk(TrunkType::Invalid, "").validate().is_err());
    }

    #[test]
    fn sizes_and_flags() {
        assert!(config().with_buffer_sizes(64, 4096).validate().is_err());
        assert!(config().with_buffer_sizes(4096, 4096).validate().is_ok());
        let flags = OpenFlags::IF_PROMISC_ALLOW | OpenFlags::IF_PROMISC_DENY;
        assert!(matches!(
            config().with_flags(flags).validate(),
            Err(Error::InvalidConfig(_))
        ));
    }
}
