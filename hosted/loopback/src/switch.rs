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

use crate::port::{Outgoing, Port, Storage};
use fnv::{FnvHashMap, FnvHashSet};
use intnet_interface::{
    ffi::{
        AbortWaitRequest, CloseRequest, GetBufferPtrsRequest, OpenRequest, SendRequest,
        SetActiveRequest, SetMacAddressRequest, SetPromiscuousRequest, WaitRequest,
        DEFAULT_RECV_BUFFER_SIZE, DEFAULT_SEND_BUFFER_SIZE, INDEFINITE_WAIT, MIN_SEND_BUFFER_SIZE,
    },
    svc::SharedMemory,
    InterfaceHandle, OpenFlags, Operation, Request, SessionId, Status, SupportDriver, TrunkType,
};
use parking_lot::Mutex;
use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Switch hosting any number of networks.
///
/// Networks are created when the first interface joins them, and destroyed when the last one
/// leaves.
pub struct LoopbackSwitch {
    state: Mutex<State>,
    storage: Storage,
    driverless: bool,
    next_session: AtomicU64,
}

/// Who a request comes from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Origin {
    /// The session in the request must match the session of the caller.
    Driver,
    /// The session is attributed to the connection, and the one in the request is ignored.
    Service,
}

#[derive(Debug, Default)]
struct State {
    sessions: FnvHashSet<SessionId>,
    networks: FnvHashMap<String, Network>,
    ports: FnvHashMap<InterfaceHandle, Arc<Port>>,
    next_handle: u32,
}

#[derive(Debug)]
struct Network {
    trunk_type: TrunkType,
    trunk: String,
    flags: OpenFlags,
    ports: Vec<InterfaceHandle>,
}

impl LoopbackSwitch {
    /// Switch whose interface buffers are allocated on the heap. Only usable from the same
    /// process.
    pub fn new() -> LoopbackSwitch {
        LoopbackSwitch::with_storage(Storage::Heap)
    }

    /// Switch whose interface buffers are files created in `dir`, which other processes can
    /// map.
    pub fn with_shared_files(dir: impl Into<PathBuf>) -> LoopbackSwitch {
        LoopbackSwitch::with_storage(Storage::Files(dir.into()))
    }

    fn with_storage(storage: Storage) -> LoopbackSwitch {
        LoopbackSwitch {
            state: Mutex::new(State {
                next_handle: 1,
                ..State::default()
            }),
            storage,
            driverless: false,
            next_session: AtomicU64::new(1),
        }
    }

    /// Makes [`SupportDriver::is_driverless`] return `driverless`.
    pub fn driverless(mut self, driverless: bool) -> Self {
        self.driverless = driverless;
        self
    }

    /// Returns true if the buffers of the interfaces can be mapped by other processes.
    pub fn has_shared_files(&self) -> bool {
        matches!(self.storage, Storage::Files(_))
    }

    /// Number of interfaces currently attached to `network`.
    pub fn interface_count(&self, network: &str) -> usize {
        self.state
            .lock()
            .networks
            .get(network)
            .map_or(0, |n| n.ports.len())
    }

    /// Number of networks that currently exist.
    pub fn network_count(&self) -> usize {
        self.state.lock().networks.len()
    }

    /// MAC address most recently set on an interface.
    pub fn mac_address(&self, handle: InterfaceHandle) -> Option<[u8; 6]> {
        self.state.lock().ports.get(&handle).map(|p| p.mac())
    }

    /// Whether an interface is in promiscuous mode.
    pub fn is_promiscuous(&self, handle: InterfaceHandle) -> Option<bool> {
        self.state.lock().ports.get(&handle).map(|p| p.is_promiscuous())
    }

    /// Looks up an interface opened on `session`.
    pub(crate) fn port(&self, session: SessionId, handle: InterfaceHandle) -> Result<Arc<Port>, Status> {
        match self.state.lock().ports.get(&handle) {
            Some(port) if port.session() == session => Ok(port.clone()),
            _ => Err(Status::INVALID_HANDLE),
        }
    }

    /// Shared memory object to map in order to access the buffer of an interface.
    pub(crate) fn shared_memory(&self, session: SessionId, handle: InterfaceHandle) -> Result<SharedMemory, Status> {
        let port = self.port(session, handle)?;
        let path = port.file().ok_or(Status::NOT_SUPPORTED)?;
        Ok(SharedMemory {
            path: path.to_string_lossy().into_owned(),
            size: port.buf().size() as u64,
        })
    }

    /// Performs an operation on behalf of `session`.
    pub(crate) fn dispatch(
        &self,
        session: SessionId,
        operation: Operation,
        request: &mut [u8],
        origin: Origin,
    ) -> Status {
        if !self.state.lock().sessions.contains(&session) {
            return Status::INVALID_PARAMETER;
        }

        log::trace!("{:?} on {:?}", operation, session);
        match operation {
            Operation::Open => serve(request, session, origin, |req: &mut OpenRequest| {
                self.open(session, req)
            }),
            Operation::IfClose => serve(request, session, origin, |req: &mut CloseRequest| {
                self.close(session, req.handle)
            }),
            Operation::IfGetBufferPtrs => {
                serve(request, session, origin, |req: &mut GetBufferPtrsRequest| {
                    let port = self.port(session, req.handle)?;
                    let address = port.buf().region().as_ptr() as usize as u64;
                    req.client_address = address;
                    req.switch_address = address;
                    Ok(Status::SUCCESS)
                })
            }
            Operation::IfSetPromiscuousMode => {
                serve(request, session, origin, |req: &mut SetPromiscuousRequest| {
                    let port = self.port(session, req.handle)?;
                    if port.set_promiscuous(req.promiscuous) != req.promiscuous {
                        log::debug!("promiscuous mode denied to {:?}", req.handle);
                    }
                    Ok(Status::SUCCESS)
                })
            }
            Operation::IfSetMacAddress => {
                serve(request, session, origin, |req: &mut SetMacAddressRequest| {
                    self.port(session, req.handle)?.set_mac(req.mac);
                    Ok(Status::SUCCESS)
                })
            }
            Operation::IfSetActive => serve(request, session, origin, |req: &mut SetActiveRequest| {
                let port = self.port(session, req.handle)?;
                port.set_active(req.active);
                log::debug!("{:?} is now {}", req.handle, if req.active { "active" } else { "inactive" });
                Ok(Status::SUCCESS)
            }),
            Operation::IfSend => serve(request, session, origin, |req: &mut SendRequest| {
                let port = self.port(session, req.handle)?;
                self.forward(&port)
            }),
            Operation::IfWait => serve(request, session, origin, |req: &mut WaitRequest| {
                // The port is cloned out of the state so that the lock isn't held while waiting.
                let port = self.port(session, req.handle)?;
                let timeout = if req.timeout_ms == INDEFINITE_WAIT {
                    None
                } else {
                    Some(Duration::from_millis(u64::from(req.timeout_ms)))
                };
                Ok(port.wait(timeout))
            }),
            Operation::IfAbortWait => serve(request, session, origin, |req: &mut AbortWaitRequest| {
                self.port(session, req.handle)?.abort_wait(req.no_more_waits);
                Ok(Status::SUCCESS)
            }),
        }
    }

    fn open(&self, session: SessionId, req: &mut OpenRequest) -> Result<Status, Status> {
        req.handle = InterfaceHandle::INVALID;

        if req.network.is_empty() {
            return Err(Status::INVALID_PARAMETER);
        }
        match req.trunk_type {
            TrunkType::Invalid => return Err(Status::INVALID_PARAMETER),
            ty if ty.needs_trunk_name() == req.trunk.is_empty() => {
                return Err(Status::INVALID_PARAMETER)
            }
            _ => {}
        }
        if let Some((a, b)) = req.flags.conflict() {
            log::debug!("open with contradictory flags {:?} and {:?}", a, b);
            return Err(Status::INVALID_PARAMETER);
        }

        let send_size = match req.send_size {
            0 => DEFAULT_SEND_BUFFER_SIZE,
            n if n < MIN_SEND_BUFFER_SIZE => return Err(Status::INVALID_PARAMETER),
            n => n,
        };
        let recv_size = match req.recv_size {
            0 => DEFAULT_RECV_BUFFER_SIZE,
            n => n,
        };

        let mut state = self.state.lock();

        if let Some(network) = state.networks.get(&req.network) {
            network.check_join(req)?;
        }

        let handle = state.allocate_handle();
        let port = Port::new(
            handle,
            session,
            req.network.clone(),
            req.flags,
            recv_size,
            send_size,
            &self.storage,
        )?;

        let network = state.networks.entry(req.network.clone()).or_insert_with(|| {
            log::debug!("creating network {:?}", req.network);
            Network {
                trunk_type: match req.trunk_type {
                    TrunkType::WhateverNone => TrunkType::None,
                    ty => ty,
                },
                trunk: req.trunk.clone(),
                flags: req.flags,
                ports: Vec::new(),
            }
        });
        network.ports.push(handle);
        state.ports.insert(handle, Arc::new(port));

        log::info!("{:?} joined network {:?}", handle, req.network);
        req.handle = handle;
        Ok(Status::SUCCESS)
    }

    fn close(&self, session: SessionId, handle: InterfaceHandle) -> Result<Status, Status> {
        let port = {
            let mut state = self.state.lock();
            match state.ports.get(&handle) {
                Some(port) if port.session() == session => {}
                _ => return Err(Status::INVALID_HANDLE),
            }
            state.remove_port(handle)
        };

        if let Some(port) = port {
            port.close();
            log::info!("{:?} left network {:?}", handle, port.network());
        }
        Ok(Status::SUCCESS)
    }

    /// Forwards everything in the send ring of `port` to the other active ports of its network.
    fn forward(&self, port: &Port) -> Result<Status, Status> {
        let peers: Vec<Arc<Port>> = {
            let state = self.state.lock();
            match state.networks.get(port.network()) {
                Some(network) => network
                    .ports
                    .iter()
                    .filter(|h| **h != port.handle())
                    .filter_map(|h| state.ports.get(h).cloned())
                    .collect(),
                None => Vec::new(),
            }
        };

        let result = port.drain_send(|outgoing| {
            for peer in &peers {
                match outgoing {
                    Outgoing::Frame(frame) => peer.deliver(|ring| ring.write_frame(frame)),
                    Outgoing::Gso(context, frame) => {
                        peer.deliver(|ring| ring.write_gso_frame(&context, frame))
                    }
                };
            }
        });

        match result {
            Ok(count) => {
                log::trace!("{:?} forwarded {} frames to {} peers", port.handle(), count, peers.len());
                Ok(Status::SUCCESS)
            }
            Err(err) => {
                log::warn!("send ring of {:?} is corrupted: {}", port.handle(), err);
                port.buf().record_bad_frame();
                Err(Status::INVALID_STATE)
            }
        }
    }

    /// Closes all the interfaces of a session.
    fn close_session_ports(&self, session: SessionId) {
        let ports: Vec<Arc<Port>> = {
            let mut state = self.state.lock();
            let handles: Vec<InterfaceHandle> = state
                .ports
                .values()
                .filter(|p| p.session() == session)
                .map(|p| p.handle())
                .collect();
            handles
                .into_iter()
                .filter_map(|h| state.remove_port(h))
                .collect()
        };

        for port in ports {
            log::debug!("closing {:?} along with its session", port.handle());
            port.close();
        }
    }
}

impl Default for LoopbackSwitch {
    fn default() -> Self {
        LoopbackSwitch::new()
    }
}

impl State {
    fn allocate_handle(&mut self) -> InterfaceHandle {
        loop {
            let handle = InterfaceHandle(self.next_handle);
            self.next_handle = self.next_handle.wrapping_add(1);
            if handle.is_valid() && !self.ports.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// Removes a port, and its network if it was the last port.
    fn remove_port(&mut self, handle: InterfaceHandle) -> Option<Arc<Port>> {
        let port = self.ports.remove(&handle)?;
        let now_empty = match self.networks.get_mut(port.network()) {
            Some(network) => {
                network.ports.retain(|h| *h != handle);
                network.ports.is_empty()
            }
            None => false,
        };
        if now_empty {
            log::debug!("destroying network {:?}", port.network());
            self.networks.remove(port.network());
        }
        Some(port)
    }
}

impl Network {
    /// Checks whether an interface opened with `req` can join this network.
    fn check_join(&self, req: &OpenRequest) -> Result<(), Status> {
        let trunk_ok = match req.trunk_type {
            TrunkType::WhateverNone => true,
            ty => ty == self.trunk_type && req.trunk == self.trunk,
        };
        if !trunk_ok {
            log::debug!(
                "trunk {:?} {:?} incompatible with network {:?}",
                req.trunk_type,
                req.trunk,
                req.network
            );
            return Err(Status::INCOMPATIBLE_TRUNK);
        }

        let access = OpenFlags::ACCESS_PUBLIC;
        if self.flags.contains(OpenFlags::ACCESS_FIXED)
            && (self.flags & access) != (req.flags & access)
        {
            return Err(Status::INCOMPATIBLE_FLAGS);
        }

        let requirements = OpenFlags::REQUIRE_EXACT | OpenFlags::REQUIRE_AS_RESTRICTIVE_POLICIES;
        if req.flags.contains(OpenFlags::REQUIRE_EXACT)
            && (self.flags - requirements) != (req.flags - requirements)
        {
            return Err(Status::INCOMPATIBLE_FLAGS);
        }

        Ok(())
    }
}

impl fmt::Debug for LoopbackSwitch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackSwitch")
            .field("storage", &self.storage)
            .field("networks", &state.networks.len())
            .field("interfaces", &state.ports.len())
            .finish()
    }
}

// SAFETY: The address returned by `IfGetBufferPtrs` is the start of the buffer of the port,
// initialized by `IntNetBuf::init`. The port is only dropped after `IfClose` or after its
// session is closed.
unsafe impl SupportDriver for LoopbackSwitch {
    fn open_session(&self) -> Result<SessionId, Status> {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.state.lock().sessions.insert(session);
        log::debug!("opened {:?}", session);
        Ok(session)
    }

    fn close_session(&self, session: SessionId) {
        if self.state.lock().sessions.remove(&session) {
            self.close_session_ports(session);
            log::debug!("closed {:?}", session);
        }
    }

    fn is_driverless(&self) -> bool {
        self.driverless
    }

    fn load_switch(&self, session: SessionId) -> Result<(), Status> {
        if self.state.lock().sessions.contains(&session) {
            Ok(())
        } else {
            Err(Status::INVALID_PARAMETER)
        }
    }

    fn call(&self, session: SessionId, operation: Operation, request: &mut [u8]) -> Status {
        self.dispatch(session, operation, request, Origin::Driver)
    }
}

/// Decodes a request, passes it to `handler`, then writes the request back with its output
/// fields.
fn serve<R: Request>(
    buf: &mut [u8],
    session: SessionId,
    origin: Origin,
    handler: impl FnOnce(&mut R) -> Result<Status, Status>,
) -> Status {
    let mut req = match R::decode(buf) {
        Ok(req) => req,
        Err(err) => {
            log::debug!("malformed {:?} request: {}", R::OPERATION, err);
            return Status::from(err);
        }
    };
    if origin == Origin::Driver && req.session() != session {
        return Status::INVALID_PARAMETER;
    }

    let status = handler(&mut req).unwrap_or_else(|status| status);
    buf.copy_from_slice(&req.encode());
    status
}
