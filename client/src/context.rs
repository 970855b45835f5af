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

//! Interface attached to a network.

use crate::{
    config::{Backend, OpenConfig},
    error::Error,
    transport::{self, DirectTransport, ServiceTransport, Transport},
};
use intnet_core::{BufStats, GsoContext, IntNetBuf, Reservation, Ring, RingStats};
use intnet_interface::{
    ffi::{
        CloseRequest, OpenRequest, SendRequest, SetActiveRequest, SetMacAddressRequest,
        SetPromiscuousRequest,
    },
    InterfaceHandle, Operation, Status,
};
use std::{
    convert::TryFrom,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

/// Interface attached to a network.
///
/// Created with [`IntNetIf::open`]. The interface is closed when [`IntNetIf::destroy`] is called
/// or when the object is dropped.
///
/// All the methods take `&self`, but the receive side (waiting and reading frames) must only be
/// used by one thread at a time. Use an [`AbortHandle`] to interrupt that thread from elsewhere.
pub struct IntNetIf {
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) handle: InterfaceHandle,
    pub(crate) network: String,
    /// Buffer shared with the switch. Always dropped before the interface is closed.
    pub(crate) buf: Option<IntNetBuf>,
    /// Set when the packet pump must stop.
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) wait_timeout_ms: u32,
}

/// Outcome of a successful [`IntNetIf::wait`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    /// The receive ring probably contains something.
    Ready,
    TimedOut,
    /// The wait has been interrupted by [`AbortHandle::abort`].
    Interrupted,
}

impl IntNetIf {
    /// Reaches the switch and attaches a new interface to the configured network.
    ///
    /// On error, everything that has been acquired so far is released.
    pub fn open(config: &OpenConfig) -> Result<IntNetIf, Error> {
        config.validate()?;

        let transport: Arc<dyn Transport> = match &config.backend {
            Backend::Driver(driver) => Arc::new(DirectTransport::connect(driver.clone())?),
            Backend::Service(path) => Arc::new(ServiceTransport::connect(path)?),
            Backend::Auto { driver, service } => {
                if driver.is_driverless() {
                    log::debug!("driverless mode, using service at {}", service.display());
                    Arc::new(ServiceTransport::connect(service)?)
                } else {
                    Arc::new(DirectTransport::connect(driver.clone())?)
                }
            }
        };

        let open = OpenRequest {
            session: transport.session(),
            network: config.network.clone(),
            trunk: config.trunk.clone(),
            trunk_type: config.trunk_type,
            flags: config.flags,
            send_size: config.send_buffer_size,
            recv_size: config.recv_buffer_size,
            handle: InterfaceHandle::INVALID,
        };
        let (status, reply) = transport::request(&*transport, &open)?;
        if !status.is_success() {
            return Err(Error::Open {
                network: config.network.clone(),
                status,
            });
        }
        if !reply.handle.is_valid() {
            return Err(Error::Open {
                network: config.network.clone(),
                status: Status::INVALID_HANDLE,
            });
        }

        // From now on, dropping `context` closes the interface.
        let mut context = IntNetIf {
            transport: Some(transport),
            handle: reply.handle,
            network: config.network.clone(),
            buf: None,
            stop: Arc::new(AtomicBool::new(false)),
            wait_timeout_ms: config.wait_timeout_ms,
        };
        let buf = context.transport()?.map_buffer(reply.handle)?;
        context.buf = Some(buf);

        log::info!(
            "opened interface {:?} on network {:?}",
            context.handle,
            context.network
        );
        Ok(context)
    }

    /// Handle attributed by the switch, or [`InterfaceHandle::INVALID`] once destroyed.
    pub fn handle(&self) -> InterfaceHandle {
        self.handle
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Returns false once the interface has been destroyed.
    pub fn is_open(&self) -> bool {
        self.handle.is_valid()
    }

    /// Buffer shared with the switch.
    pub fn buffer(&self) -> Result<&IntNetBuf, Error> {
        self.buf.as_ref().ok_or(Error::Closed)
    }

    pub(crate) fn transport(&self) -> Result<&Arc<dyn Transport>, Error> {
        self.transport.as_ref().ok_or(Error::Closed)
    }

    /// Starts or stops the flow of frames.
    pub fn set_active(&self, active: bool) -> Result<(), Error> {
        let transport = self.transport()?;
        let (status, _) = transport::request(
            &**transport,
            &SetActiveRequest {
                session: transport.session(),
                handle: self.handle,
                active,
            },
        )?;
        Error::from_status(Operation::IfSetActive, status)?;
        log::debug!("interface {:?} active = {}", self.handle, active);
        Ok(())
    }

    /// Enables or disables the reception of frames addressed to other interfaces.
    pub fn set_promiscuous(&self, promiscuous: bool) -> Result<(), Error> {
        let transport = self.transport()?;
        let (status, _) = transport::request(
            &**transport,
            &SetPromiscuousRequest {
                session: transport.session(),
                handle: self.handle,
                promiscuous,
            },
        )?;
        Error::from_status(Operation::IfSetPromiscuousMode, status)
    }

    /// Tells the switch which MAC address this interface uses.
    pub fn set_mac_address(&self, mac: [u8; 6]) -> Result<(), Error> {
        let transport = self.transport()?;
        let (status, _) = transport::request(
            &**transport,
            &SetMacAddressRequest {
                session: transport.session(),
                handle: self.handle,
                mac,
            },
        )?;
        Error::from_status(Operation::IfSetMacAddress, status)
    }

    /// Asks the switch to process the content of the send ring.
    pub fn send(&self) -> Result<(), Error> {
        let transport = self.transport()?;
        let (status, _) = transport::request(
            &**transport,
            &SendRequest {
                session: transport.session(),
                handle: self.handle,
            },
        )?;
        Error::from_status(Operation::IfSend, status)
    }

    /// Blocks until frames are available in the receive ring, the timeout expires, or another
    /// thread aborts the wait.
    ///
    /// Returns [`Error::WaitAborted`] if waits have been permanently disallowed.
    pub fn wait(&self, timeout_ms: u32) -> Result<WaitStatus, Error> {
        let status = self.transport()?.wait(self.handle, timeout_ms)?;
        match status {
            Status::SUCCESS => Ok(WaitStatus::Ready),
            Status::TIMEOUT => Ok(WaitStatus::TimedOut),
            Status::INTERRUPTED => Ok(WaitStatus::Interrupted),
            Status::SEM_DESTROYED => Err(Error::WaitAborted),
            status => Err(Error::Status {
                operation: Operation::IfWait,
                status,
            }),
        }
    }

    /// Returns an object that can interrupt [`IntNetIf::wait`] and the packet pump from another
    /// thread.
    pub fn abort_handle(&self) -> AbortHandle {
        let transport: Weak<dyn Transport> = match &self.transport {
            Some(transport) => Arc::downgrade(transport),
            None => Weak::<DirectTransport>::new(),
        };
        AbortHandle {
            transport,
            handle: self.handle,
            stop: self.stop.clone(),
        }
    }

    /// Reserves space in the send ring for a frame of `len` bytes.
    ///
    /// Returns [`Error::TryAgain`] if the ring is full.
    pub fn alloc_frame(&self, len: usize) -> Result<OutputFrame<'_>, Error> {
        let mut ring = self.buffer()?.send();
        let reservation = ring.allocate_frame(frame_len(len)?)?;
        Ok(OutputFrame::new(ring, reservation))
    }

    /// Reserves space in the send ring for a GSO super-frame of `len` bytes.
    pub fn alloc_gso_frame(&self, context: &GsoContext, len: usize) -> Result<OutputFrame<'_>, Error> {
        let mut ring = self.buffer()?.send();
        let reservation = ring.allocate_gso_frame(context, frame_len(len)?)?;
        Ok(OutputFrame::new(ring, reservation))
    }

    /// Copies a frame in the send ring and asks the switch to send it.
    ///
    /// If the ring is full, asks the switch to drain it and tries once more.
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), Error> {
        self.with_retry(|ring| ring.write_frame(frame))
    }

    /// Same as [`IntNetIf::send_frame`], for a GSO super-frame.
    pub fn send_gso_frame(&self, context: &GsoContext, frame: &[u8]) -> Result<(), Error> {
        self.with_retry(|ring| ring.write_gso_frame(context, frame))
    }

    fn with_retry(
        &self,
        mut write: impl FnMut(&mut Ring) -> Result<(), intnet_core::RingError>,
    ) -> Result<(), Error> {
        let buf = self.buffer()?;
        match write(&mut buf.send()).map_err(Error::from) {
            Ok(()) => {}
            Err(Error::TryAgain) => {
                log::trace!("send ring full, flushing");
                self.send()?;
                write(&mut buf.send())?;
            }
            Err(err) => return Err(err),
        }
        self.send()
    }

    pub fn stats(&self) -> Result<BufStats, Error> {
        Ok(self.buffer()?.stats())
    }

    /// Counters of the send ring.
    pub fn send_stats(&self) -> Result<RingStats, Error> {
        Ok(self.buffer()?.send().stats())
    }

    /// Counters of the receive ring.
    pub fn recv_stats(&self) -> Result<RingStats, Error> {
        Ok(self.buffer()?.recv().stats())
    }

    /// Closes the interface and releases everything.
    ///
    /// Does nothing if the interface is already destroyed. Everything is released even if the
    /// switch reports an error, in which case that error is returned.
    pub fn destroy(&mut self) -> Result<(), Error> {
        let transport = match self.transport.take() {
            Some(t) => t,
            None => return Ok(()),
        };

        // The switch might free the buffer as soon as the interface is closed.
        self.buf = None;
        let handle = std::mem::replace(&mut self.handle, InterfaceHandle::INVALID);

        let (status, _) = transport::request(
            &*transport,
            &CloseRequest {
                session: transport.session(),
                handle,
            },
        )?;
        log::info!("closed interface {:?}: {}", handle, status);
        Error::from_status(Operation::IfClose, status)
    }
}

impl fmt::Debug for IntNetIf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IntNetIf")
            .field("handle", &self.handle)
            .field("network", &self.network)
            .field("transport", &self.transport)
            .finish()
    }
}

impl Drop for IntNetIf {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            log::warn!("error while closing interface: {}", err);
        }
    }
}

fn frame_len(len: usize) -> Result<u32, Error> {
    u32::try_from(len).map_err(|_| Error::FrameTooLarge(u32::max_value()))
}

/// Interrupts the receive side of an interface from another thread.
#[derive(Clone)]
pub struct AbortHandle {
    transport: Weak<dyn Transport>,
    handle: InterfaceHandle,
    stop: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Makes the current or next [`IntNetIf::wait`] return, and the packet pump stop after
    /// draining the receive ring.
    pub fn abort(&self) -> Result<(), Error> {
        self.stop.store(true, Ordering::Release);
        self.abort_wait(false)
    }

    /// Same as [`AbortHandle::abort`], but also makes every future wait fail with
    /// [`Error::WaitAborted`].
    pub fn abort_permanently(&self) -> Result<(), Error> {
        self.stop.store(true, Ordering::Release);
        self.abort_wait(true)
    }

    fn abort_wait(&self, no_more_waits: bool) -> Result<(), Error> {
        let transport = self.transport.upgrade().ok_or(Error::Closed)?;
        let status = transport.abort_wait(self.handle, no_more_waits)?;
        Error::from_status(Operation::IfAbortWait, status)
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("AbortHandle").field(&self.handle).finish()
    }
}

/// Frame being written in the send ring.
///
/// Nothing is visible to the switch until [`OutputFrame::commit`] is called. Dropping the frame
/// without committing it gives the space back.
pub struct OutputFrame<'a> {
    ring: Ring<'a>,
    reservation: Option<Reservation>,
}

impl<'a> OutputFrame<'a> {
    fn new(ring: Ring<'a>, reservation: Reservation) -> Self {
        OutputFrame {
            ring,
            reservation: Some(reservation),
        }
    }

    /// Number of bytes reserved.
    pub fn len(&self) -> usize {
        self.reservation.as_ref().map_or(0, |r| r.len() as usize)
    }

    /// Space where to write the frame.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        match &self.reservation {
            Some(r) => self.ring.payload_mut(r),
            None => &mut [],
        }
    }

    /// Makes the frame visible to the switch.
    pub fn commit(mut self) -> Result<(), Error> {
        match self.reservation.take() {
            Some(r) => Ok(self.ring.commit(r)?),
            None => Ok(()),
        }
    }

    /// Makes the first `used` bytes of the frame visible to the switch. The rest of the reserved
    /// space is given back.
    pub fn commit_partial(mut self, used: usize) -> Result<(), Error> {
        let used = frame_len(used)?;
        match self.reservation.take() {
            Some(r) => Ok(self.ring.commit_partial(r, used)?),
            None => Ok(()),
        }
    }
}

impl<'a> fmt::Debug for OutputFrame<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OutputFrame")
            .field("reservation", &self.reservation)
            .finish()
    }
}

impl<'a> Drop for OutputFrame<'a> {
    fn drop(&mut self) {
        if let Some(r) = self.reservation.take() {
            if let Err(err) = self.ring.abandon(r) {
                log::warn!("failed to abandon output frame: {}", err);
            }
        }
    }
}
