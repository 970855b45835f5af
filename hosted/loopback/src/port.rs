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

//! Switch side of an interface.

use intnet_core::{
    buf,
    gso::GSO_CONTEXT_SIZE,
    GsoContext, IntNetBuf, Ring, RingEntry, RingError, SharedRegion,
};
use intnet_interface::{InterfaceHandle, OpenFlags, SessionId, Status};
use parking_lot::{Condvar, Mutex};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Callback invoked after a frame has been delivered to a port.
pub(crate) type Listener = Arc<dyn Fn() + Send + Sync>;

/// Where the buffers of the ports are allocated.
#[derive(Debug, Clone)]
pub(crate) enum Storage {
    Heap,
    /// One file per port, in the given directory.
    Files(PathBuf),
}

/// Entry read from the send ring of a port, to forward to the other ports.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Outgoing<'a> {
    Frame(&'a [u8]),
    /// GSO super-frame, already validated.
    Gso(GsoContext, &'a [u8]),
}

pub(crate) struct Port {
    handle: InterfaceHandle,
    session: SessionId,
    network: String,
    flags: OpenFlags,
    buf: IntNetBuf,
    /// File backing `buf`. Removed when the port is dropped.
    file: Option<PathBuf>,
    active: AtomicBool,
    promiscuous: AtomicBool,
    mac: Mutex<[u8; 6]>,
    /// Held while reading the send ring, as a ring only supports one reader.
    send_reader: Mutex<()>,
    /// Held while writing the receive ring, as a ring only supports one writer.
    recv_writer: Mutex<()>,
    bell: Mutex<Bell>,
    bell_cond: Condvar,
    listener: Mutex<Option<Listener>>,
}

/// State of the event that `IfWait` blocks on.
#[derive(Debug, Default)]
struct Bell {
    /// A frame has been delivered since the last successful wait.
    rung: bool,
    /// The next wait returns `INTERRUPTED`.
    interrupted: bool,
    /// Every wait returns `SEM_DESTROYED`.
    no_more_waits: bool,
    closed: bool,
}

impl Port {
    /// Allocates and initializes the buffer of a new port.
    pub(crate) fn new(
        handle: InterfaceHandle,
        session: SessionId,
        network: String,
        flags: OpenFlags,
        recv_size: u32,
        send_size: u32,
        storage: &Storage,
    ) -> Result<Port, Status> {
        let recv_size = buf::ring_size(recv_size).ok_or(Status::INVALID_PARAMETER)?;
        let send_size = buf::ring_size(send_size).ok_or(Status::INVALID_PARAMETER)?;
        let len = buf::required_size(recv_size, send_size);

        let (region, file) = match storage {
            Storage::Heap => (SharedRegion::zeroed(len), None),
            Storage::Files(dir) => {
                let path = dir.join(format!("intnet-{:016x}.buf", rand::random::<u64>()));
                match map_file(&path, len) {
                    Ok(region) => (region, Some(path)),
                    Err(err) => {
                        log::warn!("failed to create {}: {}", path.display(), err);
                        if err.kind() != io::ErrorKind::AlreadyExists {
                            let _ = fs::remove_file(&path);
                        }
                        return Err(Status::NO_MEMORY);
                    }
                }
            }
        };

        let buf = match IntNetBuf::init(region, recv_size, send_size) {
            Ok(buf) => buf,
            Err(err) => {
                log::warn!("failed to initialize buffer of {:?}: {}", handle, err);
                if let Some(path) = &file {
                    let _ = fs::remove_file(path);
                }
                return Err(Status::NO_MEMORY);
            }
        };

        Ok(Port {
            handle,
            session,
            network,
            flags,
            buf,
            file,
            active: AtomicBool::new(false),
            promiscuous: AtomicBool::new(false),
            mac: Mutex::new([0; 6]),
            send_reader: Mutex::new(()),
            recv_writer: Mutex::new(()),
            bell: Mutex::new(Bell::default()),
            bell_cond: Condvar::new(),
            listener: Mutex::new(None),
        })
    }

    pub(crate) fn handle(&self) -> InterfaceHandle {
        self.handle
    }

    pub(crate) fn session(&self) -> SessionId {
        self.session
    }

    pub(crate) fn network(&self) -> &str {
        &self.network
    }

    pub(crate) fn buf(&self) -> &IntNetBuf {
        &self.buf
    }

    /// File containing the buffer, if it is file-backed.
    pub(crate) fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub(crate) fn is_promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::Relaxed)
    }

    /// Updates the promiscuous mode. Returns the mode actually in effect, which stays off if
    /// the interface was opened with `IF_PROMISC_DENY`.
    pub(crate) fn set_promiscuous(&self, promiscuous: bool) -> bool {
        let effective = promiscuous && !self.flags.contains(OpenFlags::IF_PROMISC_DENY);
        self.promiscuous.store(effective, Ordering::Relaxed);
        effective
    }

    pub(crate) fn mac(&self) -> [u8; 6] {
        *self.mac.lock()
    }

    pub(crate) fn set_mac(&self, mac: [u8; 6]) {
        *self.mac.lock() = mac;
    }

    pub(crate) fn set_listener(&self, listener: Option<Listener>) {
        *self.listener.lock() = listener;
    }

    /// Reads every entry of the send ring and passes the ones to forward to `forward`.
    ///
    /// The entries of an inactive port are consumed but not forwarded. Invalid entries are
    /// counted as bad frames.
    pub(crate) fn drain_send(&self, mut forward: impl FnMut(Outgoing<'_>)) -> Result<usize, RingError> {
        let _reader = self.send_reader.lock();
        let active = self.is_active();
        let mut ring = self.buf.send();
        let mut forwarded = 0;

        loop {
            match ring.peek()? {
                None => return Ok(forwarded),
                Some(RingEntry::Frame(frame)) => {
                    if active {
                        forward(Outgoing::Frame(frame));
                        forwarded += 1;
                    }
                }
                Some(RingEntry::Gso { context, frame }) => {
                    match context.validate(GSO_CONTEXT_SIZE + frame.len(), frame.len()) {
                        Ok(_) if active => {
                            forward(Outgoing::Gso(context, frame));
                            forwarded += 1;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            log::debug!("{:?} sent an invalid GSO frame: {}", self.handle, err);
                            self.buf.record_bad_frame();
                        }
                    }
                }
                Some(RingEntry::Padding(_)) => {}
                Some(RingEntry::Other { kind, .. }) => {
                    log::debug!("{:?} sent an entry of type {:#x}", self.handle, kind);
                    self.buf.record_bad_frame();
                }
            }

            ring.skip()?;
        }
    }

    /// Writes an entry in the receive ring with `write`, then wakes up the client.
    ///
    /// Returns false if the port is inactive or the entry couldn't be written, in which case
    /// the frame is counted as lost.
    pub(crate) fn deliver(&self, write: impl FnOnce(&mut Ring<'_>) -> Result<(), RingError>) -> bool {
        if !self.is_active() {
            log::trace!("dropping frame for inactive {:?}", self.handle);
            self.buf.record_lost_frame();
            return false;
        }

        let result = {
            let _writer = self.recv_writer.lock();
            let mut ring = self.buf.recv();
            write(&mut ring)
        };

        match result {
            Ok(()) => {
                self.ring_bell();
                true
            }
            Err(err) => {
                log::trace!("dropping frame for {:?}: {}", self.handle, err);
                self.buf.record_lost_frame();
                false
            }
        }
    }

    fn ring_bell(&self) {
        self.bell.lock().rung = true;
        self.bell_cond.notify_all();

        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    /// Blocks until the receive ring isn't empty, the wait is aborted or the timeout expires.
    ///
    /// An abort issued while nobody is waiting applies to the next wait.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Status {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut bell = self.bell.lock();

        loop {
            if bell.closed || bell.no_more_waits {
                return Status::SEM_DESTROYED;
            }
            if bell.interrupted {
                bell.interrupted = false;
                return Status::INTERRUPTED;
            }
            if bell.rung || !self.buf.recv().is_empty() {
                bell.rung = false;
                return Status::SUCCESS;
            }

            match deadline {
                None => self.bell_cond.wait(&mut bell),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Status::TIMEOUT;
                    }
                    self.bell_cond.wait_until(&mut bell, deadline);
                }
            }
        }
    }

    /// Wakes up the thread blocked in `wait`, if any.
    pub(crate) fn abort_wait(&self, no_more_waits: bool) {
        {
            let mut bell = self.bell.lock();
            if no_more_waits {
                bell.no_more_waits = true;
            } else {
                bell.interrupted = true;
            }
        }
        self.bell_cond.notify_all();
    }

    /// Returns true if waiting is no longer allowed.
    pub(crate) fn waits_refused(&self) -> bool {
        let bell = self.bell.lock();
        bell.closed || bell.no_more_waits
    }

    /// Marks the port as closed. Pending and future waits fail.
    pub(crate) fn close(&self) {
        self.set_active(false);
        self.bell.lock().closed = true;
        self.bell_cond.notify_all();
        self.set_listener(None);
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Port")
            .field("handle", &self.handle)
            .field("session", &self.session)
            .field("network", &self.network)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if let Some(path) = &self.file {
            if let Err(err) = fs::remove_file(path) {
                log::debug!("failed to remove {}: {}", path.display(), err);
            }
        }
    }
}

fn map_file(path: &Path, len: usize) -> io::Result<SharedRegion> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(len as u64)?;
    SharedRegion::map(&file, len)
}
