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

// Implementation notes:
//
// Reading from the socket is blocking, so a background thread is dedicated to it. Replies are
// dispatched to the thread that sent the corresponding call through a oneshot channel. Receive
// notifications signal the `Event` on which `wait` blocks.
//
// When the connection is lost, the background thread drops all the pending senders, which makes
// the blocked callers return `Error::Deferred`, and signals the event so that a waiting thread
// notices.

use super::{request, Transport};
use crate::{
    error::Error,
    event::{Event, Wakeup},
};
use fnv::FnvHashMap;
use futures::{channel::oneshot, executor::block_on};
use intnet_core::{IntNetBuf, SharedRegion};
use intnet_interface::{
    ffi::{GetBufferPtrsRequest, WaitRequest},
    svc::{self, ClientMessage, ServiceMessage, SharedMemory},
    InterfaceHandle, Operation, Request as _, SessionId, Status,
};
use parking_lot::Mutex;
use std::{
    convert::TryFrom,
    fmt, fs, io,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// Transport that exchanges messages with a switch living in another process.
pub struct ServiceTransport {
    path: PathBuf,
    /// Writing half of the connection.
    writer: Mutex<UnixStream>,
    shared: Arc<Shared>,
    next_call_id: AtomicU64,
    reader: Option<thread::JoinHandle<()>>,
}

/// State shared with the background thread.
struct Shared {
    pending: Mutex<FnvHashMap<u64, oneshot::Sender<Reply>>>,
    receive_ready: Event,
    connected: AtomicBool,
}

struct Reply {
    rc: u64,
    reply: Vec<u8>,
    shared_memory: Option<SharedMemory>,
}

impl ServiceTransport {
    /// Connects to the service listening on `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<ServiceTransport, Error> {
        let path = path.as_ref().to_owned();
        let writer = UnixStream::connect(&path)?;
        let reader_stream = writer.try_clone()?;

        let shared = Arc::new(Shared {
            pending: Mutex::new(FnvHashMap::default()),
            receive_ready: Event::new(),
            connected: AtomicBool::new(true),
        });

        let reader = thread::Builder::new()
            .name("intnet-service-reader".to_string())
            .spawn({
                let shared = shared.clone();
                move || read_loop(reader_stream, shared)
            })?;

        log::debug!("connected to switch service at {}", path.display());
        Ok(ServiceTransport {
            path,
            writer: Mutex::new(writer),
            shared,
            next_call_id: AtomicU64::new(1),
            reader: Some(reader),
        })
    }

    /// Connects to the service with the given name, see [`svc::endpoint_path`].
    pub fn connect_named(name: &str) -> Result<ServiceTransport, Error> {
        ServiceTransport::connect(svc::endpoint_path(name))
    }

    /// Returns false if the connection has been lost.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn send(&self, message: &ClientMessage) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::Deferred);
        }
        let mut writer = self.writer.lock();
        if let Err(err) = svc::write_message(&mut *writer, message) {
            log::warn!("lost connection to switch service: {}", err);
            self.shared.connected.store(false, Ordering::Release);
            return Err(Error::Deferred);
        }
        Ok(())
    }

    fn call_raw(&self, operation: Operation, request: &mut [u8]) -> Result<(Status, Option<SharedMemory>), Error> {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let message = ClientMessage::Call {
            id,
            operation: operation as u32,
            request: request.to_vec(),
        };
        if let Err(err) = self.send(&message) {
            self.shared.pending.lock().remove(&id);
            return Err(err);
        }

        // The sender is dropped if the connection is lost.
        let reply = block_on(rx).map_err(|_| Error::Deferred)?;

        let status = match svc::decode_rc(reply.rc) {
            Some(status) => status,
            None => {
                log::warn!("reply to {:?} without a valid status", operation);
                return Ok((Status::INVALID_STATE, None));
            }
        };

        if reply.reply.len() != request.len() {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "reply to {:?} is {} bytes, expected {}",
                    operation,
                    reply.reply.len(),
                    request.len()
                ),
            )));
        }
        request.copy_from_slice(&reply.reply);
        Ok((status, reply.shared_memory))
    }
}

impl Transport for ServiceTransport {
    fn session(&self) -> SessionId {
        // The service attributes sessions per connection.
        SessionId(0)
    }

    fn call(&self, operation: Operation, request: &mut [u8]) -> Result<Status, Error> {
        self.call_raw(operation, request).map(|(status, _)| status)
    }

    fn map_buffer(&self, handle: InterfaceHandle) -> Result<IntNetBuf, Error> {
        let mut buf = GetBufferPtrsRequest {
            session: self.session(),
            handle,
            client_address: 0,
            switch_address: 0,
        }
        .encode();
        let (status, shared_memory) = self.call_raw(Operation::IfGetBufferPtrs, &mut buf)?;
        Error::from_status(Operation::IfGetBufferPtrs, status)?;

        let shared_memory = shared_memory.ok_or_else(|| {
            Error::Mapping(io::Error::new(
                io::ErrorKind::NotFound,
                "no shared memory in reply",
            ))
        })?;
        let size = usize::try_from(shared_memory.size).map_err(|_| {
            Error::Mapping(io::Error::new(io::ErrorKind::InvalidData, "mapping too large"))
        })?;

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&shared_memory.path)
            .map_err(Error::Mapping)?;
        let region = SharedRegion::map(&file, size).map_err(Error::Mapping)?;
        log::debug!("mapped {} ({} bytes)", shared_memory.path, size);
        Ok(IntNetBuf::attach(region)?)
    }

    fn wait(&self, handle: InterfaceHandle, timeout_ms: u32) -> Result<Status, Error> {
        let request = WaitRequest {
            session: self.session(),
            handle,
            timeout_ms,
        }
        .encode();
        self.send(&ClientMessage::Notify {
            operation: Operation::IfWait as u32,
            request,
        })?;

        let timeout = if timeout_ms == intnet_interface::ffi::INDEFINITE_WAIT {
            None
        } else {
            Some(Duration::from_millis(u64::from(timeout_ms)))
        };

        match self.shared.receive_ready.wait(timeout) {
            Wakeup::Signaled if !self.is_connected() => Err(Error::Deferred),
            Wakeup::Signaled => Ok(Status::SUCCESS),
            Wakeup::Interrupted => Ok(Status::INTERRUPTED),
            Wakeup::Closed => Ok(Status::SEM_DESTROYED),
            Wakeup::TimedOut => Ok(Status::TIMEOUT),
        }
    }

    fn abort_wait(&self, handle: InterfaceHandle, no_more_waits: bool) -> Result<Status, Error> {
        // The service is told first, as the waiting thread might close the interface as soon as
        // the local event wakes it up. An interface already closed by the service has no wait
        // left to abort there.
        let abort = intnet_interface::ffi::AbortWaitRequest {
            session: self.session(),
            handle,
            no_more_waits,
        };
        let result = match request(self, &abort) {
            Ok((status, _)) if status == Status::INVALID_HANDLE => Ok(Status::SUCCESS),
            Ok((status, _)) => Ok(status),
            Err(Error::Deferred) => Ok(Status::SUCCESS),
            Err(err) => Err(err),
        };

        if no_more_waits {
            self.shared.receive_ready.close();
        } else {
            self.shared.receive_ready.interrupt();
        }

        result
    }
}

impl fmt::Debug for ServiceTransport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServiceTransport")
            .field("path", &self.path)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for ServiceTransport {
    fn drop(&mut self) {
        // Unblocks the background thread.
        let _ = self.writer.lock().shutdown(std::net::Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::warn!("switch service reader thread panicked");
            }
        }
    }
}

fn read_loop(mut stream: UnixStream, shared: Arc<Shared>) {
    loop {
        match svc::read_message::<_, ServiceMessage>(&mut stream) {
            Ok(ServiceMessage::Reply {
                id,
                rc,
                reply,
                shared_memory,
            }) => {
                let sender = shared.pending.lock().remove(&id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(Reply {
                            rc,
                            reply,
                            shared_memory,
                        });
                    }
                    None => log::warn!("reply to unknown call {}", id),
                }
            }
            Ok(ServiceMessage::ReceiveReady) => {
                log::trace!("receive ready");
                shared.receive_ready.signal();
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    log::debug!("switch service closed the connection");
                } else {
                    log::debug!("switch service connection error: {}", err);
                }
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::Release);
    shared.pending.lock().clear();
    shared.receive_ready.signal();
}
