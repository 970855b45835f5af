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

//! Unix socket front-end of a [`LoopbackSwitch`].

// Implementation notes:
//
// Accepting connections and reading from them are blocking operations, so a background thread
// is dedicated to the listener and one to each connection. Each connection gets its own session,
// closed along with all its interfaces when the connection ends.
//
// Waits never block the thread of a connection. A `Notify(IfWait)` only arms a flag. The port
// calls its listener after every delivery, and the listener sends `ReceiveReady` if the flag is
// armed. The receive ring is checked again after arming, so that a frame delivered just before
// isn't missed.

use crate::{
    port::Listener,
    switch::{LoopbackSwitch, Origin},
};
use fnv::FnvHashMap;
use intnet_interface::{
    ffi::{CloseRequest, GetBufferPtrsRequest, WaitRequest},
    svc::{self, ClientMessage, ServiceMessage, SharedMemory},
    InterfaceHandle, Operation, Request as _, SessionId, Status, SupportDriver as _,
};
use parking_lot::Mutex;
use std::{
    fs,
    io::{self, BufReader},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

/// Serves a switch on a Unix socket. Stops serving when dropped.
pub struct ServiceHost {
    path: PathBuf,
    shutting_down: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<ConnectionThread>>>,
    acceptor: Option<thread::JoinHandle<()>>,
}

struct ConnectionThread {
    /// Clone of the stream, used to interrupt the thread.
    stream: UnixStream,
    thread: thread::JoinHandle<()>,
}

impl ServiceHost {
    /// Starts listening on `path`, replacing any stale socket.
    ///
    /// The switch must have been created with [`LoopbackSwitch::with_shared_files`].
    pub fn bind(switch: Arc<LoopbackSwitch>, path: impl Into<PathBuf>) -> io::Result<ServiceHost> {
        let path = path.into();
        if !switch.has_shared_files() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "the buffers of the switch can't be shared with other processes",
            ));
        }

        match fs::remove_file(&path) {
            Ok(()) => log::debug!("removed stale socket {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(&path)?;

        let shutting_down = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let acceptor = thread::Builder::new()
            .name("intnet-loopback-accept".to_string())
            .spawn({
                let shutting_down = shutting_down.clone();
                let connections = connections.clone();
                move || accept_loop(listener, switch, shutting_down, connections)
            })?;

        log::info!("switch service listening on {}", path.display());
        Ok(ServiceHost {
            path,
            shutting_down,
            connections,
            acceptor: Some(acceptor),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting connections and closes the existing ones. Idempotent.
    pub fn shutdown(&mut self) {
        let acceptor = match self.acceptor.take() {
            Some(acceptor) => acceptor,
            None => return,
        };

        self.shutting_down.store(true, Ordering::Release);
        // The accept loop only notices the flag when a connection arrives.
        let _ = UnixStream::connect(&self.path);
        if acceptor.join().is_err() {
            log::error!("accept thread panicked");
        }

        let connections: Vec<_> = self.connections.lock().drain(..).collect();
        for connection in connections {
            let _ = connection.stream.shutdown(std::net::Shutdown::Both);
            if connection.thread.join().is_err() {
                log::error!("connection thread panicked");
            }
        }

        let _ = fs::remove_file(&self.path);
        log::info!("switch service on {} stopped", self.path.display());
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: UnixListener,
    switch: Arc<LoopbackSwitch>,
    shutting_down: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<ConnectionThread>>>,
) {
    for stream in listener.incoming() {
        if shutting_down.load(Ordering::Acquire) {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("failed to accept connection: {}", err);
                continue;
            }
        };
        let interrupt = match stream.try_clone() {
            Ok(s) => s,
            Err(err) => {
                log::warn!("failed to clone connection: {}", err);
                continue;
            }
        };

        let spawned = thread::Builder::new()
            .name("intnet-loopback-conn".to_string())
            .spawn({
                let switch = switch.clone();
                move || serve_connection(stream, switch)
            });
        match spawned {
            Ok(thread) => connections.lock().push(ConnectionThread {
                stream: interrupt,
                thread,
            }),
            Err(err) => log::warn!("failed to spawn connection thread: {}", err),
        }
    }
}

fn serve_connection(stream: UnixStream, switch: Arc<LoopbackSwitch>) {
    let session = match switch.open_session() {
        Ok(session) => session,
        Err(status) => {
            log::warn!("failed to open a session: {}", status);
            return;
        }
    };
    let writer = match stream.try_clone() {
        Ok(writer) => Arc::new(Mutex::new(writer)),
        Err(err) => {
            log::warn!("failed to clone connection: {}", err);
            switch.close_session(session);
            return;
        }
    };

    log::debug!("client connected, attributed {:?}", session);
    let mut connection = Connection {
        switch,
        session,
        writer,
        armed: FnvHashMap::default(),
    };

    let mut reader = BufReader::new(stream);
    loop {
        let message = match svc::read_message::<_, ClientMessage>(&mut reader) {
            Ok(message) => message,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                log::debug!("dropping connection of {:?}: {}", session, err);
                break;
            }
        };
        if let Err(err) = connection.handle(message) {
            log::debug!("failed to reply to {:?}: {}", session, err);
            break;
        }
    }

    log::debug!("client of {:?} disconnected", session);
    connection.switch.close_session(session);
}

/// State of a connection.
struct Connection {
    switch: Arc<LoopbackSwitch>,
    session: SessionId,
    writer: Arc<Mutex<UnixStream>>,
    /// For each interface, true if the client waits for a `ReceiveReady`.
    armed: FnvHashMap<InterfaceHandle, Arc<Mutex<bool>>>,
}

impl Connection {
    fn handle(&mut self, message: ClientMessage) -> io::Result<()> {
        match message {
            ClientMessage::Call {
                id,
                operation,
                mut request,
            } => {
                let (status, shared_memory) = self.call(operation, &mut request);
                self.send(&ServiceMessage::Reply {
                    id,
                    rc: svc::encode_rc(status),
                    reply: request,
                    shared_memory,
                })
            }
            ClientMessage::Notify { operation, request } => {
                if operation == Operation::IfWait as u32 {
                    self.arm(&request)
                } else {
                    log::debug!("ignoring notification for operation {}", operation);
                    Ok(())
                }
            }
        }
    }

    fn call(&mut self, operation: u32, request: &mut [u8]) -> (Status, Option<SharedMemory>) {
        let operation = match Operation::from_u32(operation) {
            Some(Operation::IfWait) => {
                // Would block this connection until it returns.
                return (Status::NOT_SUPPORTED, None);
            }
            Some(op) => op,
            None => return (Status::NOT_IMPLEMENTED, None),
        };

        let status = self
            .switch
            .dispatch(self.session, operation, request, Origin::Service);
        if !status.is_success() {
            return (status, None);
        }

        match operation {
            Operation::IfGetBufferPtrs => {
                let handle = match GetBufferPtrsRequest::decode(request) {
                    Ok(req) => req.handle,
                    Err(err) => return (Status::from(err), None),
                };
                match self.switch.shared_memory(self.session, handle) {
                    Ok(shared_memory) => (status, Some(shared_memory)),
                    Err(status) => (status, None),
                }
            }
            Operation::IfClose => {
                if let Ok(req) = CloseRequest::decode(request) {
                    self.armed.remove(&req.handle);
                }
                (status, None)
            }
            _ => (status, None),
        }
    }

    /// Arms the `ReceiveReady` notification of an interface.
    fn arm(&mut self, request: &[u8]) -> io::Result<()> {
        let handle = match WaitRequest::decode(request) {
            Ok(req) => req.handle,
            Err(err) => {
                log::debug!("malformed wait notification: {}", err);
                return Ok(());
            }
        };
        let port = match self.switch.port(self.session, handle) {
            Ok(port) => port,
            Err(status) => {
                log::debug!("wait notification for {:?}: {}", handle, status);
                return Ok(());
            }
        };
        if port.waits_refused() {
            return Ok(());
        }

        let writer = &self.writer;
        let armed = self
            .armed
            .entry(handle)
            .or_insert_with(|| {
                let armed = Arc::new(Mutex::new(false));
                port.set_listener(Some(listener(armed.clone(), writer.clone())));
                armed
            })
            .clone();

        *armed.lock() = true;
        if !port.buf().recv().is_empty() && disarm(&armed) {
            self.send(&ServiceMessage::ReceiveReady)?;
        }
        Ok(())
    }

    fn send(&self, message: &ServiceMessage) -> io::Result<()> {
        svc::write_message(&mut *self.writer.lock(), message)
    }
}

/// Returns true if the flag was armed.
fn disarm(armed: &Mutex<bool>) -> bool {
    std::mem::replace(&mut *armed.lock(), false)
}

fn listener(armed: Arc<Mutex<bool>>, writer: Arc<Mutex<UnixStream>>) -> Listener {
    Arc::new(move || {
        if disarm(&armed) {
            if let Err(err) = svc::write_message(&mut *writer.lock(), &ServiceMessage::ReceiveReady) {
                log::trace!("failed to notify client: {}", err);
            }
        }
    })
}
