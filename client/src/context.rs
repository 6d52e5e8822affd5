//! Operation contexts: the consumer-facing handle binding one engine
//! command to its transport and data objects, and relaying inquiries to the
//! caller's passphrase capability.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cryptmux_common::error::{Error, Result};
use cryptmux_common::platform_io::{self, Direction};
use cryptmux_common::protocol::Response;

use crate::data::DataObject;
use crate::event::EventEngine;
use crate::fdtable::{CallbackStatus, FdTable, IoCallback, IoToken};
use crate::op::OperationHandle;
use crate::transport::Transport;

/// Caller-supplied secret source for engine inquiries.
///
/// `retry` is set when a previous answer for the same inquiry was already
/// relayed during this operation. Returning `Err(Error::Cancelled)` cancels
/// the inquiry and fails the operation.
pub trait PassphraseProvider: Send {
    fn passphrase(&mut self, hint: &str, description: &str, retry: bool) -> Result<String>;
}

type SharedProvider = Arc<Mutex<Box<dyn PassphraseProvider>>>;

/// One logical engine operation in flight.
///
/// The context registers the transport's inbound descriptor (and any
/// side-channel descriptors) in the shared table; the event engine then
/// drives the operation to its terminal state. Dropping the context
/// unregisters everything it registered and releases its data objects.
pub struct OperationContext {
    transport:     Arc<Mutex<Transport>>,
    table:         Arc<FdTable>,
    handle:        OperationHandle,
    tokens:        Vec<IoToken>,
    statuses:      Arc<Mutex<Vec<(String, String)>>>,
    response_sink: Option<Arc<Mutex<DataObject>>>,
    passphrase:    Option<SharedProvider>,
    bound:         Vec<Arc<Mutex<DataObject>>>,
    submitted:     bool,
}

impl OperationContext {
    pub fn new(transport: Transport, table: Arc<FdTable>) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            table,
            handle: OperationHandle::new(),
            tokens: Vec::new(),
            statuses: Arc::new(Mutex::new(Vec::new())),
            response_sink: None,
            passphrase: None,
            bound: Vec::new(),
            submitted: false,
        }
    }

    pub fn transport(&self) -> Arc<Mutex<Transport>> {
        self.transport.clone()
    }

    pub fn handle(&self) -> OperationHandle {
        self.handle.clone()
    }

    /// Status lines observed so far, in arrival order.
    pub fn statuses(&self) -> Vec<(String, String)> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn set_passphrase_provider(&mut self, provider: Box<dyn PassphraseProvider>) {
        self.passphrase = Some(Arc::new(Mutex::new(provider)));
    }

    /// Collect inline `D` payloads into the given data object.
    pub fn bind_response_sink(&mut self, data: DataObject) {
        self.response_sink = Some(Arc::new(Mutex::new(data)));
    }

    /// Reclaim the response sink once the operation is finished. `None`
    /// while a callback still holds it.
    pub fn take_response_sink(&mut self) -> Option<DataObject> {
        let arc = self.response_sink.take()?;
        match Arc::try_unwrap(arc) {
            Ok(mutex) => Some(mutex.into_inner().unwrap()),
            Err(arc) => {
                self.response_sink = Some(arc);
                None
            }
        }
    }

    /// Send the command line and register the status callback that consumes
    /// the engine's reply stream.
    pub fn submit(&mut self, command: &str) -> Result<()> {
        if self.submitted {
            return Err(Error::protocol("context already carries a command"));
        }
        let fd = {
            let mut transport = self.transport.lock().unwrap();
            transport.send_command(command)?;
            transport.inbound_fd().ok_or(Error::PeerClosed)?
        };

        let transport = self.transport.clone();
        let handle = self.handle.clone();
        let statuses = self.statuses.clone();
        let sink = self.response_sink.clone();
        let provider = self.passphrase.clone();
        let mut inquire_counts: HashMap<String, u32> = HashMap::new();

        let callback: IoCallback = Box::new(move |_, _| {
            let mut transport = transport.lock().unwrap();
            loop {
                match transport.try_recv_line()? {
                    None => return Ok(CallbackStatus::Again),
                    Some(Response::Status { keyword, args }) => {
                        tracing::debug!(%keyword, %args, "engine status");
                        statuses.lock().unwrap().push((keyword, args));
                    }
                    Some(Response::Data(bytes)) => match sink.as_ref() {
                        Some(sink) => write_all_data(&mut sink.lock().unwrap(), &bytes)?,
                        None => {
                            tracing::debug!(len = bytes.len(), "inline data without a sink, dropped")
                        }
                    },
                    Some(Response::Inquire { keyword, params }) => {
                        let count = inquire_counts.entry(keyword.clone()).or_insert(0);
                        let retry = *count > 0;
                        *count += 1;
                        relay_inquire(&mut transport, provider.as_ref(), &keyword, &params, retry)?;
                    }
                    Some(Response::Ok(_)) => {
                        handle.mark_done();
                        return Ok(CallbackStatus::Done);
                    }
                    Some(Response::Err { code, message }) => {
                        handle.mark_failed(Error::Engine { code, message });
                        return Ok(CallbackStatus::Done);
                    }
                    Some(Response::Comment(_)) => {}
                }
            }
        });

        let token = self
            .table
            .register(fd, Direction::Read, Some(self.handle.clone()), callback);
        self.tokens.push(token);
        self.submitted = true;
        Ok(())
    }

    /// Pump a data object into a side-channel descriptor. The descriptor is
    /// closed when the object reports end-of-stream, signalling end of
    /// input to the engine.
    pub fn attach_source(&mut self, data: DataObject, fd: OwnedFd) -> IoToken {
        let data = Arc::new(Mutex::new(data));
        self.bound.push(data.clone());
        let raw = fd.as_raw_fd();

        let mut pending: Vec<u8> = Vec::new();
        let mut offset = 0usize;
        let callback: IoCallback = Box::new(move |_, _| {
            if offset >= pending.len() {
                pending.clear();
                offset = 0;
                let mut chunk = [0u8; 4096];
                let n = data.lock().unwrap().read(&mut chunk)?;
                if n == 0 {
                    // Unregistration drops this closure and with it `fd`;
                    // the engine sees EOF on its input.
                    return Ok(CallbackStatus::Done);
                }
                pending.extend_from_slice(&chunk[..n]);
            }
            let n = platform_io::write_fd(fd.as_raw_fd(), &pending[offset..])?;
            offset += n;
            Ok(CallbackStatus::Again)
        });

        let token = self
            .table
            .register(raw, Direction::Write, Some(self.handle.clone()), callback);
        self.tokens.push(token);
        token
    }

    /// Pump a side-channel descriptor into a data object until EOF.
    pub fn attach_sink(&mut self, data: DataObject, fd: OwnedFd) -> IoToken {
        let data = Arc::new(Mutex::new(data));
        self.bound.push(data.clone());
        let raw = fd.as_raw_fd();

        let callback: IoCallback = Box::new(move |_, _| {
            let mut chunk = [0u8; 4096];
            let n = platform_io::read_fd(fd.as_raw_fd(), &mut chunk)?;
            if n == 0 {
                return Ok(CallbackStatus::Done);
            }
            write_all_data(&mut data.lock().unwrap(), &chunk[..n])?;
            Ok(CallbackStatus::Again)
        });

        let token = self
            .table
            .register(raw, Direction::Read, Some(self.handle.clone()), callback);
        self.tokens.push(token);
        token
    }

    /// Drive the shared engine until this operation reaches a terminal
    /// state, then surface its result.
    pub fn wait(&mut self, engine: &EventEngine, deadline: Option<Duration>) -> Result<()> {
        let handle = self.handle.clone();
        engine.run_until(deadline, || handle.is_terminal())?;
        match self.handle.take_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Cooperative cancellation: unregister this operation's descriptors,
    /// close the transport and mark the context terminal.
    pub fn cancel(&mut self) {
        let removed = self.table.unregister_owner(self.handle.id());
        self.tokens.clear();
        self.handle.mark_failed(Error::Cancelled);
        self.transport.lock().unwrap().close();
        tracing::info!(
            operation = %self.handle.id(),
            removed,
            "operation cancelled"
        );
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        self.table.unregister_owner(self.handle.id());
        for token in self.tokens.drain(..) {
            self.table.unregister(token);
        }
        // Bound data objects release through their own teardown.
    }
}

/// Push a whole buffer into a data object, honoring short writes.
fn write_all_data(data: &mut DataObject, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = data.write(buf)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "data object refused further bytes",
            )));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Answer an `INQUIRE` line through the caller's passphrase capability.
/// Anything the provider cannot answer is cancelled, which fails the
/// operation.
fn relay_inquire(
    transport: &mut Transport,
    provider: Option<&SharedProvider>,
    keyword: &str,
    params: &str,
    retry: bool,
) -> Result<()> {
    if keyword != "PASSPHRASE" {
        tracing::warn!(keyword, "inquiry with no registered handler, cancelling");
        transport.send_can()?;
        return Err(Error::Cancelled);
    }
    let Some(provider) = provider else {
        tracing::warn!("passphrase inquiry without a provider, cancelling");
        transport.send_can()?;
        return Err(Error::Cancelled);
    };

    let mut parts = params.splitn(2, ' ');
    let hint = parts.next().unwrap_or("");
    let description = parts.next().unwrap_or("");

    match provider.lock().unwrap().passphrase(hint, description, retry) {
        Ok(secret) => {
            transport.send_data(secret.as_bytes())?;
            transport.send_end()
        }
        Err(error) => {
            tracing::info!(hint, "passphrase provider declined the inquiry");
            transport.send_can()?;
            Err(error)
        }
    }
}
