//! The engine transport: a line-oriented command/response channel over a
//! spawned pipe pair or a rendezvous Unix socket, with the greeting
//! handshake, the protocol state machine, and one-shot channel enforcement.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process::Child;
use std::time::{Duration, Instant};

use cryptmux_common::config::EngineConfig;
use cryptmux_common::error::{Error, Result};
use cryptmux_common::platform_io::{self, Direction, PeerCredentials};
use cryptmux_common::protocol::{self, Request, Response, MAX_LINE_LEN};
use uuid::Uuid;

/// Default deadline for blocking receives.
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the initiator waits for the peer's greeting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Handshaking,
    Ready,
    Busy,
    Closing,
    Closed,
    Failed,
}

/// Whether the channel serves many command cycles or exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Duplex,
    OneShot,
}

/// Which side of the conversation this transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Identity of the process on the other end, for logging.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub description: String,
    pub credentials: Option<PeerCredentials>,
}

#[derive(Debug)]
enum Channel {
    Socket(UnixStream),
    Pipes { inbound: OwnedFd, outbound: OwnedFd },
}

impl Channel {
    fn inbound_fd(&self) -> RawFd {
        match self {
            Channel::Socket(stream) => stream.as_raw_fd(),
            Channel::Pipes { inbound, .. } => inbound.as_raw_fd(),
        }
    }

    fn outbound_fd(&self) -> RawFd {
        match self {
            Channel::Socket(stream) => stream.as_raw_fd(),
            Channel::Pipes { outbound, .. } => outbound.as_raw_fd(),
        }
    }
}

/// A command/response channel to one engine peer.
#[derive(Debug)]
pub struct Transport {
    id:       Uuid,
    role:     Role,
    mode:     ChannelMode,
    state:    TransportState,
    channel:  Option<Channel>,
    line_buf: Vec<u8>,
    peer:     PeerInfo,
    child:    Option<Child>,
    cycles:   u32,
}

impl Transport {
    /// Spawn the configured engine executable and handshake with it over its
    /// stdio pipe pair.
    pub fn spawn(config: &EngineConfig, mode: ChannelMode) -> Result<Self> {
        let spawned = platform_io::spawn_engine(&config.program, &config.args)?;
        let peer = PeerInfo {
            description: format!("{} (pid {})", config.program.display(), spawned.child.id()),
            credentials: None,
        };
        let mut transport = Self::base(
            Role::Initiator,
            mode,
            Channel::Pipes {
                inbound:  spawned.from_engine,
                outbound: spawned.to_engine,
            },
            peer,
        );
        transport.child = Some(spawned.child);
        transport.read_greeting()?;
        Ok(transport)
    }

    /// Connect to an already-running engine on its rendezvous socket.
    pub fn connect(path: &Path, mode: ChannelMode) -> Result<Self> {
        let stream = platform_io::connect_socket(path)?;
        Self::from_stream_inner(stream, Role::Initiator, mode, path.display().to_string())
    }

    /// Accept one peer on a rendezvous socket and greet it.
    pub fn accept(listener: &UnixListener, mode: ChannelMode) -> Result<Self> {
        let (stream, _addr) = listener.accept().map_err(Error::Io)?;
        Self::from_stream(stream, Role::Acceptor, mode)
    }

    /// Wrap an already-connected stream. Acceptors send the greeting,
    /// initiators wait for it.
    pub fn from_stream(stream: UnixStream, role: Role, mode: ChannelMode) -> Result<Self> {
        let description = match role {
            Role::Acceptor => "accepted peer".to_string(),
            Role::Initiator => "connected peer".to_string(),
        };
        Self::from_stream_inner(stream, role, mode, description)
    }

    fn from_stream_inner(
        stream: UnixStream,
        role: Role,
        mode: ChannelMode,
        description: String,
    ) -> Result<Self> {
        let credentials = platform_io::peer_credentials(&stream).ok();
        let peer = PeerInfo {
            description,
            credentials,
        };
        let mut transport = Self::base(role, mode, Channel::Socket(stream), peer);
        match role {
            Role::Acceptor => transport.send_greeting()?,
            Role::Initiator => transport.read_greeting()?,
        }
        Ok(transport)
    }

    /// Wrap a raw descriptor pair (e.g. an acceptor speaking on its own
    /// stdio).
    pub fn from_pipes(
        inbound: OwnedFd,
        outbound: OwnedFd,
        role: Role,
        mode: ChannelMode,
    ) -> Result<Self> {
        let peer = PeerInfo {
            description: "pipe peer".to_string(),
            credentials: None,
        };
        let mut transport = Self::base(role, mode, Channel::Pipes { inbound, outbound }, peer);
        match role {
            Role::Acceptor => transport.send_greeting()?,
            Role::Initiator => transport.read_greeting()?,
        }
        Ok(transport)
    }

    fn base(role: Role, mode: ChannelMode, channel: Channel, peer: PeerInfo) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(%id, ?role, ?mode, peer = %peer.description, "transport created");
        Self {
            id,
            role,
            mode,
            state: TransportState::Connecting,
            channel: Some(channel),
            line_buf: Vec::new(),
            peer,
            child: None,
            cycles: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Descriptor the peer's lines arrive on; used to register the status
    /// callback with the descriptor table.
    pub fn inbound_fd(&self) -> Option<RawFd> {
        self.channel.as_ref().map(Channel::inbound_fd)
    }

    // ----- handshake -----

    fn send_greeting(&mut self) -> Result<()> {
        self.state = TransportState::Handshaking;
        let greeting = format!("OK cryptmux {} ready", env!("CARGO_PKG_VERSION"));
        match self.write_line(&greeting) {
            Ok(()) => {
                self.state = TransportState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = TransportState::Failed;
                Err(e)
            }
        }
    }

    fn read_greeting(&mut self) -> Result<()> {
        self.state = TransportState::Handshaking;
        let outcome = loop {
            let line = match self.next_line(Some(HANDSHAKE_TIMEOUT)) {
                Ok(line) => line,
                Err(e) => break Err(e),
            };
            match protocol::parse_response(&line) {
                Ok(Response::Comment(_)) => continue,
                Ok(Response::Ok(text)) => {
                    tracing::debug!(id = %self.id, greeting = ?text, "peer greeting accepted");
                    break Ok(());
                }
                Ok(other) => {
                    break Err(Error::protocol(format!(
                        "expected a greeting, peer sent {other:?}"
                    )))
                }
                Err(e) => break Err(e),
            }
        };
        match outcome {
            Ok(()) => {
                self.state = TransportState::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "handshake failed");
                self.state = TransportState::Failed;
                Err(e)
            }
        }
    }

    // ----- initiator surface -----

    /// Send one command line. Valid only in `Ready`.
    pub fn send_command(&mut self, line: &str) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(Error::protocol("only the initiator sends commands"));
        }
        match self.state {
            TransportState::Ready => {}
            TransportState::Busy => {
                return Err(Error::protocol("a command is already in flight"));
            }
            TransportState::Closing | TransportState::Closed => {
                if self.mode == ChannelMode::OneShot && self.cycles > 0 {
                    return Err(Error::ChannelExhausted);
                }
                return Err(Error::protocol("transport is closed"));
            }
            TransportState::Failed => {
                return Err(Error::protocol("transport is in the failed state"));
            }
            TransportState::Connecting | TransportState::Handshaking => {
                return Err(Error::protocol("handshake is not complete"));
            }
        }
        protocol::check_command_line(line)?;
        tracing::debug!(
            id = %self.id,
            verb = line.split(' ').next().unwrap_or(""),
            "sending command"
        );
        self.write_line(line)?;
        self.state = TransportState::Busy;
        Ok(())
    }

    /// Receive the next protocol line, blocking up to the default deadline.
    pub fn recv_line(&mut self) -> Result<Response> {
        self.recv_line_deadline(Some(DEFAULT_IO_TIMEOUT))
    }

    /// Receive the next protocol line with an explicit deadline.
    pub fn recv_line_deadline(&mut self, deadline: Option<Duration>) -> Result<Response> {
        self.expect_busy("recv_line")?;
        loop {
            let line = self.next_line(deadline)?;
            match self.classify_response(&line)? {
                None => continue,
                Some(response) => return Ok(response),
            }
        }
    }

    /// Non-greedy receive for event callbacks: consumes only bytes that are
    /// already readable and yields `None` when no complete line is buffered.
    pub fn try_recv_line(&mut self) -> Result<Option<Response>> {
        self.expect_busy("try_recv_line")?;
        loop {
            if let Some(line) = self.buffered_line()? {
                match self.classify_response(&line)? {
                    None => continue,
                    Some(response) => return Ok(Some(response)),
                }
            }
            if !self.poll_readable_now()? {
                return Ok(None);
            }
            self.fill(Some(Duration::ZERO))?;
        }
    }

    fn classify_response(&mut self, line: &str) -> Result<Option<Response>> {
        match protocol::parse_response(line) {
            Err(e) => {
                self.state = TransportState::Failed;
                Err(e)
            }
            Ok(Response::Comment(text)) => {
                tracing::trace!(id = %self.id, text, "peer comment");
                Ok(None)
            }
            Ok(response) => {
                if response.is_terminal() {
                    self.finish_cycle();
                }
                Ok(Some(response))
            }
        }
    }

    fn finish_cycle(&mut self) {
        self.cycles += 1;
        match self.mode {
            ChannelMode::Duplex => self.state = TransportState::Ready,
            ChannelMode::OneShot => {
                tracing::debug!(id = %self.id, "one-shot cycle complete, tearing down");
                self.state = TransportState::Closing;
                self.shutdown();
            }
        }
    }

    /// Answer an inquiry with data chunks. Valid while a command is in
    /// flight.
    pub fn send_data(&mut self, payload: &[u8]) -> Result<()> {
        self.expect_busy("send_data")?;
        for line in protocol::data_lines(payload) {
            self.write_line(&line)?;
        }
        Ok(())
    }

    /// Terminate inquiry data.
    pub fn send_end(&mut self) -> Result<()> {
        self.expect_busy("send_end")?;
        self.write_line("END")
    }

    /// Cancel an inquiry.
    pub fn send_can(&mut self) -> Result<()> {
        self.expect_busy("send_can")?;
        self.write_line("CAN")
    }

    // ----- acceptor surface -----

    /// Receive the next request line, blocking up to the default deadline.
    /// Command lines move the acceptor to `Busy`; inquiry replies
    /// (`D`/`END`/`CAN`) are only valid while serving.
    pub fn recv_request(&mut self) -> Result<Request> {
        self.recv_request_deadline(Some(DEFAULT_IO_TIMEOUT))
    }

    pub fn recv_request_deadline(&mut self, deadline: Option<Duration>) -> Result<Request> {
        if self.role != Role::Acceptor {
            return Err(Error::protocol("only the acceptor receives requests"));
        }
        if !matches!(self.state, TransportState::Ready | TransportState::Busy) {
            return Err(Error::protocol("acceptor is not accepting requests"));
        }
        loop {
            let line = self.next_line(deadline)?;
            match protocol::parse_request(&line) {
                Err(e) => {
                    self.state = TransportState::Failed;
                    return Err(e);
                }
                Ok(Request::Comment(_)) => continue,
                Ok(request) => {
                    if matches!(request, Request::Command { .. }) {
                        if self.state != TransportState::Ready {
                            self.state = TransportState::Failed;
                            return Err(Error::protocol("command received while serving one"));
                        }
                        self.state = TransportState::Busy;
                    } else if self.state != TransportState::Busy {
                        self.state = TransportState::Failed;
                        return Err(Error::protocol("inquiry reply outside a command cycle"));
                    }
                    return Ok(request);
                }
            }
        }
    }

    /// Emit a status line while serving a command.
    pub fn send_status(&mut self, keyword: &str, args: &str) -> Result<()> {
        self.expect_busy("send_status")?;
        let line = if args.is_empty() {
            format!("S {keyword}")
        } else {
            format!("S {keyword} {args}")
        };
        self.write_line(&line)
    }

    /// Request data from the peer mid-command.
    pub fn send_inquire(&mut self, keyword: &str, params: &str) -> Result<()> {
        self.expect_busy("send_inquire")?;
        let line = if params.is_empty() {
            format!("INQUIRE {keyword}")
        } else {
            format!("INQUIRE {keyword} {params}")
        };
        self.write_line(&line)
    }

    /// Terminate the current cycle successfully.
    pub fn send_ok(&mut self, text: Option<&str>) -> Result<()> {
        self.expect_busy("send_ok")?;
        match text {
            None => self.write_line("OK")?,
            Some(text) => self.write_line(&format!("OK {text}"))?,
        }
        self.finish_cycle();
        Ok(())
    }

    /// Terminate the current cycle with an error.
    pub fn send_err(&mut self, code: u32, message: &str) -> Result<()> {
        self.expect_busy("send_err")?;
        self.write_line(&format!("ERR {code} {message}"))?;
        self.finish_cycle();
        Ok(())
    }

    // ----- teardown -----

    /// Close the channel. An idle initiator sends a best-effort `BYE`
    /// first; a spawned engine is waited for after its stdin closes.
    pub fn close(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        if self.role == Role::Initiator && self.state == TransportState::Ready {
            if let Some(fd) = self.channel.as_ref().map(Channel::outbound_fd) {
                let _ = platform_io::write_fd(fd, b"BYE\n");
            }
        }
        self.state = TransportState::Closing;
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.channel = None;
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => {
                    tracing::debug!(id = %self.id, %status, "engine process exited")
                }
                Err(e) => tracing::warn!(id = %self.id, "failed to reap engine process: {e}"),
            }
        }
        self.state = TransportState::Closed;
    }

    // ----- line buffer plumbing -----

    fn expect_busy(&self, what: &str) -> Result<()> {
        if self.state == TransportState::Busy {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "{what} is only valid with a command in flight (state {:?})",
                self.state
            )))
        }
    }

    /// Extract the next complete line from the buffer, enforcing the wire
    /// length limit.
    fn buffered_line(&mut self) -> Result<Option<String>> {
        if let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
            if pos + 1 > MAX_LINE_LEN {
                return self.fail_protocol("line exceeds the maximum length");
            }
            let mut line: Vec<u8> = self.line_buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(text) => Ok(Some(text)),
                Err(_) => self.fail_protocol("non-text bytes on the control channel"),
            }
        } else if self.line_buf.len() >= MAX_LINE_LEN {
            self.fail_protocol("unterminated line exceeds the maximum length")
        } else {
            Ok(None)
        }
    }

    fn fail_protocol<T>(&mut self, reason: &str) -> Result<T> {
        tracing::warn!(id = %self.id, reason, "protocol violation, failing transport");
        self.state = TransportState::Failed;
        Err(Error::protocol(reason))
    }

    /// Wait for readability and append one read's worth of bytes to the
    /// line buffer.
    fn fill(&mut self, timeout: Option<Duration>) -> Result<()> {
        let fd = match self.channel.as_ref() {
            Some(channel) => channel.inbound_fd(),
            None => return Err(Error::PeerClosed),
        };
        platform_io::poll_descriptors(&[(fd, Direction::Read)], timeout)?;
        let mut chunk = [0u8; 1024];
        let n = match platform_io::read_fd(fd, &mut chunk) {
            Ok(n) => n,
            Err(e) => {
                self.state = TransportState::Failed;
                return Err(e);
            }
        };
        if n == 0 {
            tracing::debug!(id = %self.id, peer = %self.peer.description, "peer hung up");
            self.state = TransportState::Failed;
            return Err(Error::PeerClosed);
        }
        self.line_buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn poll_readable_now(&self) -> Result<bool> {
        let fd = match self.channel.as_ref() {
            Some(channel) => channel.inbound_fd(),
            None => return Err(Error::PeerClosed),
        };
        match platform_io::poll_descriptors(&[(fd, Direction::Read)], Some(Duration::ZERO)) {
            Ok(ready) => Ok(ready[0].is_ready(Direction::Read)),
            Err(Error::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn next_line(&mut self, deadline: Option<Duration>) -> Result<String> {
        let deadline_at = deadline.map(|d| Instant::now() + d);
        loop {
            if let Some(line) = self.buffered_line()? {
                return Ok(line);
            }
            let remaining = match deadline_at {
                None => None,
                Some(at) => {
                    let left = at.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::Timeout);
                    }
                    Some(left)
                }
            };
            self.fill(remaining)?;
        }
    }

    /// Write one line plus terminator, retrying short writes.
    fn write_line(&mut self, line: &str) -> Result<()> {
        let fd = match self.channel.as_ref() {
            Some(channel) => channel.outbound_fd(),
            None => return Err(Error::PeerClosed),
        };
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        let mut written = 0;
        while written < bytes.len() {
            match platform_io::write_fd(fd, &bytes[written..]) {
                Ok(0) => {
                    self.state = TransportState::Failed;
                    return Err(Error::PeerClosed);
                }
                Ok(n) => written += n,
                Err(e) => {
                    self.state = TransportState::Failed;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
