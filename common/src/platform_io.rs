//! Platform I/O primitives: pipes, descriptor-level reads and writes, the
//! poll(2) wrapper used by the event engine, Unix-socket rendezvous, and
//! peer-process spawning.
//!
//! Everything here is the narrow capability surface the transport and data
//! layers consume; no protocol knowledge lives at this level.

use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
// cfg for unix except macos
#[cfg(all(unix, not(target_os = "macos")))]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials as PeerCredOpt};

use crate::error::{Error, Result};

/// Event direction a descriptor is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Readiness reported for one polled descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup:   bool,
    pub error:    bool,
    pub invalid:  bool,
}

impl Readiness {
    /// True if the descriptor should be dispatched for the given direction.
    /// Hangup and error conditions count as readiness so the callback gets to
    /// observe EOF instead of the engine spinning.
    pub fn is_ready(&self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.readable || self.hangup || self.error,
            Direction::Write => self.writable || self.hangup || self.error,
        }
    }
}

/// Poll the given descriptors for readiness on their registered direction.
///
/// Returns one [`Readiness`] per input slot, in input order. A `None` timeout
/// blocks indefinitely. EINTR restarts the wait with the remaining time.
pub fn poll_descriptors(
    slots: &[(RawFd, Direction)],
    timeout: Option<Duration>,
) -> Result<Vec<Readiness>> {
    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    loop {
        let mut fds: Vec<PollFd> = slots
            .iter()
            .map(|&(fd, direction)| {
                let flags = match direction {
                    Direction::Read => PollFlags::POLLIN,
                    Direction::Write => PollFlags::POLLOUT,
                };
                // SAFETY: the caller guarantees the descriptor stays open for
                // the duration of the call; the borrow does not outlive it.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                PollFd::new(borrowed, flags)
            })
            .collect();

        let poll_timeout = match deadline {
            None => PollTimeout::NONE,
            Some(d) => {
                let remaining = d.saturating_duration_since(std::time::Instant::now());
                PollTimeout::try_from(remaining)
                    .map_err(|_| Error::protocol("wait deadline out of range"))?
            }
        };

        match poll(&mut fds, poll_timeout) {
            Ok(0) => return Err(Error::Timeout),
            Ok(_) => {
                let readiness = fds
                    .iter()
                    .map(|pfd| {
                        let revents = pfd.revents().unwrap_or(PollFlags::empty());
                        Readiness {
                            readable: revents.contains(PollFlags::POLLIN),
                            writable: revents.contains(PollFlags::POLLOUT),
                            hangup:   revents.contains(PollFlags::POLLHUP),
                            error:    revents.contains(PollFlags::POLLERR),
                            invalid:  revents.contains(PollFlags::POLLNVAL),
                        }
                    })
                    .collect();
                return Ok(readiness);
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

/// Read from a raw descriptor. Returns the number of bytes transferred;
/// zero signals end-of-stream.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    // SAFETY: buf is a valid mutable slice and its length bounds the read.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(Error::Io(io::Error::last_os_error()))
    } else {
        Ok(n as usize)
    }
}

/// Write to a raw descriptor. Short writes are reported, not retried.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> Result<usize> {
    // SAFETY: buf is a valid slice and its length bounds the write.
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(Error::Io(io::Error::last_os_error()))
    } else {
        Ok(n as usize)
    }
}

/// Reposition a raw descriptor. The platform error (ESPIPE on pipes) is
/// surfaced untouched.
pub fn seek_fd(fd: RawFd, offset: i64, whence: libc::c_int) -> Result<u64> {
    // SAFETY: plain syscall on a caller-supplied descriptor.
    let pos = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
    if pos < 0 {
        Err(Error::Io(io::Error::last_os_error()))
    } else {
        Ok(pos as u64)
    }
}

/// Close a raw descriptor, ignoring errors. Used for descriptors whose
/// ownership was taken over from the caller.
pub fn close_fd(fd: RawFd) {
    // SAFETY: best-effort close of a descriptor we were handed ownership of.
    unsafe {
        libc::close(fd);
    }
}

/// Duplicate a descriptor into a new owned handle (e.g. to take a stable
/// copy of stdio for a pipe-mode channel).
pub fn dup_fd(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: dup either fails or returns a fresh descriptor that nothing
    // else owns yet.
    let duped = unsafe { libc::dup(fd) };
    if duped < 0 {
        Err(Error::Io(io::Error::last_os_error()))
    } else {
        // SAFETY: `duped` was just created and is owned by no one else.
        Ok(unsafe { OwnedFd::from_raw_fd(duped) })
    }
}

/// Switch a descriptor between blocking and non-blocking mode.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    // SAFETY: F_GETFL/F_SETFL on a valid descriptor; no pointers involved.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// A pipe with both ends ownership-tracked.
pub struct PipePair {
    pub read:  OwnedFd,
    pub write: OwnedFd,
}

/// Create a close-on-exec pipe.
pub fn create_pipe() -> Result<PipePair> {
    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    Ok(PipePair { read, write })
}

/// Credentials of the process on the other end of a Unix socket.
#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    pub pid: u32,
    pub uid: u32,
}

/// Extract peer credentials from a connected Unix socket.
pub fn peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    #[cfg(target_os = "linux")]
    {
        let creds = getsockopt(stream, PeerCredOpt)?;
        Ok(PeerCredentials {
            pid: creds.pid() as u32,
            uid: creds.uid(),
        })
    }

    #[cfg(target_os = "macos")]
    {
        use std::os::fd::AsRawFd;

        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;
        // SAFETY: getpeereid fills two stack variables through valid
        // pointers; the descriptor comes from a connected stream.
        let rc = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let mut pid: libc::pid_t = 0;
        let mut pid_len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
        // SAFETY: LOCAL_PEERPID writes a pid_t through a valid pointer whose
        // size matches pid_len.
        let rc = unsafe {
            libc::getsockopt(
                stream.as_raw_fd(),
                libc::SOL_LOCAL,
                libc::LOCAL_PEERPID,
                &mut pid as *mut _ as *mut libc::c_void,
                &mut pid_len,
            )
        };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(PeerCredentials {
            pid: pid as u32,
            uid,
        })
    }

    #[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
    {
        match getsockopt(stream, PeerCredOpt) {
            Ok(creds) => Ok(PeerCredentials {
                pid: creds.pid() as u32,
                uid: creds.uid(),
            }),
            Err(errno) => Err(errno.into()),
        }
    }
}

/// Bind a rendezvous socket at `path`, replacing a stale socket file and
/// restricting permissions to the owner.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    if let Ok(metadata) = std::fs::metadata(path) {
        if !metadata.file_type().is_socket() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a socket", path.display()),
            )));
        }
        tracing::warn!(path = %path.display(), "removing stale rendezvous socket");
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;

    // Owner read/write only; the engine conversation is private.
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(path = %path.display(), "failed to restrict socket permissions: {e}");
    }

    tracing::info!(path = %path.display(), "rendezvous socket bound");
    Ok(listener)
}

/// Connect to a rendezvous socket, with a diagnosis of the common failure
/// modes.
pub fn connect_socket(path: &Path) -> Result<UnixStream> {
    match UnixStream::connect(path) {
        Ok(stream) => {
            tracing::debug!(path = %path.display(), "connected to rendezvous socket");
            Ok(stream)
        }
        Err(e) => {
            let hint = match e.kind() {
                io::ErrorKind::NotFound => "no socket file; the engine may not be running",
                io::ErrorKind::ConnectionRefused => {
                    "socket file present but nothing is listening"
                }
                io::ErrorKind::PermissionDenied => "socket exists but is owned by another user",
                _ => "unexpected connect failure",
            };
            tracing::error!(path = %path.display(), "connect failed: {e} ({hint})");
            Err(Error::Io(e))
        }
    }
}

/// A spawned engine process with its stdio channel endpoints.
///
/// `from_engine` is the engine's stdout (our inbound side), `to_engine` its
/// stdin (our outbound side).
pub struct SpawnedEngine {
    pub child:       Child,
    pub from_engine: OwnedFd,
    pub to_engine:   OwnedFd,
}

/// Spawn the engine executable with its stdin/stdout wired into a duplex
/// pipe pair. Stderr is inherited so engine diagnostics stay visible.
pub fn spawn_engine(program: &Path, args: &[String]) -> Result<SpawnedEngine> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Io(io::Error::other("spawned engine has no stdin")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Io(io::Error::other("spawned engine has no stdout")))?;

    tracing::info!(
        program = %program.display(),
        pid = child.id(),
        "engine process spawned"
    );

    Ok(SpawnedEngine {
        child,
        from_engine: OwnedFd::from(stdout),
        to_engine: OwnedFd::from(stdin),
    })
}
