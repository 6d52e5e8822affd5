//! Data objects: one uniform byte-stream interface over pluggable backends.
//!
//! A backend is a tagged variant carrying only the storage it owns; callers
//! pick one through a factory constructor and from then on use the same
//! read/write/seek/release surface regardless of what is underneath.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use cryptmux_common::error::{Error, Result};
use cryptmux_common::platform_io;

/// Wire representation requested for this object's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Raw,
    Armored,
}

/// Capability set for a caller-supplied backend. Unimplemented capabilities
/// keep the default bodies and report `Unsupported`.
pub trait DataCallbacks: Send {
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::Unsupported)
    }

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(Error::Unsupported)
    }

    /// Called exactly once when the object is released.
    fn release(&mut self) {}
}

enum Backend {
    /// Growable in-memory buffer with one logical position.
    Memory(Cursor<Vec<u8>>),
    /// An owned open file (from a handle or a path).
    File(File),
    /// A raw descriptor; `owned` decides who closes it.
    Fd { fd: RawFd, owned: bool },
    /// Caller-supplied callback set.
    Custom(Box<dyn DataCallbacks>),
}

/// A byte source/sink for engine payloads (plaintext, ciphertext, status
/// side data).
///
/// Ownership of the backing storage is fixed at creation: owned storage is
/// cleaned up on release, borrowed storage (a non-owned descriptor, or bytes
/// copied out of a caller slice) stays the caller's responsibility. Release
/// happens at most once; any operation after it fails with `Unsupported`.
pub struct DataObject {
    backend:   Option<Backend>,
    encoding:  Encoding,
    file_name: Option<String>,
}

impl DataObject {
    /// Empty writable memory object, the usual sink for engine output.
    pub fn empty() -> Self {
        Self::with_backend(Backend::Memory(Cursor::new(Vec::new())))
    }

    /// Memory object taking ownership of `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::with_backend(Backend::Memory(Cursor::new(bytes)))
    }

    /// Memory object initialized with a copy of the caller's slice; the
    /// caller keeps its buffer.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes.to_vec())
    }

    /// Wrap an open file handle, taking ownership of it.
    pub fn from_file(file: File) -> Self {
        Self::with_backend(Backend::File(file))
    }

    /// Open the file at `path` for reading.
    pub fn open_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut data = Self::from_file(file);
        data.file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(data)
    }

    /// Wrap a raw descriptor. With `owned` the descriptor is closed on
    /// release; otherwise the caller keeps responsibility for it.
    pub fn from_raw_fd(fd: RawFd, owned: bool) -> Self {
        Self::with_backend(Backend::Fd { fd, owned })
    }

    /// Wrap a caller-supplied callback set.
    pub fn from_callbacks(callbacks: Box<dyn DataCallbacks>) -> Self {
        Self::with_backend(Backend::Custom(callbacks))
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend:   Some(backend),
            encoding:  Encoding::default(),
            file_name: None,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn set_file_name(&mut self, name: impl Into<String>) {
        self.file_name = Some(name.into());
    }

    /// Read up to `buf.len()` bytes. Returns the number transferred; zero
    /// signals end-of-stream. Short reads are not errors.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.backend.as_mut() {
            None => Err(Error::Unsupported),
            Some(Backend::Memory(cursor)) => Ok(cursor.read(buf)?),
            Some(Backend::File(file)) => Ok(file.read(buf)?),
            Some(Backend::Fd { fd, .. }) => platform_io::read_fd(*fd, buf),
            Some(Backend::Custom(callbacks)) => callbacks.read(buf),
        }
    }

    /// Write up to `buf.len()` bytes. Returns the number transferred; short
    /// writes are not errors.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.backend.as_mut() {
            None => Err(Error::Unsupported),
            Some(Backend::Memory(cursor)) => Ok(cursor.write(buf)?),
            Some(Backend::File(file)) => Ok(file.write(buf)?),
            Some(Backend::Fd { fd, .. }) => platform_io::write_fd(*fd, buf),
            Some(Backend::Custom(callbacks)) => callbacks.write(buf),
        }
    }

    /// Reposition the object. Backends without the capability report
    /// `Unsupported`; a forward-only descriptor surfaces the platform error
    /// the attempt raises.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match self.backend.as_mut() {
            None => Err(Error::Unsupported),
            Some(Backend::Memory(cursor)) => Ok(cursor.seek(pos)?),
            Some(Backend::File(file)) => Ok(file.seek(pos)?),
            Some(Backend::Fd { fd, .. }) => {
                let (offset, whence) = match pos {
                    SeekFrom::Start(o) => (o as i64, libc::SEEK_SET),
                    SeekFrom::Current(o) => (o, libc::SEEK_CUR),
                    SeekFrom::End(o) => (o, libc::SEEK_END),
                };
                platform_io::seek_fd(*fd, offset, whence)
            }
            Some(Backend::Custom(callbacks)) => callbacks.seek(pos),
        }
    }

    /// Shorthand for seeking back to the start.
    pub fn rewind(&mut self) -> Result<()> {
        self.seek(SeekFrom::Start(0)).map(|_| ())
    }

    /// Release the backend. Owned storage is cleaned up; borrowed storage is
    /// left to the caller. Safe to call once; later I/O fails
    /// deterministically.
    pub fn release(&mut self) {
        match self.backend.take() {
            None => {}
            Some(Backend::Fd { fd, owned }) => {
                if owned {
                    platform_io::close_fd(fd);
                }
            }
            Some(Backend::Custom(mut callbacks)) => callbacks.release(),
            // Memory and File clean up by dropping.
            Some(_) => {}
        }
    }

    pub fn is_released(&self) -> bool {
        self.backend.is_none()
    }

    /// Drain a memory object, returning its accumulated bytes. `None` for
    /// other backends (or after release).
    pub fn into_bytes(mut self) -> Option<Vec<u8>> {
        match self.backend.take() {
            Some(Backend::Memory(cursor)) => Some(cursor.into_inner()),
            other => {
                self.backend = other;
                None
            }
        }
    }

    /// The raw descriptor behind a descriptor-backed object, if any.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self.backend.as_ref() {
            Some(Backend::Fd { fd, .. }) => Some(*fd),
            Some(Backend::File(file)) => Some(file.as_raw_fd()),
            _ => None,
        }
    }
}

impl Drop for DataObject {
    fn drop(&mut self) {
        self.release();
    }
}
