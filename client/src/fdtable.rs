//! The descriptor table: a lock-protected registry of descriptors awaiting
//! readiness, each with its event direction, callback and owning operation.
//!
//! The table is an explicit object handed to the event engine; nothing here
//! is process-global, so tests (and embedders needing real parallelism) can
//! run several independent table/engine pairs.

use std::os::fd::RawFd;
use std::sync::Mutex;

use cryptmux_common::error::Result;
use cryptmux_common::platform_io::Direction;
use uuid::Uuid;

use crate::op::OperationHandle;

/// What a callback asks the engine to do with its registration afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Keep the registration; dispatch again on the next readiness event.
    Again,
    /// The descriptor's work is finished; drop the registration.
    Done,
}

/// Callback invoked when a registered descriptor reports readiness.
pub type IoCallback = Box<dyn FnMut(RawFd, Direction) -> Result<CallbackStatus> + Send>;

/// Opaque handle to one registration. A token is invalidated by
/// `unregister` (or by a replacing registration) and never resolves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(u64);

struct Entry {
    token:     u64,
    fd:        RawFd,
    direction: Direction,
    owner:     Option<OperationHandle>,
    // Taken out while the callback runs so dispatch happens without the lock.
    callback:  Option<IoCallback>,
}

struct Inner {
    entries:    Vec<Entry>,
    next_token: u64,
}

/// Registry of live descriptors, shared between registrars and the engine.
///
/// The mutex protects table mutation only; callbacks are never executed with
/// it held, so a callback may freely register or unregister entries.
pub struct FdTable {
    inner: Mutex<Inner>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries:    Vec::new(),
                next_token: 1,
            }),
        }
    }

    /// Register a callback for readiness of `fd` in `direction`.
    ///
    /// A descriptor appears at most once per direction: registering a
    /// duplicate (fd, direction) replaces the previous entry and invalidates
    /// its token.
    pub fn register(
        &self,
        fd: RawFd,
        direction: Direction,
        owner: Option<OperationHandle>,
        callback: IoCallback,
    ) -> IoToken {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner
            .entries
            .iter()
            .position(|e| e.fd == fd && e.direction == direction)
        {
            let old = inner.entries.remove(pos);
            tracing::debug!(fd, ?direction, old_token = old.token, "replacing registration");
        }
        let token = inner.next_token;
        inner.next_token += 1;
        inner.entries.push(Entry {
            token,
            fd,
            direction,
            owner,
            callback: Some(callback),
        });
        tracing::trace!(fd, ?direction, token, "descriptor registered");
        IoToken(token)
    }

    /// Remove a registration. Returns false if the token was already gone.
    /// A pending readiness result for the token is dropped, never dispatched.
    pub fn unregister(&self, token: IoToken) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.iter().position(|e| e.token == token.0) {
            Some(pos) => {
                let entry = inner.entries.remove(pos);
                tracing::trace!(fd = entry.fd, token = entry.token, "descriptor unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove every registration belonging to the given operation.
    /// Returns the number of entries removed.
    pub fn unregister_owner(&self, operation: Uuid) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|e| e.owner.as_ref().map(|o| o.id()) != Some(operation));
        before - inner.entries.len()
    }

    /// Ordered view of the live registrations for the polling primitive.
    pub fn snapshot(&self) -> Vec<(IoToken, RawFd, Direction)> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .map(|e| (IoToken(e.token), e.fd, e.direction))
            .collect()
    }

    /// Check out a callback for dispatch. Returns `None` if the token was
    /// invalidated since the snapshot was taken.
    pub(crate) fn take_callback(
        &self,
        token: IoToken,
    ) -> Option<(IoCallback, Option<OperationHandle>)> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.iter_mut().find(|e| e.token == token.0)?;
        let callback = entry.callback.take()?;
        Some((callback, entry.owner.clone()))
    }

    /// Return a checked-out callback. Dropped silently if the entry was
    /// unregistered while the callback ran (e.g. by the callback itself).
    pub(crate) fn restore_callback(&self, token: IoToken, callback: IoCallback) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.token == token.0) {
            entry.callback = Some(callback);
        }
    }

    pub fn contains(&self, token: IoToken) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.entries.iter().any(|e| e.token == token.0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
