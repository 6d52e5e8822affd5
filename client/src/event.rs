//! The I/O event engine: one poll round at a time over a shared descriptor
//! table, dispatching readiness to registered callbacks.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cryptmux_common::error::{Error, Result};
use cryptmux_common::platform_io::{self, Direction};

use crate::fdtable::{CallbackStatus, FdTable};

/// Drives callbacks for one descriptor table.
///
/// Single-threaded and cooperative: the poll wait is the only blocking point,
/// and callbacks execute strictly one at a time in the order the platform
/// reports readiness. Registrations made from inside a callback take effect
/// on the next round.
pub struct EventEngine {
    table: Arc<FdTable>,
}

impl EventEngine {
    pub fn new(table: Arc<FdTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<FdTable> {
        &self.table
    }

    /// Run one poll round.
    ///
    /// Blocks until at least one registered descriptor is ready or the
    /// timeout elapses, then dispatches each ready descriptor's callback
    /// once. Returns the number of callbacks dispatched; `Error::Timeout` on
    /// expiry leaves every registration in place. An empty table returns
    /// zero immediately.
    ///
    /// A callback error marks its owning operation failed and drops the
    /// registration; remaining descriptors are still serviced. A descriptor
    /// the platform reports as invalid is dropped from the table and fails
    /// the whole round.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let snapshot = self.table.snapshot();
        if snapshot.is_empty() {
            return Ok(0);
        }

        let slots: Vec<(RawFd, Direction)> =
            snapshot.iter().map(|&(_, fd, dir)| (fd, dir)).collect();
        let readiness = platform_io::poll_descriptors(&slots, timeout)?;

        let mut dispatched = 0;
        let mut dead_descriptor = false;
        for (&(token, fd, direction), ready) in snapshot.iter().zip(readiness) {
            if ready.invalid {
                tracing::error!(fd, "stale descriptor in poll set, dropping registration");
                self.table.unregister(token);
                dead_descriptor = true;
                continue;
            }
            if !ready.is_ready(direction) {
                continue;
            }
            // The entry may have been unregistered by an earlier callback in
            // this same round; its readiness result is dropped, not
            // dispatched.
            let Some((mut callback, owner)) = self.table.take_callback(token) else {
                continue;
            };
            dispatched += 1;
            match callback(fd, direction) {
                Ok(CallbackStatus::Again) => self.table.restore_callback(token, callback),
                Ok(CallbackStatus::Done) => {
                    self.table.unregister(token);
                }
                Err(error) => {
                    tracing::warn!(fd, %error, "i/o callback failed");
                    self.table.unregister(token);
                    match owner {
                        Some(op) => op.mark_failed(error),
                        None => tracing::debug!(fd, "failed callback had no owning operation"),
                    }
                }
            }
        }

        if dead_descriptor {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EBADF)));
        }
        Ok(dispatched)
    }

    /// Drive `run_once` until the predicate holds or the deadline elapses.
    ///
    /// The predicate is evaluated before each round. A table with no
    /// registrations and an unsatisfied predicate cannot make progress and
    /// reports `Timeout` instead of spinning.
    pub fn run_until(
        &self,
        deadline: Option<Duration>,
        mut predicate: impl FnMut() -> bool,
    ) -> Result<()> {
        let deadline_at = deadline.map(|d| Instant::now() + d);
        loop {
            if predicate() {
                return Ok(());
            }
            if self.table.is_empty() {
                tracing::debug!("run_until has no descriptors left and the predicate is unmet");
                return Err(Error::Timeout);
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
            self.run_once(remaining)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use cryptmux_common::platform_io::{create_pipe, write_fd};

    use super::*;
    use crate::fdtable::{IoCallback, IoToken};
    use crate::op::{OpStatus, OperationHandle};

    fn counting(counter: Arc<AtomicUsize>) -> IoCallback {
        Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(CallbackStatus::Again)
        })
    }

    #[test]
    fn timeout_leaves_the_table_unchanged() {
        let table = Arc::new(FdTable::new());
        let engine = EventEngine::new(table.clone());
        let pipe = create_pipe().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let token = table.register(
            pipe.read.as_raw_fd(),
            Direction::Read,
            None,
            counting(counter.clone()),
        );

        let before = table.snapshot();
        let err = engine.run_once(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(table.snapshot(), before);
        assert!(table.contains(token));
    }

    #[test]
    fn dispatches_ready_descriptors() {
        let table = Arc::new(FdTable::new());
        let engine = EventEngine::new(table.clone());
        let pipe = create_pipe().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        table.register(
            pipe.read.as_raw_fd(),
            Direction::Read,
            None,
            counting(counter.clone()),
        );

        write_fd(pipe.write.as_raw_fd(), b"x").unwrap();
        let n = engine.run_once(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_from_a_callback_suppresses_queued_dispatch() {
        let table = Arc::new(FdTable::new());
        let engine = EventEngine::new(table.clone());
        let first = create_pipe().unwrap();
        let second = create_pipe().unwrap();

        // Both pipes are ready before the round starts, so both readiness
        // results are queued in the same round.
        write_fd(first.write.as_raw_fd(), b"a").unwrap();
        write_fd(second.write.as_raw_fd(), b"b").unwrap();

        let second_hits = Arc::new(AtomicUsize::new(0));
        let victim_token: Arc<Mutex<Option<IoToken>>> = Arc::new(Mutex::new(None));

        let table_for_cb = table.clone();
        let victim_for_cb = victim_token.clone();
        table.register(
            first.read.as_raw_fd(),
            Direction::Read,
            None,
            Box::new(move |_, _| {
                let token = victim_for_cb.lock().unwrap().take().unwrap();
                assert!(table_for_cb.unregister(token));
                Ok(CallbackStatus::Done)
            }),
        );
        let token = table.register(
            second.read.as_raw_fd(),
            Direction::Read,
            None,
            counting(second_hits.clone()),
        );
        *victim_token.lock().unwrap() = Some(token);

        let n = engine.run_once(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn callback_error_fails_the_owner_but_not_the_round() {
        let table = Arc::new(FdTable::new());
        let engine = EventEngine::new(table.clone());
        let failing = create_pipe().unwrap();
        let healthy = create_pipe().unwrap();
        write_fd(failing.write.as_raw_fd(), b"x").unwrap();
        write_fd(healthy.write.as_raw_fd(), b"y").unwrap();

        let op = OperationHandle::new();
        table.register(
            failing.read.as_raw_fd(),
            Direction::Read,
            Some(op.clone()),
            Box::new(|_, _| Err(Error::PeerClosed)),
        );
        let healthy_hits = Arc::new(AtomicUsize::new(0));
        table.register(
            healthy.read.as_raw_fd(),
            Direction::Read,
            None,
            counting(healthy_hits.clone()),
        );

        let n = engine.run_once(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(n, 2);
        assert_eq!(op.status(), OpStatus::Failed);
        assert!(matches!(op.take_error(), Some(Error::PeerClosed)));
        assert_eq!(healthy_hits.load(Ordering::SeqCst), 1);
        // The failed entry is gone, the healthy one stays.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn done_callbacks_drop_their_registration() {
        let table = Arc::new(FdTable::new());
        let engine = EventEngine::new(table.clone());
        let pipe = create_pipe().unwrap();
        write_fd(pipe.write.as_raw_fd(), b"x").unwrap();
        table.register(
            pipe.read.as_raw_fd(),
            Direction::Read,
            None,
            Box::new(|_, _| Ok(CallbackStatus::Done)),
        );

        engine.run_once(Some(Duration::from_millis(200))).unwrap();
        assert!(table.is_empty());
        assert_eq!(engine.run_once(Some(Duration::from_millis(10))).unwrap(), 0);
    }

    #[test]
    fn run_until_honors_its_deadline() {
        let table = Arc::new(FdTable::new());
        let engine = EventEngine::new(table.clone());
        let pipe = create_pipe().unwrap();
        table.register(
            pipe.read.as_raw_fd(),
            Direction::Read,
            None,
            Box::new(|_, _| Ok(CallbackStatus::Again)),
        );

        let started = Instant::now();
        let err = engine
            .run_until(Some(Duration::from_millis(50)), || false)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(45));
    }
}
