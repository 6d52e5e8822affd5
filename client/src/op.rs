//! Shared operation state, used to tie descriptor-table entries to the
//! logical operation they belong to.

use std::sync::{Arc, Mutex};

use cryptmux_common::error::Error;
use uuid::Uuid;

/// Lifecycle of one in-flight engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Running,
    Done,
    Failed,
}

struct OpInner {
    status: OpStatus,
    error:  Option<Error>,
}

/// Cloneable handle to one operation's terminal state.
///
/// The event engine uses it to mark an operation failed when one of its
/// callbacks errors; the operation context uses it as the wait predicate.
/// The first recorded failure wins; later transitions are ignored.
#[derive(Clone)]
pub struct OperationHandle {
    id:    Uuid,
    inner: Arc<Mutex<OpInner>>,
}

impl OperationHandle {
    pub fn new() -> Self {
        Self {
            id:    Uuid::new_v4(),
            inner: Arc::new(Mutex::new(OpInner {
                status: OpStatus::Running,
                error:  None,
            })),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> OpStatus {
        self.inner.lock().unwrap().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status() != OpStatus::Running
    }

    /// Mark the operation completed successfully. No-op once terminal.
    pub fn mark_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == OpStatus::Running {
            inner.status = OpStatus::Done;
        }
    }

    /// Mark the operation failed. No-op once terminal.
    pub fn mark_failed(&self, error: Error) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == OpStatus::Running {
            tracing::debug!(operation = %self.id, %error, "operation failed");
            inner.status = OpStatus::Failed;
            inner.error = Some(error);
        }
    }

    /// Take the recorded failure, if any. Subsequent calls return `None`.
    pub fn take_error(&self) -> Option<Error> {
        self.inner.lock().unwrap().error.take()
    }
}

impl Default for OperationHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_terminal_transition_wins() {
        let op = OperationHandle::new();
        assert_eq!(op.status(), OpStatus::Running);

        op.mark_failed(Error::Cancelled);
        op.mark_done();
        assert_eq!(op.status(), OpStatus::Failed);
        assert!(matches!(op.take_error(), Some(Error::Cancelled)));
        assert!(op.take_error().is_none());
    }

    #[test]
    fn done_blocks_later_failure() {
        let op = OperationHandle::new();
        op.mark_done();
        op.mark_failed(Error::Cancelled);
        assert_eq!(op.status(), OpStatus::Done);
        assert!(op.take_error().is_none());
    }
}
