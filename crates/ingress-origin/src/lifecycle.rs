//! Ownership of the origin resource across `stream` and `close`

use std::sync::{Mutex, PoisonError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Holds the resource a connection owns until a `stream` call takes it or
/// `close` drops it.
///
/// `close` never waits on the in-flight `stream`: it fires `closed`, which
/// the stream selects on, and the stream then drops the resource itself.
pub(crate) struct Lifecycle<T> {
    resource: Mutex<Option<T>>,
    closed: CancellationToken,
}

impl<T> Lifecycle<T> {
    pub(crate) fn new(resource: T) -> Self {
        Self {
            resource: Mutex::new(Some(resource)),
            closed: CancellationToken::new(),
        }
    }

    /// Take the resource for streaming.
    ///
    /// `None` after a previous `take` or after `close`.
    pub(crate) fn take(&self) -> Option<T> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.resource
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Resolves once `close` has been called
    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Mark closed and hand back the resource if no stream took it
    pub(crate) fn close(&self) -> Option<T> {
        self.closed.cancel();
        self.resource
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
