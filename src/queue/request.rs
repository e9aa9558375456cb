// Queued request values: ids and deferred actions.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::slot::ResultSlot;
use crate::error::RequestError;

/// Unique handle for a submitted request.
///
/// Allocated by `RequestQueue::get_request_id`, strictly increasing and never
/// reused for the lifetime of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        RequestId(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A deferred call, run exactly once when the pump reaches it.
///
/// The closure captures the operation and all of its parameters by value, so
/// nothing runs (and no future is even built) until dispatch time.
pub struct Action<T> {
    run: Box<dyn FnOnce() -> BoxFuture<'static, Result<T, RequestError>> + Send>,
}

impl<T: Send + 'static> Action<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        Self {
            run: Box::new(move || f().boxed()),
        }
    }

    /// Wrap an already-known outcome. Mostly useful in tests.
    pub fn ready(outcome: Result<T, RequestError>) -> Self {
        Self::new(move || async move { outcome })
    }

    /// Consume the action and start the call.
    pub(crate) fn invoke(self) -> BoxFuture<'static, Result<T, RequestError>> {
        (self.run)()
    }
}

impl<T> fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Action { .. }")
    }
}

/// An entry waiting in the pending FIFO.
///
/// Holds a strong reference to its result slot so the slot outlives every
/// caller handle until the outcome has been written.
pub(crate) struct QueuedRequest<T> {
    pub id: RequestId,
    pub action: Action<T>,
    pub slot: Arc<ResultSlot<T>>,
}
