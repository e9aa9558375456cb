// Single-assignment result slot and the caller-side handle to it.
//
// A slot starts empty, is written exactly once by the pump (success payload
// or failure), and then reads back the same outcome forever. It is backed by
// a watch channel so any number of waiters can suspend on it and wake
// independently.
//
// The queue itself only keeps a weak reference to each slot. A slot lives as
// long as its request is pending or in flight, or someone holds a
// `ResultHandle` to it; once the outcome is written and every handle is gone
// the slot is freed.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::error;

use super::request::RequestId;
use crate::error::RequestError;

type Outcome<T> = Option<Result<T, RequestError>>;

pub(crate) struct ResultSlot<T> {
    id: RequestId,
    tx: watch::Sender<Outcome<T>>,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new(id: RequestId) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { id, tx }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    /// Write the outcome. A second write is rejected and the first value stands.
    pub(crate) fn write(&self, outcome: Result<T, RequestError>) -> Result<(), RequestError> {
        let mut outcome = Some(outcome);
        let written = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = outcome.take();
            true
        });

        if written {
            Ok(())
        } else {
            error!(id = %self.id, "Result slot written twice");
            Err(RequestError::SlotAlreadyWritten(self.id))
        }
    }
}

impl<T: Clone> ResultSlot<T> {
    fn peek(&self) -> Outcome<T> {
        self.tx.borrow().clone()
    }

    async fn wait(&self) -> Result<T, RequestError> {
        let mut rx = self.tx.subscribe();
        // The slot owns the sender, so the channel cannot close while a
        // waiter borrows the slot, and `wait_for` only returns once the
        // value is `Some`.
        let result = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| unreachable!("wait_for returned an empty slot")),
            Err(_) => unreachable!("result slot sender dropped while borrowed"),
        };
        result
    }
}

/// Caller-side handle to one request's outcome.
///
/// Cheap to clone. Holding a handle keeps the outcome readable, by the
/// handle or by id through `RequestQueue::get_request_result`, after the
/// request completes. Dropping every handle means the outcome is ignored.
pub struct ResultHandle<T> {
    slot: Arc<ResultSlot<T>>,
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> ResultHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(slot: Arc<ResultSlot<T>>) -> Self {
        Self { slot }
    }

    pub fn id(&self) -> RequestId {
        self.slot.id
    }

    pub fn is_ready(&self) -> bool {
        self.slot.tx.borrow().is_some()
    }

    /// The outcome if already written, without waiting.
    pub fn peek(&self) -> Option<Result<T, RequestError>> {
        self.slot.peek()
    }

    /// Suspend until the outcome is written, then return a copy of it.
    ///
    /// Returns immediately if the request has already completed.
    pub async fn wait(&self) -> Result<T, RequestError> {
        self.slot.wait().await
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("id", &self.slot.id)
            .field("ready", &self.slot.tx.borrow().is_some())
            .finish()
    }
}
