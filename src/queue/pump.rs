// FIFO request queue drained by a single timer-driven pump.
//
// The site enforces a request-rate policy, so outbound calls are never run in
// parallel: the pump sleeps `min_delay`, dispatches the oldest pending entry,
// waits for it to finish, and only then starts the next sleep. Real spacing
// between dispatch starts is therefore `min_delay` plus however long the
// previous call took.
//
// The pump task is spawned lazily by `add` and exits as soon as it finds the
// queue empty, so an idle queue costs nothing.
//
// The queue keeps only weak references to result slots. Pending entries and
// caller handles keep them alive; a slot whose outcome nobody holds is swept
// from the index after the next write.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::request::{Action, QueuedRequest, RequestId};
use super::slot::{ResultHandle, ResultSlot};
use crate::error::RequestError;

/// Default spacing between dispatches, matching the site's rate policy.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(2000);

/// Most ids that may be allocated and not yet added. Beyond this the oldest
/// reservation is dropped.
pub const MAX_RESERVED: usize = 4096;

/// A serialized, rate-limited request queue.
///
/// Cheap to clone; clones share the same pending FIFO and pump.
pub struct RequestQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    /// Minimum time between the end of one call and the start of the next.
    min_delay: Duration,
    /// Upper bound on a single dispatched call, if any.
    timeout: Option<Duration>,
    state: Mutex<QueueState<T>>,
}

struct QueueState<T> {
    /// Next id to hand out. Ids start at 1.
    next_id: u64,
    /// Ids handed out by `get_request_id` but not yet added.
    reserved: BTreeSet<RequestId>,
    pending: VecDeque<QueuedRequest<T>>,
    /// Result slots by id, for lookups through `get_request_result`.
    slots: HashMap<RequestId, Weak<ResultSlot<T>>>,
    pump_running: bool,
}

impl<T> QueueState<T> {
    fn sweep_slots(&mut self) {
        self.slots.retain(|_, slot| slot.strong_count() > 0);
    }
}

impl<T> Inner<T> {
    // Nothing in the critical sections can leave the state half-updated,
    // so a poisoned lock is still safe to use.
    fn lock_state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> RequestQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a queue that waits at least `min_delay` between dispatches.
    pub fn new(min_delay: Duration) -> Self {
        Self::with_timeout(min_delay, None)
    }

    /// Create a queue whose dispatched calls are abandoned after `timeout`.
    pub fn with_timeout(min_delay: Duration, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                min_delay,
                timeout,
                state: Mutex::new(QueueState {
                    next_id: 1,
                    reserved: BTreeSet::new(),
                    pending: VecDeque::new(),
                    slots: HashMap::new(),
                    pump_running: false,
                }),
            }),
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.inner.min_delay
    }

    /// Allocate the next request id.
    pub fn get_request_id(&self) -> RequestId {
        let mut state = self.inner.lock_state();
        let id = RequestId::new(state.next_id);
        state.next_id += 1;
        state.reserved.insert(id);

        if state.reserved.len() > MAX_RESERVED {
            if let Some(stale) = state.reserved.pop_first() {
                warn!(id = %stale, "Dropping reservation for an id that was never added");
            }
        }
        id
    }

    /// Register `action` to run under `id` once every earlier entry has run.
    ///
    /// Never runs the action synchronously. Arms the pump if it is idle, which
    /// requires being called from within a Tokio runtime. The returned handle
    /// reads the outcome; dropping it (and every clone) means the outcome is
    /// ignored.
    pub fn add(&self, id: RequestId, action: Action<T>) -> Result<ResultHandle<T>, RequestError> {
        let handle = Handle::try_current().map_err(|_| RequestError::NoRuntime)?;

        let mut state = self.inner.lock_state();
        if !state.reserved.remove(&id) {
            return Err(if id.get() > 0 && id.get() < state.next_id {
                RequestError::DuplicateRequest(id)
            } else {
                RequestError::UnknownRequest(id)
            });
        }

        let slot = Arc::new(ResultSlot::new(id));
        state.slots.insert(id, Arc::downgrade(&slot));
        state.pending.push_back(QueuedRequest {
            id,
            action,
            slot: Arc::clone(&slot),
        });
        debug!(id = %id, pending = state.pending.len(), "Request queued");

        if !state.pump_running {
            state.pump_running = true;
            handle.spawn(run_pump(PumpGuard::new(Arc::clone(&self.inner))));
        }

        Ok(ResultHandle::new(slot))
    }

    /// Allocate an id and add `action` under it.
    pub fn submit(&self, action: Action<T>) -> Result<ResultHandle<T>, RequestError> {
        let id = self.get_request_id();
        self.add(id, action)
    }

    /// Look up the handle for request `id`.
    ///
    /// Fails with `UnknownRequest` if the id was never added, or if it has
    /// completed and every handle to its outcome has been dropped.
    pub fn handle(&self, id: RequestId) -> Result<ResultHandle<T>, RequestError> {
        let mut state = self.inner.lock_state();
        let slot = state.slots.get(&id).map(Weak::upgrade);
        match slot {
            Some(Some(slot)) => Ok(ResultHandle::new(slot)),
            Some(None) => {
                state.slots.remove(&id);
                Err(RequestError::UnknownRequest(id))
            }
            None => Err(RequestError::UnknownRequest(id)),
        }
    }

    /// Wait for the outcome of request `id`.
    ///
    /// Suspends until the request has been dispatched and completed; returns
    /// immediately if it already has. Reading the same id again returns the
    /// same outcome for as long as a handle to it is held.
    pub async fn get_request_result(&self, id: RequestId) -> Result<T, RequestError> {
        let handle = self.handle(id)?;
        handle.wait().await
    }

    /// Withdraw a request that has not been dispatched yet.
    ///
    /// Its waiters receive `Cancelled`. Returns false if the request is
    /// unknown or already dispatched.
    pub fn cancel(&self, id: RequestId) -> bool {
        let entry = {
            let mut state = self.inner.lock_state();
            let Some(pos) = state.pending.iter().position(|entry| entry.id == id) else {
                return false;
            };
            state.pending.remove(pos)
        };
        let Some(entry) = entry else {
            return false;
        };

        debug!(id = %id, "Request cancelled before dispatch");
        let _ = entry.slot.write(Err(RequestError::Cancelled(id)));
        drop(entry);
        self.inner.lock_state().sweep_slots();
        true
    }

    /// Number of requests waiting to be dispatched.
    pub fn pending_len(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    /// Number of result slots still reachable by id.
    pub fn slot_count(&self) -> usize {
        let mut state = self.inner.lock_state();
        state.sweep_slots();
        state.slots.len()
    }

    /// Whether the pump task is currently alive.
    pub fn is_pumping(&self) -> bool {
        self.inner.lock_state().pump_running
    }
}

impl<T> std::fmt::Debug for RequestQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("RequestQueue")
            .field("min_delay", &self.inner.min_delay)
            .field("pending", &state.pending.len())
            .field("pump_running", &state.pump_running)
            .finish()
    }
}

/// Owns the pump's claim on `pump_running`.
///
/// If the pump task is dropped without reaching its idle exit (runtime
/// shutdown, abort), the flag is cleared so the next `add` spawns a new pump,
/// and a call that was in flight resolves as `Cancelled`.
struct PumpGuard<T> {
    inner: Arc<Inner<T>>,
    in_flight: Option<Arc<ResultSlot<T>>>,
    finished: bool,
}

impl<T> PumpGuard<T> {
    fn new(inner: Arc<Inner<T>>) -> Self {
        Self {
            inner,
            in_flight: None,
            finished: false,
        }
    }
}

impl<T> Drop for PumpGuard<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.inner.lock_state().pump_running = false;
        warn!("Request pump stopped before the queue drained");

        if let Some(slot) = self.in_flight.take() {
            let _ = slot.write(Err(RequestError::Cancelled(slot.id())));
        }
    }
}

/// Drain the pending FIFO one entry at a time until it is empty.
async fn run_pump<T>(mut guard: PumpGuard<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let inner = Arc::clone(&guard.inner);
    debug!(delay_ms = inner.min_delay.as_millis() as u64, "Request pump started");

    loop {
        tokio::time::sleep(inner.min_delay).await;

        // Pop and mark idle under one lock so a concurrent `add` either sees
        // the pump running or spawns a fresh one.
        let next = {
            let mut state = inner.lock_state();
            let next = state.pending.pop_front();
            if next.is_none() {
                state.pump_running = false;
                guard.finished = true;
            }
            next
        };

        let Some(QueuedRequest { id, action, slot }) = next else {
            debug!("Request queue drained, pump idle");
            return;
        };

        debug!(id = %id, "Dispatching request");
        guard.in_flight = Some(slot);
        let outcome = dispatch(action, inner.timeout).await;

        if let Err(err) = &outcome {
            warn!(id = %id, error = %err, "Queued request failed");
        }

        if let Some(slot) = guard.in_flight.take() {
            let _ = slot.write(outcome);
        }
        inner.lock_state().sweep_slots();
    }
}

/// Run one action to completion, converting a panic or timeout into a failure.
async fn dispatch<T>(action: Action<T>, timeout: Option<Duration>) -> Result<T, RequestError>
where
    T: Send + 'static,
{
    // Building the future happens inside the unwind guard too, so a closure
    // that panics before returning a future is caught like one that panics
    // while polled.
    let call = AssertUnwindSafe(async move { action.invoke().await }).catch_unwind();

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => return Err(RequestError::Timeout(limit)),
        },
        None => call.await,
    };

    result.unwrap_or(Err(RequestError::ActionPanicked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn queue(delay_ms: u64) -> RequestQueue<String> {
        RequestQueue::new(Duration::from_millis(delay_ms))
    }

    // ── get_request_id ──────────────────────────────────────────────

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let q = queue(10);
        let ids: Vec<u64> = (0..5).map(|_| q.get_request_id().get()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_clones_share_id_counter() {
        let q = queue(10);
        let other = q.clone();
        assert_eq!(q.get_request_id().get(), 1);
        assert_eq!(other.get_request_id().get(), 2);
    }

    #[tokio::test]
    async fn test_unused_reservations_are_bounded() {
        let q = queue(10);
        let oldest = q.get_request_id();
        for _ in 0..MAX_RESERVED {
            q.get_request_id();
        }
        assert_eq!(q.inner.lock_state().reserved.len(), MAX_RESERVED);

        // The oldest reservation was dropped; the newest still works
        assert_eq!(
            q.add(oldest, Action::ready(Ok(String::new()))).unwrap_err(),
            RequestError::DuplicateRequest(oldest)
        );
        let newest = RequestId::new(MAX_RESERVED as u64 + 1);
        assert!(q.add(newest, Action::ready(Ok(String::new()))).is_ok());
    }

    // ── add ─────────────────────────────────────────────────────────

    #[test]
    fn test_add_outside_runtime_fails() {
        let q = queue(10);
        let id = q.get_request_id();
        let err = q.add(id, Action::ready(Ok(String::new()))).unwrap_err();
        assert_eq!(err, RequestError::NoRuntime);
    }

    #[tokio::test]
    async fn test_add_unallocated_id_is_unknown() {
        let q = queue(10);
        let err = q
            .add(RequestId::new(99), Action::ready(Ok(String::new())))
            .unwrap_err();
        assert_eq!(err, RequestError::UnknownRequest(RequestId::new(99)));
        assert_eq!(q.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_add_same_id_twice_is_rejected() {
        let q = queue(10);
        let id = q.get_request_id();
        let _first = q.add(id, Action::ready(Ok("a".into()))).unwrap();
        let err = q.add(id, Action::ready(Ok("b".into()))).unwrap_err();
        assert_eq!(err, RequestError::DuplicateRequest(id));
        assert_eq!(q.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_add_does_not_run_action_synchronously() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let q = queue(50);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = q
            .submit(Action::new(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok("ran".to_string())
            }))
            .unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert!(!handle.is_ready());
        assert_eq!(q.pending_len(), 1);
        assert!(q.is_pumping());
    }

    // ── pump ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_first_dispatch_waits_min_delay() {
        let q = queue(80);
        let start = Instant::now();
        let handle = q.submit(Action::ready(Ok("x".into()))).unwrap();
        handle.wait().await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(75),
            "Expected ~80ms before first dispatch, got {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_pump_goes_idle_and_rearms() {
        let q = queue(20);
        let first = q.submit(Action::ready(Ok("one".into()))).unwrap();
        assert_eq!(first.wait().await.unwrap(), "one");

        // One more empty tick and the pump parks itself
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!q.is_pumping());

        let second = q.submit(Action::ready(Ok("two".into()))).unwrap();
        assert!(q.is_pumping());
        assert_eq!(second.wait().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_slow_call_adds_to_spacing() {
        let q = queue(30);
        let a = q
            .submit(Action::new(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok("slow".to_string())
            }))
            .unwrap();
        let b = q.submit(Action::ready(Ok("fast".into()))).unwrap();

        let start = Instant::now();
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        // 30ms + 100ms call + 30ms before the second dispatch
        assert!(
            start.elapsed() >= Duration::from_millis(150),
            "Expected delay to stack on call duration, got {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_timeout_fails_stuck_call_and_pump_continues() {
        let q = RequestQueue::with_timeout(
            Duration::from_millis(10),
            Some(Duration::from_millis(50)),
        );
        let stuck = q
            .submit(Action::new(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("never".to_string())
            }))
            .unwrap();
        let next = q.submit(Action::ready(Ok("after".into()))).unwrap();

        assert_eq!(
            stuck.wait().await.unwrap_err(),
            RequestError::Timeout(Duration::from_millis(50))
        );
        assert_eq!(next.wait().await.unwrap(), "after");
    }

    #[tokio::test]
    async fn test_panicking_action_is_recorded_as_failure() {
        let q = queue(10);
        let bad = q
            .submit(Action::new(|| async {
                if true {
                    panic!("boom");
                }
                Ok(String::new())
            }))
            .unwrap();
        let good = q.submit(Action::ready(Ok("fine".into()))).unwrap();

        assert_eq!(bad.wait().await.unwrap_err(), RequestError::ActionPanicked);
        assert_eq!(good.wait().await.unwrap(), "fine");
    }

    #[tokio::test]
    async fn test_action_panicking_before_returning_future_is_recorded() {
        let q = queue(10);
        let bad = q
            .submit(Action::new(
                || -> futures::future::Ready<Result<String, RequestError>> {
                    panic!("failed to build the call")
                },
            ))
            .unwrap();
        let good = q.submit(Action::ready(Ok("fine".into()))).unwrap();

        assert_eq!(bad.wait().await.unwrap_err(), RequestError::ActionPanicked);
        assert_eq!(good.wait().await.unwrap(), "fine");

        // The pump survived and still parks itself when drained
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!q.is_pumping());
    }

    #[test]
    fn test_runtime_shutdown_clears_pump_flag() {
        let q = queue(30);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let stranded = rt
            .block_on(async { q.submit(Action::ready(Ok("first".into()))) })
            .unwrap();
        assert!(q.is_pumping());

        drop(rt);
        assert!(!q.is_pumping());
        assert_eq!(q.pending_len(), 1);

        // A later runtime rearms the pump and drains what was left behind
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let next = q.submit(Action::ready(Ok("second".into()))).unwrap();
            assert_eq!(stranded.wait().await.unwrap(), "first");
            assert_eq!(next.wait().await.unwrap(), "second");
        });
    }

    #[test]
    fn test_runtime_shutdown_mid_call_cancels_in_flight_request() {
        let q = queue(10);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let handle = rt.block_on(async {
            let handle = q
                .submit(Action::new(|| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok("never".to_string())
                }))
                .unwrap();
            // Let the pump dispatch and park inside the call
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle
        });
        assert_eq!(q.pending_len(), 0);

        drop(rt);
        assert!(!q.is_pumping());
        assert_eq!(
            handle.peek(),
            Some(Err(RequestError::Cancelled(handle.id())))
        );
    }

    // ── results ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_result_for_unknown_id_fails_fast() {
        let q = queue(10);
        let err = q.get_request_result(RequestId::new(3)).await.unwrap_err();
        assert_eq!(err, RequestError::UnknownRequest(RequestId::new(3)));
    }

    #[tokio::test]
    async fn test_result_readable_by_id_while_handle_is_held() {
        let q = queue(10);
        let handle = q.submit(Action::ready(Ok("kept".into()))).unwrap();
        handle.wait().await.unwrap();

        for _ in 0..2 {
            assert_eq!(q.get_request_result(handle.id()).await.unwrap(), "kept");
        }
    }

    #[tokio::test]
    async fn test_ignored_result_is_released() {
        let q = queue(10);
        let id = q.submit(Action::ready(Ok("ignored".into()))).unwrap().id();

        // Still pending, so still reachable by id
        assert_eq!(q.slot_count(), 1);
        assert_eq!(q.get_request_result(id).await.unwrap(), "ignored");

        assert_eq!(q.slot_count(), 0);
        assert_eq!(
            q.get_request_result(id).await.unwrap_err(),
            RequestError::UnknownRequest(id)
        );
    }

    #[tokio::test]
    async fn test_released_id_cannot_be_added_again() {
        let q = queue(10);
        let id = q.submit(Action::ready(Ok("once".into()))).unwrap().id();
        q.get_request_result(id).await.unwrap();
        assert_eq!(
            q.add(id, Action::ready(Ok("again".into()))).unwrap_err(),
            RequestError::DuplicateRequest(id)
        );
    }

    // ── cancel ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_cancel_pending_request() {
        let q = queue(40);
        let keep = q.submit(Action::ready(Ok("keep".into()))).unwrap();
        let dropped = q.submit(Action::ready(Ok("drop".into()))).unwrap();

        assert!(q.cancel(dropped.id()));
        assert_eq!(q.pending_len(), 1);
        assert_eq!(
            dropped.wait().await.unwrap_err(),
            RequestError::Cancelled(dropped.id())
        );
        assert_eq!(keep.wait().await.unwrap(), "keep");
    }

    #[tokio::test]
    async fn test_cancel_after_dispatch_is_refused() {
        let q = queue(10);
        let handle = q.submit(Action::ready(Ok("done".into()))).unwrap();
        handle.wait().await.unwrap();
        assert!(!q.cancel(handle.id()));
        assert!(!q.cancel(RequestId::new(500)));
        assert_eq!(handle.wait().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_cancel_while_in_flight_lets_call_finish() {
        let q = queue(10);
        let handle = q
            .submit(Action::new(|| async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok("finished".to_string())
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(q.pending_len(), 0);
        assert!(!q.cancel(handle.id()));
        assert_eq!(handle.wait().await.unwrap(), "finished");
    }

    #[tokio::test]
    async fn test_cancel_of_unheld_request_frees_slot() {
        let q = queue(40);
        let id = q.submit(Action::ready(Ok("x".into()))).unwrap().id();
        assert_eq!(q.slot_count(), 1);

        assert!(q.cancel(id));
        assert_eq!(q.slot_count(), 0);
        assert_eq!(q.pending_len(), 0);
    }
}
