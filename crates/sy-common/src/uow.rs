//! Unit of Work - completion tracking for a root exchange
//!
//! Completion callbacks ("synchronizations") run exactly once, in reverse
//! registration order, when the exchange reaches a terminal state. The unit
//! of work also carries the cancellation signal redelivery waits and the
//! pipeline loop observe.

use crate::exchange::Exchange;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Callback invoked when the owning exchange reaches a terminal state.
pub trait Synchronization: Send + Sync {
    fn on_complete(&self, exchange: &Exchange);
    fn on_failure(&self, exchange: &Exchange);
}

/// Closure adapter for [`Synchronization`].
pub struct SynchronizationFn<C, F>
where
    C: Fn(&Exchange) + Send + Sync,
    F: Fn(&Exchange) + Send + Sync,
{
    on_complete: C,
    on_failure: F,
}

impl<C, F> SynchronizationFn<C, F>
where
    C: Fn(&Exchange) + Send + Sync,
    F: Fn(&Exchange) + Send + Sync,
{
    pub fn new(on_complete: C, on_failure: F) -> Self {
        Self {
            on_complete,
            on_failure,
        }
    }
}

impl<C, F> Synchronization for SynchronizationFn<C, F>
where
    C: Fn(&Exchange) + Send + Sync,
    F: Fn(&Exchange) + Send + Sync,
{
    fn on_complete(&self, exchange: &Exchange) {
        (self.on_complete)(exchange)
    }

    fn on_failure(&self, exchange: &Exchange) {
        (self.on_failure)(exchange)
    }
}

/// Tracks one root exchange's completion. Fan-out children either share the
/// parent's unit of work (shared failure semantics) or own a fresh one.
pub struct UnitOfWork {
    synchronizations: Mutex<Vec<Box<dyn Synchronization>>>,
    completed: AtomicBool,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self {
            synchronizations: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    pub fn add_synchronization(&self, synchronization: Box<dyn Synchronization>) {
        self.synchronizations.lock().push(synchronization);
    }

    /// Run completion callbacks exactly once, in reverse registration order.
    /// Later calls are no-ops.
    pub fn done(&self, exchange: &Exchange) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }

        let callbacks = std::mem::take(&mut *self.synchronizations.lock());
        for synchronization in callbacks.into_iter().rev() {
            if exchange.is_failed() {
                synchronization.on_failure(exchange);
            } else {
                synchronization.on_complete(exchange);
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Request cancellation. Pending redelivery waits wake promptly.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        let notified = self.cancel_notify.notified();
        tokio::pin!(notified);
        // Register the waiter before checking the flag, so a cancel landing
        // in between still wakes us.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("synchronizations", &self.synchronizations.lock().len())
            .field("completed", &self.is_completed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
