mod capacity;
mod conflict;
mod error;
mod mutations;
mod queries;
mod reconcile;
mod wake;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use mutations::ReservationRequest;
pub use queries::WishListing;
pub use reconcile::{
    CONDITION_ACTIVE, CONDITION_AVAILABLE, Phase, Plan, Reconciled, plan, set_condition,
};
pub use wake::next_wake;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::model::Event;
use crate::store::WishStore;

/// Deadline and cancellation signal bounding one engine call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout, CancellationToken::new())
    }

    /// Child of `cancel`: cancelling the parent aborts this call too.
    pub fn with_cancel(timeout: Duration, cancel: &CancellationToken) -> Self {
        Self::with_deadline(Instant::now() + timeout, cancel.child_token())
    }

    pub fn with_deadline(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Gate in front of a store write. Once it passes, the write is awaited to
    /// completion and its own result is returned; a call either commits or
    /// reports `Timeout`/`Cancelled` having written nothing.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(EngineError::Timeout);
        }
        Ok(())
    }

    /// Drive a read until it finishes, the deadline passes, or the call is
    /// cancelled. Never wrap a write in this: dropping it midway would hide
    /// whether it committed.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            res = tokio::time::timeout_at(self.deadline, fut) => {
                res.unwrap_or(Err(EngineError::Timeout))
            }
        }
    }
}

/// Reservation admission, reconciliation and reads for one namespace.
#[derive(Clone)]
pub struct Engine {
    pub(super) store: Arc<dyn WishStore>,
    pub(super) namespace: String,
}

impl Engine {
    pub fn new(store: Arc<dyn WishStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Change feed for this engine's namespace.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.store.watch(&self.namespace)
    }
}
