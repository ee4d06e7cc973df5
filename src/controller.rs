//! Drives the reconciler: decides which wish to reconcile next and when.
//!
//! Names arrive from the store's change feed, from a full listing at start
//! (and after the feed lags), and from timers the reconciler asks for. A name
//! is reconciled by at most one task at a time; an event for a name that is
//! already running marks it for one more pass once the current one ends.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, error, info, warn};

use crate::engine::{CallContext, Engine, EngineError, Phase, Reconciled};
use crate::limits::{BACKOFF_BASE, BACKOFF_MAX, MAX_REQUEUE};
use crate::observability;
use crate::store::StoreError;

/// Delay before retrying a name that has failed `failures` times in a row.
pub fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    BACKOFF_BASE.saturating_mul(1u32 << exp).min(BACKOFF_MAX)
}

/// Pending names, with per-name de-duplication and timers.
#[derive(Default)]
struct WorkQueue {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    rerun: HashSet<String>,
    timers: DelayQueue<String>,
    timer_keys: HashMap<String, delay_queue::Key>,
    failures: HashMap<String, u32>,
}

impl WorkQueue {
    fn enqueue(&mut self, name: &str) {
        if self.in_flight.contains(name) {
            self.rerun.insert(name.to_string());
        } else if self.queued.insert(name.to_string()) {
            self.ready.push_back(name.to_string());
        }
    }

    /// Next name to hand to a worker; it counts as in flight until `finish`.
    fn start_next(&mut self) -> Option<String> {
        let name = self.ready.pop_front()?;
        self.queued.remove(&name);
        self.in_flight.insert(name.clone());
        Some(name)
    }

    /// Returns true if the name was touched while running and must go again.
    fn finish(&mut self, name: &str) -> bool {
        self.in_flight.remove(name);
        if self.rerun.remove(name) {
            self.enqueue(name);
            return true;
        }
        false
    }

    /// Arrange a pass for `name` after `delay`. An earlier pending timer is kept.
    fn schedule(&mut self, name: &str, delay: Duration) {
        let delay = delay.min(MAX_REQUEUE);
        match self.timer_keys.get(name) {
            Some(key) => {
                let when = Instant::now() + delay;
                if when < self.timers.deadline(key) {
                    self.timers.reset_at(key, when);
                }
            }
            None => {
                let key = self.timers.insert(name.to_string(), delay);
                self.timer_keys.insert(name.to_string(), key);
            }
        }
    }

    fn cancel_timer(&mut self, name: &str) {
        if let Some(key) = self.timer_keys.remove(name) {
            self.timers.remove(&key);
        }
    }

    fn fired(&mut self, name: &str) {
        self.timer_keys.remove(name);
        self.enqueue(name);
    }

    /// Record the outcome of a pass for `name`.
    fn complete(&mut self, name: &str, result: &Result<Reconciled, EngineError>) {
        match result {
            Ok(r) => {
                self.failures.remove(name);
                match (r.phase, r.requeue_after) {
                    (Phase::Gone, _) => self.cancel_timer(name),
                    (_, Some(delay)) => self.schedule(name, delay),
                    (_, None) => {}
                }
            }
            Err(EngineError::Cancelled) => {}
            Err(e) => {
                let failures = self.failures.entry(name.to_string()).or_insert(0);
                *failures += 1;
                let delay = backoff(*failures);
                warn!(
                    wish = %name,
                    error = %e,
                    failures = *failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile failed, backing off"
                );
                self.schedule(name, delay);
            }
        }
    }

    fn depth(&self) -> usize {
        self.ready.len() + self.timers.len()
    }
}

pub struct Controller {
    engine: Engine,
    max_concurrent: usize,
    call_timeout: Duration,
}

impl Controller {
    pub fn new(engine: Engine, max_concurrent: usize, call_timeout: Duration) -> Self {
        Self {
            engine,
            max_concurrent: max_concurrent.max(1),
            call_timeout,
        }
    }

    /// Run until `cancel` fires. In-flight passes are cancelled and awaited.
    pub async fn run(self, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut workers: JoinSet<(String, Result<Reconciled, EngineError>)> = JoinSet::new();
        let mut queue = WorkQueue::default();

        // Subscribe before listing so no write slips between the two.
        let mut feed = self.engine.subscribe();
        let mut resync_at = Some(Instant::now());
        let mut resync_failures = 0u32;

        info!(
            namespace = %self.engine.namespace(),
            workers = self.max_concurrent,
            "controller started"
        );

        loop {
            while let Ok(permit) = permits.clone().try_acquire_owned() {
                let Some(name) = queue.start_next() else { break };
                let engine = self.engine.clone();
                let ctx = CallContext::with_cancel(self.call_timeout, &cancel);
                workers.spawn(async move {
                    let _permit = permit;
                    let result = AssertUnwindSafe(engine.reconcile(&name, &ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            error!(wish = %name, "reconcile panicked");
                            Err(EngineError::Store(StoreError::Io("reconcile panicked".into())))
                        });
                    (name, result)
                });
            }
            metrics::gauge!(observability::QUEUE_DEPTH).set(queue.depth() as f64);
            let resync_due = resync_at.unwrap_or_else(Instant::now);

            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = tokio::time::sleep_until(resync_due), if resync_at.is_some() => {
                    resync_at = None;
                    match self.list_all(&cancel).await {
                        Ok(names) => {
                            resync_failures = 0;
                            debug!(count = names.len(), "resynced wish list");
                            for name in &names {
                                queue.enqueue(name);
                            }
                        }
                        Err(e) => {
                            resync_failures += 1;
                            let delay = backoff(resync_failures);
                            warn!(
                                error = %e,
                                retry_in_ms = delay.as_millis() as u64,
                                "listing wishes failed"
                            );
                            resync_at = Some(Instant::now() + delay);
                        }
                    }
                }

                event = feed.recv() => match event {
                    Ok(event) => queue.enqueue(event.name()),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "change feed lagged, resyncing");
                        resync_at = Some(Instant::now());
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("change feed closed, stopping controller");
                        break;
                    }
                },

                Some(expired) = queue.timers.next() => {
                    let name = expired.into_inner();
                    queue.fired(&name);
                }

                Some(joined) = workers.join_next() => match joined {
                    Ok((name, result)) => {
                        queue.complete(&name, &result);
                        queue.finish(&name);
                    }
                    Err(e) => error!(error = %e, "reconcile worker failed to join"),
                },
            }
        }

        while workers.join_next().await.is_some() {}
        info!("controller stopped");
    }

    async fn list_all(&self, cancel: &CancellationToken) -> Result<Vec<String>, EngineError> {
        let ctx = CallContext::with_cancel(self.call_timeout, cancel);
        self.engine.list_names(&ctx).await
    }
}
