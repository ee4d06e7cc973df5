use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use super::*;
use crate::duration::GoDuration;
use crate::limits::*;
use crate::model::*;
use crate::store::{InMemoryStore, StoreError};

const NS: &str = "default";
const TIMEOUT: Duration = Duration::from_secs(5);

fn ctx() -> CallContext {
    CallContext::new(TIMEOUT)
}

fn stocked(name: &str, quantity: i32) -> Wish {
    let mut spec = WishSpec::titled(name.to_uppercase());
    spec.quantity = quantity;
    Wish::new(NS, name, spec)
}

async fn engine_with(wishes: Vec<Wish>) -> (Engine, InMemoryStore) {
    let store = InMemoryStore::new();
    for wish in wishes {
        store.create(wish).await.unwrap();
    }
    (Engine::new(Arc::new(store.clone()), NS), store)
}

fn req(quantity: i32, weeks: u32) -> ReservationRequest {
    ReservationRequest { quantity, weeks }
}

// ── Store doubles ────────────────────────────────────────

/// Lets another writer commit a one-unit reservation just before each of the
/// first `races` status writes, so those writes hit a version conflict.
struct RacingStore {
    inner: InMemoryStore,
    races: AtomicU32,
    writes: AtomicU32,
}

impl RacingStore {
    fn new(inner: InMemoryStore, races: u32) -> Self {
        Self {
            inner,
            races: AtomicU32::new(races),
            writes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl WishStore for RacingStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Wish, StoreError> {
        self.inner.get(namespace, name).await
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Wish>, StoreError> {
        self.inner.list(namespace).await
    }

    fn watch(&self, namespace: &str) -> broadcast::Receiver<Event> {
        self.inner.watch(namespace)
    }

    async fn create(&self, wish: Wish) -> Result<Wish, StoreError> {
        self.inner.create(wish).await
    }

    async fn update_status(&self, wish: &Wish) -> Result<Wish, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let raced = self
            .races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if raced {
            let mut rival = self.inner.get(wish.namespace(), wish.name()).await?;
            rival.status.reservations.push(Reservation::for_weeks(1, Utc::now(), 1));
            self.inner.update_status(&rival).await?;
        }
        self.inner.update_status(wish).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.inner.delete(namespace, name).await
    }
}

/// Store whose reads or writes are slow, or whose writes always fail with I/O errors.
struct FaultyStore {
    inner: InMemoryStore,
    read_delay: Duration,
    write_delay: Duration,
    fail_writes: bool,
}

#[async_trait]
impl WishStore for FaultyStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Wish, StoreError> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.get(namespace, name).await
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Wish>, StoreError> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.list(namespace).await
    }

    fn watch(&self, namespace: &str) -> broadcast::Receiver<Event> {
        self.inner.watch(namespace)
    }

    async fn create(&self, wish: Wish) -> Result<Wish, StoreError> {
        self.inner.create(wish).await
    }

    async fn update_status(&self, wish: &Wish) -> Result<Wish, StoreError> {
        if self.fail_writes {
            return Err(StoreError::Io("disk full".into()));
        }
        tokio::time::sleep(self.write_delay).await;
        self.inner.update_status(wish).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.inner.delete(namespace, name).await
    }
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn reserve_reduces_availability_then_rejects_excess() {
    let (engine, _) = engine_with(vec![stocked("lamp", 5)]).await;

    let before = Utc::now();
    let wish = engine.reserve("lamp", req(3, 2), &ctx()).await.unwrap();
    assert_eq!(wish.available_quantity(), 2);
    assert_eq!(wish.status.reservations.len(), 1);
    let r = &wish.status.reservations[0];
    assert_eq!(r.quantity, 3);
    assert!(r.created_at >= before);
    assert_eq!(r.expires_at - r.created_at, TimeDelta::days(14));

    let err = engine.reserve("lamp", req(3, 2), &ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::QuantityExceedsAvailable { available: 2 }));

    let stored = engine.get_wish("lamp", &ctx()).await.unwrap();
    assert_eq!(stored.total_reserved(), 3);
}

#[tokio::test]
async fn fully_reserved_wish_rejects_any_request() {
    let mut wish = stocked("bike", 2);
    wish.status.reservations = vec![Reservation::for_weeks(2, Utc::now(), 4)];
    let (engine, _) = engine_with(vec![wish]).await;

    for q in [1, 2, 3] {
        let err = engine.reserve("bike", req(q, 1), &ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::FullyReserved), "quantity {q}: {err:?}");
    }
}

#[tokio::test]
async fn expired_unswept_reservation_still_blocks() {
    let now = Utc::now();
    let mut wish = stocked("kite", 1);
    wish.status.reservations = vec![Reservation {
        quantity: 1,
        created_at: now - TimeDelta::days(8),
        expires_at: now - TimeDelta::days(1),
    }];
    let (engine, _) = engine_with(vec![wish]).await;

    let err = engine.reserve("kite", req(1, 1), &ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::FullyReserved));

    engine.reconcile("kite", &ctx()).await.unwrap();
    assert!(engine.reserve("kite", req(1, 1), &ctx()).await.is_ok());
}

#[tokio::test]
async fn reserve_zero_quantity_wish_defaults_to_one_unit() {
    let (engine, _) = engine_with(vec![stocked("book", 0)]).await;
    engine.reserve("book", req(1, 1), &ctx()).await.unwrap();
    let err = engine.reserve("book", req(1, 1), &ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::FullyReserved));
}

#[tokio::test]
async fn reserve_missing_wish_is_not_found() {
    let (engine, _) = engine_with(vec![]).await;
    let err = engine.reserve("ghost", req(1, 1), &ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(ref n) if n == "ghost"));
}

#[tokio::test]
async fn invalid_requests_rejected_before_touching_store() {
    let (engine, store) = engine_with(vec![stocked("lamp", 5)]).await;
    for (q, w) in [(1, 0), (1, MAX_WEEKS + 1), (0, 1), (-3, 1)] {
        let err = engine.reserve("lamp", req(q, w), &ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{q}/{w}: {err:?}");
    }
    let stored = store.get(NS, "lamp").await.unwrap();
    assert_eq!(stored.metadata.resource_version, 1);
    assert!(stored.status.reservations.is_empty());
}

#[tokio::test]
async fn reserve_on_inactive_wish_is_allowed() {
    let mut wish = stocked("old", 1);
    wish.spec.ttl = Some(GoDuration::from_hours(24));
    wish.metadata.creation_timestamp = Utc::now() - TimeDelta::hours(48);
    let (engine, _) = engine_with(vec![wish]).await;
    engine.reconcile("old", &ctx()).await.unwrap();
    assert!(engine.reserve("old", req(1, 1), &ctx()).await.is_ok());
}

// ── Admission under contention ───────────────────────────

#[tokio::test]
async fn conflict_retry_rechecks_capacity() {
    let inner = InMemoryStore::new();
    inner.create(stocked("lamp", 2)).await.unwrap();
    let racing = Arc::new(RacingStore::new(inner.clone(), 1));
    let engine = Engine::new(racing.clone(), NS);

    // The rival took one unit between our read and our write.
    let err = engine.reserve("lamp", req(2, 1), &ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::QuantityExceedsAvailable { available: 1 }));

    let stored = inner.get(NS, "lamp").await.unwrap();
    assert_eq!(stored.total_reserved(), 1);
}

#[tokio::test]
async fn conflict_retry_succeeds_when_capacity_remains() {
    let inner = InMemoryStore::new();
    inner.create(stocked("lamp", 5)).await.unwrap();
    let racing = Arc::new(RacingStore::new(inner.clone(), 2));
    let engine = Engine::new(racing.clone(), NS);

    let wish = engine.reserve("lamp", req(2, 1), &ctx()).await.unwrap();
    assert_eq!(wish.total_reserved(), 4);
    assert_eq!(wish.status.reservations.len(), 3);
    assert_eq!(racing.writes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn conflict_retries_are_bounded() {
    let inner = InMemoryStore::new();
    inner.create(stocked("lamp", 100)).await.unwrap();
    let racing = Arc::new(RacingStore::new(inner, u32::MAX));
    let engine = Engine::new(racing.clone(), NS);

    let err = engine.reserve("lamp", req(1, 1), &ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ref n) if n == "lamp"));
    assert_eq!(racing.writes.load(Ordering::SeqCst), MAX_ADMISSION_ATTEMPTS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_overbook() {
    let (engine, store) = engine_with(vec![stocked("lamp", 5)]).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.reserve("lamp", req(1, 1), &ctx()).await
        }));
    }

    let mut granted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => granted += 1,
            Err(EngineError::FullyReserved | EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    let stored = store.get(NS, "lamp").await.unwrap();
    assert!(granted <= 5);
    assert_eq!(stored.total_reserved(), granted as i64);
    assert_eq!(stored.status.reservations.len(), granted);
}

// ── Deadlines and cancellation ───────────────────────────

#[tokio::test]
async fn slow_store_times_out() {
    let inner = InMemoryStore::new();
    inner.create(stocked("lamp", 5)).await.unwrap();
    let engine = Engine::new(
        Arc::new(FaultyStore {
            inner: inner.clone(),
            read_delay: Duration::from_millis(500),
            write_delay: Duration::ZERO,
            fail_writes: false,
        }),
        NS,
    );

    let short = CallContext::new(Duration::from_millis(20));
    let err = engine.reserve("lamp", req(1, 1), &short).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout));

    let short = CallContext::new(Duration::from_millis(20));
    let err = engine.reconcile("lamp", &short).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout));

    let stored = inner.get(NS, "lamp").await.unwrap();
    assert_eq!(stored.metadata.resource_version, 1);
}

#[tokio::test]
async fn started_write_outlives_deadline_and_reports_commit() {
    let inner = InMemoryStore::new();
    inner.create(stocked("lamp", 5)).await.unwrap();
    let engine = Engine::new(
        Arc::new(FaultyStore {
            inner: inner.clone(),
            read_delay: Duration::ZERO,
            write_delay: Duration::from_millis(200),
            fail_writes: false,
        }),
        NS,
    );

    let short = CallContext::new(Duration::from_millis(50));
    let wish = engine.reserve("lamp", req(3, 1), &short).await.unwrap();
    assert_eq!(wish.available_quantity(), 2);
    let stored = inner.get(NS, "lamp").await.unwrap();
    assert_eq!(stored.status.reservations.len(), 1);
    assert_eq!(stored.available_quantity(), 2);

    let short = CallContext::new(Duration::from_millis(50));
    let r = engine.reconcile("lamp", &short).await.unwrap();
    assert!(r.updated);
    assert!(inner.get(NS, "lamp").await.unwrap().status.active);
}

#[tokio::test]
async fn cancel_during_write_still_reports_commit() {
    let inner = InMemoryStore::new();
    inner.create(stocked("lamp", 5)).await.unwrap();
    let engine = Engine::new(
        Arc::new(FaultyStore {
            inner: inner.clone(),
            read_delay: Duration::ZERO,
            write_delay: Duration::from_millis(200),
            fail_writes: false,
        }),
        NS,
    );

    let parent = CancellationToken::new();
    let ctx = CallContext::with_cancel(TIMEOUT, &parent);
    let canceller = {
        let parent = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            parent.cancel();
        })
    };
    let wish = engine.reserve("lamp", req(1, 1), &ctx).await.unwrap();
    canceller.await.unwrap();
    assert!(ctx.is_cancelled());
    assert_eq!(wish.status.reservations.len(), 1);
    assert_eq!(inner.get(NS, "lamp").await.unwrap().total_reserved(), 1);
}

#[tokio::test]
async fn expired_deadline_blocks_the_write() {
    let (engine, store) = engine_with(vec![stocked("lamp", 5)]).await;
    let past = CallContext::with_deadline(
        tokio::time::Instant::now() - Duration::from_millis(1),
        CancellationToken::new(),
    );
    assert!(matches!(past.check(), Err(EngineError::Timeout)));
    let err = engine.reserve("lamp", req(1, 1), &past).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout));
    assert_eq!(store.get(NS, "lamp").await.unwrap().metadata.resource_version, 1);
}

#[tokio::test]
async fn cancelled_call_surfaces_cancellation() {
    let (engine, store) = engine_with(vec![stocked("lamp", 5)]).await;
    let parent = CancellationToken::new();
    let ctx = CallContext::with_cancel(TIMEOUT, &parent);
    parent.cancel();
    assert!(ctx.is_cancelled());

    let err = engine.reserve("lamp", req(1, 1), &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    let err = engine.reconcile("lamp", &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));

    assert!(store.get(NS, "lamp").await.unwrap().status.reservations.is_empty());
}

#[tokio::test]
async fn store_io_errors_are_not_retried() {
    let inner = InMemoryStore::new();
    inner.create(stocked("lamp", 5)).await.unwrap();
    let engine = Engine::new(
        Arc::new(FaultyStore {
            inner,
            read_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
            fail_writes: true,
        }),
        NS,
    );

    let err = engine.reserve("lamp", req(1, 1), &ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::Io(_))));
    let err = engine.reconcile("lamp", &ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::Io(_))));
}

// ── Reconciliation ───────────────────────────────────────

#[tokio::test]
async fn reconcile_missing_wish_is_gone() {
    let (engine, _) = engine_with(vec![]).await;
    let r = engine.reconcile("ghost", &ctx()).await.unwrap();
    assert_eq!(r.phase, Phase::Gone);
    assert_eq!(r.requeue_after, None);
    assert!(!r.updated);
}

#[tokio::test]
async fn reconcile_sets_active_from_ttl() {
    let now = Utc::now();
    let mut expired = stocked("expired", 1);
    expired.spec.ttl = Some(GoDuration::from_hours(24));
    expired.metadata.creation_timestamp = now - TimeDelta::hours(48);
    let mut fresh = stocked("fresh", 1);
    fresh.spec.ttl = Some(GoDuration::from_hours(24));
    fresh.metadata.creation_timestamp = now - TimeDelta::hours(1);
    let mut ageless = stocked("ageless", 1);
    ageless.metadata.creation_timestamp = now - TimeDelta::days(3650);
    let (engine, store) = engine_with(vec![expired, fresh, ageless]).await;

    let r = engine.reconcile("expired", &ctx()).await.unwrap();
    assert_eq!(r.phase, Phase::Inactive);
    assert_eq!(r.requeue_after, None);
    assert!(!store.get(NS, "expired").await.unwrap().status.active);

    let r = engine.reconcile("fresh", &ctx()).await.unwrap();
    assert_eq!(r.phase, Phase::Active);
    let wake = r.requeue_after.unwrap();
    assert!(wake <= Duration::from_secs(23 * 3600) && wake > Duration::from_secs(22 * 3600));
    assert!(store.get(NS, "fresh").await.unwrap().status.active);

    let r = engine.reconcile("ageless", &ctx()).await.unwrap();
    assert_eq!(r.phase, Phase::Active);
    assert_eq!(r.requeue_after, None);
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let (engine, store) = engine_with(vec![stocked("lamp", 1)]).await;
    let first = engine.reconcile("lamp", &ctx()).await.unwrap();
    assert!(first.updated);
    let version = store.get(NS, "lamp").await.unwrap().metadata.resource_version;

    let second = engine.reconcile("lamp", &ctx()).await.unwrap();
    assert!(!second.updated);
    assert_eq!(
        store.get(NS, "lamp").await.unwrap().metadata.resource_version,
        version
    );
}

#[tokio::test]
async fn legacy_migration_runs_once() {
    let now = Utc::now();
    let mut wish = stocked("legacy", 1);
    wish.status.legacy = LegacyReservation {
        reserved: true,
        reserved_at: Some(now - TimeDelta::days(2)),
        reservation_expires: Some(now + TimeDelta::days(5)),
    };
    let (engine, store) = engine_with(vec![wish]).await;

    engine.reconcile("legacy", &ctx()).await.unwrap();
    engine.reconcile("legacy", &ctx()).await.unwrap();

    let stored = store.get(NS, "legacy").await.unwrap();
    assert_eq!(stored.status.reservations.len(), 1);
    assert_eq!(
        stored.status.reservations[0].expires_at,
        now + TimeDelta::days(5)
    );
    assert!(stored.status.legacy.is_empty());
    assert!(stored.is_fully_reserved());
}

#[tokio::test]
async fn reconcile_sweeps_and_schedules_next_expiry() {
    let now = Utc::now();
    let mut wish = stocked("lamp", 3);
    wish.status.reservations = vec![
        Reservation {
            quantity: 1,
            created_at: now - TimeDelta::days(8),
            expires_at: now - TimeDelta::days(1),
        },
        Reservation {
            quantity: 1,
            created_at: now - TimeDelta::days(1),
            expires_at: now + TimeDelta::hours(2),
        },
    ];
    let (engine, store) = engine_with(vec![wish]).await;

    let r = engine.reconcile("lamp", &ctx()).await.unwrap();
    assert!(r.updated);
    let wake = r.requeue_after.unwrap();
    assert!(wake <= Duration::from_secs(2 * 3600) && wake > Duration::from_secs(3600));

    let stored = store.get(NS, "lamp").await.unwrap();
    assert_eq!(stored.status.reservations.len(), 1);
    assert_eq!(stored.available_quantity(), 2);
    let available = stored.status.condition(CONDITION_AVAILABLE).unwrap();
    assert_eq!(available.status, ConditionStatus::True);
}

#[tokio::test]
async fn reconcile_reruns_whole_pass_on_conflict() {
    let inner = InMemoryStore::new();
    let now = Utc::now();
    let mut wish = stocked("lamp", 5);
    wish.status.reservations = vec![Reservation {
        quantity: 1,
        created_at: now - TimeDelta::days(8),
        expires_at: now - TimeDelta::days(1),
    }];
    inner.create(wish).await.unwrap();
    let racing = Arc::new(RacingStore::new(inner.clone(), 1));
    let engine = Engine::new(racing.clone(), NS);

    let r = engine.reconcile("lamp", &ctx()).await.unwrap();
    assert!(r.updated);
    // The rival's fresh reservation survives; the expired one is gone.
    let stored = inner.get(NS, "lamp").await.unwrap();
    assert_eq!(stored.status.reservations.len(), 1);
    assert!(stored.status.reservations[0].expires_at > now);
}

#[tokio::test]
async fn reconcile_conflicts_surface_after_budget() {
    let inner = InMemoryStore::new();
    inner.create(stocked("lamp", 5)).await.unwrap();
    let racing = Arc::new(RacingStore::new(inner, u32::MAX));
    let engine = Engine::new(racing.clone(), NS);

    let err = engine.reconcile("lamp", &ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(racing.writes.load(Ordering::SeqCst), MAX_RECONCILE_ATTEMPTS);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn listing_reflects_reconciled_activity() {
    let mut expired = stocked("expired", 1);
    expired.spec.ttl = Some(GoDuration::from_hours(1));
    expired.metadata.creation_timestamp = Utc::now() - TimeDelta::hours(2);
    expired.spec.tags = vec!["gone".into()];
    let mut a = stocked("a", 1);
    a.spec.priority = 1;
    a.spec.tags = vec!["books".into()];
    let mut b = stocked("b", 1);
    b.spec.priority = 4;
    let (engine, _) = engine_with(vec![expired, a, b]).await;

    assert!(engine.list_active(None, &ctx()).await.unwrap().wishes.is_empty());

    for name in engine.list_names(&ctx()).await.unwrap() {
        engine.reconcile(&name, &ctx()).await.unwrap();
    }
    let listing = engine.list_active(None, &ctx()).await.unwrap();
    let names: Vec<_> = listing.wishes.iter().map(|w| w.name()).collect();
    assert_eq!(names, vec!["b", "a"]);
    assert_eq!(listing.tags, vec!["books"]);

    let filtered = engine.list_active(Some("books"), &ctx()).await.unwrap();
    assert_eq!(filtered.wishes.len(), 1);
}

#[tokio::test]
async fn subscribe_sees_reservations() {
    let (engine, _) = engine_with(vec![stocked("lamp", 5)]).await;
    let mut rx = engine.subscribe();
    engine.reserve("lamp", req(1, 1), &ctx()).await.unwrap();
    let event = rx.recv().await.unwrap();
    assert_eq!(event.name(), "lamp");
    assert!(matches!(event, Event::Applied(ref w) if w.status.reservations.len() == 1));
}
