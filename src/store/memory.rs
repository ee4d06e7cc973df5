use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

use super::{StoreError, WishStore, validate_wish};
use crate::model::{Event, Timestamp, Wish};
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

type Key = (String, String);

struct Slot {
    wish: Wish,
    /// Set under the write lock by `delete`; writers that raced the delete see it.
    deleted: bool,
}

type SharedSlot = Arc<RwLock<Slot>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued,
/// fsync once, answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut events = vec![event];
        let mut waiters = vec![response];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => {
                    events.push(event);
                    waiters.push(response);
                }
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(events.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = wal.append(&events);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for tx in waiters {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_rewrite());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

struct Inner {
    objects: DashMap<Key, SharedSlot>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    notify: NotifyHub,
    /// Writers hold it shared for the whole lock-persist-apply sequence;
    /// compaction holds it exclusively so its snapshot can't miss an in-flight write.
    commit_gate: RwLock<()>,
}

/// DashMap-backed wish store. Durable when opened on a WAL path, purely
/// in-memory otherwise. Cheap to clone.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn not_found(namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn is_unset(ts: &Timestamp) -> bool {
    *ts == Timestamp::default()
}

impl InMemoryStore {
    /// A volatile store with no WAL.
    pub fn new() -> Self {
        Self::with_parts(DashMap::new(), None)
    }

    /// Open a durable store, replaying the WAL at `path`. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let objects = DashMap::new();
        for event in events {
            match event {
                Event::Applied(wish) => {
                    let k = key(wish.namespace(), wish.name());
                    let slot = Slot {
                        wish,
                        deleted: false,
                    };
                    objects.insert(k, Arc::new(RwLock::new(slot)));
                }
                Event::Deleted { namespace, name } => {
                    objects.remove(&(namespace, name));
                }
            }
        }
        info!(path = %path.display(), wishes = objects.len(), "replayed wish store");
        Ok(Self::with_parts(objects, Some(wal_tx)))
    }

    fn with_parts(
        objects: DashMap<Key, SharedSlot>,
        wal_tx: Option<mpsc::Sender<WalCommand>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                objects,
                wal_tx,
                notify: NotifyHub::new(),
                commit_gate: RwLock::new(()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.objects.is_empty()
    }

    /// WAL appends since the last compaction; zero for a volatile store.
    pub async fn appends_since_compact(&self) -> u64 {
        let Some(tx) = &self.inner.wal_tx else {
            return 0;
        };
        let (response, rx) = oneshot::channel();
        if tx.send(WalCommand::AppendsSinceCompact { response }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Resolves once every write queued before the call has been flushed.
    /// The writer handles commands in order, so a round-trip is a barrier.
    pub async fn sync(&self) {
        self.appends_since_compact().await;
    }

    /// Rewrite the WAL as one record per live wish.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let Some(tx) = &self.inner.wal_tx else {
            return Ok(0);
        };
        let _gate = self.inner.commit_gate.write().await;
        let slots: Vec<SharedSlot> = self.inner.objects.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(slots.len());
        for slot in slots {
            let guard = slot.read().await;
            if !guard.deleted {
                events.push(Event::Applied(guard.wish.clone()));
            }
        }
        let count = events.len();
        let (response, rx) = oneshot::channel();
        tx.send(WalCommand::Compact { events, response })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(count)
    }

    fn slot(&self, namespace: &str, name: &str) -> Option<SharedSlot> {
        self.inner
            .objects
            .get(&key(namespace, name))
            .map(|e| e.value().clone())
    }
}

impl Inner {
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let Some(tx) = &self.wal_tx else {
            return Ok(());
        };
        let (response, rx) = oneshot::channel();
        tx.send(WalCommand::Append {
            event: event.clone(),
            response,
        })
        .await
        .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn create(&self, mut wish: Wish) -> Result<Wish, StoreError> {
        validate_wish(&wish)?;
        let _gate = self.commit_gate.read().await;

        wish.metadata.uid = Ulid::new();
        wish.metadata.resource_version = 1;
        if is_unset(&wish.metadata.creation_timestamp) {
            wish.metadata.creation_timestamp = Utc::now();
        }

        let slot = Arc::new(RwLock::new(Slot {
            wish: wish.clone(),
            deleted: false,
        }));
        // Locked before it becomes visible, so readers wait for the commit.
        let mut guard = slot.clone().try_write_owned().map_err(|_| {
            StoreError::Io("fresh slot unexpectedly locked".into())
        })?;
        {
            let k = key(wish.namespace(), wish.name());
            match self.objects.entry(k) {
                Entry::Occupied(_) => {
                    return Err(StoreError::AlreadyExists {
                        namespace: wish.metadata.namespace.clone(),
                        name: wish.metadata.name.clone(),
                    });
                }
                Entry::Vacant(v) => {
                    v.insert(slot);
                }
            }
        }

        let event = Event::Applied(wish.clone());
        if let Err(e) = self.wal_append(&event).await {
            guard.deleted = true;
            self.objects.remove(&key(wish.namespace(), wish.name()));
            return Err(e);
        }
        drop(guard);
        self.notify.send(&event);
        Ok(wish)
    }

    async fn update_status(&self, slot: SharedSlot, wish: Wish) -> Result<Wish, StoreError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = slot.write().await;
        if guard.deleted {
            return Err(not_found(wish.namespace(), wish.name()));
        }
        let current = guard.wish.metadata.resource_version;
        if current != wish.metadata.resource_version {
            return Err(StoreError::Conflict {
                name: wish.metadata.name.clone(),
                expected: wish.metadata.resource_version,
                actual: current,
            });
        }

        let mut next = guard.wish.clone();
        next.status = wish.status;
        next.metadata.resource_version = current + 1;

        let event = Event::Applied(next.clone());
        self.wal_append(&event).await?;
        guard.wish = next.clone();
        drop(guard);
        self.notify.send(&event);
        Ok(next)
    }

    async fn delete(
        &self,
        slot: SharedSlot,
        namespace: String,
        name: String,
    ) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = slot.write().await;
        if guard.deleted {
            return Err(not_found(&namespace, &name));
        }
        let event = Event::Deleted {
            namespace: namespace.clone(),
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        guard.deleted = true;
        self.objects.remove(&(namespace, name));
        drop(guard);
        self.notify.send(&event);
        Ok(())
    }
}

/// Writes run to completion on their own task, so a caller that times out or is
/// cancelled never leaves memory and the WAL disagreeing about a write.
async fn detached<T, F>(fut: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, StoreError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| StoreError::Io(format!("store write task failed: {e}")))?
}

#[async_trait]
impl WishStore for InMemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Wish, StoreError> {
        let slot = self.slot(namespace, name).ok_or_else(|| not_found(namespace, name))?;
        let guard = slot.read().await;
        if guard.deleted {
            return Err(not_found(namespace, name));
        }
        Ok(guard.wish.clone())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Wish>, StoreError> {
        let slots: Vec<SharedSlot> = self
            .inner
            .objects
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.value().clone())
            .collect();
        let mut wishes = Vec::with_capacity(slots.len());
        for slot in slots {
            let guard = slot.read().await;
            if !guard.deleted {
                wishes.push(guard.wish.clone());
            }
        }
        wishes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(wishes)
    }

    fn watch(&self, namespace: &str) -> broadcast::Receiver<Event> {
        self.inner.notify.subscribe(namespace)
    }

    async fn create(&self, wish: Wish) -> Result<Wish, StoreError> {
        let inner = self.inner.clone();
        detached(async move { inner.create(wish).await }).await
    }

    async fn update_status(&self, wish: &Wish) -> Result<Wish, StoreError> {
        let slot = self
            .slot(wish.namespace(), wish.name())
            .ok_or_else(|| not_found(wish.namespace(), wish.name()))?;
        let inner = self.inner.clone();
        let wish = wish.clone();
        detached(async move { inner.update_status(slot, wish).await }).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let slot = self.slot(namespace, name).ok_or_else(|| not_found(namespace, name))?;
        let inner = self.inner.clone();
        let (namespace, name) = (namespace.to_string(), name.to_string());
        detached(async move { inner.delete(slot, namespace, name).await }).await
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(
    store: InMemoryStore,
    threshold: u64,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(live) => info!(appends, live, "compacted wish WAL"),
            Err(e) => warn!(error = %e, "WAL compaction failed"),
        }
    }
}
