//! Shared snapshot cache.
//!
//! A [`RowStore`] maps object ids to the last known committed [`DataRow`] and
//! tells subscribed identity maps about changes. Subscribers receive immutable
//! [`SnapshotEvent`] batches through their own inbox and apply them when they
//! next take their lock; nothing a subscriber does while handling an event can
//! reach back into the cache's internal state.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rowgraph_core::{DataRow, Error, FaultError, FaultErrorKind, ObjectId, PersistenceState, Result, Value};

use crate::config::DomainConfig;
use crate::graph_diff::GraphDiff;
use crate::object::{ContextId, ObjectRef};

/// One batch of snapshot changes.
#[derive(Debug, Clone, Default)]
pub struct SnapshotEvent {
    /// Context whose commit produced the batch; it does not receive it back.
    pub source: ContextId,
    /// Changed columns of snapshots that were cached before the change.
    pub modified: HashMap<ObjectId, BTreeMap<String, Value>>,
    pub deleted: Vec<ObjectId>,
    pub invalidated: Vec<ObjectId>,
    /// Objects whose to-many or source-independent relationships changed.
    pub indirectly_modified: Vec<ObjectId>,
}

impl SnapshotEvent {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.indirectly_modified.is_empty()
    }
}

/// Message delivered to an identity map's inbox.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Snapshots(Arc<SnapshotEvent>),
    /// A parent context committed `diff` on behalf of `source`.
    ParentCommitted {
        source: ContextId,
        diff: Arc<GraphDiff>,
    },
}

#[derive(Debug)]
struct CachedSnapshot {
    row: DataRow,
    last_used: u64,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct SnapshotCache {
    entries: HashMap<ObjectId, CachedSnapshot>,
    tick: u64,
}

impl SnapshotCache {
    fn get(&mut self, id: &ObjectId, expiration: Duration) -> Option<DataRow> {
        self.tick += 1;
        let tick = self.tick;
        let expired = match self.entries.get_mut(id) {
            None => return None,
            Some(entry) if entry.stored_at.elapsed() > expiration => true,
            Some(entry) => {
                entry.last_used = tick;
                return Some(entry.row.clone());
            }
        };
        if expired {
            tracing::trace!(%id, "snapshot expired");
            self.entries.remove(id);
        }
        None
    }

    fn put(&mut self, id: ObjectId, row: DataRow, capacity: usize) -> Option<DataRow> {
        self.tick += 1;
        if !self.entries.contains_key(&id) && self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                tracing::trace!(id = %oldest, "evicting snapshot");
                self.entries.remove(&oldest);
            }
        }
        self.entries
            .insert(
                id,
                CachedSnapshot {
                    row,
                    last_used: self.tick,
                    stored_at: Instant::now(),
                },
            )
            .map(|e| e.row)
    }
}

/// Snapshot cache with publish/subscribe change notification.
#[derive(Debug)]
pub struct RowStore {
    name: String,
    capacity: usize,
    expiration: Duration,
    cache: Mutex<SnapshotCache>,
    subscribers: Mutex<Vec<(ContextId, Sender<StoreEvent>)>>,
}

impl RowStore {
    pub fn new(name: impl Into<String>, config: &DomainConfig) -> Self {
        Self {
            name: name.into(),
            capacity: config.snapshot_cache_size.max(1),
            expiration: config.expiration(),
            cache: Mutex::new(SnapshotCache::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, SnapshotCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.cache().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.cache().entries.clear();
    }

    pub fn get_cached_snapshot(&self, id: &ObjectId) -> Option<DataRow> {
        self.cache().get(id, self.expiration)
    }

    /// Cached snapshot, or the single row returned by `fetch`, which is then
    /// cached. Zero or several rows are a fault error.
    pub fn get_snapshot<F>(&self, id: &ObjectId, fetch: F) -> Result<DataRow>
    where
        F: FnOnce() -> Result<Vec<DataRow>>,
    {
        if let Some(row) = self.get_cached_snapshot(id) {
            return Ok(row);
        }
        let mut rows = fetch()?;
        let row = match rows.len() {
            1 => rows.remove(0),
            0 => {
                return Err(Error::Fault(FaultError {
                    object_id: id.clone(),
                    kind: FaultErrorKind::Missing,
                }));
            }
            n => {
                return Err(Error::Fault(FaultError {
                    object_id: id.clone(),
                    kind: FaultErrorKind::Ambiguous(n),
                }));
            }
        };
        self.cache().put(id.clone(), row.clone(), self.capacity);
        Ok(row)
    }

    pub fn forget_snapshot(&self, id: &ObjectId) {
        self.cache().entries.remove(id);
    }

    pub fn subscribe(&self, context: ContextId, inbox: Sender<StoreEvent>) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(id, _)| *id != context);
        subscribers.push((context, inbox));
        tracing::debug!(store = %self.name, context, "subscribed to snapshot events");
    }

    pub fn unsubscribe(&self, context: ContextId) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| *id != context);
    }

    /// Cache snapshots of freshly fetched objects. HOLLOW objects were built
    /// from partial rows and are skipped. An equal cached snapshot keeps its
    /// version and the object is restamped with it.
    pub fn snapshots_updated_for_objects(
        &self,
        source: ContextId,
        objects: &[(ObjectRef, DataRow)],
        refresh: bool,
    ) {
        let mut modified = HashMap::new();
        for (object, row) in objects {
            let (id, state) = {
                let data = object.read();
                (data.id.clone(), data.state)
            };
            if state == PersistenceState::Hollow || id.is_temporary() {
                continue;
            }
            let cached = self.get_cached_snapshot(&id);
            if !refresh && cached.is_some() {
                continue;
            }
            let mut snapshot = row.clone();
            if let Some(cached) = cached {
                if cached == snapshot {
                    object.write().snapshot_version = Some(cached.version());
                    continue;
                }
                snapshot.set_replaces_version(Some(cached.version()));
            }
            modified.insert(id, snapshot);
        }
        if !modified.is_empty() {
            self.process_snapshot_changes(source, modified, Vec::new(), Vec::new(), Vec::new());
        }
    }

    /// Apply a batch of changes and notify every subscriber but `source`.
    #[tracing::instrument(level = "debug", skip_all, fields(store = %self.name, source = source))]
    pub fn process_snapshot_changes(
        &self,
        source: ContextId,
        updated: HashMap<ObjectId, DataRow>,
        deleted: Vec<ObjectId>,
        invalidated: Vec<ObjectId>,
        indirectly_modified: Vec<ObjectId>,
    ) {
        if updated.is_empty()
            && deleted.is_empty()
            && invalidated.is_empty()
            && indirectly_modified.is_empty()
        {
            tracing::warn!("empty snapshot change batch");
            return;
        }

        let mut modified = HashMap::new();
        {
            let mut cache = self.cache();
            for id in deleted.iter().chain(&invalidated) {
                cache.entries.remove(id);
            }
            for (id, snapshot) in updated {
                let replaces = snapshot.replaces_version();
                let Some(old) = cache.put(id.clone(), snapshot.clone(), self.capacity) else {
                    continue;
                };
                if Some(old.version()) != replaces {
                    tracing::debug!(%id, old = old.version(), ?replaces, "snapshot version chain broken, forgetting");
                    cache.entries.remove(&id);
                    continue;
                }
                let diff = old.create_diff(&snapshot);
                if !diff.is_empty() {
                    modified.insert(id, diff);
                }
            }
        }

        let event = SnapshotEvent {
            source,
            modified,
            deleted,
            invalidated,
            indirectly_modified,
        };
        if event.is_empty() {
            return;
        }
        tracing::debug!(
            modified = event.modified.len(),
            deleted = event.deleted.len(),
            invalidated = event.invalidated.len(),
            indirect = event.indirectly_modified.len(),
            "posting snapshot event"
        );
        let event = Arc::new(event);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(context, inbox)| {
            *context == source || inbox.send(StoreEvent::Snapshots(Arc::clone(&event))).is_ok()
        });
    }
}
