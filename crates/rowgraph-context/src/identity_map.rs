//! Identity map and change registry of one context.
//!
//! The [`ObjectStore`] owns the `ObjectId -> ObjectRef` registry, the pending
//! [`ObjectDiff`]s and the set of committed flattened edges. All access goes
//! through a [`StoreGuard`] obtained from [`ObjectStore::lock`]; taking the
//! guard first drains the store's event inbox, so snapshot and parent-commit
//! events are applied in arrival order before any caller observes the map.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rowgraph_core::{
    DataRow, EntityDescriptor, EntityResolver, Error, IdentityErrorKind, ObjectId,
    PersistenceState, Result, Value,
};

use crate::graph_diff::{ArcId, GraphChangeHandler, GraphDiff, NodeDiff, next_diff_id};
use crate::merge::{self, MergePolicy};
use crate::object::{ContextId, ManagedObject, ObjectRef, PropertyValue};
use crate::object_diff::ObjectDiff;
use crate::row_store::{RowStore, SnapshotEvent, StoreEvent};

/// Registry of the objects of one context.
#[derive(Debug)]
pub struct ObjectStore {
    context_id: ContextId,
    resolver: Arc<EntityResolver>,
    row_store: Option<Arc<RowStore>>,
    merge_policy: RwLock<Arc<dyn MergePolicy>>,
    inbox_tx: Sender<StoreEvent>,
    inner: Mutex<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    objects: HashMap<ObjectId, ObjectRef>,
    changes: HashMap<ObjectId, ObjectDiff>,
    /// Committed flattened edges per source: (relationship, target).
    flattened_paths: HashMap<ObjectId, HashSet<(String, ObjectId)>>,
    inbox: Receiver<StoreEvent>,
}

impl ObjectStore {
    pub fn new(
        context_id: ContextId,
        resolver: Arc<EntityResolver>,
        row_store: Option<Arc<RowStore>>,
        merge_policy: Arc<dyn MergePolicy>,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::channel();
        Self {
            context_id,
            resolver,
            row_store,
            merge_policy: RwLock::new(merge_policy),
            inbox_tx,
            inner: Mutex::new(StoreInner {
                objects: HashMap::new(),
                changes: HashMap::new(),
                flattened_paths: HashMap::new(),
                inbox,
            }),
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    pub fn row_store(&self) -> Option<&Arc<RowStore>> {
        self.row_store.as_ref()
    }

    /// Sender half of the event inbox, for subscribing to a row store or a
    /// parent context.
    pub fn inbox_sender(&self) -> Sender<StoreEvent> {
        self.inbox_tx.clone()
    }

    pub fn merge_policy(&self) -> Arc<dyn MergePolicy> {
        Arc::clone(&self.merge_policy.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_merge_policy(&self, policy: Arc<dyn MergePolicy>) {
        *self.merge_policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Lock the store, applying queued events first.
    pub fn lock(&self) -> StoreGuard<'_> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard = StoreGuard { store: self, inner };
        guard.drain_events();
        guard
    }
}

/// Exclusive access to an [`ObjectStore`].
pub struct StoreGuard<'a> {
    store: &'a ObjectStore,
    inner: MutexGuard<'a, StoreInner>,
}

impl std::fmt::Debug for StoreGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreGuard")
            .field("context", &self.store.context_id)
            .field("objects", &self.inner.objects.len())
            .field("changes", &self.inner.changes.len())
            .finish()
    }
}

// ==================== Registry ====================

impl StoreGuard<'_> {
    pub(crate) fn store(&self) -> &ObjectStore {
        self.store
    }

    pub fn len(&self) -> usize {
        self.inner.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.objects.is_empty()
    }

    pub fn get_node(&self, id: &ObjectId) -> Option<ObjectRef> {
        self.inner.objects.get(id).cloned()
    }

    pub fn registered_objects(&self) -> Vec<ObjectRef> {
        self.inner.objects.values().cloned().collect()
    }

    pub fn objects_in_state(&self, state: PersistenceState) -> Vec<ObjectRef> {
        self.inner
            .objects
            .values()
            .filter(|o| o.persistence_state() == state)
            .cloned()
            .collect()
    }

    /// Register `object` under `id`. The last registration wins; a displaced
    /// instance is detached along with any diff it had.
    pub fn register_node(&mut self, id: ObjectId, object: ObjectRef) -> Result<()> {
        object.attach(self.store.context_id)?;
        object.write().id = id.clone();
        if let Some(previous) = self.inner.objects.insert(id.clone(), Arc::clone(&object)) {
            if !ManagedObject::same(&previous, &object) {
                tracing::warn!(%id, "replacing registered instance");
                self.inner.changes.remove(&id);
                previous.detach();
            }
        }
        Ok(())
    }

    /// The registered instance for `id`, or the one built by `create`.
    pub fn find_or_register(
        &mut self,
        id: &ObjectId,
        create: impl FnOnce() -> ObjectRef,
    ) -> Result<ObjectRef> {
        if let Some(existing) = self.inner.objects.get(id) {
            return Ok(Arc::clone(existing));
        }
        let object = create();
        self.register_node(id.clone(), Arc::clone(&object))?;
        Ok(object)
    }

    pub fn unregister_node(&mut self, id: &ObjectId) -> Option<ObjectRef> {
        self.unregister_objects(std::slice::from_ref(id)).pop()
    }

    /// Remove objects and their diffs, make them TRANSIENT and drop their
    /// snapshots from the shared cache.
    pub fn unregister_objects(&mut self, ids: &[ObjectId]) -> Vec<ObjectRef> {
        let mut removed = Vec::new();
        let mut invalidated = Vec::new();
        for id in ids {
            self.inner.changes.remove(id);
            self.inner.flattened_paths.remove(id);
            if let Some(object) = self.inner.objects.remove(id) {
                object.detach();
                if !id.is_temporary() {
                    invalidated.push(id.clone());
                }
                removed.push(object);
            }
        }
        if let (Some(row_store), false) = (&self.store.row_store, invalidated.is_empty()) {
            row_store.process_snapshot_changes(
                self.store.context_id,
                HashMap::new(),
                Vec::new(),
                invalidated,
                Vec::new(),
            );
        }
        removed
    }

    /// Turn COMMITTED and MODIFIED objects HOLLOW, dropping their diffs and
    /// cached snapshots. Other contexts are told to do the same.
    pub fn invalidate_objects(&mut self, ids: &[ObjectId]) {
        let mut invalidated = Vec::new();
        for id in ids {
            let Some(object) = self.inner.objects.get(id).cloned() else {
                continue;
            };
            match object.persistence_state() {
                PersistenceState::Committed
                | PersistenceState::Modified
                | PersistenceState::Deleted => {
                    self.inner.changes.remove(id);
                    object.make_hollow();
                    invalidated.push(id.clone());
                }
                PersistenceState::Hollow => invalidated.push(id.clone()),
                _ => {}
            }
        }
        tracing::debug!(count = invalidated.len(), "invalidated objects");
        if let (Some(row_store), false) = (&self.store.row_store, invalidated.is_empty()) {
            row_store.process_snapshot_changes(
                self.store.context_id,
                HashMap::new(),
                Vec::new(),
                invalidated,
                Vec::new(),
            );
        }
    }

    pub(crate) fn descriptor_of(&self, object: &ManagedObject) -> Result<Arc<EntityDescriptor>> {
        self.store.resolver.get(&object.entity_name())
    }
}

// ==================== Change tracking ====================

impl StoreGuard<'_> {
    pub fn has_changes(&self) -> bool {
        !self.inner.changes.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.inner.changes.len()
    }

    pub(crate) fn diff_for_mut(&mut self, id: &ObjectId) -> Option<&mut ObjectDiff> {
        self.inner.changes.get_mut(id)
    }

    /// Record `diff` against the object `id`. The first diff of a COMMITTED
    /// object makes it MODIFIED, after merging in a newer cached snapshot if
    /// one exists. A complementary foreign key operation produced for a
    /// relationship without a mapped reverse is registered on its target.
    pub fn register_diff(&mut self, id: &ObjectId, mut diff: NodeDiff) -> Result<()> {
        diff.set_diff_id(next_diff_id());
        self.touch(id)?;
        let complementary = match self.inner.changes.get_mut(id) {
            Some(object_diff) => object_diff.add_diff(diff)?,
            None => None,
        };
        if let Some(op) = complementary {
            let target = op.node().clone();
            self.register_diff(&target, op)?;
        }
        Ok(())
    }

    /// Start tracking `id` without recording an operation. Called before an
    /// attribute write so the baseline holds the value being replaced.
    pub fn touch(&mut self, id: &ObjectId) -> Result<()> {
        if !self.inner.changes.contains_key(id) {
            let object = self.inner.objects.get(id).cloned().ok_or_else(|| {
                Error::identity(
                    IdentityErrorKind::NotRegistered,
                    format!("{} is not registered with context {}", id, self.store.context_id),
                )
            })?;
            let descriptor = self.descriptor_of(&object)?;
            if object.persistence_state() == PersistenceState::Committed {
                object.set_state(PersistenceState::Modified);
                self.merge_newer_snapshot(id, &object, &descriptor);
            }
            let object_diff = ObjectDiff::new(object, descriptor, next_diff_id());
            self.inner.changes.insert(id.clone(), object_diff);
        }
        Ok(())
    }

    /// Bring a freshly dirtied object up to the cached snapshot if another
    /// context committed a newer version since it was loaded.
    fn merge_newer_snapshot(&self, id: &ObjectId, object: &ManagedObject, descriptor: &EntityDescriptor) {
        let Some(row_store) = &self.store.row_store else {
            return;
        };
        let Some(snapshot) = row_store.get_cached_snapshot(id) else {
            return;
        };
        if object.snapshot_version() == Some(snapshot.version()) {
            return;
        }
        let policy = self.store.merge_policy();
        if policy.should_merge_changes(object, Some(&snapshot)) {
            tracing::debug!(%id, version = snapshot.version(), "merging newer snapshot before first change");
            merge::force_merge_with_snapshot(&self.store.resolver, descriptor, object, &snapshot, None);
            object.write().snapshot_version = Some(snapshot.version());
            policy.finished_merge_changes(object);
        }
    }

    /// Aggregate diff of every pending change: explicit operations in
    /// registration order, then attribute changes per object.
    pub fn changes(&self) -> GraphDiff {
        let mut deltas = Vec::new();
        for object_diff in self.inner.changes.values() {
            object_diff.append_deltas(&mut deltas);
        }
        deltas.retain(|d| !self.is_redundant_flattened_create(d));
        deltas.sort_by_key(NodeDiff::diff_id);

        let mut ordered: Vec<&ObjectDiff> = self.inner.changes.values().collect();
        ordered.sort_by_key(|d| d.diff_id());
        let mut attributes = Vec::new();
        for object_diff in ordered {
            object_diff.append_attribute_changes(&mut attributes);
        }

        let mut diff = GraphDiff::from_diffs(deltas);
        diff.extend(GraphDiff::from_diffs(attributes));
        diff
    }

    fn is_redundant_flattened_create(&self, diff: &NodeDiff) -> bool {
        match diff {
            NodeDiff::ArcCreated {
                node,
                target,
                arc: ArcId::Property(rel),
                ..
            } => self.is_flattened_path(node, rel, target),
            _ => false,
        }
    }

    /// True when no pending diff would change anything downstream.
    pub fn is_noop(&self) -> bool {
        self.inner.changes.values().all(ObjectDiff::is_noop)
    }

    pub fn dirty_objects(&self) -> Vec<ObjectRef> {
        self.inner
            .changes
            .values()
            .map(|d| Arc::clone(d.object()))
            .collect()
    }

    // -------------------- Flattened paths --------------------

    pub fn mark_flattened_path(&mut self, source: &ObjectId, relationship: &str, target: &ObjectId) {
        self.inner
            .flattened_paths
            .entry(source.clone())
            .or_default()
            .insert((relationship.to_string(), target.clone()));
    }

    pub fn unmark_flattened_path(&mut self, source: &ObjectId, relationship: &str, target: &ObjectId) {
        if let Some(paths) = self.inner.flattened_paths.get_mut(source) {
            paths.remove(&(relationship.to_string(), target.clone()));
            if paths.is_empty() {
                self.inner.flattened_paths.remove(source);
            }
        }
    }

    pub fn is_flattened_path(&self, source: &ObjectId, relationship: &str, target: &ObjectId) -> bool {
        self.inner
            .flattened_paths
            .get(source)
            .is_some_and(|p| p.contains(&(relationship.to_string(), target.clone())))
    }
}

// ==================== Commit and rollback ====================

impl StoreGuard<'_> {
    /// Settle local state after a successful commit: DELETED objects leave
    /// the map, NEW and MODIFIED become COMMITTED, flattened marks follow the
    /// committed link operations and temporary ids are replaced.
    #[tracing::instrument(level = "debug", skip_all, fields(context = self.store.context_id))]
    pub fn postprocess_after_commit(&mut self, reply: &GraphDiff) {
        let changes = std::mem::take(&mut self.inner.changes);
        let mut committed = Vec::new();
        for (id, object_diff) in &changes {
            let object = object_diff.object();
            match object.persistence_state() {
                PersistenceState::Deleted => {
                    self.inner.objects.remove(id);
                    self.inner.flattened_paths.remove(id);
                    object.detach();
                    continue;
                }
                PersistenceState::New | PersistenceState::Modified => {
                    object.set_state(PersistenceState::Committed);
                    committed.push(Arc::clone(object));
                }
                _ => {}
            }
            for (rel, target) in object_diff.flattened_creates() {
                self.mark_flattened_path(id, rel, target);
            }
            for (rel, target) in object_diff.flattened_deletes() {
                self.unmark_flattened_path(id, rel, target);
            }
        }

        let id_changes: Vec<(ObjectId, ObjectId)> = reply
            .id_changes()
            .map(|(old, new)| (old.clone(), new.clone()))
            .collect();
        self.process_id_changes(&id_changes);

        if let Some(row_store) = &self.store.row_store {
            for object in &committed {
                let id = object.object_id();
                if let Some(snapshot) = row_store.get_cached_snapshot(&id) {
                    object.write().snapshot_version = Some(snapshot.version());
                }
            }
        }
        tracing::debug!(committed = committed.len(), ids = id_changes.len(), "commit postprocessed");
    }

    /// Commit shortcut for a change set that turned out to be a no-op.
    pub fn postprocess_after_phantom_commit(&mut self) {
        let changes = std::mem::take(&mut self.inner.changes);
        for object_diff in changes.values() {
            let object = object_diff.object();
            if object.persistence_state() == PersistenceState::Modified {
                object.set_state(PersistenceState::Committed);
            }
        }
        tracing::debug!(count = changes.len(), "phantom commit");
    }

    /// Discard every pending change. NEW objects are unregistered, MODIFIED
    /// and DELETED objects are turned HOLLOW to be reloaded on next access.
    pub fn rollback(&mut self) -> Vec<ObjectRef> {
        let changes = std::mem::take(&mut self.inner.changes);
        let mut touched = Vec::with_capacity(changes.len());
        for (id, object_diff) in changes {
            let object = Arc::clone(object_diff.object());
            match object.persistence_state() {
                PersistenceState::New => {
                    self.inner.objects.remove(&id);
                    self.inner.flattened_paths.remove(&id);
                    object.detach();
                }
                PersistenceState::Modified | PersistenceState::Deleted => object.make_hollow(),
                _ => {}
            }
            touched.push(object);
        }
        tracing::debug!(count = touched.len(), "rolled back changes");
        touched
    }

    /// Re-key objects, diffs and flattened marks, and rewrite every reference.
    pub fn process_id_changes(&mut self, changes: &[(ObjectId, ObjectId)]) {
        if changes.is_empty() {
            return;
        }
        let inner = &mut *self.inner;
        for (old, new) in changes {
            if let Some(object) = inner.objects.remove(old) {
                object.write().id = new.clone();
                inner.objects.insert(new.clone(), object);
            }
            if let Some(object_diff) = inner.changes.remove(old) {
                inner.changes.insert(new.clone(), object_diff);
            }
            if let Some(paths) = inner.flattened_paths.remove(old) {
                inner.flattened_paths.insert(new.clone(), paths);
            }
        }
        for object in inner.objects.values() {
            let mut data = object.write();
            for (old, new) in changes {
                data.rewrite_references(old, new);
            }
        }
        for object_diff in inner.changes.values_mut() {
            for (old, new) in changes {
                object_diff.rewrite_id(old, new);
            }
        }
        for paths in inner.flattened_paths.values_mut() {
            if paths.iter().any(|(_, t)| changes.iter().any(|(old, _)| old == t)) {
                *paths = std::mem::take(paths)
                    .into_iter()
                    .map(|(rel, target)| {
                        match changes.iter().find(|(old, _)| *old == target) {
                            Some((_, new)) => (rel, new.clone()),
                            None => (rel, target),
                        }
                    })
                    .collect();
            }
        }
        tracing::trace!(count = changes.len(), "object ids replaced");
    }
}

// ==================== Event processing ====================

impl StoreGuard<'_> {
    fn drain_events(&mut self) {
        while let Ok(event) = self.inner.inbox.try_recv() {
            match event {
                StoreEvent::Snapshots(event) => self.process_snapshot_event(&event),
                StoreEvent::ParentCommitted { source, diff } => {
                    self.process_parent_commit(source, &diff);
                }
            }
        }
    }

    /// Merge a batch of shared-cache changes produced by another context.
    #[tracing::instrument(level = "debug", skip_all, fields(context = self.store.context_id, source = event.source))]
    pub fn process_snapshot_event(&mut self, event: &SnapshotEvent) {
        if event.source == self.store.context_id {
            return;
        }
        let policy = self.store.merge_policy();
        for (id, columns) in &event.modified {
            let row = columns
                .iter()
                .fold(DataRow::new(), |row, (column, value)| row.with(column.clone(), value.clone()));
            self.process_updated_snapshot(policy.as_ref(), id, &row);
        }
        for id in &event.deleted {
            self.process_deleted_snapshot(policy.as_ref(), id);
        }
        for id in &event.invalidated {
            self.process_invalidated_snapshot(policy.as_ref(), id);
        }
        for id in &event.indirectly_modified {
            self.process_indirect_update(policy.as_ref(), id);
        }
    }

    fn process_updated_snapshot(&mut self, policy: &dyn MergePolicy, id: &ObjectId, changes: &DataRow) {
        let Some(object) = self.inner.objects.get(id).cloned() else {
            tracing::trace!(%id, "snapshot change for unknown object");
            return;
        };
        let Ok(descriptor) = self.descriptor_of(&object) else {
            return;
        };
        match object.persistence_state() {
            PersistenceState::Committed => {
                if !policy.should_merge_changes(&object, Some(changes)) {
                    return;
                }
                let cached = self
                    .store
                    .row_store
                    .as_ref()
                    .and_then(|rs| rs.get_cached_snapshot(id));
                match cached {
                    Some(snapshot) => merge::refresh_object_with_snapshot(
                        &self.store.resolver,
                        &descriptor,
                        &object,
                        &snapshot,
                        true,
                    ),
                    None => object.make_hollow(),
                }
                policy.finished_merge_changes(&object);
            }
            PersistenceState::Modified | PersistenceState::Deleted => {
                if !policy.should_merge_changes(&object, Some(changes)) {
                    return;
                }
                let object_diff = self.inner.changes.get_mut(id);
                merge::force_merge_with_snapshot(
                    &self.store.resolver,
                    &descriptor,
                    &object,
                    changes,
                    object_diff,
                );
                policy.finished_merge_changes(&object);
            }
            _ => {}
        }
    }

    fn process_deleted_snapshot(&mut self, policy: &dyn MergePolicy, id: &ObjectId) {
        let Some(object) = self.inner.objects.get(id).cloned() else {
            return;
        };
        match object.persistence_state() {
            PersistenceState::Committed | PersistenceState::Hollow | PersistenceState::Deleted => {
                if policy.should_process_delete(&object) {
                    self.inner.objects.remove(id);
                    self.inner.changes.remove(id);
                    self.inner.flattened_paths.remove(id);
                    object.detach();
                    policy.finished_process_delete(&object);
                }
            }
            PersistenceState::Modified => {
                if policy.should_process_delete(&object) {
                    tracing::debug!(%id, "row deleted elsewhere, re-inserting local edits");
                    if let Err(e) = self.reinsert_as_new(id, &object) {
                        tracing::warn!(%id, error = %e, "could not convert deleted object to NEW");
                    }
                    policy.finished_process_delete(&object);
                }
            }
            _ => {}
        }
    }

    /// A MODIFIED object whose row disappeared becomes NEW so that its local
    /// state is inserted again at the next commit.
    fn reinsert_as_new(&mut self, id: &ObjectId, object: &ObjectRef) -> Result<()> {
        self.inner.changes.remove(id);
        self.inner.flattened_paths.remove(id);
        object.set_state(PersistenceState::New);
        let descriptor = self.descriptor_of(object)?;
        self.register_diff(
            id,
            NodeDiff::NodeCreated {
                diff_id: 0,
                node: id.clone(),
                entity: object.entity_name(),
            },
        )?;
        let to_ones: Vec<(String, ObjectId)> = {
            let data = object.read();
            descriptor
                .relationships
                .iter()
                .filter(|r| !r.is_to_many())
                .filter_map(|r| data.to_one(&r.name).flatten().map(|t| (r.name.clone(), t.clone())))
                .collect()
        };
        for (rel, target) in to_ones {
            let arc = NodeDiff::ArcCreated {
                diff_id: 0,
                node: id.clone(),
                target,
                arc: ArcId::property(rel),
            };
            self.register_diff(id, arc)?;
        }
        if let Some(object_diff) = self.inner.changes.get_mut(id) {
            object_diff.reset_as_new();
        }
        Ok(())
    }

    fn process_invalidated_snapshot(&mut self, policy: &dyn MergePolicy, id: &ObjectId) {
        let Some(object) = self.inner.objects.get(id).cloned() else {
            return;
        };
        match object.persistence_state() {
            PersistenceState::Committed => object.make_hollow(),
            PersistenceState::Modified => {
                if !policy.should_merge_changes(&object, None) {
                    return;
                }
                let cached = self
                    .store
                    .row_store
                    .as_ref()
                    .and_then(|rs| rs.get_cached_snapshot(id));
                match (cached, self.descriptor_of(&object)) {
                    (Some(snapshot), Ok(descriptor)) => {
                        let object_diff = self.inner.changes.get_mut(id);
                        merge::force_merge_with_snapshot(
                            &self.store.resolver,
                            &descriptor,
                            &object,
                            &snapshot,
                            object_diff,
                        );
                        object.write().snapshot_version = Some(snapshot.version());
                    }
                    _ => object.write().snapshot_version = None,
                }
                policy.finished_merge_changes(&object);
            }
            _ => {}
        }
    }

    fn process_indirect_update(&mut self, policy: &dyn MergePolicy, id: &ObjectId) {
        let Some(object) = self.inner.objects.get(id).cloned() else {
            return;
        };
        if object.persistence_state() != PersistenceState::Committed
            || !policy.should_merge_changes(&object, None)
        {
            return;
        }
        let Ok(descriptor) = self.descriptor_of(&object) else {
            return;
        };
        {
            let mut data = object.write();
            for rel in &descriptor.relationships {
                if rel.is_to_many() || rel.is_source_independent_from_target_change() {
                    data.values.insert(rel.name.clone(), PropertyValue::Fault);
                }
            }
        }
        policy.finished_merge_changes(&object);
    }

    /// Replay a diff committed by the parent on behalf of a sibling context.
    #[tracing::instrument(level = "debug", skip_all, fields(context = self.store.context_id, source = source))]
    pub fn process_parent_commit(&mut self, source: ContextId, diff: &GraphDiff) {
        if source == self.store.context_id {
            return;
        }
        let id_changes: Vec<(ObjectId, ObjectId)> = diff
            .id_changes()
            .map(|(old, new)| (old.clone(), new.clone()))
            .collect();
        self.process_id_changes(&id_changes);
        let mut merger = ParentChangeMerger { guard: self };
        diff.apply(&mut merger);
    }
}

/// Applies sibling changes to COMMITTED objects, and to MODIFIED objects
/// for values that were not changed locally.
struct ParentChangeMerger<'g, 'a> {
    guard: &'g mut StoreGuard<'a>,
}

impl ParentChangeMerger<'_, '_> {
    fn mergeable(&self, node: &ObjectId) -> Option<ObjectRef> {
        self.guard
            .inner
            .objects
            .get(node)
            .filter(|o| o.persistence_state() == PersistenceState::Committed)
            .cloned()
    }

    fn relationship_kind(&self, object: &ManagedObject, arc: &ArcId) -> Option<(String, bool)> {
        let name = arc.as_property()?;
        let descriptor = self.guard.descriptor_of(object).ok()?;
        let rel = descriptor.relationships.iter().find(|r| r.name == name)?;
        Some((rel.name.clone(), rel.is_to_many()))
    }
}

impl GraphChangeHandler for ParentChangeMerger<'_, '_> {
    fn node_removed(&mut self, node: &ObjectId) {
        let Some(object) = self.guard.inner.objects.get(node).cloned() else {
            return;
        };
        if matches!(
            object.persistence_state(),
            PersistenceState::Committed | PersistenceState::Hollow
        ) {
            self.guard.inner.objects.remove(node);
            self.guard.inner.flattened_paths.remove(node);
            object.detach();
        }
    }

    fn node_property_changed(&mut self, node: &ObjectId, property: &str, old: &Value, new: &Value) {
        let Some(object) = self.guard.inner.objects.get(node).cloned() else {
            return;
        };
        match object.persistence_state() {
            PersistenceState::Committed => {
                object
                    .write()
                    .values
                    .insert(property.to_string(), PropertyValue::Attribute(new.clone()));
            }
            PersistenceState::Modified => {
                let unchanged = object.read().attribute(property).unwrap_or(&Value::Null) == old;
                if unchanged {
                    object
                        .write()
                        .values
                        .insert(property.to_string(), PropertyValue::Attribute(new.clone()));
                    if let Some(object_diff) = self.guard.inner.changes.get_mut(node) {
                        object_diff.set_snapshot_value(property, new.clone());
                    }
                }
            }
            _ => {}
        }
    }

    fn arc_created(&mut self, node: &ObjectId, target: &ObjectId, arc: &ArcId) {
        let Some(object) = self.mergeable(node) else {
            return;
        };
        let Some((name, to_many)) = self.relationship_kind(&object, arc) else {
            return;
        };
        let mut data = object.write();
        if to_many {
            if let Some(PropertyValue::ToMany(list)) = data.values.get_mut(&name) {
                if !list.contains(target) {
                    list.push(target.clone());
                }
            }
        } else {
            data.values.insert(name, PropertyValue::ToOne(Some(target.clone())));
        }
    }

    fn arc_deleted(&mut self, node: &ObjectId, target: &ObjectId, arc: &ArcId) {
        let Some(object) = self.mergeable(node) else {
            return;
        };
        let Some((name, to_many)) = self.relationship_kind(&object, arc) else {
            return;
        };
        let mut data = object.write();
        match data.values.get_mut(&name) {
            Some(PropertyValue::ToMany(list)) if to_many => list.retain(|t| t != target),
            Some(PropertyValue::ToOne(current)) if current.as_ref() == Some(target) => {
                *current = None;
            }
            _ => {}
        }
    }
}
