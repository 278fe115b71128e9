//! Object contexts.
//!
//! A [`DataContext`] is the unit of work applications talk to. It owns an
//! identity map, resolves faults through its parent channel, records every
//! change as graph operations and commits them as one [`GraphDiff`].
//!
//! A context is itself a [`DataChannel`]: child contexts created with
//! [`DataContext::create_child_context`] read through it, see its
//! uncommitted state, and push their changes into it on commit.
//!
//! # Locking
//!
//! Every operation takes the context's store lock for its whole duration,
//! including selects issued to resolve faults. A child calls into its parent
//! while holding its own lock, so locks are always taken child first, then
//! parent, then the shared row store. Callbacks, listeners and child
//! notifications run after the store lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rowgraph_core::{
    DataRow, EntityDescriptor, EntityResolver, Error, FaultError, FaultErrorKind,
    IdentityErrorKind, MappingErrorKind, ObjectId, PersistenceState, Property, QueryError,
    RelationshipInfo, RelationshipKind, Result, StateError, ValidationError, Value,
};

use crate::channel::{DataChannel, RowSelect, SyncType, related_qualifier};
use crate::config::ContextConfig;
use crate::delete_action::DeleteAction;
use crate::graph_diff::{ArcId, GraphChangeHandler, GraphDiff, NodeDiff};
use crate::hierarchical::HierarchicalResolver;
use crate::identity_map::{ObjectStore, StoreGuard};
use crate::merge::{self, MergePolicy};
use crate::object::{ContextId, ManagedObject, ObjectRef, PropertyValue, next_context_id};
use crate::query::{QueryResponse, ResultCell, ResultColumn, ResultRow, SelectQuery};
use crate::resolver::ObjectResolver;
use crate::row_store::{RowStore, StoreEvent};

// ============================================================================
// Context Events
// ============================================================================

type ContextEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Callbacks registered per lifecycle event.
#[derive(Default)]
struct ContextEventCallbacks {
    before_commit: Vec<ContextEventFn>,
    after_commit: Vec<ContextEventFn>,
    after_rollback: Vec<ContextEventFn>,
}

impl std::fmt::Debug for ContextEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEventCallbacks")
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl ContextEventCallbacks {
    fn fire(&mut self, event: ContextEvent) -> Result<()> {
        let callbacks = match event {
            ContextEvent::BeforeCommit => &mut self.before_commit,
            ContextEvent::AfterCommit => &mut self.after_commit,
            ContextEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Context lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// Fired before changes are validated and sent to the parent. An error
    /// aborts the commit.
    BeforeCommit,
    /// Fired after a commit completed, including one with nothing to do.
    AfterCommit,
    /// Fired after local changes were discarded.
    AfterRollback,
}

/// Changes a context committed.
#[derive(Debug, Clone)]
pub struct GraphEvent {
    /// Context the changes originated from.
    pub source: ContextId,
    /// Committed operations followed by the id replacements.
    pub diff: Arc<GraphDiff>,
}

/// Observer of committed changes.
pub type CommitListener = Box<dyn Fn(&GraphEvent) + Send + Sync>;

/// Extra commit-time check of one object; failures are added to the error.
pub type Validator = Box<dyn Fn(&ObjectRef, &mut ValidationError) + Send + Sync>;

// ============================================================================
// DataContext
// ============================================================================

/// An object context.
pub struct DataContext {
    id: ContextId,
    channel: Arc<dyn DataChannel>,
    store: ObjectStore,
    config: ContextConfig,
    /// Inboxes of child contexts.
    children: Mutex<Vec<(ContextId, Sender<StoreEvent>)>>,
    callbacks: Mutex<ContextEventCallbacks>,
    /// Validators per entity; they also apply to sub-entities.
    validators: Mutex<HashMap<String, Vec<Validator>>>,
    listeners: Mutex<Vec<CommitListener>>,
    /// Held across a commit, including a child diff applied just before it.
    commit_lock: Mutex<()>,
}

impl std::fmt::Debug for DataContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContext")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("store", &self.store)
            .field("callbacks", &*self.callbacks())
            .finish_non_exhaustive()
    }
}

impl DataContext {
    /// Create a context on top of `channel`.
    pub fn new(channel: Arc<dyn DataChannel>, config: ContextConfig) -> Arc<Self> {
        let id = next_context_id();
        let row_store = channel.row_store_for(id);
        let store = ObjectStore::new(
            id,
            Arc::clone(channel.entity_resolver()),
            row_store.clone(),
            merge::policy_for(config.merge_policy),
        );
        if config.subscribe_to_snapshot_events {
            if let Some(row_store) = &row_store {
                row_store.subscribe(id, store.inbox_sender());
            }
        }
        channel.subscribe(id, store.inbox_sender());
        tracing::debug!(context = id, cached = row_store.is_some(), "context created");
        Arc::new(Self {
            id,
            channel,
            store,
            config,
            children: Mutex::new(Vec::new()),
            callbacks: Mutex::new(ContextEventCallbacks::default()),
            validators: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            commit_lock: Mutex::new(()),
        })
    }

    /// A child context with the same configuration. Its changes reach this
    /// context on [`commit_changes_to_parent`](Self::commit_changes_to_parent)
    /// and the data source on [`commit_changes`](Self::commit_changes).
    pub fn create_child_context(self: &Arc<Self>) -> Arc<DataContext> {
        self.create_child_context_with(self.config.clone())
    }

    pub fn create_child_context_with(self: &Arc<Self>, config: ContextConfig) -> Arc<DataContext> {
        let channel: Arc<dyn DataChannel> = Arc::clone(self) as Arc<dyn DataChannel>;
        DataContext::new(channel, config)
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }

    pub fn entity_resolver(&self) -> &Arc<EntityResolver> {
        self.store.resolver()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    /// Snapshot cache of this context; `None` for child contexts.
    pub fn row_store(&self) -> Option<&Arc<RowStore>> {
        self.store.row_store()
    }

    pub fn set_merge_policy(&self, policy: Arc<dyn MergePolicy>) {
        self.store.set_merge_policy(policy);
    }

    // ==================== Events ====================

    fn callbacks(&self) -> MutexGuard<'_, ContextEventCallbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback run before every commit. Callbacks must not call
    /// back into this context's commit or rollback.
    pub fn on_before_commit(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks().before_commit.push(Box::new(f));
    }

    pub fn on_after_commit(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks().after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks().after_rollback.push(Box::new(f));
    }

    /// Observe every successful commit of this context.
    pub fn add_commit_listener(&self, listener: impl Fn(&GraphEvent) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Run `validator` on every NEW or MODIFIED object of `entity` (or one of
    /// its sub-entities) before commit. Validators run under the store lock
    /// and must not call into the context.
    pub fn add_validator(
        &self,
        entity: impl Into<String>,
        validator: impl Fn(&ObjectRef, &mut ValidationError) + Send + Sync + 'static,
    ) {
        self.validators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity.into())
            .or_default()
            .push(Box::new(validator));
    }

    fn fire_listeners(&self, event: &GraphEvent) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(event);
        }
    }

    fn notify_children(&self, event: &GraphEvent) {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.retain(|(child, inbox)| {
            let delivered = inbox
                .send(StoreEvent::ParentCommitted {
                    source: event.source,
                    diff: Arc::clone(&event.diff),
                })
                .is_ok();
            if !delivered {
                tracing::debug!(child, "dropping closed child inbox");
            }
            delivered
        });
    }

    // ==================== Registry ====================

    /// The registered instance for `id`, without fetching.
    pub fn get_object(&self, id: &ObjectId) -> Option<ObjectRef> {
        self.store.lock().get_node(id)
    }

    pub fn registered_objects(&self) -> Vec<ObjectRef> {
        self.store.lock().registered_objects()
    }

    pub fn has_changes(&self) -> bool {
        self.store.lock().has_changes()
    }

    pub fn new_objects(&self) -> Vec<ObjectRef> {
        self.store.lock().objects_in_state(PersistenceState::New)
    }

    pub fn modified_objects(&self) -> Vec<ObjectRef> {
        self.store.lock().objects_in_state(PersistenceState::Modified)
    }

    pub fn deleted_objects(&self) -> Vec<ObjectRef> {
        self.store.lock().objects_in_state(PersistenceState::Deleted)
    }

    /// Every object with pending changes.
    pub fn uncommitted_objects(&self) -> Vec<ObjectRef> {
        self.store.lock().dirty_objects()
    }

    /// This context's instance of an object of another context. Nothing is
    /// fetched: the local copy starts HOLLOW and faults on first access,
    /// reading through the parent when `object` belongs to it.
    pub fn local_object(&self, object: &ObjectRef) -> Result<ObjectRef> {
        if object.context_id() == Some(self.id) {
            return Ok(Arc::clone(object));
        }
        let id = object.object_id();
        let entity = object.entity_name();
        let mut guard = self.store.lock();
        guard.find_or_register(&id, || {
            ManagedObject::new(entity, id.clone(), PersistenceState::Hollow)
        })
    }

    /// Drop objects from this context. They become TRANSIENT and their
    /// pending changes are discarded.
    pub fn unregister_objects(&self, objects: &[ObjectRef]) -> Result<()> {
        let ids = self.owned_ids(objects)?;
        self.store.lock().unregister_objects(&ids);
        Ok(())
    }

    /// Turn objects HOLLOW so the next access refetches them. Local changes
    /// are discarded and other contexts sharing the cache are told too.
    pub fn invalidate_objects(&self, objects: &[ObjectRef]) -> Result<()> {
        let ids = self.owned_ids(objects)?;
        self.store.lock().invalidate_objects(&ids);
        Ok(())
    }

    fn owned_ids(&self, objects: &[ObjectRef]) -> Result<Vec<ObjectId>> {
        objects
            .iter()
            .map(|o| self.ensure_registered(o).map(|()| o.object_id()))
            .collect()
    }

    fn ensure_registered(&self, object: &ManagedObject) -> Result<()> {
        match object.context_id() {
            Some(id) if id == self.id => Ok(()),
            Some(other) => Err(Error::identity(
                IdentityErrorKind::ForeignContext,
                format!(
                    "{} belongs to context {}, not {}",
                    object.object_id(),
                    other,
                    self.id
                ),
            )),
            None => Err(Error::identity(
                IdentityErrorKind::NotRegistered,
                format!("{} is not registered with any context", object.object_id()),
            )),
        }
    }

    // ==================== Object lifecycle ====================

    /// Register a NEW object of `entity` under a temporary id.
    #[tracing::instrument(level = "debug", skip(self), fields(context = self.id))]
    pub fn new_object(&self, entity: &str) -> Result<ObjectRef> {
        let resolver = self.entity_resolver();
        let descriptor = resolver.get(entity)?;
        let id = ObjectId::temporary(resolver.id_entity_name(entity));
        let object = ManagedObject::new(descriptor.name.clone(), id.clone(), PersistenceState::New);
        init_new_values(&descriptor, &object);

        let mut guard = self.store.lock();
        guard.register_node(id.clone(), Arc::clone(&object))?;
        guard.register_diff(
            &id,
            NodeDiff::NodeCreated {
                diff_id: 0,
                node: id.clone(),
                entity: descriptor.name.clone(),
            },
        )?;
        Ok(object)
    }

    /// Delete one object, applying the delete rules of its relationships.
    pub fn delete_object(&self, object: &ObjectRef) -> Result<()> {
        self.delete_objects(std::slice::from_ref(object))
    }

    /// Delete objects, applying delete rules. A DENY rule with related
    /// objects fails before the denied object is changed. TRANSIENT and
    /// already DELETED objects are skipped.
    #[tracing::instrument(level = "debug", skip_all, fields(context = self.id, count = objects.len()))]
    pub fn delete_objects(&self, objects: &[ObjectRef]) -> Result<()> {
        for object in objects {
            if object.persistence_state() != PersistenceState::Transient {
                self.ensure_registered(object)?;
            }
        }
        let mut guard = self.store.lock();
        let mut action = DeleteAction::new(self, &mut guard);
        for object in objects {
            action.perform(object)?;
        }
        Ok(())
    }

    // ==================== Property access ====================

    /// Current value of a property, resolving faults. Unresolved
    /// relationships are fetched, HOLLOW objects are filled first.
    pub fn read_property(&self, object: &ObjectRef, name: &str) -> Result<PropertyValue> {
        self.ensure_registered(object)?;
        let mut guard = self.store.lock();
        self.property_value(&mut guard, object, name)
    }

    pub fn read_attribute(&self, object: &ObjectRef, name: &str) -> Result<Value> {
        match self.read_property(object, name)? {
            PropertyValue::Attribute(value) => Ok(value),
            _ => Err(not_a("an attribute", object, name)),
        }
    }

    pub fn read_to_one(&self, object: &ObjectRef, name: &str) -> Result<Option<ObjectRef>> {
        self.ensure_registered(object)?;
        let mut guard = self.store.lock();
        match self.property_value(&mut guard, object, name)? {
            PropertyValue::ToOne(Some(id)) => Ok(Some(object_for_id(&mut guard, &id)?)),
            PropertyValue::ToOne(None) => Ok(None),
            _ => Err(not_a("a to-one relationship", object, name)),
        }
    }

    pub fn read_to_many(&self, object: &ObjectRef, name: &str) -> Result<Vec<ObjectRef>> {
        self.ensure_registered(object)?;
        let mut guard = self.store.lock();
        match self.property_value(&mut guard, object, name)? {
            PropertyValue::ToMany(ids) => ids.iter().map(|id| object_for_id(&mut guard, id)).collect(),
            _ => Err(not_a("a to-many relationship", object, name)),
        }
    }

    /// Set an attribute. The first change of a COMMITTED object makes it
    /// MODIFIED; setting the value it was loaded with undoes the change.
    pub fn write_property(&self, object: &ObjectRef, name: &str, value: impl Into<Value>) -> Result<()> {
        self.ensure_registered(object)?;
        let value = value.into();
        let mut guard = self.store.lock();
        self.resolve_fault(&mut guard, object)?;
        ensure_writable(object)?;
        let descriptor = guard.descriptor_of(object)?;
        if !matches!(descriptor.require_property(name)?, Property::Attribute(_)) {
            return Err(not_a("an attribute", object, name));
        }
        let id = object.object_id();
        guard.touch(&id)?;
        object
            .write()
            .values
            .insert(name.to_string(), PropertyValue::Attribute(value));
        tracing::trace!(%id, property = name, "attribute written");
        Ok(())
    }

    /// Point a to-one relationship at `target`, or clear it. The reverse
    /// relationship is kept in sync on both the old and the new target.
    pub fn set_to_one(&self, object: &ObjectRef, name: &str, target: Option<&ObjectRef>) -> Result<()> {
        self.ensure_registered(object)?;
        if let Some(target) = target {
            self.ensure_registered(target)?;
        }
        let mut guard = self.store.lock();
        self.resolve_fault(&mut guard, object)?;
        ensure_writable(object)?;
        let relationship = relationship_of(&guard, object, name, false)?;
        match target {
            Some(target) => self.link(&mut guard, object, &relationship, target, true),
            None => {
                if let PropertyValue::ToOne(Some(current)) = self.property_value(&mut guard, object, name)? {
                    let current = object_for_id(&mut guard, &current)?;
                    self.unlink(&mut guard, object, &relationship, &current, true)?;
                }
                Ok(())
            }
        }
    }

    pub fn add_to_many(&self, object: &ObjectRef, name: &str, target: &ObjectRef) -> Result<()> {
        self.ensure_registered(object)?;
        self.ensure_registered(target)?;
        let mut guard = self.store.lock();
        self.resolve_fault(&mut guard, object)?;
        ensure_writable(object)?;
        let relationship = relationship_of(&guard, object, name, true)?;
        self.link(&mut guard, object, &relationship, target, true)
    }

    pub fn remove_to_many(&self, object: &ObjectRef, name: &str, target: &ObjectRef) -> Result<()> {
        self.ensure_registered(object)?;
        self.ensure_registered(target)?;
        let mut guard = self.store.lock();
        self.resolve_fault(&mut guard, object)?;
        ensure_writable(object)?;
        let relationship = relationship_of(&guard, object, name, true)?;
        self.unlink(&mut guard, object, &relationship, target, true)
    }

    // ==================== Graph primitives ====================

    /// Fill a HOLLOW object: from the parent's own instance when the parent
    /// has one, otherwise from the cached or freshly selected snapshot.
    pub(crate) fn resolve_fault(&self, guard: &mut StoreGuard<'_>, object: &ObjectRef) -> Result<()> {
        if object.persistence_state() != PersistenceState::Hollow {
            return Ok(());
        }
        let id = object.object_id();
        if let Some((entity, values)) = self.channel.local_values(self.id, &id)? {
            let mut data = object.write();
            data.entity = entity;
            data.values = values;
            data.snapshot_version = None;
            data.state = PersistenceState::Committed;
            tracing::trace!(%id, "fault resolved from parent instance");
            return Ok(());
        }
        if id.is_temporary() {
            return Err(Error::Fault(FaultError {
                object_id: id,
                kind: FaultErrorKind::Missing,
            }));
        }

        let resolver = Arc::clone(self.entity_resolver());
        let entity = object.entity_name();
        let select = RowSelect::by_id(&resolver, &entity, &id)?;
        let fetch = || self.channel.on_select(self.id, &select);
        let row = match guard.store().row_store() {
            Some(row_store) => row_store.get_snapshot(&id, fetch)?,
            None => single_row(&id, fetch()?)?,
        };
        let descriptor = resolver.descriptor_for_row(&entity, &row)?;
        if descriptor.name != entity {
            object.write().entity.clone_from(&descriptor.name);
        }
        merge::refresh_object_with_snapshot(&resolver, &descriptor, object, &row, false);
        tracing::debug!(%id, entity = %descriptor.name, "fault resolved");
        Ok(())
    }

    /// Property value with every fault on the way resolved.
    pub(crate) fn property_value(
        &self,
        guard: &mut StoreGuard<'_>,
        object: &ObjectRef,
        name: &str,
    ) -> Result<PropertyValue> {
        self.resolve_fault(guard, object)?;
        let descriptor = guard.descriptor_of(object)?;
        let relationship = match descriptor.require_property(name)? {
            Property::Attribute(_) => {
                return Ok(object
                    .read_property_directly(name)
                    .unwrap_or(PropertyValue::Attribute(Value::Null)));
            }
            Property::ToOne(r) | Property::ToMany(r) => r.clone(),
        };
        match object.read_property_directly(name) {
            Some(value) if !value.is_fault() => Ok(value),
            _ => {
                let value = self.fetch_relationship(guard, object, &relationship)?;
                object.write().values.insert(name.to_string(), value.clone());
                Ok(value)
            }
        }
    }

    /// Objects currently related through `relationship`, resolved lazily.
    pub(crate) fn related_objects(
        &self,
        guard: &mut StoreGuard<'_>,
        object: &ObjectRef,
        relationship: &RelationshipInfo,
    ) -> Result<Vec<ObjectRef>> {
        let ids = match self.property_value(guard, object, &relationship.name)? {
            PropertyValue::ToMany(ids) => ids,
            PropertyValue::ToOne(target) => target.into_iter().collect(),
            _ => Vec::new(),
        };
        ids.iter().map(|id| object_for_id(guard, id)).collect()
    }

    fn fetch_relationship(
        &self,
        guard: &mut StoreGuard<'_>,
        object: &ObjectRef,
        relationship: &RelationshipInfo,
    ) -> Result<PropertyValue> {
        let id = object.object_id();
        let to_many = relationship.is_to_many();
        let value_of = |ids: Vec<ObjectId>| {
            if to_many {
                PropertyValue::ToMany(ids)
            } else {
                PropertyValue::ToOne(ids.into_iter().next())
            }
        };

        if let Some(ids) = self.channel.related_ids(self.id, &id, &relationship.name)? {
            tracing::trace!(%id, relationship = %relationship.name, count = ids.len(), "relationship answered by parent");
            return Ok(value_of(ids));
        }
        if id.is_temporary() {
            return Ok(value_of(Vec::new()));
        }

        let resolver = Arc::clone(self.entity_resolver());
        if relationship.kind == RelationshipKind::ManyToOne {
            let select = RowSelect::by_id(&resolver, &object.entity_name(), &id)?;
            let row = single_row(&id, self.channel.on_select(self.id, &select)?)?;
            let target = merge::to_one_from_row(&resolver, relationship, &row).flatten();
            return Ok(PropertyValue::ToOne(target));
        }

        let Some(qualifier) = related_qualifier(relationship, &id) else {
            return Ok(value_of(Vec::new()));
        };
        let mut select = RowSelect::new(&resolver, &relationship.target_entity)?.qualifier(qualifier);
        if let Some(link) = &relationship.link_table {
            select = select.linked(link.clone());
        }
        let rows = self.channel.on_select(self.id, &select)?;
        let mut objects = ObjectResolver::new(guard, false);
        let targets = objects.objects_from_rows(&relationship.target_entity, &rows)?;
        objects.finish();

        let mut seen = HashSet::new();
        let ids: Vec<ObjectId> = targets
            .iter()
            .map(|t| t.object_id())
            .filter(|t| seen.insert(t.clone()))
            .collect();
        if relationship.is_flattened() {
            for target in &ids {
                guard.mark_flattened_path(&id, &relationship.name, target);
                if let Some(reverse) = &relationship.reverse {
                    guard.mark_flattened_path(target, reverse, &id);
                }
            }
        }
        if !to_many && ids.len() > 1 {
            tracing::warn!(%id, relationship = %relationship.name, count = ids.len(), "to-one matched several rows");
        }
        tracing::debug!(%id, relationship = %relationship.name, count = ids.len(), "relationship fault resolved");
        Ok(value_of(ids))
    }

    /// Add the edge `source -> target`. A to-one that pointed elsewhere is
    /// unlinked first. With `set_reverse` the reverse relationship of the
    /// target is updated as well.
    pub(crate) fn link(
        &self,
        guard: &mut StoreGuard<'_>,
        source: &ObjectRef,
        relationship: &RelationshipInfo,
        target: &ObjectRef,
        set_reverse: bool,
    ) -> Result<()> {
        let source_id = source.object_id();
        let target_id = target.object_id();
        match self.property_value(guard, source, &relationship.name)? {
            PropertyValue::ToMany(ids) if ids.contains(&target_id) => return Ok(()),
            PropertyValue::ToOne(Some(current)) if current == target_id => return Ok(()),
            PropertyValue::ToOne(Some(current)) => {
                let current = object_for_id(guard, &current)?;
                self.unlink(guard, source, relationship, &current, true)?;
            }
            _ => {}
        }

        guard.register_diff(
            &source_id,
            NodeDiff::ArcCreated {
                diff_id: 0,
                node: source_id.clone(),
                target: target_id.clone(),
                arc: ArcId::property(relationship.name.clone()),
            },
        )?;
        {
            let mut data = source.write();
            if relationship.is_to_many() {
                match data.values.get_mut(&relationship.name) {
                    Some(PropertyValue::ToMany(ids)) => ids.push(target_id),
                    _ => {
                        data.values
                            .insert(relationship.name.clone(), PropertyValue::ToMany(vec![target_id]));
                    }
                }
            } else {
                data.values
                    .insert(relationship.name.clone(), PropertyValue::ToOne(Some(target_id)));
            }
        }

        if set_reverse {
            if let Some(reverse) = self.entity_resolver().reverse_relationship(relationship) {
                self.link(guard, target, &reverse, source, false)?;
            }
        }
        Ok(())
    }

    /// Remove the edge `source -> target` if it exists.
    pub(crate) fn unlink(
        &self,
        guard: &mut StoreGuard<'_>,
        source: &ObjectRef,
        relationship: &RelationshipInfo,
        target: &ObjectRef,
        set_reverse: bool,
    ) -> Result<()> {
        let source_id = source.object_id();
        let target_id = target.object_id();
        let linked = match self.property_value(guard, source, &relationship.name)? {
            PropertyValue::ToMany(ids) => ids.contains(&target_id),
            PropertyValue::ToOne(current) => current.as_ref() == Some(&target_id),
            _ => false,
        };
        if !linked {
            return Ok(());
        }

        guard.register_diff(
            &source_id,
            NodeDiff::ArcDeleted {
                diff_id: 0,
                node: source_id.clone(),
                target: target_id.clone(),
                arc: ArcId::property(relationship.name.clone()),
            },
        )?;
        {
            let mut data = source.write();
            match data.values.get_mut(&relationship.name) {
                Some(PropertyValue::ToMany(ids)) => ids.retain(|t| *t != target_id),
                _ => {
                    data.values.insert(relationship.name.clone(), PropertyValue::ToOne(None));
                }
            }
        }

        if set_reverse {
            if let Some(reverse) = self.entity_resolver().reverse_relationship(relationship) {
                self.unlink(guard, target, &reverse, source, false)?;
            }
        }
        Ok(())
    }

    // ==================== Queries ====================

    /// Run a select. Object queries resolve rows through the identity map
    /// and the query's prefetch tree; raw queries return rows untouched.
    #[tracing::instrument(level = "debug", skip_all, fields(context = self.id, entity = %query.entity))]
    pub fn perform_query(&self, query: &SelectQuery) -> Result<QueryResponse> {
        let resolver = Arc::clone(self.entity_resolver());
        if query.fetch_data_rows {
            let mut select = RowSelect::new(&resolver, &query.entity)?.qualifier(query.qualifier.clone());
            select.object_id.clone_from(&query.object_id);
            let rows = self.channel.on_select(self.id, &select)?;
            tracing::debug!(rows = rows.len(), "raw rows fetched");
            return Ok(QueryResponse::Rows(rows));
        }

        let mut guard = self.store.lock();
        if let Some(id) = &query.object_id {
            let cached_only = !query.refresh && query.prefetch.is_none() && query.result_columns.is_empty();
            if let Some(object) = guard
                .get_node(id)
                .filter(|o| cached_only && o.persistence_state() != PersistenceState::Hollow)
            {
                tracing::trace!(%id, "answered from identity map");
                return Ok(QueryResponse::Objects(vec![object]));
            }
            if id.is_temporary() {
                return Ok(QueryResponse::Objects(guard.get_node(id).into_iter().collect()));
            }
        }

        let hierarchical = HierarchicalResolver::new(
            self.channel.as_ref(),
            self.id,
            ObjectResolver::new(&mut guard, query.refresh),
            &query.entity,
            query.prefetch.as_ref(),
        )?;
        let mut select = hierarchical.root_select(query.qualifier.clone())?;
        select.object_id.clone_from(&query.object_id);
        let rows = self.channel.on_select(self.id, &select)?;
        tracing::debug!(rows = rows.len(), "root rows fetched");

        if query.result_columns.is_empty() {
            return hierarchical.run(rows).map(QueryResponse::Objects);
        }
        hierarchical.run(rows.clone())?;
        result_rows(&mut guard, query, &rows).map(QueryResponse::Cells)
    }

    pub fn select(&self, query: &SelectQuery) -> Result<Vec<ObjectRef>> {
        Ok(self.perform_query(query)?.into_objects())
    }

    /// At most one object; more is a query error.
    pub fn select_one(&self, query: &SelectQuery) -> Result<Option<ObjectRef>> {
        let mut objects = self.select(query)?;
        match objects.len() {
            0 | 1 => Ok(objects.pop()),
            n => Err(Error::Query(QueryError {
                message: format!("expected at most one '{}', fetched {}", query.entity, n),
                source: None,
            })),
        }
    }

    pub fn select_rows(&self, query: &SelectQuery) -> Result<Vec<DataRow>> {
        let query = query.clone().fetch_data_rows(true);
        match self.perform_query(&query)? {
            QueryResponse::Rows(rows) => Ok(rows),
            _ => Ok(Vec::new()),
        }
    }

    pub fn select_cells(&self, query: &SelectQuery) -> Result<Vec<ResultRow>> {
        match self.perform_query(query)? {
            QueryResponse::Cells(cells) => Ok(cells),
            QueryResponse::Objects(objects) => Ok(objects
                .into_iter()
                .map(|o| ResultRow(vec![ResultCell::Entity(Some(o))]))
                .collect()),
            QueryResponse::Rows(_) => Ok(Vec::new()),
        }
    }

    /// The object behind `id`, from the identity map when already resolved,
    /// fetched otherwise.
    pub fn object_for_id(&self, id: &ObjectId) -> Result<Option<ObjectRef>> {
        self.select_one(&SelectQuery::by_id(id).refresh(false))
    }

    // ==================== Commit and rollback ====================

    /// Commit every change down to the data source.
    pub fn commit_changes(&self) -> Result<()> {
        self.flush(SyncType::FlushCascade, self.id).map(|_| ())
    }

    /// Push every change into the parent context without committing it.
    pub fn commit_changes_to_parent(&self) -> Result<()> {
        self.flush(SyncType::Flush, self.id).map(|_| ())
    }

    /// Discard local changes and those of the parent context chain.
    pub fn rollback_changes(&self) -> Result<()> {
        self.rollback_changes_locally()?;
        self.channel.on_sync(self.id, &GraphDiff::new(), SyncType::Rollback)?;
        Ok(())
    }

    /// Discard this context's changes: NEW objects are dropped, MODIFIED and
    /// DELETED ones turn HOLLOW.
    pub fn rollback_changes_locally(&self) -> Result<()> {
        let touched = self.store.lock().rollback();
        tracing::debug!(context = self.id, count = touched.len(), "changes rolled back");
        self.callbacks().fire(ContextEvent::AfterRollback)
    }

    /// Send the pending changes to the parent and settle local state from
    /// the reply. `origin` is the context the changes started from; it is
    /// the source of the notification children receive.
    #[tracing::instrument(level = "debug", skip(self), fields(context = self.id))]
    fn flush(&self, sync: SyncType, origin: ContextId) -> Result<GraphDiff> {
        let _commit = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush_serialized(sync, origin)
    }

    /// Commit with `commit_lock` already held.
    fn flush_serialized(&self, sync: SyncType, origin: ContextId) -> Result<GraphDiff> {
        self.callbacks().fire(ContextEvent::BeforeCommit)?;
        let committed = {
            let mut guard = self.store.lock();
            if !guard.has_changes() {
                tracing::debug!("nothing to commit");
                None
            } else if guard.is_noop() {
                guard.postprocess_after_phantom_commit();
                None
            } else {
                if self.config.validate_on_commit {
                    self.validate(&guard)?;
                }
                let diff = guard.changes();
                tracing::debug!(operations = diff.len(), "committing");
                let reply = self
                    .channel
                    .on_sync(self.id, &diff, sync)
                    .map_err(Error::into_commit_error)?;
                guard.postprocess_after_commit(&reply);
                Some((diff, reply))
            }
        };

        let reply = match committed {
            Some((mut diff, reply)) => {
                diff.extend(reply.clone());
                let event = GraphEvent {
                    source: origin,
                    diff: Arc::new(diff),
                };
                self.notify_children(&event);
                self.fire_listeners(&event);
                reply
            }
            None => GraphDiff::new(),
        };
        self.callbacks().fire(ContextEvent::AfterCommit)?;
        Ok(reply)
    }

    /// Mandatory properties and registered validators of every NEW and
    /// MODIFIED object.
    fn validate(&self, guard: &StoreGuard<'_>) -> Result<()> {
        let resolver = self.entity_resolver();
        let validators = self.validators.lock().unwrap_or_else(PoisonError::into_inner);
        let mut errors = ValidationError::new();
        for object in guard.dirty_objects() {
            if !matches!(
                object.persistence_state(),
                PersistenceState::New | PersistenceState::Modified
            ) {
                continue;
            }
            let descriptor = guard.descriptor_of(&object)?;
            let id = object.object_id();
            {
                let data = object.read();
                for attribute in descriptor.attributes.iter().filter(|a| a.mandatory) {
                    if data.attribute(&attribute.name).is_none_or(Value::is_null) {
                        errors.add_required(&id, &attribute.name);
                    }
                }
                for relationship in descriptor
                    .relationships
                    .iter()
                    .filter(|r| r.mandatory && !r.is_to_many())
                {
                    if matches!(
                        data.values.get(&relationship.name),
                        None | Some(PropertyValue::ToOne(None))
                    ) {
                        errors.add_required(&id, &relationship.name);
                    }
                }
            }
            for (entity, list) in validators.iter() {
                if resolver.is_subentity_of(&descriptor.name, entity) {
                    for validator in list {
                        validator(&object, &mut errors);
                    }
                }
            }
        }
        if !errors.is_empty() {
            tracing::debug!(context = self.id, failures = errors.errors.len(), "validation failed");
        }
        errors.into_result().map_err(Error::from)
    }

    /// Replay a child's diff into this context's graph.
    #[tracing::instrument(level = "debug", skip_all, fields(context = self.id, operations = diff.len()))]
    fn apply_child_diff(&self, diff: &GraphDiff) -> Result<()> {
        let mut guard = self.store.lock();
        let mut loader = ChildDiffLoader {
            context: self,
            guard: &mut guard,
            error: None,
        };
        diff.apply(&mut loader);
        match loader.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for DataContext {
    fn drop(&mut self) {
        if let Some(row_store) = self.store.row_store() {
            row_store.unsubscribe(self.id);
        }
        self.channel.unsubscribe(self.id);
    }
}

// ============================================================================
// Parent channel
// ============================================================================

impl DataChannel for DataContext {
    fn entity_resolver(&self) -> &Arc<EntityResolver> {
        self.store.resolver()
    }

    fn row_store_for(&self, _context: ContextId) -> Option<Arc<RowStore>> {
        None
    }

    fn max_id_qualifier_size(&self) -> usize {
        self.channel.max_id_qualifier_size()
    }

    /// Rows as this context sees them: rows of locally DELETED objects are
    /// dropped, MODIFIED objects contribute their current values.
    fn on_select(&self, _source: ContextId, select: &RowSelect) -> Result<Vec<DataRow>> {
        let rows = self.channel.on_select(self.id, select)?;
        let guard = self.store.lock();
        if !guard.has_changes() {
            return Ok(rows);
        }
        let resolver = self.entity_resolver();
        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            let descriptor = resolver.descriptor_for_row(&select.entity, &row)?;
            let Some(object) = resolver
                .id_from_row(&descriptor, &row)
                .and_then(|id| guard.get_node(&id))
            else {
                out.push(row);
                continue;
            };
            match object.persistence_state() {
                PersistenceState::Deleted => continue,
                PersistenceState::Modified => {
                    let descriptor = guard.descriptor_of(&object)?;
                    overlay_local_changes(&descriptor, &object, &mut row);
                }
                _ => {}
            }
            out.push(row);
        }
        Ok(out)
    }

    fn on_sync(&self, source: ContextId, diff: &GraphDiff, sync: SyncType) -> Result<GraphDiff> {
        match sync {
            SyncType::Rollback => {
                self.rollback_changes()?;
                Ok(GraphDiff::new())
            }
            SyncType::Flush => {
                self.apply_child_diff(diff)?;
                self.notify_children(&GraphEvent {
                    source,
                    diff: Arc::new(diff.clone()),
                });
                Ok(GraphDiff::new())
            }
            SyncType::FlushCascade => {
                // Apply and commit as one step so the reply carries this
                // child's permanent ids.
                let _commit = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
                self.apply_child_diff(diff)?;
                self.flush_serialized(SyncType::FlushCascade, source)
            }
        }
    }

    fn related_ids(
        &self,
        _source: ContextId,
        id: &ObjectId,
        relationship: &str,
    ) -> Result<Option<Vec<ObjectId>>> {
        let guard = self.store.lock();
        let Some(object) = guard.get_node(id).filter(|o| resolved(o)) else {
            return Ok(None);
        };
        Ok(match object.read_property_directly(relationship) {
            Some(PropertyValue::ToMany(ids)) => Some(ids),
            Some(PropertyValue::ToOne(target)) => Some(target.into_iter().collect()),
            _ => None,
        })
    }

    fn local_values(
        &self,
        _source: ContextId,
        id: &ObjectId,
    ) -> Result<Option<(String, HashMap<String, PropertyValue>)>> {
        let guard = self.store.lock();
        Ok(guard.get_node(id).filter(|o| resolved(o)).map(|object| {
            let data = object.read();
            (data.entity.clone(), data.values.clone())
        }))
    }

    fn subscribe(&self, context: ContextId, inbox: Sender<StoreEvent>) {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.retain(|(id, _)| *id != context);
        children.push((context, inbox));
    }

    fn unsubscribe(&self, context: ContextId) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| *id != context);
    }
}

/// Applies a child's operations through the regular graph primitives.
struct ChildDiffLoader<'c, 'g, 'a> {
    context: &'c DataContext,
    guard: &'g mut StoreGuard<'a>,
    /// First failure; later operations are skipped.
    error: Option<Error>,
}

impl ChildDiffLoader<'_, '_, '_> {
    fn record(&mut self, result: Result<()>) {
        if let Err(err) = result {
            tracing::debug!(error = %err, "child diff rejected");
            self.error = Some(err);
        }
    }

    fn object(&mut self, id: &ObjectId) -> Result<ObjectRef> {
        let object = object_for_id(self.guard, id)?;
        self.context.resolve_fault(self.guard, &object)?;
        Ok(object)
    }

    fn create(&mut self, node: &ObjectId, entity: &str) -> Result<()> {
        if self.guard.get_node(node).is_some() {
            return Ok(());
        }
        let descriptor = self.context.entity_resolver().get(entity)?;
        let object = ManagedObject::new(entity, node.clone(), PersistenceState::New);
        init_new_values(&descriptor, &object);
        self.guard.register_node(node.clone(), object)?;
        self.guard.register_diff(
            node,
            NodeDiff::NodeCreated {
                diff_id: 0,
                node: node.clone(),
                entity: entity.to_string(),
            },
        )
    }

    fn remove(&mut self, node: &ObjectId) -> Result<()> {
        let object = self.object(node)?;
        match object.persistence_state() {
            PersistenceState::New => {
                self.guard.unregister_node(node);
            }
            PersistenceState::Committed | PersistenceState::Modified => {
                self.guard.register_diff(
                    node,
                    NodeDiff::NodeRemoved {
                        diff_id: 0,
                        node: node.clone(),
                    },
                )?;
                object.set_state(PersistenceState::Deleted);
            }
            _ => {}
        }
        Ok(())
    }

    fn set_attribute(&mut self, node: &ObjectId, property: &str, value: &Value) -> Result<()> {
        let object = self.object(node)?;
        self.guard.touch(node)?;
        object
            .write()
            .values
            .insert(property.to_string(), PropertyValue::Attribute(value.clone()));
        Ok(())
    }

    fn arc(&mut self, node: &ObjectId, target: &ObjectId, arc: &ArcId, create: bool) -> Result<()> {
        let source = self.object(node)?;
        let Some(name) = arc.as_property() else {
            let op = if create {
                NodeDiff::ArcCreated {
                    diff_id: 0,
                    node: node.clone(),
                    target: target.clone(),
                    arc: arc.clone(),
                }
            } else {
                NodeDiff::ArcDeleted {
                    diff_id: 0,
                    node: node.clone(),
                    target: target.clone(),
                    arc: arc.clone(),
                }
            };
            return self.guard.register_diff(node, op);
        };
        let relationship = self.guard.descriptor_of(&source)?.relationship_named(name)?.clone();
        let target = object_for_id(self.guard, target)?;
        if create {
            self.context.link(self.guard, &source, &relationship, &target, false)
        } else {
            self.context.unlink(self.guard, &source, &relationship, &target, false)
        }
    }
}

impl GraphChangeHandler for ChildDiffLoader<'_, '_, '_> {
    fn node_created(&mut self, node: &ObjectId, entity: &str) {
        if self.error.is_none() {
            let result = self.create(node, entity);
            self.record(result);
        }
    }

    fn node_removed(&mut self, node: &ObjectId) {
        if self.error.is_none() {
            let result = self.remove(node);
            self.record(result);
        }
    }

    fn node_property_changed(&mut self, node: &ObjectId, property: &str, _old: &Value, new: &Value) {
        if self.error.is_none() {
            let result = self.set_attribute(node, property, new);
            self.record(result);
        }
    }

    fn arc_created(&mut self, node: &ObjectId, target: &ObjectId, arc: &ArcId) {
        if self.error.is_none() {
            let result = self.arc(node, target, arc, true);
            self.record(result);
        }
    }

    fn arc_deleted(&mut self, node: &ObjectId, target: &ObjectId, arc: &ArcId) {
        if self.error.is_none() {
            let result = self.arc(node, target, arc, false);
            self.record(result);
        }
    }
}

// ==================== Helpers ====================

/// The registered instance for `id`, or a new HOLLOW one.
pub(crate) fn object_for_id(guard: &mut StoreGuard<'_>, id: &ObjectId) -> Result<ObjectRef> {
    guard.find_or_register(id, || {
        ManagedObject::new(id.entity_name(), id.clone(), PersistenceState::Hollow)
    })
}

/// Empty relationships for a fresh object, so nothing on it faults.
fn init_new_values(descriptor: &EntityDescriptor, object: &ManagedObject) {
    let mut data = object.write();
    for relationship in &descriptor.relationships {
        let value = if relationship.is_to_many() {
            PropertyValue::ToMany(Vec::new())
        } else {
            PropertyValue::ToOne(None)
        };
        data.values.insert(relationship.name.clone(), value);
    }
}

fn resolved(object: &ManagedObject) -> bool {
    !matches!(
        object.persistence_state(),
        PersistenceState::Hollow | PersistenceState::Transient | PersistenceState::Deleted
    )
}

fn ensure_writable(object: &ManagedObject) -> Result<()> {
    if object.persistence_state() == PersistenceState::Deleted {
        return Err(Error::State(StateError {
            object_id: Some(object.object_id()),
            from: PersistenceState::Deleted,
            to: None,
            message: "a deleted object cannot be modified".to_string(),
        }));
    }
    Ok(())
}

fn relationship_of(
    guard: &StoreGuard<'_>,
    object: &ManagedObject,
    name: &str,
    to_many: bool,
) -> Result<RelationshipInfo> {
    let descriptor = guard.descriptor_of(object)?;
    let relationship = descriptor.relationship_named(name)?;
    if relationship.is_to_many() != to_many {
        let kind = if to_many { "a to-many" } else { "a to-one" };
        return Err(not_a(&format!("{kind} relationship"), object, name));
    }
    Ok(relationship.clone())
}

fn not_a(what: &str, object: &ManagedObject, name: &str) -> Error {
    Error::mapping(
        MappingErrorKind::UnknownProperty,
        format!("'{}.{}' is not {}", object.entity_name(), name, what),
    )
}

fn single_row(id: &ObjectId, mut rows: Vec<DataRow>) -> Result<DataRow> {
    match rows.len() {
        1 => Ok(rows.remove(0)),
        0 => Err(Error::Fault(FaultError {
            object_id: id.clone(),
            kind: FaultErrorKind::Missing,
        })),
        n => Err(Error::Fault(FaultError {
            object_id: id.clone(),
            kind: FaultErrorKind::Ambiguous(n),
        })),
    }
}

/// Write a MODIFIED object's attributes and resolved foreign keys into its
/// fetched row. Foreign keys to objects without a permanent id stay as
/// fetched.
fn overlay_local_changes(descriptor: &EntityDescriptor, object: &ManagedObject, row: &mut DataRow) {
    let data = object.read();
    for attribute in &descriptor.attributes {
        if let Some(value) = data.attribute(&attribute.name) {
            row.insert(attribute.column.clone(), value.clone());
        }
    }
    for relationship in descriptor
        .relationships
        .iter()
        .filter(|r| r.kind == RelationshipKind::ManyToOne)
    {
        match data.to_one(&relationship.name) {
            Some(Some(target)) if !target.is_temporary() => {
                for join in &relationship.joins {
                    if let Some(value) = target.value_for(&join.target) {
                        row.insert(join.source.clone(), value.clone());
                    }
                }
            }
            Some(None) => {
                for join in &relationship.joins {
                    row.insert(join.source.clone(), Value::Null);
                }
            }
            _ => {}
        }
    }
}

/// Mixed result rows of a query with result columns.
fn result_rows(guard: &mut StoreGuard<'_>, query: &SelectQuery, rows: &[DataRow]) -> Result<Vec<ResultRow>> {
    let mut objects = ObjectResolver::new(guard, false);
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut cells = Vec::with_capacity(query.result_columns.len());
        for column in &query.result_columns {
            let cell = match column {
                ResultColumn::Scalar(name) => ResultCell::Scalar(row.value(name).clone()),
                ResultColumn::Entity { entity, prefix } if prefix.is_empty() => {
                    ResultCell::Entity(objects.object_from_row(entity, row)?)
                }
                ResultColumn::Entity { entity, prefix } => {
                    let sub = row.sub_row(&format!("{prefix}."));
                    ResultCell::Entity(objects.object_from_row(entity, &sub)?)
                }
                ResultColumn::Embeddable(prefix) => ResultCell::Embeddable(row.sub_row(&format!("{prefix}."))),
            };
            cells.push(cell);
        }
        out.push(ResultRow(cells));
    }
    objects.finish();
    Ok(out)
}
