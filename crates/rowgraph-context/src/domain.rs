//! The root channel.
//!
//! A [`DataDomain`] sits between top-level contexts and a [`DataSource`]. It
//! answers selects straight from the source and turns committed graph diffs
//! into ordered row operations executed in one transaction. After a
//! successful commit it posts the new snapshots to the row store, so other
//! contexts sharing the cache see the changes, and replies with the
//! permanent ids of the inserted objects.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rowgraph_core::{
    CommitErrorKind, DataRow, EntityDescriptor, EntityResolver, Error, Expression, LinkTableInfo,
    ObjectId, RelationshipInfo, RelationshipKind, Result, Value,
};

use crate::channel::{DataChannel, DataSource, RowSelect, SyncType, bound_transaction};
use crate::config::{ContextConfig, DomainConfig};
use crate::context::DataContext;
use crate::flush::{FlushOrderer, FlushResult, RowOperation};
use crate::graph_diff::{ArcId, GraphDiff, NodeDiff};
use crate::object::ContextId;
use crate::row_store::RowStore;

/// Root channel over one data source.
pub struct DataDomain {
    name: String,
    data_source: Arc<dyn DataSource>,
    resolver: Arc<EntityResolver>,
    config: DomainConfig,
    shared_store: Option<Arc<RowStore>>,
    /// Private snapshot caches of contexts when the cache is not shared.
    context_stores: Mutex<HashMap<ContextId, Arc<RowStore>>>,
    orderer: FlushOrderer,
}

impl fmt::Debug for DataDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataDomain")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("shared_store", &self.shared_store.as_ref().map(|s| s.len()))
            .finish_non_exhaustive()
    }
}

impl DataDomain {
    /// Create a domain. Fails on an invalid configuration.
    pub fn new(
        name: impl Into<String>,
        data_source: Arc<dyn DataSource>,
        resolver: Arc<EntityResolver>,
        config: DomainConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let name = name.into();
        let shared_store = config
            .shared_cache
            .then(|| Arc::new(RowStore::new(name.clone(), &config)));
        let orderer = FlushOrderer::from_resolver(&resolver);
        tracing::debug!(domain = %name, shared = config.shared_cache, "domain created");
        Ok(Arc::new(Self {
            name,
            data_source,
            resolver,
            config,
            shared_store,
            context_stores: Mutex::new(HashMap::new()),
            orderer,
        }))
    }

    /// A top-level context with the default configuration.
    pub fn create_context(self: &Arc<Self>) -> Arc<DataContext> {
        self.create_context_with(ContextConfig::default())
    }

    pub fn create_context_with(self: &Arc<Self>, config: ContextConfig) -> Arc<DataContext> {
        DataContext::new(Arc::clone(self) as Arc<dyn DataChannel>, config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
    }

    /// Snapshot cache shared by every context, when enabled.
    pub fn shared_row_store(&self) -> Option<&Arc<RowStore>> {
        self.shared_store.as_ref()
    }

    fn context_stores(&self) -> MutexGuard<'_, HashMap<ContextId, Arc<RowStore>>> {
        self.context_stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn existing_row_store(&self, context: ContextId) -> Option<Arc<RowStore>> {
        match &self.shared_store {
            Some(store) => Some(Arc::clone(store)),
            None => self.context_stores().get(&context).cloned(),
        }
    }

    // ==================== Commit ====================

    /// Write `diff` to the data source and publish the outcome.
    #[tracing::instrument(level = "debug", skip_all, fields(domain = %self.name, source = source, operations = diff.len()))]
    fn commit_diff(&self, source: ContextId, diff: &GraphDiff) -> Result<GraphDiff> {
        let changes = CommitChanges::collect(&self.resolver, diff)?;
        let ids = self.permanent_ids(&changes)?;
        let row_store = self.existing_row_store(source);
        let operations = changes.operations(&self.resolver, &ids, row_store.as_deref())?;
        let plan = self.orderer.order(operations);

        let result = match bound_transaction() {
            Some(transaction) => plan.execute(self.data_source.as_ref(), transaction.as_ref()).inspect_err(|err| {
                tracing::debug!(error = %err, "commit failed in bound transaction");
                transaction.set_rollback_only();
            })?,
            None => {
                let transaction = self.data_source.begin_transaction()?;
                match plan.execute(self.data_source.as_ref(), transaction.as_ref()) {
                    Ok(result) => {
                        transaction.commit()?;
                        result
                    }
                    Err(err) => {
                        if let Err(rollback) = transaction.rollback() {
                            tracing::warn!(error = %rollback, "rollback after failed commit failed");
                        }
                        return Err(err);
                    }
                }
            }
        };
        log_result(&result);

        if let Some(row_store) = &row_store {
            publish_snapshots(row_store, source, plan.operations(), &changes, &ids);
        }

        let mut reply = GraphDiff::new();
        for (temporary, permanent) in ids {
            reply.push(NodeDiff::NodeIdChanged {
                diff_id: 0,
                node: temporary,
                new_id: permanent,
            });
        }
        Ok(reply)
    }

    /// Permanent ids for created objects: from key attributes set by the
    /// application, otherwise generated by the data source. Objects
    /// re-inserted after a concurrent delete keep their id.
    fn permanent_ids(&self, changes: &CommitChanges) -> Result<HashMap<ObjectId, ObjectId>> {
        let mut ids = HashMap::new();
        for (temporary, entity) in changes.created.iter().filter(|(id, _)| id.is_temporary()) {
            let descriptor = self.resolver.get(entity)?;
            let values = changes.attributes.get(temporary);
            let assigned: Option<Vec<(String, Value)>> = descriptor
                .primary_key
                .iter()
                .map(|column| {
                    let attribute = descriptor.attribute_for_column(column)?;
                    let value = values?
                        .iter()
                        .find(|(name, _, _)| *name == attribute.name)
                        .map(|(_, _, new)| new)?;
                    (!value.is_null()).then(|| (column.clone(), value.clone()))
                })
                .collect();
            let key = match assigned {
                Some(key) => key,
                None => self.data_source.generate_primary_key(&descriptor)?,
            };
            let permanent = self.resolver.object_id(&descriptor.name, key);
            tracing::trace!(%temporary, %permanent, "permanent id assigned");
            ids.insert(temporary.clone(), permanent);
        }
        Ok(ids)
    }
}

impl DataChannel for DataDomain {
    fn entity_resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    fn row_store_for(&self, context: ContextId) -> Option<Arc<RowStore>> {
        if let Some(store) = &self.shared_store {
            return Some(Arc::clone(store));
        }
        let store = Arc::new(RowStore::new(format!("{}-{}", self.name, context), &self.config));
        self.context_stores().insert(context, Arc::clone(&store));
        Some(store)
    }

    fn max_id_qualifier_size(&self) -> usize {
        self.config.max_id_qualifier_size
    }

    fn on_select(&self, source: ContextId, select: &RowSelect) -> Result<Vec<DataRow>> {
        let rows = self.data_source.select(select)?;
        tracing::trace!(source, %select, rows = rows.len(), "select");
        Ok(rows)
    }

    fn on_sync(&self, source: ContextId, diff: &GraphDiff, sync: SyncType) -> Result<GraphDiff> {
        match sync {
            SyncType::Rollback => Ok(GraphDiff::new()),
            SyncType::Flush | SyncType::FlushCascade => self.commit_diff(source, diff),
        }
    }

    fn unsubscribe(&self, context: ContextId) {
        self.context_stores().remove(&context);
    }
}

// ==================== Diff to row operations ====================

/// Foreign key columns of one row, as pairs of (local column, column of the
/// referenced key).
type FkColumns = Vec<(String, String)>;

/// Link row change of a flattened relationship: the table and, per link
/// column, the object and key column its value comes from.
struct LinkChange {
    table: String,
    columns: Vec<(String, ObjectId, String)>,
}

/// A committed diff regrouped per row.
#[derive(Default)]
struct CommitChanges {
    /// Created objects with their entity, in creation order.
    created: Vec<(ObjectId, String)>,
    removed: Vec<ObjectId>,
    /// Changed attributes per object: (name, old, new).
    attributes: HashMap<ObjectId, Vec<(String, Value, Value)>>,
    /// Final foreign key target per object and foreign key.
    foreign_keys: HashMap<ObjectId, BTreeMap<Vec<String>, (FkColumns, Option<ObjectId>)>>,
    /// Link rows, keyed by table and columns; `true` inserts.
    links: Vec<(bool, LinkChange)>,
    /// Objects whose to-many relationships changed.
    indirectly_modified: HashSet<ObjectId>,
}

impl CommitChanges {
    fn collect(resolver: &EntityResolver, diff: &GraphDiff) -> Result<Self> {
        let mut changes = Self::default();
        for op in diff.iter() {
            match op {
                NodeDiff::NodeCreated { node, entity, .. } => changes.created.push((node.clone(), entity.clone())),
                NodeDiff::NodeRemoved { node, .. } => changes.removed.push(node.clone()),
                NodeDiff::NodePropertyChanged {
                    node, property, old, new, ..
                } => changes
                    .attributes
                    .entry(node.clone())
                    .or_default()
                    .push((property.clone(), old.clone(), new.clone())),
                NodeDiff::ArcCreated { node, target, arc, .. } => changes.arc(resolver, node, target, arc, true)?,
                NodeDiff::ArcDeleted { node, target, arc, .. } => changes.arc(resolver, node, target, arc, false)?,
                NodeDiff::NodeIdChanged { .. } => {}
            }
        }
        Ok(changes)
    }

    fn arc(
        &mut self,
        resolver: &EntityResolver,
        node: &ObjectId,
        target: &ObjectId,
        arc: &ArcId,
        create: bool,
    ) -> Result<()> {
        let (relationship, columns) = match arc {
            ArcId::Property(name) => {
                let relationship = relationship_for(resolver, node.entity_name(), name)?;
                match relationship.kind {
                    RelationshipKind::ManyToOne => {
                        let columns: FkColumns = relationship
                            .joins
                            .iter()
                            .map(|j| (j.source.clone(), j.target.clone()))
                            .collect();
                        (relationship, columns)
                    }
                    RelationshipKind::ManyToMany => {
                        if let Some(link) = &relationship.link_table {
                            self.link(link, node, target, create);
                        }
                        self.indirectly_modified.insert(node.clone());
                        self.indirectly_modified.insert(target.clone());
                        return Ok(());
                    }
                    RelationshipKind::OneToMany => {
                        self.indirectly_modified.insert(node.clone());
                        return Ok(());
                    }
                    // The target row holds the key; its many-to-one or a
                    // reverse arc carries the change.
                    RelationshipKind::OneToOne => return Ok(()),
                }
            }
            ArcId::Reverse { entity, relationship } => {
                let relationship = relationship_for(resolver, entity, relationship)?;
                let columns: FkColumns = relationship
                    .joins
                    .iter()
                    .map(|j| (j.target.clone(), j.source.clone()))
                    .collect();
                self.indirectly_modified.insert(target.clone());
                (relationship, columns)
            }
        };

        let key: Vec<String> = columns.iter().map(|(local, _)| local.clone()).collect();
        let slots = self.foreign_keys.entry(node.clone()).or_default();
        if create {
            slots.insert(key, (columns, Some(target.clone())));
        } else {
            let replaced = slots.get(&key).is_none_or(|(_, current)| current.as_ref() == Some(target));
            if replaced {
                slots.insert(key, (columns, None));
            }
        }
        tracing::trace!(%node, %target, relationship = %relationship.name, create, "foreign key change");
        Ok(())
    }

    /// Record a link row change. A change opposite to a pending one for the
    /// same row cancels it; both sides of a many-to-many report the same row.
    fn link(&mut self, link: &LinkTableInfo, source: &ObjectId, target: &ObjectId, create: bool) {
        let mut columns: Vec<(String, ObjectId, String)> = link
            .source_joins
            .iter()
            .map(|j| (j.target.clone(), source.clone(), j.source.clone()))
            .chain(
                link.target_joins
                    .iter()
                    .map(|j| (j.source.clone(), target.clone(), j.target.clone())),
            )
            .collect();
        columns.sort_by(|a, b| a.0.cmp(&b.0));
        let change = LinkChange {
            table: link.table_name.clone(),
            columns,
        };
        let same_row = |c: &LinkChange| c.table == change.table && c.columns == change.columns;
        if let Some(pos) = self.links.iter().position(|(_, c)| same_row(c)) {
            if self.links[pos].0 != create {
                self.links.remove(pos);
            }
            return;
        }
        self.links.push((create, change));
    }

    fn operations(
        &self,
        resolver: &EntityResolver,
        ids: &HashMap<ObjectId, ObjectId>,
        row_store: Option<&RowStore>,
    ) -> Result<Vec<RowOperation>> {
        let permanent = |id: &ObjectId| -> Result<ObjectId> {
            if !id.is_temporary() {
                return Ok(id.clone());
            }
            ids.get(id).cloned().ok_or_else(|| {
                Error::commit(
                    CommitErrorKind::Failed,
                    format!("{id} is referenced but was never committed"),
                )
            })
        };
        let removed: HashSet<&ObjectId> = self.removed.iter().collect();
        let mut operations = Vec::new();

        for (temporary, entity) in &self.created {
            if removed.contains(temporary) {
                continue;
            }
            let descriptor = resolver.get(entity)?;
            let id = permanent(temporary)?;
            let mut values = BTreeMap::new();
            for (name, _, new) in self.attributes.get(temporary).into_iter().flatten() {
                let attribute = resolver.attribute_in_hierarchy(entity, name).ok_or_else(|| unknown(entity, name))?;
                values.insert(attribute.column.clone(), new.clone());
            }
            for (column, value) in id.key_values().unwrap_or_default() {
                values.insert(column.clone(), value.clone());
            }
            self.foreign_key_values(temporary, &permanent, &mut values)?;
            if let Some(inheritance) = &descriptor.inheritance {
                values.insert(
                    inheritance.discriminator_column.clone(),
                    inheritance.discriminator_value.clone(),
                );
            }
            operations.push(RowOperation::Insert {
                id,
                table: descriptor.table.clone(),
                values,
            });
        }

        let created: HashSet<&ObjectId> = self.created.iter().map(|(id, _)| id).collect();
        let mut updated: Vec<&ObjectId> = self
            .attributes
            .keys()
            .chain(self.foreign_keys.keys())
            .filter(|id| !created.contains(id) && !removed.contains(id))
            .collect();
        updated.sort_by_key(|id| id.to_string());
        updated.dedup();
        for id in updated {
            let entity = id.entity_name();
            let descriptor = resolver.get(entity)?;
            let mut values = BTreeMap::new();
            for (name, _, new) in self.attributes.get(id).into_iter().flatten() {
                let attribute = resolver.attribute_in_hierarchy(entity, name).ok_or_else(|| unknown(entity, name))?;
                values.insert(attribute.column.clone(), new.clone());
            }
            self.foreign_key_values(id, &permanent, &mut values)?;
            if values.is_empty() {
                continue;
            }
            let (qualifier, optimistic) = self.row_qualifier(&descriptor, id, row_store);
            operations.push(RowOperation::Update {
                id: id.clone(),
                table: descriptor.table.clone(),
                values,
                qualifier,
                optimistic,
            });
        }

        for (create, change) in &self.links {
            let mut values = BTreeMap::new();
            for (column, object, key) in &change.columns {
                let value = permanent(object)?.value_for(key).cloned().unwrap_or(Value::Null);
                values.insert(column.clone(), value);
            }
            let table = change.table.clone();
            operations.push(if *create {
                RowOperation::LinkInsert { table, values }
            } else {
                RowOperation::LinkDelete { table, values }
            });
        }

        for id in &self.removed {
            if id.is_temporary() {
                continue;
            }
            let descriptor = resolver.get(id.entity_name())?;
            let (qualifier, optimistic) = self.row_qualifier(&descriptor, id, row_store);
            operations.push(RowOperation::Delete {
                id: id.clone(),
                table: descriptor.table.clone(),
                qualifier,
                optimistic,
            });
        }
        Ok(operations)
    }

    fn foreign_key_values(
        &self,
        id: &ObjectId,
        permanent: &dyn Fn(&ObjectId) -> Result<ObjectId>,
        values: &mut BTreeMap<String, Value>,
    ) -> Result<()> {
        for (columns, target) in self.foreign_keys.get(id).into_iter().flat_map(BTreeMap::values) {
            let target = target.as_ref().map(permanent).transpose()?;
            for (local, referenced) in columns {
                let value = target
                    .as_ref()
                    .and_then(|t| t.value_for(referenced).cloned())
                    .unwrap_or(Value::Null);
                values.insert(local.clone(), value);
            }
        }
        Ok(())
    }

    /// Key qualifier of an existing row, extended with the old values of
    /// locking attributes when the entity uses optimistic locking.
    fn row_qualifier(
        &self,
        descriptor: &EntityDescriptor,
        id: &ObjectId,
        row_store: Option<&RowStore>,
    ) -> (Expression, bool) {
        let mut qualifier = id
            .key_values()
            .unwrap_or_default()
            .iter()
            .fold(Expression::True, |q, (c, v)| q.and(Expression::eq(c.clone(), v.clone())));
        if !descriptor.optimistic_locking {
            return (qualifier, false);
        }
        let cached = row_store.and_then(|store| store.get_cached_snapshot(id));
        let mut locked = false;
        for attribute in descriptor.attributes.iter().filter(|a| a.used_for_locking) {
            let changed = self
                .attributes
                .get(id)
                .and_then(|changes| changes.iter().find(|(name, _, _)| *name == attribute.name))
                .map(|(_, old, _)| old.clone());
            let Some(old) = changed.or_else(|| cached.as_ref().and_then(|row| row.get(&attribute.column).cloned()))
            else {
                tracing::debug!(%id, attribute = %attribute.name, "no known value for locking attribute");
                continue;
            };
            qualifier = qualifier.and(Expression::eq(attribute.column.clone(), old));
            locked = true;
        }
        if !locked {
            tracing::warn!(%id, entity = %descriptor.name, "optimistic locking without any locking value");
        }
        (qualifier, locked)
    }
}

fn relationship_for(resolver: &EntityResolver, entity: &str, name: &str) -> Result<RelationshipInfo> {
    resolver.relationship_in_hierarchy(entity, name).cloned().ok_or_else(|| {
        Error::mapping(
            rowgraph_core::MappingErrorKind::UnknownRelationship,
            format!("no relationship '{name}' on '{entity}'"),
        )
    })
}

fn unknown(entity: &str, name: &str) -> Error {
    Error::mapping(
        rowgraph_core::MappingErrorKind::UnknownProperty,
        format!("no attribute '{name}' on '{entity}'"),
    )
}

fn log_result(result: &FlushResult) {
    tracing::debug!(
        inserted = result.inserted,
        updated = result.updated,
        deleted = result.deleted,
        linked = result.linked,
        "commit executed"
    );
}

/// Post the committed rows to the snapshot cache.
fn publish_snapshots<'a>(
    row_store: &RowStore,
    source: ContextId,
    operations: impl Iterator<Item = &'a RowOperation>,
    changes: &CommitChanges,
    ids: &HashMap<ObjectId, ObjectId>,
) {
    let mut updated = HashMap::new();
    let mut deleted = Vec::new();
    let mut invalidated = Vec::new();
    for op in operations {
        match op {
            RowOperation::Insert { id, values, .. } => {
                updated.insert(id.clone(), DataRow::from_pairs(values.clone()));
            }
            RowOperation::Update { id, values, .. } => match row_store.get_cached_snapshot(id) {
                Some(cached) => {
                    updated.insert(id.clone(), cached.apply_diff(values));
                }
                None => invalidated.push(id.clone()),
            },
            RowOperation::Delete { id, .. } => deleted.push(id.clone()),
            RowOperation::LinkInsert { .. } | RowOperation::LinkDelete { .. } => {}
        }
    }
    let indirectly_modified: Vec<ObjectId> = changes
        .indirectly_modified
        .iter()
        .filter_map(|id| if id.is_temporary() { ids.get(id).cloned() } else { Some(id.clone()) })
        .filter(|id| !deleted.contains(id))
        .collect();
    if updated.is_empty() && deleted.is_empty() && invalidated.is_empty() && indirectly_modified.is_empty() {
        return;
    }
    row_store.process_snapshot_changes(source, updated, deleted, invalidated, indirectly_modified);
}
