//! Turning fetched rows into managed objects.

use std::sync::Arc;

use rowgraph_core::{DataRow, EntityResolver, ObjectId, PersistenceState, Result};

use crate::identity_map::StoreGuard;
use crate::merge;
use crate::object::{ManagedObject, ObjectRef};

/// Resolves rows against one identity map.
///
/// Rows are mapped to the concrete entity they belong to, and their ids are
/// looked up in the map so that every row of the same object yields the same
/// instance. How a row is merged depends on the instance's state:
/// - HOLLOW objects are always filled, from the cached snapshot when the
///   query does not refresh and one exists
/// - COMMITTED objects are overwritten only by refreshing queries
/// - MODIFIED and DELETED objects take the row's values for properties not
///   changed locally, again only when refreshing
pub struct ObjectResolver<'g, 'a> {
    guard: &'g mut StoreGuard<'a>,
    resolver: Arc<EntityResolver>,
    refresh: bool,
    resolved: Vec<(ObjectRef, DataRow)>,
}

impl<'g, 'a> ObjectResolver<'g, 'a> {
    pub fn new(guard: &'g mut StoreGuard<'a>, refresh: bool) -> Self {
        let resolver = Arc::clone(guard.store().resolver());
        Self {
            guard,
            resolver,
            refresh,
            resolved: Vec::new(),
        }
    }

    pub(crate) fn guard(&mut self) -> &mut StoreGuard<'a> {
        self.guard
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    /// Id of the object a row fetched for `root_entity` describes, or `None`
    /// for a row with a null key.
    pub fn id_for_row(&self, root_entity: &str, row: &DataRow) -> Result<Option<ObjectId>> {
        let descriptor = self.resolver.descriptor_for_row(root_entity, row)?;
        Ok(self.resolver.id_from_row(&descriptor, row))
    }

    /// The managed object for one row; `None` when the row's key is null,
    /// as for an outer join that matched nothing.
    pub fn object_from_row(&mut self, root_entity: &str, row: &DataRow) -> Result<Option<ObjectRef>> {
        let descriptor = self.resolver.descriptor_for_row(root_entity, row)?;
        let Some(id) = self.resolver.id_from_row(&descriptor, row) else {
            return Ok(None);
        };
        let object = self.guard.find_or_register(&id, || {
            ManagedObject::new(descriptor.name.clone(), id.clone(), PersistenceState::Hollow)
        })?;

        let state = object.persistence_state();
        if state == PersistenceState::Hollow {
            let current = object.entity_name();
            if current != descriptor.name && self.resolver.is_subentity_of(&descriptor.name, &current) {
                tracing::trace!(%id, from = %current, to = %descriptor.name, "narrowing hollow object");
                object.write().entity.clone_from(&descriptor.name);
            }
        }
        let descriptor = self.guard.descriptor_of(&object)?;
        let own = row.own_columns();

        match state {
            PersistenceState::Hollow => {
                let cached = if self.refresh {
                    None
                } else {
                    self.guard
                        .store()
                        .row_store()
                        .and_then(|rs| rs.get_cached_snapshot(&id))
                };
                let snapshot = cached.as_ref().unwrap_or(&own);
                merge::refresh_object_with_snapshot(&self.resolver, &descriptor, &object, snapshot, self.refresh);
            }
            PersistenceState::Committed if self.refresh => {
                merge::refresh_object_with_snapshot(&self.resolver, &descriptor, &object, &own, true);
            }
            PersistenceState::Modified | PersistenceState::Deleted if self.refresh => {
                let diff = self.guard.diff_for_mut(&id);
                merge::force_merge_with_snapshot(&self.resolver, &descriptor, &object, &own, diff);
            }
            _ => {}
        }
        self.resolved.push((Arc::clone(&object), own));
        Ok(Some(object))
    }

    /// Resolve every row; rows with null keys are skipped.
    pub fn objects_from_rows(&mut self, root_entity: &str, rows: &[DataRow]) -> Result<Vec<ObjectRef>> {
        let mut objects = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(object) = self.object_from_row(root_entity, row)? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Publish the snapshots of everything resolved so far to the row store.
    pub fn finish(self) {
        let Some(row_store) = self.guard.store().row_store() else {
            return;
        };
        if self.resolved.is_empty() {
            return;
        }
        row_store.snapshots_updated_for_objects(self.guard.store().context_id(), &self.resolved, self.refresh);
    }
}
