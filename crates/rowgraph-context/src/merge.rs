//! Merging snapshots into managed objects.
//!
//! Two flavors exist. A *refresh* overwrites a clean object with a snapshot.
//! A *force merge* brings external changes into a dirty object, touching only
//! the properties that were not modified locally.

use std::fmt;

use rowgraph_core::{
    DataRow, EntityDescriptor, EntityResolver, ObjectId, PersistenceState, RelationshipInfo,
    RelationshipKind,
};

use crate::config::MergePolicyKind;
use crate::object::{ManagedObject, PropertyValue};
use crate::object_diff::ObjectDiff;

/// Hook consulted before externally arrived changes are merged into an
/// object. Every method defaults to accepting.
pub trait MergePolicy: Send + Sync {
    /// `changes` is the changed columns when known.
    fn should_merge_changes(&self, _object: &ManagedObject, _changes: Option<&DataRow>) -> bool {
        true
    }

    fn finished_merge_changes(&self, _object: &ManagedObject) {}

    fn should_process_delete(&self, _object: &ManagedObject) -> bool {
        true
    }

    fn finished_process_delete(&self, _object: &ManagedObject) {}
}

/// Accepts every change.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllMergePolicy;

impl MergePolicy for AcceptAllMergePolicy {}

/// Vetoes every external update and delete.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepLocalMergePolicy;

impl MergePolicy for KeepLocalMergePolicy {
    fn should_merge_changes(&self, object: &ManagedObject, _changes: Option<&DataRow>) -> bool {
        tracing::trace!(id = %object.object_id(), "keeping local state");
        false
    }

    fn should_process_delete(&self, _object: &ManagedObject) -> bool {
        false
    }
}

impl fmt::Debug for dyn MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MergePolicy")
    }
}

pub(crate) fn policy_for(kind: MergePolicyKind) -> std::sync::Arc<dyn MergePolicy> {
    match kind {
        MergePolicyKind::AcceptAll => std::sync::Arc::new(AcceptAllMergePolicy),
        MergePolicyKind::KeepLocal => std::sync::Arc::new(KeepLocalMergePolicy),
    }
}

/// Target of a foreign-key to-one read from a row. `None` when the row does
/// not carry the key columns at all (a partial snapshot).
pub(crate) fn to_one_from_row(
    resolver: &EntityResolver,
    relationship: &RelationshipInfo,
    row: &DataRow,
) -> Option<Option<ObjectId>> {
    if relationship.kind != RelationshipKind::ManyToOne
        || !relationship.joins.iter().all(|j| row.contains(&j.source))
    {
        return None;
    }
    Some(
        relationship
            .target_id_from_source_row(row)
            .map(|key| resolver.object_id(&relationship.target_entity, key)),
    )
}

/// Overwrite every attribute and foreign-key to-one from `snapshot`. Other
/// to-ones become faults; to-many relationships become faults when
/// `invalidate_to_many` is set or they were never resolved.
pub(crate) fn refresh_object_with_snapshot(
    resolver: &EntityResolver,
    descriptor: &EntityDescriptor,
    object: &ManagedObject,
    snapshot: &DataRow,
    invalidate_to_many: bool,
) {
    let mut data = object.write();
    for attribute in &descriptor.attributes {
        data.values.insert(
            attribute.name.clone(),
            PropertyValue::Attribute(snapshot.value(&attribute.column).clone()),
        );
    }
    for relationship in &descriptor.relationships {
        if relationship.is_to_many() {
            if invalidate_to_many || !data.values.contains_key(&relationship.name) {
                data.values.insert(relationship.name.clone(), PropertyValue::Fault);
            }
            continue;
        }
        let value = match to_one_from_row(resolver, relationship, snapshot) {
            Some(target) => PropertyValue::ToOne(target),
            None => PropertyValue::Fault,
        };
        data.values.insert(relationship.name.clone(), value);
    }
    data.snapshot_version = Some(snapshot.version());
    if data.state == PersistenceState::Hollow {
        data.state = PersistenceState::Committed;
    }
    tracing::trace!(id = %data.id, version = snapshot.version(), "refreshed from snapshot");
}

/// Merge a possibly partial snapshot into a dirty object. Locally modified
/// properties are kept; unmodified ones take the new value and the diff
/// baseline follows so the merged value is not reported as a local change.
pub(crate) fn force_merge_with_snapshot(
    resolver: &EntityResolver,
    descriptor: &EntityDescriptor,
    object: &ManagedObject,
    snapshot: &DataRow,
    mut diff: Option<&mut ObjectDiff>,
) {
    let mut data = object.write();
    for attribute in &descriptor.attributes {
        if !snapshot.contains(&attribute.column) {
            continue;
        }
        let new = snapshot.value(&attribute.column);
        let current = data.attribute(&attribute.name).cloned().unwrap_or_default();
        let unmodified = diff
            .as_ref()
            .and_then(|d| d.snapshot_value(&attribute.name))
            .is_none_or(|baseline| *baseline == current);
        if unmodified && *new != current {
            data.values.insert(
                attribute.name.clone(),
                PropertyValue::Attribute(new.clone()),
            );
            if let Some(diff) = diff.as_deref_mut() {
                diff.set_snapshot_value(&attribute.name, new.clone());
            }
        }
    }
    for relationship in descriptor.relationships.iter().filter(|r| !r.is_to_many()) {
        let Some(new) = to_one_from_row(resolver, relationship, snapshot) else {
            continue;
        };
        let current = match data.values.get(&relationship.name) {
            Some(PropertyValue::ToOne(target)) => Some(target.clone()),
            _ => None,
        };
        let unmodified = match (diff.as_ref().and_then(|d| d.arc_snapshot_value(&relationship.name)), &current) {
            (Some(baseline), Some(current)) => baseline == current.as_ref(),
            _ => true,
        };
        if unmodified && current.as_ref() != Some(&new) {
            data.values.insert(relationship.name.clone(), PropertyValue::ToOne(new.clone()));
            if let Some(diff) = diff.as_deref_mut() {
                diff.set_arc_snapshot_value(&relationship.name, new);
            }
        }
    }
    tracing::trace!(id = %data.id, "force-merged snapshot");
}
