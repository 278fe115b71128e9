//! Per-object change tracking.
//!
//! An [`ObjectDiff`] is created the first time a clean object is touched. It
//! captures the attribute and to-one baseline at that moment and accumulates
//! explicit graph operations until the next commit or rollback.

use std::collections::HashMap;
use std::sync::Arc;

use rowgraph_core::{
    EntityDescriptor, Error, MappingErrorKind, ObjectId, PersistenceState, Property, Result,
    Value,
};

use crate::graph_diff::{ArcId, NodeDiff, next_diff_id};
use crate::object::{ObjectRef, PropertyValue};

/// Recorded changes of one dirty object.
#[derive(Debug)]
pub struct ObjectDiff {
    object: ObjectRef,
    descriptor: Arc<EntityDescriptor>,
    /// Diff id of the first change; orders the attribute pass.
    diff_id: u64,
    /// Attribute baseline. `None` for objects that were NEW when first touched.
    snapshot: Option<HashMap<String, Value>>,
    /// To-one baseline. Faulted relationships are absent.
    arc_snapshot: Option<HashMap<String, Option<ObjectId>>>,
    /// Pending link-table operations keyed by (relationship, target).
    flat_ops: HashMap<(String, ObjectId), NodeDiff>,
    /// Pending foreign key operations for relationships mapped on the other side.
    phantom_fks: HashMap<(ArcId, ObjectId), NodeDiff>,
    other_diffs: Vec<NodeDiff>,
}

impl ObjectDiff {
    pub(crate) fn new(object: ObjectRef, descriptor: Arc<EntityDescriptor>, diff_id: u64) -> Self {
        let (snapshot, arc_snapshot) = {
            let data = object.read();
            match data.state {
                PersistenceState::Committed
                | PersistenceState::Modified
                | PersistenceState::Deleted => {
                    let mut snapshot = HashMap::new();
                    let mut arcs = HashMap::new();
                    for attribute in &descriptor.attributes {
                        let value = data.attribute(&attribute.name).cloned().unwrap_or(Value::Null);
                        snapshot.insert(attribute.name.clone(), value);
                    }
                    for relationship in descriptor.relationships.iter().filter(|r| !r.is_to_many()) {
                        if let Some(target) = data.to_one(&relationship.name) {
                            arcs.insert(relationship.name.clone(), target.cloned());
                        }
                    }
                    (Some(snapshot), Some(arcs))
                }
                _ => (None, None),
            }
        };
        Self {
            object,
            descriptor,
            diff_id,
            snapshot,
            arc_snapshot,
            flat_ops: HashMap::new(),
            phantom_fks: HashMap::new(),
            other_diffs: Vec::new(),
        }
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn diff_id(&self) -> u64 {
        self.diff_id
    }

    pub fn snapshot_value(&self, property: &str) -> Option<&Value> {
        self.snapshot.as_ref()?.get(property)
    }

    pub fn arc_snapshot_value(&self, property: &str) -> Option<Option<&ObjectId>> {
        self.arc_snapshot
            .as_ref()?
            .get(property)
            .map(Option::as_ref)
    }

    pub(crate) fn set_snapshot_value(&mut self, property: &str, value: Value) {
        if let Some(snapshot) = &mut self.snapshot {
            snapshot.insert(property.to_string(), value);
        }
    }

    pub(crate) fn set_arc_snapshot_value(&mut self, property: &str, target: Option<ObjectId>) {
        self.arc_snapshot
            .get_or_insert_with(HashMap::new)
            .insert(property.to_string(), target);
    }

    /// Drop the baseline so the object is replayed as a fresh insert.
    pub(crate) fn reset_as_new(&mut self) {
        self.snapshot = None;
        self.arc_snapshot = None;
    }

    pub fn has_flattened_ops(&self) -> bool {
        !self.flat_ops.is_empty()
    }

    /// Record one operation. Returns the complementary foreign key operation
    /// to register on the arc target, if the relationship has no mapped reverse.
    pub(crate) fn add_diff(&mut self, diff: NodeDiff) -> Result<Option<NodeDiff>> {
        let (node, target, arc, is_delete) = match &diff {
            NodeDiff::ArcCreated {
                node, target, arc, ..
            } => (node.clone(), target.clone(), arc.clone(), false),
            NodeDiff::ArcDeleted {
                node, target, arc, ..
            } => (node.clone(), target.clone(), arc.clone(), true),
            // Attribute changes are derived from the baseline at replay time.
            NodeDiff::NodePropertyChanged { .. } => return Ok(None),
            _ => {
                self.other_diffs.push(diff);
                return Ok(None);
            }
        };

        let name = match &arc {
            ArcId::Reverse { .. } => {
                Self::put_cancelling(&mut self.phantom_fks, (arc, target), diff);
                return Ok(None);
            }
            ArcId::Property(name) => name.clone(),
        };

        let complementary = |entity: &str, relationship: &str| {
            let reverse = ArcId::Reverse {
                entity: entity.to_string(),
                relationship: relationship.to_string(),
            };
            if is_delete {
                NodeDiff::ArcDeleted {
                    diff_id: next_diff_id(),
                    node: target.clone(),
                    target: node.clone(),
                    arc: reverse,
                }
            } else {
                NodeDiff::ArcCreated {
                    diff_id: next_diff_id(),
                    node: target.clone(),
                    target: node.clone(),
                    arc: reverse,
                }
            }
        };

        match self.descriptor.property(&name) {
            Some(Property::ToMany(rel)) if rel.is_flattened() => {
                Self::put_cancelling(&mut self.flat_ops, (name, target.clone()), diff);
                Ok(None)
            }
            Some(Property::ToMany(rel)) => {
                let extra = rel
                    .reverse
                    .is_none()
                    .then(|| complementary(&self.descriptor.name, &rel.name));
                self.other_diffs.push(diff);
                Ok(extra)
            }
            Some(Property::ToOne(rel)) => {
                let extra = (rel.reverse.is_none()
                    && rel.kind == rowgraph_core::RelationshipKind::OneToOne)
                    .then(|| complementary(&self.descriptor.name, &rel.name));
                self.other_diffs.push(diff);
                Ok(extra)
            }
            _ => Err(Error::mapping(
                MappingErrorKind::UnknownRelationship,
                format!("no relationship for arc '{}' on '{}'", name, self.descriptor.name),
            )),
        }
    }

    /// Insert `diff` under `key`; an opposite operation on the same key
    /// cancels both.
    fn put_cancelling<K: std::hash::Hash + Eq>(
        ops: &mut HashMap<K, NodeDiff>,
        key: K,
        diff: NodeDiff,
    ) {
        let cancels = matches!(
            (ops.get(&key), &diff),
            (Some(NodeDiff::ArcCreated { .. }), NodeDiff::ArcDeleted { .. })
                | (Some(NodeDiff::ArcDeleted { .. }), NodeDiff::ArcCreated { .. })
        );
        if cancels {
            ops.remove(&key);
        } else {
            ops.insert(key, diff);
        }
    }

    /// True when replaying this diff would change nothing downstream.
    /// Faulted to-one values are skipped rather than resolved.
    pub fn is_noop(&self) -> bool {
        let Some(snapshot) = &self.snapshot else {
            return false;
        };
        if !self.flat_ops.is_empty() || !self.phantom_fks.is_empty() {
            return false;
        }
        let data = self.object.read();
        if matches!(data.state, PersistenceState::New | PersistenceState::Deleted) {
            return false;
        }
        let arc_snapshot = self.arc_snapshot.as_ref();
        let changed = self.descriptor.visit_properties(|property| match property {
            Property::Attribute(attribute) => {
                let current = data.attribute(&attribute.name).unwrap_or(&Value::Null);
                let baseline = snapshot.get(&attribute.name).unwrap_or(&Value::Null);
                if current == baseline {
                    std::ops::ControlFlow::Continue(())
                } else {
                    std::ops::ControlFlow::Break(())
                }
            }
            Property::ToOne(rel) => {
                let current = match data.values.get(&rel.name) {
                    Some(PropertyValue::ToOne(target)) => target.as_ref(),
                    _ => return std::ops::ControlFlow::Continue(()),
                };
                match arc_snapshot.and_then(|s| s.get(&rel.name)) {
                    Some(baseline) if baseline.as_ref() != current => {
                        std::ops::ControlFlow::Break(())
                    }
                    _ => std::ops::ControlFlow::Continue(()),
                }
            }
            Property::ToMany(_) => std::ops::ControlFlow::Continue(()),
        });
        changed.is_none()
    }

    /// Explicit operations: node, arc, flattened and phantom foreign key ops.
    pub(crate) fn append_deltas(&self, out: &mut Vec<NodeDiff>) {
        out.extend(self.other_diffs.iter().cloned());
        out.extend(self.flat_ops.values().cloned());
        out.extend(self.phantom_fks.values().cloned());
    }

    /// Attribute changes against the baseline. Objects without a baseline
    /// report every non-null attribute.
    pub(crate) fn append_attribute_changes(&self, out: &mut Vec<NodeDiff>) {
        let data = self.object.read();
        if data.state == PersistenceState::Deleted {
            return;
        }
        for attribute in &self.descriptor.attributes {
            let current = data.attribute(&attribute.name).cloned().unwrap_or(Value::Null);
            let old = match &self.snapshot {
                None if current.is_null() => continue,
                None => Value::Null,
                Some(snapshot) => {
                    let old = snapshot.get(&attribute.name).cloned().unwrap_or(Value::Null);
                    if old == current {
                        continue;
                    }
                    old
                }
            };
            out.push(NodeDiff::NodePropertyChanged {
                diff_id: self.diff_id,
                node: data.id.clone(),
                property: attribute.name.clone(),
                old,
                new: current,
            });
        }
    }

    /// Flattened edges this diff creates, as (relationship, target) pairs.
    pub(crate) fn flattened_creates(&self) -> impl Iterator<Item = &(String, ObjectId)> {
        self.flat_ops
            .iter()
            .filter(|(_, op)| matches!(op, NodeDiff::ArcCreated { .. }))
            .map(|(key, _)| key)
    }

    pub(crate) fn flattened_deletes(&self) -> impl Iterator<Item = &(String, ObjectId)> {
        self.flat_ops
            .iter()
            .filter(|(_, op)| matches!(op, NodeDiff::ArcDeleted { .. }))
            .map(|(key, _)| key)
    }

    /// Replace every reference to `old` with `new`.
    pub(crate) fn rewrite_id(&mut self, old: &ObjectId, new: &ObjectId) {
        for diff in &mut self.other_diffs {
            diff.rewrite_id(old, new);
        }
        self.flat_ops = std::mem::take(&mut self.flat_ops)
            .into_iter()
            .map(|((rel, target), mut op)| {
                op.rewrite_id(old, new);
                let target = if &target == old { new.clone() } else { target };
                ((rel, target), op)
            })
            .collect();
        self.phantom_fks = std::mem::take(&mut self.phantom_fks)
            .into_iter()
            .map(|((arc, target), mut op)| {
                op.rewrite_id(old, new);
                let target = if &target == old { new.clone() } else { target };
                ((arc, target), op)
            })
            .collect();
        if let Some(arcs) = &mut self.arc_snapshot {
            for target in arcs.values_mut().flatten() {
                if target == old {
                    *target = new.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ManagedObject;
    use rowgraph_core::{AttributeInfo, EntityResolver, LinkTableInfo, RelationshipInfo};

    fn resolver() -> EntityResolver {
        EntityResolver::builder()
            .entity(
                EntityDescriptor::new("Artist", "ARTIST")
                    .primary_key(["ARTIST_ID"])
                    .attribute(AttributeInfo::new("name", "ARTIST_NAME"))
                    .relationship(RelationshipInfo::one_to_many(
                        "paintings",
                        "Painting",
                        "ARTIST_ID",
                        "ARTIST_ID",
                    ))
                    .relationship(RelationshipInfo::many_to_many(
                        "groups",
                        "Group",
                        LinkTableInfo::new("ARTIST_GROUP", "ARTIST_ID", "ARTIST_ID", "GROUP_ID", "GROUP_ID"),
                    )),
            )
            .entity(
                EntityDescriptor::new("Painting", "PAINTING")
                    .primary_key(["PAINTING_ID"])
                    .attribute(AttributeInfo::new("title", "TITLE")),
            )
            .entity(EntityDescriptor::new("Group", "GRP").primary_key(["GROUP_ID"]))
            .build()
            .unwrap()
    }

    fn committed_artist(name: &str) -> ObjectRef {
        let obj = ManagedObject::new(
            "Artist",
            ObjectId::of("Artist", "ARTIST_ID", 1i64),
            PersistenceState::Committed,
        );
        obj.write()
            .values
            .insert("name".into(), PropertyValue::Attribute(Value::from(name)));
        obj
    }

    fn arc(created: bool, node: &ObjectId, target: &ObjectId, rel: &str) -> NodeDiff {
        let (diff_id, node, target, arc) = (next_diff_id(), node.clone(), target.clone(), ArcId::property(rel));
        if created {
            NodeDiff::ArcCreated { diff_id, node, target, arc }
        } else {
            NodeDiff::ArcDeleted { diff_id, node, target, arc }
        }
    }

    #[test]
    fn test_set_then_unset_is_noop() {
        let resolver = resolver();
        let obj = committed_artist("a");
        let mut diff = ObjectDiff::new(obj.clone(), resolver.get("Artist").unwrap(), 1);
        obj.write()
            .values
            .insert("name".into(), PropertyValue::Attribute(Value::from("b")));
        assert!(!diff.is_noop());
        obj.write()
            .values
            .insert("name".into(), PropertyValue::Attribute(Value::from("a")));
        assert!(diff.is_noop());

        diff.add_diff(NodeDiff::NodePropertyChanged {
            diff_id: 2,
            node: obj.object_id(),
            property: "name".into(),
            old: Value::from("a"),
            new: Value::from("a"),
        })
        .unwrap();
        assert!(diff.is_noop());
    }

    #[test]
    fn test_flattened_ops_cancel() {
        let resolver = resolver();
        let obj = committed_artist("a");
        let mut diff = ObjectDiff::new(obj.clone(), resolver.get("Artist").unwrap(), 1);
        let group = ObjectId::of("Group", "GROUP_ID", 3i64);
        diff.add_diff(arc(true, &obj.object_id(), &group, "groups")).unwrap();
        assert!(!diff.is_noop());
        assert!(diff.has_flattened_ops());
        diff.add_diff(arc(false, &obj.object_id(), &group, "groups")).unwrap();
        assert!(!diff.has_flattened_ops());
        assert!(diff.is_noop());
        let mut out = Vec::new();
        diff.append_deltas(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_to_many_without_reverse_yields_phantom_fk() {
        let resolver = resolver();
        let obj = committed_artist("a");
        let mut diff = ObjectDiff::new(obj.clone(), resolver.get("Artist").unwrap(), 1);
        let painting = ObjectId::of("Painting", "PAINTING_ID", 9i64);
        let extra = diff
            .add_diff(arc(true, &obj.object_id(), &painting, "paintings"))
            .unwrap()
            .unwrap();
        match extra {
            NodeDiff::ArcCreated { node, target, arc, .. } => {
                assert_eq!(node, painting);
                assert_eq!(target, obj.object_id());
                assert_eq!(arc.to_string(), "db:Artist.paintings");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_arc_is_mapping_error() {
        let resolver = resolver();
        let obj = committed_artist("a");
        let mut diff = ObjectDiff::new(obj.clone(), resolver.get("Artist").unwrap(), 1);
        let err = diff
            .add_diff(arc(true, &obj.object_id(), &obj.object_id(), "nope"))
            .unwrap_err();
        assert!(err.is_fatal_mapping());
    }

    #[test]
    fn test_new_object_reports_all_non_null_attributes() {
        let resolver = resolver();
        let obj = ManagedObject::new("Artist", ObjectId::temporary("Artist"), PersistenceState::New);
        obj.write()
            .values
            .insert("name".into(), PropertyValue::Attribute(Value::from("x")));
        let diff = ObjectDiff::new(obj, resolver.get("Artist").unwrap(), 5);
        assert!(!diff.is_noop());
        let mut out = Vec::new();
        diff.append_attribute_changes(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff_id(), 5);
    }

    #[test]
    fn test_rewrite_id_rekeys_flattened_ops() {
        let resolver = resolver();
        let obj = committed_artist("a");
        let mut diff = ObjectDiff::new(obj.clone(), resolver.get("Artist").unwrap(), 1);
        let temp = ObjectId::temporary("Group");
        let perm = ObjectId::of("Group", "GROUP_ID", 4i64);
        diff.add_diff(arc(true, &obj.object_id(), &temp, "groups")).unwrap();
        diff.rewrite_id(&temp, &perm);
        let keys: Vec<_> = diff.flattened_creates().cloned().collect();
        assert_eq!(keys, vec![("groups".to_string(), perm)]);
    }
}
