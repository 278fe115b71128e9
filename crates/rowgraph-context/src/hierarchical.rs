//! Resolution of prefetch trees into connected object graphs.
//!
//! The prefetch tree is mirrored into an arena of processing nodes, one per
//! path. Nodes that are not joint own a select of their own; joint nodes ride
//! in the select of their nearest owning ancestor as outer-joined columns.
//! Three passes run over the arena:
//!
//! 1. fetch: owning nodes are selected by the join keys of their parent
//!    level's rows. A node under a joint parent has no parent rows yet and is
//!    deferred.
//! 2. resolve: rows become objects through the identity map. Each flat row
//!    of an owning level is walked for its joint descendants, which are
//!    deduplicated by id and attached to the object resolved for their
//!    parent in the same row. Deferred nodes are fetched once their parent
//!    level is resolved.
//! 3. connect: the collected parent/child associations are written into the
//!    relationships of clean parents and the fetched snapshots are published.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rowgraph_core::{
    DataRow, EntityResolver, Error, Expression, MappingErrorKind, ObjectId, PersistenceState,
    RelationshipInfo, RelationshipKind, Result, Value,
};

use crate::channel::{DataChannel, JointJoin, RowSelect};
use crate::object::{ContextId, ObjectRef, PropertyValue};
use crate::prefetch::{PrefetchSemantics, PrefetchTreeNode, join_path};
use crate::resolver::ObjectResolver;

#[derive(Debug)]
struct ProcessorNode {
    /// Absolute dotted path; empty for the root.
    path: String,
    semantics: PrefetchSemantics,
    entity: String,
    relationship: Option<RelationshipInfo>,
    parent: Option<usize>,
    children: Vec<usize>,
    /// Nearest ancestor-or-self that owns a select.
    owner: usize,
    deferred: bool,
    /// Owning nodes: the fetched flat rows. Joint nodes: own columns of each
    /// distinct object, in resolution order.
    rows: Vec<DataRow>,
    objects: Vec<ObjectRef>,
    seen: HashSet<ObjectId>,
    /// Parent id -> child ids.
    partitions: HashMap<ObjectId, Vec<ObjectId>>,
}

impl ProcessorNode {
    fn is_owner(&self) -> bool {
        self.parent.is_none() || self.semantics != PrefetchSemantics::Joint
    }

    fn attach(&mut self, parent: &ObjectId, child: &ObjectId) {
        let children = self.partitions.entry(parent.clone()).or_default();
        if !children.contains(child) {
            children.push(child.clone());
        }
    }
}

/// Fetches and resolves one query's prefetch tree.
pub(crate) struct HierarchicalResolver<'c, 'g, 'a> {
    channel: &'c dyn DataChannel,
    source: ContextId,
    max_ids: usize,
    resolver: Arc<EntityResolver>,
    objects: ObjectResolver<'g, 'a>,
    nodes: Vec<ProcessorNode>,
}

impl<'c, 'g, 'a> HierarchicalResolver<'c, 'g, 'a> {
    pub(crate) fn new(
        channel: &'c dyn DataChannel,
        source: ContextId,
        objects: ObjectResolver<'g, 'a>,
        root_entity: &str,
        prefetch: Option<&PrefetchTreeNode>,
    ) -> Result<Self> {
        let resolver = Arc::clone(channel.entity_resolver());
        let mut this = Self {
            channel,
            source,
            max_ids: channel.max_id_qualifier_size().max(1),
            resolver,
            objects,
            nodes: vec![ProcessorNode {
                path: String::new(),
                semantics: PrefetchSemantics::Disjoint,
                entity: root_entity.to_string(),
                relationship: None,
                parent: None,
                children: Vec::new(),
                owner: 0,
                deferred: false,
                rows: Vec::new(),
                objects: Vec::new(),
                seen: HashSet::new(),
                partitions: HashMap::new(),
            }],
        };
        if let Some(tree) = prefetch {
            tree.validate()?;
            this.add_children(0, tree)?;
        }
        Ok(this)
    }

    fn add_children(&mut self, parent: usize, tree: &PrefetchTreeNode) -> Result<()> {
        for child in tree.children() {
            let name = child.name().unwrap_or_default();
            let parent_entity = &self.nodes[parent].entity;
            let relationship = self
                .resolver
                .relationship_in_hierarchy(parent_entity, name)
                .cloned()
                .ok_or_else(|| {
                    Error::mapping(
                        MappingErrorKind::UnknownRelationship,
                        format!("no relationship '{}' on '{}' to prefetch", name, parent_entity),
                    )
                })?;
            let idx = self.nodes.len();
            let owner = if child.is_joint_prefetch() {
                self.nodes[parent].owner
            } else {
                idx
            };
            self.nodes.push(ProcessorNode {
                path: join_path(&self.nodes[parent].path, name),
                semantics: child.semantics(),
                entity: relationship.target_entity.clone(),
                relationship: Some(relationship),
                parent: Some(parent),
                children: Vec::new(),
                owner,
                deferred: false,
                rows: Vec::new(),
                objects: Vec::new(),
                seen: HashSet::new(),
                partitions: HashMap::new(),
            });
            self.nodes[parent].children.push(idx);
            self.add_children(idx, child)?;
        }
        Ok(())
    }

    /// Path of `idx` relative to its owning node.
    fn relative_path(&self, idx: usize) -> &str {
        let path = &self.nodes[idx].path;
        let owner = &self.nodes[self.nodes[idx].owner].path;
        if owner.is_empty() {
            return path;
        }
        path.strip_prefix(owner.as_str())
            .and_then(|p| p.strip_prefix('.'))
            .unwrap_or(path)
    }

    /// Joint nodes riding in the select of `owner`, parents before children.
    fn joint_descendants(&self, owner: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.nodes[owner].children.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            if self.nodes[idx].semantics == PrefetchSemantics::Joint {
                out.push(idx);
                stack.extend(self.nodes[idx].children.iter().rev().copied());
            }
        }
        out
    }

    /// Select for an owning node with its joint descendants joined in.
    fn select_for(&self, owner: usize, qualifier: Expression) -> Result<RowSelect> {
        let node = &self.nodes[owner];
        let mut select = RowSelect::new(&self.resolver, &node.entity)?.qualifier(qualifier);
        if let Some(link) = node.relationship.as_ref().and_then(|r| r.link_table.clone()) {
            select = select.linked(link);
        }
        for idx in self.joint_descendants(owner) {
            let joint = &self.nodes[idx];
            let parent_path = match joint.parent {
                Some(p) if p != owner => self.relative_path(p).to_string(),
                _ => String::new(),
            };
            let Some(relationship) = joint.relationship.clone() else {
                continue;
            };
            select = select.join(JointJoin {
                path: self.relative_path(idx).to_string(),
                parent_path,
                relationship,
                target_table: self.resolver.get(&joint.entity)?.table.clone(),
            });
        }
        Ok(select)
    }

    /// Select for the query root.
    pub(crate) fn root_select(&self, qualifier: Expression) -> Result<RowSelect> {
        self.select_for(0, qualifier)
    }

    /// Resolve the root rows and the whole prefetch tree. Returns the
    /// distinct root objects in row order.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %self.nodes[0].entity, nodes = self.nodes.len()))]
    pub(crate) fn run(mut self, root_rows: Vec<DataRow>) -> Result<Vec<ObjectRef>> {
        self.nodes[0].rows = root_rows;
        self.fetch_subtree(0)?;
        self.resolve_subtree(0)?;
        self.connect();
        let roots = std::mem::take(&mut self.nodes[0].objects);
        self.objects.finish();
        Ok(roots)
    }

    // ==================== Fetch ====================

    fn fetch_subtree(&mut self, idx: usize) -> Result<()> {
        let children = self.nodes[idx].children.clone();
        for child in children {
            if self.nodes[child].semantics == PrefetchSemantics::Joint {
                self.fetch_subtree(child)?;
            } else if self.nodes[idx].is_owner() {
                self.fetch_node(child)?;
                self.fetch_subtree(child)?;
            } else {
                tracing::trace!(path = %self.nodes[child].path, "deferring prefetch under joint parent");
                self.nodes[child].deferred = true;
            }
        }
        Ok(())
    }

    fn fetch_node(&mut self, idx: usize) -> Result<()> {
        let (Some(parent), Some(relationship)) = (self.nodes[idx].parent, self.nodes[idx].relationship.clone())
        else {
            return Ok(());
        };
        let (parent_columns, child_columns) = join_columns(&relationship);

        let mut seen = HashSet::new();
        let mut tuples = Vec::new();
        for row in &self.nodes[parent].rows {
            let tuple: Option<Vec<Value>> = parent_columns
                .iter()
                .map(|c| match row.value(c) {
                    Value::Null => None,
                    v => Some(v.clone()),
                })
                .collect();
            if let Some(tuple) = tuple {
                if seen.insert(tuple.clone()) {
                    tuples.push(tuple);
                }
            }
        }
        if tuples.is_empty() {
            tracing::trace!(path = %self.nodes[idx].path, "no parent keys, nothing to prefetch");
            return Ok(());
        }

        let batches = if self.nodes[idx].semantics == PrefetchSemantics::DisjointById {
            batch_tuples(tuples, child_columns.len(), self.max_ids)
        } else {
            vec![tuples]
        };
        let mut rows = Vec::new();
        for batch in batches {
            let select = self.select_for(idx, Expression::in_tuples(child_columns.clone(), batch))?;
            tracing::debug!(path = %self.nodes[idx].path, %select, "prefetch select");
            rows.extend(self.channel.on_select(self.source, &select)?);
        }
        self.nodes[idx].rows = rows;
        Ok(())
    }

    // ==================== Resolve ====================

    fn resolve_subtree(&mut self, idx: usize) -> Result<()> {
        if self.nodes[idx].is_owner() {
            if self.nodes[idx].deferred {
                self.fetch_node(idx)?;
                self.fetch_subtree(idx)?;
            }
            self.resolve_owner(idx)?;
        }
        let children = self.nodes[idx].children.clone();
        for child in children {
            self.resolve_subtree(child)?;
        }
        Ok(())
    }

    fn resolve_owner(&mut self, owner: usize) -> Result<()> {
        let rows = std::mem::take(&mut self.nodes[owner].rows);
        let joints = self.joint_descendants(owner);
        let prefixes: Vec<String> = joints
            .iter()
            .map(|&j| format!("{}.", self.relative_path(j)))
            .collect();

        for row in &rows {
            let Some(object) = self.resolve_row(owner, &row.own_columns())? else {
                continue;
            };
            // Object of each level in this flat row, for stack lookup.
            let mut current: HashMap<usize, ObjectId> = HashMap::new();
            current.insert(owner, object.object_id());
            for (&joint, prefix) in joints.iter().zip(&prefixes) {
                let Some(parent_id) = self.nodes[joint].parent.and_then(|p| current.get(&p)).cloned() else {
                    continue;
                };
                let Some(child) = self.resolve_row(joint, &row.sub_row(prefix))? else {
                    continue;
                };
                let child_id = child.object_id();
                self.nodes[joint].attach(&parent_id, &child_id);
                current.insert(joint, child_id);
            }
        }
        self.nodes[owner].rows = rows;

        if let Some(parent) = self.nodes[owner].parent {
            self.partition(owner, parent)?;
        }
        Ok(())
    }

    /// Resolve one row of a level, once per id.
    fn resolve_row(&mut self, idx: usize, row: &DataRow) -> Result<Option<ObjectRef>> {
        let entity = self.nodes[idx].entity.clone();
        let Some(id) = self.objects.id_for_row(&entity, row)? else {
            return Ok(None);
        };
        if self.nodes[idx].seen.contains(&id) {
            return Ok(self.objects.guard().get_node(&id));
        }
        let object = self.objects.object_from_row(&entity, row)?;
        if let Some(object) = &object {
            let node = &mut self.nodes[idx];
            node.seen.insert(id);
            node.objects.push(Arc::clone(object));
            if !node.is_owner() {
                node.rows.push(row.own_columns());
            }
        }
        Ok(object)
    }

    /// Associate the objects of an owning level with their parents.
    fn partition(&mut self, idx: usize, parent: usize) -> Result<()> {
        let Some(relationship) = self.nodes[idx].relationship.clone() else {
            return Ok(());
        };
        let mut pairs = Vec::new();
        if relationship.kind == RelationshipKind::ManyToOne {
            // Result scan: parent rows carry the foreign key.
            let parent_entity = self.nodes[parent].entity.clone();
            for row in &self.nodes[parent].rows {
                let Some(parent_id) = self.objects.id_for_row(&parent_entity, row)? else {
                    continue;
                };
                let Some(key) = relationship.target_id_from_source_row(row) else {
                    continue;
                };
                let target = self.resolver.object_id(&relationship.target_entity, key);
                if self.nodes[idx].seen.contains(&target) {
                    pairs.push((parent_id, target));
                }
            }
        } else {
            // Join key lookup: child rows carry the parent key.
            let entity = self.nodes[idx].entity.clone();
            for row in &self.nodes[idx].rows {
                let Some(key) = relationship.source_key_from_target_row(row) else {
                    continue;
                };
                let Some(child) = self.objects.id_for_row(&entity, row)? else {
                    continue;
                };
                pairs.push((self.resolver.object_id(&relationship.source_entity, key), child));
            }
        }
        let node = &mut self.nodes[idx];
        for (parent_id, child_id) in pairs {
            node.attach(&parent_id, &child_id);
        }
        Ok(())
    }

    // ==================== Connect ====================

    fn connect(&mut self) {
        for idx in 1..self.nodes.len() {
            let (Some(parent), Some(relationship)) = (self.nodes[idx].parent, self.nodes[idx].relationship.clone())
            else {
                continue;
            };
            let reverse = self.resolver.reverse_relationship(&relationship);
            let parents = self.nodes[parent].objects.clone();
            for parent_object in parents {
                let parent_id = parent_object.object_id();
                let children = self.nodes[idx].partitions.get(&parent_id).cloned().unwrap_or_default();

                if parent_object.persistence_state() == PersistenceState::Committed {
                    let mut data = parent_object.write();
                    if relationship.is_to_many() {
                        data.values
                            .insert(relationship.name.clone(), PropertyValue::ToMany(children.clone()));
                    } else if relationship.kind == RelationshipKind::OneToOne || !children.is_empty() {
                        data.values.insert(
                            relationship.name.clone(),
                            PropertyValue::ToOne(children.first().cloned()),
                        );
                    }
                }

                let guard = self.objects.guard();
                if relationship.is_flattened() {
                    for child in &children {
                        guard.mark_flattened_path(&parent_id, &relationship.name, child);
                        if let Some(reverse) = &reverse {
                            guard.mark_flattened_path(child, &reverse.name, &parent_id);
                        }
                    }
                }
                if let Some(reverse) = reverse.as_ref().filter(|r| !r.is_to_many()) {
                    for child in &children {
                        let Some(object) = guard.get_node(child) else {
                            continue;
                        };
                        if object.persistence_state() == PersistenceState::Committed {
                            object
                                .write()
                                .values
                                .insert(reverse.name.clone(), PropertyValue::ToOne(Some(parent_id.clone())));
                        }
                    }
                }
            }
            tracing::trace!(
                path = %self.nodes[idx].path,
                objects = self.nodes[idx].objects.len(),
                "prefetch level connected"
            );
        }
    }
}

/// Parent-side and child-side columns of a relationship's join. For
/// flattened relationships the child side is the link columns.
fn join_columns(relationship: &RelationshipInfo) -> (Vec<String>, Vec<String>) {
    match &relationship.link_table {
        Some(link) => link
            .source_joins
            .iter()
            .map(|j| (j.source.clone(), link.qualified_column(&j.target)))
            .unzip(),
        None => relationship
            .joins
            .iter()
            .map(|j| (j.source.clone(), j.target.clone()))
            .unzip(),
    }
}

/// Split key tuples so that no batch carries more than `max_terms` values.
/// A batch always holds at least one tuple.
fn batch_tuples(tuples: Vec<Vec<Value>>, width: usize, max_terms: usize) -> Vec<Vec<Vec<Value>>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut terms = 0;
    for tuple in tuples {
        if !current.is_empty() && terms + width > max_terms {
            batches.push(std::mem::take(&mut current));
            terms = 0;
        }
        terms += width;
        current.push(tuple);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_diff::GraphDiff;
    use crate::identity_map::ObjectStore;
    use crate::merge::AcceptAllMergePolicy;
    use crate::channel::SyncType;
    use crate::object::next_context_id;
    use crate::row_store::RowStore;
    use crate::test_support::{artist_id, artist_row, gallery, painting_id, painting_row};
    use std::sync::Mutex;

    /// Answers selects from canned row sets and records them.
    struct CannedChannel {
        resolver: Arc<EntityResolver>,
        max_ids: usize,
        tables: HashMap<String, Vec<DataRow>>,
        selects: Mutex<Vec<RowSelect>>,
    }

    impl CannedChannel {
        fn new(max_ids: usize) -> Self {
            Self {
                resolver: gallery(),
                max_ids,
                tables: HashMap::new(),
                selects: Mutex::new(Vec::new()),
            }
        }

        fn table(mut self, table: &str, rows: Vec<DataRow>) -> Self {
            self.tables.insert(table.to_string(), rows);
            self
        }
    }

    impl DataChannel for CannedChannel {
        fn entity_resolver(&self) -> &Arc<EntityResolver> {
            &self.resolver
        }

        fn row_store_for(&self, _context: ContextId) -> Option<Arc<RowStore>> {
            None
        }

        fn max_id_qualifier_size(&self) -> usize {
            self.max_ids
        }

        fn on_select(&self, _source: ContextId, select: &RowSelect) -> Result<Vec<DataRow>> {
            self.selects.lock().unwrap().push(select.clone());
            let rows = self.tables.get(&select.table).cloned().unwrap_or_default();
            Ok(rows.into_iter().filter(|r| select.qualifier.matches(r)).collect())
        }

        fn on_sync(&self, _source: ContextId, _diff: &GraphDiff, _sync: SyncType) -> Result<GraphDiff> {
            Ok(GraphDiff::new())
        }
    }

    fn store() -> ObjectStore {
        ObjectStore::new(next_context_id(), gallery(), None, Arc::new(AcceptAllMergePolicy))
    }

    #[test]
    fn test_batching_respects_max_terms() {
        let tuples: Vec<Vec<Value>> = (0..5).map(|i| vec![Value::BigInt(i)]).collect();
        let batches = batch_tuples(tuples.clone(), 1, 2);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        let wide: Vec<Vec<Value>> = tuples.into_iter().map(|t| vec![t[0].clone(), t[0].clone()]).collect();
        assert_eq!(batch_tuples(wide, 2, 3).len(), 5);
    }

    #[test]
    fn test_disjoint_by_id_splits_parent_keys() {
        let channel = CannedChannel::new(2).table(
            "PAINTING",
            (1..=5).map(|n| painting_row(n, n, "p")).collect(),
        );
        let store = store();
        let mut guard = store.lock();
        let objects = ObjectResolver::new(&mut guard, true);
        let tree = PrefetchTreeNode::with_path("paintings", PrefetchSemantics::DisjointById);
        let resolver = HierarchicalResolver::new(&channel, 1, objects, "Artist", Some(&tree)).unwrap();
        let roots = resolver
            .run((1..=5).map(|n| artist_row(n, "a")).collect())
            .unwrap();
        assert_eq!(roots.len(), 5);
        assert_eq!(channel.selects.lock().unwrap().len(), 3);
        for root in &roots {
            match root.read_property_directly("paintings") {
                Some(PropertyValue::ToMany(list)) => assert_eq!(list.len(), 1),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_disjoint_many_to_one() {
        let channel = CannedChannel::new(10).table("ARTIST", vec![artist_row(7, "seven")]);
        let store = store();
        let mut guard = store.lock();
        let objects = ObjectResolver::new(&mut guard, true);
        let tree = PrefetchTreeNode::with_path("artist", PrefetchSemantics::Disjoint);
        let resolver = HierarchicalResolver::new(&channel, 1, objects, "Painting", Some(&tree)).unwrap();
        let roots = resolver
            .run(vec![painting_row(1, 7, "a"), painting_row(2, 7, "b")])
            .unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(channel.selects.lock().unwrap().len(), 1);
        let artist = guard.get_node(&artist_id(7)).unwrap();
        assert_eq!(artist.persistence_state(), PersistenceState::Committed);
        assert_eq!(
            roots[0].read_property_directly("artist"),
            Some(PropertyValue::ToOne(Some(artist_id(7))))
        );
    }

    #[test]
    fn test_joint_rows_are_deduplicated() {
        let channel = CannedChannel::new(10);
        let store = store();
        let mut guard = store.lock();
        let objects = ObjectResolver::new(&mut guard, true);
        let tree = PrefetchTreeNode::with_path("paintings", PrefetchSemantics::Joint);
        let resolver = HierarchicalResolver::new(&channel, 1, objects, "Artist", Some(&tree)).unwrap();
        let select = resolver.root_select(Expression::True).unwrap();
        assert_eq!(select.joins.len(), 1);
        assert_eq!(select.joins[0].path, "paintings");

        let flat = |a: i64, p: Option<i64>| {
            let row = artist_row(a, "a");
            match p {
                Some(p) => row
                    .with("paintings.PAINTING_ID", p)
                    .with("paintings.ARTIST_ID", a)
                    .with("paintings.TITLE", "t")
                    .with("paintings.KIND", "P"),
                None => row.with("paintings.PAINTING_ID", Value::Null),
            }
        };
        let roots = resolver
            .run(vec![flat(1, Some(10)), flat(1, Some(11)), flat(2, Some(12)), flat(3, None)])
            .unwrap();
        assert_eq!(roots.len(), 3);
        let paintings = |n: usize| match roots[n].read_property_directly("paintings") {
            Some(PropertyValue::ToMany(list)) => list,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(paintings(0), vec![painting_id(10), painting_id(11)]);
        assert_eq!(paintings(1), vec![painting_id(12)]);
        assert!(paintings(2).is_empty());
        assert!(channel.selects.lock().unwrap().is_empty());
        assert_eq!(guard.len(), 6);
    }

    #[test]
    fn test_deferred_node_under_joint_parent() {
        let channel = CannedChannel::new(10).table(
            "GRP",
            vec![
                DataRow::new()
                    .with("GROUP_ID", 100i64)
                    .with("GROUP_NAME", "g")
                    .with("ARTIST_GROUP.ARTIST_ID", 1i64),
            ],
        );
        let store = store();
        let mut guard = store.lock();
        let objects = ObjectResolver::new(&mut guard, true);
        let mut tree = PrefetchTreeNode::with_path("artist", PrefetchSemantics::Joint);
        tree.add_path("artist.groups", PrefetchSemantics::Disjoint);
        let resolver = HierarchicalResolver::new(&channel, 1, objects, "Painting", Some(&tree)).unwrap();
        let row = painting_row(1, 1, "t")
            .with("artist.ARTIST_ID", 1i64)
            .with("artist.ARTIST_NAME", "a");
        let roots = resolver.run(vec![row]).unwrap();
        assert_eq!(roots.len(), 1);

        let selects = channel.selects.lock().unwrap();
        assert_eq!(selects.len(), 1);
        assert!(selects[0].link.is_some());
        let artist = guard.get_node(&artist_id(1)).unwrap();
        let group = ObjectId::of("Group", "GROUP_ID", 100i64);
        assert_eq!(
            artist.read_property_directly("groups"),
            Some(PropertyValue::ToMany(vec![group.clone()]))
        );
        assert!(guard.is_flattened_path(&artist_id(1), "groups", &group));
        assert!(guard.is_flattened_path(&group, "artists", &artist_id(1)));
    }

    #[test]
    fn test_unknown_relationship_is_mapping_error() {
        let channel = CannedChannel::new(10);
        let store = store();
        let mut guard = store.lock();
        let objects = ObjectResolver::new(&mut guard, true);
        let tree = PrefetchTreeNode::with_path("sculptures", PrefetchSemantics::Disjoint);
        let err = HierarchicalResolver::new(&channel, 1, objects, "Artist", Some(&tree)).err().unwrap();
        assert!(err.is_fatal_mapping());
    }
}
