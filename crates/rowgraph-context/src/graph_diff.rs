//! Graph-level change records.
//!
//! Every recorded change is a [`NodeDiff`] stamped with a process-wide,
//! strictly increasing diff id. A [`GraphDiff`] is an ordered list of them that
//! can be replayed against any [`GraphChangeHandler`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rowgraph_core::{ObjectId, Value};
use serde::{Deserialize, Serialize};

static NEXT_DIFF_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next diff sequence id.
pub fn next_diff_id() -> u64 {
    NEXT_DIFF_ID.fetch_add(1, Ordering::Relaxed)
}

/// Name of a relationship edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArcId {
    /// A mapped relationship of the node.
    Property(String),
    /// Foreign key owned by the node for a relationship mapped only on the
    /// other side (`entity.relationship` points from the arc target to the node).
    Reverse { entity: String, relationship: String },
}

impl ArcId {
    pub fn property(name: impl Into<String>) -> Self {
        ArcId::Property(name.into())
    }

    pub fn as_property(&self) -> Option<&str> {
        match self {
            ArcId::Property(name) => Some(name),
            ArcId::Reverse { .. } => None,
        }
    }
}

impl fmt::Display for ArcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArcId::Property(name) => f.write_str(name),
            ArcId::Reverse {
                entity,
                relationship,
            } => write!(f, "db:{entity}.{relationship}"),
        }
    }
}

/// One recorded change to the object graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeDiff {
    NodeCreated {
        diff_id: u64,
        node: ObjectId,
        entity: String,
    },
    NodeRemoved {
        diff_id: u64,
        node: ObjectId,
    },
    NodePropertyChanged {
        diff_id: u64,
        node: ObjectId,
        property: String,
        old: Value,
        new: Value,
    },
    ArcCreated {
        diff_id: u64,
        node: ObjectId,
        target: ObjectId,
        arc: ArcId,
    },
    ArcDeleted {
        diff_id: u64,
        node: ObjectId,
        target: ObjectId,
        arc: ArcId,
    },
    NodeIdChanged {
        diff_id: u64,
        node: ObjectId,
        new_id: ObjectId,
    },
}

impl NodeDiff {
    pub fn diff_id(&self) -> u64 {
        match self {
            NodeDiff::NodeCreated { diff_id, .. }
            | NodeDiff::NodeRemoved { diff_id, .. }
            | NodeDiff::NodePropertyChanged { diff_id, .. }
            | NodeDiff::ArcCreated { diff_id, .. }
            | NodeDiff::ArcDeleted { diff_id, .. }
            | NodeDiff::NodeIdChanged { diff_id, .. } => *diff_id,
        }
    }

    pub(crate) fn set_diff_id(&mut self, id: u64) {
        match self {
            NodeDiff::NodeCreated { diff_id, .. }
            | NodeDiff::NodeRemoved { diff_id, .. }
            | NodeDiff::NodePropertyChanged { diff_id, .. }
            | NodeDiff::ArcCreated { diff_id, .. }
            | NodeDiff::ArcDeleted { diff_id, .. }
            | NodeDiff::NodeIdChanged { diff_id, .. } => *diff_id = id,
        }
    }

    pub fn node(&self) -> &ObjectId {
        match self {
            NodeDiff::NodeCreated { node, .. }
            | NodeDiff::NodeRemoved { node, .. }
            | NodeDiff::NodePropertyChanged { node, .. }
            | NodeDiff::ArcCreated { node, .. }
            | NodeDiff::ArcDeleted { node, .. }
            | NodeDiff::NodeIdChanged { node, .. } => node,
        }
    }

    pub(crate) fn node_mut(&mut self) -> &mut ObjectId {
        match self {
            NodeDiff::NodeCreated { node, .. }
            | NodeDiff::NodeRemoved { node, .. }
            | NodeDiff::NodePropertyChanged { node, .. }
            | NodeDiff::ArcCreated { node, .. }
            | NodeDiff::ArcDeleted { node, .. }
            | NodeDiff::NodeIdChanged { node, .. } => node,
        }
    }

    /// Swap references to `old` for `new` in node and arc target positions.
    pub(crate) fn rewrite_id(&mut self, old: &ObjectId, new: &ObjectId) {
        if self.node() == old {
            *self.node_mut() = new.clone();
        }
        if let NodeDiff::ArcCreated { target, .. } | NodeDiff::ArcDeleted { target, .. } = self {
            if target == old {
                *target = new.clone();
            }
        }
    }

    pub fn apply(&self, handler: &mut dyn GraphChangeHandler) {
        match self {
            NodeDiff::NodeCreated { node, entity, .. } => handler.node_created(node, entity),
            NodeDiff::NodeRemoved { node, .. } => handler.node_removed(node),
            NodeDiff::NodePropertyChanged {
                node,
                property,
                old,
                new,
                ..
            } => handler.node_property_changed(node, property, old, new),
            NodeDiff::ArcCreated {
                node, target, arc, ..
            } => handler.arc_created(node, target, arc),
            NodeDiff::ArcDeleted {
                node, target, arc, ..
            } => handler.arc_deleted(node, target, arc),
            NodeDiff::NodeIdChanged { node, new_id, .. } => handler.node_id_changed(node, new_id),
        }
    }

    /// The inverse operation.
    pub fn inverse(&self) -> NodeDiff {
        match self.clone() {
            NodeDiff::NodeCreated { diff_id, node, .. } => NodeDiff::NodeRemoved { diff_id, node },
            NodeDiff::NodeRemoved { diff_id, node } => NodeDiff::NodeCreated {
                diff_id,
                entity: node.entity_name().to_string(),
                node,
            },
            NodeDiff::NodePropertyChanged {
                diff_id,
                node,
                property,
                old,
                new,
            } => NodeDiff::NodePropertyChanged {
                diff_id,
                node,
                property,
                old: new,
                new: old,
            },
            NodeDiff::ArcCreated {
                diff_id,
                node,
                target,
                arc,
            } => NodeDiff::ArcDeleted {
                diff_id,
                node,
                target,
                arc,
            },
            NodeDiff::ArcDeleted {
                diff_id,
                node,
                target,
                arc,
            } => NodeDiff::ArcCreated {
                diff_id,
                node,
                target,
                arc,
            },
            NodeDiff::NodeIdChanged {
                diff_id,
                node,
                new_id,
            } => NodeDiff::NodeIdChanged {
                diff_id,
                node: new_id,
                new_id: node,
            },
        }
    }
}

/// Receiver of replayed graph changes. Every method defaults to doing nothing.
pub trait GraphChangeHandler {
    fn node_id_changed(&mut self, _node: &ObjectId, _new_id: &ObjectId) {}
    fn node_created(&mut self, _node: &ObjectId, _entity: &str) {}
    fn node_removed(&mut self, _node: &ObjectId) {}
    fn node_property_changed(
        &mut self,
        _node: &ObjectId,
        _property: &str,
        _old: &Value,
        _new: &Value,
    ) {
    }
    fn arc_created(&mut self, _node: &ObjectId, _target: &ObjectId, _arc: &ArcId) {}
    fn arc_deleted(&mut self, _node: &ObjectId, _target: &ObjectId, _arc: &ArcId) {}
}

/// Ordered compound of node diffs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDiff {
    diffs: Vec<NodeDiff>,
}

impl GraphDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_diffs(diffs: Vec<NodeDiff>) -> Self {
        Self { diffs }
    }

    pub fn push(&mut self, diff: NodeDiff) {
        self.diffs.push(diff);
    }

    pub fn extend(&mut self, other: GraphDiff) {
        self.diffs.extend(other.diffs);
    }

    pub fn is_noop(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeDiff> {
        self.diffs.iter()
    }

    /// Replay in order.
    pub fn apply(&self, handler: &mut dyn GraphChangeHandler) {
        for diff in &self.diffs {
            diff.apply(handler);
        }
    }

    /// Replay the inverse operations in reverse order.
    pub fn undo(&self, handler: &mut dyn GraphChangeHandler) {
        for diff in self.diffs.iter().rev() {
            diff.inverse().apply(handler);
        }
    }

    /// Id replacements carried by this diff.
    pub fn id_changes(&self) -> impl Iterator<Item = (&ObjectId, &ObjectId)> {
        self.diffs.iter().filter_map(|d| match d {
            NodeDiff::NodeIdChanged { node, new_id, .. } => Some((node, new_id)),
            _ => None,
        })
    }

    pub fn to_json(&self) -> rowgraph_core::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl IntoIterator for GraphDiff {
    type Item = NodeDiff;
    type IntoIter = std::vec::IntoIter<NodeDiff>;

    fn into_iter(self) -> Self::IntoIter {
        self.diffs.into_iter()
    }
}
