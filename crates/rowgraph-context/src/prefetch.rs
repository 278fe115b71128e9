//! Prefetch trees.
//!
//! A [`PrefetchTreeNode`] describes relationship paths to load together with
//! the objects of a query. Each node carries a [`PrefetchSemantics`]: joint
//! nodes ride along in the parent's query as outer-joined columns, disjoint
//! and disjoint-by-id nodes get queries of their own restricted to the
//! parent level's join keys.

use std::fmt;

use rowgraph_core::{Error, MappingErrorKind, Result};
use serde::{Deserialize, Serialize};

/// How one prefetch level is fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchSemantics {
    #[default]
    Undefined,
    /// Outer-joined into the parent query; parent rows repeat per child.
    Joint,
    /// One query for the whole level.
    Disjoint,
    /// Queries over batches of parent keys, bounded by the max id-qualifier size.
    DisjointById,
}

impl fmt::Display for PrefetchSemantics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrefetchSemantics::Undefined => "undefined",
            PrefetchSemantics::Joint => "joint",
            PrefetchSemantics::Disjoint => "disjoint",
            PrefetchSemantics::DisjointById => "disjoint-by-id",
        };
        f.write_str(name)
    }
}

/// One node of a prefetch tree. The root has no name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrefetchTreeNode {
    name: Option<String>,
    semantics: PrefetchSemantics,
    /// Created as an intermediate step of a longer path rather than
    /// requested explicitly.
    phantom: bool,
    children: Vec<PrefetchTreeNode>,
}

impl PrefetchTreeNode {
    pub fn root() -> Self {
        Self {
            phantom: true,
            ..Self::default()
        }
    }

    /// Tree with a single dotted path.
    pub fn with_path(path: &str, semantics: PrefetchSemantics) -> Self {
        let mut root = Self::root();
        root.add_path(path, semantics);
        root
    }

    /// Add a dotted relationship path. Missing intermediate nodes are created
    /// as phantoms with the same semantics, so that each level has rows to
    /// connect the next one to. An explicit path turns an existing phantom
    /// into a requested node.
    pub fn add_path(&mut self, path: &str, semantics: PrefetchSemantics) -> &mut Self {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let mut node = self;
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            let index = match node.children.iter().position(|c| c.name.as_deref() == Some(segment)) {
                Some(index) => index,
                None => {
                    node.children.push(PrefetchTreeNode {
                        name: Some((*segment).to_string()),
                        semantics,
                        phantom: true,
                        children: Vec::new(),
                    });
                    node.children.len() - 1
                }
            };
            node = &mut node.children[index];
            if last {
                node.phantom = false;
                node.semantics = semantics;
            }
        }
        node
    }

    /// Merge every path of `other` into this tree.
    pub fn merge(&mut self, other: &PrefetchTreeNode) {
        let mut paths = Vec::new();
        other.collect_paths("", &mut paths);
        for (path, semantics) in paths {
            self.add_path(&path, semantics);
        }
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<(String, PrefetchSemantics)>) {
        for child in &self.children {
            let path = join_path(prefix, child.name.as_deref().unwrap_or_default());
            if !child.phantom {
                out.push((path.clone(), child.semantics));
            }
            child.collect_paths(&path, out);
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn semantics(&self) -> PrefetchSemantics {
        self.semantics
    }

    pub fn is_phantom(&self) -> bool {
        self.phantom
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> &[PrefetchTreeNode] {
        &self.children
    }

    pub fn is_joint_prefetch(&self) -> bool {
        self.semantics == PrefetchSemantics::Joint
    }

    pub fn is_disjoint_prefetch(&self) -> bool {
        self.semantics == PrefetchSemantics::Disjoint
    }

    pub fn is_disjoint_by_id_prefetch(&self) -> bool {
        self.semantics == PrefetchSemantics::DisjointById
    }

    /// Node at a dotted path below this one.
    pub fn node(&self, path: &str) -> Option<&PrefetchTreeNode> {
        path.split('.')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, segment| {
                node.children.iter().find(|c| c.name.as_deref() == Some(segment))
            })
    }

    /// Depth-first walk. A processor returning `false` from a `start_*`
    /// method skips that node's children.
    pub fn traverse(&self, processor: &mut dyn PrefetchProcessor) -> Result<()> {
        self.traverse_at("", processor)
    }

    fn traverse_at(&self, path: &str, processor: &mut dyn PrefetchProcessor) -> Result<()> {
        let descend = if self.name.is_none() {
            processor.start_root(self)?
        } else {
            match self.semantics {
                PrefetchSemantics::Joint => processor.start_joint(path, self)?,
                PrefetchSemantics::Disjoint => processor.start_disjoint(path, self)?,
                PrefetchSemantics::DisjointById => processor.start_disjoint_by_id(path, self)?,
                PrefetchSemantics::Undefined => processor.start_unknown(path, self)?,
            }
        };
        if descend {
            for child in &self.children {
                let child_path = join_path(path, child.name.as_deref().unwrap_or_default());
                child.traverse_at(&child_path, processor)?;
            }
        }
        processor.finish(path, self)
    }

    /// Reject nodes with undefined semantics.
    pub fn validate(&self) -> Result<()> {
        self.traverse(&mut SemanticsValidator)
    }
}

pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Visitor over a prefetch tree, dispatched on node semantics.
pub trait PrefetchProcessor {
    fn start_root(&mut self, _node: &PrefetchTreeNode) -> Result<bool> {
        Ok(true)
    }

    fn start_joint(&mut self, path: &str, node: &PrefetchTreeNode) -> Result<bool>;

    fn start_disjoint(&mut self, path: &str, node: &PrefetchTreeNode) -> Result<bool>;

    fn start_disjoint_by_id(&mut self, path: &str, node: &PrefetchTreeNode) -> Result<bool>;

    fn start_unknown(&mut self, path: &str, _node: &PrefetchTreeNode) -> Result<bool> {
        Err(unknown_semantics(path))
    }

    fn finish(&mut self, _path: &str, _node: &PrefetchTreeNode) -> Result<()> {
        Ok(())
    }
}

fn unknown_semantics(path: &str) -> Error {
    Error::mapping(
        MappingErrorKind::UnknownPrefetchSemantics,
        format!("prefetch '{path}' has undefined semantics"),
    )
}

struct SemanticsValidator;

impl PrefetchProcessor for SemanticsValidator {
    fn start_joint(&mut self, _path: &str, _node: &PrefetchTreeNode) -> Result<bool> {
        Ok(true)
    }

    fn start_disjoint(&mut self, _path: &str, _node: &PrefetchTreeNode) -> Result<bool> {
        Ok(true)
    }

    fn start_disjoint_by_id(&mut self, _path: &str, _node: &PrefetchTreeNode) -> Result<bool> {
        Ok(true)
    }
}
