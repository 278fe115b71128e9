//! Row operation ordering for commits.
//!
//! A commit is turned into row operations which are executed in an order
//! that respects foreign keys:
//! - INSERT parent-first
//! - UPDATE next, so foreign keys are cleared before their targets go away
//! - link rows are removed, then added
//! - DELETE child-first

use std::collections::{BTreeMap, HashMap};

use rowgraph_core::{
    CommitError, CommitErrorKind, EntityResolver, Error, Expression, ObjectId, RelationshipKind,
    Result, Value,
};

use crate::channel::{DataSource, Transaction};

/// One row-level statement.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOperation {
    Insert {
        id: ObjectId,
        table: String,
        values: BTreeMap<String, Value>,
    },
    Update {
        id: ObjectId,
        table: String,
        /// Changed columns only.
        values: BTreeMap<String, Value>,
        qualifier: Expression,
        /// The qualifier includes locking columns; zero affected rows is a conflict.
        optimistic: bool,
    },
    Delete {
        id: ObjectId,
        table: String,
        qualifier: Expression,
        optimistic: bool,
    },
    LinkInsert {
        table: String,
        values: BTreeMap<String, Value>,
    },
    LinkDelete {
        table: String,
        values: BTreeMap<String, Value>,
    },
}

impl RowOperation {
    pub fn table(&self) -> &str {
        match self {
            RowOperation::Insert { table, .. }
            | RowOperation::Update { table, .. }
            | RowOperation::Delete { table, .. }
            | RowOperation::LinkInsert { table, .. }
            | RowOperation::LinkDelete { table, .. } => table,
        }
    }

    /// Object the operation writes, if any.
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            RowOperation::Insert { id, .. }
            | RowOperation::Update { id, .. }
            | RowOperation::Delete { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, RowOperation::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, RowOperation::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RowOperation::Delete { .. })
    }

    fn is_optimistic(&self) -> bool {
        matches!(
            self,
            RowOperation::Update { optimistic: true, .. } | RowOperation::Delete { optimistic: true, .. }
        )
    }
}

/// Orders operations by table dependencies.
///
/// A table depends on the tables its many-to-one foreign keys point to:
/// - parents are inserted before children
/// - children are deleted before parents
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Table -> tables it depends on (has FK to).
    dependencies: HashMap<String, Vec<String>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every entity's foreign key dependencies.
    pub fn from_resolver(resolver: &EntityResolver) -> Self {
        let mut orderer = Self::new();
        for name in resolver.entity_names() {
            let Ok(descriptor) = resolver.get(name) else {
                continue;
            };
            let deps: Vec<String> = descriptor
                .relationships
                .iter()
                .filter(|r| r.kind == RelationshipKind::ManyToOne)
                .filter_map(|r| resolver.get(&r.target_entity).ok())
                .map(|target| target.table.clone())
                .filter(|table| *table != descriptor.table)
                .collect();
            orderer
                .dependencies
                .entry(descriptor.table.clone())
                .or_default()
                .extend(deps);
        }
        orderer
    }

    /// Register a table's dependencies directly.
    pub fn register_table(&mut self, table: impl Into<String>, depends_on: Vec<String>) {
        self.dependencies.insert(table.into(), depends_on);
    }

    /// Length of the longest dependency chain starting at `table`.
    fn depth(&self, table: &str) -> usize {
        fn walk<'a>(deps: &'a HashMap<String, Vec<String>>, table: &'a str, seen: &mut Vec<&'a str>) -> usize {
            if seen.contains(&table) {
                return 0;
            }
            seen.push(table);
            let depth = deps
                .get(table)
                .map_or(0, |d| d.iter().map(|t| 1 + walk(deps, t, seen)).max().unwrap_or(0));
            seen.pop();
            depth
        }
        walk(&self.dependencies, table, &mut Vec::new())
    }

    /// Split operations into a flush plan. Sorting is stable, so operations
    /// on tables of equal depth keep their commit order.
    pub fn order(&self, ops: Vec<RowOperation>) -> FlushPlan {
        let mut plan = FlushPlan::new();
        for op in ops {
            match op {
                RowOperation::Insert { .. } => plan.inserts.push(op),
                RowOperation::Update { .. } => plan.updates.push(op),
                RowOperation::Delete { .. } => plan.deletes.push(op),
                RowOperation::LinkInsert { .. } => plan.link_inserts.push(op),
                RowOperation::LinkDelete { .. } => plan.link_deletes.push(op),
            }
        }

        // Inserts: parents first (shallower = insert first)
        plan.inserts.sort_by_key(|op| self.depth(op.table()));
        // Deletes: children first (deeper = delete first)
        plan.deletes
            .sort_by_key(|op| std::cmp::Reverse(self.depth(op.table())));
        plan
    }
}

/// Ordered row operations of one commit.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Ordered parent-first.
    pub inserts: Vec<RowOperation>,
    pub updates: Vec<RowOperation>,
    pub link_deletes: Vec<RowOperation>,
    pub link_inserts: Vec<RowOperation>,
    /// Ordered child-first.
    pub deletes: Vec<RowOperation>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.inserts.len()
            + self.updates.len()
            + self.link_deletes.len()
            + self.link_inserts.len()
            + self.deletes.len()
    }

    /// Operations in execution order.
    pub fn operations(&self) -> impl Iterator<Item = &RowOperation> {
        self.inserts
            .iter()
            .chain(&self.updates)
            .chain(&self.link_deletes)
            .chain(&self.link_inserts)
            .chain(&self.deletes)
    }

    /// Run the plan inside `transaction`. An optimistic update or delete that
    /// affects no row aborts with an optimistic-lock failure.
    #[tracing::instrument(level = "debug", skip_all, fields(operations = self.len()))]
    pub fn execute(&self, source: &dyn DataSource, transaction: &dyn Transaction) -> Result<FlushResult> {
        tracing::debug!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len(),
            links = self.link_inserts.len() + self.link_deletes.len(),
            "Executing flush plan"
        );

        let mut result = FlushResult::default();
        for op in self.operations() {
            let affected = source.execute(transaction, op)?;
            if affected == 0 && !op.is_insert() {
                if op.is_optimistic() {
                    return Err(Error::Commit(CommitError {
                        kind: CommitErrorKind::OptimisticLock,
                        message: format!("no row of {} matched the locking qualifier", op.table()),
                        failed_ids: op.object_id().cloned().into_iter().collect(),
                        source: None,
                    }));
                }
                tracing::warn!(table = op.table(), id = ?op.object_id(), "operation affected no rows");
            }
            match op {
                RowOperation::Insert { .. } => result.inserted += 1,
                RowOperation::Update { .. } => result.updated += 1,
                RowOperation::Delete { .. } => result.deleted += 1,
                RowOperation::LinkInsert { .. } | RowOperation::LinkDelete { .. } => result.linked += 1,
            }
        }

        tracing::debug!(total = result.total(), "Flush complete");
        Ok(result)
    }
}

/// Counts of executed operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Link rows inserted or deleted.
    pub linked: usize,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.linked
    }
}
