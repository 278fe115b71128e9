//! Contracts between contexts and whatever sits behind them.
//!
//! A [`DataChannel`] is the parent of a context: either the root
//! [`DataDomain`](crate::domain::DataDomain) talking to a [`DataSource`], or
//! another [`DataContext`](crate::context::DataContext) for nested editing.
//! Data sources only ever see [`RowSelect`]s and
//! [`RowOperation`](crate::flush::RowOperation)s; they never learn about
//! managed objects.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use rowgraph_core::{
    DataRow, EntityDescriptor, EntityResolver, Expression, LinkTableInfo, ObjectId,
    RelationshipInfo, Result, Value,
};

use crate::flush::RowOperation;
use crate::graph_diff::GraphDiff;
use crate::object::{ContextId, PropertyValue};
use crate::row_store::{RowStore, StoreEvent};

// ==================== Selects ====================

/// A relationship outer-joined into a select by a joint prefetch. Columns of
/// the joined table come back prefixed with `path.`.
#[derive(Debug, Clone, PartialEq)]
pub struct JointJoin {
    /// Dotted prefetch path, relative to the select's root.
    pub path: String,
    /// Path of the table the join starts from; empty for the root table.
    pub parent_path: String,
    pub relationship: RelationshipInfo,
    pub target_table: String,
}

/// A select against one table, expressed without any query language.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSelect {
    pub entity: String,
    pub table: String,
    pub qualifier: Expression,
    /// Join the link table of a flattened relationship. Link columns are
    /// exposed as `TABLE.COLUMN` and may appear in the qualifier.
    pub link: Option<LinkTableInfo>,
    pub joins: Vec<JointJoin>,
    /// Set when the select fetches exactly one known object.
    pub object_id: Option<ObjectId>,
}

impl RowSelect {
    /// Select of `entity`'s table, restricted to the entity and its
    /// sub-entities when the table is shared.
    pub fn new(resolver: &EntityResolver, entity: &str) -> Result<Self> {
        let descriptor = resolver.get(entity)?;
        Ok(Self {
            entity: descriptor.name.clone(),
            table: descriptor.table.clone(),
            qualifier: resolver.entity_qualifier(entity).unwrap_or(Expression::True),
            link: None,
            joins: Vec::new(),
            object_id: None,
        })
    }

    /// Select of the row behind a permanent id.
    pub fn by_id(resolver: &EntityResolver, entity: &str, id: &ObjectId) -> Result<Self> {
        let key = id.key_values().unwrap_or_default().iter().fold(Expression::True, |q, (c, v)| {
            q.and(Expression::eq(c.clone(), v.clone()))
        });
        let mut select = Self::new(resolver, entity)?.qualifier(key);
        select.object_id = Some(id.clone());
        Ok(select)
    }

    /// AND `qualifier` into the select.
    #[must_use]
    pub fn qualifier(mut self, qualifier: Expression) -> Self {
        self.qualifier = std::mem::replace(&mut self.qualifier, Expression::True).and(qualifier);
        self
    }

    #[must_use]
    pub fn linked(mut self, link: LinkTableInfo) -> Self {
        self.link = Some(link);
        self
    }

    #[must_use]
    pub fn join(mut self, join: JointJoin) -> Self {
        self.joins.push(join);
        self
    }
}

impl fmt::Display for RowSelect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "select {}", self.table)?;
        if let Some(link) = &self.link {
            write!(f, " via {}", link.table_name)?;
        }
        for join in &self.joins {
            write!(f, " left join {} as {}", join.target_table, join.path)?;
        }
        write!(f, " where {}", self.qualifier)
    }
}

/// Qualifier selecting the targets of `relationship` for one source id.
pub(crate) fn related_qualifier(relationship: &RelationshipInfo, source: &ObjectId) -> Option<Expression> {
    let pairs: Vec<(String, Value)> = match &relationship.link_table {
        Some(link) => link
            .source_joins
            .iter()
            .map(|j| Some((link.qualified_column(&j.target), source.value_for(&j.source)?.clone())))
            .collect::<Option<_>>()?,
        None => relationship
            .joins
            .iter()
            .map(|j| Some((j.target.clone(), source.value_for(&j.source)?.clone())))
            .collect::<Option<_>>()?,
    };
    Some(
        pairs
            .into_iter()
            .fold(Expression::True, |q, (c, v)| q.and(Expression::eq(c, v))),
    )
}

// ==================== Channels ====================

/// Kind of synchronization requested from a parent channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    /// Apply the changes to the parent without committing it.
    Flush,
    /// Apply the changes and commit them all the way down.
    FlushCascade,
    /// The child discarded its changes.
    Rollback,
}

/// Parent of a context.
pub trait DataChannel: Send + Sync {
    fn entity_resolver(&self) -> &Arc<EntityResolver>;

    /// Snapshot cache a child context should use. `None` means the child
    /// reads snapshots through this channel.
    fn row_store_for(&self, context: ContextId) -> Option<Arc<RowStore>>;

    /// Upper bound on value terms in one disjoint-by-id qualifier.
    fn max_id_qualifier_size(&self) -> usize;

    fn on_select(&self, source: ContextId, select: &RowSelect) -> Result<Vec<DataRow>>;

    /// Process a child's diff. The reply carries `NodeIdChanged` entries for
    /// every temporary id that became permanent.
    fn on_sync(&self, source: ContextId, diff: &GraphDiff, sync: SyncType) -> Result<GraphDiff>;

    /// Ids related to `id` through `relationship` as the channel currently
    /// sees them, when it can answer without a select.
    fn related_ids(
        &self,
        _source: ContextId,
        _id: &ObjectId,
        _relationship: &str,
    ) -> Result<Option<Vec<ObjectId>>> {
        Ok(None)
    }

    /// Entity name and property values of the channel's own resolved
    /// instance of `id`. Lets a child fill a fault, including NEW objects
    /// the channel has not committed yet.
    fn local_values(
        &self,
        _source: ContextId,
        _id: &ObjectId,
    ) -> Result<Option<(String, HashMap<String, PropertyValue>)>> {
        Ok(None)
    }

    /// Register a child's inbox for commit events.
    fn subscribe(&self, _context: ContextId, _inbox: Sender<StoreEvent>) {}

    fn unsubscribe(&self, _context: ContextId) {}
}

// ==================== Transactions ====================

/// A data source transaction.
pub trait Transaction: Send + Sync {
    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Mark the transaction so that its owner rolls it back.
    fn set_rollback_only(&self);

    fn is_rollback_only(&self) -> bool;
}

thread_local! {
    static BOUND_TRANSACTION: RefCell<Option<Arc<dyn Transaction>>> = const { RefCell::new(None) };
}

/// Keeps a transaction bound to the current thread until dropped.
#[must_use = "the transaction is unbound when the binding is dropped"]
pub struct TransactionBinding {
    previous: Option<Arc<dyn Transaction>>,
}

impl fmt::Debug for TransactionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionBinding")
            .field("restores_previous", &self.previous.is_some())
            .finish()
    }
}

impl Drop for TransactionBinding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        BOUND_TRANSACTION.with(|bound| *bound.borrow_mut() = previous);
    }
}

/// Bind an externally managed transaction to the current thread. Commits
/// run inside it and only mark it rollback-only on failure.
pub fn bind_transaction(transaction: Arc<dyn Transaction>) -> TransactionBinding {
    let previous = BOUND_TRANSACTION.with(|bound| bound.borrow_mut().replace(transaction));
    TransactionBinding { previous }
}

/// Transaction bound to the current thread, if any.
pub fn bound_transaction() -> Option<Arc<dyn Transaction>> {
    BOUND_TRANSACTION.with(|bound| bound.borrow().clone())
}

// ==================== Data sources ====================

/// Storage behind a domain.
pub trait DataSource: Send + Sync {
    fn select(&self, select: &RowSelect) -> Result<Vec<DataRow>>;

    fn begin_transaction(&self) -> Result<Arc<dyn Transaction>>;

    /// Key columns and values for a new row of `entity`.
    fn generate_primary_key(&self, entity: &EntityDescriptor) -> Result<Vec<(String, Value)>>;

    /// Run one operation; returns the number of affected rows.
    fn execute(&self, transaction: &dyn Transaction, operation: &RowOperation) -> Result<usize>;
}
