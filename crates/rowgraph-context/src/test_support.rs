//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rowgraph_core::{
    AttributeInfo, CommitErrorKind, DataRow, DeleteRule, EntityDescriptor, EntityResolver, Error,
    LinkTableInfo, ObjectId, RelationshipInfo, Result, Value,
};

use crate::channel::{DataSource, RowSelect, Transaction};
use crate::flush::RowOperation;

/// Artist -< Painting, Artist >-< Group, Painting -< Fresco (inherits).
pub(crate) fn gallery() -> Arc<EntityResolver> {
    gallery_with_rules(DeleteRule::NoAction, DeleteRule::NoAction)
}

pub(crate) fn gallery_with_rules(paintings: DeleteRule, artist: DeleteRule) -> Arc<EntityResolver> {
    let resolver = EntityResolver::builder()
        .entity(
            EntityDescriptor::new("Artist", "ARTIST")
                .primary_key(["ARTIST_ID"])
                .attribute(AttributeInfo::new("name", "ARTIST_NAME").mandatory())
                .relationship(
                    RelationshipInfo::one_to_many("paintings", "Painting", "ARTIST_ID", "ARTIST_ID")
                        .reverse("artist")
                        .delete_rule(paintings),
                )
                .relationship(
                    RelationshipInfo::many_to_many(
                        "groups",
                        "Group",
                        LinkTableInfo::new("ARTIST_GROUP", "ARTIST_ID", "ARTIST_ID", "GROUP_ID", "GROUP_ID"),
                    )
                    .reverse("artists"),
                ),
        )
        .entity(
            EntityDescriptor::new("Painting", "PAINTING")
                .primary_key(["PAINTING_ID"])
                .attribute(AttributeInfo::new("title", "TITLE"))
                .attribute(AttributeInfo::new("kind", "KIND"))
                .relationship(
                    RelationshipInfo::many_to_one("artist", "Artist", "ARTIST_ID", "ARTIST_ID")
                        .reverse("paintings")
                        .delete_rule(artist),
                ),
        )
        .entity(
            EntityDescriptor::new("Fresco", "PAINTING")
                .attribute(AttributeInfo::new("wall", "WALL"))
                .inherits("Painting", "KIND", "F"),
        )
        .entity(
            EntityDescriptor::new("Group", "GRP")
                .primary_key(["GROUP_ID"])
                .attribute(AttributeInfo::new("name", "GROUP_NAME"))
                .relationship(
                    RelationshipInfo::many_to_many(
                        "artists",
                        "Artist",
                        LinkTableInfo::new("ARTIST_GROUP", "GROUP_ID", "GROUP_ID", "ARTIST_ID", "ARTIST_ID"),
                    )
                    .reverse("groups"),
                ),
        )
        .build()
        .expect("fixture mapping is valid");
    Arc::new(resolver)
}

pub(crate) fn artist_id(n: i64) -> ObjectId {
    ObjectId::of("Artist", "ARTIST_ID", n)
}

pub(crate) fn painting_id(n: i64) -> ObjectId {
    ObjectId::of("Painting", "PAINTING_ID", n)
}

pub(crate) fn artist_row(n: i64, name: &str) -> DataRow {
    DataRow::new().with("ARTIST_ID", n).with("ARTIST_NAME", name)
}

pub(crate) fn painting_row(n: i64, artist: i64, title: &str) -> DataRow {
    DataRow::new()
        .with("PAINTING_ID", n)
        .with("ARTIST_ID", artist)
        .with("TITLE", title)
        .with("KIND", "P")
}

// ==================== In-memory data source ====================

/// Tables of rows with a statement log. Linked selects are supported,
/// joint joins are not. Writes are applied immediately; rollback only
/// counts.
#[derive(Default)]
pub(crate) struct MemorySource {
    tables: Mutex<HashMap<String, Vec<DataRow>>>,
    statements: Mutex<Vec<String>>,
    fail_table: Mutex<Option<String>>,
    next_key: AtomicI64,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

struct MemoryTransaction {
    counters: Arc<Counters>,
    rollback_only: AtomicBool,
}

impl Transaction for MemoryTransaction {
    fn commit(&self) -> Result<()> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }
}

impl MemorySource {
    pub(crate) fn new() -> Self {
        Self {
            next_key: AtomicI64::new(100),
            ..Self::default()
        }
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Vec<DataRow>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, table: &str, row: DataRow) {
        self.tables().entry(table.to_string()).or_default().push(row);
    }

    /// Replace a table's rows, as another writer would.
    pub(crate) fn set_rows(&self, table: &str, rows: Vec<DataRow>) {
        self.tables().insert(table.to_string(), rows);
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<DataRow> {
        self.tables().get(table).cloned().unwrap_or_default()
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn commits(&self) -> usize {
        self.counters.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.counters.rollbacks.load(Ordering::SeqCst)
    }

    /// Make every statement against `table` fail.
    pub(crate) fn fail_on(&self, table: &str) {
        *self.fail_table.lock().unwrap_or_else(PoisonError::into_inner) = Some(table.to_string());
    }
}

impl DataSource for MemorySource {
    fn select(&self, select: &RowSelect) -> Result<Vec<DataRow>> {
        let tables = self.tables();
        let rows = tables.get(&select.table).cloned().unwrap_or_default();
        let rows = match &select.link {
            None => rows,
            Some(link) => {
                let mut joined = Vec::new();
                for link_row in tables.get(&link.table_name).into_iter().flatten() {
                    for row in &rows {
                        if link.target_joins.iter().all(|j| link_row.get(&j.source) == row.get(&j.target)) {
                            let mut row = row.clone();
                            for (column, value) in link_row.iter() {
                                row.insert(link.qualified_column(column), value.clone());
                            }
                            joined.push(row);
                        }
                    }
                }
                joined
            }
        };
        Ok(rows.into_iter().filter(|r| select.qualifier.matches(r)).collect())
    }

    fn begin_transaction(&self) -> Result<Arc<dyn Transaction>> {
        Ok(Arc::new(MemoryTransaction {
            counters: Arc::clone(&self.counters),
            rollback_only: AtomicBool::new(false),
        }))
    }

    fn generate_primary_key(&self, entity: &EntityDescriptor) -> Result<Vec<(String, Value)>> {
        Ok(entity
            .primary_key
            .iter()
            .map(|column| (column.clone(), Value::from(self.next_key.fetch_add(1, Ordering::SeqCst))))
            .collect())
    }

    fn execute(&self, _transaction: &dyn Transaction, operation: &RowOperation) -> Result<usize> {
        let table = operation.table().to_string();
        if self.fail_table.lock().unwrap_or_else(PoisonError::into_inner).as_deref() == Some(table.as_str()) {
            return Err(Error::commit(CommitErrorKind::Constraint, format!("{table} rejected the write")));
        }
        let verb = match operation {
            RowOperation::Insert { .. } | RowOperation::LinkInsert { .. } => "INSERT",
            RowOperation::Update { .. } => "UPDATE",
            RowOperation::Delete { .. } | RowOperation::LinkDelete { .. } => "DELETE",
        };
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{verb} {table}"));

        let mut tables = self.tables();
        let rows = tables.entry(table).or_default();
        let affected = match operation {
            RowOperation::Insert { values, .. } | RowOperation::LinkInsert { values, .. } => {
                rows.push(DataRow::from_pairs(values.clone()));
                1
            }
            RowOperation::Update { values, qualifier, .. } => {
                let mut n = 0;
                for row in rows.iter_mut().filter(|r| qualifier.matches(r)) {
                    for (column, value) in values {
                        row.insert(column.clone(), value.clone());
                    }
                    n += 1;
                }
                n
            }
            RowOperation::Delete { qualifier, .. } => {
                let before = rows.len();
                rows.retain(|r| !qualifier.matches(r));
                before - rows.len()
            }
            RowOperation::LinkDelete { values, .. } => {
                let before = rows.len();
                rows.retain(|r| !values.iter().all(|(c, v)| r.get(c) == Some(v)));
                before - rows.len()
            }
        };
        Ok(affected)
    }
}
