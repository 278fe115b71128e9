//! In-memory data source and mapping shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rowgraph::prelude::*;
use rowgraph::{CommitErrorKind, DomainConfig, JointJoin};

// ==================== Mapping ====================

/// Artist -< Painting (Fresco inherits), Artist >-< Group, Gallery -< Painting
/// without a reverse, and a locked Account.
pub fn gallery() -> Arc<EntityResolver> {
    gallery_with_rules(DeleteRule::NoAction)
}

pub fn gallery_with_rules(paintings: DeleteRule) -> Arc<EntityResolver> {
    let resolver = EntityResolver::builder()
        .entity(
            EntityDescriptor::new("Artist", "ARTIST")
                .primary_key(["ARTIST_ID"])
                .attribute(AttributeInfo::new("name", "ARTIST_NAME").mandatory())
                .attribute(AttributeInfo::new("born", "DATE_OF_BIRTH"))
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
                        .reverse("paintings"),
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
        .entity(
            EntityDescriptor::new("Gallery", "GALLERY")
                .primary_key(["GALLERY_ID"])
                .attribute(AttributeInfo::new("name", "GALLERY_NAME"))
                .relationship(RelationshipInfo::one_to_many(
                    "paintings",
                    "Painting",
                    "GALLERY_ID",
                    "GALLERY_ID",
                )),
        )
        .entity(
            EntityDescriptor::new("Account", "ACCOUNT")
                .primary_key(["ACCOUNT_ID"])
                .attribute(AttributeInfo::new("balance", "BALANCE").used_for_locking())
                .optimistic_locking(),
        )
        .build()
        .expect("fixture mapping is valid");
    Arc::new(resolver)
}

pub fn artist_id(n: i64) -> ObjectId {
    ObjectId::of("Artist", "ARTIST_ID", n)
}

pub fn painting_id(n: i64) -> ObjectId {
    ObjectId::of("Painting", "PAINTING_ID", n)
}

pub fn group_id(n: i64) -> ObjectId {
    ObjectId::of("Group", "GROUP_ID", n)
}

pub fn artist_row(n: i64, name: &str) -> DataRow {
    DataRow::new().with("ARTIST_ID", n).with("ARTIST_NAME", name)
}

pub fn painting_row(n: i64, artist: i64, title: &str) -> DataRow {
    DataRow::new()
        .with("PAINTING_ID", n)
        .with("ARTIST_ID", artist)
        .with("TITLE", title)
        .with("KIND", "P")
}

pub fn group_row(n: i64, name: &str) -> DataRow {
    DataRow::new().with("GROUP_ID", n).with("GROUP_NAME", name)
}

pub fn link_row(artist: i64, group: i64) -> DataRow {
    DataRow::new().with("ARTIST_ID", artist).with("GROUP_ID", group)
}

/// Two artists with two paintings each, one group holding both artists.
pub fn seeded() -> Arc<MemoryDataSource> {
    let source = Arc::new(MemoryDataSource::new());
    source.insert("ARTIST", artist_row(1, "Monet"));
    source.insert("ARTIST", artist_row(2, "Renoir"));
    source.insert("PAINTING", painting_row(10, 1, "Water Lilies"));
    source.insert("PAINTING", painting_row(11, 1, "Haystacks"));
    source.insert("PAINTING", painting_row(20, 2, "Luncheon"));
    source.insert("PAINTING", painting_row(21, 2, "Bal du moulin"));
    source.insert("GRP", group_row(5, "Impressionists"));
    source.insert("ARTIST_GROUP", link_row(1, 5));
    source.insert("ARTIST_GROUP", link_row(2, 5));
    source
}

pub fn domain(source: &Arc<MemoryDataSource>) -> Arc<DataDomain> {
    domain_with(source, gallery(), DomainConfig::default())
}

pub fn domain_with(
    source: &Arc<MemoryDataSource>,
    resolver: Arc<EntityResolver>,
    config: DomainConfig,
) -> Arc<DataDomain> {
    DataDomain::new(
        "gallery",
        Arc::clone(source) as Arc<dyn DataSource>,
        resolver,
        config,
    )
    .expect("fixture domain is valid")
}

// ==================== Data source ====================

/// Tables of rows behind a statement log.
///
/// Writes apply immediately and rollback only counts; tests that need
/// atomicity check the log instead. Linked selects and joint joins are
/// evaluated as nested loops.
#[derive(Default)]
pub struct MemoryDataSource {
    tables: Mutex<HashMap<String, Vec<DataRow>>>,
    statements: Mutex<Vec<String>>,
    selects: Mutex<Vec<RowSelect>>,
    fail_table: Mutex<Option<String>>,
    next_key: AtomicI64,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

pub struct MemoryTransaction {
    counters: Arc<Counters>,
    rollback_only: AtomicBool,
}

impl MemoryTransaction {
    /// A transaction managed by the test itself, for binding to a thread.
    pub fn external(source: &MemoryDataSource) -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::clone(&source.counters),
            rollback_only: AtomicBool::new(false),
        })
    }
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

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self {
            next_key: AtomicI64::new(1000),
            ..Self::default()
        }
    }

    pub fn insert(&self, table: &str, row: DataRow) {
        lock(&self.tables).entry(table.to_string()).or_default().push(row);
    }

    /// Overwrite one column of the rows matching `qualifier`, as a writer
    /// outside the domain would.
    pub fn update_where(&self, table: &str, qualifier: &Expression, column: &str, value: impl Into<Value>) {
        let value = value.into();
        if let Some(rows) = lock(&self.tables).get_mut(table) {
            for row in rows.iter_mut().filter(|r| qualifier.matches(r)) {
                row.insert(column, value.clone());
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<DataRow> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }

    pub fn clear_log(&self) {
        lock(&self.statements).clear();
        lock(&self.selects).clear();
    }

    /// Selects received so far.
    pub fn selects(&self) -> Vec<RowSelect> {
        lock(&self.selects).clone()
    }

    pub fn select_count(&self) -> usize {
        lock(&self.selects).len()
    }

    pub fn begins(&self) -> usize {
        self.counters.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.counters.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.counters.rollbacks.load(Ordering::SeqCst)
    }

    /// Make every statement against `table` fail with a constraint error.
    pub fn fail_on(&self, table: &str) {
        *lock(&self.fail_table) = Some(table.to_string());
    }

    pub fn stop_failing(&self) {
        *lock(&self.fail_table) = None;
    }

    fn linked_rows(tables: &HashMap<String, Vec<DataRow>>, rows: Vec<DataRow>, link: &LinkTableInfo) -> Vec<DataRow> {
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

    /// Left outer join of `join` into every flat row.
    fn joint_rows(tables: &HashMap<String, Vec<DataRow>>, rows: Vec<DataRow>, join: &JointJoin) -> Vec<DataRow> {
        let parent_column = |column: &str| {
            if join.parent_path.is_empty() {
                column.to_string()
            } else {
                format!("{}.{column}", join.parent_path)
            }
        };
        let targets = tables.get(&join.target_table).cloned().unwrap_or_default();
        let links = join
            .relationship
            .link_table
            .as_ref()
            .and_then(|l| tables.get(&l.table_name))
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for row in rows {
            let matching: Vec<&DataRow> = match &join.relationship.link_table {
                None => targets
                    .iter()
                    .filter(|t| {
                        join.relationship.joins.iter().all(|j| {
                            let parent = row.get(&parent_column(&j.source));
                            parent.is_some_and(|v| !v.is_null()) && parent == t.get(&j.target)
                        })
                    })
                    .collect(),
                Some(link) => targets
                    .iter()
                    .filter(|t| {
                        links.iter().any(|l| {
                            link.source_joins
                                .iter()
                                .all(|j| row.get(&parent_column(&j.source)) == l.get(&j.target))
                                && link.target_joins.iter().all(|j| l.get(&j.source) == t.get(&j.target))
                        })
                    })
                    .collect(),
            };
            if matching.is_empty() {
                out.push(row);
                continue;
            }
            for target in matching {
                let mut flat = row.clone();
                for (column, value) in target.iter() {
                    flat.insert(format!("{}.{column}", join.path), value.clone());
                }
                out.push(flat);
            }
        }
        out
    }
}

impl DataSource for MemoryDataSource {
    fn select(&self, select: &RowSelect) -> Result<Vec<DataRow>> {
        lock(&self.selects).push(select.clone());
        let tables = lock(&self.tables);
        let mut rows = tables.get(&select.table).cloned().unwrap_or_default();
        if let Some(link) = &select.link {
            rows = Self::linked_rows(&tables, rows, link);
        }
        rows.retain(|r| select.qualifier.matches(r));
        for join in &select.joins {
            rows = Self::joint_rows(&tables, rows, join);
        }
        Ok(rows)
    }

    fn begin_transaction(&self) -> Result<Arc<dyn Transaction>> {
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
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
        if lock(&self.fail_table).as_deref() == Some(table.as_str()) {
            return Err(Error::commit(
                CommitErrorKind::Constraint,
                format!("{table} rejected the write"),
            ));
        }
        let verb = match operation {
            RowOperation::Insert { .. } | RowOperation::LinkInsert { .. } => "INSERT",
            RowOperation::Update { .. } => "UPDATE",
            RowOperation::Delete { .. } | RowOperation::LinkDelete { .. } => "DELETE",
        };
        lock(&self.statements).push(format!("{verb} {table}"));

        let mut tables = lock(&self.tables);
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
