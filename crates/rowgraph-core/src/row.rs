//! Row snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh snapshot version. Versions only ever increase.
pub fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// A keyed mapping of column name to value: one row's persisted state at a
/// point in time.
///
/// Every row carries a version token. A row built from another row's changes
/// records the version it replaces so that caches can detect a broken chain.
/// Equality compares column values only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRow {
    values: BTreeMap<String, Value>,
    version: u64,
    replaces_version: Option<u64>,
    /// Concrete entity, when the data source knows it.
    entity_name: Option<String>,
}

impl DataRow {
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            version: next_version(),
            replaces_version: None,
            entity_name: None,
        }
    }

    /// Build a row from column/value pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut row = Self::new();
        for (k, v) in pairs {
            row.values.insert(k.into(), v.into());
        }
        row
    }

    /// Builder-style column setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn with_entity_name(mut self, entity: impl Into<String>) -> Self {
        self.entity_name = Some(entity.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.values.remove(column)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Value of a column, treating absent columns as NULL.
    pub fn value(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&Value::Null)
    }

    /// Typed access to a column.
    pub fn get_as<T>(&self, column: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.values.get(column).cloned().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "column",
                actual: "missing".to_string(),
                column: Some(column.to_string()),
            })
        })?;
        T::try_from(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(column.to_string());
                Error::Type(te)
            }
            other => other,
        })
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn replaces_version(&self) -> Option<u64> {
        self.replaces_version
    }

    pub fn set_replaces_version(&mut self, version: Option<u64>) {
        self.replaces_version = version;
    }

    /// Restamp with a fresh version.
    pub fn bump_version(&mut self) {
        self.version = next_version();
    }

    /// Reuse an existing version when an equal snapshot is already cached.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn entity_name(&self) -> Option<&str> {
        self.entity_name.as_deref()
    }

    /// Columns of a joint flat row that belong to `prefix`, with the prefix
    /// stripped. `"paintings."` turns `"paintings.NAME"` into `"NAME"` but
    /// leaves nested `"paintings.gallery.NAME"` behind as `"gallery.NAME"`.
    pub fn sub_row(&self, prefix: &str) -> DataRow {
        let mut row = DataRow::new();
        for (column, value) in &self.values {
            if let Some(rest) = column.strip_prefix(prefix) {
                row.values.insert(rest.to_string(), value.clone());
            }
        }
        row
    }

    /// The row without joined (dotted) columns. Keeps the version so that a
    /// snapshot cached from it matches objects merged from the full row.
    pub fn own_columns(&self) -> DataRow {
        let mut row = self.clone();
        row.values.retain(|column, _| !column.contains('.'));
        row
    }

    /// Columns whose value in `newer` differs from this row.
    pub fn create_diff(&self, newer: &DataRow) -> BTreeMap<String, Value> {
        let mut diff = BTreeMap::new();
        for (column, value) in &newer.values {
            if self.values.get(column) != Some(value) {
                diff.insert(column.clone(), value.clone());
            }
        }
        for column in self.values.keys() {
            if !newer.values.contains_key(column) {
                diff.insert(column.clone(), Value::Null);
            }
        }
        diff
    }

    /// New row with `diff` applied on top of this one, stamped as replacing
    /// this row's version.
    pub fn apply_diff(&self, diff: &BTreeMap<String, Value>) -> DataRow {
        let mut row = self.clone();
        for (column, value) in diff {
            row.values.insert(column.clone(), value.clone());
        }
        row.version = next_version();
        row.replaces_version = Some(self.version);
        row
    }
}

impl Default for DataRow {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for DataRow {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for DataRow {}
