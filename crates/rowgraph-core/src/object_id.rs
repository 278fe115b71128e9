//! Object identities.
//!
//! An [`ObjectId`] names one conceptual object: an entity name plus either the
//! primary key values of its row or a process-local temporary number assigned
//! when the object is created in memory. Temporary ids are replaced by
//! permanent ones once the row is inserted.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::value::Value;

static NEXT_TEMPORARY: AtomicU64 = AtomicU64::new(1);

/// Key part of an [`ObjectId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdKey {
    /// Primary key column/value pairs, sorted by column name.
    Permanent(Vec<(String, Value)>),
    /// Process-local surrogate.
    Temporary(u64),
}

/// Identity of one managed object.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    entity: String,
    key: IdKey,
}

impl ObjectId {
    /// Single-column permanent id.
    pub fn of(entity: impl Into<String>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Permanent(vec![(column.into(), value.into())]),
        }
    }

    /// Compound permanent id. Column order does not matter.
    pub fn compound<K, V>(entity: impl Into<String>, values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut pairs: Vec<(String, Value)> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs.dedup_by(|a, b| a.0 == b.0);
        Self {
            entity: entity.into(),
            key: IdKey::Permanent(pairs),
        }
    }

    /// Fresh temporary id, unique within the process.
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Temporary(NEXT_TEMPORARY.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    pub fn key(&self) -> &IdKey {
        &self.key
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }

    /// Primary key pairs of a permanent id.
    pub fn key_values(&self) -> Option<&[(String, Value)]> {
        match &self.key {
            IdKey::Permanent(pairs) => Some(pairs),
            IdKey::Temporary(_) => None,
        }
    }

    /// Value of one key column of a permanent id.
    pub fn value_for(&self, column: &str) -> Option<&Value> {
        self.key_values()?
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Same key, different entity. Used when a row resolves to a sub-entity.
    pub fn with_entity(&self, entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: self.key.clone(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjectId:{}", self.entity)?;
        match &self.key {
            IdKey::Temporary(n) => write!(f, ", TEMP:{n}")?,
            IdKey::Permanent(pairs) => {
                for (column, value) in pairs {
                    write!(f, ", {column}={value}")?;
                }
            }
        }
        write!(f, ">")
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
