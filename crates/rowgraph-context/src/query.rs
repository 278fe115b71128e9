//! Select queries and their results.

use rowgraph_core::{DataRow, Expression, ObjectId, Value};

use crate::object::ObjectRef;
use crate::prefetch::{PrefetchSemantics, PrefetchTreeNode};

/// Select of objects of one root entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub entity: String,
    pub qualifier: Expression,
    pub prefetch: Option<PrefetchTreeNode>,
    /// Overwrite already registered clean objects with the fetched rows.
    pub refresh: bool,
    /// Return raw rows and leave the identity map alone.
    pub fetch_data_rows: bool,
    /// When set, each result is a [`ResultRow`] of these columns.
    pub result_columns: Vec<ResultColumn>,
    /// Restricts the select to one object; lets a parent context answer
    /// from its own registered instance.
    pub object_id: Option<ObjectId>,
}

impl SelectQuery {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: Expression::True,
            prefetch: None,
            refresh: true,
            fetch_data_rows: false,
            result_columns: Vec::new(),
            object_id: None,
        }
    }

    /// Select of the single row behind `id`.
    pub fn by_id(id: &ObjectId) -> Self {
        let qualifier = id
            .key_values()
            .map(|pairs| {
                pairs
                    .iter()
                    .fold(Expression::True, |q, (c, v)| q.and(Expression::eq(c.clone(), v.clone())))
            })
            .unwrap_or(Expression::True);
        Self {
            qualifier,
            object_id: Some(id.clone()),
            ..Self::new(id.entity_name())
        }
    }

    #[must_use]
    pub fn qualifier(mut self, qualifier: Expression) -> Self {
        self.qualifier = qualifier;
        self
    }

    #[must_use]
    pub fn and_qualifier(mut self, qualifier: Expression) -> Self {
        self.qualifier = std::mem::replace(&mut self.qualifier, Expression::True).and(qualifier);
        self
    }

    #[must_use]
    pub fn prefetch(mut self, path: &str, semantics: PrefetchSemantics) -> Self {
        self.prefetch
            .get_or_insert_with(PrefetchTreeNode::root)
            .add_path(path, semantics);
        self
    }

    #[must_use]
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    #[must_use]
    pub fn fetch_data_rows(mut self, raw: bool) -> Self {
        self.fetch_data_rows = raw;
        self
    }

    #[must_use]
    pub fn result_column(mut self, column: ResultColumn) -> Self {
        self.result_columns.push(column);
        self
    }
}

/// One column of a mixed result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultColumn {
    /// A plain column of the fetched row.
    Scalar(String),
    /// An object built from the columns under `prefix` (empty for the
    /// row's own columns).
    Entity { entity: String, prefix: String },
    /// A value object built from the columns under `prefix`, not managed.
    Embeddable(String),
}

/// One cell of a [`ResultRow`].
#[derive(Debug, Clone)]
pub enum ResultCell {
    Scalar(Value),
    /// `None` for an outer-joined entity without a row.
    Entity(Option<ObjectRef>),
    Embeddable(DataRow),
}

impl ResultCell {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ResultCell::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            ResultCell::Entity(o) => o.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultRow(pub Vec<ResultCell>);

impl ResultRow {
    pub fn get(&self, index: usize) -> Option<&ResultCell> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a query produced.
#[derive(Debug, Clone)]
pub enum QueryResponse {
    Objects(Vec<ObjectRef>),
    Rows(Vec<DataRow>),
    Cells(Vec<ResultRow>),
}

impl QueryResponse {
    pub fn len(&self) -> usize {
        match self {
            QueryResponse::Objects(v) => v.len(),
            QueryResponse::Rows(v) => v.len(),
            QueryResponse::Cells(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_objects(self) -> Vec<ObjectRef> {
        match self {
            QueryResponse::Objects(v) => v,
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_id_builds_key_qualifier() {
        let id = ObjectId::compound("Painting", [("A", 1i64), ("B", 2i64)]);
        let query = SelectQuery::by_id(&id);
        assert_eq!(query.entity, "Painting");
        assert_eq!(query.object_id.as_ref(), Some(&id));
        let row = DataRow::new().with("A", 1i64).with("B", 2i64);
        assert!(query.qualifier.matches(&row));
        assert!(!query.qualifier.matches(&row.clone().with("B", 3i64)));
    }

    #[test]
    fn test_builder_accumulates_prefetch_and_qualifier() {
        let query = SelectQuery::new("Artist")
            .qualifier(Expression::eq("ARTIST_NAME", "a"))
            .and_qualifier(Expression::eq("ARTIST_ID", 1i64))
            .prefetch("paintings", PrefetchSemantics::Joint)
            .prefetch("groups", PrefetchSemantics::Disjoint)
            .refresh(false);
        assert_eq!(query.qualifier.term_count(), 2);
        let tree = query.prefetch.unwrap();
        assert_eq!(tree.children().len(), 2);
        assert!(!query.refresh);
    }
}
