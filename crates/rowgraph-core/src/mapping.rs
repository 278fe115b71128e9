//! Entity and relationship metadata.
//!
//! Descriptors are plain data assembled at startup through builder methods and
//! frozen inside an [`EntityResolver`]. Property-kind dispatch goes through the
//! closed [`Property`] enum: every consumer (diffing, merging, delete rules,
//! prefetch attachment) matches on it instead of calling through a trait
//! hierarchy.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::Result;
use crate::error::{Error, MappingErrorKind};
use crate::expression::Expression;
use crate::identifiers::validate_name;
use crate::object_id::ObjectId;
use crate::row::DataRow;
use crate::value::Value;

/// A mapped simple attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name: String,
    pub column: String,
    /// Must be non-null on commit.
    pub mandatory: bool,
    /// Included in the optimistic lock qualifier of updates and deletes.
    pub used_for_locking: bool,
}

impl AttributeInfo {
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            mandatory: false,
            used_for_locking: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn used_for_locking(mut self) -> Self {
        self.used_for_locking = true;
        self
    }
}

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// To-one whose foreign key lives in the target row.
    OneToOne,
    /// To-one whose foreign key lives in the source row.
    #[default]
    ManyToOne,
    /// To-many whose foreign key lives in the target rows.
    OneToMany,
    /// To-many through a link table (flattened).
    ManyToMany,
}

/// What happens to related objects when the source object is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteRule {
    #[default]
    NoAction,
    /// Clear the reverse side on every related object.
    Nullify,
    /// Delete every related object.
    Cascade,
    /// Refuse the delete while related objects exist.
    Deny,
}

/// One column pair of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnJoin {
    pub source: String,
    pub target: String,
}

impl ColumnJoin {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Link table of a flattened many-to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTableInfo {
    pub table_name: String,
    /// Source entity columns to link table columns.
    pub source_joins: Vec<ColumnJoin>,
    /// Link table columns to target entity columns.
    pub target_joins: Vec<ColumnJoin>,
}

impl LinkTableInfo {
    /// Single-column link table: `source_pk -> local_column`, `remote_column -> target_pk`.
    pub fn new(
        table_name: impl Into<String>,
        source_pk: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
        target_pk: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            source_joins: vec![ColumnJoin::new(source_pk, local_column)],
            target_joins: vec![ColumnJoin::new(remote_column, target_pk)],
        }
    }

    /// Column name under which a data source exposes a link column on target rows.
    pub fn qualified_column(&self, column: &str) -> String {
        format!("{}.{}", self.table_name, column)
    }
}

/// Metadata about a relationship between entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipInfo {
    pub name: String,
    pub source_entity: String,
    pub target_entity: String,
    pub kind: RelationshipKind,
    /// Source columns to target columns. Empty for many-to-many.
    pub joins: Vec<ColumnJoin>,
    pub link_table: Option<LinkTableInfo>,
    /// Name of the relationship on the target entity that points back.
    pub reverse: Option<String>,
    pub delete_rule: DeleteRule,
    /// A to-one that must be set on commit.
    pub mandatory: bool,
}

impl RelationshipInfo {
    fn with_kind(
        name: impl Into<String>,
        target: impl Into<String>,
        kind: RelationshipKind,
        joins: Vec<ColumnJoin>,
    ) -> Self {
        Self {
            name: name.into(),
            source_entity: String::new(),
            target_entity: target.into(),
            kind,
            joins,
            link_table: None,
            reverse: None,
            delete_rule: DeleteRule::NoAction,
            mandatory: false,
        }
    }

    /// To-one owning a foreign key: `fk_column` on the source references `target_pk`.
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        fk_column: impl Into<String>,
        target_pk: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            target,
            RelationshipKind::ManyToOne,
            vec![ColumnJoin::new(fk_column, target_pk)],
        )
    }

    /// To-many whose targets carry `target_fk` referencing `source_pk`.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        source_pk: impl Into<String>,
        target_fk: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            target,
            RelationshipKind::OneToMany,
            vec![ColumnJoin::new(source_pk, target_fk)],
        )
    }

    /// To-one whose single target carries `target_fk` referencing `source_pk`.
    pub fn one_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        source_pk: impl Into<String>,
        target_fk: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            target,
            RelationshipKind::OneToOne,
            vec![ColumnJoin::new(source_pk, target_fk)],
        )
    }

    /// Flattened to-many through a link table.
    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        link: LinkTableInfo,
    ) -> Self {
        let mut rel = Self::with_kind(name, target, RelationshipKind::ManyToMany, Vec::new());
        rel.link_table = Some(link);
        rel
    }

    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn is_to_many(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany
        )
    }

    pub fn is_flattened(&self) -> bool {
        self.kind == RelationshipKind::ManyToMany
    }

    /// The source row does not change when the target side changes. True for
    /// every relationship whose foreign key is not stored in the source row.
    pub fn is_source_independent_from_target_change(&self) -> bool {
        self.kind != RelationshipKind::ManyToOne
    }

    /// Target id referenced by a source row's foreign key columns.
    pub fn target_id_from_source_row(&self, row: &DataRow) -> Option<Vec<(String, Value)>> {
        if self.kind != RelationshipKind::ManyToOne {
            return None;
        }
        self.joins
            .iter()
            .map(|j| match row.value(&j.source) {
                Value::Null => None,
                v => Some((j.target.clone(), v.clone())),
            })
            .collect()
    }

    /// Source id key referenced by a target row's join columns. For
    /// many-to-many the target row must expose the link columns under
    /// [`LinkTableInfo::qualified_column`] names.
    pub fn source_key_from_target_row(&self, row: &DataRow) -> Option<Vec<(String, Value)>> {
        match (&self.kind, &self.link_table) {
            (RelationshipKind::ManyToMany, Some(link)) => link
                .source_joins
                .iter()
                .map(|j| match row.value(&link.qualified_column(&j.target)) {
                    Value::Null => None,
                    v => Some((j.source.clone(), v.clone())),
                })
                .collect(),
            (RelationshipKind::OneToMany | RelationshipKind::OneToOne, _) => self
                .joins
                .iter()
                .map(|j| match row.value(&j.target) {
                    Value::Null => None,
                    v => Some((j.source.clone(), v.clone())),
                })
                .collect(),
            _ => None,
        }
    }
}

/// Single-table inheritance: a sub-entity shares its super entity's table and
/// is recognized by a discriminator column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritanceInfo {
    pub super_entity: String,
    pub discriminator_column: String,
    pub discriminator_value: Value,
}

/// Mapping of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub primary_key: Vec<String>,
    pub attributes: Vec<AttributeInfo>,
    pub relationships: Vec<RelationshipInfo>,
    pub inheritance: Option<InheritanceInfo>,
    /// Updates and deletes carry a lock qualifier built from locking attributes.
    pub optimistic_locking: bool,
}

/// A property of an entity: the closed set of kinds every visitor handles.
#[derive(Debug, Clone, Copy)]
pub enum Property<'a> {
    Attribute(&'a AttributeInfo),
    ToOne(&'a RelationshipInfo),
    ToMany(&'a RelationshipInfo),
}

impl Property<'_> {
    pub fn name(&self) -> &str {
        match self {
            Property::Attribute(a) => &a.name,
            Property::ToOne(r) | Property::ToMany(r) => &r.name,
        }
    }
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: Vec::new(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            inheritance: None,
            optimistic_locking: false,
        }
    }

    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn attribute(mut self, attribute: AttributeInfo) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Declare this entity a sub-entity of `super_entity`.
    pub fn inherits(
        mut self,
        super_entity: impl Into<String>,
        discriminator_column: impl Into<String>,
        discriminator_value: impl Into<Value>,
    ) -> Self {
        self.inheritance = Some(InheritanceInfo {
            super_entity: super_entity.into(),
            discriminator_column: discriminator_column.into(),
            discriminator_value: discriminator_value.into(),
        });
        self
    }

    pub fn optimistic_locking(mut self) -> Self {
        self.optimistic_locking = true;
        self
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<Property<'_>> {
        if let Some(a) = self.attributes.iter().find(|a| a.name == name) {
            return Some(Property::Attribute(a));
        }
        self.relationships
            .iter()
            .find(|r| r.name == name)
            .map(|r| if r.is_to_many() { Property::ToMany(r) } else { Property::ToOne(r) })
    }

    /// Look up a property by name, failing with a mapping error.
    pub fn require_property(&self, name: &str) -> Result<Property<'_>> {
        self.property(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownProperty,
                format!("entity '{}' has no property '{}'", self.name, name),
            )
        })
    }

    pub fn relationship_named(&self, name: &str) -> Result<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownRelationship,
                format!("entity '{}' has no relationship '{}'", self.name, name),
            )
        })
    }

    pub fn attribute_for_column(&self, column: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.column == column)
    }

    /// Visit every property: attributes first, then relationships in mapping
    /// order. Stops early when the visitor breaks.
    pub fn visit_properties<B>(
        &self,
        mut visitor: impl FnMut(Property<'_>) -> ControlFlow<B>,
    ) -> Option<B> {
        for attribute in &self.attributes {
            if let ControlFlow::Break(b) = visitor(Property::Attribute(attribute)) {
                return Some(b);
            }
        }
        for relationship in &self.relationships {
            let property = if relationship.is_to_many() {
                Property::ToMany(relationship)
            } else {
                Property::ToOne(relationship)
            };
            if let ControlFlow::Break(b) = visitor(property) {
                return Some(b);
            }
        }
        None
    }

    /// Primary key pairs of a row, or `None` if any key column is null or
    /// missing (an unmatched outer join).
    pub fn key_from_row(&self, row: &DataRow) -> Option<Vec<(String, Value)>> {
        if let [column] = self.primary_key.as_slice() {
            return match row.value(column) {
                Value::Null => None,
                v => Some(vec![(column.clone(), v.clone())]),
            };
        }
        self.primary_key
            .iter()
            .map(|c| match row.value(c) {
                Value::Null => None,
                v => Some((c.clone(), v.clone())),
            })
            .collect()
    }
}

/// Frozen registry of entity descriptors.
#[derive(Debug, Default)]
pub struct EntityResolver {
    entities: HashMap<String, Arc<EntityDescriptor>>,
    /// Direct sub-entities per entity.
    subentities: HashMap<String, Vec<String>>,
}

/// Collects descriptors and validates them into an [`EntityResolver`].
#[derive(Debug, Default)]
pub struct EntityResolverBuilder {
    entities: Vec<EntityDescriptor>,
}

impl EntityResolverBuilder {
    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.entities.push(descriptor);
        self
    }

    /// Validate names and references, flatten inherited properties.
    pub fn build(self) -> Result<EntityResolver> {
        let mut raw: HashMap<String, EntityDescriptor> = HashMap::new();
        for mut entity in self.entities {
            validate_name("entity", &entity.name)?;
            validate_name("table", &entity.table)?;
            for a in &entity.attributes {
                validate_name("attribute", &a.name)?;
                validate_name("column", &a.column)?;
            }
            for r in &mut entity.relationships {
                validate_name("relationship", &r.name)?;
                r.source_entity.clone_from(&entity.name);
            }
            if raw.contains_key(&entity.name) {
                return Err(Error::mapping(
                    MappingErrorKind::InvalidName,
                    format!("duplicate entity '{}'", entity.name),
                ));
            }
            raw.insert(entity.name.clone(), entity);
        }

        let mut subentities: HashMap<String, Vec<String>> = HashMap::new();
        let mut entities = HashMap::new();
        let mut names: Vec<String> = raw.keys().cloned().collect();
        names.sort();
        for name in &names {
            let flattened = flatten_inheritance(&raw, name, 0)?;
            if let Some(inh) = &flattened.inheritance {
                subentities
                    .entry(inh.super_entity.clone())
                    .or_default()
                    .push(name.clone());
            }
            if flattened.primary_key.is_empty() {
                return Err(Error::mapping(
                    MappingErrorKind::MissingPrimaryKey,
                    format!("entity '{}' has no primary key", name),
                ));
            }
            entities.insert(name.clone(), Arc::new(flattened));
        }

        for entity in entities.values() {
            for r in &entity.relationships {
                let Some(target) = entities.get(&r.target_entity) else {
                    return Err(Error::mapping(
                        MappingErrorKind::UnknownEntity,
                        format!(
                            "relationship '{}.{}' targets unknown entity '{}'",
                            entity.name, r.name, r.target_entity
                        ),
                    ));
                };
                if let Some(reverse) = &r.reverse {
                    target.relationship_named(reverse)?;
                }
                if r.is_flattened() && r.link_table.is_none() {
                    return Err(Error::mapping(
                        MappingErrorKind::UnknownRelationship,
                        format!("flattened relationship '{}' has no link table", r.name),
                    ));
                }
            }
        }

        tracing::debug!(entities = entities.len(), "entity resolver built");
        Ok(EntityResolver {
            entities,
            subentities,
        })
    }
}

fn flatten_inheritance(
    raw: &HashMap<String, EntityDescriptor>,
    name: &str,
    depth: usize,
) -> Result<EntityDescriptor> {
    let entity = raw.get(name).ok_or_else(|| {
        Error::mapping(
            MappingErrorKind::UnknownEntity,
            format!("unknown entity '{}'", name),
        )
    })?;
    let Some(inheritance) = &entity.inheritance else {
        return Ok(entity.clone());
    };
    if depth > raw.len() {
        return Err(Error::mapping(
            MappingErrorKind::UnknownEntity,
            format!("inheritance cycle at '{}'", name),
        ));
    }
    let parent = flatten_inheritance(raw, &inheritance.super_entity, depth + 1)?;
    let mut merged = entity.clone();
    merged.table = parent.table.clone();
    if merged.primary_key.is_empty() {
        merged.primary_key.clone_from(&parent.primary_key);
    }
    let mut attributes = parent.attributes.clone();
    attributes.extend(entity.attributes.iter().cloned());
    merged.attributes = attributes;
    let mut relationships: Vec<RelationshipInfo> = parent
        .relationships
        .iter()
        .cloned()
        .map(|mut r| {
            r.source_entity = name.to_string();
            r
        })
        .collect();
    relationships.extend(entity.relationships.iter().cloned());
    merged.relationships = relationships;
    merged.optimistic_locking |= parent.optimistic_locking;
    Ok(merged)
}

impl EntityResolver {
    pub fn builder() -> EntityResolverBuilder {
        EntityResolverBuilder::default()
    }

    pub fn get(&self, entity: &str) -> Result<Arc<EntityDescriptor>> {
        self.entities.get(entity).cloned().ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                format!("unknown entity '{}'", entity),
            )
        })
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Entity names used in object ids: the root of the inheritance hierarchy,
    /// so that an id derived from a foreign key to a super entity finds the
    /// instance of a sub-entity.
    pub fn id_entity_name<'a>(&'a self, entity: &'a str) -> &'a str {
        let mut current = entity;
        while let Some(Some(inh)) = self.entities.get(current).map(|e| e.inheritance.as_ref()) {
            current = &inh.super_entity;
        }
        current
    }

    /// Build an object id for `entity` from key pairs.
    pub fn object_id(&self, entity: &str, key: Vec<(String, Value)>) -> ObjectId {
        ObjectId::compound(self.id_entity_name(entity), key)
    }

    /// Object id of a row of `descriptor`, or `None` for a null key.
    pub fn id_from_row(&self, descriptor: &EntityDescriptor, row: &DataRow) -> Option<ObjectId> {
        let key = descriptor.key_from_row(row)?;
        Some(self.object_id(&descriptor.name, key))
    }

    pub fn has_subentities(&self, entity: &str) -> bool {
        self.subentities.get(entity).is_some_and(|s| !s.is_empty())
    }

    pub fn is_subentity_of(&self, entity: &str, ancestor: &str) -> bool {
        let mut current = entity;
        loop {
            if current == ancestor {
                return true;
            }
            match self.entities.get(current).and_then(|e| e.inheritance.as_ref()) {
                Some(inh) => current = &inh.super_entity,
                None => return false,
            }
        }
    }

    /// Concrete descriptor for a row fetched for `root`: an explicit entity
    /// name in the row wins, otherwise the most specific sub-entity whose
    /// discriminator matches.
    pub fn descriptor_for_row(&self, root: &str, row: &DataRow) -> Result<Arc<EntityDescriptor>> {
        if let Some(name) = row.entity_name() {
            if self.is_subentity_of(name, root) {
                return self.get(name);
            }
            tracing::warn!(row_entity = name, root, "row entity outside of query root");
        }
        let mut current = root.to_string();
        'descend: loop {
            if let Some(children) = self.subentities.get(&current) {
                for child in children {
                    let Some(descriptor) = self.entities.get(child) else {
                        continue;
                    };
                    if let Some(inh) = &descriptor.inheritance {
                        if row.value(&inh.discriminator_column) == &inh.discriminator_value {
                            current.clone_from(child);
                            continue 'descend;
                        }
                    }
                }
            }
            break;
        }
        self.get(&current)
    }

    /// Qualifier restricting a select for `entity` to rows of that entity and
    /// its sub-entities. `None` when no discriminator applies.
    pub fn entity_qualifier(&self, entity: &str) -> Option<Expression> {
        let column = self
            .entities
            .get(entity)?
            .inheritance
            .as_ref()?
            .discriminator_column
            .clone();
        let mut values = Vec::new();
        self.collect_discriminators(entity, &mut values);
        let alternatives = values
            .into_iter()
            .map(|v| Expression::eq(column.clone(), v))
            .collect();
        Some(Expression::Or(alternatives))
    }

    fn collect_discriminators(&self, entity: &str, out: &mut Vec<Value>) {
        if let Some(inh) = self.entities.get(entity).and_then(|e| e.inheritance.as_ref()) {
            out.push(inh.discriminator_value.clone());
        }
        if let Some(children) = self.subentities.get(entity) {
            for child in children {
                self.collect_discriminators(child, out);
            }
        }
    }

    /// Attribute `name` declared on `entity` or on any of its sub-entities.
    pub fn attribute_in_hierarchy(&self, entity: &str, name: &str) -> Option<&AttributeInfo> {
        let descriptor = self.entities.get(entity)?;
        if let Some(a) = descriptor.attributes.iter().find(|a| a.name == name) {
            return Some(a);
        }
        self.subentities
            .get(entity)?
            .iter()
            .find_map(|child| self.attribute_in_hierarchy(child, name))
    }

    /// Relationship `name` declared on `entity` or on any of its sub-entities.
    pub fn relationship_in_hierarchy(&self, entity: &str, name: &str) -> Option<&RelationshipInfo> {
        let descriptor = self.entities.get(entity)?;
        if let Some(r) = descriptor.relationships.iter().find(|r| r.name == name) {
            return Some(r);
        }
        self.subentities
            .get(entity)?
            .iter()
            .find_map(|child| self.relationship_in_hierarchy(child, name))
    }

    /// The relationship on the target entity pointing back, if mapped.
    pub fn reverse_relationship(&self, relationship: &RelationshipInfo) -> Option<RelationshipInfo> {
        let reverse = relationship.reverse.as_ref()?;
        let target = self.entities.get(&relationship.target_entity)?;
        target.relationships.iter().find(|r| &r.name == reverse).cloned()
    }
}
