//! Core types for rowgraph.
//!
//! `rowgraph-core` is the **foundation layer** for the object graph engine. It
//! defines the value, identity and mapping types every other crate builds on.
//!
//! # Role In The Architecture
//!
//! - **Values and rows**: [`Value`] and [`DataRow`] snapshots with version tokens.
//! - **Identity**: [`ObjectId`], permanent or temporary.
//! - **Lifecycle**: [`PersistenceState`] and its legal transitions.
//! - **Mapping**: [`EntityDescriptor`], [`RelationshipInfo`] and the closed
//!   [`Property`] sum type, frozen in an [`EntityResolver`].
//! - **Qualifiers**: [`Expression`] trees handed to data sources.
//! - **Errors**: the [`Error`] taxonomy shared by the whole workspace.
//!
//! Most applications use the `rowgraph` facade crate; this crate is useful
//! when implementing data sources or tooling against the raw types.

pub mod error;
pub mod expression;
pub mod identifiers;
pub mod mapping;
pub mod object_id;
pub mod row;
pub mod state;
pub mod value;

pub use error::{
    CommitError, CommitErrorKind, ConfigError, DeleteDeniedError, Error, FaultError,
    FaultErrorKind, IdentityError, IdentityErrorKind, MappingError, MappingErrorKind, QueryError,
    Result, StateError, TypeError, ValidationError, ValidationErrorKind, ValidationFailure,
};
pub use expression::Expression;
pub use identifiers::{is_valid_name, validate_name};
pub use mapping::{
    AttributeInfo, ColumnJoin, DeleteRule, EntityDescriptor, EntityResolver,
    EntityResolverBuilder, InheritanceInfo, LinkTableInfo, Property, RelationshipInfo,
    RelationshipKind,
};
pub use object_id::{IdKey, ObjectId};
pub use row::{DataRow, next_version};
pub use state::PersistenceState;
pub use value::Value;
