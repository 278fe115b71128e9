//! rowgraph - an object graph layer over relational rows.
//!
//! rowgraph keeps persistent objects unique per editing context, tracks
//! their changes as graph operations and turns a commit into ordered row
//! operations against a pluggable [`DataSource`]:
//!
//! - Identity map with one managed object per id and context
//! - Faulting of objects and relationships on first access
//! - Delete rules (deny, nullify, cascade, no action)
//! - Prefetch trees resolved with joint, disjoint and disjoint-by-id selects
//! - Nested contexts committing into their parent
//! - A shared snapshot cache notifying sibling contexts of commits
//!
//! # Quick Start
//!
//! ```ignore
//! use rowgraph::prelude::*;
//!
//! let resolver = EntityResolver::builder()
//!     .entity(
//!         EntityDescriptor::new("Artist", "ARTIST")
//!             .primary_key(["ARTIST_ID"])
//!             .attribute(AttributeInfo::new("name", "ARTIST_NAME").mandatory())
//!             .relationship(
//!                 RelationshipInfo::one_to_many("paintings", "Painting", "ARTIST_ID", "ARTIST_ID")
//!                     .reverse("artist"),
//!             ),
//!     )
//!     .entity(
//!         EntityDescriptor::new("Painting", "PAINTING")
//!             .primary_key(["PAINTING_ID"])
//!             .attribute(AttributeInfo::new("title", "TITLE"))
//!             .relationship(
//!                 RelationshipInfo::many_to_one("artist", "Artist", "ARTIST_ID", "ARTIST_ID")
//!                     .reverse("paintings"),
//!             ),
//!     )
//!     .build()?;
//!
//! let domain = DataDomain::new("gallery", source, Arc::new(resolver), DomainConfig::default())?;
//! let context = domain.create_context();
//!
//! // Create
//! let artist = context.new_object("Artist")?;
//! context.write_property(&artist, "name", "Monet")?;
//! let painting = context.new_object("Painting")?;
//! context.write_property(&painting, "title", "Water Lilies")?;
//! context.set_to_one(&painting, "artist", Some(&artist))?;
//! context.commit_changes()?;
//!
//! // Query with a prefetch
//! let artists = context.select(
//!     &SelectQuery::new("Artist")
//!         .qualifier(Expression::eq("ARTIST_NAME", "Monet"))
//!         .prefetch("paintings", PrefetchSemantics::Joint),
//! )?;
//!
//! // Edit in isolation, then push into the parent
//! let child = context.create_child_context();
//! let local = child.local_object(&artists[0])?;
//! child.write_property(&local, "name", "Claude Monet")?;
//! child.commit_changes_to_parent()?;
//! ```

// Re-export all public types from sub-crates
pub use rowgraph_core::{
    AttributeInfo,
    ColumnJoin,
    // Errors
    CommitError,
    CommitErrorKind,
    ConfigError,
    // Values and rows
    DataRow,
    DeleteDeniedError,
    // Mapping
    DeleteRule,
    EntityDescriptor,
    EntityResolver,
    EntityResolverBuilder,
    Error,
    Expression,
    FaultError,
    FaultErrorKind,
    IdentityError,
    IdentityErrorKind,
    InheritanceInfo,
    LinkTableInfo,
    MappingError,
    MappingErrorKind,
    // Identity
    ObjectId,
    PersistenceState,
    Property,
    QueryError,
    RelationshipInfo,
    RelationshipKind,
    Result,
    StateError,
    TypeError,
    ValidationError,
    ValidationErrorKind,
    ValidationFailure,
    Value,
};

pub use rowgraph_context::{
    // Channels and storage
    AcceptAllMergePolicy,
    ArcId,
    CommitListener,
    ContextConfig,
    ContextEvent,
    ContextId,
    // Contexts
    DataChannel,
    DataContext,
    DataDomain,
    DataSource,
    DomainConfig,
    FlushResult,
    GraphChangeHandler,
    // Graph diffs
    GraphDiff,
    GraphEvent,
    JointJoin,
    KeepLocalMergePolicy,
    ManagedObject,
    MergePolicy,
    MergePolicyKind,
    NodeDiff,
    ObjectRef,
    PrefetchSemantics,
    PrefetchTreeNode,
    PropertyValue,
    // Queries
    QueryResponse,
    ResultCell,
    ResultColumn,
    ResultRow,
    RowOperation,
    RowSelect,
    RowStore,
    SelectQuery,
    SnapshotEvent,
    SyncType,
    Transaction,
    TransactionBinding,
    Validator,
    bind_transaction,
    bound_transaction,
};

/// Lower-level modules for data source implementors.
pub mod engine {
    pub use rowgraph_context::{
        channel, config, context, domain, flush, graph_diff, identity_map, merge, object,
        object_diff, prefetch, query, resolver, row_store,
    };
}

/// Prelude module for convenient imports.
///
/// ```ignore
/// use rowgraph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AttributeInfo,
        // Contexts
        DataContext,
        DataDomain,
        // Storage
        DataRow,
        DataSource,
        DeleteRule,
        DomainConfig,
        // Mapping
        EntityDescriptor,
        EntityResolver,
        Error,
        // Queries
        Expression,
        LinkTableInfo,
        ObjectId,
        ObjectRef,
        PersistenceState,
        PrefetchSemantics,
        RelationshipInfo,
        Result,
        RowOperation,
        RowSelect,
        SelectQuery,
        Transaction,
        Value,
    };
    pub use std::sync::Arc;
}
