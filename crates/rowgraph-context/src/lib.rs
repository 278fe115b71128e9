//! Object contexts for rowgraph.
//!
//! `rowgraph-context` is the **unit-of-work layer**. It keeps managed objects
//! unique per context, records every change as graph operations and pushes
//! them into the parent channel on commit.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one [`ManagedObject`] per [`ObjectId`](rowgraph_core::ObjectId)
//!   in each context.
//! - **Change tracking**: attribute baselines and explicit arc operations,
//!   replayed as a [`GraphDiff`].
//! - **Snapshot cache**: a [`RowStore`] shared by the contexts of a domain,
//!   with commit notifications fanned out to every subscriber.
//! - **Commit**: a [`DataDomain`] orders the resulting [`RowOperation`]s so
//!   foreign keys hold at every step and runs them in one transaction.
//! - **Nesting**: a [`DataContext`] is itself a [`DataChannel`], so child
//!   contexts can edit in isolation and commit into their parent.
//!
//! # Example
//!
//! ```ignore
//! let domain = DataDomain::new("gallery", source, resolver, DomainConfig::default())?;
//! let context = domain.create_context();
//!
//! let artist = context.new_object("Artist")?;
//! context.write_property(&artist, "name", "Monet")?;
//! context.commit_changes()?;
//!
//! let paintings = context.read_to_many(&artist, "paintings")?;
//! ```

pub mod channel;
pub mod config;
pub mod context;
mod delete_action;
pub mod domain;
pub mod flush;
pub mod graph_diff;
mod hierarchical;
pub mod identity_map;
pub mod merge;
pub mod object;
pub mod object_diff;
pub mod prefetch;
pub mod query;
pub mod resolver;
pub mod row_store;

#[cfg(test)]
mod test_support;

pub use channel::{
    DataChannel, DataSource, JointJoin, RowSelect, SyncType, Transaction, TransactionBinding,
    bind_transaction, bound_transaction,
};
pub use config::{ContextConfig, DomainConfig, MergePolicyKind};
pub use context::{CommitListener, ContextEvent, DataContext, GraphEvent, Validator};
pub use domain::DataDomain;
pub use flush::{FlushOrderer, FlushPlan, FlushResult, RowOperation};
pub use graph_diff::{ArcId, GraphChangeHandler, GraphDiff, NodeDiff};
pub use identity_map::{ObjectStore, StoreGuard};
pub use merge::{AcceptAllMergePolicy, KeepLocalMergePolicy, MergePolicy};
pub use object::{ContextId, ManagedObject, ObjectRef, PropertyValue};
pub use object_diff::ObjectDiff;
pub use prefetch::{PrefetchProcessor, PrefetchSemantics, PrefetchTreeNode};
pub use query::{QueryResponse, ResultCell, ResultColumn, ResultRow, SelectQuery};
pub use resolver::ObjectResolver;
pub use row_store::{RowStore, SnapshotEvent, StoreEvent};
