//! Mirage Core - Reactive in-memory entity graph
//!
//! This crate provides the reactive client-side data engine of Mirage,
//! including:
//! - Observed records and sequences with before/after property notification
//! - Entities with composite-key indexing and per-entity load states
//! - Parameter-bound dependency graphs with cascading, cancellable requery
//! - Writable scalar and collection navigation properties
//! - A transactional change log with batched save and full revert
//! - A schema registry resolving entity descriptors on demand
//!
//! Everything is designed for a single-threaded cooperative runtime: handles
//! are `Rc`-shared, mutation is interior, and async operations run on a
//! current-thread executor.

pub mod backend;
pub mod entity;
pub mod errors;
pub mod index;
pub mod logging_facility;
pub mod model;
pub mod observe;
pub mod record;
pub mod registry;
pub mod relation;
pub mod rows;

// Re-export commonly used types
pub use backend::{Backend, IdGenerator, SchemaSource, SequentialIds, UuidIds};
pub use entity::{CollectionView, Entity, LoadState, LENGTH_PROPERTY};
pub use errors::{ErrorKind, MirageError, Result};
pub use index::CompositeIndex;
pub use model::Model;
pub use observe::{
    BeforeState, ListListener, ListenerHandle, PropertyChange, RecordListener,
};
pub use record::{Record, RecordId, WeakRecord, WriteGuard};
pub use registry::{EntityDescriptor, FieldDescriptor, SchemaRegistry};
pub use relation::{ReferenceRelation, Relation, RelationSource};
pub use rows::RecordList;

// The leaf types live in mirage-core-types; surface the common ones here.
pub use mirage_core_types::{field_map, ChangeKind, ChangeRecord, FieldMap, Value};

pub use tokio_util::sync::CancellationToken;
