//! Collaborator seams
//!
//! The engine talks to the outside world through three narrow traits: a
//! [`Backend`] for query fetch and change-log commit, a [`SchemaSource`] for
//! entity descriptors, and an [`IdGenerator`] for filling missing key fields
//! on locally inserted records. Transports and test doubles implement these;
//! the engine never assumes anything about the wire.
//!
//! The async traits are `?Send`: the engine runs single-threaded over a
//! shared `Rc` graph and its futures never cross threads.

use std::cell::Cell;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mirage_core_types::{ChangeRecord, FieldMap, Value};

use crate::errors::Result;
use crate::registry::EntityDescriptor;

/// Remote-store collaborator.
#[async_trait(?Send)]
pub trait Backend {
    /// Fetch the rows of `query` under the given parameter bindings.
    /// A name the store cannot serve data for fails with
    /// [`crate::errors::MirageError::QueryNotFound`].
    async fn fetch(
        &self,
        query: &str,
        parameters: &FieldMap,
        token: &CancellationToken,
    ) -> Result<Vec<FieldMap>>;

    /// Apply an ordered change log atomically; returns the affected-row
    /// count reported by the store.
    async fn commit(&self, changes: &[ChangeRecord], token: &CancellationToken) -> Result<u64>;
}

/// Schema collaborator resolving query names to entity descriptors.
#[async_trait(?Send)]
pub trait SchemaSource {
    async fn describe(&self, query: &str, token: &CancellationToken) -> Result<EntityDescriptor>;
}

/// Unique-identifier source for locally inserted records whose key fields
/// arrive blank.
pub trait IdGenerator {
    fn next_id(&self) -> Value;
}

/// Process-local sequential ids. Uniqueness only needs to hold within one
/// model instance; the store assigns durable identity on commit.
pub struct SequentialIds {
    next: Cell<i64>,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: Cell::new(first),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> Value {
        let id = self.next.get();
        self.next.set(id + 1);
        Value::Number(id as f64)
    }
}

/// Time-sortable universally unique ids, for keys that must not collide
/// across concurrently editing clients.
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_id(&self) -> Value {
        Value::String(Uuid::now_v7().to_string())
    }
}
