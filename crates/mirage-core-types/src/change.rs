//! Change record wire shapes
//!
//! The transactional change log is an ordered sequence of these records.
//! They round-trip through the commit collaborator exactly as serialized
//! here, so the shapes are part of the external contract:
//!
//! - insert: `{"kind":"insert","entity":...,"data":{...}}`
//! - update: `{"kind":"update","entity":...,"keys":{...},"data":{...}}`
//! - delete: `{"kind":"delete","entity":...,"keys":{...}}`
//! - command: `{"kind":"command","entity":...,"parameters":{...}}`

use serde::{Deserialize, Serialize};

use crate::value::FieldMap;

/// One entry of the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChangeRecord {
    /// A locally created record; `data` carries every field.
    Insert { entity: String, data: FieldMap },
    /// A field mutation on a previously committed record; `keys` addresses
    /// the record by its pre-change key values.
    Update {
        entity: String,
        keys: FieldMap,
        data: FieldMap,
    },
    /// A local removal; only the key fields travel.
    Delete { entity: String, keys: FieldMap },
    /// A queued write-only server operation with no backing collection.
    Command { entity: String, parameters: FieldMap },
}

impl ChangeRecord {
    /// The entity (server query name) this change addresses.
    pub fn entity(&self) -> &str {
        match self {
            ChangeRecord::Insert { entity, .. }
            | ChangeRecord::Update { entity, .. }
            | ChangeRecord::Delete { entity, .. }
            | ChangeRecord::Command { entity, .. } => entity,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeRecord::Insert { .. } => ChangeKind::Insert,
            ChangeRecord::Update { .. } => ChangeKind::Update,
            ChangeRecord::Delete { .. } => ChangeKind::Delete,
            ChangeRecord::Command { .. } => ChangeKind::Command,
        }
    }
}

/// Discriminant of a [`ChangeRecord`], matching the wire `kind` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Command,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Command => "command",
        }
    }
}
