//! Relation edges between entities
//!
//! Two flavors. A [`Relation`] is a parameter-bound dependency: the left
//! entity supplies a value (from its cursor record or its own parameters)
//! that the right entity consumes as a named query parameter. These edges
//! drive parameter binding and the cascading-requery schedule.
//!
//! A [`ReferenceRelation`] is navigation-bound: it matches foreign-key
//! fields on the left entity against key fields on the right and exposes the
//! match as writable scalar/collection navigation properties. Reference
//! relations never participate in load scheduling.

use crate::errors::{MirageError, Result};

/// Where the left side of a dependency edge reads its supplied value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSource {
    /// A field of the left entity's current cursor record.
    Field(String),
    /// A bound parameter of the left entity.
    Parameter(String),
}

/// Parameter-bound dependency edge. Stored once in the model; the engine
/// tolerates edges added or removed at any time between requeries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub left_entity: String,
    pub left_source: RelationSource,
    pub right_entity: String,
    pub right_parameter: String,
}

impl Relation {
    /// Edge fed by a field of the left entity's cursor record.
    pub fn from_field(
        left_entity: impl Into<String>,
        field: impl Into<String>,
        right_entity: impl Into<String>,
        right_parameter: impl Into<String>,
    ) -> Self {
        Self {
            left_entity: left_entity.into(),
            left_source: RelationSource::Field(field.into()),
            right_entity: right_entity.into(),
            right_parameter: right_parameter.into(),
        }
    }

    /// Edge fed by a bound parameter of the left entity.
    pub fn from_parameter(
        left_entity: impl Into<String>,
        parameter: impl Into<String>,
        right_entity: impl Into<String>,
        right_parameter: impl Into<String>,
    ) -> Self {
        Self {
            left_entity: left_entity.into(),
            left_source: RelationSource::Parameter(parameter.into()),
            right_entity: right_entity.into(),
            right_parameter: right_parameter.into(),
        }
    }
}

/// Navigation-bound reference edge: `left_fields` on the left entity match
/// `right_fields` on the right entity, pairwise and in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRelation {
    pub left_entity: String,
    pub left_fields: Vec<String>,
    pub right_entity: String,
    pub right_fields: Vec<String>,
    /// Scalar navigation exposed on left-entity records, resolving to the
    /// referenced right-entity record.
    pub scalar_property: Option<String>,
    /// Collection navigation exposed on right-entity records, grouping the
    /// left-entity records that reference them.
    pub collection_property: Option<String>,
}

impl ReferenceRelation {
    /// Single-field reference, the common case.
    pub fn new(
        left_entity: impl Into<String>,
        left_field: impl Into<String>,
        right_entity: impl Into<String>,
        right_field: impl Into<String>,
    ) -> Self {
        Self {
            left_entity: left_entity.into(),
            left_fields: vec![left_field.into()],
            right_entity: right_entity.into(),
            right_fields: vec![right_field.into()],
            scalar_property: None,
            collection_property: None,
        }
    }

    /// Multi-field reference; arity is validated when the relation is added
    /// to a model.
    pub fn with_fields(
        left_entity: impl Into<String>,
        left_fields: Vec<String>,
        right_entity: impl Into<String>,
        right_fields: Vec<String>,
    ) -> Self {
        Self {
            left_entity: left_entity.into(),
            left_fields,
            right_entity: right_entity.into(),
            right_fields,
            scalar_property: None,
            collection_property: None,
        }
    }

    pub fn scalar(mut self, property: impl Into<String>) -> Self {
        self.scalar_property = Some(property.into());
        self
    }

    pub fn collection(mut self, property: impl Into<String>) -> Self {
        self.collection_property = Some(property.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.left_fields.is_empty()
            || self.right_fields.is_empty()
            || self.left_fields.len() != self.right_fields.len()
        {
            return Err(MirageError::ReferenceArityMismatch {
                left_entity: self.left_entity.clone(),
                right_entity: self.right_entity.clone(),
                left_fields: self.left_fields.len(),
                right_fields: self.right_fields.len(),
            });
        }
        Ok(())
    }
}

/// Scalar navigation installed on the left entity of a reference relation.
#[derive(Debug, Clone)]
pub(crate) struct ScalarNavigation {
    pub name: String,
    /// Foreign-key fields on the owning entity, in relation order.
    pub fields: Vec<String>,
    pub target_entity: String,
    pub target_fields: Vec<String>,
    /// Collection property name on the target side of the same relation,
    /// when configured. Lets a foreign-key flip notify both ends.
    pub paired_collection: Option<String>,
}

/// Collection navigation installed on the right entity of a reference
/// relation. Records come from `source_entity`, grouped by matching
/// `source_fields` against the owning record's `local_fields`.
#[derive(Debug, Clone)]
pub(crate) struct CollectionNavigation {
    pub name: String,
    pub source_entity: String,
    pub source_fields: Vec<String>,
    pub local_fields: Vec<String>,
}
