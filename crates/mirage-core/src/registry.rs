//! Schema descriptors and their cache
//!
//! An [`EntityDescriptor`] is the store's declaration of one query: its
//! fields, primary keys and parameter names. The [`SchemaRegistry`] caches
//! descriptors per registry instance; nothing here is process-global, and
//! the cache is cleared explicitly when the application wants fresh schema.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::SchemaSource;
use crate::entity::Entity;
use crate::errors::{MirageError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub pk: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            pk: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.pk = true;
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub parameters: Vec<String>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            fields: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(name.into());
        self
    }

    pub fn primary_keys(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.pk)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Check an entity's configured key fields against the declared primary
    /// keys, order-insensitively. A descriptor declaring no primary keys is
    /// treated as silent and passes.
    pub fn verify_keys(&self, entity: &Entity) -> Result<()> {
        let declared: Vec<String> = self.primary_keys().iter().map(|s| s.to_string()).collect();
        if declared.is_empty() {
            return Ok(());
        }
        let configured = entity.key_fields();
        let mut declared_sorted = declared.clone();
        declared_sorted.sort();
        let mut configured_sorted = configured.clone();
        configured_sorted.sort();
        if declared_sorted != configured_sorted {
            return Err(MirageError::KeyFieldMismatch {
                entity: entity.name(),
                configured,
                declared,
            });
        }
        Ok(())
    }
}

/// Descriptor cache over a [`SchemaSource`].
pub struct SchemaRegistry {
    source: Rc<dyn SchemaSource>,
    cache: RefCell<HashMap<String, EntityDescriptor>>,
}

impl SchemaRegistry {
    pub fn new(source: Rc<dyn SchemaSource>) -> Self {
        Self {
            source,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn cached(&self, name: &str) -> Option<EntityDescriptor> {
        self.cache.borrow().get(name).cloned()
    }

    /// Seed a descriptor without consulting the source.
    pub fn insert(&self, descriptor: EntityDescriptor) {
        self.cache
            .borrow_mut()
            .insert(descriptor.name.clone(), descriptor);
    }

    /// Resolve descriptors for every requested name, in request order.
    /// Cache misses are fetched from the source concurrently; any miss
    /// failure fails the whole call and caches nothing new.
    pub async fn require(
        &self,
        names: &[&str],
        token: &CancellationToken,
    ) -> Result<Vec<EntityDescriptor>> {
        let misses: BTreeSet<String> = {
            let cache = self.cache.borrow();
            names
                .iter()
                .filter(|n| !cache.contains_key(**n))
                .map(|n| n.to_string())
                .collect()
        };
        if !misses.is_empty() {
            tracing::debug!(
                component = module_path!(),
                count = misses.len(),
                "loading schema descriptors"
            );
            let fetched = try_join_all(
                misses
                    .iter()
                    .map(|name| self.source.describe(name, token)),
            )
            .await?;
            let mut cache = self.cache.borrow_mut();
            for descriptor in fetched {
                cache.insert(descriptor.name.clone(), descriptor);
            }
        }
        names
            .iter()
            .map(|name| {
                self.cached(name).ok_or_else(|| MirageError::QueryNotFound {
                    query: name.to_string(),
                })
            })
            .collect()
    }

    /// Drop every cached descriptor.
    pub fn clear(&self) {
        self.cache.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.borrow().is_empty()
    }
}
