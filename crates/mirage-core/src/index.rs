//! Composite-key grouping
//!
//! A [`CompositeIndex`] groups records by the combined value of an explicit
//! field set. Field names are sorted at construction, so any criteria naming
//! the same fields resolves to the same index regardless of spelling order.
//! Key strings are built from unambiguously encoded components joined by a
//! fixed delimiter; two records collide only when every indexed field is
//! value-equal.
//!
//! The index never rejects duplicates. Membership is identity-based, and a
//! key-uniqueness violation is a lookup-time concern of the owning entity.

use std::cell::RefCell;
use std::collections::HashMap;

use mirage_core_types::{FieldMap, Value};

use crate::record::Record;

/// Joins encoded key components and canonical field names.
pub const KEY_DELIMITER: &str = " | ";

pub struct CompositeIndex {
    fields: Vec<String>,
    buckets: RefCell<HashMap<String, Vec<Record>>>,
}

impl CompositeIndex {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: Self::canonical_fields(fields),
            buckets: RefCell::new(HashMap::new()),
        }
    }

    /// Sorted, deduplicated field names.
    pub fn canonical_fields<I, S>(fields: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        fields.sort();
        fields.dedup();
        fields
    }

    /// Canonical identity of a field set: sorted names joined by the key
    /// delimiter. Two criteria over the same fields share one index.
    pub fn canonical_name_of<I, S>(fields: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::canonical_fields(fields).join(KEY_DELIMITER)
    }

    pub fn canonical_name(&self) -> String {
        self.fields.join(KEY_DELIMITER)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn contains_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }

    /// Key of one record under this index; absent fields read as null.
    pub fn key_of(&self, record: &Record) -> String {
        self.fields
            .iter()
            .map(|f| record.get(f).key_component())
            .collect::<Vec<_>>()
            .join(KEY_DELIMITER)
    }

    /// Key of a criteria map; fields the criteria does not name read as null.
    pub fn key_of_criteria(&self, criteria: &FieldMap) -> String {
        self.fields
            .iter()
            .map(|f| criteria.get(f).cloned().unwrap_or(Value::Null).key_component())
            .collect::<Vec<_>>()
            .join(KEY_DELIMITER)
    }

    /// Register a record under its current key. Re-adding a member is a
    /// no-op; duplicate keys across distinct records coexist in one bucket.
    pub fn add(&self, record: &Record) {
        let key = self.key_of(record);
        let mut buckets = self.buckets.borrow_mut();
        let bucket = buckets.entry(key).or_default();
        if !bucket.iter().any(|r| r == record) {
            bucket.push(record.clone());
        }
    }

    /// Deregister a record from the bucket of its current key. Callers must
    /// remove before mutating an indexed field, while the key still matches.
    pub fn remove(&self, record: &Record) -> bool {
        let key = self.key_of(record);
        let mut buckets = self.buckets.borrow_mut();
        let Some(bucket) = buckets.get_mut(&key) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|r| r != record);
        let found = bucket.len() != before;
        if bucket.is_empty() {
            buckets.remove(&key);
        }
        found
    }

    /// Deregister a record wherever it sits, even if its key no longer
    /// matches its bucket. Keyed removal first, full scan as fallback.
    pub fn purge(&self, record: &Record) -> bool {
        if self.remove(record) {
            return true;
        }
        let mut buckets = self.buckets.borrow_mut();
        let mut emptied = None;
        let mut found = false;
        for (key, bucket) in buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|r| r != record);
            if bucket.len() != before {
                found = true;
                if bucket.is_empty() {
                    emptied = Some(key.clone());
                }
                break;
            }
        }
        if let Some(key) = emptied {
            buckets.remove(&key);
        }
        found
    }

    /// All records whose indexed fields match the criteria, in registration
    /// order.
    pub fn find(&self, criteria: &FieldMap) -> Vec<Record> {
        let key = self.key_of_criteria(criteria);
        self.buckets
            .borrow()
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.borrow().is_empty()
    }
}
