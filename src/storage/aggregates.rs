//! Aggregate store: one versioned document per rated entity.
//!
//! Documents are JSON objects so the rating fields can live next to fields
//! owned by other writers (display name, social handle). Every write merges
//! into the stored document rather than replacing it.

use crate::core::path::aggregate_path;
use crate::core::rating::EntityId;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};

/// Document version; `0` means the document does not exist
pub type Version = u64;

/// Document contents as read at one version
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub version: Version,
    pub fields: Map<String, Value>,
}

impl Snapshot {
    pub fn exists(&self) -> bool {
        self.version > 0
    }
}

/// Trait for aggregate store implementations
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Read the current document for an entity
    async fn read(&self, entity_id: &EntityId) -> Result<Snapshot>;

    /// Merge `fields` into the document if it is still at `expected`.
    ///
    /// Returns the new version, or `Error::Conflict` when another write
    /// landed since `expected` was read.
    async fn commit(
        &self,
        entity_id: &EntityId,
        expected: Version,
        fields: Map<String, Value>,
    ) -> Result<Version>;

    /// Merge `fields` into the document regardless of its version
    async fn merge(&self, entity_id: &EntityId, fields: Map<String, Value>) -> Result<Version>;

    /// Entities that have a document
    async fn entities(&self) -> Result<Vec<EntityId>>;
}

/// Merge `patch` into `target`.
///
/// Nested objects merge key by key; any other value replaces what was there.
pub fn merge_fields(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Object(nested) => {
                if let Some(Value::Object(existing)) = target.get_mut(&key) {
                    merge_fields(existing, nested);
                    continue;
                }
                target.insert(key, Value::Object(nested));
            }
            value => {
                target.insert(key, value);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Document {
    version: Version,
    fields: Map<String, Value>,
}

/// In-memory aggregate store with per-entity compare-and-set
#[derive(Default)]
pub struct InMemoryAggregateStore {
    docs: DashMap<EntityId, Document>,
}

impl InMemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregateStore for InMemoryAggregateStore {
    async fn read(&self, entity_id: &EntityId) -> Result<Snapshot> {
        Ok(self
            .docs
            .get(entity_id)
            .map(|doc| Snapshot {
                version: doc.version,
                fields: doc.fields.clone(),
            })
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        entity_id: &EntityId,
        expected: Version,
        fields: Map<String, Value>,
    ) -> Result<Version> {
        let conflict = |found: Version| {
            Error::Conflict(format!(
                "{} is at version {found}, expected {expected}",
                aggregate_path(entity_id)
            ))
        };

        match self.docs.entry(entity_id.clone()) {
            Entry::Occupied(mut entry) => {
                let doc = entry.get_mut();
                if doc.version != expected {
                    return Err(conflict(doc.version));
                }
                merge_fields(&mut doc.fields, fields);
                doc.version += 1;
                Ok(doc.version)
            }
            Entry::Vacant(entry) => {
                if expected != 0 {
                    return Err(conflict(0));
                }
                entry.insert(Document { version: 1, fields });
                Ok(1)
            }
        }
    }

    async fn merge(&self, entity_id: &EntityId, fields: Map<String, Value>) -> Result<Version> {
        let mut doc = self.docs.entry(entity_id.clone()).or_default();
        merge_fields(&mut doc.fields, fields);
        doc.version += 1;
        Ok(doc.version)
    }

    async fn entities(&self) -> Result<Vec<EntityId>> {
        let mut ids: Vec<EntityId> = self.docs.iter().map(|doc| doc.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
