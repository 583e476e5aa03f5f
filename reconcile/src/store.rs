//! Collaborator seams: external sources and the local store

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{FetchError, StoreError};
use crate::identity::normalize;
use crate::record::{ExternalRecord, FieldMap, LocalId, LocalRecord, NewRecord};

/// Something that can produce a full snapshot of one external domain
#[async_trait]
pub trait ExternalSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ExternalRecord>, FetchError>;
}

/// Persistence for reconciled records.
///
/// Every write is expected to be atomic for the single record it touches.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Current snapshot of all records in the domain
    async fn load(&self) -> Result<Vec<LocalRecord>, StoreError>;

    async fn create(&self, record: &NewRecord) -> Result<LocalId, StoreError>;

    /// Merge `changes` into the record and store the new content hash
    async fn update(&self, id: LocalId, changes: &FieldMap, content_hash: &str) -> Result<LocalId, StoreError>;

    async fn delete(&self, id: LocalId) -> Result<LocalId, StoreError>;
}

#[async_trait]
impl<T: ExternalSource + ?Sized> ExternalSource for Arc<T> {
    async fn fetch(&self) -> Result<Vec<ExternalRecord>, FetchError> {
        (**self).fetch().await
    }
}

#[async_trait]
impl<T: LocalStore + ?Sized> LocalStore for Arc<T> {
    async fn load(&self) -> Result<Vec<LocalRecord>, StoreError> {
        (**self).load().await
    }

    async fn create(&self, record: &NewRecord) -> Result<LocalId, StoreError> {
        (**self).create(record).await
    }

    async fn update(&self, id: LocalId, changes: &FieldMap, content_hash: &str) -> Result<LocalId, StoreError> {
        (**self).update(id, changes, content_hash).await
    }

    async fn delete(&self, id: LocalId) -> Result<LocalId, StoreError> {
        (**self).delete(id).await
    }
}

/// Source serving a fixed snapshot
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Vec<ExternalRecord>,
}

impl StaticSource {
    pub fn new(records: Vec<ExternalRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl ExternalSource for StaticSource {
    async fn fetch(&self) -> Result<Vec<ExternalRecord>, FetchError> {
        Ok(self.records.clone())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<LocalId, LocalRecord>,
    next_id: u64,
}

/// In-process store with sequential ids and a unique natural key constraint
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store; new ids continue after the highest existing one
    pub fn with_records(records: impl IntoIterator<Item = LocalRecord>) -> Self {
        let records: BTreeMap<LocalId, LocalRecord> = records.into_iter().map(|r| (r.id, r)).collect();
        let next_id = records.keys().next_back().map(|id| id.0).unwrap_or(0);
        Self {
            inner: Mutex::new(MemoryInner { records, next_id }),
        }
    }

    /// Records ordered by id
    pub fn snapshot(&self) -> Vec<LocalRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    pub fn get(&self, id: LocalId) -> Option<LocalRecord> {
        self.inner.lock().records.get(&id).cloned()
    }

    /// Put a record back exactly as it was, replacing any record with its id
    pub fn restore(&self, record: LocalRecord) {
        let mut inner = self.inner.lock();
        inner.next_id = inner.next_id.max(record.id.0);
        inner.records.insert(record.id, record);
    }

    /// Drop a record without going through the store contract
    pub fn remove(&self, id: LocalId) -> Option<LocalRecord> {
        self.inner.lock().records.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_taken(inner: &MemoryInner, natural_key: &str) -> bool {
        let Ok(wanted) = normalize(natural_key) else {
            return false;
        };
        inner
            .records
            .values()
            .any(|r| normalize(&r.natural_key).map(|k| k == wanted).unwrap_or(false))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn load(&self) -> Result<Vec<LocalRecord>, StoreError> {
        Ok(self.snapshot())
    }

    async fn create(&self, record: &NewRecord) -> Result<LocalId, StoreError> {
        let mut inner = self.inner.lock();
        if Self::key_taken(&inner, &record.natural_key) {
            return Err(StoreError::Conflict(format!(
                "natural key '{}' already exists",
                record.natural_key
            )));
        }

        inner.next_id += 1;
        let id = LocalId(inner.next_id);
        inner.records.insert(
            id,
            LocalRecord {
                id,
                natural_key: record.natural_key.clone(),
                fields: record.fields.clone(),
                content_hash: Some(record.content_hash.clone()),
            },
        );
        Ok(id)
    }

    async fn update(&self, id: LocalId, changes: &FieldMap, content_hash: &str) -> Result<LocalId, StoreError> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        for (field, value) in changes {
            record.fields.insert(field.clone(), value.clone());
        }
        record.content_hash = Some(content_hash.to_string());
        Ok(id)
    }

    async fn delete(&self, id: LocalId) -> Result<LocalId, StoreError> {
        self.inner
            .lock()
            .records
            .remove(&id)
            .map(|_| id)
            .ok_or(StoreError::NotFound(id))
    }
}
