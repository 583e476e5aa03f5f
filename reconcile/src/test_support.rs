//! Shared fixtures for the engine tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rstest::fixture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::ReconcileConfig;
use crate::domain::FieldMappingDomain;
use crate::error::{FetchError, StoreError};
use crate::record::{ExternalRecord, FieldMap, LocalId, LocalRecord, NewRecord};
use crate::store::{ExternalSource, LocalStore, MemoryStore};

/// Route engine logs through the test harness; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("reconcile=debug")
        .with_test_writer()
        .try_init();
}

pub fn ext(value: Value) -> ExternalRecord {
    ExternalRecord::from_json(value).expect("fixture must be a JSON object")
}

/// External record with the `key`/`name` layout used throughout the tests
pub fn person(key: &str, name: &str) -> ExternalRecord {
    ext(json!({"key": key, "name": name}))
}

pub fn local(id: u64, key: &str, name: &str) -> LocalRecord {
    let mut fields = FieldMap::new();
    fields.insert("key".into(), json!(key));
    fields.insert("name".into(), json!(name));
    LocalRecord::new(id, key, fields)
}

#[fixture]
pub fn keyed_domain() -> FieldMappingDomain {
    FieldMappingDomain::passthrough("lawyers", "key")
}

/// Fast retries so tests do not sleep for real backoff delays
#[fixture]
pub fn fast_config() -> ReconcileConfig {
    ReconcileConfig {
        backoff_base_ms: 1,
        max_backoff_ms: 8,
        fetch_timeout_ms: 1_000,
        ..Default::default()
    }
}

/// Source that fails a fixed number of times before serving its snapshot
pub struct FlakySource {
    records: Vec<ExternalRecord>,
    failures: u32,
    transient: bool,
    pub calls: AtomicU32,
}

impl FlakySource {
    pub fn new(records: Vec<ExternalRecord>, failures: u32, transient: bool) -> Self {
        Self {
            records,
            failures,
            transient,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalSource for FlakySource {
    async fn fetch(&self) -> Result<Vec<ExternalRecord>, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(FetchError {
                transient: self.transient,
                message: format!("failure {}", call),
            });
        }
        Ok(self.records.clone())
    }
}

/// Source that never answers within any reasonable timeout
pub struct HangingSource;

#[async_trait]
impl ExternalSource for HangingSource {
    async fn fetch(&self) -> Result<Vec<ExternalRecord>, FetchError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(Vec::new())
    }
}

/// Memory store with injectable per-record failures
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    fail_keys: HashSet<String>,
    fail_ids: HashSet<LocalId>,
    fail_load: bool,
    cancel_after_first_write: Option<CancellationToken>,
    create_delay: Option<Duration>,
    journal: Mutex<Vec<String>>,
    pub writes: AtomicUsize,
}

impl FaultyStore {
    pub fn new(records: Vec<LocalRecord>) -> Self {
        Self {
            inner: MemoryStore::with_records(records),
            ..Default::default()
        }
    }

    /// Fail creates for this natural key
    pub fn fail_key(mut self, key: &str) -> Self {
        self.fail_keys.insert(key.to_string());
        self
    }

    /// Fail updates and deletes for this id
    pub fn fail_id(mut self, id: u64) -> Self {
        self.fail_ids.insert(LocalId(id));
        self
    }

    pub fn fail_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn cancel_after_first_write(mut self, token: CancellationToken) -> Self {
        self.cancel_after_first_write = Some(token);
        self
    }

    /// Creates take this long to complete
    pub fn slow_creates(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Start and end of every create and delete, in the order they happened
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    fn note(&self, entry: String) {
        self.journal.lock().push(entry);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn track_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_after_first_write {
            token.cancel();
        }
    }
}

#[async_trait]
impl LocalStore for FaultyStore {
    async fn load(&self) -> Result<Vec<LocalRecord>, StoreError> {
        if self.fail_load {
            return Err(StoreError::Unavailable("database offline".into()));
        }
        self.inner.load().await
    }

    async fn create(&self, record: &NewRecord) -> Result<LocalId, StoreError> {
        self.track_write();
        self.note(format!("start create {}", record.natural_key));
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let result = if self.fail_keys.contains(&record.natural_key) {
            Err(StoreError::Conflict(format!("rejected {}", record.natural_key)))
        } else {
            self.inner.create(record).await
        };
        self.note(format!("end create {}", record.natural_key));
        result
    }

    async fn update(&self, id: LocalId, changes: &FieldMap, content_hash: &str) -> Result<LocalId, StoreError> {
        self.track_write();
        if self.fail_ids.contains(&id) {
            return Err(StoreError::Unavailable(format!("timeout updating {}", id)));
        }
        self.inner.update(id, changes, content_hash).await
    }

    async fn delete(&self, id: LocalId) -> Result<LocalId, StoreError> {
        self.track_write();
        self.note(format!("start delete {}", id));
        let result = if self.fail_ids.contains(&id) {
            Err(StoreError::Unavailable(format!("timeout deleting {}", id)))
        } else {
            self.inner.delete(id).await
        };
        self.note(format!("end delete {}", id));
        result
    }
}
