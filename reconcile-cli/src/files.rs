//! JSON file backed source and store

use async_trait::async_trait;
use reconcile::{
    ExternalRecord, ExternalSource, FetchError, FieldMap, LocalId, LocalRecord, LocalStore, MemoryStore,
    NewRecord, StoreError,
};
use serde_json::Value;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// External snapshot exported to a JSON array of objects
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ExternalSource for FileSource {
    async fn fetch(&self) -> Result<Vec<ExternalRecord>, FetchError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FetchError::permanent(format!("{} does not exist", self.path.display())));
            }
            Err(e) => {
                return Err(FetchError::transient(format!("reading {}: {}", self.path.display(), e)));
            }
        };

        let values: Vec<Value> = serde_json::from_str(&content)
            .map_err(|e| FetchError::permanent(format!("parsing {}: {}", self.path.display(), e)))?;

        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                ExternalRecord::from_json(value).ok_or_else(|| {
                    FetchError::permanent(format!(
                        "{}: element {} is not an object",
                        self.path.display(),
                        index
                    ))
                })
            })
            .collect()
    }
}

/// Local store kept in a JSON file.
///
/// Records live in a [`MemoryStore`]; every write rewrites the file through
/// a temporary file and an atomic rename. A write whose file update fails is
/// rolled back in memory too, so the next write never persists it.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: MemoryStore,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store, starting empty when the file does not exist yet
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let records: Vec<LocalRecord> = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), records = records.len(), "Opened local store");

        Ok(Self {
            path,
            records: MemoryStore::with_records(records),
            write_lock: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Vec<LocalRecord> {
        self.records.snapshot()
    }

    /// Caller holds `write_lock`
    async fn persist(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.records.snapshot())
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?
            .map_err(|e| StoreError::Unavailable(format!("writing store file: {}", e)))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl LocalStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<LocalRecord>, StoreError> {
        self.records.load().await
    }

    async fn create(&self, record: &NewRecord) -> Result<LocalId, StoreError> {
        let _guard = self.write_lock.lock().await;
        let id = self.records.create(record).await?;
        if let Err(e) = self.persist().await {
            self.records.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    async fn update(&self, id: LocalId, changes: &FieldMap, content_hash: &str) -> Result<LocalId, StoreError> {
        let _guard = self.write_lock.lock().await;
        let previous = self.records.get(id).ok_or(StoreError::NotFound(id))?;
        self.records.update(id, changes, content_hash).await?;
        if let Err(e) = self.persist().await {
            self.records.restore(previous);
            return Err(e);
        }
        Ok(id)
    }

    async fn delete(&self, id: LocalId) -> Result<LocalId, StoreError> {
        let _guard = self.write_lock.lock().await;
        let previous = self.records.get(id).ok_or(StoreError::NotFound(id))?;
        self.records.delete(id).await?;
        if let Err(e) = self.persist().await {
            self.records.restore(previous);
            return Err(e);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::content_hash;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_source_reads_objects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lawyers.json");
        tokio::fs::write(&path, r#"[{"email": "a@example.com"}, {"email": "b@example.com"}]"#)
            .await
            .unwrap();

        let records = FileSource::new(&path).fetch().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get_str("email"), Some("b@example.com"));
    }

    #[tokio::test]
    async fn test_source_errors_are_permanent() {
        let dir = TempDir::new().unwrap();

        let missing = FileSource::new(dir.path().join("missing.json")).fetch().await.unwrap_err();
        assert!(!missing.is_retryable());

        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, r#"[{"email": "a@example.com"}, 42]"#).await.unwrap();
        let err = FileSource::new(&path).fetch().await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("element 1"));
    }

    #[tokio::test]
    async fn test_store_writes_through_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());

        let mut fields = FieldMap::new();
        fields.insert("email".into(), json!("a@example.com"));
        let id = store
            .create(&NewRecord {
                natural_key: "a@example.com".into(),
                content_hash: content_hash(&fields),
                fields,
            })
            .await
            .unwrap();

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let records = reopened.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);

        reopened.delete(id).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let on_disk: Vec<LocalRecord> = serde_json::from_str(&content).unwrap();
        assert!(on_disk.is_empty());
    }

    fn lawyer(email: &str, name: &str) -> NewRecord {
        let mut fields = FieldMap::new();
        fields.insert("email".into(), json!(email));
        fields.insert("name".into(), json!(name));
        NewRecord {
            natural_key: email.into(),
            content_hash: content_hash(&fields),
            fields,
        }
    }

    #[tokio::test]
    async fn test_unwritable_file_rolls_back_memory() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let path = data.join("store.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        let kept = store.create(&lawyer("a@example.com", "Anna")).await.unwrap();
        let before = store.snapshot();

        // A plain file where the store directory should be
        std::fs::remove_dir_all(&data).unwrap();
        std::fs::write(&data, b"").unwrap();

        let err = store.create(&lawyer("b@example.com", "Ben")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        let mut changes = FieldMap::new();
        changes.insert("name".into(), json!("Anna Berg"));
        assert!(store.update(kept, &changes, "h2").await.is_err());
        assert!(store.delete(kept).await.is_err());
        assert_eq!(store.snapshot(), before);

        std::fs::remove_file(&data).unwrap();
        store.create(&lawyer("c@example.com", "Clara")).await.unwrap();

        let on_disk = JsonFileStore::open(&path).await.unwrap().snapshot();
        let keys: Vec<&str> = on_disk.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["a@example.com", "c@example.com"]);
        assert_eq!(on_disk[0].fields.get("name"), Some(&json!("Anna")));
    }

    #[tokio::test]
    async fn test_store_failure_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let store = JsonFileStore::open(&path).await.unwrap();

        let err = store.delete(LocalId(99)).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound(LocalId(99)));
        assert!(!path.exists());
    }
}
