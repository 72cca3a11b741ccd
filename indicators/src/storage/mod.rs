use crate::models::RunManifest;
use crate::utils::paths::MARKER_FILE;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::Utc;
use common::{Error, Result};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Replaces `key` in one step; readers never observe a partial object.
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;
    async fn check_file_exists(&self, key: &str) -> Result<bool>;
    fn root(&self) -> &Path;
}

/// Directory-backed storage. Objects are written to a temporary file in the
/// same directory and renamed over the target.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let key = key.trim_start_matches('/');
        if key.is_empty() || key.split('/').any(|part| part == "..") {
            return Err(Error::InvalidInput(format!("Invalid object key '{}'", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStorage for LocalStorage {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        let target = self.object_path(key)?;
        let dir = target.parent().unwrap_or(&self.root).to_path_buf();
        let bytes = data.len();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut file = NamedTempFile::new_in(&dir)?;
            file.write_all(&data)?;
            file.as_file().sync_all()?;
            file.persist(&target)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Other(format!("Write task failed for {}: {}", key, e)))??;

        debug!(key, bytes, "Stored object");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        Ok(tokio::fs::read(path).await?)
    }

    async fn check_file_exists(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key)?.is_file())
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// Outcome of [`StorageManager::write_table`].
#[derive(Debug, Clone)]
pub struct WrittenTable {
    pub key: String,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub content_hash: String,
}

pub struct StorageManager {
    storage: Arc<dyn ArtifactStorage>,
}

impl StorageManager {
    pub fn new(storage: Arc<dyn ArtifactStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn ArtifactStorage> {
        &self.storage
    }

    /// Encodes `batches` as a single Parquet row group stream and stores it
    /// under `key`. Identical input yields identical bytes.
    pub async fn write_table(
        &self,
        schema: SchemaRef,
        batches: &[RecordBatch],
        key: &str,
    ) -> Result<WrittenTable> {
        let schema = batches.first().map(|b| b.schema()).unwrap_or(schema);
        let batch = concat_batches(&schema, batches)?;
        let buffer = encode_parquet(&batch)?;

        self.storage.put_object(key, &buffer).await?;

        let written = WrittenTable {
            key: key.to_string(),
            row_count: batch.num_rows(),
            columns: schema.fields().iter().map(|f| f.name().clone()).collect(),
            content_hash: content_hash(&buffer),
        };
        info!(
            key,
            rows = written.row_count,
            columns = written.columns.len(),
            "Table written"
        );
        Ok(written)
    }

    /// Writes the `_SUCCESS` marker next to `written`.
    pub async fn write_marker(&self, written: &WrittenTable, table: &str, year: i32) -> Result<RunManifest> {
        let manifest = RunManifest {
            run_id: Uuid::new_v4().to_string(),
            table: table.to_string(),
            artifact: written.key.clone(),
            created_at: Utc::now(),
            year,
            row_count: written.row_count,
            columns: written.columns.clone(),
            content_hash: written.content_hash.clone(),
        };
        let marker_json = serde_json::to_vec_pretty(&manifest)?;

        let marker_key = match Path::new(&written.key).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                format!("{}/{}", dir.to_string_lossy(), MARKER_FILE)
            }
            _ => MARKER_FILE.to_string(),
        };
        self.storage.put_object(&marker_key, &marker_json).await?;
        info!(marker = %marker_key, run_id = %manifest.run_id, "Marker written");

        Ok(manifest)
    }

    pub async fn read_marker(&self) -> Result<RunManifest> {
        let bytes = self.storage.get_object(MARKER_FILE).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer: Vec<u8> = Vec::new();
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_parquet;
    use arrow::array::{ArrayRef, Float64Array, StringArray};

    fn sample() -> RecordBatch {
        RecordBatch::try_from_iter(vec![
            (
                "municipality_code",
                Arc::new(StringArray::from(vec!["355030", "530010"])) as ArrayRef,
            ),
            (
                "population",
                Arc::new(Float64Array::from(vec![Some(100_000.0), None])) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_table_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("tabela_final");
        let manager = StorageManager::new(Arc::new(LocalStorage::new(&out)));
        let batch = sample();

        let written = manager
            .write_table(batch.schema(), &[batch.clone()], "indicator_table.parquet")
            .await
            .unwrap();
        assert_eq!(written.row_count, 2);
        assert_eq!(written.columns, vec!["municipality_code", "population"]);

        let read = read_parquet(&out.join("indicator_table.parquet")).unwrap();
        assert_eq!(read.iter().map(|b| b.num_rows()).sum::<usize>(), 2);

        let manifest = manager.write_marker(&written, "indicator_table", 2022).await.unwrap();
        let stored = manager.read_marker().await.unwrap();
        assert_eq!(stored.run_id, manifest.run_id);
        assert_eq!(stored.content_hash, written.content_hash);
        assert_eq!(stored.year, 2022);
    }

    #[tokio::test]
    async fn test_encoding_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()));
        let manager = StorageManager::new(storage.clone());
        let batch = sample();

        let first = manager
            .write_table(batch.schema(), &[batch.slice(0, 1), batch.slice(1, 1)], "a.parquet")
            .await
            .unwrap();
        let second = manager
            .write_table(batch.schema(), &[batch.clone()], "b.parquet")
            .await
            .unwrap();

        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(
            storage.get_object("a.parquet").await.unwrap(),
            storage.get_object("b.parquet").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let err = storage.put_object("../x.parquet", b"x").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!storage.check_file_exists("missing.parquet").await.unwrap());
    }
}
