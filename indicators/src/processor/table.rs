use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use common::Result;
use datafusion::datasource::MemTable;
use datafusion::datasource::file_format::options::ParquetReadOptions;
use datafusion::prelude::SessionContext;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait TableRegistry: Send + Sync + 'static {
    async fn register_batches(
        &self,
        ctx: &SessionContext,
        table_name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()>;

    async fn register_parquet(
        &self,
        ctx: &SessionContext,
        table_name: &str,
        file_path: &Path,
    ) -> Result<()>;

    async fn deregister_table(&self, ctx: &SessionContext, table_name: &str) -> Result<()>;
}

/// Registers in-memory batches as `MemTable`s and artifacts as Parquet listings.
/// A prior table of the same name is replaced.
pub struct SessionTableRegistry;

#[async_trait]
impl TableRegistry for SessionTableRegistry {
    async fn register_batches(
        &self,
        ctx: &SessionContext,
        table_name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()> {
        ctx.deregister_table(table_name)?;
        let table = MemTable::try_new(schema, vec![batches])?;
        ctx.register_table(table_name, Arc::new(table))
            .map_err(|e| common::Error::Other(format!(
                "Failed to register {}: {}",
                table_name, e
            )))?;
        Ok(())
    }

    async fn register_parquet(
        &self,
        ctx: &SessionContext,
        table_name: &str,
        file_path: &Path,
    ) -> Result<()> {
        if !file_path.exists() {
            return Err(common::Error::NotFound(file_path.display().to_string()));
        }
        ctx.deregister_table(table_name)?;

        let path = file_path.to_string_lossy().to_string();
        ctx.register_parquet(table_name, &path, ParquetReadOptions::default())
            .await
            .map_err(|e| common::Error::Other(format!(
                "Failed to register {} at {}: {}",
                table_name, path, e
            )))
    }

    async fn deregister_table(&self, ctx: &SessionContext, table_name: &str) -> Result<()> {
        ctx.deregister_table(table_name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, StringArray};
    use crate::utils::sql::scalar_count;

    #[tokio::test]
    async fn test_register_and_replace_batches() {
        let ctx = SessionContext::new();
        let registry = SessionTableRegistry;
        let batch = RecordBatch::try_from_iter(vec![(
            "co_cnes",
            Arc::new(StringArray::from(vec!["1", "2"])) as ArrayRef,
        )])
        .unwrap();

        registry
            .register_batches(&ctx, "facility", batch.schema(), vec![batch.clone()])
            .await
            .unwrap();
        registry
            .register_batches(&ctx, "facility", batch.schema(), vec![batch.clone(), batch])
            .await
            .unwrap();

        let count = scalar_count(&ctx, "SELECT COUNT(*) FROM facility").await.unwrap();
        assert_eq!(count, 4);

        registry.deregister_table(&ctx, "facility").await.unwrap();
        assert!(ctx.sql("SELECT * FROM facility").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_parquet_is_not_found() {
        let ctx = SessionContext::new();
        let err = SessionTableRegistry
            .register_parquet(&ctx, "indicator_table", Path::new("/nonexistent.parquet"))
            .await
            .unwrap_err();
        assert!(matches!(err, common::Error::NotFound(_)));
    }
}
