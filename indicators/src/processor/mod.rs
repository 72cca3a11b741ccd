pub mod dedup;
pub mod engine;
pub mod features;
pub mod geo;
pub mod mortality;
pub mod normalize;
pub mod plan;
pub mod table;

pub use dedup::{DedupMetrics, SnapshotDeduplicator};
pub use engine::AggregationEngine;
pub use features::FeatureExporter;
pub use geo::{GeoReconciler, Reconciled};
pub use normalize::SchemaNormalizer;
pub use table::{SessionTableRegistry, TableRegistry};

use crate::models::{RunManifest, SourceTable};
use crate::reader::{concat_aligned, discover, SourceReader};
use crate::schema::{all_sources, SourceSpec, MORTALITY};
use crate::storage::{LocalStorage, StorageManager};
use crate::utils::paths::INDICATOR_TABLE_FILE;
use arrow::array::{new_null_array, ArrayRef};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use common::config::{DirectoryRole, Settings};
use common::{Error, Result};
use datafusion::prelude::SessionContext;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

pub const INDICATOR_TABLE: &str = "indicator_table";

/// Summary of one pipeline run.
#[derive(Debug)]
pub struct RunSummary {
    pub manifest: RunManifest,
    pub dedup: Vec<DedupMetrics>,
    pub staged: Vec<String>,
}

/// Runs every stage of the pipeline against one session context.
pub struct IndicatorProcessor {
    ctx: Arc<SessionContext>,
    settings: Settings,
    reader: SourceReader,
    normalizer: SchemaNormalizer,
    reconciler: GeoReconciler,
    deduplicator: SnapshotDeduplicator,
    engine: AggregationEngine,
    output: StorageManager,
    staging: Option<StorageManager>,
}

impl IndicatorProcessor {
    pub fn new(settings: &Settings) -> Self {
        let ctx = Arc::new(SessionContext::new());
        let table_registry: Arc<dyn TableRegistry> = Arc::new(SessionTableRegistry);
        let year = settings.year;

        let staging = settings
            .dirs
            .path(DirectoryRole::Staging)
            .map(|dir| StorageManager::new(Arc::new(LocalStorage::new(dir))));

        Self {
            reader: SourceReader::new(settings.reader.clone()),
            normalizer: SchemaNormalizer::new(),
            reconciler: GeoReconciler::new(),
            deduplicator: SnapshotDeduplicator::new(ctx.clone(), table_registry.clone(), year),
            engine: AggregationEngine::new(ctx.clone(), table_registry, year),
            output: StorageManager::new(Arc::new(LocalStorage::new(&settings.dirs.output))),
            staging,
            settings: settings.clone(),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Reads, normalizes, reconciles and deduplicates one logical source.
    pub async fn load_source(
        &self,
        spec: &SourceSpec,
    ) -> Result<(Reconciled<SourceTable>, Option<DedupMetrics>)> {
        let dir = self.settings.dirs.path(spec.role).ok_or_else(|| Error::MissingDirectory {
            role: spec.role.to_string(),
            path: "<unset>".to_string(),
        })?;
        let files = discover(spec, dir, self.settings.year)?;

        let mut batches = Vec::new();
        let mut periods = BTreeSet::new();
        let mut ordinal = 0u64;
        for file in &files {
            for batch in self.reader.read_file(file)? {
                let rows = batch.num_rows() as u64;
                batches.push(self.normalizer.normalize(&batch, file.period, ordinal)?);
                ordinal += rows;
            }
            if let Some(period) = file.period {
                periods.insert(period);
            }
        }

        let batch = concat_aligned(&batches)?;
        let batch = with_expected_columns(spec, batch)?;
        debug!(
            source = spec.name,
            files = files.len(),
            rows = batch.num_rows(),
            "Loaded source"
        );

        let table = SourceTable::new(spec.name, batch, periods);
        let reconciled = self.reconciler.reconcile(table, spec.geo_columns)?;
        self.deduplicator.deduplicate(spec, reconciled).await
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let start_time = Utc::now();
        let mut tables = Vec::new();
        let mut dedup = Vec::new();

        for spec in all_sources() {
            let (table, metrics) = self.load_source(spec).await?;
            self.engine.register_source(&table).await?;
            dedup.extend(metrics);
            tables.push(table);
        }
        info!(sources = tables.len(), "All sources loaded");

        let df = self.engine.build().await?;
        let schema = Arc::new(df.schema().as_arrow().clone());
        let batches = df.collect().await?;

        let staged = match &self.staging {
            Some(staging) => self.stage(staging, &tables).await?,
            None => Vec::new(),
        };

        let written = self
            .output
            .write_table(schema, &batches, INDICATOR_TABLE_FILE)
            .await?;
        let manifest = self
            .output
            .write_marker(&written, INDICATOR_TABLE, self.settings.year)
            .await?;

        info!(
            rows = manifest.row_count,
            columns = manifest.columns.len(),
            duration_ms = (Utc::now() - start_time).num_milliseconds(),
            "Indicator table materialized"
        );
        Ok(RunSummary {
            manifest,
            dedup,
            staged,
        })
    }

    /// Persists every loaded source plus the decoded mortality and facility
    /// tables. Must run after [`AggregationEngine::build`].
    async fn stage(
        &self,
        staging: &StorageManager,
        tables: &[Reconciled<SourceTable>],
    ) -> Result<Vec<String>> {
        let mut staged = Vec::new();

        for table in tables {
            let key = format!("{}.parquet", table.name);
            staging
                .write_table(table.schema(), &[table.batch.clone()], &key)
                .await?;
            staged.push(key);
        }

        let mortality_columns: Vec<String> = tables
            .iter()
            .find(|t| t.name == MORTALITY)
            .map(|t| t.schema().fields().iter().map(|f| f.name().clone()).collect())
            .unwrap_or_default();

        let derived = [
            ("mortality_decoded", mortality::decoded_mortality_sql(&mortality_columns)),
            ("facility_enriched", "SELECT * FROM facility_deaths ORDER BY co_cnes".to_string()),
        ];
        for (name, sql) in derived {
            let df = self.ctx.sql(&sql).await?;
            let schema = Arc::new(df.schema().as_arrow().clone());
            let batches = df.collect().await?;
            let key = format!("{}.parquet", name);
            staging.write_table(schema, &batches, &key).await?;
            staged.push(key);
        }

        info!(tables = staged.len(), dir = %staging.storage().root().display(), "Staging tables written");
        Ok(staged)
    }
}

/// Fails on absent required columns and adds absent optional ones as nulls.
fn with_expected_columns(spec: &SourceSpec, batch: RecordBatch) -> Result<RecordBatch> {
    let schema = batch.schema();
    let missing: Vec<&str> = spec
        .required_columns
        .iter()
        .copied()
        .filter(|c| schema.column_with_name(c).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(Error::SchemaMismatch(format!(
            "{} is missing required columns: {}",
            spec.name,
            missing.join(", ")
        )));
    }

    let absent: Vec<&str> = spec
        .optional_columns
        .iter()
        .copied()
        .filter(|c| schema.column_with_name(c).is_none())
        .collect();
    if absent.is_empty() {
        return Ok(batch);
    }

    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    for column in absent {
        fields.push(Field::new(column, DataType::Utf8, true));
        columns.push(new_null_array(&DataType::Utf8, batch.num_rows()));
    }
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::get_source;
    use arrow::array::{Array, StringArray};

    #[test]
    fn test_optional_columns_are_null_filled() {
        let spec = get_source(crate::schema::FACILITY).unwrap();
        let mut pairs: Vec<(&str, ArrayRef)> = spec
            .required_columns
            .iter()
            .map(|c| (*c, Arc::new(StringArray::from(vec!["1"])) as ArrayRef))
            .collect();
        pairs.push(("no_fantasia", Arc::new(StringArray::from(vec!["UBS"])) as ArrayRef));
        let batch = RecordBatch::try_from_iter(pairs).unwrap();

        let batch = with_expected_columns(spec, batch).unwrap();
        let razao = batch.column_by_name("no_razao_social").unwrap();
        assert_eq!(razao.null_count(), 1);
        assert!(batch.column_by_name("tp_gestao").is_some());
    }

    #[test]
    fn test_missing_required_column_is_schema_mismatch() {
        let spec = get_source(crate::schema::MORTALITY).unwrap();
        let batch = RecordBatch::try_from_iter(vec![(
            "codestab",
            Arc::new(StringArray::from(vec!["123"])) as ArrayRef,
        )])
        .unwrap();

        let err = with_expected_columns(spec, batch).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(m) if m.contains("codmunocor")));
    }
}
