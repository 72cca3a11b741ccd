//! Numeric feature table for the clustering consumer.

use super::geo::GeoReconciler;
use super::normalize::SchemaNormalizer;
use super::plan::{KeyTransform, MUNICIPALITY_CODE_WIDTH};
use super::table::TableRegistry;
use super::INDICATOR_TABLE;
use crate::models::ORDINAL;
use crate::reader::{concat_aligned, SourceFile, SourceFormat, SourceReader};
use crate::utils::paths::file_stem;
use crate::utils::sql::{qualified, quote_ident};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use common::{Error, Result};
use datafusion::dataframe::DataFrame;
use datafusion::prelude::SessionContext;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const HOSPITALIZATIONS: &str = "hospitalizations";
pub const HOSP_PREFIX: &str = "hosp_";

/// Text columns carried through unchanged; `municipality_code` is mandatory.
pub const ID_COLUMNS: [&str; 3] = ["municipality_code", "state", "municipality_name"];

/// Candidate key columns of the hospitalization aggregate, in preference order.
pub const HOSPITALIZATION_KEYS: [&str; 2] = ["municipality_code", "codigo_municipio"];

pub struct FeatureExporter {
    ctx: Arc<SessionContext>,
    registry: Arc<dyn TableRegistry>,
}

impl FeatureExporter {
    pub fn new(ctx: Arc<SessionContext>, registry: Arc<dyn TableRegistry>) -> Self {
        Self { ctx, registry }
    }

    /// Plans the feature table from the artifact at `artifact`, optionally
    /// joined with the hospitalization aggregate.
    pub async fn features(
        &self,
        artifact: &Path,
        hospitalizations: Option<RecordBatch>,
    ) -> Result<DataFrame> {
        self.registry
            .register_parquet(&self.ctx, INDICATOR_TABLE, artifact)
            .await?;
        let schema: SchemaRef = Arc::new(self.ctx.table(INDICATOR_TABLE).await?.schema().as_arrow().clone());
        let base = base_sql(&schema)?;

        let sql = match hospitalizations {
            None => format!("{} ORDER BY municipality_code", base),
            Some(batch) => {
                let key = hospitalization_key(&batch.schema())?;
                let batch = GeoReconciler::new().reconcile_truncated(
                    &batch,
                    &[key],
                    MUNICIPALITY_CODE_WIDTH,
                )?;
                let columns = hospitalization_columns(&batch.schema(), key);
                self.registry
                    .register_batches(&self.ctx, HOSPITALIZATIONS, batch.schema(), vec![batch])
                    .await?;
                info!(key, columns = columns.len(), "Joining hospitalization aggregate");
                joined_sql(&base, key, &columns)
            }
        };

        Ok(self.ctx.sql(&sql).await?)
    }
}

/// Reads every supported file of the hospitalization directory into one batch.
pub fn read_hospitalizations(reader: &SourceReader, dir: &Path) -> Result<RecordBatch> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
        })
        .collect();
    paths.sort();

    let normalizer = SchemaNormalizer::new();
    let mut batches = Vec::new();
    let mut ordinal = 0u64;
    for path in paths {
        let format = match SourceFormat::from_path(&path) {
            Ok(format) => format,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Skipping hospitalization file");
                continue;
            }
        };
        let file = SourceFile {
            stem: file_stem(&path)?,
            path,
            format,
            period: None,
        };
        for batch in reader.read_file(&file)? {
            let rows = batch.num_rows() as u64;
            batches.push(normalizer.normalize(&batch, None, ordinal)?);
            ordinal += rows;
        }
    }

    if batches.is_empty() {
        return Err(Error::MissingSource(format!(
            "{} (no files in {})",
            HOSPITALIZATIONS,
            dir.display()
        )));
    }
    concat_aligned(&batches)
}

fn base_sql(schema: &SchemaRef) -> Result<String> {
    if schema.column_with_name(ID_COLUMNS[0]).is_none() {
        return Err(Error::SchemaMismatch(format!(
            "{} has no {} column",
            INDICATOR_TABLE, ID_COLUMNS[0]
        )));
    }

    let mut projections: Vec<String> = ID_COLUMNS
        .iter()
        .filter(|c| schema.column_with_name(c).is_some())
        .map(|c| quote_ident(c))
        .collect();

    for field in schema.fields() {
        if ID_COLUMNS.contains(&field.name().as_str()) || !field.data_type().is_numeric() {
            continue;
        }
        let column = quote_ident(field.name());
        projections.push(format!("COALESCE(CAST({0} AS DOUBLE), 0) AS {0}", column));
    }

    Ok(format!("SELECT {} FROM {}", projections.join(", "), INDICATOR_TABLE))
}

fn hospitalization_key(schema: &SchemaRef) -> Result<&'static str> {
    HOSPITALIZATION_KEYS
        .into_iter()
        .find(|key| schema.column_with_name(key).is_some())
        .ok_or_else(|| {
            Error::SchemaMismatch(format!(
                "{} needs one of the columns {}",
                HOSPITALIZATIONS,
                HOSPITALIZATION_KEYS.join(", ")
            ))
        })
}

fn hospitalization_columns(schema: &SchemaRef, key: &str) -> Vec<String> {
    schema
        .fields()
        .iter()
        .filter(|f| f.name() != key && f.name() != ORDINAL && f.data_type().is_numeric())
        .map(|f| f.name().clone())
        .collect()
}

/// Rows sharing a key are summed before the join.
fn joined_sql(base: &str, key: &str, columns: &[String]) -> String {
    let key_expr = KeyTransform::MUNICIPALITY.apply(&quote_ident(key));

    let mut aggregates = vec![format!("{} AS join_key", key_expr)];
    let mut projections = vec!["base.*".to_string()];
    for column in columns {
        let output = format!("{}{}", HOSP_PREFIX, column);
        aggregates.push(format!(
            "SUM(CAST({} AS DOUBLE)) AS {}",
            quote_ident(column),
            quote_ident(&output)
        ));
        projections.push(format!(
            "COALESCE({}, 0) AS {}",
            qualified("h", &output),
            quote_ident(&output)
        ));
    }

    format!(
        "SELECT {projections} FROM ({base}) base \
         LEFT JOIN (SELECT {aggregates} FROM {table} WHERE {key} IS NOT NULL GROUP BY {key_expr}) h \
         ON h.join_key = base.municipality_code \
         ORDER BY base.municipality_code",
        projections = projections.join(", "),
        base = base,
        aggregates = aggregates.join(", "),
        table = HOSPITALIZATIONS,
        key = quote_ident(key),
        key_expr = key_expr,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::table::SessionTableRegistry;
    use crate::storage::encode_parquet;
    use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, StringArray};
    use arrow::datatypes::Float64Type;
    use common::config::ReaderConfig;

    fn artifact() -> RecordBatch {
        RecordBatch::try_from_iter(vec![
            (
                "state",
                Arc::new(StringArray::from(vec!["SP", "DF"])) as ArrayRef,
            ),
            (
                "municipality_code",
                Arc::new(StringArray::from(vec!["355030", "530010"])) as ArrayRef,
            ),
            (
                "municipality_name",
                Arc::new(StringArray::from(vec!["São Paulo", "Brasília"])) as ArrayRef,
            ),
            (
                "physician_count",
                Arc::new(Int64Array::from(vec![Some(10), None])) as ArrayRef,
            ),
            (
                "physician_density_per_k",
                Arc::new(Float64Array::from(vec![Some(0.1), None])) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    fn exporter() -> FeatureExporter {
        FeatureExporter::new(Arc::new(SessionContext::new()), Arc::new(SessionTableRegistry))
    }

    fn write_artifact(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("indicator_table.parquet");
        std::fs::write(&path, encode_parquet(&artifact()).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_features_fill_nulls_with_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path());

        let batches = exporter().features(&path, None).await.unwrap().collect().await.unwrap();
        let batch = &batches[0];
        let names: Vec<_> = batch.schema().fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(
            names,
            vec![
                "municipality_code",
                "state",
                "municipality_name",
                "physician_count",
                "physician_density_per_k"
            ]
        );
        let density = batch
            .column_by_name("physician_density_per_k")
            .unwrap()
            .as_primitive::<Float64Type>();
        assert_eq!(density.value(1), 0.0);
        assert_eq!(density.null_count(), 0);
    }

    #[tokio::test]
    async fn test_hospitalizations_join_on_truncated_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path());
        let hosp_dir = dir.path().join("sih");
        std::fs::create_dir(&hosp_dir).unwrap();
        std::fs::write(
            hosp_dir.join("internacoes.csv"),
            "codigo_municipio;internacoes\n3550308;12\n3550308;3\n",
        )
        .unwrap();

        let reader = SourceReader::new(ReaderConfig::default());
        let hospitalizations = read_hospitalizations(&reader, &hosp_dir).unwrap();
        let batches = exporter()
            .features(&path, Some(hospitalizations))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();

        let batch = &batches[0];
        let hosp = batch
            .column_by_name("hosp_internacoes")
            .unwrap()
            .as_primitive::<Float64Type>();
        assert_eq!(hosp.value(0), 15.0);
        assert_eq!(hosp.value(1), 0.0);
    }

    #[tokio::test]
    async fn test_hospitalization_enclave_key_folds_into_brasilia() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path());
        let hosp_dir = dir.path().join("sih");
        std::fs::create_dir(&hosp_dir).unwrap();
        std::fs::write(
            hosp_dir.join("internacoes.csv"),
            "codigo_municipio;internacoes\n5300108;2\n5300200;4\n",
        )
        .unwrap();

        let reader = SourceReader::new(ReaderConfig::default());
        let hospitalizations = read_hospitalizations(&reader, &hosp_dir).unwrap();
        let batches = exporter()
            .features(&path, Some(hospitalizations))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();

        let hosp = batches[0]
            .column_by_name("hosp_internacoes")
            .unwrap()
            .as_primitive::<Float64Type>();
        assert_eq!(hosp.value(0), 0.0);
        assert_eq!(hosp.value(1), 6.0);
    }

    #[test]
    fn test_missing_hospitalization_key() {
        let batch = RecordBatch::try_from_iter(vec![(
            "internacoes",
            Arc::new(Float64Array::from(vec![1.0])) as ArrayRef,
        )])
        .unwrap();
        let err = hospitalization_key(&batch.schema()).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }
}
