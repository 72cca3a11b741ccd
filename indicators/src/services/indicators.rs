use crate::processor::features::ID_COLUMNS;
use crate::processor::geo::MunicipalityCode;
use crate::processor::table::{SessionTableRegistry, TableRegistry};
use crate::processor::INDICATOR_TABLE;
use crate::utils::arrow::batches_to_json;
use crate::utils::paths::ArtifactPaths;
use crate::utils::sql::{quote_ident, quote_literal};
use arrow::datatypes::SchemaRef;
use common::config::Settings;
use common::{Error, Result};
use datafusion::prelude::SessionContext;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

static STATE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}$").expect("Invalid state regex"));

static MUNICIPALITY_CODE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{6,7}$").expect("Invalid municipality code regex"));

/// Read-only queries over the materialized indicator table.
pub struct IndicatorService {
    ctx: Arc<SessionContext>,
    schema: SchemaRef,
}

impl IndicatorService {
    pub async fn new(settings: &Settings) -> Result<Self> {
        let artifact = ArtifactPaths::new(&settings.dirs.output).indicator_table();
        Self::from_artifact(&artifact).await
    }

    pub async fn from_artifact(artifact: &Path) -> Result<Self> {
        let ctx = Arc::new(SessionContext::new());
        SessionTableRegistry
            .register_parquet(&ctx, INDICATOR_TABLE, artifact)
            .await?;
        let schema = Arc::new(ctx.table(INDICATOR_TABLE).await?.schema().as_arrow().clone());
        info!(artifact = %artifact.display(), columns = schema.fields().len(), "Indicator table loaded");
        Ok(Self { ctx, schema })
    }

    /// Numeric columns of the artifact, in table order.
    pub fn list_indicators(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .filter(|f| f.data_type().is_numeric() && !ID_COLUMNS.contains(&f.name().as_str()))
            .map(|f| f.name().clone())
            .collect()
    }

    fn validate_indicator(&self, name: &str) -> Result<()> {
        if self.list_indicators().iter().any(|c| c == name) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("indicator '{}'", name)))
        }
    }

    fn state_filter(state: Option<&str>) -> Result<String> {
        match state {
            None => Ok(String::new()),
            Some(state) if STATE_REGEX.is_match(state) => {
                Ok(format!(" WHERE state = {}", quote_literal(state)))
            }
            Some(state) => Err(Error::InvalidInput(format!(
                "state must be a two-letter code, got '{}'",
                state
            ))),
        }
    }

    async fn query(&self, sql: &str) -> Result<Vec<Value>> {
        let batches = self.ctx.sql(sql).await?.collect().await?;
        batches_to_json(&batches)
    }

    pub async fn indicator_values(&self, name: &str, state: Option<&str>) -> Result<Vec<Value>> {
        self.validate_indicator(name)?;
        let sql = format!(
            "SELECT municipality_code, state, municipality_name, {} AS value FROM {}{} \
             ORDER BY municipality_code",
            quote_ident(name),
            INDICATOR_TABLE,
            Self::state_filter(state)?
        );
        self.query(&sql).await
    }

    pub async fn indicator_summary(&self, name: &str, state: Option<&str>) -> Result<Value> {
        self.validate_indicator(name)?;
        let column = format!("CAST({} AS DOUBLE)", quote_ident(name));
        let sql = format!(
            "SELECT COUNT({c}) AS count, MIN({c}) AS min, MAX({c}) AS max, AVG({c}) AS avg FROM {t}{w}",
            c = column,
            t = INDICATOR_TABLE,
            w = Self::state_filter(state)?
        );

        let mut rows = self.query(&sql).await?;
        let mut summary = rows.pop().unwrap_or(Value::Null);
        if let Value::Object(map) = &mut summary {
            map.insert("indicator".to_string(), Value::String(name.to_string()));
        }
        Ok(summary)
    }

    /// One full row. Enclave codes resolve to the municipality they fold into.
    pub async fn municipality(&self, code: &str) -> Result<Value> {
        if !MUNICIPALITY_CODE_REGEX.is_match(code) {
            return Err(Error::InvalidInput(format!(
                "municipality code must have 6 or 7 digits, got '{}'",
                code
            )));
        }
        let code = MunicipalityCode::new(&code[..6]).reconcile();
        let sql = format!(
            "SELECT * FROM {} WHERE municipality_code = {}",
            INDICATOR_TABLE,
            quote_literal(code.as_str())
        );

        self.query(&sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("municipality '{}'", code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::encode_parquet;
    use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;

    async fn service(dir: &Path) -> IndicatorService {
        let batch = RecordBatch::try_from_iter(vec![
            (
                "state",
                Arc::new(StringArray::from(vec!["SP", "SP", "DF"])) as ArrayRef,
            ),
            (
                "municipality_code",
                Arc::new(StringArray::from(vec!["350010", "355030", "530010"])) as ArrayRef,
            ),
            (
                "municipality_name",
                Arc::new(StringArray::from(vec!["Adamantina", "São Paulo", "Brasília"])) as ArrayRef,
            ),
            (
                "facility_count",
                Arc::new(Int64Array::from(vec![10, 30, 20])) as ArrayRef,
            ),
            (
                "physician_density_per_k",
                Arc::new(Float64Array::from(vec![Some(1.0), Some(3.0), None])) as ArrayRef,
            ),
        ])
        .unwrap();
        let path = dir.join("indicator_table.parquet");
        std::fs::write(&path, encode_parquet(&batch).unwrap()).unwrap();
        IndicatorService::from_artifact(&path).await.unwrap()
    }

    #[tokio::test]
    async fn test_list_indicators_skips_text_columns() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        assert_eq!(
            service.list_indicators(),
            vec!["facility_count", "physician_density_per_k"]
        );
    }

    #[tokio::test]
    async fn test_values_filtered_by_state() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let rows = service.indicator_values("facility_count", Some("SP")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["municipality_code"], "355030");
        assert_eq!(rows[1]["value"], 30);

        let err = service.indicator_values("facility_count", Some("sp")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = service.indicator_values("state", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_summary_ignores_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let summary = service.indicator_summary("physician_density_per_k", None).await.unwrap();
        assert_eq!(summary["count"], 2);
        assert_eq!(summary["min"], 1.0);
        assert_eq!(summary["max"], 3.0);
        assert_eq!(summary["avg"], 2.0);
        assert_eq!(summary["indicator"], "physician_density_per_k");
    }

    #[tokio::test]
    async fn test_municipality_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let row = service.municipality("3550308").await.unwrap();
        assert_eq!(row["municipality_name"], "São Paulo");

        let row = service.municipality("530040").await.unwrap();
        assert_eq!(row["municipality_code"], "530010");

        let err = service.municipality("999999").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = service.municipality("35A").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
