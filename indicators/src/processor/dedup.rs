use super::geo::Reconciled;
use super::table::TableRegistry;
use crate::models::{SourceTable, ORDINAL, SNAPSHOT_PERIOD};
use crate::schema::{DedupPolicy, SourceSpec};
use crate::utils::sql::{quote_ident, scalar_count};
use arrow::compute::concat_batches;
use chrono::{Datelike, NaiveDate, Utc};
use common::{Error, Result};
use datafusion::prelude::SessionContext;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const RANK: &str = "_rank";

#[derive(Debug, Clone)]
pub struct DedupMetrics {
    pub table: String,
    pub input_rows: usize,
    pub kept_rows: usize,
    pub removed_rows: usize,
    pub processing_time_ms: i64,
}

/// Collapses monthly snapshots to one logical record per entity.
pub struct SnapshotDeduplicator {
    ctx: Arc<SessionContext>,
    registry: Arc<dyn TableRegistry>,
    year: i32,
}

impl SnapshotDeduplicator {
    pub fn new(ctx: Arc<SessionContext>, registry: Arc<dyn TableRegistry>, year: i32) -> Self {
        Self { ctx, registry, year }
    }

    pub async fn deduplicate(
        &self,
        spec: &SourceSpec,
        table: Reconciled<SourceTable>,
    ) -> Result<(Reconciled<SourceTable>, Option<DedupMetrics>)> {
        if let DedupPolicy::HistoryInsensitive { full_year: true, .. } = spec.dedup {
            self.check_full_year(&table)?;
        }

        let sql = match spec.dedup {
            DedupPolicy::Keep => return Ok((table, None)),
            DedupPolicy::HistoryInsensitive { primary_key, .. } => {
                ranked_sql(&[primary_key.to_string()], &[SNAPSHOT_PERIOD, ORDINAL])
            }
            DedupPolicy::HistorySensitive => ranked_sql(&natural_key(&table), &[ORDINAL]),
            DedupPolicy::Facility => facility_sql(),
        };

        let start_time = Utc::now();
        let staging_name = format!("dedup_{}_{}", table.name, Uuid::new_v4().simple());
        self.registry
            .register_batches(&self.ctx, &staging_name, table.schema(), vec![table.batch.clone()])
            .await?;

        let result = self.run(&sql.replace("{source}", &quote_ident(&staging_name))).await;
        let december = match (&result, spec.dedup) {
            (Ok(_), DedupPolicy::HistoryInsensitive { .. }) => {
                Some(self.december_rows(&staging_name).await?)
            }
            _ => None,
        };
        self.registry.deregister_table(&self.ctx, &staging_name).await?;
        let batch = result?;

        let metrics = DedupMetrics {
            table: table.name.clone(),
            input_rows: table.num_rows(),
            kept_rows: batch.num_rows(),
            removed_rows: table.num_rows().saturating_sub(batch.num_rows()),
            processing_time_ms: (Utc::now() - start_time).num_milliseconds(),
        };
        log_metrics(&metrics);

        if let Some(december_rows) = december {
            if december_rows == batch.num_rows() as i64 {
                info!(table = %table.name, rows = december_rows, "No relevant changes during the year");
            } else {
                info!(
                    table = %table.name,
                    unique_rows = batch.num_rows(),
                    december_rows,
                    "Unique rows differ from the December snapshot"
                );
            }
        }

        let deduplicated = table.map(|source| SourceTable { batch, ..source });
        Ok((deduplicated, Some(metrics)))
    }

    fn check_full_year(&self, table: &SourceTable) -> Result<()> {
        let missing: Vec<String> = (1..=12)
            .filter_map(|month| NaiveDate::from_ymd_opt(self.year, month, 1))
            .filter(|period| !table.periods.contains(period))
            .map(|period| period.format("%Y-%m").to_string())
            .collect();

        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::IncompleteSnapshots {
            table: table.name.clone(),
            missing: missing.join(", "),
        })
    }

    async fn december_rows(&self, staging_name: &str) -> Result<i64> {
        let december = NaiveDate::from_ymd_opt(self.year, 12, 1)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = DATE '{}'",
            quote_ident(staging_name),
            quote_ident(SNAPSHOT_PERIOD),
            december
        );
        scalar_count(&self.ctx, &sql).await
    }

    async fn run(&self, sql: &str) -> Result<arrow::record_batch::RecordBatch> {
        let df = self.ctx.sql(sql).await?.drop_columns(&[ORDINAL, RANK])?;
        let planned = Arc::new(df.schema().as_arrow().clone());
        let batches = df.collect().await?;
        let schema = batches.first().map(|b| b.schema()).unwrap_or(planned);
        Ok(concat_batches(&schema, &batches)?)
    }
}

fn log_metrics(metrics: &DedupMetrics) {
    info!(
        table = %metrics.table,
        input_rows = metrics.input_rows,
        kept_rows = metrics.kept_rows,
        removed_rows = metrics.removed_rows,
        processing_time_ms = metrics.processing_time_ms,
        "Deduplicated source table"
    );
}

/// Every column except the snapshot period and the ordinal.
fn natural_key(table: &SourceTable) -> Vec<String> {
    table
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .filter(|name| name != SNAPSHOT_PERIOD && name != ORDINAL)
        .collect()
}

/// Keeps the first row of each partition ordered by `order` descending.
/// `{source}` is replaced with the staging table.
fn ranked_sql(partition: &[String], order: &[&str]) -> String {
    let partition = partition
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let order = order
        .iter()
        .map(|c| format!("{} DESC", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "SELECT * FROM (\
            SELECT *, ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {order}) AS {rank} \
            FROM {{source}}\
        ) ranked_rows WHERE {rank} = 1 ORDER BY {ordinal}",
        partition = partition,
        order = order,
        rank = RANK,
        ordinal = quote_ident(ORDINAL),
    )
}

/// Latest snapshot per facility, with the observed period range and an
/// `active` flag derived from the deactivation code.
fn facility_sql() -> String {
    format!(
        "WITH observed AS (\
            SELECT co_cnes AS observed_cnes, \
                MIN({period}) AS first_observed, \
                MAX({period}) AS last_observed \
            FROM {{source}} GROUP BY co_cnes\
        ), ranked AS (\
            SELECT r.*, o.first_observed, o.last_observed, \
                ROW_NUMBER() OVER (PARTITION BY r.co_cnes ORDER BY r.{period} DESC, r.{ordinal} DESC) AS {rank} \
            FROM {{source}} r JOIN observed o ON r.co_cnes = o.observed_cnes\
        ) \
        SELECT *, TRIM(COALESCE(co_motivo_desab, '')) = '' AS active \
        FROM ranked WHERE {rank} = 1 ORDER BY co_cnes",
        period = quote_ident(SNAPSHOT_PERIOD),
        ordinal = quote_ident(ORDINAL),
        rank = RANK,
    )
}
