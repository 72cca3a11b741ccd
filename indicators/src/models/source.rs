use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use std::collections::BTreeSet;

pub const SNAPSHOT_PERIOD: &str = "snapshot_period";
pub const ORDINAL: &str = "_ordinal";

/// A logical source after reading and normalization: every file concatenated
/// into one batch.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub name: String,
    pub batch: RecordBatch,
    /// Snapshot months the files covered; empty for non-snapshot sources.
    pub periods: BTreeSet<NaiveDate>,
}

impl SourceTable {
    pub fn new(name: &str, batch: RecordBatch, periods: BTreeSet<NaiveDate>) -> Self {
        Self {
            name: name.to_string(),
            batch,
            periods,
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.batch.schema().column_with_name(name).is_some()
    }
}
