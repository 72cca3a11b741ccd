use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of the `_SUCCESS` marker written next to a materialized artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub table: String,
    pub artifact: String,
    pub created_at: DateTime<Utc>,
    pub year: i32,
    pub row_count: usize,
    pub columns: Vec<String>,
    /// Hex SHA-256 of the artifact bytes.
    pub content_hash: String,
}
