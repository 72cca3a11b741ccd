pub mod concat;
pub mod csv;
pub mod spreadsheet;

use crate::schema::{SourceLayout, SourceSpec};
use crate::utils::paths::{file_stem, logical_table_name, snapshot_period};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDate};
use common::config::ReaderConfig;
use common::{Error, Result};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use concat::concat_aligned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Delimited,
    Spreadsheet,
    Parquet,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "csv" | "txt" => Ok(SourceFormat::Delimited),
            "xlsx" | "xls" | "xlsm" | "ods" => Ok(SourceFormat::Spreadsheet),
            "parquet" => Ok(SourceFormat::Parquet),
            _ => Err(Error::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// One physical file of a logical source.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub stem: String,
    pub format: SourceFormat,
    /// First day of the snapshot month for snapshot sources.
    pub period: Option<NaiveDate>,
}

/// Lists the files making up `spec` inside `dir`, sorted by file name.
pub fn discover(spec: &SourceSpec, dir: &Path, year: i32) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let stem = file_stem(&path)?;
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if hidden {
            continue;
        }

        let period = match spec.layout {
            SourceLayout::Snapshots { stem: table } => {
                if logical_table_name(&stem) != table {
                    continue;
                }
                let period = snapshot_period(&stem)?;
                if period.year() != year {
                    warn!(file = %path.display(), year, "Skipping snapshot outside target year");
                    continue;
                }
                Some(period)
            }
            SourceLayout::Named { stem: table } => {
                if !stem.eq_ignore_ascii_case(table) {
                    continue;
                }
                None
            }
            SourceLayout::Directory => None,
        };

        let format = SourceFormat::from_path(&path)?;
        debug!(source = spec.name, file = %path.display(), ?format, "Discovered source file");
        files.push(SourceFile {
            path,
            stem,
            format,
            period,
        });
    }

    if files.is_empty() {
        return Err(Error::MissingSource(format!(
            "{} (no files in {})",
            spec.name,
            dir.display()
        )));
    }

    files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(files)
}

pub struct SourceReader {
    config: ReaderConfig,
}

impl SourceReader {
    pub fn new(config: ReaderConfig) -> Self {
        Self { config }
    }

    pub fn read_file(&self, file: &SourceFile) -> Result<Vec<RecordBatch>> {
        let batches = match file.format {
            SourceFormat::Delimited => csv::read_delimited(&file.path, self.config.infer_rows)?,
            SourceFormat::Spreadsheet => {
                spreadsheet::read_first_sheet(&file.path, self.config.spreadsheet_skip_rows)?
            }
            SourceFormat::Parquet => read_parquet(&file.path)?,
        };

        debug!(
            file = %file.path.display(),
            rows = batches.iter().map(|b| b.num_rows()).sum::<usize>(),
            "Read source file"
        );
        Ok(batches)
    }
}

pub fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(batches)
}
