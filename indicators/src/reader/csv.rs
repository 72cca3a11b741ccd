use crate::schema::is_identifier_column;
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use common::Result;
use encoding_rs::WINDOWS_1252;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const DELIMITER: u8 = b';';
const BATCH_SIZE: usize = 8192;

/// Reads a semicolon-separated Latin-1 file.
///
/// The schema is inferred from the first `infer_rows` records. When the
/// inferred types do not hold for the rest of the file the window grows
/// tenfold, ending with a scan of every record.
pub fn read_delimited(path: &Path, infer_rows: usize) -> Result<Vec<RecordBatch>> {
    let raw = std::fs::read(path)?;
    // ISO-8859-1 is decoded as its windows-1252 superset; a UTF-8 BOM switches to UTF-8.
    let (text, _, _) = WINDOWS_1252.decode(&raw);
    let bytes = text.as_bytes();

    let total_rows = bytes.iter().filter(|b| **b == b'\n').count();
    let mut window = Some(infer_rows.max(1));

    loop {
        match read_with_window(bytes, window) {
            Ok(batches) => return Ok(batches),
            Err(err) => {
                let next = match window {
                    Some(rows) if rows < total_rows => {
                        let widened = rows.saturating_mul(10);
                        (widened < total_rows).then_some(widened)
                    }
                    _ => return Err(err),
                };
                warn!(
                    file = %path.display(),
                    window = ?window,
                    next = ?next,
                    error = %err,
                    "Schema inference window too small, widening"
                );
                window = next;
            }
        }
    }
}

fn format() -> Format {
    Format::default()
        .with_header(true)
        .with_delimiter(DELIMITER)
}

fn read_with_window(bytes: &[u8], window: Option<usize>) -> Result<Vec<RecordBatch>> {
    let (inferred, _) = format().infer_schema(Cursor::new(bytes), window)?;
    let schema = Arc::new(with_text_identifiers(&inferred));

    let reader = ReaderBuilder::new(schema)
        .with_header(true)
        .with_delimiter(DELIMITER)
        .with_batch_size(BATCH_SIZE)
        .build(Cursor::new(bytes))?;

    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(batches)
}

/// Identifier and all-empty columns are read as text.
fn with_text_identifiers(schema: &Schema) -> Schema {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|field| {
            if is_identifier_column(field.name()) || field.data_type() == &DataType::Null {
                Field::new(field.name(), DataType::Utf8, true)
            } else {
                field.as_ref().clone().with_nullable(true)
            }
        })
        .collect();
    Schema::new(fields)
}
