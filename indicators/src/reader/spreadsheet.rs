use crate::schema::is_identifier_column;
use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use calamine::{open_workbook_auto, Data, Reader};
use common::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

static EMPTY: Data = Data::Empty;

/// Reads the first sheet of a workbook into a single batch.
pub fn read_first_sheet(path: &Path, skip_rows: usize) -> Result<Vec<RecordBatch>> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| Error::Spreadsheet(format!("{}: {}", path.display(), e)))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = sheet_names
        .first()
        .ok_or_else(|| Error::Spreadsheet(format!("{} has no sheets", path.display())))?;

    let range = workbook
        .worksheet_range(sheet_name)
        .map_err(|e| Error::Spreadsheet(format!("{}: {}", path.display(), e)))?;

    let mut rows = range.rows().skip(skip_rows);
    let header = rows
        .next()
        .ok_or_else(|| Error::Spreadsheet(format!("{} has no header row", path.display())))?;
    let names = header_names(header);
    let body: Vec<&[Data]> = rows.collect();

    let batch = build_batch(&names, &body)?;
    Ok(vec![batch])
}

fn header_names(header: &[Data]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();

    header
        .iter()
        .enumerate()
        .map(|(idx, cell)| {
            let name = match cell {
                Data::Empty => format!("col_{}", idx),
                Data::String(s) if s.trim().is_empty() => format!("col_{}", idx),
                Data::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                format!("{}_{}", name, count)
            } else {
                name
            }
        })
        .collect()
}

fn cell_number(cell: &Data) -> Option<f64> {
    match cell {
        Data::Int(i) => Some(*i as f64),
        Data::Float(f) => Some(*f),
        _ => None,
    }
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Text rendering of a cell; integral numbers lose their fractional part.
fn cell_text(cell: &Data) -> Option<String> {
    if is_blank(cell) {
        return None;
    }
    Some(match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    })
}

fn build_batch(names: &[String], rows: &[&[Data]]) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(names.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(names.len());

    for (idx, name) in names.iter().enumerate() {
        let cells: Vec<&Data> = rows
            .iter()
            .map(|row| row.get(idx).unwrap_or(&EMPTY))
            .collect();

        let numeric = !is_identifier_column(name)
            && cells
                .iter()
                .all(|cell| is_blank(cell) || cell_number(cell).is_some());

        if numeric {
            let values: Float64Array = cells.iter().map(|cell| cell_number(cell)).collect();
            fields.push(Field::new(name, DataType::Float64, true));
            columns.push(Arc::new(values));
        } else {
            let values: StringArray = cells.iter().map(|cell| cell_text(cell)).collect();
            fields.push(Field::new(name, DataType::Utf8, true));
            columns.push(Arc::new(values));
        }
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;

    #[test]
    fn test_header_names_are_unique_and_filled() {
        let header = vec![
            Data::String("codigo".into()),
            Data::Empty,
            Data::String("total".into()),
            Data::String("total".into()),
        ];
        assert_eq!(
            header_names(&header),
            vec!["codigo", "col_1", "total", "total_2"]
        );
    }

    #[test]
    fn test_build_batch_types_columns() {
        let names = vec!["codigo".to_string(), "total".to_string(), "nome".to_string()];
        let row1 = vec![Data::Float(3550308.0), Data::Float(97.5), Data::String("São Paulo".into())];
        let row2 = vec![Data::Int(5300108), Data::Empty, Data::String("Brasília".into())];
        let rows: Vec<&[Data]> = vec![row1.as_slice(), row2.as_slice()];

        let batch = build_batch(&names, &rows).unwrap();
        let schema = batch.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(1).data_type(), &DataType::Float64);
        assert_eq!(schema.field(2).data_type(), &DataType::Utf8);

        let codes = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(codes.value(0), "3550308");
        assert_eq!(codes.value(1), "5300108");
        assert!(batch.column(1).is_null(1));
    }

    #[test]
    fn test_missing_workbook_is_spreadsheet_error() {
        let err = read_first_sheet(Path::new("/nonexistent/cidades.xlsx"), 0).unwrap_err();
        assert!(matches!(err, Error::Spreadsheet(_)));
    }
}
