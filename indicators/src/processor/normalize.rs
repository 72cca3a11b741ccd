use crate::models::{ORDINAL, SNAPSHOT_PERIOD};
use crate::schema::is_identifier_column;
use arrow::array::{Array, ArrayRef, AsArray, Date32Array, Float64Array, StringArray, UInt64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use common::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

// Brazilian formatted numbers: optional thousands dots, decimal comma.
static DECIMAL_COMMA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-?(\d+|\d{1,3}(\.\d{3})+)(,\d+)?$").expect("Invalid decimal regex")
});

pub fn normalize_column_name(name: &str) -> String {
    WHITESPACE
        .replace_all(name.trim(), "_")
        .to_lowercase()
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

/// Renders identifier values as trimmed text; integral floats lose `.0`.
fn identifier_text(column: &ArrayRef) -> Result<ArrayRef> {
    let text: StringArray = match column.data_type() {
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            let floats = cast(column, &DataType::Float64)?;
            floats
                .as_primitive::<Float64Type>()
                .iter()
                .map(|value| {
                    value.map(|f| {
                        if f.fract() == 0.0 && f.abs() < 1e15 {
                            format!("{}", f as i64)
                        } else {
                            f.to_string()
                        }
                    })
                })
                .collect()
        }
        _ => {
            let utf8 = cast(column, &DataType::Utf8)?;
            utf8.as_string::<i32>()
                .iter()
                .map(|value| value.map(str::trim).filter(|s| !s.is_empty()))
                .collect()
        }
    };
    Ok(Arc::new(text))
}

/// Parses a text column written with decimal commas or thousands dots.
/// Returns `None` unless every non-empty value is such a number and at least
/// one carries a comma or a thousands dot.
fn decimal_comma_column(column: &ArrayRef) -> Option<ArrayRef> {
    let text = column.as_string_opt::<i32>()?;
    let mut saw_separator = false;

    for value in text.iter().flatten() {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if !DECIMAL_COMMA.is_match(value) {
            return None;
        }
        saw_separator |= value.contains(',') || value.contains('.');
    }
    if !saw_separator {
        return None;
    }

    let parsed: Float64Array = text
        .iter()
        .map(|value| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .and_then(|v| v.replace('.', "").replace(',', ".").parse::<f64>().ok())
        })
        .collect();
    Some(Arc::new(parsed))
}

/// Applies column naming and typing rules to one file's batch.
#[derive(Debug, Default, Clone)]
pub struct SchemaNormalizer;

impl SchemaNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// `period` adds a `snapshot_period` column; `ordinal_start` numbers the
    /// rows in file-encounter order.
    pub fn normalize(
        &self,
        batch: &RecordBatch,
        period: Option<NaiveDate>,
        ordinal_start: u64,
    ) -> Result<RecordBatch> {
        let schema = batch.schema();
        let mut fields = Vec::with_capacity(schema.fields().len() + 2);
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len() + 2);

        for (field, column) in schema.fields().iter().zip(batch.columns()) {
            let name = normalize_column_name(field.name());
            if name == ORDINAL || name == SNAPSHOT_PERIOD {
                continue;
            }

            let column = if is_identifier_column(&name) {
                identifier_text(column)?
            } else if column.data_type() == &DataType::Null {
                cast(column, &DataType::Utf8)?
            } else if let Some(parsed) = decimal_comma_column(column) {
                parsed
            } else {
                column.clone()
            };

            fields.push(Field::new(&name, column.data_type().clone(), true));
            columns.push(column);
        }

        let rows = batch.num_rows();
        if let Some(period) = period {
            let days = days_since_epoch(period);
            fields.push(Field::new(SNAPSHOT_PERIOD, DataType::Date32, false));
            columns.push(Arc::new(Date32Array::from(vec![days; rows])));
        }

        let ordinals = UInt64Array::from_iter_values(ordinal_start..ordinal_start + rows as u64);
        fields.push(Field::new(ORDINAL, DataType::UInt64, false));
        columns.push(Arc::new(ordinals));

        let normalized = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;

    #[test]
    fn test_normalize_column_name() {
        assert_eq!(normalize_column_name("CO_CNES"), "co_cnes");
        assert_eq!(normalize_column_name(" Pct  60 Mais "), "pct_60_mais");
    }

    #[test]
    fn test_normalize_adds_period_and_ordinal() {
        let batch = RecordBatch::try_from_iter(vec![
            ("CO_CNES", Arc::new(Int64Array::from(vec![123, 456])) as ArrayRef),
            ("NO_FANTASIA", Arc::new(StringArray::from(vec!["A", "B"])) as ArrayRef),
        ])
        .unwrap();

        let normalized = SchemaNormalizer::new()
            .normalize(&batch, NaiveDate::from_ymd_opt(2022, 12, 1), 10)
            .unwrap();

        let schema = normalized.schema();
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["co_cnes", "no_fantasia", SNAPSHOT_PERIOD, ORDINAL]);
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);

        let periods = normalized.column(2).as_primitive::<arrow::datatypes::Date32Type>();
        assert_eq!(
            periods.value_as_date(0),
            NaiveDate::from_ymd_opt(2022, 12, 1)
        );
        let ordinals = normalized.column(3).as_primitive::<arrow::datatypes::UInt64Type>();
        assert_eq!(ordinals.values().to_vec(), vec![10, 11]);
    }

    #[test]
    fn test_integral_float_identifiers_drop_fraction() {
        let column: ArrayRef = Arc::new(Float64Array::from(vec![Some(355030.0), None, Some(1.5)]));
        let text = identifier_text(&column).unwrap();
        let text = text.as_string::<i32>();
        assert_eq!(text.value(0), "355030");
        assert!(text.is_null(1));
        assert_eq!(text.value(2), "1.5");
    }

    #[test]
    fn test_decimal_comma_columns_become_numeric() {
        let column: ArrayRef = Arc::new(StringArray::from(vec![Some("97,5"), Some("1.234,25"), None]));
        let parsed = decimal_comma_column(&column).unwrap();
        let parsed = parsed.as_primitive::<Float64Type>();
        assert_eq!(parsed.value(0), 97.5);
        assert_eq!(parsed.value(1), 1234.25);
        assert!(parsed.is_null(2));

        let names: ArrayRef = Arc::new(StringArray::from(vec!["São Paulo"]));
        assert!(decimal_comma_column(&names).is_none());
        let codes: ArrayRef = Arc::new(StringArray::from(vec!["355030", "530010"]));
        assert!(decimal_comma_column(&codes).is_none());
    }

    #[test]
    fn test_thousands_dots_without_comma_become_numeric() {
        let column: ArrayRef = Arc::new(StringArray::from(vec!["1.234.567", "12.345", "800"]));
        let parsed = decimal_comma_column(&column).unwrap();
        let parsed = parsed.as_primitive::<Float64Type>();
        assert_eq!(parsed.value(0), 1_234_567.0);
        assert_eq!(parsed.value(1), 12_345.0);
        assert_eq!(parsed.value(2), 800.0);
    }
}
