use arrow::array::{
    Array, BooleanArray, Date32Array, Float32Array, Float64Array, Int32Array, Int64Array,
    LargeStringArray, StringArray, StringViewArray, UInt32Array, UInt64Array,
};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use common::{Error, Result};
use serde_json::{Number, Value};

pub fn batches_to_json(batches: &[RecordBatch]) -> Result<Vec<Value>> {
    let mut json_rows = Vec::new();

    for batch in batches {
        let schema = batch.schema();
        for row_idx in 0..batch.num_rows() {
            let mut row = serde_json::Map::new();

            for (col_idx, field) in schema.fields().iter().enumerate() {
                let value = arrow_array_to_json(batch.column(col_idx).as_ref(), row_idx)?;
                row.insert(field.name().clone(), value);
            }

            json_rows.push(Value::Object(row));
        }
    }

    Ok(json_rows)
}

fn downcast<'a, T: 'static>(array: &'a dyn Array) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        Error::Other(format!(
            "Failed to downcast array of type {:?}",
            array.data_type()
        ))
    })
}

fn float_to_json(value: f64) -> Value {
    // NaN and infinities have no JSON representation.
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub fn arrow_array_to_json(array: &dyn Array, index: usize) -> Result<Value> {
    if array.is_null(index) {
        return Ok(Value::Null);
    }

    Ok(match array.data_type() {
        DataType::Boolean => Value::Bool(downcast::<BooleanArray>(array)?.value(index)),
        DataType::Int32 => Value::Number(Number::from(downcast::<Int32Array>(array)?.value(index))),
        DataType::Int64 => Value::Number(Number::from(downcast::<Int64Array>(array)?.value(index))),
        DataType::UInt32 => {
            Value::Number(Number::from(downcast::<UInt32Array>(array)?.value(index)))
        }
        DataType::UInt64 => {
            Value::Number(Number::from(downcast::<UInt64Array>(array)?.value(index)))
        }
        DataType::Float32 => float_to_json(downcast::<Float32Array>(array)?.value(index) as f64),
        DataType::Float64 => float_to_json(downcast::<Float64Array>(array)?.value(index)),
        DataType::Utf8 => Value::String(downcast::<StringArray>(array)?.value(index).to_string()),
        DataType::LargeUtf8 => {
            Value::String(downcast::<LargeStringArray>(array)?.value(index).to_string())
        }
        DataType::Utf8View => {
            Value::String(downcast::<StringViewArray>(array)?.value(index).to_string())
        }
        DataType::Date32 => {
            let date = downcast::<Date32Array>(array)?.value_as_date(index);
            date.map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null)
        }
        _ => Value::String(array_value_to_string(array, index)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_batches_to_json() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("municipality_code", DataType::Utf8, false),
            Field::new("facility_count", DataType::Int64, true),
            Field::new("physician_density_per_k", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["355030", "530010"])),
                Arc::new(Int64Array::from(vec![Some(50), None])),
                Arc::new(Float64Array::from(vec![Some(0.5), Some(f64::NAN)])),
            ],
        )
        .unwrap();

        let rows = batches_to_json(&[batch]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["municipality_code"], "355030");
        assert_eq!(rows[0]["facility_count"], 50);
        assert_eq!(rows[0]["physician_density_per_k"], 0.5);
        assert_eq!(rows[1]["facility_count"], Value::Null);
        assert_eq!(rows[1]["physician_density_per_k"], Value::Null);
    }

    #[test]
    fn test_date_is_rendered_iso() {
        let array = Date32Array::from(vec![19327]);
        assert_eq!(arrow_array_to_json(&array, 0).unwrap(), "2022-12-01");
    }
}
