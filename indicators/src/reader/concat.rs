use arrow::array::{new_null_array, ArrayRef};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use common::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Unified schema of several files: columns in order of first appearance,
/// disagreeing types widened to text.
pub fn unified_schema(batches: &[RecordBatch]) -> SchemaRef {
    let mut order: Vec<String> = Vec::new();
    let mut types: HashMap<String, DataType> = HashMap::new();

    for batch in batches {
        for field in batch.schema().fields() {
            let name = field.name();
            match types.get(name) {
                None => {
                    order.push(name.clone());
                    types.insert(name.clone(), field.data_type().clone());
                }
                Some(existing) if existing == field.data_type() => {}
                Some(DataType::Null) => {
                    types.insert(name.clone(), field.data_type().clone());
                }
                Some(_) if field.data_type() == &DataType::Null => {}
                Some(_) => {
                    types.insert(name.clone(), DataType::Utf8);
                }
            }
        }
    }

    let fields: Vec<Field> = order
        .iter()
        .map(|name| {
            let data_type = types.get(name).cloned().unwrap_or(DataType::Utf8);
            Field::new(name, data_type, true)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

/// Concatenates batches after aligning their columns by name.
pub fn concat_aligned(batches: &[RecordBatch]) -> Result<RecordBatch> {
    let schema = unified_schema(batches);
    let mut aligned = Vec::with_capacity(batches.len());

    for batch in batches {
        let columns = schema
            .fields()
            .iter()
            .map(|field| match batch.column_by_name(field.name()) {
                Some(column) if column.data_type() == field.data_type() => Ok(column.clone()),
                Some(column) => Ok(cast(column, field.data_type())?),
                None => Ok(new_null_array(field.data_type(), batch.num_rows())),
            })
            .collect::<Result<Vec<ArrayRef>>>()?;
        aligned.push(RecordBatch::try_new(schema.clone(), columns)?);
    }

    Ok(concat_batches(&schema, &aligned)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};

    fn batch(fields: Vec<(&str, ArrayRef)>) -> RecordBatch {
        RecordBatch::try_from_iter(fields).unwrap()
    }

    #[test]
    fn test_missing_columns_are_null_filled() {
        let a = batch(vec![
            ("codestab", Arc::new(StringArray::from(vec!["123"])) as ArrayRef),
            ("codmunocor", Arc::new(StringArray::from(vec!["355030"])) as ArrayRef),
        ]);
        let b = batch(vec![(
            "codmunocor",
            Arc::new(StringArray::from(vec!["355030"])) as ArrayRef,
        )]);

        let merged = concat_aligned(&[a, b]).unwrap();
        assert_eq!(merged.num_rows(), 2);
        assert_eq!(merged.schema().field(0).name(), "codestab");
        assert!(merged.column(0).is_null(1));
    }

    #[test]
    fn test_conflicting_types_become_text() {
        let a = batch(vec![("idade", Arc::new(Int64Array::from(vec![40])) as ArrayRef)]);
        let b = batch(vec![(
            "idade",
            Arc::new(StringArray::from(vec!["4a"])) as ArrayRef,
        )]);

        let merged = concat_aligned(&[a, b]).unwrap();
        let values = merged
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(values.value(0), "40");
        assert_eq!(values.value(1), "4a");
    }
}
