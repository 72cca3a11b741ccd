use crate::models::SourceTable;
use arrow::array::{ArrayRef, AsArray, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use common::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// Brasília; every Federal District administrative region folds into it.
pub const CANONICAL_CODE: &str = "530010";

static ENCLAVE_CODES: Lazy<HashSet<String>> =
    Lazy::new(|| (530020..=530180).step_by(10).map(|c: u32| c.to_string()).collect());

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MunicipalityCode(String);

impl MunicipalityCode {
    pub fn new(code: &str) -> Self {
        Self(code.trim().to_string())
    }

    pub fn is_enclave(&self) -> bool {
        ENCLAVE_CODES.contains(&self.0)
    }

    pub fn reconcile(self) -> Self {
        if self.is_enclave() {
            Self(CANONICAL_CODE.to_string())
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MunicipalityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value whose geographic code columns have been reconciled. Only
/// [`GeoReconciler`] can construct one.
#[derive(Debug, Clone)]
pub struct Reconciled<T>(T);

impl<T> Reconciled<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reconciled<U> {
        Reconciled(f(self.0))
    }
}

impl<T> Deref for Reconciled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

#[derive(Debug, Default, Clone)]
pub struct GeoReconciler;

impl GeoReconciler {
    pub fn new() -> Self {
        Self
    }

    pub fn reconcile_array(&self, array: &ArrayRef) -> Result<ArrayRef> {
        rewrite_codes(array, None)
    }

    pub fn reconcile_batch(&self, batch: &RecordBatch, columns: &[&str]) -> Result<RecordBatch> {
        rewrite_batch(batch, columns, None)
    }

    /// Cuts `columns` to their first `width` characters before reconciling,
    /// so 7-digit codes with a check digit fold like their 6-digit form.
    pub fn reconcile_truncated(
        &self,
        batch: &RecordBatch,
        columns: &[&str],
        width: usize,
    ) -> Result<RecordBatch> {
        rewrite_batch(batch, columns, Some(width))
    }

    /// Rewrites `columns` of `table`; an empty list still marks the table reconciled.
    pub fn reconcile(&self, table: SourceTable, columns: &[&str]) -> Result<Reconciled<SourceTable>> {
        if columns.is_empty() {
            return Ok(Reconciled(table));
        }
        let batch = self.reconcile_batch(&table.batch, columns)?;
        debug!(table = %table.name, ?columns, "Reconciled geographic codes");
        Ok(Reconciled(SourceTable { batch, ..table }))
    }
}

fn rewrite_codes(array: &ArrayRef, width: Option<usize>) -> Result<ArrayRef> {
    let text = cast(array, &DataType::Utf8)?;
    let reconciled: StringArray = text
        .as_string::<i32>()
        .iter()
        .map(|value| {
            value.map(|code| {
                let code = match width {
                    Some(width) => code.trim().chars().take(width).collect::<String>(),
                    None => code.to_string(),
                };
                MunicipalityCode::new(&code).reconcile().0
            })
        })
        .collect();
    Ok(Arc::new(reconciled))
}

fn rewrite_batch(batch: &RecordBatch, columns: &[&str], width: Option<usize>) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = Vec::with_capacity(schema.fields().len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for column in columns {
        if schema.column_with_name(column).is_none() {
            return Err(Error::SchemaMismatch(format!(
                "geographic column '{}' not present",
                column
            )));
        }
    }

    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        if columns.contains(&field.name().as_str()) {
            fields.push(Field::new(field.name(), DataType::Utf8, true));
            arrays.push(rewrite_codes(array, width)?);
        } else {
            fields.push(field.as_ref().clone());
            arrays.push(array.clone());
        }
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}
