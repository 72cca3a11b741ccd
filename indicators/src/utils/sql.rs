use arrow::array::{Array, Int64Array};
use common::{Error, Result};
use datafusion::prelude::SessionContext;

/// Quotes an identifier so mixed-case or digit-leading names survive the SQL parser.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `alias."column"`
pub fn qualified(alias: &str, column: &str) -> String {
    format!("{}.{}", alias, quote_ident(column))
}

/// Runs a query returning a single BIGINT cell, e.g. `SELECT COUNT(*) ...`.
pub async fn scalar_count(ctx: &SessionContext, sql: &str) -> Result<i64> {
    let batches = ctx.sql(sql).await?.collect().await?;
    let batch = batches
        .iter()
        .find(|b| b.num_rows() > 0)
        .ok_or_else(|| Error::Other(format!("Query returned no rows: {}", sql)))?;
    let column = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| Error::Other("Expected a BIGINT count column".to_string()))?;

    if column.is_null(0) {
        return Ok(0);
    }
    Ok(column.value(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("11_14"), "\"11_14\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_quote_literal_escapes_apostrophes() {
        assert_eq!(quote_literal("D'OESTE"), "'D''OESTE'");
    }

    #[tokio::test]
    async fn test_scalar_count() {
        let ctx = SessionContext::new();
        let n = scalar_count(&ctx, "SELECT COUNT(*) FROM (VALUES (1), (2), (3)) AS t")
            .await
            .unwrap();
        assert_eq!(n, 3);
    }
}
