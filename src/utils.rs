use sqlx::{query_as, Executor, FromRow, Postgres};

use crate::errors::Result;

#[derive(FromRow)]
struct EscapedIdentifierRow {
    escaped_identifier: String,
}

/// Quotes a schema name for direct interpolation into SQL text, letting
/// Postgres itself apply its identifier rules.
pub async fn escape_identifier<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    identifier: &str,
) -> Result<String> {
    let result: EscapedIdentifierRow =
        query_as("select format('%I', $1::text) as escaped_identifier")
            .bind(identifier)
            .fetch_one(executor)
            .await?;

    Ok(result.escaped_identifier)
}
