use tokio_postgres::{types::Type as PgType, Error as PgError, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::database::postgres::merge::{format_table_name, quote_identifier};

const STAGING_PREFIX: &str = "temp_";

// Keeps prefix + base + "_" + 32 hex chars within the 63 byte identifier limit.
const MAX_BASE_LEN: usize = 25;

/// A session-private copy of the target table's structure, dropped on commit and
/// undone on rollback.
#[derive(Debug, Clone)]
pub struct StagingTable {
    pub name: String,
    /// Server column types in column-set order, used to encode the COPY stream.
    pub column_types: Vec<PgType>,
}

/// `temp_<table>_<uuid>`, reduced to lowercase alphanumerics and underscores so the
/// name never needs escaping and can not collide across sessions.
pub fn generate_staging_table_name(table: &str) -> String {
    let base: String = table
        .rsplit('.')
        .next()
        .unwrap_or(table)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_BASE_LEN)
        .collect();

    format!("{}{}_{}", STAGING_PREFIX, base, Uuid::new_v4().simple())
}

pub fn create_staging_table_sql(staging_name: &str, target_table: &str) -> String {
    format!(
        "CREATE TEMPORARY TABLE {} ON COMMIT DROP AS TABLE {} WITH NO DATA",
        quote_identifier(staging_name),
        format_table_name(target_table)
    )
}

/// Clones the target's structure (no rows) and resolves the server type of each
/// column in `columns`. Fails if the target, or any column of the set, does not exist.
pub async fn create_staging_table(
    transaction: &Transaction<'_>,
    target_table: &str,
    columns: &[String],
) -> Result<StagingTable, PgError> {
    let name = generate_staging_table_name(target_table);
    let sql = create_staging_table_sql(&name, target_table);
    debug!("Creating staging table: {}", sql);
    transaction.batch_execute(&sql).await?;

    let select = format!(
        "SELECT {} FROM {}",
        columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", "),
        quote_identifier(&name)
    );
    let statement = transaction.prepare(&select).await?;
    let column_types = statement.columns().iter().map(|c| c.type_().clone()).collect();

    Ok(StagingTable { name, column_types })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_name_is_sanitized_and_unique() {
        let first = generate_staging_table_name("public.\"Order-Lines\"");
        let second = generate_staging_table_name("public.\"Order-Lines\"");

        assert!(first.starts_with("temp_orderlines_"));
        assert_ne!(first, second);
        assert!(first.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_staging_name_fits_identifier_limit() {
        let name = generate_staging_table_name(&"a".repeat(200));
        assert!(name.len() <= 63, "{} is {} bytes", name, name.len());
    }

    #[test]
    fn test_create_staging_sql() {
        assert_eq!(
            create_staging_table_sql("temp_prices_abc", "market.prices"),
            "CREATE TEMPORARY TABLE \"temp_prices_abc\" ON COMMIT DROP AS TABLE \"market\".\"prices\" WITH NO DATA"
        );
    }
}
