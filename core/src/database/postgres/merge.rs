//! SQL generation and execution for the staging-to-target merge.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio_postgres::{Error as PgError, Transaction};
use tracing::debug;

use crate::database::postgres::coercion::{CoercedRow, PgValue};

/// Quotes an identifier, escaping embedded quotes.
#[inline]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Formats a table name, handling schema.table format. Already quoted parts are
/// unwrapped first so they are not quoted twice.
pub fn format_table_name(table_name: &str) -> String {
    match table_name.split_once('.') {
        Some((schema, table)) => format!(
            "{}.{}",
            quote_identifier(schema.trim_matches('"')),
            quote_identifier(table.trim_matches('"'))
        ),
        None => quote_identifier(table_name.trim_matches('"')),
    }
}

/// Builds the `col = EXCLUDED.col` assignments for every non-key column.
pub fn build_update_set_clause(columns: &[String], primary_key: &[String]) -> Vec<String> {
    columns
        .iter()
        .filter(|col| !primary_key.contains(col))
        .map(|col| {
            let column_name = quote_identifier(col);
            format!("{} = EXCLUDED.{}", column_name, column_name)
        })
        .collect()
}

/// Builds the deduplicating `INSERT ... SELECT DISTINCT ... ON CONFLICT` statement.
///
/// When every column is part of the key there is nothing to update and the
/// conflict branch becomes `DO NOTHING`.
pub fn build_merge_sql(
    target_table: &str,
    staging_table: &str,
    columns: &[String],
    primary_key: &[String],
) -> String {
    let formatted_columns =
        columns.iter().map(|col| quote_identifier(col)).collect::<Vec<_>>().join(", ");
    let conflict_columns =
        primary_key.iter().map(|col| quote_identifier(col)).collect::<Vec<_>>().join(", ");

    let mut query = format!(
        "INSERT INTO {} ({})\nSELECT DISTINCT {}\nFROM {}\nON CONFLICT ({})",
        format_table_name(target_table),
        formatted_columns,
        formatted_columns,
        quote_identifier(staging_table),
        conflict_columns
    );

    let update_clauses = build_update_set_clause(columns, primary_key);
    if update_clauses.is_empty() {
        query.push_str("\nDO NOTHING");
    } else {
        query.push_str(&format!("\nDO UPDATE SET {}", update_clauses.join(", ")));
    }

    query
}

pub async fn execute_merge(
    transaction: &Transaction<'_>,
    target_table: &str,
    staging_table: &str,
    columns: &[String],
    primary_key: &[String],
) -> Result<u64, PgError> {
    let sql = build_merge_sql(target_table, staging_table, columns, primary_key);
    debug!("Merge statement: {}", sql);
    transaction.execute(sql.as_str(), &[]).await
}

/// Hashable view of a key value. Numbers compare by value whatever their width or
/// representation, the way the server compares them: `1`, `1.0` and `-0.0 == 0.0`.
#[derive(Debug, PartialEq, Eq, Hash)]
enum KeyPart<'a> {
    Absent,
    Bool(bool),
    Number(Decimal),
    /// Floats with no decimal form (NaN, infinities, out of range).
    Float(u64),
    Text(&'a str),
    Timestamp(DateTime<Utc>),
    Bytes(&'a [u8]),
}

impl<'a> From<&'a PgValue> for KeyPart<'a> {
    fn from(value: &'a PgValue) -> Self {
        match value {
            PgValue::Absent => KeyPart::Absent,
            PgValue::Bool(b) => KeyPart::Bool(*b),
            PgValue::Int4(i) => KeyPart::Number(Decimal::from(*i)),
            PgValue::Int8(i) => KeyPart::Number(Decimal::from(*i)),
            PgValue::Float8(f) => Decimal::try_from(*f)
                .map(|d| KeyPart::Number(d.normalize()))
                .unwrap_or(KeyPart::Float(f.to_bits())),
            PgValue::Numeric(d) => KeyPart::Number(d.normalize()),
            PgValue::Text(s) => KeyPart::Text(s),
            PgValue::Timestamptz(ts) => KeyPart::Timestamp(*ts),
            PgValue::Bytea(b) => KeyPart::Bytes(b),
        }
    }
}

/// Keeps only the last row for each primary-key projection, preserving input order.
///
/// A single `ON CONFLICT DO UPDATE` statement may not touch the same target row
/// twice, so rows that share a key but differ elsewhere are settled here: the last
/// one supplied wins. Fully identical rows are also removed by `SELECT DISTINCT`.
pub fn retain_last_per_key(rows: Vec<CoercedRow>, key_indexes: &[usize]) -> Vec<CoercedRow> {
    let last_for_key: HashMap<Vec<KeyPart<'_>>, usize> = rows
        .iter()
        .enumerate()
        .map(|(position, row)| {
            (key_indexes.iter().map(|&idx| KeyPart::from(&row[idx])).collect(), position)
        })
        .collect();

    let mut keep = vec![false; rows.len()];
    for position in last_for_key.into_values() {
        keep[position] = true;
    }

    rows.into_iter().zip(keep).filter_map(|(row, keep)| keep.then_some(row)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(quote_identifier("val"), "\"val\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_format_table_name() {
        assert_eq!(format_table_name("prices"), "\"prices\"");
        assert_eq!(format_table_name("market.prices"), "\"market\".\"prices\"");
        assert_eq!(format_table_name("\"market\".\"prices\""), "\"market\".\"prices\"");
    }

    #[test]
    fn test_quoting_preserves_case() {
        assert_eq!(quote_identifier("Readings"), "\"Readings\"");
        assert_eq!(format_table_name("Market.Readings"), "\"Market\".\"Readings\"");
        assert_ne!(format_table_name("Readings"), format_table_name("readings"));
    }

    #[test]
    fn test_build_merge_sql() {
        let sql = build_merge_sql(
            "public.readings",
            "temp_readings_1",
            &strings(&["id", "time", "val"]),
            &strings(&["id", "time"]),
        );

        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"readings\" (\"id\", \"time\", \"val\")\n\
             SELECT DISTINCT \"id\", \"time\", \"val\"\n\
             FROM \"temp_readings_1\"\n\
             ON CONFLICT (\"id\", \"time\")\n\
             DO UPDATE SET \"val\" = EXCLUDED.\"val\""
        );
    }

    #[test]
    fn test_build_merge_sql_key_only_does_nothing() {
        let sql = build_merge_sql("tags", "temp_tags_1", &strings(&["id"]), &strings(&["id"]));

        assert!(sql.ends_with("ON CONFLICT (\"id\")\nDO NOTHING"));
        assert!(!sql.contains("DO UPDATE"));
    }

    #[test]
    fn test_update_set_clause_never_touches_key_columns() {
        let clauses =
            build_update_set_clause(&strings(&["a", "id", "b"]), &strings(&["id"]));
        assert_eq!(clauses, vec!["\"a\" = EXCLUDED.\"a\"", "\"b\" = EXCLUDED.\"b\""]);
    }

    #[test]
    fn test_retain_last_per_key_last_row_wins() {
        let rows = vec![
            vec![PgValue::Int4(1), PgValue::Text("a".into())],
            vec![PgValue::Int4(2), PgValue::Text("x".into())],
            vec![PgValue::Int8(1), PgValue::Text("b".into())],
        ];

        let kept = retain_last_per_key(rows, &[0]);

        assert_eq!(
            kept,
            vec![
                vec![PgValue::Int4(2), PgValue::Text("x".into())],
                vec![PgValue::Int8(1), PgValue::Text("b".into())],
            ]
        );
    }

    #[test]
    fn test_retain_last_per_key_numbers_compare_by_value() {
        let rows = vec![
            vec![PgValue::Int4(1), PgValue::Text("int".into())],
            vec![PgValue::Float8(1.0), PgValue::Text("float".into())],
            vec![PgValue::Numeric(Decimal::new(100, 2)), PgValue::Text("numeric".into())],
            vec![PgValue::Float8(-0.0), PgValue::Text("negative zero".into())],
            vec![PgValue::Int8(0), PgValue::Text("zero".into())],
            vec![PgValue::Float8(1.5), PgValue::Text("fraction".into())],
        ];

        let kept = retain_last_per_key(rows, &[0]);

        assert_eq!(
            kept,
            vec![
                vec![PgValue::Numeric(Decimal::new(100, 2)), PgValue::Text("numeric".into())],
                vec![PgValue::Int8(0), PgValue::Text("zero".into())],
                vec![PgValue::Float8(1.5), PgValue::Text("fraction".into())],
            ]
        );
    }

    #[test]
    fn test_retain_last_per_key_keeps_distinct_non_finite_floats() {
        let rows = vec![
            vec![PgValue::Float8(f64::INFINITY)],
            vec![PgValue::Float8(f64::NEG_INFINITY)],
            vec![PgValue::Float8(f64::INFINITY)],
        ];

        assert_eq!(retain_last_per_key(rows, &[0]).len(), 2);
    }

    #[test]
    fn test_retain_last_per_key_composite_key() {
        let rows = vec![
            vec![PgValue::Int4(1), PgValue::Text("eu".into()), PgValue::Float8(1.0)],
            vec![PgValue::Int4(1), PgValue::Text("us".into()), PgValue::Float8(2.0)],
            vec![PgValue::Int4(1), PgValue::Text("eu".into()), PgValue::Float8(3.0)],
        ];

        let kept = retain_last_per_key(rows, &[0, 1]);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0][2], PgValue::Float8(2.0));
        assert_eq!(kept[1][2], PgValue::Float8(3.0));
    }
}
