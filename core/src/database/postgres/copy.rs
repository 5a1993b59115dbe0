use futures::pin_mut;
use tokio_postgres::{binary_copy::BinaryCopyInWriter, types::ToSql, Error as PgError, Transaction};
use tracing::debug;

use crate::database::postgres::{
    coercion::{CoercedRow, PgValue},
    merge::quote_identifier,
    staging::StagingTable,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CopyCursorError {
    #[error("No current row: the cursor is exhausted or was never advanced")]
    EndOfData,

    #[error("Row {row} has {found} values but the column set has {expected}")]
    RowWidthMismatch { row: usize, expected: usize, found: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("{0}")]
    Postgres(#[from] PgError),

    #[error("{0}")]
    Cursor(#[from] CopyCursorError),
}

impl LoadError {
    pub fn as_postgres(&self) -> Option<&PgError> {
        match self {
            LoadError::Postgres(e) => Some(e),
            LoadError::Cursor(_) => None,
        }
    }
}

/// Single-pass pull cursor over coerced rows feeding the COPY stream.
///
/// It owns its rows and can not be rewound; a new load needs a new cursor.
#[derive(Debug)]
pub struct CopyRowCursor {
    rows: Vec<CoercedRow>,
    width: usize,
    current: Option<usize>,
    err: Option<CopyCursorError>,
}

impl CopyRowCursor {
    pub fn new(rows: Vec<CoercedRow>, width: usize) -> Self {
        CopyRowCursor { rows, width, current: None, err: None }
    }

    /// Moves to the next row. Returns false once the rows are exhausted or a row
    /// is malformed; check [`CopyRowCursor::err`] to tell the two apart.
    pub fn advance(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        let next = self.current.map_or(0, |current| current + 1);
        if next >= self.rows.len() {
            self.current = Some(self.rows.len());
            return false;
        }

        let found = self.rows[next].len();
        if found != self.width {
            self.err =
                Some(CopyCursorError::RowWidthMismatch { row: next, expected: self.width, found });
            self.current = Some(self.rows.len());
            return false;
        }

        self.current = Some(next);
        true
    }

    /// Values of the current row in column-set order.
    pub fn values(&self) -> Result<&[PgValue], CopyCursorError> {
        self.current
            .and_then(|current| self.rows.get(current))
            .map(|row| row.as_slice())
            .ok_or(CopyCursorError::EndOfData)
    }

    pub fn err(&self) -> Option<&CopyCursorError> {
        self.err.as_ref()
    }
}

/// Streams every row of `cursor` into the staging table with binary COPY.
pub async fn copy_into_staging(
    transaction: &Transaction<'_>,
    staging: &StagingTable,
    columns: &[String],
    mut cursor: CopyRowCursor,
) -> Result<u64, LoadError> {
    let stmt = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT binary)",
        quote_identifier(&staging.name),
        columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ")
    );

    debug!("Bulk load statement: {}", stmt);

    let sink = transaction.copy_in(&stmt).await?;

    let writer = BinaryCopyInWriter::new(sink, &staging.column_types);
    pin_mut!(writer);

    while cursor.advance() {
        let row: Vec<&(dyn ToSql + Sync)> =
            cursor.values()?.iter().map(|value| value as &(dyn ToSql + Sync)).collect();
        writer.as_mut().write(&row).await?;
    }

    // Returning before `finish` drops the sink, which aborts the COPY.
    if let Some(err) = cursor.err() {
        return Err(err.clone().into());
    }

    Ok(writer.finish().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(count: i32) -> Vec<CoercedRow> {
        (0..count).map(|i| vec![PgValue::Int4(i), PgValue::Text(format!("row {i}"))]).collect()
    }

    #[test]
    fn test_cursor_walks_rows_once() {
        let mut cursor = CopyRowCursor::new(rows(3), 2);

        assert_eq!(cursor.values(), Err(CopyCursorError::EndOfData));

        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.values().unwrap()[0].clone());
        }

        assert_eq!(seen, vec![PgValue::Int4(0), PgValue::Int4(1), PgValue::Int4(2)]);
        assert_eq!(cursor.values(), Err(CopyCursorError::EndOfData));
        assert!(cursor.err().is_none());
        assert!(!cursor.advance(), "an exhausted cursor stays exhausted");
    }

    #[test]
    fn test_cursor_empty() {
        let mut cursor = CopyRowCursor::new(Vec::new(), 2);
        assert!(!cursor.advance());
        assert!(cursor.err().is_none());
    }

    #[test]
    fn test_cursor_stops_on_malformed_row() {
        let mut input = rows(3);
        input[1].pop();
        let mut cursor = CopyRowCursor::new(input, 2);

        assert!(cursor.advance());
        assert!(!cursor.advance());
        assert_eq!(
            cursor.err(),
            Some(&CopyCursorError::RowWidthMismatch { row: 1, expected: 2, found: 1 })
        );
        assert!(!cursor.advance());
    }
}
