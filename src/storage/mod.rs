//! Warehouse sinks
//!
//! The sync only needs four things from a destination: a scalar query for
//! the watermark, a mutation for the scrub, a bulk load, and transaction
//! boundaries. Snowflake is the production sink; SQLite serves local runs.

pub mod snowflake;
pub mod sqlite;

use anyhow::Result;
use chrono::NaiveDate;

use crate::error::SyncError;
use crate::models::{CellValue, LoadMode, ResultTable};

pub use snowflake::SnowflakeWarehouse;
pub use sqlite::SqliteWarehouse;

#[async_trait::async_trait]
pub trait Warehouse: Send {
    /// Short name for logs
    fn kind(&self) -> &'static str;

    /// Run a statement returning one value. Empty results read as `Null`.
    async fn scalar(&mut self, sql: &str) -> Result<CellValue>;

    /// Run a mutation and return the number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Write `rows` into `table`. Column names are upper-cased.
    async fn bulk_load(&mut self, table: &str, rows: &ResultTable, mode: LoadMode) -> Result<u64>;

    async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN").await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    /// Release the connection or remote session.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Accept plain or dotted identifiers (`db.schema.table`) only.
pub fn validate_identifier(name: &str) -> Result<(), SyncError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    };
    if name.is_empty() || !name.split('.').all(valid_part) {
        return Err(SyncError::config(format!("invalid SQL identifier '{}'", name)));
    }
    Ok(())
}

/// `SELECT MAX(DATE(<ts>)) FROM <table>`
pub fn watermark_sql(table: &str, timestamp_column: &str) -> Result<String, SyncError> {
    validate_identifier(table)?;
    validate_identifier(timestamp_column)?;
    Ok(format!("SELECT MAX(DATE({})) FROM {}", timestamp_column, table))
}

/// Delete every row stored for `date`.
pub fn scrub_sql(table: &str, timestamp_column: &str, date: NaiveDate) -> Result<String, SyncError> {
    validate_identifier(table)?;
    validate_identifier(timestamp_column)?;
    Ok(format!(
        "DELETE FROM {} WHERE DATE({}) = '{}'",
        table,
        timestamp_column,
        date.format("%Y-%m-%d")
    ))
}

/// Delete every row, keeping the table and its columns.
pub fn clear_sql(table: &str) -> Result<String, SyncError> {
    validate_identifier(table)?;
    Ok(format!("DELETE FROM {}", table))
}

/// Upper-cased, validated column list for an INSERT or CREATE.
pub(crate) fn load_columns(rows: &ResultTable) -> Result<Vec<String>, SyncError> {
    if rows.columns().is_empty() {
        return Err(SyncError::warehouse("cannot load a table with no columns"));
    }
    rows.columns()
        .iter()
        .map(|c| {
            let upper = c.to_uppercase();
            validate_identifier(&upper)?;
            Ok(upper)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert!(validate_identifier("maker_tx_level_accounting").is_ok());
        assert!(validate_identifier("USER_TB.PUBLIC.T1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("t; DROP TABLE x").is_err());
        assert!(validate_identifier("a..b").is_err());
    }

    #[test]
    fn test_sql_text() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(
            watermark_sql("maker_tx_level_accounting", "ts").unwrap(),
            "SELECT MAX(DATE(ts)) FROM maker_tx_level_accounting"
        );
        assert_eq!(
            scrub_sql("maker_tx_level_accounting", "ts", date).unwrap(),
            "DELETE FROM maker_tx_level_accounting WHERE DATE(ts) = '2024-01-05'"
        );
        assert!(scrub_sql("bad table", "ts", date).is_err());
        assert_eq!(
            clear_sql("maker_tx_level_accounting").unwrap(),
            "DELETE FROM maker_tx_level_accounting"
        );
        assert!(clear_sql("t; drop").is_err());
    }
}
