//! SQLite sink
//!
//! Timestamps are stored as `YYYY-MM-DD HH:MM:SS.sss` text so SQLite's
//! `DATE()` works on them the same way the watermark query expects.

use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use super::{load_columns, validate_identifier, Warehouse};
use crate::error::SyncError;
use crate::models::{CellValue, ColumnType, LoadMode, ResultTable};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub struct SqliteWarehouse {
    conn: Connection,
    in_transaction: bool,
}

fn db_err(what: &'static str) -> impl Fn(rusqlite::Error) -> SyncError {
    move |e| SyncError::warehouse(format!("{}: {}", what, e))
}

impl SqliteWarehouse {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(db_err("open"))
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        info!("📊 SQLite warehouse opened at: {}", db_path);
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    /// Direct access for inspection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn write_rows(
        conn: &Connection,
        table: &str,
        columns: &[String],
        rows: &ResultTable,
        mode: LoadMode,
    ) -> Result<u64, SyncError> {
        if mode == LoadMode::Replace {
            let defs: Vec<String> = columns
                .iter()
                .zip(rows.column_types())
                .map(|(c, t)| format!("{} {}", c, sqlite_type(t)))
                .collect();
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {table};\nCREATE TABLE {table} ({});",
                defs.join(", "),
                table = table
            ))
            .map_err(db_err("recreate table"))?;
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err("prepare insert"))?;
        let mut written = 0u64;
        for row in rows.rows() {
            written += stmt
                .execute(params_from_iter(row.iter().map(to_sql_value)))
                .map_err(db_err("insert"))? as u64;
        }
        Ok(written)
    }
}

fn sqlite_type(t: ColumnType) -> &'static str {
    match t {
        ColumnType::Boolean | ColumnType::Integer => "INTEGER",
        ColumnType::Float => "REAL",
        ColumnType::Text | ColumnType::Date | ColumnType::Timestamp => "TEXT",
    }
}

fn to_sql_value(cell: &CellValue) -> SqlValue {
    match cell {
        CellValue::Null => SqlValue::Null,
        CellValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        CellValue::Int(i) => SqlValue::Integer(*i),
        CellValue::Float(f) => SqlValue::Real(*f),
        CellValue::Text(s) => SqlValue::Text(s.clone()),
        CellValue::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
        CellValue::Timestamp(ts) => SqlValue::Text(ts.format(TIMESTAMP_FORMAT).to_string()),
    }
}

fn from_sql_value(v: SqlValue) -> CellValue {
    match v {
        SqlValue::Null => CellValue::Null,
        SqlValue::Integer(i) => CellValue::Int(i),
        SqlValue::Real(f) => CellValue::Float(f),
        SqlValue::Text(s) => CellValue::Text(s),
        SqlValue::Blob(b) => CellValue::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

#[async_trait::async_trait]
impl Warehouse for SqliteWarehouse {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn scalar(&mut self, sql: &str) -> Result<CellValue> {
        let value = self
            .conn
            .query_row(sql, [], |row| row.get::<_, SqlValue>(0))
            .optional()
            .map_err(db_err("scalar query"))?;
        Ok(value.map(from_sql_value).unwrap_or(CellValue::Null))
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let changed = self.conn.execute(sql, []).map_err(db_err("execute"))?;
        debug!(changed, "sqlite: {}", sql);
        Ok(changed as u64)
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        validate_identifier(table)?;
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
                params![table],
                |row| row.get(0),
            )
            .map_err(db_err("table lookup"))?;
        Ok(count > 0)
    }

    async fn bulk_load(&mut self, table: &str, rows: &ResultTable, mode: LoadMode) -> Result<u64> {
        validate_identifier(table)?;
        let columns = load_columns(rows)?;

        let written = if self.in_transaction {
            Self::write_rows(&self.conn, table, &columns, rows, mode)?
        } else {
            // Batch inserts in one transaction
            let tx = self.conn.transaction().map_err(db_err("begin"))?;
            let written = Self::write_rows(&tx, table, &columns, rows, mode)?;
            tx.commit().map_err(db_err("commit"))?;
            written
        };

        info!(table, rows = written, %mode, "sqlite: bulk load complete");
        Ok(written)
    }

    async fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN").map_err(db_err("begin"))?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT").map_err(db_err("commit"))?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK").map_err(db_err("rollback"))?;
        Ok(())
    }
}
