use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Parameter bindings sent with a query execution
pub type QueryParameters = BTreeMap<String, String>;

/// Lifecycle of one remote query execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "PENDING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = SyncError;

    /// Accepts Dune's `QUERY_STATE_*` names as well as the bare state names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.trim().strip_prefix("QUERY_STATE_").unwrap_or(s.trim());
        match bare.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ExecutionState::Pending),
            "EXECUTING" | "RUNNING" => Ok(ExecutionState::Running),
            // Partial results are still results; the caller logs the truncation.
            "COMPLETED" | "COMPLETED_PARTIAL" => Ok(ExecutionState::Completed),
            "FAILED" | "EXPIRED" => Ok(ExecutionState::Failed),
            "CANCELLED" | "CANCELED" => Ok(ExecutionState::Cancelled),
            _ => Err(SyncError::api(None, format!("unknown execution state '{}'", s))),
        }
    }
}

/// One status poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionStatus {
    pub execution_id: String,
    pub state: ExecutionState,
    /// Raw state string as reported by the API
    pub raw_state: String,
    pub error: Option<String>,
}

impl ExecutionStatus {
    pub fn is_partial(&self) -> bool {
        self.raw_state.ends_with("COMPLETED_PARTIAL")
    }
}

/// Rows fetched for a completed execution
#[derive(Debug, Clone)]
pub struct QueryResults {
    pub execution_id: String,
    pub table: ResultTable,
}

/// Table write behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Drop the table and recreate it from the row shape
    Replace,
    /// Insert into the existing table
    Append,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Replace => f.write_str("replace"),
            LoadMode::Append => f.write_str("append"),
        }
    }
}

/// A single typed cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CellValue::Int(i)
                } else {
                    // u64 beyond i64 and all fractional values land here
                    n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Null)
                }
            }
            Value::String(s) => CellValue::Text(s),
            // Nested values are stored as their JSON text
            other => CellValue::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Interpret the cell as a calendar date, if it holds one.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(d) => Some(*d),
            CellValue::Timestamp(ts) => Some(ts.date()),
            CellValue::Text(s) => parse_timestamp(s).map(|ts| ts.date()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int(i) => Some(*i),
            CellValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            CellValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn kind(&self) -> Option<ColumnType> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(_) => Some(ColumnType::Boolean),
            CellValue::Int(_) => Some(ColumnType::Integer),
            CellValue::Float(_) => Some(ColumnType::Float),
            CellValue::Text(_) => Some(ColumnType::Text),
            CellValue::Date(_) => Some(ColumnType::Date),
            CellValue::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }
}

/// Storage type inferred for a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
    Date,
    Timestamp,
}

impl ColumnType {
    fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            (Date, Timestamp) | (Timestamp, Date) => Timestamp,
            _ => Text,
        }
    }
}

/// Formats accepted for timestamp cells, tried in order after RFC 3339.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse the timestamp shapes Dune and the warehouses produce.
///
/// Dune renders timestamps as `2024-01-05 13:00:00.000 UTC`; the trailing
/// zone marker is dropped and the value is kept as naive UTC.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    let s = s.strip_suffix(" UTC").unwrap_or(s);

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Ordered, typed rows: the in-memory frame handed from the source to the sink
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl ResultTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from JSON objects.
    ///
    /// `column_names` fixes the column order when the API reports it;
    /// otherwise columns appear in first-seen key order. Keys missing from a
    /// row become nulls.
    pub fn from_json_rows(column_names: Option<Vec<String>>, rows: Vec<Map<String, Value>>) -> Self {
        let mut columns = column_names.unwrap_or_default();
        for row in &rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = rows
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .map(|c| row.remove(c).map(CellValue::from_json).unwrap_or(CellValue::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<CellValue>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(SyncError::api(
                None,
                format!(
                    "row has {} cells but table has {} columns",
                    row.len(),
                    self.columns.len()
                ),
            )
            .into());
        }
        self.rows.push(row);
        Ok(())
    }

    /// Case-insensitive column lookup
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Append another page of the same result set.
    pub fn extend(&mut self, other: ResultTable) -> Result<()> {
        if self.columns.is_empty() && self.rows.is_empty() {
            *self = other;
            return Ok(());
        }
        if other.is_empty() {
            return Ok(());
        }
        if other.columns != self.columns {
            return Err(SyncError::api(
                None,
                format!(
                    "result page columns {:?} do not match {:?}",
                    other.columns, self.columns
                ),
            )
            .into());
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Upper-case every column name to match the warehouse convention.
    pub fn uppercase_columns(&mut self) -> Result<()> {
        let upper: Vec<String> = self.columns.iter().map(|c| c.to_uppercase()).collect();
        for (i, name) in upper.iter().enumerate() {
            if upper[..i].contains(name) {
                return Err(SyncError::api(
                    None,
                    format!("columns collide after upper-casing: {}", name),
                )
                .into());
            }
        }
        self.columns = upper;
        Ok(())
    }

    /// Convert the named column's text cells into timestamps.
    pub fn parse_timestamp_column(&mut self, column: &str) -> Result<()> {
        let idx = self.column_index(column).ok_or_else(|| {
            SyncError::api(None, format!("result is missing timestamp column '{}'", column))
        })?;

        for (row_no, row) in self.rows.iter_mut().enumerate() {
            let parsed = match &row[idx] {
                CellValue::Null | CellValue::Timestamp(_) => continue,
                CellValue::Date(d) => d.and_hms_opt(0, 0, 0),
                CellValue::Text(s) => parse_timestamp(s),
                _ => None,
            };
            match parsed {
                Some(ts) => row[idx] = CellValue::Timestamp(ts),
                None => {
                    return Err(SyncError::api(
                        None,
                        format!(
                            "row {}: cannot parse '{:?}' in column '{}' as a timestamp",
                            row_no, row[idx], column
                        ),
                    )
                    .into())
                }
            }
        }
        Ok(())
    }

    /// Prepare fetched rows for loading: typed timestamp, upper-case names.
    pub fn normalize(&mut self, timestamp_column: &str) -> Result<()> {
        if self.is_empty() {
            self.uppercase_columns()?;
            return Ok(());
        }
        self.parse_timestamp_column(timestamp_column)?;
        self.uppercase_columns()
    }

    /// Per-column storage type, widened across all non-null cells.
    pub fn column_types(&self) -> Vec<ColumnType> {
        (0..self.columns.len())
            .map(|i| {
                self.rows
                    .iter()
                    .filter_map(|row| row[i].kind())
                    .reduce(ColumnType::widen)
                    .unwrap_or(ColumnType::Text)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!(
            "QUERY_STATE_PENDING".parse::<ExecutionState>().unwrap(),
            ExecutionState::Pending
        );
        assert_eq!(
            "QUERY_STATE_EXECUTING".parse::<ExecutionState>().unwrap(),
            ExecutionState::Running
        );
        assert_eq!(
            "QUERY_STATE_COMPLETED_PARTIAL".parse::<ExecutionState>().unwrap(),
            ExecutionState::Completed
        );
        assert_eq!(
            "QUERY_STATE_EXPIRED".parse::<ExecutionState>().unwrap(),
            ExecutionState::Failed
        );
        assert_eq!("CANCELLED".parse::<ExecutionState>().unwrap(), ExecutionState::Cancelled);
        assert!("QUERY_STATE_WAT".parse::<ExecutionState>().is_err());
    }

    #[test]
    fn test_parse_timestamp_shapes() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(13, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-01-05 13:30:00.000 UTC"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-05T13:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-05 13:30:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-01-05").map(|t| t.date()),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_from_json_rows_orders_columns() {
        let rows = vec![
            obj(json!({"ts": "2024-01-05 00:00:00.000 UTC", "amount": 1.5, "tx": "0xa"})),
            obj(json!({"tx": "0xb", "ts": "2024-01-06 00:00:00.000 UTC", "extra": true})),
        ];
        let table = ResultTable::from_json_rows(
            Some(vec!["tx".into(), "ts".into(), "amount".into()]),
            rows,
        );
        assert_eq!(table.columns(), &["tx", "ts", "amount", "extra"]);
        assert_eq!(table.rows()[1][2], CellValue::Null);
        assert_eq!(table.rows()[1][3], CellValue::Bool(true));
        assert_eq!(table.rows()[0][2], CellValue::Float(1.5));
    }

    #[test]
    fn test_normalize_uppercases_every_column() {
        let rows = vec![obj(json!({"ts": "2024-01-05 10:00:00.000 UTC", "Dai_Amount": 3, "label": "x"}))];
        let mut table = ResultTable::from_json_rows(None, rows);
        let before: Vec<String> = table.columns().to_vec();
        table.normalize("ts").unwrap();
        for (old, new) in before.iter().zip(table.columns()) {
            assert_eq!(&old.to_uppercase(), new);
        }
        let ts = table.column_index("TS").unwrap();
        assert!(matches!(table.rows()[0][ts], CellValue::Timestamp(_)));
    }

    #[test]
    fn test_normalize_missing_timestamp_column() {
        let rows = vec![obj(json!({"amount": 3}))];
        let mut table = ResultTable::from_json_rows(None, rows);
        assert!(table.normalize("ts").is_err());

        // An empty result has nothing to parse.
        let mut empty = ResultTable::from_json_rows(Some(vec!["amount".into()]), vec![]);
        assert!(empty.normalize("ts").is_ok());
    }

    #[test]
    fn test_uppercase_collision() {
        let mut table = ResultTable::new(vec!["ts".into(), "TS".into()]);
        assert!(table.uppercase_columns().is_err());
    }

    #[test]
    fn test_column_types_widen() {
        let rows = vec![
            obj(json!({"a": 1, "b": "x", "c": null})),
            obj(json!({"a": 2.5, "b": 3, "c": null})),
        ];
        let table = ResultTable::from_json_rows(None, rows);
        assert_eq!(
            table.column_types(),
            vec![ColumnType::Float, ColumnType::Text, ColumnType::Text]
        );
    }

    #[test]
    fn test_extend_pages() {
        let mut first = ResultTable::from_json_rows(None, vec![obj(json!({"a": 1}))]);
        let second = ResultTable::from_json_rows(None, vec![obj(json!({"a": 2}))]);
        first.extend(second).unwrap();
        assert_eq!(first.len(), 2);

        let other = ResultTable::from_json_rows(None, vec![obj(json!({"b": 2}))]);
        assert!(first.extend(other).is_err());
    }
}
