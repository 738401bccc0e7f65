//! Snowflake REST session client
//!
//! Speaks the session protocol the official connectors use: one login
//! request yields a session token, every statement is a query-request in
//! that session, and the session is deleted on close. Transactions live in
//! the session, so BEGIN/COMMIT span requests. An expired session token is
//! renewed once with the master token and the statement is resent.

use anyhow::Result;
use chrono::{DateTime, NaiveDate};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{load_columns, validate_identifier, Warehouse};
use crate::config::SnowflakeConfig;
use crate::error::SyncError;
use crate::models::{CellValue, ColumnType, LoadMode, ResultTable};

const CLIENT_APP_ID: &str = "dune-snowflake-sync";

/// Response codes meaning the statement is still running
const QUERY_IN_PROGRESS: &[&str] = &["333333", "333334"];

/// Session token expired; renew with the master token
const SESSION_EXPIRED: &str = "390112";

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SnowflakeWarehouse {
    client: Client,
    base_url: String,
    token: String,
    master_token: Option<String>,
    schema: String,
    batch_size: usize,
    sequence_id: u64,
    closed: bool,
}

impl std::fmt::Debug for SnowflakeWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeWarehouse")
            .field("base_url", &self.base_url)
            .field("schema", &self.schema)
            .field("closed", &self.closed)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    data: LoginData<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct LoginData<'a> {
    client_app_id: &'a str,
    client_app_version: &'a str,
    account_name: &'a str,
    login_name: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct SnowflakeResponse<T> {
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct LoginResponseData {
    token: Option<String>,
    #[serde(default, rename = "masterToken")]
    master_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponseData {
    session_token: Option<String>,
    #[serde(default)]
    master_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponseData {
    #[serde(default)]
    pub rowtype: Vec<RowType>,
    #[serde(default)]
    pub rowset: Vec<Vec<Value>>,
    #[serde(default)]
    pub query_id: Option<String>,
    #[serde(default)]
    pub get_result_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RowType {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub scale: Option<i64>,
}

impl QueryResponseData {
    fn first_cell(&self) -> CellValue {
        match (self.rowset.first().and_then(|r| r.first()), self.rowtype.first()) {
            (Some(v), Some(rt)) => decode_cell(v, rt),
            (Some(v), None) => CellValue::from_json(v.clone()),
            _ => CellValue::Null,
        }
    }
}

impl SnowflakeWarehouse {
    /// Validate credentials, then open a session.
    ///
    /// Placeholder credentials fail here, before any request is sent.
    pub async fn connect(config: &SnowflakeConfig) -> Result<Self> {
        config.validate()?;
        let base_url = config.base_url();
        info!(connection = %config.connection_string(), "Connecting to Snowflake");

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::transport("snowflake", e))?;

        let request_id = Uuid::new_v4().to_string();
        let query = [
            ("databaseName", config.database.as_str()),
            ("schemaName", config.schema.as_str()),
            ("warehouse", config.warehouse.as_str()),
            ("roleName", config.role.as_str()),
            ("requestId", request_id.as_str()),
        ];
        let body = LoginRequest {
            data: LoginData {
                client_app_id: CLIENT_APP_ID,
                client_app_version: env!("CARGO_PKG_VERSION"),
                account_name: config.account.trim(),
                login_name: config.username.trim(),
                password: &config.password,
            },
        };

        let req = client
            .post(format!("{}/session/v1/login-request", base_url))
            .query(&query)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body);
        let resp: SnowflakeResponse<LoginResponseData> = send_json(req, "login").await?;

        if !resp.success {
            return Err(SyncError::warehouse(format!(
                "login failed: {} (code {})",
                resp.message.unwrap_or_default(),
                resp.code.unwrap_or_default()
            ))
            .into());
        }
        let data = resp
            .data
            .ok_or_else(|| SyncError::warehouse("login response has no data"))?;
        let token = data
            .token
            .ok_or_else(|| SyncError::warehouse("login response has no session token"))?;

        info!("❄️ Snowflake session established");
        Ok(Self {
            client,
            base_url,
            token,
            master_token: data.master_token,
            schema: config.schema.to_uppercase(),
            batch_size: config.load_batch_size,
            sequence_id: 0,
            closed: false,
        })
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header(
            reqwest::header::AUTHORIZATION,
            format!("Snowflake Token=\"{}\"", self.token),
        )
        .header(reqwest::header::ACCEPT, "application/snowflake")
    }

    /// Run one statement in the session and wait for its result.
    pub async fn query(&mut self, sql: &str, bindings: Option<Map<String, Value>>) -> Result<QueryResponseData> {
        if self.closed {
            return Err(SyncError::warehouse("session is closed").into());
        }
        self.sequence_id += 1;

        let mut body = json!({
            "sqlText": sql,
            "asyncExec": false,
            "sequenceId": self.sequence_id,
        });
        if let Some(b) = bindings {
            body["bindings"] = Value::Object(b);
        }

        // Long statements come back as "in progress" with a result URL to poll.
        let mut result_url: Option<String> = None;
        let mut renewed = false;
        loop {
            let req = match &result_url {
                None => {
                    let request_id = Uuid::new_v4().to_string();
                    self.client
                        .post(format!("{}/queries/v1/query-request", self.base_url))
                        .query(&[("requestId", request_id.as_str())])
                        .json(&body)
                }
                Some(url) => self.client.get(format!("{}{}", self.base_url, url)),
            };
            let resp: SnowflakeResponse<QueryResponseData> =
                send_json(self.authorized(req), "query").await?;

            match resp.code.as_deref() {
                Some(SESSION_EXPIRED) if !renewed => {
                    renewed = true;
                    self.renew_session().await?;
                    continue;
                }
                Some(code) if QUERY_IN_PROGRESS.contains(&code) => {
                    let url = resp
                        .data
                        .as_ref()
                        .and_then(|d| d.get_result_url.clone())
                        .ok_or_else(|| SyncError::warehouse("in-progress response has no result URL"))?;
                    result_url = Some(url);
                    tokio::time::sleep(RESULT_POLL_INTERVAL).await;
                    continue;
                }
                _ => {}
            }

            if !resp.success {
                return Err(SyncError::warehouse(format!(
                    "{} (code {}) while running: {}",
                    resp.message.unwrap_or_default(),
                    resp.code.unwrap_or_default(),
                    truncate_sql(sql)
                ))
                .into());
            }

            let data = resp.data.unwrap_or_default();
            debug!(query_id = ?data.query_id, "snowflake: {}", truncate_sql(sql));
            return Ok(data);
        }
    }

    /// Swap the expired session token for a fresh one.
    async fn renew_session(&mut self) -> Result<()> {
        let master = self
            .master_token
            .clone()
            .ok_or_else(|| SyncError::warehouse("session expired and no master token to renew it"))?;

        let request_id = Uuid::new_v4().to_string();
        let req = self
            .client
            .post(format!("{}/session/token-request", self.base_url))
            .query(&[("requestId", request_id.as_str())])
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Snowflake Token=\"{}\"", master),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&json!({"oldSessionToken": self.token, "requestType": "RENEW"}));
        let resp: SnowflakeResponse<TokenResponseData> = send_json(req, "session renewal").await?;

        if !resp.success {
            return Err(SyncError::warehouse(format!(
                "session renewal failed: {} (code {})",
                resp.message.unwrap_or_default(),
                resp.code.unwrap_or_default()
            ))
            .into());
        }
        let data = resp
            .data
            .ok_or_else(|| SyncError::warehouse("renewal response has no data"))?;
        self.token = data
            .session_token
            .ok_or_else(|| SyncError::warehouse("renewal response has no session token"))?;
        if data.master_token.is_some() {
            self.master_token = data.master_token;
        }
        info!("❄️ Snowflake session token renewed");
        Ok(())
    }

    async fn insert_batches(&mut self, table: &str, columns: &[String], rows: &ResultTable) -> Result<u64> {
        let types = rows.column_types();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        );

        let mut written = 0u64;
        for chunk in rows.rows().chunks(self.batch_size) {
            let bindings = bind_columns(chunk, &types);
            let data = self.query(&sql, Some(bindings)).await?;
            written += data.first_cell().as_i64().unwrap_or(chunk.len() as i64) as u64;
        }
        Ok(written)
    }
}

async fn send_json<T: DeserializeOwned>(req: RequestBuilder, what: &str) -> Result<T> {
    let resp = req
        .send()
        .await
        .map_err(|e| SyncError::transport("snowflake", format!("{} failed: {}", what, e)))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(SyncError::warehouse(format!("{} {}: {}", what, status, text)).into());
    }

    resp.json::<T>().await.map_err(|e| {
        SyncError::warehouse(format!("Failed to parse {} response: {}", what, e)).into()
    })
}

fn truncate_sql(sql: &str) -> &str {
    match sql.char_indices().nth(200) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

fn snowflake_type(t: ColumnType) -> &'static str {
    match t {
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Integer => "NUMBER(38,0)",
        ColumnType::Float => "FLOAT",
        ColumnType::Text => "VARCHAR",
        ColumnType::Date => "DATE",
        ColumnType::Timestamp => "TIMESTAMP_NTZ",
    }
}

fn bind_type(t: ColumnType) -> &'static str {
    match t {
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Integer => "FIXED",
        ColumnType::Float => "REAL",
        ColumnType::Text => "TEXT",
        ColumnType::Date => "DATE",
        ColumnType::Timestamp => "TIMESTAMP_NTZ",
    }
}

/// Render one cell in the wire format of its column's bind type.
///
/// DATE binds as epoch milliseconds, TIMESTAMP_NTZ as epoch nanoseconds.
fn bind_value(cell: &CellValue, column: ColumnType) -> Value {
    let text = match (cell, column) {
        (CellValue::Null, _) => return Value::Null,
        (CellValue::Date(d), ColumnType::Date) => epoch_millis(*d).to_string(),
        (CellValue::Date(d), ColumnType::Timestamp) => (epoch_millis(*d) as i128 * 1_000_000).to_string(),
        (CellValue::Timestamp(ts), ColumnType::Timestamp) => {
            let utc = ts.and_utc();
            (utc.timestamp() as i128 * 1_000_000_000 + utc.timestamp_subsec_nanos() as i128).to_string()
        }
        (CellValue::Date(d), _) => d.format("%Y-%m-%d").to_string(),
        (CellValue::Timestamp(ts), _) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        (CellValue::Bool(b), _) => b.to_string(),
        (CellValue::Int(i), _) => i.to_string(),
        (CellValue::Float(f), _) => f.to_string(),
        (CellValue::Text(s), _) => s.clone(),
    };
    Value::String(text)
}

fn epoch_millis(d: NaiveDate) -> i64 {
    d.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

/// Column-wise array bindings: `{"1": {"type": .., "value": [..]}, ..}`
fn bind_columns(rows: &[Vec<CellValue>], types: &[ColumnType]) -> Map<String, Value> {
    types
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let values: Vec<Value> = rows.iter().map(|row| bind_value(&row[i], *t)).collect();
            (
                (i + 1).to_string(),
                json!({"type": bind_type(*t), "value": values}),
            )
        })
        .collect()
}

/// Decode a JSON rowset cell using its column metadata.
fn decode_cell(value: &Value, rowtype: &RowType) -> CellValue {
    let raw = match value {
        Value::Null => return CellValue::Null,
        Value::String(s) => s.as_str(),
        other => return CellValue::from_json(other.clone()),
    };

    let parsed = match rowtype.type_name.to_ascii_lowercase().as_str() {
        "fixed" if rowtype.scale.unwrap_or(0) == 0 => raw.parse().ok().map(CellValue::Int),
        "fixed" | "real" => raw.parse().ok().map(CellValue::Float),
        "boolean" => Some(CellValue::Bool(matches!(raw, "1" | "true" | "TRUE"))),
        // Days since the epoch
        "date" => raw
            .parse::<i64>()
            .ok()
            .and_then(|days| NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(chrono::Duration::days(days)))
            .map(CellValue::Date),
        // "<seconds>.<fraction>" plus an offset suffix for TIMESTAMP_TZ
        "timestamp_ntz" | "timestamp_ltz" | "timestamp_tz" => {
            let epoch = raw.split_whitespace().next().unwrap_or(raw);
            let (secs, frac) = epoch.split_once('.').unwrap_or((epoch, "0"));
            let nanos = format!("{:0<9}", frac).get(..9).and_then(|n| n.parse::<u32>().ok());
            secs.parse::<i64>()
                .ok()
                .zip(nanos)
                .and_then(|(s, n)| DateTime::from_timestamp(s, n))
                .map(|dt| CellValue::Timestamp(dt.naive_utc()))
        }
        _ => None,
    };
    parsed.unwrap_or_else(|| CellValue::Text(raw.to_string()))
}

#[async_trait::async_trait]
impl Warehouse for SnowflakeWarehouse {
    fn kind(&self) -> &'static str {
        "snowflake"
    }

    async fn scalar(&mut self, sql: &str) -> Result<CellValue> {
        Ok(self.query(sql, None).await?.first_cell())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let data = self.query(sql, None).await?;
        Ok(data.first_cell().as_i64().unwrap_or(0).max(0) as u64)
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        validate_identifier(table)?;
        let name = table.rsplit('.').next().unwrap_or(table).to_uppercase();
        let sql = format!(
            "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}'",
            self.schema, name
        );
        Ok(self.scalar(&sql).await?.as_i64().unwrap_or(0) > 0)
    }

    async fn bulk_load(&mut self, table: &str, rows: &ResultTable, mode: LoadMode) -> Result<u64> {
        validate_identifier(table)?;
        let columns = load_columns(rows)?;

        if mode == LoadMode::Replace {
            let defs: Vec<String> = columns
                .iter()
                .zip(rows.column_types())
                .map(|(c, t)| format!("{} {}", c, snowflake_type(t)))
                .collect();
            self.query(
                &format!("CREATE OR REPLACE TABLE {} ({})", table, defs.join(", ")),
                None,
            )
            .await?;
        }

        let written = self.insert_batches(table, &columns, rows).await?;
        info!(table, rows = written, %mode, "done uploading to snowflake");
        Ok(written)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let req = self.authorized(
            self.client
                .post(format!("{}/session", self.base_url))
                .query(&[("delete", "true")]),
        );
        match req.send().await {
            Ok(resp) if resp.status().is_success() => debug!("Snowflake session closed"),
            Ok(resp) => warn!(status = %resp.status(), "Snowflake session delete rejected"),
            Err(e) => warn!("Snowflake session delete failed: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use mockito::{Matcher, Server};

    fn config_for(server: &Server) -> SnowflakeConfig {
        SnowflakeConfig {
            username: "svc_sync".into(),
            password: "s3cret".into(),
            account: "xy12345".into(),
            host: Some(server.url()),
            ..SnowflakeConfig::default()
        }
    }

    async fn mock_login(server: &mut Server) -> mockito::Mock {
        server
            .mock("POST", Matcher::Regex("^/session/v1/login-request".into()))
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("databaseName".into(), "USER_TB".into()),
                Matcher::UrlEncoded("warehouse".into(), "XS".into()),
            ]))
            .match_body(Matcher::PartialJson(json!({
                "data": {"LOGIN_NAME": "svc_sync", "ACCOUNT_NAME": "xy12345"}
            })))
            .with_status(200)
            .with_body(r#"{"data": {"token": "tok-1", "masterToken": "mtok-1"}, "success": true}"#)
            .expect(1)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_placeholder_credentials_never_reach_network() {
        let mut server = Server::new_async().await;
        let any = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let mut config = config_for(&server);
        config.username = "username".into();
        let err = SnowflakeWarehouse::connect(&config).await.unwrap_err();
        assert!(classify(&err).unwrap().is_configuration());
        any.assert_async().await;
    }

    #[tokio::test]
    async fn test_scalar_decodes_date() {
        let mut server = Server::new_async().await;
        let login = mock_login(&mut server).await;
        // 19727 days after 1970-01-01 is 2024-01-05.
        let query = server
            .mock("POST", Matcher::Regex("^/queries/v1/query-request".into()))
            .match_header("authorization", "Snowflake Token=\"tok-1\"")
            .match_body(Matcher::PartialJson(json!({
                "sqlText": "SELECT MAX(DATE(ts)) FROM t"
            })))
            .with_status(200)
            .with_body(
                r#"{"data": {"rowtype": [{"name": "MAX(DATE(TS))", "type": "date"}],
                             "rowset": [["19727"]], "queryId": "q1"},
                    "success": true}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let mut wh = SnowflakeWarehouse::connect(&config_for(&server)).await.unwrap();
        let value = wh.scalar("SELECT MAX(DATE(ts)) FROM t").await.unwrap();
        assert_eq!(value, CellValue::Date(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()));
        login.assert_async().await;
        query.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_statement_is_warehouse_error() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _query = server
            .mock("POST", Matcher::Regex("^/queries/v1/query-request".into()))
            .with_status(200)
            .with_body(
                r#"{"data": null, "code": "002003",
                    "message": "Object 'T' does not exist", "success": false}"#,
            )
            .create_async()
            .await;

        let mut wh = SnowflakeWarehouse::connect(&config_for(&server)).await.unwrap();
        let err = wh.execute("DELETE FROM t").await.unwrap_err();
        match classify(&err) {
            Some(SyncError::Warehouse(msg)) => assert!(msg.contains("does not exist")),
            other => panic!("expected warehouse error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_login() {
        let mut server = Server::new_async().await;
        let _login = server
            .mock("POST", Matcher::Regex("^/session/v1/login-request".into()))
            .with_status(200)
            .with_body(r#"{"data": null, "code": "390100", "message": "Incorrect username or password", "success": false}"#)
            .create_async()
            .await;

        let err = SnowflakeWarehouse::connect(&config_for(&server)).await.unwrap_err();
        assert!(matches!(classify(&err), Some(SyncError::Warehouse(_))));
    }

    fn statement(server: &mut Server, sql: &str) -> mockito::Mock {
        server
            .mock("POST", Matcher::Regex("^/queries/v1/query-request".into()))
            .match_body(Matcher::PartialJson(json!({"sqlText": sql})))
            .with_status(200)
    }

    const COUNT_ROWTYPE: &str = r#"[{"name": "COUNT(*)", "type": "fixed", "scale": 0}]"#;

    #[tokio::test]
    async fn test_expired_session_is_renewed_once() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let expired = statement(&mut server, "DELETE FROM t")
            .match_header("authorization", "Snowflake Token=\"tok-1\"")
            .with_body(r#"{"data": null, "code": "390112", "message": "Your session has expired.", "success": false}"#)
            .expect(1)
            .create_async()
            .await;
        let renew = server
            .mock("POST", Matcher::Regex("^/session/token-request".into()))
            .match_header("authorization", "Snowflake Token=\"mtok-1\"")
            .match_body(Matcher::PartialJson(json!({
                "oldSessionToken": "tok-1",
                "requestType": "RENEW"
            })))
            .with_status(200)
            .with_body(r#"{"data": {"sessionToken": "tok-2", "masterToken": "mtok-2"}, "success": true}"#)
            .expect(1)
            .create_async()
            .await;
        let retried = statement(&mut server, "DELETE FROM t")
            .match_header("authorization", "Snowflake Token=\"tok-2\"")
            .with_body(format!(
                r#"{{"data": {{"rowtype": {}, "rowset": [["3"]]}}, "success": true}}"#,
                COUNT_ROWTYPE
            ))
            .expect(1)
            .create_async()
            .await;

        let mut wh = SnowflakeWarehouse::connect(&config_for(&server)).await.unwrap();
        assert_eq!(wh.execute("DELETE FROM t").await.unwrap(), 3);
        expired.assert_async().await;
        renew.assert_async().await;
        retried.assert_async().await;
    }

    #[tokio::test]
    async fn test_session_expired_after_renewal_fails() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let expired = statement(&mut server, "DELETE FROM t")
            .with_body(r#"{"data": null, "code": "390112", "message": "Your session has expired.", "success": false}"#)
            .expect(2)
            .create_async()
            .await;
        let renew = server
            .mock("POST", Matcher::Regex("^/session/token-request".into()))
            .with_status(200)
            .with_body(r#"{"data": {"sessionToken": "tok-2"}, "success": true}"#)
            .expect(1)
            .create_async()
            .await;

        let mut wh = SnowflakeWarehouse::connect(&config_for(&server)).await.unwrap();
        let err = wh.execute("DELETE FROM t").await.unwrap_err();
        match classify(&err) {
            Some(SyncError::Warehouse(msg)) => assert!(msg.contains("390112")),
            other => panic!("expected warehouse error, got {:?}", other),
        }
        expired.assert_async().await;
        renew.assert_async().await;
    }

    #[tokio::test]
    async fn test_replace_load_creates_table_and_batches_inserts() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let create = statement(&mut server, "CREATE OR REPLACE TABLE t (TS TIMESTAMP_NTZ, AMOUNT FLOAT)")
            .with_body(r#"{"data": {"rowset": [["Table T successfully created."]]}, "success": true}"#)
            .expect(1)
            .create_async()
            .await;
        let insert = "INSERT INTO t (TS, AMOUNT) VALUES (?, ?)";
        // No row count in the response: the batch size is counted instead.
        let first_batch = server
            .mock("POST", Matcher::Regex("^/queries/v1/query-request".into()))
            .match_body(Matcher::PartialJson(json!({
                "sqlText": insert,
                "bindings": {"2": {"type": "REAL", "value": ["1", "2"]}}
            })))
            .with_status(200)
            .with_body(r#"{"data": {"rowset": []}, "success": true}"#)
            .expect(1)
            .create_async()
            .await;
        let second_batch = server
            .mock("POST", Matcher::Regex("^/queries/v1/query-request".into()))
            .match_body(Matcher::PartialJson(json!({
                "sqlText": insert,
                "bindings": {"2": {"type": "REAL", "value": ["3.5"]}}
            })))
            .with_status(200)
            .with_body(r#"{"data": {"rowset": []}, "success": true}"#)
            .expect(1)
            .create_async()
            .await;

        let mut rows = ResultTable::new(vec!["ts".to_string(), "amount".to_string()]);
        for (hour, amount) in [(1, 1.0), (2, 2.0), (3, 3.5)] {
            let ts = NaiveDate::from_ymd_opt(2024, 1, 5)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap();
            rows.push_row(vec![CellValue::Timestamp(ts), CellValue::Float(amount)])
                .unwrap();
        }

        let mut config = config_for(&server);
        config.load_batch_size = 2;
        let mut wh = SnowflakeWarehouse::connect(&config).await.unwrap();
        let written = wh.bulk_load("t", &rows, LoadMode::Replace).await.unwrap();
        assert_eq!(written, 3);
        create.assert_async().await;
        first_batch.assert_async().await;
        second_batch.assert_async().await;
    }

    #[tokio::test]
    async fn test_in_progress_statement_follows_result_url() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let submitted = statement(&mut server, "DELETE FROM t WHERE DATE(ts) = '2024-01-05'")
            .with_body(r#"{"data": {"getResultUrl": "/queries/q9/result"}, "code": "333334", "success": true}"#)
            .expect(1)
            .create_async()
            .await;
        let result = server
            .mock("GET", "/queries/q9/result")
            .match_header("authorization", "Snowflake Token=\"tok-1\"")
            .with_status(200)
            .with_body(format!(
                r#"{{"data": {{"rowtype": {}, "rowset": [["5"]], "queryId": "q9"}}, "success": true}}"#,
                COUNT_ROWTYPE
            ))
            .expect(1)
            .create_async()
            .await;

        let mut wh = SnowflakeWarehouse::connect(&config_for(&server)).await.unwrap();
        let deleted = wh
            .execute("DELETE FROM t WHERE DATE(ts) = '2024-01-05'")
            .await
            .unwrap();
        assert_eq!(deleted, 5);
        submitted.assert_async().await;
        result.assert_async().await;
    }

    #[tokio::test]
    async fn test_table_exists_checks_information_schema() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let lookup = |name: &str| {
            format!(
                "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = 'PUBLIC' AND TABLE_NAME = '{}'",
                name
            )
        };
        let present = statement(&mut server, &lookup("MAKER_TX_LEVEL_ACCOUNTING"))
            .with_body(format!(
                r#"{{"data": {{"rowtype": {}, "rowset": [["1"]]}}, "success": true}}"#,
                COUNT_ROWTYPE
            ))
            .expect(1)
            .create_async()
            .await;
        let absent = statement(&mut server, &lookup("MISSING"))
            .with_body(format!(
                r#"{{"data": {{"rowtype": {}, "rowset": [["0"]]}}, "success": true}}"#,
                COUNT_ROWTYPE
            ))
            .expect(1)
            .create_async()
            .await;

        let mut wh = SnowflakeWarehouse::connect(&config_for(&server)).await.unwrap();
        assert!(wh
            .table_exists("USER_TB.PUBLIC.maker_tx_level_accounting")
            .await
            .unwrap());
        assert!(!wh.table_exists("missing").await.unwrap());
        present.assert_async().await;
        absent.assert_async().await;
    }

    #[tokio::test]
    async fn test_close_deletes_session_once() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let delete = server
            .mock("POST", "/session?delete=true")
            .match_header("authorization", "Snowflake Token=\"tok-1\"")
            .with_status(200)
            .with_body(r#"{"data": null, "success": true}"#)
            .expect(1)
            .create_async()
            .await;
        let queries = server
            .mock("POST", Matcher::Regex("^/queries/v1/query-request".into()))
            .expect(0)
            .create_async()
            .await;

        let mut wh = SnowflakeWarehouse::connect(&config_for(&server)).await.unwrap();
        wh.close().await.unwrap();
        wh.close().await.unwrap();

        let err = wh.execute("SELECT 1").await.unwrap_err();
        assert!(format!("{:#}", err).contains("session is closed"));
        delete.assert_async().await;
        queries.assert_async().await;
    }

    #[test]
    fn test_bind_columns() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(0, 0, 1)
            .unwrap();
        let rows = vec![
            vec![CellValue::Timestamp(ts), CellValue::Int(7), CellValue::Null],
            vec![CellValue::Timestamp(ts), CellValue::Int(8), CellValue::Text("x".into())],
        ];
        let types = [ColumnType::Timestamp, ColumnType::Integer, ColumnType::Text];
        let bindings = bind_columns(&rows, &types);

        assert_eq!(bindings["1"]["type"], "TIMESTAMP_NTZ");
        assert_eq!(bindings["1"]["value"][0], "1704412801000000000");
        assert_eq!(bindings["2"], json!({"type": "FIXED", "value": ["7", "8"]}));
        assert_eq!(bindings["3"]["value"], json!([null, "x"]));
    }

    #[test]
    fn test_decode_timestamp_and_numbers() {
        let rt = |t: &str, scale: Option<i64>| RowType {
            name: "C".into(),
            type_name: t.into(),
            scale,
        };
        let ts = decode_cell(&json!("1704412801.500000000"), &rt("timestamp_ntz", None));
        assert_eq!(
            ts,
            CellValue::Timestamp(
                NaiveDate::from_ymd_opt(2024, 1, 5)
                    .unwrap()
                    .and_hms_milli_opt(0, 0, 1, 500)
                    .unwrap()
            )
        );
        assert_eq!(decode_cell(&json!("42"), &rt("fixed", Some(0))), CellValue::Int(42));
        assert_eq!(decode_cell(&json!("4.25"), &rt("fixed", Some(2))), CellValue::Float(4.25));
        assert_eq!(decode_cell(&Value::Null, &rt("text", None)), CellValue::Null);
        assert_eq!(decode_cell(&json!("abc"), &rt("text", None)), CellValue::Text("abc".into()));
    }
}
