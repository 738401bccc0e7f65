//! Incremental sync
//!
//! One run moves through a fixed sequence of stages:
//!
//! `Init -> WatermarkLookup -> Scrub -> QuerySubmit -> Poll -> Fetch -> Normalize -> Load -> Done`
//!
//! The latest stored day is treated as provisional: its rows are deleted and
//! re-queried, so re-running the sync never duplicates a partial day. The
//! watermark lookup and scrub always finish before the query is submitted.
//! With `transactional` set, the scrub and the load share one transaction
//! and any failure in between rolls the scrub back.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::models::{LoadMode, QueryParameters};
use crate::scrapers::dune_api::{PollPolicy, QuerySource};
use crate::storage::{clear_sql, scrub_sql, validate_identifier, watermark_sql, Warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Init,
    WatermarkLookup,
    Scrub,
    QuerySubmit,
    Poll,
    Fetch,
    Normalize,
    Load,
    Done,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Init => "init",
            SyncStage::WatermarkLookup => "watermark_lookup",
            SyncStage::Scrub => "scrub",
            SyncStage::QuerySubmit => "query_submit",
            SyncStage::Poll => "poll",
            SyncStage::Fetch => "fetch",
            SyncStage::Normalize => "normalize",
            SyncStage::Load => "load",
            SyncStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// What to sync and how
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub query_id: String,
    pub table: String,
    pub timestamp_column: String,
    pub begin_param: String,
    pub end_param: String,
    pub end_date: NaiveDate,
    pub initial_begin_date: NaiveDate,
    pub transactional: bool,
    /// Skip the watermark and rebuild the whole table
    pub full_refresh: bool,
}

impl SyncJob {
    pub fn from_settings(settings: &SyncSettings) -> Result<Self> {
        settings.validate()?;
        validate_identifier(&settings.table)?;
        validate_identifier(&settings.timestamp_column)?;

        let date = |name: &str, value: &str| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map_err(|e| SyncError::config(format!("{} '{}': {}", name, value, e)))
        };

        Ok(Self {
            query_id: settings.query_id.clone(),
            table: settings.table.clone(),
            timestamp_column: settings.timestamp_column.clone(),
            begin_param: settings.begin_param.clone(),
            end_param: settings.end_param.clone(),
            end_date: date("end_date", &settings.end_date)?,
            initial_begin_date: date("initial_begin_date", &settings.initial_begin_date)?,
            transactional: settings.transactional,
            full_refresh: false,
        })
    }

    pub fn with_full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }

    /// `{begin_param: begin, end_param: end_date}`
    pub fn parameters(&self, begin: NaiveDate) -> QueryParameters {
        let mut params = QueryParameters::new();
        params.insert(self.begin_param.clone(), begin.format("%Y-%m-%d").to_string());
        params.insert(
            self.end_param.clone(),
            self.end_date.format("%Y-%m-%d").to_string(),
        );
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyncPlan {
    watermark: Option<NaiveDate>,
    begin_date: NaiveDate,
    mode: LoadMode,
}

/// Outcome of one successful run
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub query_id: String,
    pub execution_id: String,
    pub table: String,
    pub watermark: Option<NaiveDate>,
    pub begin_date: NaiveDate,
    pub end_date: NaiveDate,
    pub mode: LoadMode,
    pub rows_scrubbed: u64,
    pub rows_fetched: u64,
    pub rows_loaded: u64,
    pub elapsed_secs: f64,
}

pub struct SyncOrchestrator<Q, W> {
    source: Q,
    warehouse: W,
    job: SyncJob,
    policy: PollPolicy,
    stage: SyncStage,
    in_transaction: bool,
}

impl<Q: QuerySource, W: Warehouse> SyncOrchestrator<Q, W> {
    pub fn new(source: Q, warehouse: W, job: SyncJob, policy: PollPolicy) -> Self {
        Self {
            source,
            warehouse,
            job,
            policy,
            stage: SyncStage::Init,
            in_transaction: false,
        }
    }

    pub fn stage(&self) -> SyncStage {
        self.stage
    }

    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    pub fn into_parts(self) -> (Q, W) {
        (self.source, self.warehouse)
    }

    /// Release the warehouse session.
    pub async fn close(&mut self) -> Result<()> {
        self.warehouse.close().await
    }

    fn enter(&mut self, stage: SyncStage) {
        info!(from = %self.stage, to = %stage, table = %self.job.table, "sync stage");
        self.stage = stage;
    }

    /// Run one full sync cycle.
    pub async fn run(&mut self) -> Result<SyncReport> {
        let started = Instant::now();
        self.stage = SyncStage::Init;

        let result = self.run_stages(started).await;
        if result.is_err() && self.in_transaction {
            warn!(stage = %self.stage, "Rolling back scrub after failure");
            if let Err(e) = self.warehouse.rollback().await {
                warn!("Rollback failed: {:#}", e);
            }
            self.in_transaction = false;
        }

        let stage = self.stage;
        result.with_context(|| format!("sync of {} failed during {}", self.job.table, stage))
    }

    async fn run_stages(&mut self, started: Instant) -> Result<SyncReport> {
        self.enter(SyncStage::WatermarkLookup);
        let plan = self.plan().await?;

        self.enter(SyncStage::Scrub);
        let mut rows_scrubbed = match plan.watermark {
            Some(date) => self.scrub(date).await?,
            None => 0,
        };

        self.enter(SyncStage::QuerySubmit);
        let params = self.job.parameters(plan.begin_date);
        let execution_id = self.source.execute_query(&self.job.query_id, &params).await?;

        self.enter(SyncStage::Poll);
        self.source
            .wait_for_completion(&execution_id, &self.policy)
            .await?;

        self.enter(SyncStage::Fetch);
        let mut table = self.source.get_results(&execution_id).await?.table;
        let rows_fetched = table.len() as u64;

        self.enter(SyncStage::Normalize);
        table.normalize(&self.job.timestamp_column)?;

        self.enter(SyncStage::Load);
        let rows_loaded = if table.is_empty() {
            if self.job.full_refresh && plan.mode == LoadMode::Replace {
                rows_scrubbed += self.clear().await?;
            } else if rows_scrubbed > 0 {
                warn!(
                    rows_scrubbed,
                    "Query returned no rows after the watermark day was scrubbed"
                );
            } else {
                warn!("Query returned no rows; nothing to load");
            }
            0
        } else {
            self.warehouse
                .bulk_load(&self.job.table, &table, plan.mode)
                .await?
        };

        if self.in_transaction {
            self.warehouse.commit().await?;
            self.in_transaction = false;
        }

        self.enter(SyncStage::Done);
        let report = SyncReport {
            query_id: self.job.query_id.clone(),
            execution_id,
            table: self.job.table.clone(),
            watermark: plan.watermark,
            begin_date: plan.begin_date,
            end_date: self.job.end_date,
            mode: plan.mode,
            rows_scrubbed,
            rows_fetched,
            rows_loaded,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            table = %report.table,
            rows_loaded,
            rows_scrubbed,
            "✅ Sync complete"
        );
        Ok(report)
    }

    /// Decide the query window and load mode from what is already stored.
    async fn plan(&mut self) -> Result<SyncPlan> {
        let initial_begin = self.job.initial_begin_date;
        let initial = |mode| SyncPlan {
            watermark: None,
            begin_date: initial_begin,
            mode,
        };

        if self.job.full_refresh {
            info!(table = %self.job.table, "Full refresh requested");
            return Ok(initial(LoadMode::Replace));
        }

        if !self.warehouse.table_exists(&self.job.table).await? {
            info!(table = %self.job.table, "Target table missing, running initial sync");
            return Ok(initial(LoadMode::Replace));
        }

        let sql = watermark_sql(&self.job.table, &self.job.timestamp_column)?;
        let value = self.warehouse.scalar(&sql).await?;
        if value.is_null() {
            info!(table = %self.job.table, "Target table empty, running initial sync");
            return Ok(initial(LoadMode::Append));
        }

        let watermark = value.as_date().ok_or_else(|| {
            SyncError::warehouse(format!("watermark value {:?} is not a date", value))
        })?;
        info!(table = %self.job.table, %watermark, "Watermark found");
        Ok(SyncPlan {
            watermark: Some(watermark),
            begin_date: watermark,
            mode: LoadMode::Append,
        })
    }

    /// Empty the target so a full refresh with no rows still replaces it.
    async fn clear(&mut self) -> Result<u64> {
        if !self.warehouse.table_exists(&self.job.table).await? {
            warn!("Query returned no rows; nothing to load");
            return Ok(0);
        }
        let deleted = self.warehouse.execute(&clear_sql(&self.job.table)?).await?;
        warn!(table = %self.job.table, deleted, "Full refresh returned no rows; table cleared");
        Ok(deleted)
    }

    async fn scrub(&mut self, date: NaiveDate) -> Result<u64> {
        if self.job.transactional {
            self.warehouse.begin().await?;
            self.in_transaction = true;
        }
        let sql = scrub_sql(&self.job.table, &self.job.timestamp_column, date)?;
        let deleted = self.warehouse.execute(&sql).await?;
        info!(table = %self.job.table, %date, deleted, "Scrubbed provisional day");
        Ok(deleted)
    }
}
