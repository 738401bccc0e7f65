//! Dune to Snowflake Sync Library
//!
//! Exposes the sync pipeline for the `dune_sync` binary and tests.

pub mod config;
pub mod error;
pub mod models;
pub mod scrapers;
pub mod storage;
pub mod sync;

pub use config::AppConfig;
pub use error::{classify, SyncError};
pub use sync::{SyncJob, SyncOrchestrator, SyncReport, SyncStage};
