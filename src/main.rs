//! Dune Sync CLI
//!
//! Runs one incremental sync of a Dune query into a warehouse table and
//! prints the run report as JSON.
//!
//! Usage:
//!   dune_sync --config config.json
//!   dune_sync --sink sqlite --sqlite-path local.db
//!   dune_sync status <execution_id>
//!   dune_sync cancel <execution_id>
//!
//! Environment Variables:
//!   DUNE_API_KEY, DUNE_API_BASE_URL - Dune credentials and endpoint
//!   SNOWFLAKE_USERNAME, SNOWFLAKE_PASSWORD, SNOWFLAKE_ACCOUNT - Snowflake login
//!   SYNC_POLL_INTERVAL_SECS - Seconds between status polls
//!   RUST_LOG - Log filter (default: dune_snowflake_sync=info,dune_sync=info)

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dune_snowflake_sync::config::AppConfig;
use dune_snowflake_sync::error::{classify, SyncError};
use dune_snowflake_sync::scrapers::{DuneClient, PollPolicy, QuerySource};
use dune_snowflake_sync::storage::{SnowflakeWarehouse, SqliteWarehouse, Warehouse};
use dune_snowflake_sync::sync::{SyncJob, SyncOrchestrator, SyncReport};

#[derive(Parser, Debug)]
#[command(name = "dune_sync")]
#[command(about = "Incrementally sync a Dune query into a warehouse table")]
struct Args {
    /// Path to a JSON or TOML config file (default: ./config.json if present)
    #[arg(short, long, env = "DUNE_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Destination warehouse
    #[arg(long, value_enum, default_value_t = Sink::Snowflake)]
    sink: Sink,

    /// Database file for the sqlite sink
    #[arg(long, default_value = "dune_sync.db")]
    sqlite_path: String,

    /// Override sync.query_id
    #[arg(long)]
    query_id: Option<String>,

    /// Override sync.table
    #[arg(long)]
    table: Option<String>,

    /// Ignore the watermark and rebuild the table from the initial begin date
    #[arg(long)]
    full_refresh: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the status of an execution
    Status { execution_id: String },
    /// Cancel a running execution
    Cancel { execution_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Sink {
    Snowflake,
    Sqlite,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    let args = Args::parse();

    if let Err(err) = run(args).await {
        error!("{:#}", err);
        let code = classify(&err).map(SyncError::exit_code).unwrap_or(1);
        std::process::exit(code);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dune_snowflake_sync=info,dune_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(args: Args) -> Result<()> {
    let mut config = AppConfig::discover(args.config.as_deref())?;
    if let Some(query_id) = args.query_id {
        config.sync.query_id = query_id;
    }
    if let Some(table) = args.table {
        config.sync.table = table;
    }

    match args.command {
        Some(Command::Status { execution_id }) => {
            let client = DuneClient::new(&config.dune)?;
            let status = client.get_status(&execution_id).await?;
            println!("{}", serde_json::to_string(&status)?);
            Ok(())
        }
        Some(Command::Cancel { execution_id }) => {
            let client = DuneClient::new(&config.dune)?;
            let cancelled = client.cancel_execution(&execution_id).await?;
            println!(
                "{}",
                serde_json::json!({"execution_id": execution_id, "cancelled": cancelled})
            );
            Ok(())
        }
        None => {
            config.validate(args.sink == Sink::Snowflake)?;
            let job = SyncJob::from_settings(&config.sync)?.with_full_refresh(args.full_refresh);
            let source = DuneClient::new(&config.dune)?;

            let report = match args.sink {
                Sink::Snowflake => {
                    info!("Connecting to {}", config.snowflake.connection_string());
                    let warehouse = SnowflakeWarehouse::connect(&config.snowflake).await?;
                    sync_into(source, warehouse, job, &config).await?
                }
                Sink::Sqlite => {
                    let warehouse = SqliteWarehouse::open(&args.sqlite_path)?;
                    sync_into(source, warehouse, job, &config).await?
                }
            };

            // Output report JSON only
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
    }
}

async fn sync_into<W: Warehouse>(
    source: DuneClient,
    warehouse: W,
    job: SyncJob,
    config: &AppConfig,
) -> Result<SyncReport> {
    let policy = PollPolicy {
        interval: config.sync.poll_interval(),
        max_wait: config.sync.max_wait(),
    };
    let mut orchestrator = SyncOrchestrator::new(source, warehouse, job, policy);

    let result = orchestrator.run().await;
    if let Err(e) = orchestrator.close().await {
        error!("Failed to close {} session: {:#}", orchestrator.warehouse().kind(), e);
    }
    result
}
