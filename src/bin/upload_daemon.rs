//! Upload scheduler daemon.
//!
//! One process per platform. Each tick it claims due queue rows inside
//! the business window and runs the platform upload flow; different
//! platforms run as separate processes, accounts within a platform are
//! serialized here.
//!
//! Usage:
//!   upload_daemon --platform base [--interval S] [--batch-size N]
//!                 [--start-hour H] [--end-hour H]

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use resellbot_backend::accounts::AccountManager;
use resellbot_backend::amazon::RateLimiter;
use resellbot_backend::daemon::{DaemonConfig, DaemonRuntime, InstanceLock, ShutdownSignal};
use resellbot_backend::logging;
use resellbot_backend::models::Platform;
use resellbot_backend::ng_filter::NgKeywordFilter;
use resellbot_backend::notify::Notifier;
use resellbot_backend::platforms::AdapterContext;
use resellbot_backend::scheduler::{UploadWorker, UploadWorkerConfig};
use resellbot_backend::store::MasterDb;

#[derive(Parser, Debug)]
#[command(name = "upload_daemon")]
#[command(about = "Drain the upload queue for one platform")]
struct Args {
    /// Platform to serve (base, ebay)
    #[arg(long)]
    platform: String,

    /// Tick interval in seconds
    #[arg(long, default_value_t = 60)]
    interval: u64,

    /// Items claimed per tick
    #[arg(long, default_value_t = 10)]
    batch_size: i64,

    /// Business window opening hour
    #[arg(long, default_value_t = 6)]
    start_hour: u32,

    /// Business window closing hour (exclusive)
    #[arg(long, default_value_t = 23)]
    end_hour: u32,
}

fn env_dir(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let Some(platform) = Platform::parse(&args.platform) else {
        bail!("unsupported platform: {}", args.platform);
    };
    let daemon_name = format!("upload_scheduler_{}", platform.as_str());

    let config_dir = env_dir("CONFIG_DIR", "config");
    let data_dir = env_dir("DATA_DIR", "data");
    let logs_dir = env_dir("LOGS_DIR", "logs");

    logging::init(&daemon_name, &logs_dir)?;
    let _lock = InstanceLock::acquire(&daemon_name, &logs_dir)?;

    let shutdown = ShutdownSignal::new();
    shutdown.install_handlers();

    info!(
        "platform: {}, business hours: {}:00-{}:00, batch size: {}",
        platform.as_str(),
        args.start_hour,
        args.end_hour,
        args.batch_size
    );

    let notifier = Arc::new(Notifier::load(&config_dir));
    let ng_filter = Arc::new(NgKeywordFilter::load(&config_dir));
    let db = MasterDb::open(&data_dir.join("master.db"), ng_filter)?;
    let account_manager = Arc::new(AccountManager::load(&config_dir)?);
    let limiter = Arc::new(RateLimiter::new(shutdown.clone()));

    // A previous instance may have died mid-upload
    let recovered = db.reset_uploading_to_pending().await?;
    if recovered > 0 {
        info!("recovered {recovered} stranded queue rows");
    }

    let ctx = AdapterContext {
        account_manager,
        db: db.clone(),
        limiter,
    };
    let worker = Arc::new(UploadWorker::new(
        UploadWorkerConfig {
            platform,
            batch_size: args.batch_size,
            business_hours_start: args.start_hour,
            business_hours_end: args.end_hour,
        },
        db,
        ctx,
        shutdown.clone(),
        notifier.clone(),
    ));

    let runtime = DaemonRuntime::new(
        DaemonConfig::new(&daemon_name, args.interval),
        shutdown,
        notifier,
    );

    let last_cycle_ok = runtime
        .run(|| {
            let worker = worker.clone();
            async move {
                let stats = worker.run_batch().await?;
                if stats.processed > 0 {
                    info!(
                        "batch done: {} processed, {} success, {} failed",
                        stats.processed, stats.success, stats.failed
                    );
                }
                // Per-item failures land on the queue rows, not on the
                // cycle
                Ok(true)
            }
        })
        .await;

    std::process::exit(if last_cycle_ok { 0 } else { 1 });
}
