//! Inventory sync daemon.
//!
//! Periodically refreshes Amazon price/stock for every listed ASIN
//! (Phase 1, serial) and reconciles each downstream platform against the
//! canonical store (Phase 2, one worker per platform).
//!
//! Usage:
//!   sync_inventory_daemon [--interval S] [--platforms base ebay]
//!                         [--dry-run] [--skip-cache-update]
//!                         [--stock-check-only] [--max-items N]

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use resellbot_backend::accounts::AccountManager;
use resellbot_backend::amazon::{RateLimiter, SpApiClient, SpApiCredentials};
use resellbot_backend::daemon::{DaemonConfig, DaemonRuntime, InstanceLock, ShutdownSignal};
use resellbot_backend::models::Platform;
use resellbot_backend::ng_filter::NgKeywordFilter;
use resellbot_backend::notify::Notifier;
use resellbot_backend::platforms::AdapterContext;
use resellbot_backend::store::{MasterDb, ProductCache};
use resellbot_backend::sync::{SyncEngine, SyncOptions};
use resellbot_backend::logging;

const DAEMON_NAME: &str = "sync_inventory_daemon";

#[derive(Parser, Debug)]
#[command(name = "sync_inventory_daemon")]
#[command(about = "Sync Amazon price/stock to the store and the downstream platforms")]
struct Args {
    /// Cycle interval in seconds (default: 3 hours)
    #[arg(long, default_value_t = 10800)]
    interval: u64,

    /// Target platforms (default: base ebay)
    #[arg(long, num_args = 1..)]
    platforms: Option<Vec<String>>,

    /// Compute and log everything, write nothing
    #[arg(long)]
    dry_run: bool,

    /// Skip Phase 1 and use the existing canonical data
    #[arg(long)]
    skip_cache_update: bool,

    /// Visibility/quantity reconciliation only
    #[arg(long)]
    stock_check_only: bool,

    /// Cap the number of items per cycle (testing)
    #[arg(long)]
    max_items: Option<usize>,
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

    let config_dir = env_dir("CONFIG_DIR", "config");
    let data_dir = env_dir("DATA_DIR", "data");
    let logs_dir = env_dir("LOGS_DIR", "logs");

    logging::init(DAEMON_NAME, &logs_dir)?;
    let _lock = InstanceLock::acquire(DAEMON_NAME, &logs_dir)?;

    let shutdown = ShutdownSignal::new();
    shutdown.install_handlers();

    let platforms = match &args.platforms {
        Some(names) => {
            let mut platforms = Vec::new();
            for name in names {
                match Platform::parse(name) {
                    Some(platform) => platforms.push(platform),
                    None => bail!("unsupported platform: {name}"),
                }
            }
            platforms
        }
        None => vec![Platform::Base, Platform::Ebay],
    };

    info!(
        "platforms: {:?}, interval: {}s, dry_run: {}",
        platforms.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        args.interval,
        args.dry_run
    );
    if args.stock_check_only {
        info!("stock-check-only mode: Phase 1 and price work skipped");
    }

    let notifier = Arc::new(Notifier::load(&config_dir));
    let ng_filter = Arc::new(NgKeywordFilter::load(&config_dir));
    let db = MasterDb::open(&data_dir.join("master.db"), ng_filter)?;
    let cache = Arc::new(ProductCache::new(
        &data_dir.join("cache").join("amazon_products"),
        None,
    )?);
    let account_manager = Arc::new(AccountManager::load(&config_dir)?);
    let limiter = Arc::new(RateLimiter::new(shutdown.clone()));

    let credentials = SpApiCredentials::from_env().context("SP-API credentials")?;
    let sp_api = Arc::new(SpApiClient::new(
        credentials,
        limiter.clone(),
        shutdown.clone(),
        Some(notifier.clone()),
    ));

    for platform in &platforms {
        let accounts = account_manager.active_accounts(platform.as_str());
        if accounts.is_empty() {
            warn!("{}: no active accounts configured", platform.as_str());
        } else {
            info!("{}: {} active account(s)", platform.as_str(), accounts.len());
        }
    }

    let ctx = AdapterContext {
        account_manager,
        db: db.clone(),
        limiter,
    };
    let engine = SyncEngine::new(
        db,
        Some(cache),
        sp_api,
        ctx,
        shutdown.clone(),
        SyncOptions {
            platforms,
            dry_run: args.dry_run,
            skip_cache_update: args.skip_cache_update,
            stock_check_only: args.stock_check_only,
            max_items: args.max_items,
        },
    );

    let runtime = DaemonRuntime::new(
        DaemonConfig::new(DAEMON_NAME, args.interval),
        shutdown,
        notifier,
    );

    let last_cycle_ok = runtime
        .run(|| {
            let engine = engine.clone();
            async move {
                let stats = engine.run_cycle().await?;
                if let Some(phase1) = &stats.phase1 {
                    info!(
                        "phase 1: {} asins, {} updated, {} out of stock, {} api errors",
                        phase1.asins_total, phase1.updated, phase1.out_of_stock, phase1.api_errors
                    );
                }
                for (platform, platform_stats) in &stats.platforms {
                    info!(
                        "{}: {} listings, {} price updates, {} hidden, {} shown, {} errors",
                        platform.as_str(),
                        platform_stats.listings_total,
                        platform_stats.price_updated,
                        platform_stats.updated_to_hidden,
                        platform_stats.updated_to_public,
                        platform_stats.errors
                    );
                }
                Ok(stats.total_errors() == 0)
            }
        })
        .await;

    std::process::exit(if last_cycle_ok { 0 } else { 1 });
}
