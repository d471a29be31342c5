use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sacco_sync::api::{NoRecognizer, StorageClient};
use sacco_sync::cache::QueryCache;
use sacco_sync::commands::{self, ConsoleContext};
use sacco_sync::config::Config;
use sacco_sync::db::{self, MySqlStore};
use sacco_sync::feed::{ChangeFeedBus, PollingSource};
use sacco_sync::models::Table;
use sacco_sync::services::proof_service::ProofService;
use sacco_sync::services::request_service::{LifecyclePolicy, RequestService};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sacco_sync=debug,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("🏦 Starting SACCO sync console v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };
    let Some(admin_id) = config.admin_id else {
        error!("ADMIN_ID not set in environment");
        return;
    };

    // Initialize database
    info!("Initializing database...");
    let pool = match db::init_db(&config.database_url).await {
        Ok(p) => {
            info!("Database initialized successfully");
            p
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };

    let store = Arc::new(MySqlStore::new(pool.clone()));

    // Changes from every client arrive through the shared change log
    let bus = ChangeFeedBus::new();
    let source = PollingSource::new(pool, config.feed_poll_interval)
        .with_retention(config.feed_retention);
    let feed_task = bus.spawn(source, config.feed_backoff_min, config.feed_backoff_max);
    let _queue_watch = bus.subscribe(Table::TransactionRequests, None, |notice| {
        info!(kind = ?notice.kind, "Request queue changed, run $pending to refresh");
    });

    let proofs = match &config.storage {
        Some(storage) => Some(ProofService::new(
            Arc::new(NoRecognizer),
            Arc::new(StorageClient::new(storage)),
        )),
        None => {
            warn!("STORAGE_URL/STORAGE_KEY not set, proof uploads disabled");
            None
        }
    };

    let requests = RequestService::new(store, proofs, LifecyclePolicy::from(&config));
    let queue = QueryCache::with_feed(bus.clone(), config.cache_stale_after);
    let ctx = ConsoleContext::new(Arc::new(requests), admin_id, queue);
    if let Err(e) = ctx.watch_queue() {
        warn!("Pending queue will only refresh when stale: {}", e);
    }

    info!("Console ready. Type $help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(output) = commands::handle_line(&ctx, &line).await {
                        println!("{}", output);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read console input: {}", e);
                    break;
                }
            }
        }
    }

    bus.shutdown();
    if let Err(e) = feed_task.await {
        warn!("Change feed task ended abnormally: {}", e);
    }
    info!("Shut down");
}
