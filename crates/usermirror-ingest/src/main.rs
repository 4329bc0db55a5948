//! usermirror ingestion daemon.
//!
//! Keeps the local user mirror in step with the upstream event feed. Live
//! sync is triggered on a fixed poll interval (standing in for webhook
//! receipt), and a reconciliation pass runs on a slower interval to pick up
//! anything live sync missed.
//!
//! # Usage
//!
//! ```bash
//! # Configuration comes from the environment (or a .env file)
//! USERMIRROR_API_KEY=sk_live_... usermirror-ingest
//!
//! # Override the database location and metrics port
//! usermirror-ingest --db-path /data/mirror --metrics-port 9100
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) the daemon stops triggering runs, waits briefly for the
//! in-flight live sync and reconciliation passes, flushes the database, and
//! prints a summary.

use anyhow::{Context, Result};
use clap::Parser;
use metrics::gauge;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use usermirror_core::metrics::{init_metrics, set_gauge, start_metrics_server};
use usermirror_ingest::{Config, EventFeed, HttpEventFeed, MirrorDb, UserSync};

/// How long shutdown waits for in-flight work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// usermirror ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "usermirror-ingest")]
#[command(about = "Mirror upstream users from the event feed")]
#[command(version)]
struct Args {
    /// RocksDB path for the mirror (overrides USERMIRROR_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Metrics HTTP server port, 0 to disable (overrides USERMIRROR_METRICS_PORT)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Only run live sync; skip periodic reconciliation
    #[arg(long)]
    no_backfill: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("usermirror_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }

    tracing::info!("usermirror ingestion daemon starting...");

    if config.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(config.metrics_port, metrics_handle)
            .await
            .with_context(|| format!("Failed to bind metrics port {}", config.metrics_port))?;
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let db = Arc::new(
        MirrorDb::open(&config.db_path)
            .with_context(|| format!("Failed to open mirror database at {:?}", config.db_path))?,
    );
    let stats = db.stats();
    tracing::info!(
        "Mirror opened: ~{} events, ~{} users",
        stats.approximate_events,
        stats.approximate_users
    );

    let feed: Arc<dyn EventFeed> = Arc::new(
        HttpEventFeed::new(config.feed_config()).context("Failed to create HTTP event feed")?,
    );

    tracing::info!("Configuration:");
    tracing::info!("  Database: {}", config.db_path.display());
    tracing::info!("  Feed: {} ({})", config.api_base_url, feed.name());
    tracing::info!("  Poll interval: {:?}", config.poll_interval);
    if args.no_backfill {
        tracing::info!("  Backfill: disabled");
    } else {
        tracing::info!("  Backfill interval: {:?}", config.backfill_interval);
    }
    tracing::info!("  Handler failure policy: {:?}", config.handler_failure_policy);

    let sync = Arc::new(UserSync::from_config(Arc::clone(&db), feed, None, &config));

    let backfill_task = if args.no_backfill {
        None
    } else {
        let reconciler = sync.reconciler();
        let options = config.backfill_options();
        let interval = config.backfill_interval;
        let running = Arc::clone(&running);
        Some(tokio::spawn(async move {
            reconciler.run_periodic(&options, interval, running).await;
        }))
    };

    tracing::info!("Starting live sync...");
    let started = Instant::now();
    let mut triggers = 0u64;

    while running.load(Ordering::SeqCst) {
        sync.enqueue_ingest(config.ingest_options());
        triggers += 1;

        let stats = db.stats();
        set_gauge("usermirror_store_events_approximate", stats.approximate_events as f64);
        set_gauge("usermirror_store_users_approximate", stats.approximate_users as f64);

        // Wait for the next trigger (or until stopped)
        let tick_start = Instant::now();
        while tick_start.elapsed() < config.poll_interval && running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1).min(config.poll_interval)).await;
        }
    }

    // Shutdown sequence
    tracing::info!("Shutting down...");

    if tokio::time::timeout(SHUTDOWN_GRACE, sync.wait_for_ingest())
        .await
        .is_err()
    {
        tracing::warn!("Live sync still running after {:?}, abandoning it", SHUTDOWN_GRACE);
    }

    if let Some(task) = backfill_task {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Err(e)) => tracing::warn!("Backfill task failed: {}", e),
            Err(_) => tracing::warn!("Backfill still running after {:?}, abandoning it", SHUTDOWN_GRACE),
            Ok(Ok(())) => {}
        }
    }

    db.flush().context("Failed to flush mirror database")?;
    gauge!("usermirror_pull_in_progress").set(0.0);

    // Print summary
    let stats = db.stats();
    let checkpoint = db.checkpoint()?;
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Uptime:               {:?}", started.elapsed());
    tracing::info!("Live sync triggers:   {}", triggers);
    tracing::info!("Events recorded:      ~{}", stats.approximate_events);
    tracing::info!("Users mirrored:       ~{}", stats.approximate_users);
    tracing::info!(
        "Checkpoint:           {}",
        checkpoint.map_or_else(|| "none".to_string(), |c| c.event_id)
    );

    Ok(())
}
