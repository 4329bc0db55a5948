//! One-shot reconciliation and inspection tool for the user mirror.
//!
//! # Usage
//!
//! ```bash
//! # Run a single reconciliation pass against the upstream feed
//! USERMIRROR_API_KEY=sk_live_... usermirror-backfill
//!
//! # Show store statistics and the current checkpoint
//! usermirror-backfill --stats
//!
//! # Print one mirrored user
//! usermirror-backfill --user user_01H...
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use usermirror_ingest::{Config, EventFeed, HttpEventFeed, LogLevel, MirrorDb, UserSync};

#[derive(Parser, Debug)]
#[command(name = "usermirror-backfill")]
#[command(about = "Reconcile the user mirror against the upstream event feed")]
struct Args {
    /// Path to the mirror database
    #[arg(long, env = "USERMIRROR_DB_PATH", default_value = "./data/mirror")]
    db_path: PathBuf,

    /// Show statistics about the mirror instead of reconciling
    #[arg(long)]
    stats: bool,

    /// Print the mirrored record for this user id instead of reconciling
    #[arg(long)]
    user: Option<String>,

    /// Per-event report level for the pass (overrides USERMIRROR_LOG_LEVEL)
    #[arg(long)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();

    let db = Arc::new(
        MirrorDb::open(&args.db_path)
            .with_context(|| format!("Failed to open mirror database at {:?}", args.db_path))?,
    );

    if args.stats {
        return print_stats(&db);
    }

    if let Some(user_id) = &args.user {
        return print_user(&db, user_id);
    }

    let mut config = Config::from_env().context("Failed to load configuration")?;
    config.db_path = args.db_path.clone();
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let feed: Arc<dyn EventFeed> = Arc::new(
        HttpEventFeed::new(config.feed_config()).context("Failed to create HTTP event feed")?,
    );
    let sync = UserSync::from_config(Arc::clone(&db), feed, None, &config);

    println!("Reconciling mirror at {}", args.db_path.display());
    let report = sync
        .run_backfill(&config.backfill_options())
        .await
        .context("Reconciliation pass failed")?;
    db.flush()?;

    println!("✓ Reconciliation complete in {:?}", report.duration);
    println!("  Pages:      {}", report.pages);
    println!("  Processed:  {}", report.processed);
    println!("  Skipped:    {}", report.skipped);
    println!("  Retried:    {} handler deliveries", report.handlers_retried);
    println!(
        "  Last event: {}",
        report.last_event_id.as_deref().unwrap_or("none")
    );
    match &report.checkpoint {
        Some(c) => println!(
            "  Checkpoint: {} (creation time {})",
            c.event_id, c.creation_time
        ),
        None => println!("  Checkpoint: none"),
    }

    Ok(())
}

fn print_stats(db: &MirrorDb) -> Result<()> {
    let stats = db.stats();
    println!("Mirror statistics:");
    println!("  Events recorded:  {}", db.event_count()?);
    println!("  Users mirrored:   {}", db.user_count()?);
    println!(
        "  Approximate keys: {} events, {} users",
        stats.approximate_events, stats.approximate_users
    );

    match db.latest_event()? {
        Some(event) => println!(
            "  Newest event:     {} ({}, creation time {})",
            event.event_id, event.event_type, event.creation_time
        ),
        None => println!("  Newest event:     none"),
    }
    println!("  Queued handlers:  {}", db.pending_handlers()?.len());
    match db.checkpoint()? {
        Some(c) => println!(
            "  Checkpoint:       {} (creation time {})",
            c.event_id, c.creation_time
        ),
        None => println!("  Checkpoint:       none"),
    }

    Ok(())
}

fn print_user(db: &MirrorDb, user_id: &str) -> Result<()> {
    match db.get_user(user_id)? {
        Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
        None => println!("User {user_id} not found"),
    }
    Ok(())
}
