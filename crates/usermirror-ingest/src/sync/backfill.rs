//! Backfill reconciliation.
//!
//! Walks the feed forward from the checkpoint, applies every event the event
//! store lacks, and moves the checkpoint to the last event it saw. Safe to
//! run at any time, next to the live puller or another reconciler: the
//! applier's dedup check absorbs any overlap.
//!
//! Gap detection is a point lookup per event id. An event on the feed counts
//! as present if it was recorded at all, whatever its creation time relative
//! to the checkpoint.

use crate::apply::{ApplyOptions, ApplyOutcome, EventApplier};
use crate::error::Result;
use crate::feed::EventFeed;
use crate::log::{LogLevel, RunLog};
use metrics::{counter, gauge, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use usermirror_core::{Checkpoint, ListEventsRequest, event_type_filter};

/// Options for one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct BackfillOptions {
    /// Extra event types beyond the user lifecycle allow-list.
    pub event_types: Vec<String>,
    pub log_level: LogLevel,
    pub create_user_on_update: bool,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct BackfillReport {
    /// Events that were missing and got applied.
    pub processed: usize,
    /// Events that were already recorded.
    pub skipped: usize,
    /// Last event observed on the feed, if any.
    pub last_event_id: Option<String>,
    pub pages: usize,
    /// Queued handler deliveries that succeeded on retry.
    pub handlers_retried: usize,
    /// Checkpoint after the pass.
    pub checkpoint: Option<Checkpoint>,
    pub duration: Duration,
}

/// Finds and applies events the live path missed.
pub struct BackfillReconciler {
    feed: Arc<dyn EventFeed>,
    applier: Arc<EventApplier>,
}

impl BackfillReconciler {
    pub fn new(feed: Arc<dyn EventFeed>, applier: Arc<EventApplier>) -> Self {
        Self { feed, applier }
    }

    /// One forward walk from the checkpoint to the end of the feed.
    ///
    /// Applied events are durable as soon as each apply returns; the
    /// checkpoint only moves once the walk reaches the end. A failed pass
    /// therefore leaves the checkpoint where it was and the next pass skips
    /// over whatever this one already applied.
    pub async fn run(&self, options: &BackfillOptions) -> Result<BackfillReport> {
        let start = Instant::now();
        let db = self.applier.db();
        let log = RunLog::new(options.log_level);
        let apply_options = ApplyOptions {
            create_user_on_update: options.create_user_on_update,
            log,
        };
        let event_types = event_type_filter(&options.event_types);

        let checkpoint = db.checkpoint()?;
        let mut after = checkpoint.as_ref().map(|c| c.event_id.clone());
        let mut report = BackfillReport {
            checkpoint: checkpoint.clone(),
            ..Default::default()
        };

        counter!("usermirror_backfill_runs_total").increment(1);
        match &checkpoint {
            Some(c) => log.info(format_args!(
                "Backfill starting after {} (creation time {})",
                c.event_id, c.creation_time
            )),
            None => log.info(format_args!("Backfill starting from the beginning of the feed")),
        }

        report.handlers_retried = self.applier.retry_pending_handlers().await?;

        loop {
            let request = ListEventsRequest {
                event_types: event_types.clone(),
                after: after.clone(),
                range_start: None,
            };
            let page = self.feed.list_events(&request).await?;
            if page.data.is_empty() {
                break;
            }
            report.pages += 1;

            let ids: Vec<&str> = page.data.iter().map(|e| e.id.as_str()).collect();
            let missing = db.missing_event_ids(&ids)?;

            for event in &page.data {
                if missing.contains(&event.id) {
                    match self.applier.apply(event, &apply_options).await? {
                        ApplyOutcome::Recorded(change) => {
                            report.processed += 1;
                            log.info(format_args!(
                                "Backfilled {} {} ({})",
                                event.event_type,
                                event.id,
                                change.as_str()
                            ));
                        }
                        // Recorded by the live path since the lookup
                        ApplyOutcome::Duplicate => report.skipped += 1,
                    }
                } else {
                    report.skipped += 1;
                }
                report.last_event_id = Some(event.id.clone());
            }

            match page.next_cursor() {
                Some(cursor) => after = Some(cursor.to_string()),
                None => break,
            }
        }

        if let Some(last) = &report.last_event_id {
            report.checkpoint = db.advance_checkpoint(last)?;
        }
        if let Some(c) = &report.checkpoint {
            gauge!("usermirror_backfill_checkpoint_creation_time").set(c.creation_time as f64);
        }

        report.duration = start.elapsed();
        counter!("usermirror_backfill_events_processed_total").increment(report.processed as u64);
        counter!("usermirror_backfill_events_skipped_total").increment(report.skipped as u64);
        histogram!("usermirror_backfill_duration_seconds").record(report.duration.as_secs_f64());
        gauge!("usermirror_backfill_last_run_unix").set(chrono::Utc::now().timestamp() as f64);

        log.info(format_args!(
            "Backfill complete: {} processed, {} skipped over {} pages in {:?} (last event {:?})",
            report.processed, report.skipped, report.pages, report.duration, report.last_event_id
        ));
        Ok(report)
    }

    /// Run a pass every `interval` until `running` is cleared.
    ///
    /// Failed passes are logged and counted; the loop keeps going.
    pub async fn run_periodic(
        &self,
        options: &BackfillOptions,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) {
        tracing::info!(
            "Starting periodic backfill (interval: {}s)",
            interval.as_secs()
        );

        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.run(options).await {
                tracing::error!("Backfill pass failed: {}", e);
                counter!("usermirror_backfill_errors_total").increment(1);
            }

            // Wait for the next interval (or until stopped)
            let tick = interval.min(Duration::from_secs(1));
            let start = Instant::now();
            while start.elapsed() < interval && running.load(Ordering::SeqCst) {
                tokio::time::sleep(tick).await;
            }
        }

        tracing::info!("Periodic backfill stopped");
    }
}
