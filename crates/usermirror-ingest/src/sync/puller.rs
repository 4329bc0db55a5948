//! Live sync: drain the feed forward from the newest recorded event.

use super::RunToken;
use crate::apply::{ApplyOptions, ApplyOutcome, EventApplier};
use crate::error::Result;
use crate::feed::EventFeed;
use crate::log::{LogLevel, RunLog};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use usermirror_core::{DEFAULT_INITIAL_RANGE_HOURS, ListEventsRequest, event_type_filter};

/// Options for one live sync run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Extra event types beyond the user lifecycle allow-list.
    pub event_types: Vec<String>,
    /// Verbosity of per-event reports.
    pub log_level: LogLevel,
    /// How far back the very first run looks when nothing is recorded yet.
    pub initial_range_hours: u64,
    /// Create users from `user.updated` when no record exists.
    pub create_user_on_update: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            event_types: Vec::new(),
            log_level: LogLevel::default(),
            initial_range_hours: DEFAULT_INITIAL_RANGE_HOURS,
            create_user_on_update: false,
        }
    }
}

/// Statistics from a single live sync run.
#[derive(Debug, Clone, Default)]
pub struct PullReport {
    /// Feed pages fetched.
    pub pages: usize,
    /// Events recorded for the first time.
    pub applied: usize,
    /// Events that were already recorded.
    pub duplicates: usize,
    /// The run stopped early because a newer run was requested.
    pub superseded: bool,
    /// Queued handler deliveries that succeeded on retry.
    pub handlers_retried: usize,
    /// Wall time of the run.
    pub duration: Duration,
}

/// Pages through the remote feed and applies each event in order.
pub struct LiveSyncPuller {
    feed: Arc<dyn EventFeed>,
    applier: Arc<EventApplier>,
}

impl LiveSyncPuller {
    pub fn new(feed: Arc<dyn EventFeed>, applier: Arc<EventApplier>) -> Self {
        Self { feed, applier }
    }

    /// Run until the feed reports no further pages, an error occurs, or
    /// `token` is superseded.
    ///
    /// The starting cursor is read from the event store at call time. A
    /// superseded run stops before its next fetch or apply; whatever it has
    /// already applied is durable and is where the next run resumes.
    pub async fn run(&self, options: &IngestOptions, token: &mut RunToken) -> Result<PullReport> {
        let start = Instant::now();
        let mut report = PullReport::default();
        let log = RunLog::new(options.log_level);
        let apply_options = ApplyOptions {
            create_user_on_update: options.create_user_on_update,
            log,
        };
        let event_types = event_type_filter(&options.event_types);

        let mut after = self.applier.db().latest_event()?.map(|e| e.event_id);
        let mut range_start = match after {
            Some(_) => None,
            None => Some(initial_range_start(Utc::now(), options.initial_range_hours)),
        };

        counter!("usermirror_pull_runs_total").increment(1);
        log.info(format_args!(
            "Live sync run {} starting from {} via {} feed",
            token.epoch(),
            after
                .as_deref()
                .map_or_else(|| format!("range start {range_start:?}"), |c| format!("cursor {c}")),
            self.feed.name()
        ));

        report.handlers_retried = self.applier.retry_pending_handlers().await?;

        'pages: loop {
            if token.is_superseded() {
                report.superseded = true;
                break;
            }

            let request = ListEventsRequest {
                event_types: event_types.clone(),
                after: after.clone(),
                range_start: range_start.take(),
            };

            let page = tokio::select! {
                page = self.feed.list_events(&request) => page?,
                _ = token.superseded() => {
                    report.superseded = true;
                    break 'pages;
                }
            };
            report.pages += 1;
            counter!("usermirror_pull_pages_total").increment(1);

            for event in &page.data {
                if token.is_superseded() {
                    report.superseded = true;
                    break 'pages;
                }
                match self.applier.apply(event, &apply_options).await? {
                    ApplyOutcome::Duplicate => report.duplicates += 1,
                    ApplyOutcome::Recorded(_) => report.applied += 1,
                }
            }

            match page.next_cursor() {
                Some(cursor) => after = Some(cursor.to_string()),
                None => break,
            }
        }

        report.duration = start.elapsed();
        if report.superseded {
            counter!("usermirror_pull_runs_superseded_total").increment(1);
            log.info(format_args!(
                "Live sync run {} superseded after {} pages ({} applied)",
                token.epoch(),
                report.pages,
                report.applied
            ));
        } else {
            histogram!("usermirror_pull_duration_seconds").record(report.duration.as_secs_f64());
            log.info(format_args!(
                "Live sync run {} complete: {} pages, {} applied, {} duplicates in {:?}",
                token.epoch(),
                report.pages,
                report.applied,
                report.duplicates,
                report.duration
            ));
        }

        Ok(report)
    }
}

/// Lower time bound for a run that has no cursor yet.
fn initial_range_start(now: DateTime<Utc>, hours: u64) -> String {
    let start = i64::try_from(hours)
        .ok()
        .and_then(TimeDelta::try_hours)
        .and_then(|lookback| now.checked_sub_signed(lookback))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    start.to_rfc3339_opts(SecondsFormat::Millis, true)
}
