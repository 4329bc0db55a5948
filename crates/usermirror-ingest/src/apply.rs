//! Idempotent per-event apply step.
//!
//! [`EventApplier::apply`] is the only way events reach the mirror. Both the
//! live sync puller and the backfill reconciler call it, and it is safe to
//! call concurrently with the same event: the dedup check and the event
//! insert happen inside one [`MirrorTxn`], so exactly one caller proceeds.
//!
//! ## Apply sequence
//!
//! 1. If the event id is already recorded, return [`ApplyOutcome::Duplicate`].
//! 2. Record the event.
//! 3. Mutate the user mirror according to the event kind (same unit of work).
//! 4. Under [`HandlerFailurePolicy::Retry`], queue the handler delivery (same
//!    unit of work).
//! 5. Commit.
//! 6. Invoke the configured [`EventHandler`], if any.
//!
//! Referential gaps, stale updates and malformed payloads never fail the
//! apply; they are recorded, reported, and the caller moves on. A handler
//! failure does fail it, after the event and mirror change have been
//! committed. The event record is never removed again; whether the handler
//! gets another attempt is decided by [`HandlerFailurePolicy`].

use crate::BoxedFuture;
use crate::error::{BoxError, Error, Result};
use crate::log::RunLog;
use crate::store::{MirrorDb, MirrorTxn};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use usermirror_core::metrics::increment;
use usermirror_core::{EventKind, FeedEvent, PendingHandler, UserRecord};

/// Payload handed to an [`EventHandler`] after an event is applied.
#[derive(Debug, Clone, Copy)]
pub struct HandlerEvent<'a> {
    pub event_type: &'a str,
    pub data: &'a Value,
}

/// Caller-supplied post-processing hook.
///
/// Invoked once per newly recorded event, whether or not the mirror changed.
/// Receives the database so it can read the mirror state it reacts to.
pub trait EventHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        db: &'a MirrorDb,
        event: HandlerEvent<'a>,
    ) -> BoxedFuture<'a, std::result::Result<(), BoxError>>;
}

/// What happens to a handler invocation that fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerFailurePolicy {
    /// Give up on it. A retry of the event sees a duplicate and the handler
    /// is not invoked again (at-most-once handler delivery).
    #[default]
    KeepRecorded,
    /// Queue every delivery next to its event record and clear it once the
    /// handler succeeds. Queued deliveries are retried at the start of each
    /// live sync run and reconciliation pass (at-least-once handler
    /// delivery).
    Retry,
}

impl FromStr for HandlerFailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep-recorded" | "keep_recorded" | "keep" => Ok(Self::KeepRecorded),
            "retry" => Ok(Self::Retry),
            other => Err(Error::Config(format!(
                "unknown handler failure policy '{other}'"
            ))),
        }
    }
}

/// Per-call apply settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Create the user from a `user.updated` event when no record exists.
    pub create_user_on_update: bool,
    /// Report verbosity.
    pub log: RunLog,
}

/// Result of a successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event id was already recorded; nothing happened.
    Duplicate,
    /// The event was recorded for the first time.
    Recorded(MirrorChange),
}

/// Effect a newly recorded event had on the user mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorChange {
    Created,
    /// `user.updated` for an unknown user, with create-on-update enabled.
    CreatedFromUpdate,
    Updated,
    Deleted,
    /// `user.created` for a user that already exists.
    AlreadyExists,
    /// Update not newer than the stored record.
    Stale,
    /// `user.updated`/`user.deleted` for a user that does not exist.
    MissingUser,
    /// Payload could not be read as a user.
    Malformed,
    /// Event kind the mirror does not track.
    Ignored,
}

impl MirrorChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::CreatedFromUpdate => "created_from_update",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::AlreadyExists => "already_exists",
            Self::Stale => "stale",
            Self::MissingUser => "missing_user",
            Self::Malformed => "malformed",
            Self::Ignored => "ignored",
        }
    }

    /// Whether the user mirror was written.
    pub fn mutated(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::CreatedFromUpdate | Self::Updated | Self::Deleted
        )
    }
}

/// Applies feed events to the mirror exactly once per event id.
pub struct EventApplier {
    db: Arc<MirrorDb>,
    handler: Option<Arc<dyn EventHandler>>,
    failure_policy: HandlerFailurePolicy,
    /// Event ids whose queued delivery is being attempted right now.
    delivering: Mutex<HashSet<String>>,
}

/// Exclusive right to attempt one queued delivery. Released on drop.
struct DeliveryClaim<'a> {
    delivering: &'a Mutex<HashSet<String>>,
    event_id: String,
}

impl Drop for DeliveryClaim<'_> {
    fn drop(&mut self) {
        self.delivering.lock().remove(&self.event_id);
    }
}

impl EventApplier {
    pub fn new(db: Arc<MirrorDb>) -> Self {
        Self {
            db,
            handler: None,
            failure_policy: HandlerFailurePolicy::default(),
            delivering: Mutex::new(HashSet::new()),
        }
    }

    /// Attach a post-event handler.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_failure_policy(mut self, policy: HandlerFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn db(&self) -> &Arc<MirrorDb> {
        &self.db
    }

    /// Apply one event. See the module docs for the exact sequence.
    pub async fn apply(&self, event: &FeedEvent, options: &ApplyOptions) -> Result<ApplyOutcome> {
        let start = Instant::now();
        let result = self.apply_inner(event, options).await;
        histogram!("usermirror_apply_duration_seconds").record(start.elapsed().as_secs_f64());
        result
    }

    async fn apply_inner(&self, event: &FeedEvent, options: &ApplyOptions) -> Result<ApplyOutcome> {
        let Some((change, claim)) = self.record_and_mutate(event, options)? else {
            counter!("usermirror_apply_events_total", "outcome" => "duplicate").increment(1);
            options
                .log
                .debug(format_args!("Event {} already applied, skipping", event.id));
            return Ok(ApplyOutcome::Duplicate);
        };

        counter!("usermirror_apply_events_total", "outcome" => change.as_str()).increment(1);

        if let Some(handler) = &self.handler {
            self.deliver(handler.as_ref(), event, claim.is_some()).await?;
        }

        Ok(ApplyOutcome::Recorded(change))
    }

    /// Attempt every queued handler delivery once, oldest event first.
    ///
    /// Deliveries another caller is attempting right now are left to it. A
    /// delivery that fails again stays queued and is logged; it does not fail
    /// the call. Returns how many deliveries succeeded.
    pub async fn retry_pending_handlers(&self) -> Result<usize> {
        let Some(handler) = &self.handler else {
            return Ok(0);
        };

        let pending = self.db.pending_handlers()?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut attempted = 0u64;
        let mut delivered = 0;
        for PendingHandler { event, .. } in &pending {
            let Some(_claim) = self.claim(&event.id) else {
                continue;
            };
            // Cleared since the scan by whoever held the claim before us
            if self.db.pending_handler(&event.id)?.is_none() {
                continue;
            }

            attempted += 1;
            match self.deliver(handler.as_ref(), event, true).await {
                Ok(()) => delivered += 1,
                Err(Error::Handler { source, .. }) => {
                    tracing::warn!(
                        "Retried handler for {} {} failed again, keeping it queued: {}",
                        event.event_type,
                        event.id,
                        source
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if attempted > 0 {
            increment("usermirror_apply_handler_retries_total", attempted);
            tracing::info!(
                "Retried {} queued handler deliveries, {} succeeded",
                attempted,
                delivered
            );
        }
        Ok(delivered)
    }

    /// Invoke the handler for a recorded event. A queued delivery is
    /// cleared when the handler succeeds.
    async fn deliver(
        &self,
        handler: &dyn EventHandler,
        event: &FeedEvent,
        queued: bool,
    ) -> Result<()> {
        let handled = handler
            .handle(
                &self.db,
                HandlerEvent {
                    event_type: &event.event_type,
                    data: &event.data,
                },
            )
            .await;

        match handled {
            Ok(()) => {
                if queued {
                    self.db.clear_pending_handler(&event.id)?;
                }
                Ok(())
            }
            Err(source) => {
                counter!("usermirror_apply_handler_failures_total").increment(1);
                Err(Error::Handler {
                    event_id: event.id.clone(),
                    source,
                })
            }
        }
    }

    fn queues_deliveries(&self) -> bool {
        self.handler.is_some() && self.failure_policy == HandlerFailurePolicy::Retry
    }

    fn claim(&self, event_id: &str) -> Option<DeliveryClaim<'_>> {
        if !self.delivering.lock().insert(event_id.to_string()) {
            return None;
        }
        Some(DeliveryClaim {
            delivering: &self.delivering,
            event_id: event_id.to_string(),
        })
    }

    /// Dedup check, event insert, mirror mutation and delivery queueing as
    /// one unit of work.
    ///
    /// Returns `None` for a duplicate. A queued delivery comes back already
    /// claimed, so a concurrent retry cannot pick it up before the first
    /// attempt has finished.
    fn record_and_mutate(
        &self,
        event: &FeedEvent,
        options: &ApplyOptions,
    ) -> Result<Option<(MirrorChange, Option<DeliveryClaim<'_>>)>> {
        let mut txn = self.db.begin();

        if txn.contains_event(&event.id)? {
            return Ok(None);
        }

        let record = txn.record_event(&event.id, &event.event_type, event.data_updated_at())?;

        let change = match event.kind() {
            EventKind::UserCreated => on_created(&mut txn, event, options)?,
            EventKind::UserUpdated => on_updated(&mut txn, event, options)?,
            EventKind::UserDeleted => on_deleted(&mut txn, event, options)?,
            EventKind::Other(_) => MirrorChange::Ignored,
        };

        let claim = if self.queues_deliveries() {
            txn.put_pending_handler(&PendingHandler {
                event: event.clone(),
                creation_time: record.creation_time,
            })?;
            self.claim(&event.id)
        } else {
            None
        };

        txn.commit()?;

        options.log.debug(format_args!(
            "Applied {} {} ({})",
            event.event_type,
            event.id,
            change.as_str()
        ));
        Ok(Some((change, claim)))
    }
}

fn on_created(
    txn: &mut MirrorTxn<'_>,
    event: &FeedEvent,
    options: &ApplyOptions,
) -> Result<MirrorChange> {
    let user = match UserRecord::from_event_data(&event.event_type, &event.data) {
        Ok(user) => user,
        Err(e) => return Ok(malformed(event, e, options)),
    };

    if txn.get_user(&user.id)?.is_some() {
        options.log.warn(format_args!(
            "User {} already exists, ignoring {} {}",
            user.id, event.event_type, event.id
        ));
        return Ok(MirrorChange::AlreadyExists);
    }

    txn.put_user(&user)?;
    Ok(MirrorChange::Created)
}

fn on_updated(
    txn: &mut MirrorTxn<'_>,
    event: &FeedEvent,
    options: &ApplyOptions,
) -> Result<MirrorChange> {
    let Some(user_id) = event.data_id() else {
        return Ok(malformed(event, "payload has no user id", options));
    };

    let Some(existing) = txn.get_user(user_id)? else {
        if !options.create_user_on_update {
            options.log.error(format_args!(
                "User {} not found for {} {}, skipping",
                user_id, event.event_type, event.id
            ));
            return Ok(MirrorChange::MissingUser);
        }
        return match UserRecord::from_event_data(&event.event_type, &event.data) {
            Ok(user) => {
                options.log.info(format_args!(
                    "User {} not found for {} {}, creating it",
                    user_id, event.event_type, event.id
                ));
                txn.put_user(&user)?;
                Ok(MirrorChange::CreatedFromUpdate)
            }
            Err(e) => Ok(malformed(event, e, options)),
        };
    };

    let Some(incoming) = event.data_updated_at() else {
        return Ok(malformed(event, "payload has no updated_at", options));
    };

    if existing.supersedes(incoming) {
        options.log.warn(format_args!(
            "Stale {} {} for user {}: stored updated_at {} >= {}",
            event.event_type, event.id, user_id, existing.updated_at, incoming
        ));
        return Ok(MirrorChange::Stale);
    }

    match existing.patched(&event.event_type, &event.data) {
        Ok(updated) => {
            txn.put_user(&updated)?;
            Ok(MirrorChange::Updated)
        }
        Err(e) => Ok(malformed(event, e, options)),
    }
}

fn on_deleted(
    txn: &mut MirrorTxn<'_>,
    event: &FeedEvent,
    options: &ApplyOptions,
) -> Result<MirrorChange> {
    let Some(user_id) = event.data_id() else {
        return Ok(malformed(event, "payload has no user id", options));
    };

    if txn.get_user(user_id)?.is_none() {
        options.log.warn(format_args!(
            "User {} not found for {} {}, nothing to delete",
            user_id, event.event_type, event.id
        ));
        return Ok(MirrorChange::MissingUser);
    }

    txn.delete_user(user_id)?;
    Ok(MirrorChange::Deleted)
}

fn malformed(
    event: &FeedEvent,
    reason: impl std::fmt::Display,
    options: &ApplyOptions,
) -> MirrorChange {
    options.log.error(format_args!(
        "Malformed {} {}: {}",
        event.event_type, event.id, reason
    ));
    MirrorChange::Malformed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordingHandler, open_db, user_event};
    use metrics::{
        Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString,
        Unit,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use usermirror_core::USER_UPDATED;

    fn opts() -> ApplyOptions {
        ApplyOptions::default()
    }

    fn opts_create_on_update() -> ApplyOptions {
        ApplyOptions {
            create_user_on_update: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_created_then_duplicate() {
        let (_tmp, db) = open_db();
        let applier = EventApplier::new(Arc::clone(&db));
        let event = user_event("e1", "user.created", "u1", "t1");

        assert_eq!(
            applier.apply(&event, &opts()).await.unwrap(),
            ApplyOutcome::Recorded(MirrorChange::Created)
        );
        assert_eq!(
            applier.apply(&event, &opts()).await.unwrap(),
            ApplyOutcome::Duplicate
        );

        assert_eq!(db.event_count().unwrap(), 1);
        let user = db.get_user("u1").unwrap().unwrap();
        assert_eq!(user.updated_at, "t1");
    }

    #[tokio::test]
    async fn test_idempotent_for_every_kind() {
        let (_tmp, db) = open_db();
        let applier = EventApplier::new(Arc::clone(&db));

        let events = [
            user_event("e1", "user.created", "u1", "t1"),
            user_event("e2", "user.updated", "u1", "t2"),
            user_event("e3", "user.deleted", "u1", "t3"),
            user_event("e4", "organization.created", "org_1", "t4"),
        ];

        for event in &events {
            applier.apply(event, &opts()).await.unwrap();
        }
        let after_once = (db.event_count().unwrap(), db.get_user("u1").unwrap());

        for event in &events {
            assert_eq!(
                applier.apply(event, &opts()).await.unwrap(),
                ApplyOutcome::Duplicate
            );
        }
        let after_twice = (db.event_count().unwrap(), db.get_user("u1").unwrap());

        assert_eq!(after_once, after_twice);
        assert_eq!(after_once.0, 4);
        assert!(after_once.1.is_none());
    }

    #[tokio::test]
    async fn test_created_does_not_overwrite_existing() {
        let (_tmp, db) = open_db();
        let applier = EventApplier::new(Arc::clone(&db));

        applier
            .apply(&user_event("e1", "user.created", "u1", "t5"), &opts())
            .await
            .unwrap();
        let outcome = applier
            .apply(&user_event("e2", "user.created", "u1", "t9"), &opts())
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Recorded(MirrorChange::AlreadyExists));
        assert_eq!(db.get_user("u1").unwrap().unwrap().updated_at, "t5");
        assert!(db.contains_event("e2").unwrap());
    }

    #[tokio::test]
    async fn test_last_writer_wins_in_either_order() {
        let created = user_event("e0", "user.created", "u1", "2024-01-01T00:00:00Z");
        let mut older = user_event("e1", USER_UPDATED, "u1", "2024-01-02T00:00:00Z");
        older.data["first_name"] = json!("Older");
        let mut newer = user_event("e2", USER_UPDATED, "u1", "2024-01-03T00:00:00Z");
        newer.data["first_name"] = json!("Newer");

        let mut finals = Vec::new();
        for order in [[&older, &newer], [&newer, &older]] {
            let (_tmp, db) = open_db();
            let applier = EventApplier::new(Arc::clone(&db));
            applier.apply(&created, &opts()).await.unwrap();
            for event in order {
                applier.apply(event, &opts()).await.unwrap();
            }
            finals.push(db.get_user("u1").unwrap().unwrap());
        }

        // Reference: only the newer update applied
        let (_tmp, db) = open_db();
        let applier = EventApplier::new(Arc::clone(&db));
        applier.apply(&created, &opts()).await.unwrap();
        applier.apply(&newer, &opts()).await.unwrap();
        let reference = db.get_user("u1").unwrap().unwrap();

        assert_eq!(finals[0], reference);
        assert_eq!(finals[1], reference);
        assert_eq!(reference.first_name.as_deref(), Some("Newer"));
    }

    #[tokio::test]
    async fn test_equal_updated_at_is_stale() {
        let (_tmp, db) = open_db();
        let applier = EventApplier::new(Arc::clone(&db));

        applier
            .apply(&user_event("e1", "user.created", "u1", "t1"), &opts())
            .await
            .unwrap();
        let mut same = user_event("e2", USER_UPDATED, "u1", "t1");
        same.data["first_name"] = json!("Changed");

        let outcome = applier.apply(&same, &opts()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Recorded(MirrorChange::Stale));
        assert_ne!(
            db.get_user("u1").unwrap().unwrap().first_name.as_deref(),
            Some("Changed")
        );
        // Stale events are still recorded
        assert!(db.contains_event("e2").unwrap());
    }

    #[tokio::test]
    async fn test_update_before_create_without_flag() {
        let (_tmp, db) = open_db();
        let applier = EventApplier::new(Arc::clone(&db));

        let outcome = applier
            .apply(&user_event("e1", USER_UPDATED, "u1", "t0"), &opts())
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Recorded(MirrorChange::MissingUser));
        assert!(db.get_user("u1").unwrap().is_none());
        assert!(db.contains_event("e1").unwrap());

        // Processing continues with the next event
        let outcome = applier
            .apply(&user_event("e2", "user.created", "u1", "t1"), &opts())
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Recorded(MirrorChange::Created));
    }

    #[tokio::test]
    async fn test_update_creates_missing_user_with_flag() {
        let (_tmp, db) = open_db();
        let applier = EventApplier::new(Arc::clone(&db));

        let outcome = applier
            .apply(
                &user_event("e1", USER_UPDATED, "u1", "t0"),
                &opts_create_on_update(),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ApplyOutcome::Recorded(MirrorChange::CreatedFromUpdate)
        );
        assert_eq!(db.get_user("u1").unwrap().unwrap().updated_at, "t0");
    }

    #[tokio::test]
    async fn test_delete_missing_user_is_recorded() {
        let (_tmp, db) = open_db();
        let applier = EventApplier::new(Arc::clone(&db));

        let outcome = applier
            .apply(&user_event("e1", "user.deleted", "u1", "t0"), &opts())
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Recorded(MirrorChange::MissingUser));
        assert!(db.contains_event("e1").unwrap());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_recorded_not_fatal() {
        let (_tmp, db) = open_db();
        let applier = EventApplier::new(Arc::clone(&db));

        let mut event = user_event("e1", "user.created", "u1", "t0");
        event.data = json!({ "email": "no-id@example.com" });

        let outcome = applier.apply(&event, &opts()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Recorded(MirrorChange::Malformed));
        assert!(db.contains_event("e1").unwrap());
        assert_eq!(db.user_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_handler_invoked_for_every_new_event() {
        let (_tmp, db) = open_db();
        let handler = Arc::new(RecordingHandler::default());
        let applier = EventApplier::new(Arc::clone(&db))
            .with_handler(Arc::clone(&handler) as Arc<dyn EventHandler>);

        applier
            .apply(&user_event("e1", "user.created", "u1", "t1"), &opts())
            .await
            .unwrap();
        // Mirror no-op, handler still runs
        applier
            .apply(&user_event("e2", "user.updated", "u1", "t0"), &opts())
            .await
            .unwrap();
        applier
            .apply(&user_event("e3", "session.created", "u1", "t2"), &opts())
            .await
            .unwrap();
        // Duplicate, handler does not run
        applier
            .apply(&user_event("e1", "user.created", "u1", "t1"), &opts())
            .await
            .unwrap();

        assert_eq!(
            handler.seen(),
            vec!["user.created", "user.updated", "session.created"]
        );
    }

    #[tokio::test]
    async fn test_handler_sees_committed_mirror() {
        let (_tmp, db) = open_db();
        let handler = Arc::new(RecordingHandler::default());
        let applier = EventApplier::new(Arc::clone(&db))
            .with_handler(Arc::clone(&handler) as Arc<dyn EventHandler>);

        applier
            .apply(&user_event("e1", "user.created", "u1", "t1"), &opts())
            .await
            .unwrap();

        assert_eq!(handler.users_present(), vec![true]);
    }

    #[tokio::test]
    async fn test_handler_failure_keep_recorded() {
        let (_tmp, db) = open_db();
        let handler = Arc::new(RecordingHandler::failing());
        let applier = EventApplier::new(Arc::clone(&db))
            .with_handler(Arc::clone(&handler) as Arc<dyn EventHandler>);
        let event = user_event("e1", "user.created", "u1", "t1");

        let err = applier.apply(&event, &opts()).await.unwrap_err();
        assert!(matches!(err, Error::Handler { ref event_id, .. } if event_id == "e1"));

        // Event and mirror change stay committed
        assert!(db.contains_event("e1").unwrap());
        assert!(db.get_user("u1").unwrap().is_some());

        // A retry is absorbed as a duplicate; the handler is not called again
        assert_eq!(
            applier.apply(&event, &opts()).await.unwrap(),
            ApplyOutcome::Duplicate
        );
        assert!(db.pending_handlers().unwrap().is_empty());
        assert_eq!(applier.retry_pending_handlers().await.unwrap(), 0);
        assert_eq!(handler.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_retry_queues_delivery() {
        let (_tmp, db) = open_db();
        let handler = Arc::new(RecordingHandler::failing());
        let applier = EventApplier::new(Arc::clone(&db))
            .with_handler(Arc::clone(&handler) as Arc<dyn EventHandler>)
            .with_failure_policy(HandlerFailurePolicy::Retry);
        let event = user_event("e1", "user.created", "u1", "t1");

        assert!(applier.apply(&event, &opts()).await.is_err());

        // The record stays; only the delivery is queued
        assert!(db.contains_event("e1").unwrap());
        assert!(db.get_user("u1").unwrap().is_some());
        let pending = db.pending_handlers().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event, event);
        assert_eq!(
            applier.apply(&event, &opts()).await.unwrap(),
            ApplyOutcome::Duplicate
        );

        // Still failing: attempted, kept queued, not an error
        assert_eq!(applier.retry_pending_handlers().await.unwrap(), 0);
        assert_eq!(db.pending_handlers().unwrap().len(), 1);
        assert_eq!(handler.seen().len(), 2);

        handler.set_failing(false);
        assert_eq!(applier.retry_pending_handlers().await.unwrap(), 1);
        assert!(db.pending_handlers().unwrap().is_empty());
        assert_eq!(handler.seen().len(), 3);

        // Successful first attempts leave nothing queued
        applier
            .apply(&user_event("e2", "user.created", "u2", "t1"), &opts())
            .await
            .unwrap();
        assert!(db.pending_handler("e2").unwrap().is_none());
        assert_eq!(applier.retry_pending_handlers().await.unwrap(), 0);
        assert_eq!(handler.seen().len(), 4);
    }

    #[tokio::test]
    async fn test_retry_skips_delivery_in_progress() {
        let (_tmp, db) = open_db();
        let handler = Arc::new(RecordingHandler::default().with_delay(Duration::from_millis(100)));
        let applier = EventApplier::new(Arc::clone(&db))
            .with_handler(Arc::clone(&handler) as Arc<dyn EventHandler>)
            .with_failure_policy(HandlerFailurePolicy::Retry);
        let event = user_event("e1", "user.created", "u1", "t1");

        let retry = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            applier.retry_pending_handlers().await.unwrap()
        };
        let (applied, retried) = tokio::join!(applier.apply(&event, &opts()), retry);

        assert!(applied.is_ok());
        assert_eq!(retried, 0);
        assert_eq!(handler.seen().len(), 1);
        assert!(db.pending_handlers().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_duplicate_applies() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .unwrap();

        runtime.block_on(async {
            let (_tmp, db) = open_db();
            let handler = Arc::new(RecordingHandler::default());
            let applier = Arc::new(
                EventApplier::new(Arc::clone(&db))
                    .with_handler(Arc::clone(&handler) as Arc<dyn EventHandler>),
            );
            let event = user_event("e1", "user.created", "u1", "t1");

            let tasks: Vec<_> = (0..16)
                .map(|_| {
                    let applier = Arc::clone(&applier);
                    let event = event.clone();
                    tokio::spawn(async move { applier.apply(&event, &opts()).await.unwrap() })
                })
                .collect();

            let mut recorded = 0;
            for task in tasks {
                if let ApplyOutcome::Recorded(_) = task.await.unwrap() {
                    recorded += 1;
                }
            }

            assert_eq!(recorded, 1);
            assert_eq!(db.event_count().unwrap(), 1);
            assert_eq!(handler.seen().len(), 1);
        });
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(
            "keep-recorded".parse::<HandlerFailurePolicy>().unwrap(),
            HandlerFailurePolicy::KeepRecorded
        );
        assert_eq!(
            "Retry".parse::<HandlerFailurePolicy>().unwrap(),
            HandlerFailurePolicy::Retry
        );
        assert!("sometimes".parse::<HandlerFailurePolicy>().is_err());
    }

    /// Counts samples of one histogram, ignores everything else.
    struct HistogramSamples {
        name: &'static str,
        samples: Arc<SampleCount>,
    }

    #[derive(Default)]
    struct SampleCount(AtomicUsize);

    impl HistogramFn for SampleCount {
        fn record(&self, _value: f64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Recorder for HistogramSamples {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
            Counter::noop()
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            if key.name() == self.name {
                Histogram::from_arc(Arc::clone(&self.samples))
            } else {
                Histogram::noop()
            }
        }
    }

    #[test]
    fn test_apply_duration_recorded_on_every_path() {
        let recorder = HistogramSamples {
            name: "usermirror_apply_duration_seconds",
            samples: Arc::new(SampleCount::default()),
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let (_tmp, db) = open_db();
                let handler = Arc::new(RecordingHandler::default());
                let applier = EventApplier::new(Arc::clone(&db))
                    .with_handler(Arc::clone(&handler) as Arc<dyn EventHandler>);
                let event = user_event("e1", "user.created", "u1", "t1");

                // Recorded, duplicate, handler failure
                applier.apply(&event, &opts()).await.unwrap();
                applier.apply(&event, &opts()).await.unwrap();
                handler.set_failing(true);
                let failed = applier
                    .apply(&user_event("e2", "user.created", "u2", "t1"), &opts())
                    .await;
                assert!(failed.is_err());
            })
        });

        assert_eq!(recorder.samples.0.load(Ordering::SeqCst), 3);
    }
}
