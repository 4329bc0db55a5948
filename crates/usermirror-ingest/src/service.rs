//! Entry points exposed to collaborators.
//!
//! [`UserSync`] wires one [`EventApplier`] into both the live sync
//! supervisor and the backfill reconciler, and exposes the three calls the
//! rest of the system makes: trigger ingestion, run a reconciliation pass,
//! and look up a mirrored user.

use crate::apply::{EventApplier, EventHandler, HandlerFailurePolicy};
use crate::config::Config;
use crate::error::Result;
use crate::feed::EventFeed;
use crate::store::MirrorDb;
use crate::sync::{
    BackfillOptions, BackfillReconciler, BackfillReport, IngestOptions, IngestSupervisor,
    LiveSyncPuller,
};
use std::sync::Arc;
use usermirror_core::UserRecord;

/// The user mirror service.
pub struct UserSync {
    db: Arc<MirrorDb>,
    supervisor: IngestSupervisor,
    reconciler: Arc<BackfillReconciler>,
}

impl UserSync {
    pub fn new(
        db: Arc<MirrorDb>,
        feed: Arc<dyn EventFeed>,
        handler: Option<Arc<dyn EventHandler>>,
        failure_policy: HandlerFailurePolicy,
    ) -> Self {
        let mut applier = EventApplier::new(Arc::clone(&db)).with_failure_policy(failure_policy);
        if let Some(handler) = handler {
            applier = applier.with_handler(handler);
        }
        let applier = Arc::new(applier);

        let puller = LiveSyncPuller::new(Arc::clone(&feed), Arc::clone(&applier));
        let reconciler = BackfillReconciler::new(feed, applier);

        Self {
            db,
            supervisor: IngestSupervisor::new(Arc::new(puller)),
            reconciler: Arc::new(reconciler),
        }
    }

    /// Build the service with the settings `config` carries for it.
    pub fn from_config(
        db: Arc<MirrorDb>,
        feed: Arc<dyn EventFeed>,
        handler: Option<Arc<dyn EventHandler>>,
        config: &Config,
    ) -> Self {
        Self::new(db, feed, handler, config.handler_failure_policy)
    }

    /// Trigger live sync. Supersedes any run in progress and returns
    /// immediately with the new run's epoch; failures only show up in logs
    /// and metrics.
    pub fn enqueue_ingest(&self, options: IngestOptions) -> u64 {
        self.supervisor.enqueue(options)
    }

    /// Wait for the latest triggered live sync run to finish.
    pub async fn wait_for_ingest(&self) {
        self.supervisor.wait_idle().await;
    }

    /// One reconciliation pass. Independent of live sync.
    pub async fn run_backfill(&self, options: &BackfillOptions) -> Result<BackfillReport> {
        self.reconciler.run(options).await
    }

    /// Point lookup in the user mirror.
    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        self.db.get_user(user_id)
    }

    pub fn db(&self) -> &Arc<MirrorDb> {
        &self.db
    }

    pub fn supervisor(&self) -> &IngestSupervisor {
        &self.supervisor
    }

    /// Shared handle for running reconciliation on its own task.
    pub fn reconciler(&self) -> Arc<BackfillReconciler> {
        Arc::clone(&self.reconciler)
    }
}
