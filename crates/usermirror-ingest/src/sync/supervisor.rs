//! Single-slot supervisor for live sync runs.
//!
//! Webhooks arrive in bursts, and every one of them asks for "sync now". The
//! supervisor turns that into at most one running [`LiveSyncPuller`] where
//! the newest request wins:
//!
//! - Each [`IngestSupervisor::enqueue`] bumps an epoch published on a
//!   `watch` channel. Runs carry a [`RunToken`] for the epoch they were
//!   started under and stop at their next fetch or apply once it changes.
//! - A run lock serializes execution, so a fresh run only starts after the
//!   run it superseded has stepped aside.
//! - Runs that were superseded before they got the lock exit immediately.
//!
//! Nothing is rolled back when a run is superseded. The cursor is derived
//! from recorded events, so the next run picks up exactly where committed
//! progress ends.

use super::{IngestOptions, LiveSyncPuller};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cooperative cancellation handle for one live sync run.
#[derive(Debug, Clone)]
pub struct RunToken {
    epoch: u64,
    current: watch::Receiver<u64>,
}

impl RunToken {
    /// A token that is never superseded, for running the puller directly.
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(0);
        Self {
            epoch: 0,
            current: rx,
        }
    }

    /// A token for run `epoch`, superseded once `current` moves past it.
    pub(crate) fn subscribed(epoch: u64, current: watch::Receiver<u64>) -> Self {
        Self { epoch, current }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_superseded(&self) -> bool {
        *self.current.borrow() != self.epoch
    }

    /// Resolves once a newer run has been requested. Never resolves for a
    /// detached token.
    pub async fn superseded(&mut self) {
        loop {
            if *self.current.borrow_and_update() != self.epoch {
                return;
            }
            if self.current.changed().await.is_err() {
                // Sender gone: nobody can supersede this run any more
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Owns live sync executions: max one at a time, newest trigger wins.
pub struct IngestSupervisor {
    puller: Arc<LiveSyncPuller>,
    epoch: watch::Sender<u64>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    latest: Mutex<Option<JoinHandle<()>>>,
    skipped: Arc<AtomicU64>,
}

impl IngestSupervisor {
    pub fn new(puller: Arc<LiveSyncPuller>) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            puller,
            epoch,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            latest: Mutex::new(None),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Supersede any in-flight run and start a fresh one from the persisted
    /// cursor. Returns the new run's epoch.
    ///
    /// Must be called from within a Tokio runtime. Run failures are logged,
    /// never returned to the caller.
    pub fn enqueue(&self, options: IngestOptions) -> u64 {
        let mut latest = self.latest.lock();

        let mut epoch = 0;
        self.epoch.send_modify(|current| {
            *current += 1;
            epoch = *current;
        });

        let mut token = RunToken::subscribed(epoch, self.epoch.subscribe());
        let puller = Arc::clone(&self.puller);
        let run_lock = Arc::clone(&self.run_lock);
        let skipped = Arc::clone(&self.skipped);

        let handle = tokio::spawn(async move {
            let _running = run_lock.lock().await;
            if token.is_superseded() {
                tracing::debug!("Live sync run {} superseded before start", epoch);
                skipped.fetch_add(1, Ordering::Relaxed);
                counter!("usermirror_pull_runs_superseded_total").increment(1);
                return;
            }

            gauge!("usermirror_pull_in_progress").set(1.0);
            if let Err(e) = puller.run(&options, &mut token).await {
                tracing::error!("Live sync run {} failed: {}", epoch, e);
                counter!("usermirror_pull_errors_total").increment(1);
            }
            gauge!("usermirror_pull_in_progress").set(0.0);
        });

        if latest.replace(handle).is_some() {
            tracing::debug!("Live sync run {} supersedes the previous run", epoch);
        }
        epoch
    }

    /// Epoch of the most recent request (0 before the first).
    pub fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Runs that were superseded while still waiting for the run lock.
    pub fn runs_skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Whether a run is queued or executing.
    pub fn is_busy(&self) -> bool {
        self.latest
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait until the most recently requested run, and therefore every run
    /// before it, has finished.
    pub async fn wait_idle(&self) {
        loop {
            let Some(handle) = self.latest.lock().take() else {
                return;
            };
            if let Err(e) = handle.await {
                tracing::warn!("Live sync task failed: {}", e);
            }
        }
    }
}
