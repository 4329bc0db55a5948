//! usermirror ingestion and reconciliation pipeline.
//!
//! This crate keeps a local mirror of upstream user records in step with a
//! remote, cursor-paginated event feed. Every upstream event is applied
//! exactly once even though the feed, the webhooks that trigger ingestion,
//! and the process itself are all unreliable.
//!
//! # Modules
//!
//! - [`store`] - RocksDB-backed event store, user mirror and checkpoint
//! - [`apply`] - Idempotent per-event apply step with last-writer-wins
//! - [`feed`] - Remote event feed trait and HTTP client
//! - [`sync`] - Live sync puller, its single-slot supervisor, and the backfill reconciler
//! - [`service`] - The entry points exposed to collaborators
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐       ┌──────────────────┐
//! │  Live Sync Pull  │       │ Backfill Reconcile│
//! │ (webhook trigger)│       │ (periodic/manual) │
//! └────────┬─────────┘       └────────┬─────────┘
//!          │ FeedEvent                │ FeedEvent (missing only)
//!          └──────────┬───────────────┘
//!                     ▼
//!          ┌──────────────────────────┐
//!          │      EventApplier        │  dedup by event id, LWW on updated_at
//!          └────────────┬─────────────┘
//!                       ▼
//!          ┌──────────────────────────┐
//!          │        MirrorDb          │  events | events_by_time | users | meta | pending_handlers
//!          └──────────────────────────┘
//! ```
//!
//! Both paths share one applier and one dedup key space, so they can overlap
//! freely. The live sync cursor is always derived from the newest recorded
//! event; the reconciliation checkpoint only moves after a full forward walk.

use std::future::Future;
use std::pin::Pin;

pub mod apply;
pub mod config;
pub mod error;
pub mod feed;
pub mod log;
pub mod service;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

/// Boxed, sendable future used at the crate's async trait seams.
pub type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use error::{BoxError, Error, Result};

pub use apply::{
    ApplyOptions, ApplyOutcome, EventApplier, EventHandler, HandlerEvent, HandlerFailurePolicy,
    MirrorChange,
};
pub use config::Config;
pub use feed::{EventFeed, HttpEventFeed, HttpFeedConfig};
pub use log::{LogLevel, RunLog};
pub use service::UserSync;
pub use store::{MirrorDb, MirrorTxn, StoreStats};
pub use sync::{
    BackfillOptions, BackfillReconciler, BackfillReport, IngestOptions, IngestSupervisor,
    LiveSyncPuller, PullReport, RunToken,
};
