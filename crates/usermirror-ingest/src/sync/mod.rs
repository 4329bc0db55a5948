//! Live sync and reconciliation.
//!
//! Two independent paths feed the same [`crate::EventApplier`]:
//!
//! ```text
//! ┌──────────────────────┐       ┌──────────────────────┐
//! │   IngestSupervisor   │       │  BackfillReconciler  │
//! │ (one run, newest wins)│       │ (periodic / manual)  │
//! └──────────┬───────────┘       └──────────┬───────────┘
//!            │ LiveSyncPuller               │ gap detection per page
//!            │ from newest recorded event   │ from checkpoint
//!            └─────────────┬────────────────┘
//!                          ▼
//!                ┌──────────────────┐
//!                │   EventApplier   │  dedup + LWW
//!                └──────────────────┘
//! ```
//!
//! The puller is fast and cheap but can miss events (dropped webhooks,
//! superseded runs, feed hiccups). The reconciler walks forward from the
//! last verified checkpoint and applies whatever the event store lacks.
//! Neither needs mutual exclusion with the other: all correctness rests on
//! the applier's dedup check.

mod backfill;
mod puller;
mod supervisor;

pub use backfill::{BackfillOptions, BackfillReconciler, BackfillReport};
pub use puller::{IngestOptions, LiveSyncPuller, PullReport};
pub use supervisor::{IngestSupervisor, RunToken};
