//! Core types, errors, and shared utilities for the usermirror pipeline.
//!
//! This crate provides:
//! - Wire types for the remote paginated event feed ([`FeedEvent`], [`EventPage`])
//! - Durable record types for the local mirror ([`EventRecord`], [`UserRecord`], [`Checkpoint`])
//! - The closed set of event kinds the pipeline understands ([`EventKind`])
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Default lookback for the very first live sync run (7 days).
pub const DEFAULT_INITIAL_RANGE_HOURS: u64 = 168;

/// Default page size requested from the remote feed.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

pub use error::{Error, Result};
pub use event::{
    Checkpoint, DEFAULT_EVENT_TYPES, EventKind, EventPage, EventRecord, FeedEvent,
    ListEventsRequest, ListMetadata, PendingHandler, USER_CREATED, USER_DELETED, USER_UPDATED,
    UserRecord, event_type_filter,
};
