//! Remote event feed.
//!
//! The feed is a forward-only, cursor-paginated list of events. Events are
//! delivered in creation order within a page and across pages when the
//! `after` cursor is followed.
//!
//! # Available Feeds
//!
//! - [`HttpEventFeed`] - The upstream `GET /events` HTTP API

mod http;

pub use http::{HttpEventFeed, HttpFeedConfig};

use crate::BoxedFuture;
use crate::Result;
use std::sync::Arc;
use usermirror_core::{EventPage, ListEventsRequest};

/// A source of paginated events.
///
/// Implementations must be cheap to call repeatedly; the puller and the
/// reconciler each issue one call per page.
pub trait EventFeed: Send + Sync {
    /// Human-readable name for this feed (used in logs).
    fn name(&self) -> &'static str;

    /// Fetch one page of events.
    fn list_events<'a>(&'a self, request: &'a ListEventsRequest) -> BoxedFuture<'a, Result<EventPage>>;
}

impl<T: EventFeed + ?Sized> EventFeed for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn list_events<'a>(&'a self, request: &'a ListEventsRequest) -> BoxedFuture<'a, Result<EventPage>> {
        (**self).list_events(request)
    }
}
