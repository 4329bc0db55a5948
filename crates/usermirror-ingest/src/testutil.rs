//! Shared fixtures for unit tests.

use crate::BoxedFuture;
use crate::apply::{EventHandler, HandlerEvent};
use crate::error::{BoxError, Error, Result};
use crate::feed::EventFeed;
use crate::store::MirrorDb;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use usermirror_core::{EventPage, FeedEvent, ListEventsRequest, ListMetadata};

/// Open a fresh mirror database in a temp dir. Keep the dir alive.
pub fn open_db() -> (TempDir, Arc<MirrorDb>) {
    let tmp = TempDir::new().unwrap();
    let db = MirrorDb::open(tmp.path()).unwrap();
    (tmp, Arc::new(db))
}

/// A feed event whose payload is a minimal user object.
pub fn user_event(id: &str, event_type: &str, user_id: &str, updated_at: &str) -> FeedEvent {
    FeedEvent {
        id: id.to_string(),
        event_type: event_type.to_string(),
        created_at: updated_at.to_string(),
        data: json!({
            "object": "user",
            "id": user_id,
            "email": format!("{user_id}@example.com"),
            "first_name": "Test",
            "updated_at": updated_at,
        }),
    }
}

/// Handler that records what it saw and can be told to fail.
#[derive(Default)]
pub struct RecordingHandler {
    failing: AtomicBool,
    /// Fail only for this user id.
    failing_user: Mutex<Option<String>>,
    delay: Option<Duration>,
    seen: Mutex<Vec<String>>,
    seen_users: Mutex<Vec<String>>,
    users_present: Mutex<Vec<bool>>,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        let handler = Self::default();
        handler.set_failing(true);
        handler
    }

    /// Sleep this long inside every invocation, before deciding the result.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_failing_user(&self, user_id: Option<&str>) {
        *self.failing_user.lock() = user_id.map(str::to_string);
    }

    /// Event types of every invocation, failed ones included.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    /// Payload user ids of every invocation, failed ones included.
    pub fn seen_users(&self) -> Vec<String> {
        self.seen_users.lock().clone()
    }

    /// For each invocation, whether the payload's user was in the mirror.
    pub fn users_present(&self) -> Vec<bool> {
        self.users_present.lock().clone()
    }
}

impl EventHandler for RecordingHandler {
    fn handle<'a>(
        &'a self,
        db: &'a MirrorDb,
        event: HandlerEvent<'a>,
    ) -> BoxedFuture<'a, std::result::Result<(), BoxError>> {
        Box::pin(async move {
            self.seen.lock().push(event.event_type.to_string());
            let user_id = event.data.get("id").and_then(|v| v.as_str());
            if let Some(user_id) = user_id {
                self.seen_users.lock().push(user_id.to_string());
                let present = db.get_user(user_id)?.is_some();
                self.users_present.lock().push(present);
            }

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let user_failing = user_id.is_some() && self.failing_user.lock().as_deref() == user_id;
            if self.failing.load(Ordering::SeqCst) || user_failing {
                return Err("handler failed".into());
            }
            Ok(())
        })
    }
}

/// In-memory feed with the upstream paging contract.
///
/// The cursor is the id of the last event on a page and is only returned
/// while more events remain. `range_start` is recorded but not applied.
pub struct MemoryFeed {
    events: Mutex<Vec<FeedEvent>>,
    page_size: usize,
    delay: Option<Duration>,
    /// Calls allowed to succeed before every call fails.
    fail_after: AtomicUsize,
    requests: Mutex<Vec<ListEventsRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryFeed {
    pub fn new(page_size: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            page_size: page_size.max(1),
            delay: None,
            fail_after: AtomicUsize::new(usize::MAX),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, event: FeedEvent) {
        self.events.lock().push(event);
    }

    /// Let the next `calls` requests succeed, then fail every request.
    pub fn fail_after(&self, calls: usize) {
        self.fail_after.store(calls, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ListEventsRequest> {
        self.requests.lock().clone()
    }

    /// Highest number of concurrent `list_events` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `list_events` calls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn page(&self, request: &ListEventsRequest) -> Result<EventPage> {
        let events = self.events.lock();
        let matching: Vec<&FeedEvent> = events
            .iter()
            .filter(|e| request.event_types.is_empty() || request.event_types.contains(&e.event_type))
            .collect();

        let start = match &request.after {
            Some(cursor) => match matching.iter().position(|e| &e.id == cursor) {
                Some(pos) => pos + 1,
                None => {
                    return Err(Error::Feed {
                        status: 400,
                        body: format!("unknown cursor {cursor}"),
                    });
                }
            },
            None => 0,
        };

        let end = (start + self.page_size).min(matching.len());
        let data: Vec<FeedEvent> = matching[start..end].iter().map(|e| (*e).clone()).collect();
        let after = if end < matching.len() {
            data.last().map(|e| e.id.clone())
        } else {
            None
        };

        Ok(EventPage {
            data,
            list_metadata: ListMetadata { after },
        })
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EventFeed for MemoryFeed {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn list_events<'a>(&'a self, request: &'a ListEventsRequest) -> BoxedFuture<'a, Result<EventPage>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlight(&self.in_flight);
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            self.requests.lock().push(request.clone());

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let allowed = self
                .fail_after
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(Error::Feed {
                    status: 503,
                    body: "feed unavailable".to_string(),
                });
            }

            self.page(request)
        })
    }
}
