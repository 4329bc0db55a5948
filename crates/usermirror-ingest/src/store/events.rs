//! Event store: the dedup key space and the derived live sync cursor.

use super::{CF_EVENTS, CF_EVENTS_BY_TIME, MirrorDb, parse_time_key};
use crate::error::{Error, Result};
use rocksdb::IteratorMode;
use std::collections::HashSet;
use usermirror_core::EventRecord;

impl MirrorDb {
    /// Look up a recorded event by upstream id.
    pub fn get_event(&self, event_id: &str) -> Result<Option<EventRecord>> {
        let cf = self.cf(CF_EVENTS)?;
        match self.db.get_pinned_cf(&cf, event_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Check if an event id has been recorded.
    pub fn contains_event(&self, event_id: &str) -> Result<bool> {
        let cf = self.cf(CF_EVENTS)?;
        Ok(self.db.get_pinned_cf(&cf, event_id.as_bytes())?.is_some())
    }

    /// The most recently recorded event, by insertion order.
    ///
    /// This is the live sync cursor. It is always read from the store rather
    /// than cached, so it can never drift from what has actually been applied.
    pub fn latest_event(&self) -> Result<Option<EventRecord>> {
        let by_time = self.cf(CF_EVENTS_BY_TIME)?;
        let Some(item) = self.db.iterator_cf(&by_time, IteratorMode::End).next() else {
            return Ok(None);
        };
        let (key, _) = item?;
        let (_, event_id) = parse_time_key(&key)
            .ok_or_else(|| Error::Store("malformed events_by_time key".to_string()))?;
        self.get_event(&event_id)
    }

    /// Return the subset of `event_ids` that have not been recorded.
    ///
    /// One batched lookup per call; used by reconciliation once per page.
    pub fn missing_event_ids<S: AsRef<str>>(&self, event_ids: &[S]) -> Result<HashSet<String>> {
        let cf = self.cf(CF_EVENTS)?;
        let results = self
            .db
            .multi_get_cf(event_ids.iter().map(|id| (&cf, id.as_ref().as_bytes())));

        let mut missing = HashSet::new();
        for (id, result) in event_ids.iter().zip(results) {
            if result?.is_none() {
                missing.insert(id.as_ref().to_string());
            }
        }
        Ok(missing)
    }

    /// All recorded events in insertion order.
    ///
    /// Full scan; intended for tooling and tests, not the hot path.
    pub fn events_in_order(&self) -> Result<Vec<EventRecord>> {
        let by_time = self.cf(CF_EVENTS_BY_TIME)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&by_time, IteratorMode::Start) {
            let (key, _) = item?;
            let Some((_, event_id)) = parse_time_key(&key) else {
                continue;
            };
            if let Some(record) = self.get_event(&event_id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Exact number of recorded events (full scan of the time index).
    pub fn event_count(&self) -> Result<usize> {
        let by_time = self.cf(CF_EVENTS_BY_TIME)?;
        let mut count = 0usize;
        for item in self.db.iterator_cf(&by_time, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}
