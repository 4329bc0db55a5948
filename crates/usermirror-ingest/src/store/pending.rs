//! Handler deliveries waiting for a retry.
//!
//! Entries are written next to the event record they belong to and removed
//! once the handler succeeds. The event record itself stays put either way.

use super::{CF_PENDING_HANDLERS, MirrorDb};
use crate::error::Result;
use rocksdb::IteratorMode;
use usermirror_core::PendingHandler;

impl MirrorDb {
    pub fn pending_handler(&self, event_id: &str) -> Result<Option<PendingHandler>> {
        let cf = self.cf(CF_PENDING_HANDLERS)?;
        match self.db.get_pinned_cf(&cf, event_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Every queued delivery, oldest event first.
    pub fn pending_handlers(&self) -> Result<Vec<PendingHandler>> {
        let cf = self.cf(CF_PENDING_HANDLERS)?;
        let mut pending = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            pending.push(serde_json::from_slice::<PendingHandler>(&value)?);
        }
        pending.sort_by_key(|p| p.creation_time);
        Ok(pending)
    }

    /// Drop a queued delivery after its handler succeeded.
    pub fn clear_pending_handler(&self, event_id: &str) -> Result<()> {
        let mut txn = self.begin();
        txn.clear_pending_handler(event_id)?;
        txn.commit()
    }
}
