//! Reconciliation checkpoint.
//!
//! The checkpoint names the last event a full reconciliation walk has seen.
//! Its creation time only ever moves forward.

use super::{CF_META, CHECKPOINT_KEY, MirrorDb};
use crate::error::Result;
use usermirror_core::Checkpoint;

impl MirrorDb {
    /// Read the current checkpoint, `None` before the first completed walk.
    pub fn checkpoint(&self) -> Result<Option<Checkpoint>> {
        let cf = self.cf(CF_META)?;
        match self.db.get_pinned_cf(&cf, CHECKPOINT_KEY)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Move the checkpoint to `event_id`.
    ///
    /// The stored creation time becomes the larger of the current one and the
    /// event's own, so the watermark never regresses even when the walk ends
    /// on an event that was recorded earlier than the previous checkpoint.
    /// An event id that was never recorded leaves the checkpoint untouched.
    pub fn advance_checkpoint(&self, event_id: &str) -> Result<Option<Checkpoint>> {
        let mut txn = self.begin();
        let current = txn.checkpoint()?;

        let Some(event) = txn.get_event(event_id)? else {
            tracing::warn!(
                "Not advancing checkpoint: event {} is not recorded",
                event_id
            );
            return Ok(current);
        };

        let creation_time = current
            .as_ref()
            .map_or(event.creation_time, |c| c.creation_time.max(event.creation_time));

        let next = Checkpoint {
            event_id: event_id.to_string(),
            creation_time,
        };
        if current.as_ref() == Some(&next) {
            return Ok(current);
        }

        txn.put_checkpoint(&next)?;
        txn.commit()?;

        tracing::debug!(
            "Checkpoint advanced to {} (creation time {})",
            next.event_id,
            next.creation_time
        );
        Ok(Some(next))
    }
}
