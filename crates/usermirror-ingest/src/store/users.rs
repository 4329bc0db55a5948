//! User mirror reads. Writes happen only inside a [`super::MirrorTxn`].

use super::{CF_USERS, MirrorDb};
use crate::error::Result;
use rocksdb::IteratorMode;
use usermirror_core::UserRecord;

impl MirrorDb {
    /// Point lookup of a mirrored user.
    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let cf = self.cf(CF_USERS)?;
        match self.db.get_pinned_cf(&cf, user_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Exact number of mirrored users (full scan).
    pub fn user_count(&self) -> Result<usize> {
        let cf = self.cf(CF_USERS)?;
        let mut count = 0usize;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}
