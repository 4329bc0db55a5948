//! RocksDB-backed durable state for the mirror.
//!
//! One database holds every relation the pipeline owns, each in its own
//! column family:
//!
//! | Column family      | Key                                 | Value                 |
//! |--------------------|-------------------------------------|-----------------------|
//! | `events`           | event id                            | JSON `EventRecord`    |
//! | `events_by_time`   | `[creation_time_be (8)][event id]`  | empty                 |
//! | `users`            | user id                             | JSON `UserRecord`     |
//! | `meta`             | `backfill_checkpoint`               | JSON `Checkpoint`     |
//! | `pending_handlers` | event id                            | JSON `PendingHandler` |
//!
//! Big-endian creation time as the leading bytes of `events_by_time` makes an
//! ordered scan return events in insertion order, so the live sync cursor is
//! simply the last key.
//!
//! # Units of work
//!
//! All mutation goes through a [`MirrorTxn`] obtained from [`MirrorDb::begin`].
//! A transaction holds the database's single writer lock for its lifetime and
//! buffers its writes in a `WriteBatch`, so a read-check-then-write sequence
//! (e.g. "is this event new? then record it") is atomic with respect to every
//! other writer. Dropping a transaction without committing discards it.
//!
//! Recorded events are never deleted. The dedup check, the live sync cursor
//! and the reconciliation checkpoint all rely on that.

mod checkpoint;
mod events;
mod pending;
mod users;

use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch, WriteOptions,
};
use std::path::Path;
use std::sync::Arc;
use usermirror_core::{Checkpoint, EventRecord, PendingHandler, UserRecord};

pub(crate) const CF_EVENTS: &str = "events";
pub(crate) const CF_EVENTS_BY_TIME: &str = "events_by_time";
pub(crate) const CF_USERS: &str = "users";
pub(crate) const CF_META: &str = "meta";
pub(crate) const CF_PENDING_HANDLERS: &str = "pending_handlers";

const COLUMN_FAMILIES: [&str; 5] = [
    CF_EVENTS,
    CF_EVENTS_BY_TIME,
    CF_USERS,
    CF_META,
    CF_PENDING_HANDLERS,
];

pub(crate) const CHECKPOINT_KEY: &[u8] = b"backfill_checkpoint";

type Db = DBWithThreadMode<MultiThreaded>;

/// Durable event store, user mirror and checkpoint.
///
/// Thread-safe: share it via `Arc<MirrorDb>`.
pub struct MirrorDb {
    db: Db,
    /// Writer lock. Guards the last creation time handed out.
    writer: Mutex<u64>,
}

impl MirrorDb {
    /// Open or create the mirror database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Opening mirror database at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_write_buffer_size(16 * 1024 * 1024); // 16MB write buffer
        opts.set_max_write_buffer_number(2);
        opts.increase_parallelism(num_cpus::get().min(4) as i32);

        let descriptors = COLUMN_FAMILIES.iter().map(|name| {
            let mut cf_opts = Options::default();
            cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            if *name == CF_EVENTS || *name == CF_USERS {
                // Point lookups dominate; bloom filters make misses cheap
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                cf_opts.set_block_based_table_factory(&block_opts);
            }
            ColumnFamilyDescriptor::new(*name, cf_opts)
        });

        let db = Db::open_cf_descriptors(&opts, path, descriptors)?;
        let last_creation_time = newest_creation_time(&db)?;

        tracing::debug!(
            "Mirror database opened, newest creation time {}",
            last_creation_time
        );

        Ok(Self {
            db,
            writer: Mutex::new(last_creation_time),
        })
    }

    /// Start a unit of work. Blocks until no other unit is in progress.
    pub fn begin(&self) -> MirrorTxn<'_> {
        MirrorTxn {
            db: self,
            last_creation_time: self.writer.lock(),
            batch: WriteBatch::default(),
        }
    }

    pub(crate) fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>> {
        cf_handle(&self.db, name)
    }

    /// Approximate key count for a column family.
    fn approximate_keys(&self, name: &'static str) -> Result<u64> {
        let cf = self.cf(name)?;
        Ok(self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }

    /// Flush all column families to disk.
    pub fn flush(&self) -> Result<()> {
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            self.db.flush_cf(&cf)?;
        }
        Ok(())
    }

    /// Get statistics about the database.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            approximate_events: self.approximate_keys(CF_EVENTS).unwrap_or(0),
            approximate_users: self.approximate_keys(CF_USERS).unwrap_or(0),
        }
    }
}

/// Statistics about the mirror database.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Approximate number of recorded events.
    pub approximate_events: u64,
    /// Approximate number of mirrored users.
    pub approximate_users: u64,
}

/// An atomic unit of work against [`MirrorDb`].
///
/// Reads go to committed state. Writes are buffered until [`MirrorTxn::commit`].
pub struct MirrorTxn<'a> {
    db: &'a MirrorDb,
    last_creation_time: MutexGuard<'a, u64>,
    batch: WriteBatch,
}

impl<'a> MirrorTxn<'a> {
    /// Whether an event with this id has been recorded.
    pub fn contains_event(&self, event_id: &str) -> Result<bool> {
        self.db.contains_event(event_id)
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<EventRecord>> {
        self.db.get_event(event_id)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        self.db.get_user(user_id)
    }

    pub fn checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.db.checkpoint()
    }

    /// Record a new event, assigning it the next creation time.
    pub fn record_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        recorded_updated_at: Option<&str>,
    ) -> Result<EventRecord> {
        let creation_time = next_creation_time(now_micros(), *self.last_creation_time);
        *self.last_creation_time = creation_time;

        let record = EventRecord {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            recorded_updated_at: recorded_updated_at.map(str::to_string),
            creation_time,
        };

        let db = self.db;
        let events = db.cf(CF_EVENTS)?;
        let by_time = db.cf(CF_EVENTS_BY_TIME)?;
        self.batch
            .put_cf(&events, event_id.as_bytes(), serde_json::to_vec(&record)?);
        self.batch
            .put_cf(&by_time, time_key(creation_time, event_id), []);

        Ok(record)
    }

    pub fn put_user(&mut self, user: &UserRecord) -> Result<()> {
        let db = self.db;
        let users = db.cf(CF_USERS)?;
        self.batch
            .put_cf(&users, user.id.as_bytes(), serde_json::to_vec(user)?);
        Ok(())
    }

    pub fn delete_user(&mut self, user_id: &str) -> Result<()> {
        let db = self.db;
        let users = db.cf(CF_USERS)?;
        self.batch.delete_cf(&users, user_id.as_bytes());
        Ok(())
    }

    pub fn put_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let db = self.db;
        let meta = db.cf(CF_META)?;
        self.batch
            .put_cf(&meta, CHECKPOINT_KEY, serde_json::to_vec(checkpoint)?);
        Ok(())
    }

    /// Queue a handler delivery for retry.
    pub fn put_pending_handler(&mut self, pending: &PendingHandler) -> Result<()> {
        let db = self.db;
        let cf = db.cf(CF_PENDING_HANDLERS)?;
        self.batch.put_cf(
            &cf,
            pending.event.id.as_bytes(),
            serde_json::to_vec(pending)?,
        );
        Ok(())
    }

    pub fn clear_pending_handler(&mut self, event_id: &str) -> Result<()> {
        let db = self.db;
        let cf = db.cf(CF_PENDING_HANDLERS)?;
        self.batch.delete_cf(&cf, event_id.as_bytes());
        Ok(())
    }

    /// Atomically write everything buffered in this unit.
    pub fn commit(self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true); // Ensure durability
        self.db.db.write_opt(self.batch, &write_opts)?;
        Ok(())
    }
}

fn cf_handle<'a>(db: &'a Db, name: &'static str) -> Result<Arc<BoundColumnFamily<'a>>> {
    db.cf_handle(name)
        .ok_or_else(|| Error::Store(format!("missing column family '{name}'")))
}

/// Build an `events_by_time` key.
///
/// Key format: `[creation_time_be (8 bytes)][event_id]`
pub(crate) fn time_key(creation_time: u64, event_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + event_id.len());
    key.extend_from_slice(&creation_time.to_be_bytes()); // Big-endian for sorting
    key.extend_from_slice(event_id.as_bytes());
    key
}

/// Parse an `events_by_time` key into (creation_time, event_id).
pub(crate) fn parse_time_key(key: &[u8]) -> Option<(u64, String)> {
    if key.len() < 8 {
        return None;
    }
    let creation_time = u64::from_be_bytes(key[0..8].try_into().ok()?);
    let event_id = std::str::from_utf8(&key[8..]).ok()?.to_string();
    Some((creation_time, event_id))
}

/// Read the newest creation time from the time index, 0 when empty.
fn newest_creation_time(db: &Db) -> Result<u64> {
    let by_time = cf_handle(db, CF_EVENTS_BY_TIME)?;
    match db.iterator_cf(&by_time, IteratorMode::End).next() {
        Some(item) => {
            let (key, _) = item?;
            parse_time_key(&key)
                .map(|(ts, _)| ts)
                .ok_or_else(|| Error::Store("malformed events_by_time key".to_string()))
        }
        None => Ok(0),
    }
}

/// Creation times are strictly increasing, even if the wall clock stalls or
/// steps backwards.
fn next_creation_time(now: u64, last: u64) -> u64 {
    now.max(last.saturating_add(1))
}

fn now_micros() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}
