//! Resumable expiration sweeper.
//!
//! Each batch runs in one write transaction and visits objects starting
//! from the cursor left by the previous batch. Work is bounded on both
//! swept objects and deleted events; hitting the end of a shard advances
//! the cursor to the next shard and counts as one swept object, so a batch
//! always makes progress even over empty shards. A batch that deleted
//! nothing rolls its transaction back so an idle table never dirties disk.

use std::ops::Bound;
use std::time::Instant;

use fjall::{TxPartitionHandle, WriteTransaction};
use time::OffsetDateTime;
use tracing::debug;

use super::codec::encode_timestamp_key;
use super::error::{Result, TableError};
use super::keys;
use super::store::Table;

/// Counts returned by one sweep batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub swept_objects: usize,
    pub deleted_events: usize,
    pub deleted_objects: usize,
}

/// Cross-batch position, held in memory behind the table lock.
#[derive(Debug, Default)]
pub(crate) struct SweepCursor {
    pub shard: usize,
    /// Frame prefix of the last fully swept object. Cursor keys are cloned
    /// out of their transaction before being stored here.
    pub object: Option<Vec<u8>>,
}

impl Table {
    /// Delete events older than `horizon` in one bounded batch, resuming
    /// where the previous batch stopped. A closed table sweeps nothing.
    pub fn sweep_next_batch(&self, horizon: time::Duration) -> Result<SweepStats> {
        let _guard = self.lock.lock().expect("table lock poisoned");
        let Ok(core) = self.core() else {
            return Ok(SweepStats::default());
        };
        let schema = core.schema.read().expect("schema lock poisoned").clone();
        let shard_count = schema.shard_count;
        let batch = self.options.sweep_batch_size;
        let bound = encode_timestamp_key(OffsetDateTime::now_utc() - horizon);

        let mut cursor = self.sweep_cursor.lock().expect("sweep cursor poisoned");
        let mut stats = SweepStats::default();
        let mut rollovers: i64 = 0;
        let started = Instant::now();
        let mut tx = core.keyspace.write_tx();

        while stats.swept_objects < batch && stats.deleted_events < batch {
            let shard = &core.shards[cursor.shard];

            // Position: first object of the shard, or the one after the
            // last visited object.
            let position = match &cursor.object {
                None => first_key(&mut tx, shard)?,
                Some(prefix) => key_after(&mut tx, shard, prefix)?,
            };
            let Some(first_key) = position else {
                // Shard exhausted; roll over. This counts as a swept object
                // so the batch terminates even when every shard is empty.
                cursor.shard = (cursor.shard + 1) % shard_count;
                cursor.object = None;
                rollovers += 1;
                stats.swept_objects += 1;
                continue;
            };
            let Some((prefix, _)) = keys::split_event_key(&first_key) else {
                return Err(TableError::Encoding(
                    "malformed event key encountered during sweep".to_string(),
                ));
            };
            let prefix = prefix.to_vec();

            // Delete this object's expired events, up to the batch cap.
            let remaining = batch - stats.deleted_events;
            let mut upper = prefix.clone();
            upper.extend_from_slice(&bound);
            let mut doomed: Vec<Vec<u8>> = Vec::new();
            let mut truncated = false;
            for item in tx.range(shard, (Bound::Included(prefix.clone()), Bound::Excluded(upper)))
            {
                let (key, _) = item?;
                if doomed.len() == remaining {
                    truncated = true;
                    break;
                }
                doomed.push(key.to_vec());
            }
            for key in &doomed {
                tx.remove(shard, key.clone());
            }
            stats.deleted_events += doomed.len();
            stats.swept_objects += 1;

            if truncated {
                // Cap reached mid-object; leave the cursor before this
                // object so the next batch picks it up again.
                break;
            }

            if !doomed.is_empty() && object_is_empty(&mut tx, shard, &prefix)? {
                stats.deleted_objects += 1;
            }
            cursor.object = Some(prefix);
        }

        let tags = self.tags();
        self.sink.count("expiration.sweep", 1, tags);
        if rollovers > 0 {
            self.sink.count("expiration.rollover", rollovers, tags);
        }

        if stats.deleted_events == 0 && stats.deleted_objects == 0 {
            // Nothing to flush; a no-op commit would still dirty pages.
            tx.rollback();
            self.emit_write_delta(&core, started);
            debug!(
                table = %self.name(),
                swept = stats.swept_objects,
                "sweep batch empty, rolled back"
            );
            return Ok(stats);
        }

        let committed = tx.commit();
        self.emit_write_delta(&core, started);
        committed.map_err(|e| TableError::Storage(e).in_op("sweep_next_batch", self.name()))?;

        if stats.deleted_events > 0 {
            self.sink
                .count("expiration.events", stats.deleted_events as i64, tags);
        }
        if stats.deleted_objects > 0 {
            self.sink
                .count("expiration.objects", stats.deleted_objects as i64, tags);
        }
        debug!(
            table = %self.name(),
            swept = stats.swept_objects,
            deleted_events = stats.deleted_events,
            deleted_objects = stats.deleted_objects,
            "sweep batch committed"
        );
        Ok(stats)
    }
}

fn first_key(
    tx: &mut WriteTransaction<'_>,
    shard: &TxPartitionHandle,
) -> Result<Option<Vec<u8>>> {
    match tx.iter(shard).next() {
        Some(item) => {
            let (key, _) = item?;
            Ok(Some(key.to_vec()))
        }
        None => Ok(None),
    }
}

/// First key strictly after every event of the object identified by
/// `prefix`.
fn key_after(
    tx: &mut WriteTransaction<'_>,
    shard: &TxPartitionHandle,
    prefix: &[u8],
) -> Result<Option<Vec<u8>>> {
    let upper = keys::object_upper_bound(prefix);
    match tx
        .range(shard, (Bound::Excluded(upper), Bound::<Vec<u8>>::Unbounded))
        .next()
    {
        Some(item) => {
            let (key, _) = item?;
            Ok(Some(key.to_vec()))
        }
        None => Ok(None),
    }
}

fn object_is_empty(
    tx: &mut WriteTransaction<'_>,
    shard: &TxPartitionHandle,
    prefix: &[u8],
) -> Result<bool> {
    match tx.prefix(shard, prefix.to_vec()).next() {
        Some(item) => {
            item?;
            Ok(false)
        }
        None => Ok(true),
    }
}
