//! Factor dictionary: a persistent bijection between string values and
//! small integer indices, one dictionary per factor-typed property.
//!
//! Both directions live in the property's factor partition; a bounded LRU
//! per direction fronts the bucket as a read accelerator. The cache is
//! strictly a subset of the bucket: entries created inside a write
//! transaction are staged and only published to the LRU after the
//! transaction commits, so a rollback leaves the cache coherent.

use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Instant;

use fjall::{ReadTransaction, TxPartitionHandle, WriteTransaction};
use lru::LruCache;

use super::error::{Result, TableError};
use super::keys::{factor_forward_key, factor_reverse_key, FACTOR_NEXT_KEY};
use super::schema::Property;
use super::stats::TableStatistics;

/// Bounded bidirectional cache for one property's dictionary.
#[derive(Debug)]
pub(crate) struct FactorCache {
    forward: Mutex<LruCache<String, u64>>,
    reverse: Mutex<LruCache<u64, String>>,
}

impl FactorCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            forward: Mutex::new(LruCache::new(capacity)),
            reverse: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_forward(&self, value: &str) -> Option<u64> {
        self.forward
            .lock()
            .expect("factor cache poisoned")
            .get(value)
            .copied()
    }

    pub fn get_reverse(&self, index: u64) -> Option<String> {
        self.reverse
            .lock()
            .expect("factor cache poisoned")
            .get(&index)
            .cloned()
    }

    /// Remember a known-committed pair in both directions.
    pub fn put(&self, value: &str, index: u64) {
        self.forward
            .lock()
            .expect("factor cache poisoned")
            .put(value.to_string(), index);
        self.reverse
            .lock()
            .expect("factor cache poisoned")
            .put(index, value.to_string());
    }
}

/// A dictionary entry created inside a still-open write transaction.
#[derive(Debug, Clone)]
pub(crate) struct StagedFactor {
    pub property_id: i64,
    pub value: String,
    pub index: u64,
}

/// Convert a string value into its dictionary index, allocating the next
/// index on first sight. Lookup order: this transaction's staged entries,
/// the LRU, the bucket, then allocation.
pub(crate) fn factorize(
    tx: &mut WriteTransaction<'_>,
    partition: &TxPartitionHandle,
    cache: &FactorCache,
    staged: &mut Vec<StagedFactor>,
    stats: &TableStatistics,
    property: &Property,
    value: &str,
) -> Result<u64> {
    if !property.is_factor() {
        return Err(TableError::PropertyNotFactor(property.name.clone()));
    }

    if let Some(entry) = staged
        .iter()
        .find(|s| s.property_id == property.id && s.value == value)
    {
        stats.factorize_cache_hits.fetch_add(1, Ordering::Relaxed);
        return Ok(entry.index);
    }

    if let Some(index) = cache.get_forward(value) {
        stats.factorize_cache_hits.fetch_add(1, Ordering::Relaxed);
        return Ok(index);
    }

    let started = Instant::now();
    if let Some(bytes) = tx.get(partition, factor_forward_key(value))? {
        let index: u64 = rmp_serde::from_slice(&bytes)?;
        cache.put(value, index);
        stats.factorize_fetch_hit.record(started);
        return Ok(index);
    }
    stats.factorize_fetch_miss.record(started);

    // First sight: allocate the next index and write both directions.
    let started = Instant::now();
    let current: u64 = match tx.get(partition, FACTOR_NEXT_KEY)? {
        Some(bytes) => rmp_serde::from_slice(&bytes)?,
        None => 0,
    };
    let index = current + 1;
    tx.insert(partition, FACTOR_NEXT_KEY, rmp_serde::to_vec(&index)?);
    tx.insert(partition, factor_forward_key(value), rmp_serde::to_vec(&index)?);
    tx.insert(partition, factor_reverse_key(index), value.as_bytes());
    staged.push(StagedFactor {
        property_id: property.id,
        value: value.to_string(),
        index,
    });
    stats.factorize_create.record(started);
    Ok(index)
}

/// Convert a dictionary index back to its string value.
pub(crate) fn defactorize(
    rtx: &ReadTransaction,
    partition: &TxPartitionHandle,
    cache: &FactorCache,
    stats: &TableStatistics,
    property: &Property,
    index: u64,
) -> Result<String> {
    if !property.is_factor() {
        return Err(TableError::PropertyNotFactor(property.name.clone()));
    }

    if let Some(value) = cache.get_reverse(index) {
        stats.defactorize_cache_hits.fetch_add(1, Ordering::Relaxed);
        return Ok(value);
    }

    let started = Instant::now();
    match rtx.get(partition, factor_reverse_key(index))? {
        Some(bytes) => {
            let value = String::from_utf8(bytes.to_vec())
                .map_err(|e| TableError::Encoding(format!("factor value not utf-8: {e}")))?;
            cache.put(&value, index);
            stats.defactorize_fetch_hit.record(started);
            Ok(value)
        }
        None => {
            stats.defactorize_fetch_miss.record(started);
            Err(TableError::FactorMissing(index))
        }
    }
}
