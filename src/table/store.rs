//! The table: a sharded on-disk event store over a transactional fjall
//! keyspace.
//!
//! Layout: the `meta` partition holds the schema document, one `shard_<i>`
//! partition per shard holds event records keyed by framed object id plus
//! timestamp, and one `factor_<id>` partition per factor property holds its
//! dictionary. Reads run in concurrent snapshot transactions; writes go
//! through the single writer. A table-level mutex serializes lifecycle,
//! schema mutation, and the expiration sweeper.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use fjall::{
    Config, PartitionCreateOptions, PersistMode, ReadTransaction, TxKeyspace, TxPartitionHandle,
    WriteTransaction,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::TableOptions;
use crate::telemetry::TelemetrySink;

use super::codec::{encode_timestamp_key, from_micros, to_micros, Event, RawEvent, Value};
use super::error::{Result, TableError};
use super::factors::{defactorize, factorize, FactorCache, StagedFactor};
use super::keys;
use super::schema::{DataType, Property, Schema};
use super::stats::{Stat, StorageStats, TableStatistics};
use super::sweep::SweepCursor;

/// Open handles for one table. Dropped as a unit on close.
pub(crate) struct Core {
    pub keyspace: TxKeyspace,
    pub meta: TxPartitionHandle,
    pub shards: Vec<TxPartitionHandle>,
    pub schema: RwLock<Arc<Schema>>,
    factors: RwLock<HashMap<i64, TxPartitionHandle>>,
    caches: RwLock<HashMap<i64, Arc<FactorCache>>>,
    cache_capacity: usize,
}

impl Core {
    /// Factor partition and cache for a property, opened on first use.
    pub(crate) fn factor_state(
        &self,
        property_id: i64,
    ) -> Result<(TxPartitionHandle, Arc<FactorCache>)> {
        {
            let factors = self.factors.read().expect("factor partitions poisoned");
            let caches = self.caches.read().expect("factor caches poisoned");
            if let (Some(partition), Some(cache)) =
                (factors.get(&property_id), caches.get(&property_id))
            {
                return Ok((partition.clone(), cache.clone()));
            }
        }

        let opened = self.keyspace.open_partition(
            &keys::factor_partition_name(property_id),
            PartitionCreateOptions::default(),
        )?;
        let mut factors = self.factors.write().expect("factor partitions poisoned");
        let mut caches = self.caches.write().expect("factor caches poisoned");
        let partition = factors.entry(property_id).or_insert(opened).clone();
        let cache = caches
            .entry(property_id)
            .or_insert_with(|| Arc::new(FactorCache::new(self.cache_capacity)))
            .clone();
        Ok((partition, cache))
    }

    pub(crate) fn cache(&self, property_id: i64) -> Option<Arc<FactorCache>> {
        self.caches
            .read()
            .expect("factor caches poisoned")
            .get(&property_id)
            .cloned()
    }

    pub(crate) fn snapshot_storage(&self, all: bool) -> StorageStats {
        let mut stats = StorageStats::default();
        for shard in &self.shards {
            accumulate(&mut stats, shard);
        }
        if all {
            accumulate(&mut stats, &self.meta);
            let factors = self.factors.read().expect("factor partitions poisoned");
            for partition in factors.values() {
                accumulate(&mut stats, partition);
            }
        }
        stats
    }
}

fn accumulate(stats: &mut StorageStats, partition: &TxPartitionHandle) {
    stats.partitions += 1;
    stats.keys += partition.inner().approximate_len() as u64;
    stats.disk_space += partition.inner().disk_space();
}

/// A named collection of objects with per-object event logs.
pub struct Table {
    name: String,
    path: PathBuf,
    pub(crate) options: TableOptions,
    pub(crate) sink: Arc<dyn TelemetrySink>,
    tags: OnceLock<Vec<String>>,
    /// Serializes lifecycle, schema mutation, and the sweeper.
    pub(crate) lock: Mutex<()>,
    core: RwLock<Option<Arc<Core>>>,
    pub(crate) sweep_cursor: Mutex<SweepCursor>,
    pub(crate) stats: TableStatistics,
    open_txns: AtomicI64,
}

impl Table {
    /// Open a table, creating the keyspace on first use. The persisted meta
    /// document, when present, overrides `options.shard_count`.
    pub fn open(
        path: impl AsRef<Path>,
        name: &str,
        options: TableOptions,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Table> {
        let path = path.as_ref().to_path_buf();
        let keyspace = open_keyspace(&path, options.open_timeout())?;
        let meta = keyspace.open_partition(keys::META_PARTITION, PartitionCreateOptions::default())?;

        let schema = {
            let rtx = keyspace.read_tx();
            match rtx.get(&meta, keys::META_KEY)? {
                Some(bytes) => Schema::unmarshal(&bytes)?,
                None => Schema::new(name, options.shard_count),
            }
        };
        let name = schema.name.clone();

        let mut shards = Vec::with_capacity(schema.shard_count);
        for index in 0..schema.shard_count {
            shards.push(keyspace.open_partition(
                &keys::shard_partition_name(index),
                PartitionCreateOptions::default(),
            )?);
        }

        let mut factors = HashMap::new();
        let mut caches = HashMap::new();
        for property in schema.properties() {
            if !property.is_factor() {
                continue;
            }
            let partition = keyspace.open_partition(
                &keys::factor_partition_name(property.id),
                PartitionCreateOptions::default(),
            )?;
            factors.insert(property.id, partition);
            caches.insert(
                property.id,
                Arc::new(FactorCache::new(options.factor_cache_size)),
            );
        }

        info!(
            table = %name,
            path = %path.display(),
            shards = schema.shard_count,
            properties = factors.len(),
            "table opened"
        );

        let core = Core {
            keyspace,
            meta,
            shards,
            schema: RwLock::new(Arc::new(schema)),
            factors: RwLock::new(factors),
            caches: RwLock::new(caches),
            cache_capacity: options.factor_cache_size,
        };

        Ok(Table {
            name,
            path,
            options,
            sink,
            tags: OnceLock::new(),
            lock: Mutex::new(()),
            core: RwLock::new(Some(Arc::new(core))),
            sweep_cursor: Mutex::new(SweepCursor::default()),
            stats: TableStatistics::default(),
            open_txns: AtomicI64::new(0),
        })
    }

    /// Open a table and persist its meta document immediately.
    pub fn create(
        path: impl AsRef<Path>,
        name: &str,
        options: TableOptions,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Table> {
        let table = Self::open(path, name, options, sink)?;
        let core = table.core()?;
        let meta_bytes = core.schema.read().expect("schema lock poisoned").marshal()?;
        table.update(&core, "create", |tx, _| {
            tx.insert(&core.meta, keys::META_KEY, meta_bytes);
            Ok(())
        })?;
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.core
            .read()
            .expect("table state poisoned")
            .is_some()
    }

    pub fn shard_count(&self) -> Result<usize> {
        Ok(self.schema_snapshot()?.shard_count)
    }

    /// Release the keyspace. Operations after this fail `TableNotOpen`.
    pub fn close(&self) {
        let _guard = self.lock.lock().expect("table lock poisoned");
        let mut core = self.core.write().expect("table state poisoned");
        if core.take().is_some() {
            info!(table = %self.name, "table closed");
        }
    }

    /// Close and delete the table's directory.
    pub fn destroy(self) -> Result<()> {
        self.close();
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fsync all pending writes.
    pub fn flush(&self) -> Result<()> {
        self.core()?
            .keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| TableError::Storage(e).in_op("flush", &self.name))
    }

    // ---- schema ------------------------------------------------------

    /// Create a property, allocating the next permanent or transient id.
    pub fn create_property(
        &self,
        name: &str,
        data_type: DataType,
        transient: bool,
    ) -> Result<Property> {
        let _guard = self.lock.lock().expect("table lock poisoned");
        let core = self.core()?;
        let current = core.schema.read().expect("schema lock poisoned").clone();
        let (next, property) = current.with_property(name, data_type, transient)?;
        let meta_bytes = next.marshal()?;

        if property.is_factor() {
            core.factor_state(property.id)?;
        }
        self.update(&core, "create_property", |tx, _| {
            tx.insert(&core.meta, keys::META_KEY, meta_bytes);
            Ok(())
        })?;
        *core.schema.write().expect("schema lock poisoned") = Arc::new(next);

        info!(
            table = %self.name,
            property = name,
            id = property.id,
            ?data_type,
            transient,
            "property created"
        );
        Ok((*property).clone())
    }

    /// Rename a property; its id, data type, and stored values are untouched.
    pub fn rename_property(&self, old: &str, new: &str) -> Result<Property> {
        let _guard = self.lock.lock().expect("table lock poisoned");
        let core = self.core()?;
        let current = core.schema.read().expect("schema lock poisoned").clone();
        let next = current.with_renamed(old, new)?;
        let meta_bytes = next.marshal()?;

        self.update(&core, "rename_property", |tx, _| {
            tx.insert(&core.meta, keys::META_KEY, meta_bytes);
            Ok(())
        })?;
        let renamed = next
            .property(new)
            .ok_or_else(|| TableError::PropertyNotFound(new.to_string()))?;
        *core.schema.write().expect("schema lock poisoned") = Arc::new(next);

        info!(table = %self.name, old, new, "property renamed");
        Ok((*renamed).clone())
    }

    pub fn property(&self, name: &str) -> Result<Option<Property>> {
        Ok(self.schema_snapshot()?.property(name).map(|p| (*p).clone()))
    }

    pub fn property_by_id(&self, id: i64) -> Result<Option<Property>> {
        Ok(self
            .schema_snapshot()?
            .property_by_id(id)
            .map(|p| (*p).clone()))
    }

    pub fn properties(&self) -> Result<Vec<Property>> {
        Ok(self
            .schema_snapshot()?
            .properties()
            .into_iter()
            .map(|p| (*p).clone())
            .collect())
    }

    // ---- events ------------------------------------------------------

    /// Insert one event; an existing event at the same timestamp is
    /// overwritten.
    pub fn insert_event(&self, object_id: &str, event: &Event) -> Result<()> {
        self.insert_events(object_id, std::slice::from_ref(event))
    }

    /// Insert a batch of events for one object in a single transaction.
    pub fn insert_events(&self, object_id: &str, events: &[Event]) -> Result<()> {
        if object_id.is_empty() {
            return Err(TableError::ObjectIdRequired);
        }
        if events.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let core = self.core()?;
        let schema = core.schema.read().expect("schema lock poisoned").clone();
        let prefix = keys::object_key_prefix(object_id)?;
        let shard = &core.shards[keys::shard_index(object_id, schema.shard_count)];

        // Resolve factor dictionaries before the transaction opens.
        let mut dictionaries: HashMap<i64, (TxPartitionHandle, Arc<FactorCache>)> = HashMap::new();
        for event in events {
            for (&property_id, value) in &event.data {
                let property = schema
                    .property_by_id(property_id)
                    .ok_or_else(|| TableError::PropertyNotFound(property_id.to_string()))?;
                if property.is_factor()
                    && matches!(value, Value::String(_))
                    && !dictionaries.contains_key(&property_id)
                {
                    dictionaries.insert(property_id, core.factor_state(property_id)?);
                }
            }
        }

        self.update(&core, "insert_event", |tx, staged| {
            for event in events {
                let mut data = BTreeMap::new();
                for (&property_id, value) in &event.data {
                    let property = schema
                        .property_by_id(property_id)
                        .ok_or_else(|| TableError::PropertyNotFound(property_id.to_string()))?;
                    let stored = match value {
                        Value::String(s) if property.is_factor() => {
                            let (partition, cache) = &dictionaries[&property_id];
                            let index = factorize(
                                tx, partition, cache, staged, &self.stats, &property, s,
                            )?;
                            let index = i64::try_from(index).map_err(|_| {
                                TableError::Encoding(format!(
                                    "factor index {index} exceeds i64 range"
                                ))
                            })?;
                            Value::Int(index)
                        }
                        other => other.clone(),
                    };
                    data.insert(property_id, stored);
                }
                let raw = RawEvent {
                    micros: to_micros(event.timestamp),
                    data,
                };
                let record = raw.marshal(&self.stats)?;
                let key = keys::event_key(&prefix, encode_timestamp_key(event.timestamp));
                tx.insert(shard, key, record);
            }
            Ok(())
        })?;

        self.stats.insert.record(started);
        debug!(table = %self.name, object_id, count = events.len(), "events inserted");
        Ok(())
    }

    /// All events for an object in ascending timestamp order, with factor
    /// indices resolved back to strings.
    pub fn get_events(&self, object_id: &str) -> Result<Vec<Event>> {
        if object_id.is_empty() {
            return Err(TableError::ObjectIdRequired);
        }
        let started = Instant::now();
        let core = self.core()?;
        let schema = core.schema.read().expect("schema lock poisoned").clone();
        let prefix = keys::object_key_prefix(object_id)?;
        let shard = &core.shards[keys::shard_index(object_id, schema.shard_count)];

        let events = self.view(&core, "get_events", |rtx| {
            let mut out = Vec::new();
            for item in rtx.prefix(shard, prefix.clone()) {
                let (_key, value) = item?;
                let raw = RawEvent::unmarshal(&value, &self.stats)?;
                out.push(self.decode_event(rtx, &core, &schema, raw)?);
            }
            Ok(out)
        })?;

        self.stats.fetch.record(started);
        Ok(events)
    }

    /// Point lookup by exact timestamp.
    pub fn get_event(
        &self,
        object_id: &str,
        timestamp: OffsetDateTime,
    ) -> Result<Option<Event>> {
        if object_id.is_empty() {
            return Err(TableError::ObjectIdRequired);
        }
        let started = Instant::now();
        let core = self.core()?;
        let schema = core.schema.read().expect("schema lock poisoned").clone();
        let prefix = keys::object_key_prefix(object_id)?;
        let shard = &core.shards[keys::shard_index(object_id, schema.shard_count)];
        let key = keys::event_key(&prefix, encode_timestamp_key(timestamp));

        let event = self.view(&core, "get_event", |rtx| {
            match rtx.get(shard, key.clone())? {
                Some(value) => {
                    let raw = RawEvent::unmarshal(&value, &self.stats)?;
                    Ok(Some(self.decode_event(rtx, &core, &schema, raw)?))
                }
                None => Ok(None),
            }
        })?;

        self.stats.fetch.record(started);
        Ok(event)
    }

    /// Delete the single event at a timestamp.
    pub fn delete_event(&self, object_id: &str, timestamp: OffsetDateTime) -> Result<()> {
        if object_id.is_empty() {
            return Err(TableError::ObjectIdRequired);
        }
        let started = Instant::now();
        let core = self.core()?;
        let schema = core.schema.read().expect("schema lock poisoned").clone();
        let prefix = keys::object_key_prefix(object_id)?;
        let shard = &core.shards[keys::shard_index(object_id, schema.shard_count)];
        let key = keys::event_key(&prefix, encode_timestamp_key(timestamp));

        self.update(&core, "delete_event", |tx, _| {
            tx.remove(shard, key);
            Ok(())
        })?;

        self.stats.delete.record(started);
        Ok(())
    }

    /// Delete an object and all of its events.
    pub fn delete_object(&self, object_id: &str) -> Result<()> {
        if object_id.is_empty() {
            return Err(TableError::ObjectIdRequired);
        }
        let started = Instant::now();
        let core = self.core()?;
        let schema = core.schema.read().expect("schema lock poisoned").clone();
        let prefix = keys::object_key_prefix(object_id)?;
        let shard = &core.shards[keys::shard_index(object_id, schema.shard_count)];

        self.update(&core, "delete_object", |tx, _| {
            let doomed: Vec<Vec<u8>> = tx
                .prefix(shard, prefix.clone())
                .map(|item| item.map(|(key, _)| key.to_vec()))
                .collect::<std::result::Result<_, fjall::Error>>()?;
            for key in doomed {
                tx.remove(shard, key);
            }
            Ok(())
        })?;

        self.stats.delete.record(started);
        debug!(table = %self.name, object_id, "object deleted");
        Ok(())
    }

    /// All object ids across every shard, sorted.
    pub fn object_ids(&self) -> Result<Vec<String>> {
        let core = self.core()?;
        let ids = self.view(&core, "object_ids", |rtx| {
            let mut ids = BTreeSet::new();
            for shard in &core.shards {
                for item in rtx.iter(shard) {
                    let (key, _) = item?;
                    if let Some((_, id)) = keys::split_event_key(&key) {
                        ids.insert(id.to_string());
                    }
                }
            }
            Ok(ids)
        })?;
        Ok(ids.into_iter().collect())
    }

    // ---- factor dictionary -------------------------------------------

    /// Dictionary-encode a value for a factor property, allocating a new
    /// index on first sight.
    pub fn factorize(&self, property_name: &str, value: &str) -> Result<u64> {
        let core = self.core()?;
        let schema = core.schema.read().expect("schema lock poisoned").clone();
        let property = schema
            .property(property_name)
            .ok_or_else(|| TableError::PropertyNotFound(property_name.to_string()))?;
        if !property.is_factor() {
            return Err(TableError::PropertyNotFactor(property_name.to_string()));
        }
        let (partition, cache) = core.factor_state(property.id)?;
        self.update(&core, "factorize", |tx, staged| {
            factorize(tx, &partition, &cache, staged, &self.stats, &property, value)
        })
    }

    /// Resolve a factor index back to its string value.
    pub fn defactorize(&self, property_name: &str, index: u64) -> Result<String> {
        let core = self.core()?;
        let schema = core.schema.read().expect("schema lock poisoned").clone();
        let property = schema
            .property(property_name)
            .ok_or_else(|| TableError::PropertyNotFound(property_name.to_string()))?;
        if !property.is_factor() {
            return Err(TableError::PropertyNotFactor(property_name.to_string()));
        }
        let (partition, cache) = core.factor_state(property.id)?;
        self.view(&core, "defactorize", |rtx| {
            defactorize(rtx, &partition, &cache, &self.stats, &property, index)
        })
    }

    // ---- stats -------------------------------------------------------

    /// Snapshot of the per-operation counters.
    pub fn stat(&self) -> Stat {
        self.stats.snapshot()
    }

    /// Aggregate storage measures over shard partitions, or over every
    /// partition including meta and factor dictionaries when `all` is set.
    pub fn storage_stats(&self, all: bool) -> Result<StorageStats> {
        Ok(self.core()?.snapshot_storage(all))
    }

    // ---- internals ---------------------------------------------------

    pub(crate) fn core(&self) -> Result<Arc<Core>> {
        self.core
            .read()
            .expect("table state poisoned")
            .clone()
            .ok_or(TableError::TableNotOpen)
    }

    fn schema_snapshot(&self) -> Result<Arc<Schema>> {
        Ok(self.core()?.schema.read().expect("schema lock poisoned").clone())
    }

    pub(crate) fn tags(&self) -> &[String] {
        self.tags
            .get_or_init(|| vec![format!("table:{}", self.name)])
    }

    /// Run a closure in a write transaction. On success the transaction is
    /// committed and staged factor entries are published to the caches; on
    /// error it is rolled back and the staged entries are discarded. The
    /// storage delta is emitted either way.
    pub(crate) fn update<T>(
        &self,
        core: &Core,
        op: &'static str,
        f: impl FnOnce(&mut WriteTransaction<'_>, &mut Vec<StagedFactor>) -> Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        self.open_txns.fetch_add(1, Ordering::Relaxed);
        let mut tx = core.keyspace.write_tx();
        let mut staged = Vec::new();

        let result = match f(&mut tx, &mut staged) {
            Ok(value) => match tx.commit() {
                Ok(()) => {
                    for entry in staged {
                        if let Some(cache) = core.cache(entry.property_id) {
                            cache.put(&entry.value, entry.index);
                        }
                    }
                    Ok(value)
                }
                Err(e) => Err(TableError::Storage(e)),
            },
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        };

        self.open_txns.fetch_sub(1, Ordering::Relaxed);
        self.emit_write_delta(core, started);
        result.map_err(|e| e.in_op(op, &self.name))
    }

    /// Run a closure in a read-only snapshot transaction.
    pub(crate) fn view<T>(
        &self,
        core: &Core,
        op: &'static str,
        f: impl FnOnce(&ReadTransaction) -> Result<T>,
    ) -> Result<T> {
        let rtx = core.keyspace.read_tx();
        f(&rtx).map_err(|e| e.in_op(op, &self.name))
    }

    /// Post-write storage telemetry, emitted after commits and rollbacks
    /// alike (a rolled-back write reports a zero delta).
    pub(crate) fn emit_write_delta(&self, core: &Core, started: Instant) {
        let tags = self.tags();
        let elapsed_us = started.elapsed().as_micros() as f64;
        let storage = core.snapshot_storage(true);

        self.sink.count("store.txn.total", 1, tags);
        self.sink
            .count("store.txn.write.time", elapsed_us as i64, tags);
        self.sink.histogram("store.txn.write.period", elapsed_us, tags);
        self.sink.gauge(
            "store.txn.open",
            self.open_txns.load(Ordering::Relaxed) as f64,
            tags,
        );
        self.sink
            .gauge("store.disk.used", storage.disk_space as f64, tags);
        self.sink
            .gauge("store.keys.approx", storage.keys as f64, tags);
    }

    fn decode_event(
        &self,
        rtx: &ReadTransaction,
        core: &Core,
        schema: &Schema,
        raw: RawEvent,
    ) -> Result<Event> {
        let mut data = BTreeMap::new();
        for (property_id, value) in raw.data {
            let property = schema.property_by_id(property_id);
            let decoded = match value {
                Value::Int(index)
                    if property.as_ref().is_some_and(|p| p.is_factor()) =>
                {
                    let property = property.ok_or_else(|| {
                        TableError::PropertyNotFound(property_id.to_string())
                    })?;
                    let index = u64::try_from(index).map_err(|_| {
                        TableError::Encoding(format!(
                            "negative factor index {index} for property {}",
                            property.name
                        ))
                    })?;
                    let (partition, cache) = core.factor_state(property_id)?;
                    Value::String(defactorize(
                        rtx, &partition, &cache, &self.stats, &property, index,
                    )?)
                }
                other => other,
            };
            data.insert(property_id, decoded);
        }
        Ok(Event {
            timestamp: from_micros(raw.micros)?,
            data,
        })
    }
}

/// Open the keyspace, retrying while another process holds its lock.
fn open_keyspace(path: &Path, timeout: Duration) -> Result<TxKeyspace> {
    let deadline = Instant::now() + timeout;
    loop {
        match Config::new(path).open_transactional() {
            Ok(keyspace) => return Ok(keyspace),
            Err(fjall::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(TableError::TableBusy(path.display().to_string()));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
