//! Integration tests for table lifecycle, event storage, and the factor
//! dictionary.

use std::sync::Arc;

use tempfile::TempDir;
use time::OffsetDateTime;

use eventable::config::TableOptions;
use eventable::table::{DataType, Event, Table, TableError, Value};
use eventable::telemetry::{NullSink, RecordingSink};

fn options(shard_count: usize) -> TableOptions {
    TableOptions {
        shard_count,
        ..TableOptions::default()
    }
}

fn micros_dt(micros: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000).unwrap()
}

#[test]
fn test_create_reopen_layout() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("users");

    {
        let table = Table::create(&path, "users", options(4), Arc::new(NullSink)).unwrap();
        assert_eq!(table.shard_count().unwrap(), 4);
        table.close();
    }

    let table = Table::open(&path, "users", options(4), Arc::new(NullSink)).unwrap();
    assert_eq!(table.name(), "users");
    assert_eq!(table.shard_count().unwrap(), 4);
    assert!(table.properties().unwrap().is_empty());

    // Four shard partitions, plus the meta partition in the full scope.
    let shards_only = table.storage_stats(false).unwrap();
    assert_eq!(shards_only.partitions, 4);
    let all = table.storage_stats(true).unwrap();
    assert_eq!(all.partitions, 5);
}

#[test]
fn test_insert_fetch_with_factor_dictionary() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("users");
    let table = Table::create(&path, "users", options(4), Arc::new(NullSink)).unwrap();

    let action = table
        .create_property("action", DataType::Factor, false)
        .unwrap();
    assert_eq!(action.id, 1);

    let ts = micros_dt(1_000_000);
    table
        .insert_event("u1", &Event::new(ts).set(action.id, "click"))
        .unwrap();

    let events = table.get_events("u1").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].timestamp, ts);
    assert_eq!(events[0].data[&1], Value::String("click".to_string()));

    // Both dictionary directions are persistent: reopen and resolve them
    // from the bucket, not the cache.
    table.close();
    let table = Table::open(&path, "users", options(4), Arc::new(NullSink)).unwrap();
    assert_eq!(table.factorize("action", "click").unwrap(), 1);
    assert_eq!(table.defactorize("action", 1).unwrap(), "click");

    let events = table.get_events("u1").unwrap();
    assert_eq!(events[0].data[&1], Value::String("click".to_string()));
}

#[test]
fn test_overwrite_same_timestamp() {
    let temp_dir = TempDir::new().unwrap();
    let table = Table::create(
        temp_dir.path().join("users"),
        "users",
        options(2),
        Arc::new(NullSink),
    )
    .unwrap();
    let action = table
        .create_property("action", DataType::Factor, false)
        .unwrap();

    let ts = micros_dt(1_000_000);
    table
        .insert_event("u1", &Event::new(ts).set(action.id, "click"))
        .unwrap();
    table
        .insert_event("u1", &Event::new(ts).set(action.id, "purchase"))
        .unwrap();

    let events = table.get_events("u1").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data[&action.id], Value::String("purchase".to_string()));
}

#[test]
fn test_mixed_value_types_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let table = Table::create(
        temp_dir.path().join("users"),
        "users",
        options(2),
        Arc::new(NullSink),
    )
    .unwrap();

    let action = table
        .create_property("action", DataType::Factor, false)
        .unwrap();
    let duration = table
        .create_property("duration", DataType::Integer, false)
        .unwrap();
    let score = table
        .create_property("score", DataType::Float, false)
        .unwrap();
    let returning = table
        .create_property("returning", DataType::Boolean, false)
        .unwrap();
    let note = table
        .create_property("note", DataType::String, false)
        .unwrap();

    let ts = micros_dt(7);
    let event = Event::new(ts)
        .set(action.id, "signup")
        .set(duration.id, 1500_i64)
        .set(score.id, 0.25_f64)
        .set(returning.id, false)
        .set(note.id, "first visit");
    table.insert_event("u9", &event).unwrap();

    let fetched = &table.get_events("u9").unwrap()[0];
    assert_eq!(fetched.data[&action.id], Value::String("signup".to_string()));
    assert_eq!(fetched.data[&duration.id], Value::Int(1500));
    assert_eq!(fetched.data[&score.id], Value::Float(0.25));
    assert_eq!(fetched.data[&returning.id], Value::Bool(false));
    assert_eq!(fetched.data[&note.id], Value::String("first visit".to_string()));
}

#[test]
fn test_shared_factor_values_share_indices_across_objects() {
    let temp_dir = TempDir::new().unwrap();
    let table = Table::create(
        temp_dir.path().join("users"),
        "users",
        options(4),
        Arc::new(NullSink),
    )
    .unwrap();
    let action = table
        .create_property("action", DataType::Factor, false)
        .unwrap();

    for id in ["u1", "u2", "u3"] {
        table
            .insert_event(id, &Event::new(micros_dt(1)).set(action.id, "click"))
            .unwrap();
    }
    // One dictionary entry serves every object.
    assert_eq!(table.factorize("action", "click").unwrap(), 1);
    assert_eq!(table.factorize("action", "view").unwrap(), 2);
}

#[test]
fn test_write_telemetry_delta_emitted() {
    let temp_dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let table = Table::create(
        temp_dir.path().join("users"),
        "users",
        options(2),
        sink.clone(),
    )
    .unwrap();
    let count = table
        .create_property("count", DataType::Integer, false)
        .unwrap();
    table
        .insert_event("u1", &Event::new(micros_dt(1)).set(count.id, 1_i64))
        .unwrap();

    // create + create_property + insert_event each committed one write.
    assert_eq!(sink.counter_total("store.txn.total"), 3);
    let events = sink.events();
    assert!(events.iter().any(|e| e.metric == "store.txn.write.period"));
    assert!(events
        .iter()
        .all(|e| e.tags == vec!["table:users".to_string()]));
}

#[test]
fn test_failed_insert_leaves_no_trace() {
    let temp_dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let table = Table::create(
        temp_dir.path().join("users"),
        "users",
        options(2),
        sink.clone(),
    )
    .unwrap();

    // Property 99 does not exist; the insert is rejected before any write.
    let err = table
        .insert_event("u1", &Event::new(micros_dt(1)).set(99, 1_i64))
        .unwrap_err();
    assert!(matches!(err, TableError::PropertyNotFound(_)));
    assert!(table.get_events("u1").unwrap().is_empty());

    // Only the create wrote; the rejected insert emitted no delta.
    assert_eq!(sink.counter_total("store.txn.total"), 1);
}

#[test]
fn test_stat_diff_reports_interval() {
    let temp_dir = TempDir::new().unwrap();
    let table = Table::create(
        temp_dir.path().join("users"),
        "users",
        options(2),
        Arc::new(NullSink),
    )
    .unwrap();
    let count = table
        .create_property("count", DataType::Integer, false)
        .unwrap();

    let before = table.stat();
    table
        .insert_event("u1", &Event::new(micros_dt(1)).set(count.id, 1_i64))
        .unwrap();
    table.get_events("u1").unwrap();

    let diff = table.stat().diff(&before);
    assert_eq!(diff.insert.count, 1);
    assert_eq!(diff.fetch.count, 1);
    assert_eq!(diff.marshal.count, 1);
    assert_eq!(diff.unmarshal.count, 1);
}
