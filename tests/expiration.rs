//! Integration tests for the expiration sweeper and its periodic driver.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use time::OffsetDateTime;

use eventable::config::TableOptions;
use eventable::retention::{SweepRunner, SweepRunnerConfig};
use eventable::table::{DataType, Event, Table};
use eventable::telemetry::{NullSink, RecordingSink};

const HOUR: time::Duration = time::Duration::hours(1);

fn options(shard_count: usize, sweep_batch_size: usize) -> TableOptions {
    TableOptions {
        shard_count,
        sweep_batch_size,
        ..TableOptions::default()
    }
}

/// Truncate to whole microseconds, the storage resolution.
fn trunc_us(ts: OffsetDateTime) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos((ts.unix_timestamp_nanos() / 1_000) * 1_000).unwrap()
}

fn old_ts() -> OffsetDateTime {
    trunc_us(OffsetDateTime::now_utc() - time::Duration::hours(2))
}

fn fresh_ts() -> OffsetDateTime {
    trunc_us(OffsetDateTime::now_utc() - time::Duration::seconds(30))
}

#[test]
fn test_sweep_deletes_expired_keeps_fresh() {
    let temp_dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let table = Table::create(
        temp_dir.path().join("events"),
        "sweeptest",
        options(2, 100),
        sink.clone(),
    )
    .unwrap();
    let count = table
        .create_property("count", DataType::Integer, false)
        .unwrap();

    let fresh = fresh_ts();
    table
        .insert_events(
            "a",
            &[
                Event::new(old_ts()).set(count.id, 1_i64),
                Event::new(fresh).set(count.id, 2_i64),
            ],
        )
        .unwrap();

    let stats = table.sweep_next_batch(HOUR).unwrap();
    assert_eq!(stats.deleted_events, 1);
    assert_eq!(stats.deleted_objects, 0);
    assert!(stats.swept_objects >= 1);

    // The fresh event survived.
    let events = table.get_events("a").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].timestamp, fresh);

    assert_eq!(sink.counter_total("expiration.sweep"), 1);
    assert_eq!(sink.counter_total("expiration.events"), 1);
    // Both shards rolled over within the batch.
    assert!(sink.counter_total("expiration.rollover") >= 2);
}

#[test]
fn test_sweep_deletes_empty_objects() {
    let temp_dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let table = Table::create(
        temp_dir.path().join("events"),
        "sweeptest",
        options(2, 100),
        sink.clone(),
    )
    .unwrap();
    let count = table
        .create_property("count", DataType::Integer, false)
        .unwrap();

    // Every event of "gone" is expired; "kept" has one fresh event.
    table
        .insert_events(
            "gone",
            &[
                Event::new(old_ts()).set(count.id, 1_i64),
                Event::new(trunc_us(OffsetDateTime::now_utc() - time::Duration::hours(3)))
                    .set(count.id, 2_i64),
            ],
        )
        .unwrap();
    table
        .insert_event("kept", &Event::new(fresh_ts()).set(count.id, 3_i64))
        .unwrap();

    let stats = table.sweep_next_batch(HOUR).unwrap();
    assert_eq!(stats.deleted_events, 2);
    assert_eq!(stats.deleted_objects, 1);

    assert!(table.get_events("gone").unwrap().is_empty());
    assert_eq!(table.get_events("kept").unwrap().len(), 1);
    assert_eq!(sink.counter_total("expiration.objects"), 1);
}

#[test]
fn test_empty_batch_rolls_back() {
    let temp_dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let table = Table::create(
        temp_dir.path().join("events"),
        "sweeptest",
        options(2, 16),
        sink.clone(),
    )
    .unwrap();
    let count = table
        .create_property("count", DataType::Integer, false)
        .unwrap();
    table
        .insert_event("a", &Event::new(fresh_ts()).set(count.id, 1_i64))
        .unwrap();

    // Nothing is expired: the batch visits everything, deletes nothing,
    // and rolls its transaction back.
    let stats = table.sweep_next_batch(HOUR).unwrap();
    assert_eq!(stats.deleted_events, 0);
    assert_eq!(stats.deleted_objects, 0);
    assert_eq!(stats.swept_objects, 16);

    assert_eq!(sink.counter_total("expiration.sweep"), 1);
    assert_eq!(sink.counter_total("expiration.events"), 0);
    assert_eq!(sink.counter_total("expiration.objects"), 0);
    assert_eq!(table.get_events("a").unwrap().len(), 1);
}

#[test]
fn test_sweep_batches_are_bounded() {
    let temp_dir = TempDir::new().unwrap();
    let table = Table::create(
        temp_dir.path().join("events"),
        "sweeptest",
        options(1, 10),
        Arc::new(NullSink),
    )
    .unwrap();
    let count = table
        .create_property("count", DataType::Integer, false)
        .unwrap();

    // 25 expired events on a single object: more than two full batches.
    let base = OffsetDateTime::now_utc() - time::Duration::hours(3);
    let events: Vec<Event> = (0..25_i64)
        .map(|i| {
            Event::new(trunc_us(base + time::Duration::seconds(i)))
                .set(count.id, i)
        })
        .collect();
    table.insert_events("bulk", &events).unwrap();

    let mut total_deleted = 0;
    let mut batches = 0;
    while total_deleted < 25 {
        let stats = table.sweep_next_batch(HOUR).unwrap();
        assert!(stats.deleted_events <= 10, "batch exceeded its bound");
        assert!(stats.swept_objects >= 1);
        total_deleted += stats.deleted_events;
        batches += 1;
        assert!(batches <= 10, "sweep failed to make progress");
    }

    assert_eq!(total_deleted, 25);
    assert!(table.get_events("bulk").unwrap().is_empty());
}

#[test]
fn test_sweep_resumes_across_batches() {
    let temp_dir = TempDir::new().unwrap();
    let table = Table::create(
        temp_dir.path().join("events"),
        "sweeptest",
        options(4, 2),
        Arc::new(NullSink),
    )
    .unwrap();
    let count = table
        .create_property("count", DataType::Integer, false)
        .unwrap();

    for id in ["a", "b", "c", "d", "e", "f"] {
        table
            .insert_event(id, &Event::new(old_ts()).set(count.id, 1_i64))
            .unwrap();
    }

    // Tiny batches: every object is eventually reached by resuming from
    // the cursor, across shard rollovers.
    let mut deleted_objects = 0;
    for _ in 0..64 {
        let stats = table.sweep_next_batch(HOUR).unwrap();
        deleted_objects += stats.deleted_objects;
        if deleted_objects == 6 {
            break;
        }
    }
    assert_eq!(deleted_objects, 6);
    assert!(table.object_ids().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_runner_drives_expiration() {
    let temp_dir = TempDir::new().unwrap();
    let table = Arc::new(
        Table::create(
            temp_dir.path().join("events"),
            "sweeptest",
            options(2, 100),
            Arc::new(NullSink),
        )
        .unwrap(),
    );
    let count = table
        .create_property("count", DataType::Integer, false)
        .unwrap();
    table
        .insert_event("a", &Event::new(old_ts()).set(count.id, 1_i64))
        .unwrap();

    let runner = SweepRunner::new(
        table.clone(),
        SweepRunnerConfig {
            interval: Duration::from_millis(10),
            horizon: HOUR,
        },
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(runner.run(shutdown_rx));

    // Wait for the runner to pick the event up.
    let mut swept = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if table.get_events("a").unwrap().is_empty() {
            swept = true;
            break;
        }
    }
    assert!(swept, "runner never swept the expired event");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
