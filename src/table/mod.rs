//! Per-table event storage engine.
//!
//! A table persists a collection of objects, each with an ordered log of
//! timestamped events, inside one fjall keyspace:
//!
//! - Event records (MessagePack maps of property id to value, keyed by a
//!   shifted-epoch timestamp so byte order equals chronological order)
//! - A sharded object layout (`fnv1a(object id) % shard_count`)
//! - Factor dictionaries that encode repeated string values as small
//!   integer indices, fronted by bounded LRU caches
//! - A JSON meta document carrying the schema
//! - A resumable expiration sweeper that deletes events older than a
//!   moving horizon in bounded batches
//!
//! ## Usage
//!
//! ```rust,ignore
//! use eventable::table::{DataType, Event, Table};
//!
//! let table = Table::create("data/users", "users", options, sink)?;
//! let action = table.create_property("action", DataType::Factor, false)?;
//! table.insert_event("u1", &Event::new(now).set(action.id, "click"))?;
//! let events = table.get_events("u1")?;
//! ```

pub mod codec;
pub mod error;
pub mod schema;
pub mod stats;
pub mod store;
pub mod sweep;

mod factors;
mod keys;

pub use codec::{Event, Value};
pub use error::{Result, TableError};
pub use schema::{DataType, Property};
pub use stats::{OpStat, Stat, StorageStats};
pub use store::Table;
pub use sweep::SweepStats;
