//! Event record binary format.
//!
//! A stored record is an 8-byte big-endian shifted-epoch timestamp followed
//! by a MessagePack map of `property id -> value`. The same shifted encoding
//! doubles as the storage key suffix, so lexicographic key order equals
//! chronological order across negative, zero, and positive epochs.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use super::error::{Result, TableError};
use super::keys::TS_KEY_LEN;
use super::stats::TableStatistics;

/// Offset added to unix microseconds before key encoding. Keeps every
/// representable pre-epoch instant non-negative so byte order matches
/// chronological order.
pub(crate) const TIMESTAMP_SHIFT: i64 = 1 << 62;

/// Microsecond-resolution unix timestamp for an instant.
pub(crate) fn to_micros(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000) as i64
}

pub(crate) fn from_micros(micros: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|e| TableError::Encoding(format!("timestamp out of range: {e}")))
}

/// Fixed-width storage key for a timestamp.
pub(crate) fn encode_timestamp_key(ts: OffsetDateTime) -> [u8; TS_KEY_LEN] {
    encode_micros_key(to_micros(ts))
}

pub(crate) fn encode_micros_key(micros: i64) -> [u8; TS_KEY_LEN] {
    (micros + TIMESTAMP_SHIFT).to_be_bytes()
}

pub(crate) fn decode_timestamp_key(key: [u8; TS_KEY_LEN]) -> Result<OffsetDateTime> {
    from_micros(i64::from_be_bytes(key) - TIMESTAMP_SHIFT)
}

/// A single dynamically-typed property value.
///
/// Decoding normalizes width variants onto the canonical types: every
/// integer width becomes `Int(i64)`, every float width becomes `Float(f64)`,
/// and byte strings become text (`String`).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Null,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::Null => serializer.serialize_unit(),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an integer, float, boolean, string, binary, or nil value")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {v} exceeds i64 range")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::String(v))
    }

    // Raw-to-string policy: byte strings decode as text.
    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> {
        Ok(Value::String(String::from_utf8_lossy(v).into_owned()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
        match String::from_utf8(v) {
            Ok(s) => Ok(Value::String(s)),
            Err(e) => Ok(Value::String(
                String::from_utf8_lossy(e.as_bytes()).into_owned(),
            )),
        }
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// A timestamped record of property values for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: OffsetDateTime,
    pub data: BTreeMap<i64, Value>,
}

impl Event {
    pub fn new(timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp,
            data: BTreeMap::new(),
        }
    }

    /// Builder method: set a property value.
    pub fn set(mut self, property_id: i64, value: impl Into<Value>) -> Self {
        self.data.insert(property_id, value.into());
        self
    }
}

/// The on-disk shape of an event: shifted microseconds plus raw data map
/// (factor values still encoded as indices).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawEvent {
    pub micros: i64,
    pub data: BTreeMap<i64, Value>,
}

impl RawEvent {
    pub fn marshal(&self, stats: &TableStatistics) -> Result<Vec<u8>> {
        let started = Instant::now();
        let mut buf = Vec::with_capacity(TS_KEY_LEN + 16);
        buf.extend_from_slice(&(self.micros + TIMESTAMP_SHIFT).to_be_bytes());
        rmp_serde::encode::write(&mut buf, &self.data)?;
        stats.marshal.record(started);
        Ok(buf)
    }

    pub fn unmarshal(bytes: &[u8], stats: &TableStatistics) -> Result<RawEvent> {
        let started = Instant::now();
        if bytes.len() < TS_KEY_LEN {
            return Err(TableError::Encoding(format!(
                "event record truncated: {} bytes",
                bytes.len()
            )));
        }
        let mut ts = [0u8; TS_KEY_LEN];
        ts.copy_from_slice(&bytes[..TS_KEY_LEN]);
        let micros = i64::from_be_bytes(ts) - TIMESTAMP_SHIFT;
        let data: BTreeMap<i64, Value> = rmp_serde::from_slice(&bytes[TS_KEY_LEN..])?;
        stats.unmarshal.record(started);
        Ok(RawEvent { micros, data })
    }
}
