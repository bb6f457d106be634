//! Key layout for the table's fjall partitions.
//!
//! Partition structure:
//! - `meta`: `"meta"` -> schema document (JSON)
//! - `shard_<i>`: `u16_be(len(id)) ++ id ++ ts_key` -> event record bytes
//! - `factor_<id>` (`factor_t<n>` for transient id `-n`):
//!   - `">" ++ value` -> factor index (MessagePack uint)
//!   - `"<" ++ decimal(index)` -> value bytes
//!   - `"!next"` -> allocator cursor (MessagePack uint)
//!
//! Object ids are framed with a length prefix so one shard partition can
//! hold many objects without separator ambiguity; every key of one object
//! shares the frame prefix, and the 8-byte timestamp suffix keeps events
//! in chronological order within the frame.

use std::hash::Hasher;

use super::error::{Result, TableError};

/// Length of the timestamp suffix on every event key.
pub(crate) const TS_KEY_LEN: usize = 8;

pub(crate) const META_PARTITION: &str = "meta";
pub(crate) const META_KEY: &[u8] = b"meta";

/// Factor bucket key prefixes: value-to-index and index-to-value.
pub(crate) const FACTOR_FORWARD_PREFIX: u8 = b'>';
pub(crate) const FACTOR_REVERSE_PREFIX: u8 = b'<';
/// Allocator cursor key; `!` sorts before both direction prefixes.
pub(crate) const FACTOR_NEXT_KEY: &[u8] = b"!next";

pub(crate) fn shard_partition_name(index: usize) -> String {
    format!("shard_{index}")
}

pub(crate) fn factor_partition_name(property_id: i64) -> String {
    if property_id < 0 {
        format!("factor_t{}", -property_id)
    } else {
        format!("factor_{property_id}")
    }
}

/// Shard placement for an object id. FNV-1a is stable across releases,
/// which matters because placement is persisted.
pub(crate) fn shard_index(object_id: &str, shard_count: usize) -> usize {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(object_id.as_bytes());
    (hasher.finish() % shard_count as u64) as usize
}

/// Frame prefix shared by all event keys of one object.
pub(crate) fn object_key_prefix(object_id: &str) -> Result<Vec<u8>> {
    let bytes = object_id.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| TableError::ObjectIdTooLong(bytes.len()))?;
    let mut key = Vec::with_capacity(2 + bytes.len());
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(bytes);
    Ok(key)
}

pub(crate) fn event_key(object_prefix: &[u8], ts_key: [u8; TS_KEY_LEN]) -> Vec<u8> {
    let mut key = Vec::with_capacity(object_prefix.len() + TS_KEY_LEN);
    key.extend_from_slice(object_prefix);
    key.extend_from_slice(&ts_key);
    key
}

/// Greatest possible event key for the frame; seeking strictly past it
/// lands on the next object.
pub(crate) fn object_upper_bound(object_prefix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(object_prefix.len() + TS_KEY_LEN);
    key.extend_from_slice(object_prefix);
    key.extend_from_slice(&[0xff; TS_KEY_LEN]);
    key
}

/// Split an event key back into its frame prefix and object id.
pub(crate) fn split_event_key(key: &[u8]) -> Option<(&[u8], &str)> {
    if key.len() < 2 + TS_KEY_LEN {
        return None;
    }
    let len = u16::from_be_bytes([key[0], key[1]]) as usize;
    if key.len() != 2 + len + TS_KEY_LEN {
        return None;
    }
    let prefix = &key[..2 + len];
    let id = std::str::from_utf8(&key[2..2 + len]).ok()?;
    Some((prefix, id))
}

pub(crate) fn factor_forward_key(value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + value.len());
    key.push(FACTOR_FORWARD_PREFIX);
    key.extend_from_slice(value.as_bytes());
    key
}

pub(crate) fn factor_reverse_key(index: u64) -> Vec<u8> {
    let mut key = vec![FACTOR_REVERSE_PREFIX];
    key.extend_from_slice(index.to_string().as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_names() {
        assert_eq!(shard_partition_name(3), "shard_3");
        assert_eq!(factor_partition_name(12), "factor_12");
        assert_eq!(factor_partition_name(-4), "factor_t4");
    }

    #[test]
    fn test_object_key_framing() {
        let prefix = object_key_prefix("u1").unwrap();
        assert_eq!(prefix, vec![0x00, 0x02, b'u', b'1']);

        let key = event_key(&prefix, [0x01; 8]);
        assert_eq!(key.len(), prefix.len() + TS_KEY_LEN);

        let (split_prefix, id) = split_event_key(&key).unwrap();
        assert_eq!(split_prefix, prefix.as_slice());
        assert_eq!(id, "u1");
    }

    #[test]
    fn test_object_upper_bound_sorts_last() {
        let prefix = object_key_prefix("user").unwrap();
        let upper = object_upper_bound(&prefix);
        let max_event = event_key(&prefix, [0xff; 8]);
        assert_eq!(upper, max_event);
        let earlier = event_key(&prefix, [0xfe; 8]);
        assert!(earlier < upper);
    }

    #[test]
    fn test_shard_index_is_stable() {
        let a = shard_index("user-42", 8);
        let b = shard_index("user-42", 8);
        assert_eq!(a, b);
        assert!(a < 8);
        // Single shard always maps to zero.
        assert_eq!(shard_index("anything", 1), 0);
    }

    #[test]
    fn test_oversized_object_id_rejected() {
        let id = "x".repeat(usize::from(u16::MAX) + 1);
        assert!(matches!(
            object_key_prefix(&id),
            Err(TableError::ObjectIdTooLong(_))
        ));
    }

    #[test]
    fn test_factor_keys() {
        assert_eq!(factor_forward_key("click"), b">click");
        assert_eq!(factor_reverse_key(1), b"<1");
        // The allocator key must not collide with either direction prefix.
        assert!(FACTOR_NEXT_KEY[0] != FACTOR_FORWARD_PREFIX);
        assert!(FACTOR_NEXT_KEY[0] != FACTOR_REVERSE_PREFIX);
    }
}
