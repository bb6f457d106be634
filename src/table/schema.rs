//! Table schema: the property set and its JSON meta document.
//!
//! The meta document is stored under key `"meta"` in the `meta` partition
//! and rewritten whenever the schema mutates. In memory the schema is an
//! immutable snapshot behind an `Arc`; mutations build a new snapshot
//! (copy-on-write) so concurrent readers never observe a half-applied
//! change.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{Result, TableError};

/// Declared type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Factor,
    String,
    Integer,
    Float,
    Boolean,
}

/// A named, typed attribute of a table.
///
/// Permanent properties have positive ids, transient properties negative
/// ids. Ids are allocated once and never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: i64,
    pub name: String,
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    pub transient: bool,
}

impl Property {
    pub fn is_factor(&self) -> bool {
        self.data_type == DataType::Factor
    }
}

/// Wire shape of the meta document.
#[derive(Debug, Serialize, Deserialize)]
struct MetaDocument {
    name: String,
    #[serde(rename = "shardCount")]
    shard_count: usize,
    #[serde(rename = "maxPermanentID")]
    max_permanent_id: i64,
    #[serde(rename = "maxTransientID")]
    max_transient_id: i64,
    properties: Vec<Property>,
}

/// Immutable schema snapshot with lookup indexes by name and by id.
#[derive(Debug, Clone)]
pub(crate) struct Schema {
    pub name: String,
    pub shard_count: usize,
    pub max_permanent_id: i64,
    /// Magnitude of the most negative transient id.
    pub max_transient_id: i64,
    by_name: HashMap<String, Arc<Property>>,
    by_id: HashMap<i64, Arc<Property>>,
}

impl Schema {
    pub fn new(name: &str, shard_count: usize) -> Self {
        Self {
            name: name.to_string(),
            shard_count,
            max_permanent_id: 0,
            max_transient_id: 0,
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let doc: MetaDocument = serde_json::from_slice(bytes)?;
        let mut schema = Schema {
            name: doc.name,
            shard_count: doc.shard_count,
            max_permanent_id: doc.max_permanent_id,
            max_transient_id: doc.max_transient_id,
            by_name: HashMap::with_capacity(doc.properties.len()),
            by_id: HashMap::with_capacity(doc.properties.len()),
        };
        for property in doc.properties {
            schema.index(Arc::new(property));
        }
        Ok(schema)
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let doc = MetaDocument {
            name: self.name.clone(),
            shard_count: self.shard_count,
            max_permanent_id: self.max_permanent_id,
            max_transient_id: self.max_transient_id,
            properties: self.properties().iter().map(|p| (**p).clone()).collect(),
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    pub fn property(&self, name: &str) -> Option<Arc<Property>> {
        self.by_name.get(name).cloned()
    }

    pub fn property_by_id(&self, id: i64) -> Option<Arc<Property>> {
        self.by_id.get(&id).cloned()
    }

    /// All properties, ordered by id (transient ids first).
    pub fn properties(&self) -> Vec<Arc<Property>> {
        let mut properties: Vec<_> = self.by_id.values().cloned().collect();
        properties.sort_by_key(|p| p.id);
        properties
    }

    /// Copy-on-write property creation; allocates the next permanent or
    /// transient id.
    pub fn with_property(
        &self,
        name: &str,
        data_type: DataType,
        transient: bool,
    ) -> Result<(Schema, Arc<Property>)> {
        if self.by_name.contains_key(name) {
            return Err(TableError::DuplicateProperty(name.to_string()));
        }

        let mut next = self.clone();
        let id = if transient {
            next.max_transient_id += 1;
            -next.max_transient_id
        } else {
            next.max_permanent_id += 1;
            next.max_permanent_id
        };
        let property = Arc::new(Property {
            id,
            name: name.to_string(),
            data_type,
            transient,
        });
        next.index(property.clone());
        Ok((next, property))
    }

    /// Copy-on-write rename; the id and data type are untouched, so stored
    /// events and factor buckets remain valid.
    pub fn with_renamed(&self, old: &str, new: &str) -> Result<Schema> {
        if self.by_name.contains_key(new) {
            return Err(TableError::DuplicateProperty(new.to_string()));
        }
        let existing = self
            .by_name
            .get(old)
            .ok_or_else(|| TableError::PropertyNotFound(old.to_string()))?;

        let renamed = Arc::new(Property {
            name: new.to_string(),
            ..(**existing).clone()
        });
        let mut next = self.clone();
        next.by_name.remove(old);
        next.index(renamed);
        Ok(next)
    }

    fn index(&mut self, property: Arc<Property>) {
        self.by_name.insert(property.name.clone(), property.clone());
        self.by_id.insert(property.id, property);
    }
}
