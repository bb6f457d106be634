//! Table tuning options.
//!
//! Options come from three layers, lowest priority first: the defaults
//! below, an optional TOML file, and `EVENTABLE__*` environment variables
//! (for example `EVENTABLE__TABLE__SHARD_COUNT=8` maps to
//! `table.shard_count`).

use std::path::Path;
use std::time::Duration;

use config::{Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of factor cache entries kept per property, per direction.
pub const FACTOR_CACHE_SIZE: usize = 1000;

/// Upper bound on objects swept and on events deleted in one sweep batch.
pub const SWEEP_BATCH_SIZE: usize = 1000;

/// How long `Table::open` waits for a lock-contended keyspace.
pub const DB_OPEN_TIMEOUT: Duration = Duration::from_secs(1);

const ENV_PREFIX: &str = "EVENTABLE";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("failed to load options: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid options: {0}")]
    Invalid(String),
}

/// Wire shape of an options file: everything lives under `[table]`.
#[derive(Debug, Default, Deserialize, Serialize)]
struct OptionsDocument {
    #[serde(default)]
    table: TableOptions,
}

/// Tunables for one table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableOptions {
    /// Number of shard partitions; fixed once the table is created. The
    /// persisted meta document wins over this value on reopen.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    #[serde(default = "default_factor_cache_size")]
    pub factor_cache_size: usize,
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            factor_cache_size: default_factor_cache_size(),
            sweep_batch_size: default_sweep_batch_size(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

impl TableOptions {
    /// Load options from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, OptionsError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            tracing::info!("loading table options from: {}", path.display());
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let document: OptionsDocument = builder.build()?.try_deserialize()?;
        document.table.validate()?;
        Ok(document.table)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    fn validate(&self) -> Result<(), OptionsError> {
        if self.shard_count == 0 {
            return Err(OptionsError::Invalid("shard_count must be positive".into()));
        }
        if self.factor_cache_size == 0 {
            return Err(OptionsError::Invalid(
                "factor_cache_size must be positive".into(),
            ));
        }
        if self.sweep_batch_size == 0 {
            return Err(OptionsError::Invalid(
                "sweep_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_factor_cache_size() -> usize {
    FACTOR_CACHE_SIZE
}

fn default_sweep_batch_size() -> usize {
    SWEEP_BATCH_SIZE
}

fn default_open_timeout_ms() -> u64 {
    DB_OPEN_TIMEOUT.as_millis() as u64
}
