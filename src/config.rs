use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TxBatchError;

const DEFAULT_MAX_SIZE: usize = 10;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for sizing the connection pool and bounding its waits.
///
/// In JSON the durations are plain millisecond counts:
///
/// ```json
/// { "min_size": 1, "max_size": 4, "connect_timeout": 30000, "statement_timeout": 5000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub statement_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: DEFAULT_MAX_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
        }
    }
}

impl PoolOptions {
    #[must_use]
    pub fn builder() -> PoolOptionsBuilder {
        PoolOptionsBuilder::default()
    }

    /// Parse options from a JSON document and validate them.
    ///
    /// # Errors
    /// Returns `TxBatchError::ConfigError` if the JSON is malformed or the bounds are inconsistent.
    pub fn from_json(json: &str) -> Result<Self, TxBatchError> {
        let opts: PoolOptions = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Read and validate options from a JSON file.
    ///
    /// # Errors
    /// Returns `TxBatchError::ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TxBatchError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TxBatchError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Check the size bounds and timeouts.
    ///
    /// # Errors
    /// Returns `TxBatchError::ConfigError` describing the first violated bound.
    pub fn validate(&self) -> Result<(), TxBatchError> {
        if self.max_size == 0 {
            return Err(TxBatchError::ConfigError(
                "max_size must be at least 1".into(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(TxBatchError::ConfigError(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(TxBatchError::ConfigError(
                "connect_timeout must be non-zero".into(),
            ));
        }
        if self.statement_timeout.is_zero() {
            return Err(TxBatchError::ConfigError(
                "statement_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`PoolOptions`].
#[derive(Debug, Clone, Default)]
pub struct PoolOptionsBuilder {
    opts: PoolOptions,
}

impl PoolOptionsBuilder {
    #[must_use]
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.opts.min_size = min_size;
        self
    }

    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.opts.max_size = max_size;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.opts.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.opts.statement_timeout = timeout;
        self
    }

    /// Validate and return the options.
    ///
    /// # Errors
    /// Returns `TxBatchError::ConfigError` if the bounds are inconsistent.
    pub fn finish(self) -> Result<PoolOptions, TxBatchError> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }
}
