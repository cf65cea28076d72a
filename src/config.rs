//! Engine configuration: defaults, TOML loading and validation.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

/// Default planned bytes per chunk (8 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default upper bound on chunks per transfer.
pub const DEFAULT_MAX_CHUNKS: usize = 16;

/// Default per-domain admission ceiling.
pub const DEFAULT_DOMAIN_CONCURRENCY: usize = 2;

/// Default number of chunk workers running across all batches.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 16;

/// Default retries after the first attempt.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for `{field}`: {value}. Expected range: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: &'static str,
    },
}

/// Tunable engine parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Planned bytes per chunk.
    pub chunk_size: u64,
    /// Upper bound on chunks per transfer.
    pub max_chunks: usize,
    /// Default admission ceiling per domain.
    pub domain_concurrency: usize,
    /// Per-domain ceilings, matched on the domain or any parent domain.
    pub domain_overrides: HashMap<String, usize>,
    /// Chunk workers running across all batches.
    pub worker_pool_size: usize,
    /// Requests per window per domain. Zero disables pacing.
    pub rate_limit_requests: u32,
    pub rate_limit_window_ms: u64,
    /// Retries after the first attempt.
    pub retry_budget: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Root of the temp disk.
    pub temp_dir: PathBuf,
    /// Root of the permanent disk.
    pub storage_dir: PathBuf,
    /// SQLite database file used by the CLI.
    pub database: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks: DEFAULT_MAX_CHUNKS,
            domain_concurrency: DEFAULT_DOMAIN_CONCURRENCY,
            domain_overrides: HashMap::new(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            rate_limit_requests: 4,
            rate_limit_window_ms: 1000,
            retry_budget: DEFAULT_RETRY_BUDGET,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 32_000,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            temp_dir: PathBuf::from("./data/tmp"),
            storage_dir: PathBuf::from("./data/store"),
            database: PathBuf::from("./data/transfers.db"),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::InvalidValue`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`EngineConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::InvalidValue`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("chunk_size", self.chunk_size, 1..=u64::MAX, "1..")?;
        check("max_chunks", self.max_chunks, 1..=1024, "1..=1024")?;
        check("domain_concurrency", self.domain_concurrency, 1..=64, "1..=64")?;
        for (domain, ceiling) in &self.domain_overrides {
            check(
                &format!("domain_overrides.{domain}"),
                *ceiling,
                1..=64,
                "1..=64",
            )?;
        }
        check("worker_pool_size", self.worker_pool_size, 1..=256, "1..=256")?;
        check("retry_budget", self.retry_budget, 0..=10, "0..=10")?;
        check("rate_limit_window_ms", self.rate_limit_window_ms, 1..=3_600_000, "1..=3600000")?;
        check(
            "connect_timeout_secs",
            self.connect_timeout_secs,
            1..=3600,
            "1..=3600",
        )?;
        check("read_timeout_secs", self.read_timeout_secs, 1..=3600, "1..=3600")?;
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry_max_delay_ms".to_string(),
                value: self.retry_max_delay_ms.to_string(),
                expected: ">= retry_base_delay_ms",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    #[must_use]
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

fn check<T>(
    field: &str,
    value: T,
    range: std::ops::RangeInclusive<T>,
    expected: &'static str,
) -> Result<(), ConfigError>
where
    T: PartialOrd + ToString,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            expected,
        })
    }
}

/// Default config file location.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/transfer-engine/config.toml`
/// 2. `$HOME/.config/transfer-engine/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("transfer-engine")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("transfer-engine")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.retry_budget, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            chunk_size = 2000000
            domain_concurrency = 3

            [domain_overrides]
            "cdn.example.com" = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 2_000_000);
        assert_eq!(config.domain_concurrency, 3);
        assert_eq!(config.domain_overrides.get("cdn.example.com"), Some(&1));
        assert_eq!(config.max_chunks, DEFAULT_MAX_CHUNKS);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let result = EngineConfig::from_toml_str("chunk_sise = 10");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let err = EngineConfig::from_toml_str("max_chunks = 0").unwrap_err();
        assert!(err.to_string().contains("max_chunks"));

        let err = EngineConfig::from_toml_str("retry_budget = 11").unwrap_err();
        assert!(err.to_string().contains("0..=10"));

        let err = EngineConfig::from_toml_str("[domain_overrides]\n\"a.example\" = 0").unwrap_err();
        assert!(err.to_string().contains("domain_overrides.a.example"));
    }

    #[test]
    fn test_max_delay_must_cover_base_delay() {
        let config = EngineConfig {
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "worker_pool_size = 4\n").unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().worker_pool_size, 4);

        let missing = EngineConfig::load(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
