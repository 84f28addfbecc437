//! Persistence configuration.
//!
//! The configuration is built once at startup, either literally or from the
//! environment, and handed to [`Persistence`](crate::persistence::Persistence)
//! which owns it for its whole lifetime.

use crate::time::TimeUnit;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid boolean: {value}")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var} is not a valid duration amount: {value}")]
    InvalidDuration { var: &'static str, value: String },

    #[error("{var} is not a valid time unit: {value}")]
    InvalidUnit { var: &'static str, value: String },
}

/// Configuration for the persistence engine.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Master switch. When off every registry call fails with `Disabled`.
    pub enabled: bool,

    /// Run mutations on the async runtime instead of inline.
    pub run_async: bool,

    /// Directory holding one `.aof` file per key.
    pub root: PathBuf,

    /// Entries with a shorter ttl are not persisted.
    pub min_duration: u64,
    pub min_duration_unit: TimeUnit,

    /// Ttl applied to entries stored without one.
    pub default_duration: u64,
    pub default_duration_unit: TimeUnit,

    /// Whether entries stored without an explicit ttl are persisted.
    pub persist_undated: bool,

    /// Name prefixes selecting which recovery listeners run. Empty = all.
    pub listener_paths: Vec<String>,

    /// Prefix prepended to every file name.
    pub file_prefix: String,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            run_async: false,
            root: std::env::temp_dir().join("cache-persist"),
            min_duration: 0,
            min_duration_unit: TimeUnit::Milliseconds,
            default_duration: 30,
            default_duration_unit: TimeUnit::Minutes,
            persist_undated: true,
            listener_paths: Vec::new(),
            file_prefix: "$".to_string(),
        }
    }
}

impl PersistConfig {
    /// Creates an enabled configuration rooted at `root`, with defaults elsewhere.
    pub fn enabled_at(root: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - CACHE_PERSIST_ENABLED: persistence on/off (default: false)
    /// - CACHE_PERSIST_ASYNC: run writes asynchronously (default: false)
    /// - CACHE_PERSIST_PATH: root directory (default: $TMPDIR/cache-persist)
    /// - CACHE_PERSIST_MIN_DURATION / CACHE_PERSIST_MIN_DURATION_UNIT (default: 0 MILLISECONDS)
    /// - CACHE_PERSIST_DEFAULT_DURATION / CACHE_PERSIST_DEFAULT_DURATION_UNIT (default: 30 MINUTES)
    /// - CACHE_PERSIST_UNDATED: persist entries without explicit ttl (default: true)
    /// - CACHE_PERSIST_LISTENER_PATHS: comma-separated listener prefixes (default: all)
    /// - CACHE_PERSIST_FILE_PREFIX: file name prefix (default: $)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let root = std::env::var("CACHE_PERSIST_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.root);

        let listener_paths = std::env::var("CACHE_PERSIST_LISTENER_PATHS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let file_prefix =
            std::env::var("CACHE_PERSIST_FILE_PREFIX").unwrap_or(defaults.file_prefix);

        Ok(Self {
            enabled: env_bool("CACHE_PERSIST_ENABLED", defaults.enabled)?,
            run_async: env_bool("CACHE_PERSIST_ASYNC", defaults.run_async)?,
            root,
            min_duration: env_u64("CACHE_PERSIST_MIN_DURATION", defaults.min_duration)?,
            min_duration_unit: env_unit(
                "CACHE_PERSIST_MIN_DURATION_UNIT",
                defaults.min_duration_unit,
            )?,
            default_duration: env_u64(
                "CACHE_PERSIST_DEFAULT_DURATION",
                defaults.default_duration,
            )?,
            default_duration_unit: env_unit(
                "CACHE_PERSIST_DEFAULT_DURATION_UNIT",
                defaults.default_duration_unit,
            )?,
            persist_undated: env_bool("CACHE_PERSIST_UNDATED", defaults.persist_undated)?,
            listener_paths,
            file_prefix,
        })
    }

    /// Minimum persistable ttl in milliseconds.
    pub fn min_duration_millis(&self) -> u64 {
        self.min_duration_unit.to_millis(self.min_duration)
    }

    /// Returns true if a listener registered under `name` should run.
    pub fn listener_enabled(&self, name: &str) -> bool {
        self.listener_paths.is_empty() || self.listener_paths.iter().any(|p| name.starts_with(p))
    }
}

fn env_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Ok(v) => parse_bool(&v).ok_or(ConfigError::InvalidBool { var, value: v }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidDuration { var, value: v }),
        Err(_) => Ok(default),
    }
}

fn env_unit(var: &'static str, default: TimeUnit) -> Result<TimeUnit, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidUnit { var, value: v }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "CACHE_PERSIST_ENABLED",
        "CACHE_PERSIST_ASYNC",
        "CACHE_PERSIST_PATH",
        "CACHE_PERSIST_MIN_DURATION",
        "CACHE_PERSIST_MIN_DURATION_UNIT",
        "CACHE_PERSIST_DEFAULT_DURATION",
        "CACHE_PERSIST_DEFAULT_DURATION_UNIT",
        "CACHE_PERSIST_UNDATED",
        "CACHE_PERSIST_LISTENER_PATHS",
        "CACHE_PERSIST_FILE_PREFIX",
    ];

    // Environment tests mutate process state, so they run as one test.
    #[test]
    fn test_from_env() {
        for var in VARS {
            std::env::remove_var(var);
        }

        let config = PersistConfig::from_env().unwrap();
        assert!(!config.enabled);
        assert!(!config.run_async);
        assert_eq!(config.default_duration, 30);
        assert_eq!(config.default_duration_unit, TimeUnit::Minutes);
        assert_eq!(config.file_prefix, "$");
        assert!(config.listener_paths.is_empty());

        std::env::set_var("CACHE_PERSIST_ENABLED", "yes");
        std::env::set_var("CACHE_PERSIST_PATH", "/tmp/c");
        std::env::set_var("CACHE_PERSIST_MIN_DURATION", "5");
        std::env::set_var("CACHE_PERSIST_MIN_DURATION_UNIT", "s");
        std::env::set_var("CACHE_PERSIST_LISTENER_PATHS", "app.session, app.user");

        let config = PersistConfig::from_env().unwrap();
        assert!(config.enabled);
        assert_eq!(config.root, PathBuf::from("/tmp/c"));
        assert_eq!(config.min_duration_millis(), 5_000);
        assert_eq!(config.listener_paths, vec!["app.session", "app.user"]);

        std::env::set_var("CACHE_PERSIST_ASYNC", "maybe");
        assert!(matches!(
            PersistConfig::from_env(),
            Err(ConfigError::InvalidBool { var: "CACHE_PERSIST_ASYNC", .. })
        ));

        std::env::set_var("CACHE_PERSIST_ASYNC", "false");
        std::env::set_var("CACHE_PERSIST_DEFAULT_DURATION_UNIT", "fortnights");
        assert!(matches!(
            PersistConfig::from_env(),
            Err(ConfigError::InvalidUnit { .. })
        ));

        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_listener_enabled() {
        let mut config = PersistConfig::default();
        assert!(config.listener_enabled("anything"));

        config.listener_paths = vec!["app.session".to_string()];
        assert!(config.listener_enabled("app.session.Audit"));
        assert!(!config.listener_enabled("app.user.Audit"));
    }
}
