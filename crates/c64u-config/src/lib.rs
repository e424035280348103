//! Safety configuration persistence and live distribution.
//!
//! TOML file + environment loading for [`SafetyConfig`], and the
//! [`SafetyConfigStore`] that owns the current value and broadcasts
//! replacements through a `watch` channel. The interaction gate in
//! `c64u-core` holds only a receiver: it sees every reload but never
//! touches disk itself.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use c64u_core::SafetyConfig;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the safety config path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "c64u", "c64u").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("safety.toml");
            p
        },
        |dirs| dirs.config_dir().join("safety.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("c64u");
    p
}

// ── Loading / saving ────────────────────────────────────────────────

/// Load the safety config from the canonical path + environment.
///
/// Layering: serde defaults, then the TOML file, then `C64U_SAFETY_*`
/// environment variables (e.g. `C64U_SAFETY_REST_MAX_CONCURRENCY=1`).
pub fn load_config() -> Result<SafetyConfig, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit path (tests, --config flags).
pub fn load_config_from(path: &Path) -> Result<SafetyConfig, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(SafetyConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("C64U_SAFETY_"));

    let config: SafetyConfig = figment.extract()?;
    validate(&config)?;
    Ok(config)
}

/// Load, falling back to defaults when the file is missing or broken.
pub fn load_config_or_default() -> SafetyConfig {
    load_config().unwrap_or_default()
}

/// Serialize to TOML and write to the canonical config path.
pub fn save_config(config: &SafetyConfig) -> Result<(), ConfigError> {
    save_config_to(&config_path(), config)
}

/// Save to an explicit path, creating parent directories.
pub fn save_config_to(path: &Path, config: &SafetyConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(config)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

/// Reject values the gate cannot floor into sanity at point of use.
pub fn validate(config: &SafetyConfig) -> Result<(), ConfigError> {
    if !config.backoff_factor.is_finite() || config.backoff_factor < 0.0 {
        return Err(ConfigError::Validation {
            field: "backoff_factor".into(),
            reason: format!("must be a finite non-negative number, got {}", config.backoff_factor),
        });
    }
    if config.circuit_breaker_threshold > 0 && config.circuit_breaker_cooldown.is_zero() {
        return Err(ConfigError::Validation {
            field: "circuit_breaker_cooldown_ms".into(),
            reason: "must be positive when the circuit breaker is enabled".into(),
        });
    }
    Ok(())
}

// ── Live store ──────────────────────────────────────────────────────

/// Owns the current [`SafetyConfig`] and notifies subscribers on
/// change.
///
/// The value is replaced wholesale; a write that compares equal to the
/// current config does not notify, so accidental no-op saves never
/// trigger the gate's reset-everything reload path.
pub struct SafetyConfigStore {
    tx: watch::Sender<SafetyConfig>,
    path: PathBuf,
}

impl SafetyConfigStore {
    /// Store seeded with `initial`, persisting to the canonical path.
    pub fn new(initial: SafetyConfig) -> Self {
        Self::with_path(config_path(), initial)
    }

    /// Store persisting to an explicit path.
    pub fn with_path(path: PathBuf, initial: SafetyConfig) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx, path }
    }

    /// Load the store from disk (canonical path), using defaults when
    /// the file does not exist yet.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        let config = load_config_from(&path)?;
        Ok(Self::with_path(path, config))
    }

    /// The current config value.
    pub fn current(&self) -> SafetyConfig {
        self.tx.borrow().clone()
    }

    /// Subscribe to config replacements. Hand this to
    /// `DeviceGate::builder`.
    pub fn subscribe(&self) -> watch::Receiver<SafetyConfig> {
        self.tx.subscribe()
    }

    /// Replace the config. Validates first; returns whether the value
    /// actually changed (and therefore whether subscribers were
    /// notified).
    pub fn update(&self, next: SafetyConfig) -> Result<bool, ConfigError> {
        validate(&next)?;
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            info!("safety config updated");
        }
        Ok(changed)
    }

    /// Re-read the config file and apply it.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let config = load_config_from(&self.path)?;
        self.update(config)
    }

    /// Persist the current value to this store's path.
    pub fn save(&self) -> Result<(), ConfigError> {
        save_config_to(&self.path, &self.current())
    }
}

impl Default for SafetyConfigStore {
    fn default() -> Self {
        Self::new(SafetyConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SafetyConfig::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety.toml");
        std::fs::write(&path, "rest_max_concurrency = 1\ninfo_cache_ms = 9000\n").unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.rest_max_concurrency, 1);
        assert_eq!(config.info_cache, Duration::from_millis(9000));
        assert_eq!(config.ftp_max_concurrency, SafetyConfig::default().ftp_max_concurrency);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("safety.toml");

        let mut config = SafetyConfig::default();
        config.circuit_breaker_threshold = 7;
        save_config_to(&path, &config).unwrap();

        let back = load_config_from(&path).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn validation_rejects_nonsense() {
        let mut config = SafetyConfig::default();
        config.backoff_factor = f64::NAN;
        assert!(validate(&config).is_err());

        let mut config = SafetyConfig::default();
        config.circuit_breaker_threshold = 3;
        config.circuit_breaker_cooldown = Duration::ZERO;
        assert!(validate(&config).is_err());

        assert!(validate(&SafetyConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn update_notifies_only_on_change() {
        let store = SafetyConfigStore::with_path("/tmp/unused.toml".into(), SafetyConfig::default());
        let mut rx = store.subscribe();

        // No-op write: same value, no notification.
        assert!(!store.update(SafetyConfig::default()).unwrap());
        assert!(!rx.has_changed().unwrap());

        let mut next = store.current();
        next.rest_max_concurrency = 1;
        assert!(store.update(next.clone()).unwrap());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert_eq!(store.current(), next);
    }

    #[test]
    fn update_refuses_invalid_config() {
        let store = SafetyConfigStore::with_path("/tmp/unused.toml".into(), SafetyConfig::default());
        let mut bad = store.current();
        bad.backoff_factor = f64::INFINITY;
        assert!(store.update(bad).is_err());
        // Current value untouched.
        assert_eq!(store.current(), SafetyConfig::default());
    }
}
