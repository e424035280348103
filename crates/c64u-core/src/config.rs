// ── Safety configuration ──
//
// Live-reloadable parameter set for the interaction gate: concurrency
// limits, cache/cooldown durations, backoff and circuit-breaker tuning.
// Persistence lives in c64u-config -- this crate only holds a read-only
// cached copy, replaced wholesale through a `watch` channel on reload.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Safety parameters for device interaction scheduling.
///
/// Durations serialize as integer milliseconds (`*_ms` keys in TOML).
/// `PartialEq` matters: a no-op config write must not trigger the
/// reset-everything reload path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Max simultaneous REST requests. Floored at 1 at point of use.
    #[serde(default = "default_rest_concurrency")]
    pub rest_max_concurrency: u32,

    /// Max simultaneous FTP operations. Floored at 1 at point of use.
    #[serde(default = "default_ftp_concurrency")]
    pub ftp_max_concurrency: u32,

    /// How long a `GET /v1/info` response stays fresh.
    #[serde(rename = "info_cache_ms", with = "duration_millis", default = "default_info_cache")]
    pub info_cache: Duration,

    /// How long a `GET /v1/configs` response stays fresh.
    #[serde(
        rename = "configs_cache_ms",
        with = "duration_millis",
        default = "default_configs_cache"
    )]
    pub configs_cache: Duration,

    /// Minimum spacing between live `GET /v1/configs` round trips.
    #[serde(
        rename = "configs_cooldown_ms",
        with = "duration_millis",
        default = "default_configs_cooldown"
    )]
    pub configs_cooldown: Duration,

    /// Minimum spacing between live `GET /v1/drives` round trips.
    #[serde(
        rename = "drives_cooldown_ms",
        with = "duration_millis",
        default = "default_drives_cooldown"
    )]
    pub drives_cooldown: Duration,

    /// Minimum spacing between FTP operations on the same key,
    /// measured from completion of the previous one.
    #[serde(
        rename = "ftp_list_cooldown_ms",
        with = "duration_millis",
        default = "default_ftp_list_cooldown"
    )]
    pub ftp_list_cooldown: Duration,

    /// Base delay for exponential backoff. Zero disables backoff.
    #[serde(rename = "backoff_base_ms", with = "duration_millis", default = "default_backoff_base")]
    pub backoff_base: Duration,

    /// Backoff ceiling. Zero disables backoff.
    #[serde(rename = "backoff_max_ms", with = "duration_millis", default = "default_backoff_max")]
    pub backoff_max: Duration,

    /// Backoff growth factor per consecutive failure. Floored at 1.0
    /// at point of use.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Consecutive critical failures before the circuit opens.
    /// Zero disables the breaker.
    #[serde(default = "default_circuit_threshold")]
    pub circuit_breaker_threshold: u32,

    /// How long an opened circuit stays open.
    #[serde(
        rename = "circuit_breaker_cooldown_ms",
        with = "duration_millis",
        default = "default_circuit_cooldown"
    )]
    pub circuit_breaker_cooldown: Duration,

    /// Whether user-intent requests may push through an open circuit
    /// or ERROR state (audited as an override).
    #[serde(default = "default_allow_override")]
    pub allow_user_override_circuit: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            rest_max_concurrency: default_rest_concurrency(),
            ftp_max_concurrency: default_ftp_concurrency(),
            info_cache: default_info_cache(),
            configs_cache: default_configs_cache(),
            configs_cooldown: default_configs_cooldown(),
            drives_cooldown: default_drives_cooldown(),
            ftp_list_cooldown: default_ftp_list_cooldown(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            backoff_factor: default_backoff_factor(),
            circuit_breaker_threshold: default_circuit_threshold(),
            circuit_breaker_cooldown: default_circuit_cooldown(),
            allow_user_override_circuit: default_allow_override(),
        }
    }
}

fn default_rest_concurrency() -> u32 {
    2
}
fn default_ftp_concurrency() -> u32 {
    1
}
fn default_info_cache() -> Duration {
    Duration::from_millis(3000)
}
fn default_configs_cache() -> Duration {
    Duration::from_millis(5000)
}
fn default_configs_cooldown() -> Duration {
    Duration::from_millis(2000)
}
fn default_drives_cooldown() -> Duration {
    Duration::from_millis(1500)
}
fn default_ftp_list_cooldown() -> Duration {
    Duration::from_millis(1000)
}
fn default_backoff_base() -> Duration {
    Duration::from_millis(250)
}
fn default_backoff_max() -> Duration {
    Duration::from_millis(5000)
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_circuit_threshold() -> u32 {
    4
}
fn default_circuit_cooldown() -> Duration {
    Duration::from_millis(15_000)
}
fn default_allow_override() -> bool {
    true
}

/// Serde adapter: `Duration` as integer milliseconds.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_round_trips_through_toml() {
        let cfg = SafetyConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: SafetyConfig = toml::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn durations_deserialize_from_millis() {
        let cfg: SafetyConfig = toml::from_str(
            "info_cache_ms = 5000\nbackoff_base_ms = 100\nbackoff_max_ms = 1000\n",
        )
        .unwrap();
        assert_eq!(cfg.info_cache, Duration::from_millis(5000));
        assert_eq!(cfg.backoff_base, Duration::from_millis(100));
        assert_eq!(cfg.backoff_max, Duration::from_millis(1000));
        // Unspecified fields fall back to defaults.
        assert_eq!(cfg.rest_max_concurrency, 2);
    }

    #[test]
    fn no_op_rewrite_compares_equal() {
        assert_eq!(SafetyConfig::default(), SafetyConfig::default());
    }
}
