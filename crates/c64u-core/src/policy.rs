// ── Request policy resolver ──
//
// Pure mapping from a REST method+path (or FTP operation+path) to
// cache/cooldown behavior. Cache keys are namespaced by base URL so
// switching target devices never serves stale cross-device data.

use std::time::Duration;

use url::Url;

use crate::config::SafetyConfig;
use crate::gate::{FtpOperation, RestMethod};

/// Resolved caching/cooldown behavior for one request.
///
/// A `None` key means the request is never cached or coalesced, but it
/// still goes through readiness gating, backoff, circuit, and
/// concurrency limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPolicy {
    /// Cache/coalescing key, namespaced per device.
    pub key: Option<String>,
    /// How long a successful response stays fresh. Zero = no caching.
    pub cache: Duration,
    /// Minimum spacing between live calls for this key. Zero = none.
    pub cooldown: Duration,
}

impl RequestPolicy {
    fn none() -> Self {
        Self {
            key: None,
            cache: Duration::ZERO,
            cooldown: Duration::ZERO,
        }
    }
}

/// Resolve the policy for a REST request. Exact path match, query
/// string and fragment stripped first.
pub fn rest_policy(
    method: RestMethod,
    path: &str,
    base_url: &Url,
    config: &SafetyConfig,
) -> RequestPolicy {
    let path = strip_query(path);
    match (method, path) {
        (RestMethod::Get, "/v1/info") => RequestPolicy {
            key: Some(rest_key(base_url, "rest-info")),
            cache: config.info_cache,
            cooldown: Duration::ZERO,
        },
        (RestMethod::Get, "/v1/configs") => RequestPolicy {
            key: Some(rest_key(base_url, "rest-configs")),
            cache: config.configs_cache,
            cooldown: config.configs_cooldown,
        },
        (RestMethod::Get, "/v1/drives") => RequestPolicy {
            key: Some(rest_key(base_url, "rest-drives")),
            cache: Duration::ZERO,
            cooldown: config.drives_cooldown,
        },
        _ => RequestPolicy::none(),
    }
}

/// Resolve the policy for an FTP operation. No response cache; every
/// key shares the configured FTP cooldown (stamped at completion time
/// by the gate).
pub fn ftp_policy(operation: FtpOperation, path: &str, config: &SafetyConfig) -> RequestPolicy {
    RequestPolicy {
        key: Some(format!("{operation}:{path}")),
        cache: Duration::ZERO,
        cooldown: config.ftp_list_cooldown,
    }
}

fn rest_key(base_url: &Url, suffix: &str) -> String {
    format!("{base_url}::{suffix}")
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn base() -> Url {
        "http://c64u.local".parse().unwrap()
    }

    #[test]
    fn info_is_cached_without_cooldown() {
        let config = SafetyConfig::default();
        let policy = rest_policy(RestMethod::Get, "/v1/info", &base(), &config);
        assert_eq!(policy.key.as_deref(), Some("http://c64u.local/::rest-info"));
        assert_eq!(policy.cache, config.info_cache);
        assert_eq!(policy.cooldown, Duration::ZERO);
    }

    #[test]
    fn configs_has_cache_and_cooldown() {
        let config = SafetyConfig::default();
        let policy = rest_policy(RestMethod::Get, "/v1/configs", &base(), &config);
        assert_eq!(policy.cache, config.configs_cache);
        assert_eq!(policy.cooldown, config.configs_cooldown);
    }

    #[test]
    fn drives_has_cooldown_only() {
        let config = SafetyConfig::default();
        let policy = rest_policy(RestMethod::Get, "/v1/drives", &base(), &config);
        assert_eq!(policy.cache, Duration::ZERO);
        assert_eq!(policy.cooldown, config.drives_cooldown);
    }

    #[test]
    fn query_string_is_stripped_before_matching() {
        let config = SafetyConfig::default();
        let policy = rest_policy(
            RestMethod::Get,
            "/v1/info?fields=version#frag",
            &base(),
            &config,
        );
        assert!(policy.key.is_some());
    }

    #[test]
    fn unmatched_requests_get_no_policy() {
        let config = SafetyConfig::default();
        let machine = rest_policy(RestMethod::Put, "/v1/machine:pause", &base(), &config);
        assert_eq!(machine, RequestPolicy::none());

        // Exact match required: a sub-path is not /v1/info.
        let sub = rest_policy(RestMethod::Get, "/v1/info/extra", &base(), &config);
        assert_eq!(sub, RequestPolicy::none());

        // POST to a cached path is not the cached read.
        let post = rest_policy(RestMethod::Post, "/v1/configs", &base(), &config);
        assert_eq!(post, RequestPolicy::none());
    }

    #[test]
    fn keys_are_namespaced_per_device() {
        let config = SafetyConfig::default();
        let a = rest_policy(RestMethod::Get, "/v1/info", &base(), &config);
        let other: Url = "http://192.168.1.64".parse().unwrap();
        let b = rest_policy(RestMethod::Get, "/v1/info", &other, &config);
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn ftp_keys_combine_operation_and_path() {
        let config = SafetyConfig::default();
        let policy = ftp_policy(FtpOperation::List, "/Usb0/games", &config);
        assert_eq!(policy.key.as_deref(), Some("LIST:/Usb0/games"));
        assert_eq!(policy.cache, Duration::ZERO);
        assert_eq!(policy.cooldown, config.ftp_list_cooldown);
    }
}
