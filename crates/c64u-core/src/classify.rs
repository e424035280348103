// ── REST failure classification ──
//
// Decides whether a handler failure counts as evidence of device
// unhealth. Only critical failures feed the backoff/circuit counters;
// deliberate local safety blocks must never trip the breaker. The
// substring heuristics encode the device's actual error vocabulary, so
// they live in this one unit-tested function and nowhere else.

use strum::Display;

/// Closed set of failure categories for REST handler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FailureKind {
    /// The device host could not be reached at all.
    HostUnreachable,
    /// Generic network-level failure (reset, broken pipe, ...).
    Network,
    Timeout,
    /// HTTP 5xx from the device.
    Server,
    /// HTTP 429 -- the device is shedding load.
    RateLimited,
    /// A deliberate local rejection (smoke/fuzz safety mode), not
    /// evidence of device trouble.
    SafetyBlock,
    /// Anything else: 4xx, parse errors, caller bugs.
    Other,
}

impl FailureKind {
    /// Whether this failure should advance the failure streak and
    /// therefore backoff/circuit state.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Self::HostUnreachable | Self::Network | Self::Timeout | Self::Server | Self::RateLimited
        )
    }
}

/// Classify a REST handler error by its message.
pub fn classify(message: &str) -> FailureKind {
    let lower = message.to_lowercase();

    // Local safety rejections first -- they may mention "blocked" or
    // "refused" and must not fall into the network buckets below.
    if lower.contains("smoke mode") || lower.contains("fuzz mode") || lower.contains("safety block")
    {
        return FailureKind::SafetyBlock;
    }

    // Other statuses (4xx and friends) fall through to the substring
    // checks: "HTTP 408 request timed out" is still a timeout.
    if let Some(status) = extract_status(&lower) {
        if status >= 500 {
            return FailureKind::Server;
        }
        if status == 429 {
            return FailureKind::RateLimited;
        }
    }

    if lower.contains("unreachable")
        || lower.contains("no route to host")
        || lower.contains("connection refused")
        || lower.contains("dns error")
    {
        return FailureKind::HostUnreachable;
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return FailureKind::Timeout;
    }
    if lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("network")
    {
        return FailureKind::Network;
    }

    FailureKind::Other
}

/// Pull an HTTP status code out of messages shaped like
/// `"status 503"`, `"HTTP 429 Too Many Requests"`, or `"(502)"`.
fn extract_status(lower: &str) -> Option<u16> {
    for marker in ["status ", "status: ", "http "] {
        if let Some(index) = lower.find(marker) {
            let rest = &lower[index + marker.len()..];
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if digits.len() == 3 {
                return digits.parse().ok();
            }
        }
    }
    None
}
