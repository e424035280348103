// ── Interaction audit hook ──
//
// Every gate/cache/cooldown/backoff decision emits a structured record.
// The default sink forwards to `tracing`; tests and diagnostic UIs can
// install their own sink to observe scheduling behavior.

use strum::Display;

use crate::gate::Protocol;
use crate::scheduler::Intent;

/// What the gate decided to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Decision {
    /// Rejected before dispatch (state gate or circuit).
    Block,
    /// Delayed by backoff or cooldown before running.
    Defer,
    /// Served from the response cache without running.
    Cache,
    /// Merged onto an identical in-flight call.
    Coalesce,
    /// A user-intent request pushed through an open circuit or ERROR
    /// state.
    Override,
}

/// One scheduling decision, in the order the gate made it.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub protocol: Protocol,
    pub intent: Intent,
    pub decision: Decision,
    /// Short machine-readable cause: "state", "circuit", "backoff",
    /// "cooldown", ...
    pub reason: String,
    /// The request being decided on, e.g. `GET /v1/info` or
    /// `LIST /Usb0/games`.
    pub target: String,
}

/// Receives every scheduling decision. Implementations must be cheap
/// and non-blocking -- records are emitted inline on the request path.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Default sink: structured `tracing` events at DEBUG.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        tracing::debug!(
            protocol = %record.protocol,
            intent = %record.intent,
            decision = %record.decision,
            reason = %record.reason,
            target = %record.target,
            "interaction decision"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_display_is_lowercase() {
        assert_eq!(Decision::Block.to_string(), "block");
        assert_eq!(Decision::Coalesce.to_string(), "coalesce");
        assert_eq!(Decision::Override.to_string(), "override");
    }
}
