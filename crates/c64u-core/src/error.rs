// ── Gate error types ──
//
// Errors surfaced by the interaction gate. Rejections (NotReady,
// CircuitOpen) happen before the handler runs and have no side effects
// beyond the audit record. Handler failures carry the caller's original
// error untouched -- the gate only does bookkeeping on the way through.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use crate::gate::Protocol;
use crate::state::DeviceState;

/// Boxed error type handlers are allowed to fail with.
pub type BoxedError = Box<dyn StdError + Send + Sync>;

/// Unified error type for gated interactions.
///
/// `Clone` because coalesced callers all receive the same outcome.
#[derive(Debug, Clone, Error)]
pub enum GateError {
    /// The device readiness gate rejected the request before dispatch.
    #[error("device not ready ({state}): {reason}")]
    NotReady { state: DeviceState, reason: String },

    /// The protocol's circuit breaker is open.
    #[error("{protocol} circuit open: {reason}")]
    CircuitOpen { protocol: Protocol, reason: String },

    /// The wrapped call itself failed. Propagated verbatim after
    /// failure bookkeeping; the original error is retained as `source`.
    #[error("{0}")]
    Handler(HandlerFailure),

    /// Internal plumbing fault (dropped task channel, cache type
    /// mismatch). Indicates a bug in this crate, not device trouble.
    #[error("internal gate error: {0}")]
    Internal(String),
}

impl GateError {
    /// True for gate-side rejections that never reached the handler.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::CircuitOpen { .. })
    }

    /// The original handler error, if this is a handler failure.
    pub fn handler_error(&self) -> Option<&(dyn StdError + Send + Sync)> {
        match self {
            Self::Handler(failure) => Some(failure.0.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn from_handler(err: BoxedError) -> Self {
        Self::Handler(HandlerFailure(Arc::from(err)))
    }
}

/// A failure produced by the wrapped handler, shared across coalesced
/// callers via `Arc`.
#[derive(Debug, Clone)]
pub struct HandlerFailure(pub(crate) Arc<dyn StdError + Send + Sync>);

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl StdError for HandlerFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.as_ref())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_classified() {
        let not_ready = GateError::NotReady {
            state: DeviceState::Discovering,
            reason: "discovery in progress".into(),
        };
        assert!(not_ready.is_rejection());

        let circuit = GateError::CircuitOpen {
            protocol: Protocol::Rest,
            reason: "4 consecutive failures".into(),
        };
        assert!(circuit.is_rejection());

        let handler = GateError::from_handler("boom".into());
        assert!(!handler.is_rejection());
    }

    #[test]
    fn handler_error_preserves_original_message() {
        let err = GateError::from_handler("connection timed out".into());
        assert_eq!(err.to_string(), "connection timed out");
        assert_eq!(
            err.handler_error().unwrap().to_string(),
            "connection timed out"
        );
    }
}
