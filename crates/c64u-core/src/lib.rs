//! Interaction scheduling and safety layer for the C64 Ultimate.
//!
//! The Ultimate is a small embedded device that speaks two unrelated
//! protocols (a REST API and FTP) and falls over when clients hammer it.
//! This crate is the gatekeeper every outbound request must pass through:
//!
//! - **[`DeviceGate`]** — Composition root. Wraps outbound calls via
//!   [`with_rest_interaction`](DeviceGate::with_rest_interaction) /
//!   [`with_ftp_interaction`](DeviceGate::with_ftp_interaction), applying
//!   readiness gating, response caching, request coalescing, cooldowns,
//!   exponential backoff, and a per-protocol circuit breaker. The gate
//!   decides *whether*, *when*, and *how many at once* — never *how*; the
//!   actual network call lives in the handler closure the caller supplies.
//!
//! - **[`DeviceStateStore`]** — Single source of truth for device
//!   readiness. A pure reducer derives one observable
//!   [`DeviceState`] (unknown / discovering / connecting / ready / busy /
//!   error) from connection status, in-flight load, and failure history,
//!   published as immutable snapshots through a `watch` channel.
//!
//! - **[`IntentScheduler`]** — Strict-priority concurrency limiter, one
//!   instance per protocol. User work drains before system work, system
//!   before background; the limit is re-read from the live
//!   [`SafetyConfig`] every time a slot frees.
//!
//! The HTTP/FTP transports, UI, and discovery logic are collaborators,
//! not residents: callers hand in an async closure and this crate only
//! observes its success or failure.

pub mod audit;
pub mod backoff;
pub mod classify;
pub mod config;
pub mod error;
pub mod gate;
pub mod policy;
pub mod scheduler;
pub mod state;

// ── Primary re-exports ──────────────────────────────────────────────
pub use audit::{AuditRecord, AuditSink, Decision, TracingAuditSink};
pub use classify::FailureKind;
pub use config::SafetyConfig;
pub use error::{BoxedError, GateError, HandlerFailure};
pub use gate::{Bypass, DeviceGate, FtpOperation, FtpRequest, Protocol, RestMethod, RestRequest};
pub use policy::RequestPolicy;
pub use scheduler::{Intent, IntentScheduler, SchedulerStats};
pub use state::{
    ConnectionState, DeviceState, DeviceStateSnapshot, DeviceStateStore, DeviceStateStream,
    RequestOutcome,
};
