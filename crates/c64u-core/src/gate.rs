// ── Device interaction gate ──
//
// Composition root for the safety layer. Every outbound call to the
// device is wrapped in `with_rest_interaction` / `with_ftp_interaction`:
// the gate consults the readiness store, the per-protocol circuit
// breaker, the request policy (cache/coalesce/cooldown), and the intent
// scheduler, then runs the caller's handler closure and feeds the
// outcome back into the failure counters and the readiness store.
//
// The gate never performs network I/O itself and never inspects
// response bodies -- cached values are type-erased `Arc<dyn Any>`.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use strum::Display;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::audit::{AuditRecord, AuditSink, Decision, TracingAuditSink};
use crate::backoff::FailureTracker;
use crate::classify;
use crate::config::SafetyConfig;
use crate::error::{BoxedError, GateError};
use crate::policy::{self, RequestPolicy};
use crate::scheduler::{Intent, IntentScheduler, SchedulerStats};
use crate::state::{
    DeviceState, DeviceStateSnapshot, DeviceStateStore, DeviceStateStream, RequestOutcome,
};

// ── Request metadata ─────────────────────────────────────────────────

/// Which wire protocol an interaction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Protocol {
    Rest,
    Ftp,
}

/// HTTP method of a REST interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum RestMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// FTP operation verb, named after the wire commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FtpOperation {
    #[strum(serialize = "LIST")]
    List,
    #[strum(serialize = "RETR")]
    Retrieve,
    #[strum(serialize = "STOR")]
    Store,
    #[strum(serialize = "DELE")]
    Delete,
    #[strum(serialize = "MKD")]
    MakeDir,
    #[strum(serialize = "RMD")]
    RemoveDir,
}

/// Per-request opt-outs for callers that must force a live round trip
/// (explicit refresh actions, recovery probes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bypass {
    pub cache: bool,
    pub cooldown: bool,
    pub backoff: bool,
}

impl Bypass {
    /// Bypass everything bypassable. Gating and the circuit breaker
    /// still apply.
    pub fn force_live() -> Self {
        Self {
            cache: true,
            cooldown: true,
            backoff: true,
        }
    }
}

/// Routing metadata for a REST interaction.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub intent: Intent,
    pub method: RestMethod,
    pub path: String,
    pub base_url: Url,
    /// Permit dispatch while the device is still being discovered.
    /// Only honored for `Intent::System`.
    pub allow_during_discovery: bool,
    pub bypass: Bypass,
}

impl RestRequest {
    pub fn new(intent: Intent, method: RestMethod, path: impl Into<String>, base_url: Url) -> Self {
        Self {
            intent,
            method,
            path: path.into(),
            base_url,
            allow_during_discovery: false,
            bypass: Bypass::default(),
        }
    }

    pub fn allow_during_discovery(mut self) -> Self {
        self.allow_during_discovery = true;
        self
    }

    pub fn bypass(mut self, bypass: Bypass) -> Self {
        self.bypass = bypass;
        self
    }

    fn target(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Routing metadata for an FTP interaction.
#[derive(Debug, Clone)]
pub struct FtpRequest {
    pub intent: Intent,
    pub operation: FtpOperation,
    pub path: String,
    pub allow_during_discovery: bool,
    pub bypass: Bypass,
}

impl FtpRequest {
    pub fn new(intent: Intent, operation: FtpOperation, path: impl Into<String>) -> Self {
        Self {
            intent,
            operation,
            path: path.into(),
            allow_during_discovery: false,
            bypass: Bypass::default(),
        }
    }

    pub fn allow_during_discovery(mut self) -> Self {
        self.allow_during_discovery = true;
        self
    }

    pub fn bypass(mut self, bypass: Bypass) -> Self {
        self.bypass = bypass;
        self
    }

    fn target(&self) -> String {
        format!("{} {}", self.operation, self.path)
    }
}

/// Resolved, protocol-tagged request description carried through the
/// scheduling pipeline.
struct InteractionMeta {
    protocol: Protocol,
    intent: Intent,
    target: String,
    allow_during_discovery: bool,
    bypass: Bypass,
    policy: RequestPolicy,
}

// ── Bookkeeping tables ───────────────────────────────────────────────

/// Type-erased successful response shared between cache and coalesced
/// callers.
type CachedValue = Arc<dyn Any + Send + Sync>;

/// What coalesced callers receive once the underlying call finishes.
type TaskOutcome = Result<CachedValue, GateError>;

struct CacheEntry {
    value: CachedValue,
    expires_at: Instant,
}

/// Per-protocol scheduling state, owned exclusively by that protocol's
/// half of the gate.
struct ProtocolTables {
    cache: HashMap<String, CacheEntry>,
    cooldown_until: HashMap<String, Instant>,
    /// Pending results keyed for coalescing; entries are removed when
    /// the underlying call finishes, regardless of cache policy.
    in_flight: HashMap<String, watch::Receiver<Option<TaskOutcome>>>,
    failures: FailureTracker,
}

impl ProtocolTables {
    fn new() -> Self {
        Self {
            cache: HashMap::new(),
            cooldown_until: HashMap::new(),
            in_flight: HashMap::new(),
            failures: FailureTracker::default(),
        }
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.cooldown_until.clear();
        self.in_flight.clear();
        self.failures.reset();
    }
}

// ── Gate ─────────────────────────────────────────────────────────────

/// The safety layer every outbound device call must pass through.
///
/// Cheaply cloneable; clones share all state. Construct via
/// [`DeviceGate::builder`] inside a Tokio runtime (a watcher task
/// resets interaction state whenever the safety config reloads).
#[derive(Clone)]
pub struct DeviceGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    store: Arc<DeviceStateStore>,
    config: watch::Receiver<SafetyConfig>,
    rest_scheduler: IntentScheduler,
    ftp_scheduler: IntentScheduler,
    rest_tables: Mutex<ProtocolTables>,
    ftp_tables: Mutex<ProtocolTables>,
    audit: Arc<dyn AuditSink>,
    /// Diagnostic mode: skip all gating/caching and call handlers
    /// directly, still tracking start/end against the store. Lets
    /// automated tests exercise handler code without scheduling noise.
    test_bypass: bool,
    cancel: CancellationToken,
}

impl Drop for GateInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builder for [`DeviceGate`].
pub struct DeviceGateBuilder {
    config: watch::Receiver<SafetyConfig>,
    store: Option<Arc<DeviceStateStore>>,
    audit: Arc<dyn AuditSink>,
    test_bypass: bool,
}

impl DeviceGateBuilder {
    /// Share an externally owned readiness store (e.g. with the
    /// connection manager). A fresh store is created otherwise.
    pub fn store(mut self, store: Arc<DeviceStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default `tracing` audit sink.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Enable the test/diagnostic bypass mode.
    pub fn test_bypass(mut self) -> Self {
        self.test_bypass = true;
        self
    }

    pub fn build(self) -> DeviceGate {
        let store = self.store.unwrap_or_default();
        let inner = Arc::new(GateInner {
            store,
            rest_scheduler: IntentScheduler::new(Protocol::Rest, self.config.clone()),
            ftp_scheduler: IntentScheduler::new(Protocol::Ftp, self.config.clone()),
            rest_tables: Mutex::new(ProtocolTables::new()),
            ftp_tables: Mutex::new(ProtocolTables::new()),
            audit: self.audit,
            test_bypass: self.test_bypass,
            cancel: CancellationToken::new(),
            config: self.config,
        });
        spawn_reload_watcher(&inner);
        DeviceGate { inner }
    }
}

/// Reset all interaction bookkeeping whenever the safety config
/// changes. Holds only a `Weak` so the gate can drop freely.
fn spawn_reload_watcher(inner: &Arc<GateInner>) {
    let weak = Arc::downgrade(inner);
    let mut config = inner.config.clone();
    let cancel = inner.cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = config.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let Some(inner) = weak.upgrade() else { break };
                    let gate = DeviceGate { inner };
                    gate.reset_interaction_state("safety config reloaded");
                }
            }
        }
    });
}

impl DeviceGate {
    /// Start building a gate from a live config subscription
    /// (see `c64u-config::SafetyConfigStore::subscribe`).
    pub fn builder(config: watch::Receiver<SafetyConfig>) -> DeviceGateBuilder {
        DeviceGateBuilder {
            config,
            store: None,
            audit: Arc::new(TracingAuditSink),
            test_bypass: false,
        }
    }

    /// Gate with all defaults.
    pub fn new(config: watch::Receiver<SafetyConfig>) -> Self {
        Self::builder(config).build()
    }

    /// The shared readiness store.
    pub fn store(&self) -> Arc<DeviceStateStore> {
        Arc::clone(&self.inner.store)
    }

    /// Current device readiness snapshot.
    pub fn device_state(&self) -> DeviceStateSnapshot {
        self.inner.store.snapshot()
    }

    /// Subscribe to device readiness changes.
    pub fn subscribe_device_state(&self) -> DeviceStateStream {
        self.inner.store.stream()
    }

    /// REST queue depths and in-flight count.
    pub fn rest_stats(&self) -> SchedulerStats {
        self.inner.rest_scheduler.stats()
    }

    /// FTP queue depths and in-flight count.
    pub fn ftp_stats(&self) -> SchedulerStats {
        self.inner.ftp_scheduler.stats()
    }

    /// Clear both protocols' caches, cooldown tables, in-flight
    /// registries, and failure/backoff/circuit counters, and clear the
    /// readiness store's circuit field.
    ///
    /// Handlers already running are not cancelled -- only their
    /// bookkeeping registrations drop, so callers racing in during the
    /// reset window start fresh calls instead of coalescing onto stale
    /// results.
    pub fn reset_interaction_state(&self, reason: &str) {
        self.lock_tables(Protocol::Rest).clear();
        self.lock_tables(Protocol::Ftp).clear();
        self.inner.store.set_circuit_open_until(None, None);
        info!(reason, "interaction state reset");
    }

    /// Run a REST call through the safety layer.
    ///
    /// `handler` performs the actual network call; the gate decides
    /// whether it runs at all, when, and whether a cached or coalesced
    /// result is returned instead. Handler failures are propagated
    /// verbatim (wrapped in [`GateError::Handler`]) after failure
    /// bookkeeping.
    pub async fn with_rest_interaction<T, E, F, Fut>(
        &self,
        request: RestRequest,
        handler: F,
    ) -> Result<Arc<T>, GateError>
    where
        T: Send + Sync + 'static,
        E: Into<BoxedError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let config = self.inner.config.borrow().clone();
        let meta = InteractionMeta {
            protocol: Protocol::Rest,
            intent: request.intent,
            target: request.target(),
            allow_during_discovery: request.allow_during_discovery,
            bypass: request.bypass,
            policy: policy::rest_policy(
                request.method,
                &request.path,
                &request.base_url,
                &config,
            ),
        };
        self.run_interaction(meta, handler).await
    }

    /// Run an FTP operation through the safety layer.
    ///
    /// Same shape as REST, simplified: no response cache, coalescing
    /// key `OP:path`, and the per-key cooldown is stamped after every
    /// completed call (success or failure). FTP failures never touch
    /// the readiness store's circuit field.
    pub async fn with_ftp_interaction<T, E, F, Fut>(
        &self,
        request: FtpRequest,
        handler: F,
    ) -> Result<Arc<T>, GateError>
    where
        T: Send + Sync + 'static,
        E: Into<BoxedError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let config = self.inner.config.borrow().clone();
        let meta = InteractionMeta {
            protocol: Protocol::Ftp,
            intent: request.intent,
            target: request.target(),
            allow_during_discovery: request.allow_during_discovery,
            bypass: request.bypass,
            policy: policy::ftp_policy(request.operation, &request.path, &config),
        };
        self.run_interaction(meta, handler).await
    }

    // ── Pipeline ─────────────────────────────────────────────────────

    async fn run_interaction<T, E, F, Fut>(
        &self,
        meta: InteractionMeta,
        handler: F,
    ) -> Result<Arc<T>, GateError>
    where
        T: Send + Sync + 'static,
        E: Into<BoxedError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if self.inner.test_bypass {
            return self.run_bypassed(handler).await;
        }

        let config = self.inner.config.borrow().clone();

        // State gate: rejects immediately, touches no queues, caches,
        // or counters.
        let state = self.inner.store.snapshot().state;
        match state {
            DeviceState::Unknown | DeviceState::Discovering => {
                if !(meta.allow_during_discovery && meta.intent == Intent::System) {
                    self.audit(&meta, Decision::Block, "state");
                    debug!(target = %meta.target, %state, "blocked: device not ready");
                    return Err(GateError::NotReady {
                        state,
                        reason: format!("device state is {state}"),
                    });
                }
            }
            DeviceState::Error => {
                if meta.intent == Intent::User && config.allow_user_override_circuit {
                    self.audit(&meta, Decision::Override, "state");
                } else {
                    self.audit(&meta, Decision::Block, "state");
                    return Err(GateError::NotReady {
                        state,
                        reason: format!("device state is {state}"),
                    });
                }
            }
            DeviceState::Connecting | DeviceState::Ready | DeviceState::Busy => {}
        }

        // Circuit gate: per-protocol, distinct error from the state
        // gate so callers can tell the two apart.
        {
            let now = Instant::now();
            let tables = self.lock_tables(meta.protocol);
            if tables.failures.circuit_open(now) {
                let streak = tables.failures.streak();
                drop(tables);
                if meta.intent == Intent::User && config.allow_user_override_circuit {
                    self.audit(&meta, Decision::Override, "circuit");
                } else {
                    self.audit(&meta, Decision::Block, "circuit");
                    return Err(GateError::CircuitOpen {
                        protocol: meta.protocol,
                        reason: format!("{streak} consecutive critical failures"),
                    });
                }
            }
        }

        // Cache / coalesce lookup and in-flight registration happen
        // under a single lock hold so racing callers cannot both start
        // live calls for the same key.
        let (outcome_tx, outcome_rx) = watch::channel(None::<TaskOutcome>);
        if let Some(key) = meta.policy.key.clone() {
            if !meta.bypass.cache {
                let mut tables = self.lock_tables(meta.protocol);
                match tables.cache.get(&key) {
                    Some(entry) if Instant::now() < entry.expires_at => {
                        let value = Arc::clone(&entry.value);
                        drop(tables);
                        self.audit(&meta, Decision::Cache, "fresh");
                        return downcast(value);
                    }
                    Some(_) => {
                        tables.cache.remove(&key);
                    }
                    None => {}
                }
                if let Some(pending) = tables.in_flight.get(&key) {
                    let pending = pending.clone();
                    drop(tables);
                    self.audit(&meta, Decision::Coalesce, "in-flight");
                    return await_outcome(pending).await.and_then(downcast);
                }
                tables.in_flight.insert(key, outcome_tx.subscribe());
            }
        }

        let gate = self.clone();
        let intent = meta.intent;
        let protocol = meta.protocol;
        self.scheduler(protocol).submit(intent, async move {
            let outcome = gate.execute(&meta, handler).await;
            if let Some(key) = &meta.policy.key {
                gate.lock_tables(meta.protocol).in_flight.remove(key);
            }
            // Receivers may all be gone (caller dropped); that's fine.
            let _ = outcome_tx.send(Some(outcome));
        });

        await_outcome(outcome_rx).await.and_then(downcast)
    }

    /// Diagnostic-mode path: no gating, no caching, no counters --
    /// just the handler plus busy tracking.
    async fn run_bypassed<T, E, F, Fut>(&self, handler: F) -> Result<Arc<T>, GateError>
    where
        T: Send + Sync + 'static,
        E: Into<BoxedError> + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.inner.store.mark_request_start();
        match run_handler(handler()).await {
            Ok(value) => {
                self.inner.store.mark_request_end(&RequestOutcome::Success);
                Ok(Arc::new(value))
            }
            Err(err) => {
                self.inner.store.mark_request_end(&RequestOutcome::Failure {
                    message: Some(err.to_string()),
                });
                Err(GateError::from_handler(err))
            }
        }
    }

    /// Task body run by the scheduler: backoff wait, cooldown wait,
    /// handler invocation, then success/failure bookkeeping.
    async fn execute<T, E, F, Fut>(&self, meta: &InteractionMeta, handler: F) -> TaskOutcome
    where
        T: Send + Sync + 'static,
        E: Into<BoxedError> + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        // (a) Wait out any active backoff. Loop: a concurrent failure
        // may extend the deadline while we sleep.
        if !meta.bypass.backoff {
            loop {
                let until = self.lock_tables(meta.protocol).failures.backoff_until();
                match until {
                    Some(until) if Instant::now() < until => {
                        self.audit(meta, Decision::Defer, "backoff");
                        sleep_until(until).await;
                    }
                    _ => break,
                }
            }
        }

        // (b) Wait out the per-key cooldown, then stamp the next expiry
        // at dispatch time (REST). FTP stamps at completion instead.
        if let Some(key) = &meta.policy.key {
            if !meta.bypass.cooldown {
                loop {
                    let until = self.lock_tables(meta.protocol).cooldown_until.get(key).copied();
                    match until {
                        Some(until) if Instant::now() < until => {
                            self.audit(meta, Decision::Defer, "cooldown");
                            sleep_until(until).await;
                        }
                        _ => break,
                    }
                }
                if meta.protocol == Protocol::Rest && !meta.policy.cooldown.is_zero() {
                    self.lock_tables(meta.protocol)
                        .cooldown_until
                        .insert(key.clone(), Instant::now() + meta.policy.cooldown);
                }
            }
        }

        // (c) Run the handler with busy tracking.
        self.inner.store.mark_request_start();
        let result = run_handler(handler()).await;

        match result {
            Ok(value) => {
                let value: CachedValue = Arc::new(value);
                {
                    let mut tables = self.lock_tables(meta.protocol);
                    if let Some(key) = &meta.policy.key {
                        if !meta.policy.cache.is_zero() && !meta.bypass.cache {
                            tables.cache.insert(
                                key.clone(),
                                CacheEntry {
                                    value: Arc::clone(&value),
                                    expires_at: Instant::now() + meta.policy.cache,
                                },
                            );
                        }
                        if meta.protocol == Protocol::Ftp && !meta.policy.cooldown.is_zero() {
                            tables
                                .cooldown_until
                                .insert(key.clone(), Instant::now() + meta.policy.cooldown);
                        }
                    }
                    tables.failures.record_success();
                }
                if meta.protocol == Protocol::Rest {
                    self.inner.store.set_circuit_open_until(None, None);
                }
                self.inner.store.mark_request_end(&RequestOutcome::Success);
                Ok(value)
            }
            Err(err) => {
                let message = err.to_string();
                // REST failures are classified by message; FTP treats
                // every failure as critical.
                let critical = match meta.protocol {
                    Protocol::Rest => classify::classify(&message).is_critical(),
                    Protocol::Ftp => true,
                };

                let config = self.inner.config.borrow().clone();
                let (circuit_until, streak) = {
                    let mut tables = self.lock_tables(meta.protocol);
                    if let Some(key) = &meta.policy.key {
                        if meta.protocol == Protocol::Ftp && !meta.policy.cooldown.is_zero() {
                            tables
                                .cooldown_until
                                .insert(key.clone(), Instant::now() + meta.policy.cooldown);
                        }
                    }
                    let circuit_until = if critical {
                        tables.failures.record_critical_failure(&config, Instant::now())
                    } else {
                        None
                    };
                    (circuit_until, tables.failures.streak())
                };

                // REST instability is a proxy for device health; FTP
                // instability degrades FTP scheduling only.
                if meta.protocol == Protocol::Rest {
                    if let Some(until) = circuit_until {
                        self.inner.store.set_circuit_open_until(
                            Some(until),
                            Some(&format!("{streak} consecutive critical failures")),
                        );
                    }
                }

                warn!(
                    target = %meta.target,
                    protocol = %meta.protocol,
                    critical,
                    streak,
                    error = %message,
                    "device interaction failed"
                );
                self.inner.store.mark_request_end(&RequestOutcome::Failure {
                    message: Some(message),
                });
                Err(GateError::from_handler(err))
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn scheduler(&self, protocol: Protocol) -> &IntentScheduler {
        match protocol {
            Protocol::Rest => &self.inner.rest_scheduler,
            Protocol::Ftp => &self.inner.ftp_scheduler,
        }
    }

    fn lock_tables(&self, protocol: Protocol) -> MutexGuard<'_, ProtocolTables> {
        let tables = match protocol {
            Protocol::Rest => &self.inner.rest_tables,
            Protocol::Ftp => &self.inner.ftp_tables,
        };
        tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn audit(&self, meta: &InteractionMeta, decision: Decision, reason: &str) {
        self.inner.audit.record(&AuditRecord {
            protocol: meta.protocol,
            intent: meta.intent,
            decision,
            reason: reason.to_owned(),
            target: meta.target.clone(),
        });
    }
}

/// Run a handler future on its own task so a panicking handler surfaces
/// as an ordinary failure instead of unwinding through the gate's
/// bookkeeping (slot release, busy tracking, in-flight cleanup).
async fn run_handler<T, E, Fut>(fut: Fut) -> Result<T, BoxedError>
where
    T: Send + 'static,
    E: Into<BoxedError> + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.into()),
        Err(join_err) => Err(Box::new(join_err)),
    }
}

/// Wait for the outcome a scheduled task publishes through its `watch`
/// channel.
async fn await_outcome(
    mut pending: watch::Receiver<Option<TaskOutcome>>,
) -> Result<CachedValue, GateError> {
    loop {
        if let Some(outcome) = pending.borrow_and_update().clone() {
            return outcome;
        }
        pending.changed().await.map_err(|_| {
            GateError::Internal("interaction task dropped before completing".into())
        })?;
    }
}

/// Recover the concrete response type from a type-erased value. Fails
/// only if two callers disagree about a key's response type.
fn downcast<T: Send + Sync + 'static>(value: CachedValue) -> Result<Arc<T>, GateError> {
    value
        .downcast::<T>()
        .map_err(|_| GateError::Internal("cached response type mismatch".into()))
}
