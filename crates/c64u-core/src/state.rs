// ── Device readiness state store ──
//
// Single source of truth for device readiness. The observable state is
// never set directly: it is recomputed by a pure reducer from the
// connection status, in-flight request count, success history, and
// circuit-breaker deadline on every mutation, then published wholesale
// as an immutable snapshot through a `watch` channel.

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_core::Stream;
use strum::Display;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

// ── State enums ──────────────────────────────────────────────────────

/// Connection status as reported by the discovery/connection manager.
///
/// Externally supplied; this crate never decides reachability itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Unknown,
    Discovering,
    /// Known offline, and demo mode is not active either.
    OfflineNoDemo,
    /// A real device answered on the network.
    RealConnected,
    /// Simulated device for offline development.
    DemoActive,
}

/// The single derived readiness value consumed by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Unknown,
    Discovering,
    /// Connected but no request has succeeded yet on this connection.
    Connecting,
    Ready,
    /// Ready/connecting with tracked requests in flight.
    Busy,
    Error,
}

/// Outcome of a tracked request, fed back via
/// [`DeviceStateStore::mark_request_end`].
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Success,
    Failure { message: Option<String> },
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// Immutable view of device readiness, replaced wholesale on every
/// change. Subscribers never observe partial mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStateSnapshot {
    /// Derived readiness — always a function of the other fields, never
    /// set directly.
    pub state: DeviceState,
    pub connection_state: Option<ConnectionState>,
    /// Number of tracked requests currently in flight.
    pub busy_count: u32,
    pub last_updated: DateTime<Utc>,
    pub last_error_message: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// While set and in the future, the derived state is ERROR.
    pub circuit_open_until: Option<Instant>,
}

impl Default for DeviceStateSnapshot {
    fn default() -> Self {
        Self {
            state: DeviceState::Unknown,
            connection_state: None,
            busy_count: 0,
            last_updated: Utc::now(),
            last_error_message: None,
            last_success_at: None,
            circuit_open_until: None,
        }
    }
}

// ── Pure reducer ─────────────────────────────────────────────────────

/// Derive the observable state from its inputs.
///
/// Precedence: open circuit > connection-derived base > busy overlay.
fn compute_state(
    connection: Option<ConnectionState>,
    busy_count: u32,
    has_successful_request: bool,
    circuit_open_until: Option<Instant>,
    now: Instant,
) -> DeviceState {
    if let Some(until) = circuit_open_until {
        if now < until {
            return DeviceState::Error;
        }
    }

    let base = match connection {
        None | Some(ConnectionState::Unknown) => DeviceState::Unknown,
        Some(ConnectionState::Discovering) => DeviceState::Discovering,
        Some(ConnectionState::OfflineNoDemo) => DeviceState::Error,
        Some(ConnectionState::RealConnected | ConnectionState::DemoActive) => {
            if has_successful_request {
                DeviceState::Ready
            } else {
                DeviceState::Connecting
            }
        }
    };

    if matches!(base, DeviceState::Ready | DeviceState::Connecting) && busy_count > 0 {
        return DeviceState::Busy;
    }
    base
}

// ── Store ────────────────────────────────────────────────────────────

/// Raw inputs the reducer derives the snapshot from.
struct StoreFields {
    connection_state: Option<ConnectionState>,
    busy_count: u32,
    /// Whether the current connection has proven itself with at least
    /// one successful exchange. Cleared on every connection change.
    has_successful_request: bool,
    last_error_message: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    circuit_open_until: Option<Instant>,
}

/// Holds the device readiness inputs and publishes derived snapshots.
///
/// Created once at startup and shared (`Arc`) between both protocol
/// gates and any UI subscribers; lives for the process.
pub struct DeviceStateStore {
    fields: Mutex<StoreFields>,
    tx: watch::Sender<DeviceStateSnapshot>,
}

impl Default for DeviceStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DeviceStateSnapshot::default());
        Self {
            fields: Mutex::new(StoreFields {
                connection_state: None,
                busy_count: 0,
                has_successful_request: false,
                last_error_message: None,
                last_success_at: None,
                circuit_open_until: None,
            }),
            tx,
        }
    }

    /// Current snapshot. Never blocks, never fails.
    pub fn snapshot(&self) -> DeviceStateSnapshot {
        self.tx.borrow().clone()
    }

    /// Subscribe to snapshot replacements via a `watch::Receiver`.
    pub fn subscribe(&self) -> watch::Receiver<DeviceStateSnapshot> {
        self.tx.subscribe()
    }

    /// Subscribe with the stream-style wrapper used by reactive UIs.
    pub fn stream(&self) -> DeviceStateStream {
        DeviceStateStream::new(self.tx.subscribe())
    }

    /// Record a new connection-state value from the connection manager.
    ///
    /// A fresh connection has not yet proven itself, so the hidden
    /// success flag is cleared both when (re)connecting and when the
    /// connection is lost.
    pub fn update_connection_state(&self, next: ConnectionState) {
        let mut fields = self.lock_fields();
        let previous = fields.connection_state;
        let changed = previous != Some(next);
        fields.connection_state = Some(next);

        match next {
            ConnectionState::RealConnected | ConnectionState::DemoActive => {
                if changed {
                    fields.has_successful_request = false;
                }
            }
            ConnectionState::Unknown
            | ConnectionState::Discovering
            | ConnectionState::OfflineNoDemo => {
                fields.has_successful_request = false;
            }
        }

        if changed {
            debug!(?previous, %next, "device connection state changed");
        }
        self.publish(&fields);
    }

    /// Track the start of an outbound request.
    pub fn mark_request_start(&self) {
        let mut fields = self.lock_fields();
        fields.busy_count += 1;
        self.publish(&fields);
    }

    /// Track the completion of an outbound request.
    pub fn mark_request_end(&self, outcome: &RequestOutcome) {
        let mut fields = self.lock_fields();
        fields.busy_count = fields.busy_count.saturating_sub(1);
        match outcome {
            RequestOutcome::Success => {
                fields.has_successful_request = true;
                fields.last_success_at = Some(Utc::now());
                fields.last_error_message = None;
            }
            RequestOutcome::Failure { message } => {
                if let Some(message) = message {
                    fields.last_error_message = Some(message.clone());
                }
            }
        }
        self.publish(&fields);
    }

    /// Set or clear the circuit-breaker deadline.
    pub fn set_circuit_open_until(&self, until: Option<Instant>, reason: Option<&str>) {
        let mut fields = self.lock_fields();
        fields.circuit_open_until = until;
        if until.is_some() {
            if let Some(reason) = reason {
                fields.last_error_message = Some(reason.to_owned());
            }
        }
        self.publish(&fields);
    }

    fn lock_fields(&self) -> std::sync::MutexGuard<'_, StoreFields> {
        // Mutator bodies never panic while holding the lock, so a
        // poisoned mutex only happens if that assumption breaks.
        self.fields
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn publish(&self, fields: &StoreFields) {
        let snapshot = DeviceStateSnapshot {
            state: compute_state(
                fields.connection_state,
                fields.busy_count,
                fields.has_successful_request,
                fields.circuit_open_until,
                Instant::now(),
            ),
            connection_state: fields.connection_state,
            busy_count: fields.busy_count,
            last_updated: Utc::now(),
            last_error_message: fields.last_error_message.clone(),
            last_success_at: fields.last_success_at,
            circuit_open_until: fields.circuit_open_until,
        };
        // `send_replace` publishes even with zero receivers.
        self.tx.send_replace(snapshot);
    }
}

// ── Subscription stream ──────────────────────────────────────────────

/// A subscription to device-state changes.
///
/// Provides both point-in-time snapshot access and reactive change
/// notification via `changed()` or by converting to a `Stream`.
pub struct DeviceStateStream {
    current: DeviceStateSnapshot,
    receiver: watch::Receiver<DeviceStateSnapshot>,
}

impl DeviceStateStream {
    pub(crate) fn new(receiver: watch::Receiver<DeviceStateSnapshot>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// The snapshot captured at creation time.
    pub fn current(&self) -> &DeviceStateSnapshot {
        &self.current
    }

    /// The latest snapshot (may have changed since creation).
    pub fn latest(&self) -> DeviceStateSnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change, returning the new snapshot.
    /// Returns `None` if the store has been dropped.
    pub async fn changed(&mut self) -> Option<DeviceStateSnapshot> {
        self.receiver.changed().await.ok()?;
        let snapshot = self.receiver.borrow_and_update().clone();
        self.current = snapshot.clone();
        Some(snapshot)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> DeviceStateWatchStream {
        DeviceStateWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by a `watch::Receiver`.
pub struct DeviceStateWatchStream {
    inner: WatchStream<DeviceStateSnapshot>,
}

impl Stream for DeviceStateWatchStream {
    type Item = DeviceStateSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn discovery_to_ready_progression() {
        let store = DeviceStateStore::new();
        assert_eq!(store.snapshot().state, DeviceState::Unknown);

        store.update_connection_state(ConnectionState::Discovering);
        assert_eq!(store.snapshot().state, DeviceState::Discovering);

        // Connected, but nothing has succeeded yet on this connection.
        store.update_connection_state(ConnectionState::RealConnected);
        assert_eq!(store.snapshot().state, DeviceState::Connecting);

        store.mark_request_start();
        store.mark_request_end(&RequestOutcome::Success);
        assert_eq!(store.snapshot().state, DeviceState::Ready);

        store.mark_request_start();
        assert_eq!(store.snapshot().state, DeviceState::Busy);
        assert_eq!(store.snapshot().busy_count, 1);

        store.mark_request_end(&RequestOutcome::Success);
        assert_eq!(store.snapshot().state, DeviceState::Ready);
    }

    #[tokio::test]
    async fn offline_no_demo_is_error() {
        let store = DeviceStateStore::new();
        store.update_connection_state(ConnectionState::OfflineNoDemo);
        assert_eq!(store.snapshot().state, DeviceState::Error);
    }

    #[tokio::test]
    async fn reconnect_clears_success_history() {
        let store = DeviceStateStore::new();
        store.update_connection_state(ConnectionState::RealConnected);
        store.mark_request_start();
        store.mark_request_end(&RequestOutcome::Success);
        assert_eq!(store.snapshot().state, DeviceState::Ready);

        // Drop to discovery and back: the new connection must prove
        // itself again.
        store.update_connection_state(ConnectionState::Discovering);
        store.update_connection_state(ConnectionState::RealConnected);
        assert_eq!(store.snapshot().state, DeviceState::Connecting);
    }

    #[tokio::test]
    async fn repeated_connected_updates_keep_success_flag() {
        let store = DeviceStateStore::new();
        store.update_connection_state(ConnectionState::RealConnected);
        store.mark_request_start();
        store.mark_request_end(&RequestOutcome::Success);

        // Same value again is not a reconnect.
        store.update_connection_state(ConnectionState::RealConnected);
        assert_eq!(store.snapshot().state, DeviceState::Ready);
    }

    #[tokio::test]
    async fn busy_count_floors_at_zero() {
        let store = DeviceStateStore::new();
        store.mark_request_end(&RequestOutcome::Success);
        assert_eq!(store.snapshot().busy_count, 0);
    }

    #[tokio::test]
    async fn open_circuit_overrides_everything() {
        let store = DeviceStateStore::new();
        store.update_connection_state(ConnectionState::RealConnected);
        store.mark_request_start();
        store.mark_request_end(&RequestOutcome::Success);
        assert_eq!(store.snapshot().state, DeviceState::Ready);

        store.set_circuit_open_until(
            Some(Instant::now() + Duration::from_secs(30)),
            Some("too many failures"),
        );
        let snapshot = store.snapshot();
        assert_eq!(snapshot.state, DeviceState::Error);
        assert_eq!(
            snapshot.last_error_message.as_deref(),
            Some("too many failures")
        );

        store.set_circuit_open_until(None, None);
        assert_eq!(store.snapshot().state, DeviceState::Ready);
    }

    #[tokio::test]
    async fn failure_records_message_without_erasing_success_time() {
        let store = DeviceStateStore::new();
        store.update_connection_state(ConnectionState::DemoActive);
        store.mark_request_start();
        store.mark_request_end(&RequestOutcome::Success);
        let success_at = store.snapshot().last_success_at;
        assert!(success_at.is_some());

        store.mark_request_start();
        store.mark_request_end(&RequestOutcome::Failure {
            message: Some("HTTP 503 from /v1/drives".into()),
        });
        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.last_error_message.as_deref(),
            Some("HTTP 503 from /v1/drives")
        );
        assert_eq!(snapshot.last_success_at, success_at);
    }

    #[tokio::test]
    async fn subscribers_see_fresh_snapshots() {
        let store = DeviceStateStore::new();
        let mut stream = store.stream();
        assert_eq!(stream.current().state, DeviceState::Unknown);

        store.update_connection_state(ConnectionState::Discovering);
        let next = stream.changed().await.unwrap();
        assert_eq!(next.state, DeviceState::Discovering);
        assert_eq!(stream.current().state, DeviceState::Discovering);
    }
}
