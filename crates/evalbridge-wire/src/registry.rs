//! Request registry: tracks in-flight cross-runtime calls.
//!
//! The [`RequestRegistry`] is a thread-safe, concurrent map from correlation
//! id to a pending call. Each call is settled exactly once: by the matching
//! response, by its own timeout timer, or by [`RequestRegistry::cancel_all`].
//! Whichever comes first removes the entry; everything after that finds
//! nothing and is reported as [`SettleOutcome::DuplicateOrStale`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use evalbridge_types::envelope::{ResponseEnvelope, ResponseStatus};
use evalbridge_types::error::{BridgeError, BridgeResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

type Settlement = BridgeResult<ResponseEnvelope>;

/// One registered call. Owned by the registry until settled.
struct PendingCall {
    tx: oneshot::Sender<Settlement>,
    created_at: Instant,
    timeout_at: Instant,
    /// Distinguishes this registration from a later one under the same id.
    token: u64,
    timer: tokio::task::AbortHandle,
}

/// What a settlement attempt found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The pending call was found and completed.
    Settled,
    /// No pending call had this id: already settled, timed out, or never
    /// registered. Dropped without error.
    DuplicateOrStale,
}

struct Inner {
    pending: DashMap<String, PendingCall>,
    default_timeout: Duration,
    next_token: AtomicU64,
    stale: AtomicU64,
}

/// Thread-safe registry of pending calls. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RequestRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("pending", &self.pending_count())
            .field("stale", &self.stale_count())
            .finish()
    }
}

impl RequestRegistry {
    /// Create an empty registry whose calls time out after `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                default_timeout,
                next_token: AtomicU64::new(1),
                stale: AtomicU64::new(0),
            }),
        }
    }

    /// Register a call under `id` with the default timeout.
    ///
    /// Must be called from within a Tokio runtime (the timeout timer is a
    /// spawned task).
    pub fn register(&self, id: impl Into<String>) -> BridgeResult<PendingHandle> {
        self.register_with_timeout(id, self.inner.default_timeout)
    }

    /// Register a call under `id` that times out after `timeout`.
    ///
    /// Fails with [`BridgeError::DuplicateId`] if `id` is already pending.
    pub fn register_with_timeout(
        &self,
        id: impl Into<String>,
        timeout: Duration,
    ) -> BridgeResult<PendingHandle> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        let timeout_at = created_at + timeout;
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        // Insert while holding the shard lock so the timer can never observe
        // a missing entry for its own registration.
        match self.inner.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BridgeError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let timer = tokio::spawn(expire(
                    Arc::downgrade(&self.inner),
                    id.clone(),
                    token,
                    timeout_at,
                ));
                slot.insert(PendingCall {
                    tx,
                    created_at,
                    timeout_at,
                    token,
                    timer: timer.abort_handle(),
                });
            }
        }

        debug!(id = %id, timeout_ms = timeout.as_millis() as u64, "Registered pending call");
        Ok(PendingHandle { id, rx })
    }

    /// Settle the call matching `response.id`.
    ///
    /// `Success` resolves the caller with the envelope; `Error` rejects with
    /// [`BridgeError::Remote`]; `Timeout` rejects with [`BridgeError::Timeout`].
    pub fn settle(&self, response: ResponseEnvelope) -> SettleOutcome {
        let Some((id, call)) = self.inner.pending.remove(&response.id) else {
            return self.stale(&response.id);
        };
        call.timer.abort();
        let elapsed_ms = call.created_at.elapsed().as_millis() as u64;
        let result = match response.status {
            ResponseStatus::Success => Ok(response),
            ResponseStatus::Error => Err(BridgeError::Remote {
                id: id.clone(),
                message: response
                    .error
                    .unwrap_or_else(|| "remote error without message".to_string()),
            }),
            ResponseStatus::Timeout => Err(BridgeError::Timeout {
                what: format!(
                    "remote call {id}: {}",
                    response.error.as_deref().unwrap_or("peer gave up")
                ),
                elapsed_ms,
            }),
        };
        if call.tx.send(result).is_err() {
            debug!(id = %id, "Settled call whose caller already went away");
        }
        debug!(id = %id, elapsed_ms, "Settled pending call");
        SettleOutcome::Settled
    }

    /// Reject the call under `id` with a local error.
    pub fn reject(&self, id: &str, error: BridgeError) -> SettleOutcome {
        let Some((_, call)) = self.inner.pending.remove(id) else {
            return self.stale(id);
        };
        call.timer.abort();
        let _ = call.tx.send(Err(error));
        SettleOutcome::Settled
    }

    /// Reject every pending call with a connection error. Returns how many
    /// calls were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, call)) = self.inner.pending.remove(&id) {
                call.timer.abort();
                let _ = call
                    .tx
                    .send(Err(BridgeError::Connection(reason.to_string())));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(cancelled, reason, "Cancelled pending calls");
        }
        cancelled
    }

    fn stale(&self, id: &str) -> SettleOutcome {
        self.inner.stale.fetch_add(1, Ordering::Relaxed);
        warn!(id = %id, "Dropping response with no pending call (duplicate or stale)");
        SettleOutcome::DuplicateOrStale
    }

    /// Whether a call is pending under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.pending.contains_key(id)
    }

    /// Deadline of the call pending under `id`.
    pub fn deadline(&self, id: &str) -> Option<Instant> {
        self.inner.pending.get(id).map(|call| call.timeout_at)
    }

    /// Number of calls awaiting settlement.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of settlements that found no pending call.
    pub fn stale_count(&self) -> u64 {
        self.inner.stale.load(Ordering::Relaxed)
    }
}

/// Timer body: reclaim the entry if it is still this registration's.
async fn expire(inner: Weak<Inner>, id: String, token: u64, timeout_at: Instant) {
    tokio::time::sleep_until(timeout_at).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Some((_, call)) = inner.pending.remove_if(&id, |_, call| call.token == token) {
        let elapsed_ms = call.created_at.elapsed().as_millis() as u64;
        warn!(id = %id, elapsed_ms, "Pending call timed out");
        let _ = call.tx.send(Err(BridgeError::Timeout {
            what: format!("response to {id}"),
            elapsed_ms,
        }));
    }
}

/// The caller's side of a pending call.
#[derive(Debug)]
pub struct PendingHandle {
    id: String,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the single settlement of this call.
    pub async fn wait(self) -> BridgeResult<ResponseEnvelope> {
        match self.rx.await {
            Ok(settlement) => settlement,
            Err(_) => Err(BridgeError::Connection(format!(
                "registry dropped pending call {}",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RequestRegistry {
        RequestRegistry::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_settle_resolves_exactly_once() {
        let reg = registry();
        let handle = reg.register("call-1").unwrap();
        assert_eq!(reg.pending_count(), 1);

        let outcome = reg.settle(ResponseEnvelope::success("call-1", "6", 2));
        assert_eq!(outcome, SettleOutcome::Settled);
        assert_eq!(reg.pending_count(), 0);

        let again = reg.settle(ResponseEnvelope::success("call-1", "7", 2));
        assert_eq!(again, SettleOutcome::DuplicateOrStale);
        assert_eq!(reg.stale_count(), 1);

        let resp = handle.wait().await.unwrap();
        assert_eq!(resp.value.as_deref(), Some("6"));
    }

    #[tokio::test]
    async fn test_error_status_rejects() {
        let reg = registry();
        let handle = reg.register("call-2").unwrap();
        reg.settle(ResponseEnvelope::error("call-2", "Divide by zero"));
        match handle.wait().await {
            Err(BridgeError::Remote { id, message }) => {
                assert_eq!(id, "call-2");
                assert!(message.contains("Divide by zero"));
            }
            other => panic!("Expected Remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_status_rejects_with_timeout() {
        let reg = registry();
        let handle = reg.register("call-3").unwrap();
        reg.settle(ResponseEnvelope::timeout("call-3", "evaluator hung"));
        assert!(matches!(handle.wait().await, Err(BridgeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let reg = registry();
        let _first = reg.register("dup").unwrap();
        match reg.register("dup") {
            Err(BridgeError::DuplicateId(id)) => assert_eq!(id, "dup"),
            other => panic!("Expected DuplicateId, got {other:?}"),
        }
        assert_eq!(reg.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_cleans_up_entry() {
        let reg = registry();
        let handle = reg
            .register_with_timeout("slow", Duration::from_millis(50))
            .unwrap();
        assert!(reg.deadline("slow").is_some());

        match handle.wait().await {
            Err(BridgeError::Timeout { what, .. }) => assert!(what.contains("slow")),
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert!(!reg.contains("slow"));

        // A late response is a stale no-op
        let outcome = reg.settle(ResponseEnvelope::success("slow", "late", 1));
        assert_eq!(outcome, SettleOutcome::DuplicateOrStale);
    }

    #[tokio::test]
    async fn test_abandoned_handle_is_reclaimed() {
        let reg = registry();
        let handle = reg
            .register_with_timeout("abandoned", Duration::from_millis(30))
            .unwrap();
        drop(handle);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(reg.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_old_timer_spares_new_registration() {
        let reg = registry();
        let first = reg
            .register_with_timeout("reused", Duration::from_millis(40))
            .unwrap();
        reg.settle(ResponseEnvelope::success("reused", "1", 0));
        first.wait().await.unwrap();

        let second = reg
            .register_with_timeout("reused", Duration::from_secs(5))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reg.contains("reused"));
        reg.settle(ResponseEnvelope::success("reused", "2", 0));
        assert_eq!(second.wait().await.unwrap().value.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let reg = registry();
        let a = reg.register("a").unwrap();
        let b = reg.register("b").unwrap();
        assert_eq!(reg.cancel_all("shutting down"), 2);
        assert_eq!(reg.pending_count(), 0);
        assert!(matches!(a.wait().await, Err(BridgeError::Connection(_))));
        assert!(matches!(b.wait().await, Err(BridgeError::Connection(_))));
        assert_eq!(reg.stale_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_settlement_races() {
        let reg = registry();
        let mut handles = Vec::new();
        for i in 0..64 {
            handles.push(reg.register(format!("race-{i}")).unwrap());
        }

        let mut settlers = Vec::new();
        for _ in 0..4 {
            let reg = reg.clone();
            settlers.push(tokio::spawn(async move {
                let mut settled = 0;
                for i in 0..64 {
                    let outcome =
                        reg.settle(ResponseEnvelope::success(format!("race-{i}"), "ok", 0));
                    if outcome == SettleOutcome::Settled {
                        settled += 1;
                    }
                }
                settled
            }));
        }

        let mut total = 0;
        for s in settlers {
            total += s.await.unwrap();
        }
        assert_eq!(total, 64);
        assert_eq!(reg.stale_count(), 3 * 64);
        for h in handles {
            assert!(h.wait().await.is_ok());
        }
    }
}
