//! Replay, sequence and rate protections.
//!
//! These run ABOVE the ratchet in the send/receive pipelines; ratchet
//! decryption itself stays order-tolerant within the skip bounds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::SessionError;
use crate::store::{storage_keys, SecretStore};

// ── Timestamp window ─────────────────────────────────────────────────────────

/// Accepts timestamps at most `max_future_ms` ahead of and `max_age_ms`
/// behind the local clock. Call sites override the defaults where their
/// contract differs (sender certificates use 24 h).
#[derive(Debug, Clone, Copy)]
pub struct TimestampWindow {
    pub max_future_ms: i64,
    pub max_age_ms: i64,
}

impl Default for TimestampWindow {
    fn default() -> Self {
        Self {
            max_future_ms: 2 * 60 * 1000,
            max_age_ms: 5 * 60 * 1000,
        }
    }
}

impl TimestampWindow {
    pub fn check(&self, timestamp_ms: i64, now_ms: i64) -> Result<(), SessionError> {
        if timestamp_ms > now_ms + self.max_future_ms {
            return Err(SessionError::ReplayRejected);
        }
        if now_ms - timestamp_ms > self.max_age_ms {
            return Err(SessionError::ReplayRejected);
        }
        Ok(())
    }
}

// ── Message-id replay set ────────────────────────────────────────────────────

/// In-memory per-session set of seen message ids.
///
/// Ids are recorded only after a successful decrypt so that at-least-
/// once redelivery of a message that previously failed stays accepted.
#[derive(Default)]
pub struct ReplayGuard {
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, session_id: &str, message_id: &str) -> Result<(), SessionError> {
        let seen = self.seen.lock();
        if seen
            .get(session_id)
            .is_some_and(|ids| ids.contains(message_id))
        {
            warn!(session = session_id, "duplicate message id rejected");
            return Err(SessionError::ReplayRejected);
        }
        Ok(())
    }

    pub fn record(&self, session_id: &str, message_id: &str) {
        self.seen
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(message_id.to_string());
    }

    pub fn forget_session(&self, session_id: &str) {
        self.seen.lock().remove(session_id);
    }
}

// ── Monotonic sequence ───────────────────────────────────────────────────────

/// Strictly increasing per-conversation sequence numbers, persisted
/// under `sequence_counters` so restarts do not reopen the window.
/// Inbound high-water marks and outbound allocations share the map
/// under `recv:`/`send:` keys.
pub struct SequenceGuard {
    store: Arc<dyn SecretStore>,
    counters: tokio::sync::Mutex<Option<HashMap<String, u64>>>,
}

impl SequenceGuard {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            counters: tokio::sync::Mutex::new(None),
        }
    }

    async fn with_counters<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, u64>) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let mut guard = self.counters.lock().await;
        if guard.is_none() {
            let loaded = match self.store.get(storage_keys::SEQUENCE_COUNTERS).await? {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| SessionError::Storage(format!("sequence_counters: {e}")))?,
                None => HashMap::new(),
            };
            *guard = Some(loaded);
        }
        let counters = guard.as_mut().expect("loaded above");
        let result = f(&mut *counters)?;
        let json = serde_json::to_string(counters)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        self.store
            .put(storage_keys::SEQUENCE_COUNTERS, &json)
            .await?;
        Ok(result)
    }

    /// Reject `sequence <= last seen` for the conversation without
    /// committing anything.
    pub async fn check(&self, conversation_id: &str, sequence: u64) -> Result<(), SessionError> {
        self.with_counters(|counters| {
            let last = counters
                .get(&format!("recv:{conversation_id}"))
                .copied()
                .unwrap_or(0);
            if sequence <= last {
                warn!(conversation = conversation_id, sequence, last, "sequence rejected");
                return Err(SessionError::SequenceRejected);
            }
            Ok(())
        })
        .await
    }

    /// Commit a successfully processed sequence number.
    pub async fn advance(&self, conversation_id: &str, sequence: u64) -> Result<(), SessionError> {
        self.with_counters(|counters| {
            let key = format!("recv:{conversation_id}");
            let last = counters.get(&key).copied().unwrap_or(0);
            if sequence > last {
                counters.insert(key, sequence);
            }
            Ok(())
        })
        .await
    }

    /// Check then immediately commit; for call sites with no separate
    /// success point.
    pub async fn check_and_advance(
        &self,
        conversation_id: &str,
        sequence: u64,
    ) -> Result<(), SessionError> {
        self.check(conversation_id, sequence).await?;
        self.advance(conversation_id, sequence).await
    }

    /// Allocate the next outbound sequence number for a conversation.
    /// Durable, so a restarted sender never reuses a number the peer has
    /// already seen.
    pub async fn next_outbound(&self, conversation_id: &str) -> Result<u64, SessionError> {
        self.with_counters(|counters| {
            let key = format!("send:{conversation_id}");
            let next = counters.get(&key).copied().unwrap_or(0) + 1;
            counters.insert(key, next);
            Ok(next)
        })
        .await
    }
}

// ── Rate limiter ─────────────────────────────────────────────────────────────

const RATE_GC_INTERVAL_MS: i64 = 10 * 60 * 1000;
const RATE_GC_MAX_IDLE_MS: i64 = 60 * 60 * 1000;

struct RateState {
    attempts: HashMap<String, Vec<i64>>,
    last_gc_ms: i64,
}

/// Token-style sliding window keyed by a caller-provided identifier.
/// Entries idle for over an hour are dropped every ten minutes.
pub struct RateLimiter {
    max: u32,
    window_ms: i64,
    state: Mutex<RateState>,
}

impl RateLimiter {
    pub fn new(max: u32, window_ms: i64) -> Self {
        Self {
            max,
            window_ms,
            state: Mutex::new(RateState {
                attempts: HashMap::new(),
                last_gc_ms: 0,
            }),
        }
    }

    /// Record an attempt; `RateLimited` carries a retry-after hint.
    pub fn check(&self, key: &str, now_ms: i64) -> Result<(), SessionError> {
        let mut state = self.state.lock();

        if now_ms - state.last_gc_ms >= RATE_GC_INTERVAL_MS {
            state.attempts.retain(|_, stamps| {
                stamps
                    .last()
                    .is_some_and(|&newest| now_ms - newest < RATE_GC_MAX_IDLE_MS)
            });
            state.last_gc_ms = now_ms;
        }

        let window_ms = self.window_ms;
        let stamps = state.attempts.entry(key.to_string()).or_default();
        stamps.retain(|&t| now_ms - t < window_ms);

        if stamps.len() >= self.max as usize {
            let oldest = stamps.first().copied().unwrap_or(now_ms);
            let retry_after_ms = (oldest + window_ms - now_ms).max(0);
            return Err(SessionError::RateLimited {
                retry_after_secs: (retry_after_ms as u64).div_ceil(1000),
            });
        }
        stamps.push(now_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySecretStore;

    #[test]
    fn window_accepts_and_rejects() {
        let window = TimestampWindow::default();
        let now = 1_000_000;
        window.check(now, now).unwrap();
        window.check(now - window.max_age_ms, now).unwrap();
        assert!(window.check(now - window.max_age_ms - 1, now).is_err());
        window.check(now + window.max_future_ms, now).unwrap();
        assert!(window.check(now + window.max_future_ms + 1, now).is_err());
    }

    #[test]
    fn replay_guard_rejects_duplicates_per_session() {
        let guard = ReplayGuard::new();
        guard.check("s1", "m1").unwrap();
        guard.record("s1", "m1");
        assert!(guard.check("s1", "m1").is_err());
        // An id never recorded (failed decrypt) stays accepted.
        guard.check("s1", "m2").unwrap();
        guard.check("s1", "m2").unwrap();
        // Same id under another session is fine.
        guard.check("s2", "m1").unwrap();
    }

    #[tokio::test]
    async fn sequence_guard_is_monotonic_and_persistent() {
        let store = Arc::new(MemorySecretStore::new());
        let guard = SequenceGuard::new(store.clone());

        guard.check_and_advance("a_b", 1).await.unwrap();
        guard.check_and_advance("a_b", 5).await.unwrap();
        assert!(guard.check_and_advance("a_b", 5).await.is_err());
        assert!(guard.check_and_advance("a_b", 4).await.is_err());

        // A fresh guard over the same store remembers the high-water mark.
        let rebooted = SequenceGuard::new(store);
        assert!(rebooted.check_and_advance("a_b", 5).await.is_err());
        rebooted.check_and_advance("a_b", 6).await.unwrap();
    }

    #[tokio::test]
    async fn outbound_allocation_survives_restart() {
        let store = Arc::new(MemorySecretStore::new());
        let guard = SequenceGuard::new(store.clone());
        assert_eq!(guard.next_outbound("a_b").await.unwrap(), 1);
        assert_eq!(guard.next_outbound("a_b").await.unwrap(), 2);

        let rebooted = SequenceGuard::new(store);
        assert_eq!(rebooted.next_outbound("a_b").await.unwrap(), 3);
        // Inbound tracking for the same conversation is independent.
        rebooted.check_and_advance("a_b", 1).await.unwrap();
    }

    #[test]
    fn rate_limiter_enforces_window_with_hint() {
        let limiter = RateLimiter::new(2, 10_000);
        limiter.check("peer", 1_000).unwrap();
        limiter.check("peer", 2_000).unwrap();
        match limiter.check("peer", 3_000) {
            Err(SessionError::RateLimited { retry_after_secs }) => {
                // Oldest attempt at 1s + 10s window - now 3s = 8s.
                assert_eq!(retry_after_secs, 8);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        // Outside the window the key recovers.
        limiter.check("peer", 11_001).unwrap();
    }

    #[test]
    fn rate_limiter_gc_drops_idle_entries() {
        let limiter = RateLimiter::new(1, 1_000);
        limiter.check("old", 0).unwrap();
        // Over an hour later a GC pass runs and forgets the idle key.
        limiter.check("fresh", RATE_GC_MAX_IDLE_MS + 1).unwrap();
        assert!(!limiter.state.lock().attempts.contains_key("old"));
    }
}
