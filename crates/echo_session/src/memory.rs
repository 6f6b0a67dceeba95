//! In-memory capability implementations.
//!
//! Back the test suites and double as reference implementations for
//! embedders. None of these persist anything across process restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use echo_crypto::identity::IdentityPublicKey;
use echo_crypto::prekeys::{OneTimePrekeyPublic, PreKeyBundle, SignedPrekeyPublic};
use echo_crypto::sealed::SealedEnvelope;

use crate::error::SessionError;
use crate::services::{Clock, PreKeyService, Transport};
use crate::store::SecretStore;

// ── Secret store ─────────────────────────────────────────────────────────────

/// Plain map-backed store. Real deployments must encrypt at rest; tests
/// don't.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored (test helper).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

// ── Prekey service ───────────────────────────────────────────────────────────

struct PublishedKeys {
    identity: IdentityPublicKey,
    signed_prekey: SignedPrekeyPublic,
    one_time_prekeys: Vec<OneTimePrekeyPublic>,
    registration_id: u32,
}

/// In-process prekey directory. `fetch_bundle` claims one one-time
/// prekey atomically under the directory lock, matching the remote
/// service contract.
#[derive(Default)]
pub struct MemoryPreKeyService {
    published: RwLock<HashMap<String, PublishedKeys>>,
}

impl MemoryPreKeyService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreKeyService for MemoryPreKeyService {
    async fn fetch_bundle(&self, recipient_id: &str) -> Result<PreKeyBundle, SessionError> {
        let mut published = self.published.write();
        let entry = published
            .get_mut(recipient_id)
            .ok_or_else(|| SessionError::Unavailable(format!("no keys for {recipient_id}")))?;
        let one_time_prekey = if entry.one_time_prekeys.is_empty() {
            None
        } else {
            Some(entry.one_time_prekeys.remove(0))
        };
        Ok(PreKeyBundle {
            identity: entry.identity.clone(),
            signed_prekey: entry.signed_prekey.clone(),
            one_time_prekey,
            registration_id: entry.registration_id,
        })
    }

    async fn upload_prekeys(
        &self,
        user_id: &str,
        identity: IdentityPublicKey,
        signed_prekey: SignedPrekeyPublic,
        one_time_prekeys: Vec<OneTimePrekeyPublic>,
        registration_id: u32,
    ) -> Result<(), SessionError> {
        let mut published = self.published.write();
        let entry = published.entry(user_id.to_string()).or_insert_with(|| PublishedKeys {
            identity: identity.clone(),
            signed_prekey: signed_prekey.clone(),
            one_time_prekeys: Vec::new(),
            registration_id,
        });
        entry.identity = identity;
        entry.signed_prekey = signed_prekey;
        entry.registration_id = registration_id;
        // Idempotent: re-uploading an id already present is a no-op.
        for opk in one_time_prekeys {
            if !entry.one_time_prekeys.iter().any(|p| p.id == opk.id) {
                entry.one_time_prekeys.push(opk);
            }
        }
        Ok(())
    }

    async fn check_prekey_count(&self, user_id: &str) -> Result<u32, SessionError> {
        Ok(self
            .published
            .read()
            .get(user_id)
            .map(|e| e.one_time_prekeys.len() as u32)
            .unwrap_or(0))
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// One delivered record, as the inbox would replay it.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub message_id: String,
    pub recipient_id: String,
    pub envelope: SealedEnvelope,
    pub sequence_number: u64,
}

/// Collects outbound envelopes for inspection or loopback delivery.
#[derive(Default)]
pub struct MemoryTransport {
    delivered: RwLock<Vec<DeliveredMessage>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything delivered so far.
    pub fn drain(&self) -> Vec<DeliveredMessage> {
        std::mem::take(&mut *self.delivered.write())
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.read().len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn deliver(
        &self,
        message_id: &str,
        recipient_id: &str,
        envelope: &SealedEnvelope,
        sequence_number: u64,
    ) -> Result<(), SessionError> {
        self.delivered.write().push(DeliveredMessage {
            message_id: message_id.to_string(),
            recipient_id: recipient_id.to_string(),
            envelope: envelope.clone(),
            sequence_number,
        });
        Ok(())
    }
}

// ── Clock ────────────────────────────────────────────────────────────────────

/// Manually advanced clock for boundary tests.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
