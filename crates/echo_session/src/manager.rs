//! Per-peer session orchestration.
//!
//! The manager owns the send and receive pipelines:
//!
//!   send:    rate guard → session lock → load-or-establish (X3DH) →
//!            ratchet encrypt → persist → PreKey/whisper framing →
//!            sealed envelope → transport
//!   receive: unseal → certificate vs session peer → replay/sequence
//!            guards → session lock → (X3DH responder on first contact)
//!            → ratchet decrypt → persist
//!
//! Every encrypt/decrypt for one session runs under that session's
//! fair-FIFO async lock, which preserves chain-index monotonicity and
//! the skipped-key bookkeeping. A session is persisted before its
//! ciphertext is handed to transport; on error the in-memory state is
//! discarded, rolling back to the last persisted view.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use echo_crypto::identity::{IdentityKeyPair, IdentityPublicKey};
use echo_crypto::ratchet::{RatchetSession, SessionState};
use echo_crypto::sealed::{self, SealedEnvelope};
use echo_crypto::x3dh;
use echo_proto::message::TYPE_PREKEY;
use echo_proto::{EncryptedMessage, PreKeyMessage};

use crate::cache::SessionCache;
use crate::config::ProtocolConfig;
use crate::error::SessionError;
use crate::guard::{RateLimiter, ReplayGuard, SequenceGuard};
use crate::keys::KeyStore;
use crate::services::{new_message_id, Clock, PreKeyService, Random, Transport};
use crate::store::{storage_keys, SecretStore};

pub const SESSION_RECORD_VERSION: u32 = 1;

/// Persisted session record: the ratchet state plus the peer identity
/// it was established against (trusted on first use).
#[derive(Serialize, Deserialize)]
struct SessionRecord {
    version: u32,
    peer_identity: IdentityPublicKey,
    session: RatchetSession,
}

/// Result of a completed send.
#[derive(Debug)]
pub struct Outgoing {
    pub message_id: String,
    pub sequence_number: u64,
    pub envelope: SealedEnvelope,
}

/// Result of a completed receive.
#[derive(Debug)]
pub struct Incoming {
    pub peer_id: String,
    pub plaintext: Vec<u8>,
}

/// Inspection snapshot of one session, for UIs and tests.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub state: SessionState,
    pub is_initiator: bool,
    pub receiving_index: u32,
    pub skipped_key_count: usize,
    pub media_key_index: u32,
}

pub struct SessionManager {
    user_id: String,
    store: Arc<dyn SecretStore>,
    prekeys: Arc<dyn PreKeyService>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn Random>,
    config: ProtocolConfig,
    key_store: KeyStore,
    cache: SessionCache,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    replay: ReplayGuard,
    sequence: SequenceGuard,
    rate: RateLimiter,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)] // capability seams are injected one by one
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn SecretStore>,
        prekeys: Arc<dyn PreKeyService>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn Random>,
        config: ProtocolConfig,
    ) -> Self {
        let user_id = user_id.into();
        let key_store = KeyStore::new(
            user_id.clone(),
            store.clone(),
            prekeys.clone(),
            clock.clone(),
        );
        Self {
            user_id,
            cache: SessionCache::new(&*random),
            key_store,
            locks: Mutex::new(HashMap::new()),
            replay: ReplayGuard::new(),
            sequence: SequenceGuard::new(store.clone()),
            rate: RateLimiter::new(config.rate_limit_max, config.rate_limit_window_ms),
            store,
            prekeys,
            transport,
            clock,
            random,
            config,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    /// Drop all cached sessions and rotate the cache mask.
    pub fn clear_cache(&self) {
        self.cache.clear(&*self.random);
    }

    // ── Send pipeline ────────────────────────────────────────────────────

    /// Encrypt, frame, seal and deliver one message to a peer.
    ///
    /// First contact fetches the peer's bundle, runs the X3DH initiator
    /// flow and emits a PreKeyMessage; established sessions emit a bare
    /// whisper frame. The mutated session is persisted before the
    /// envelope reaches transport.
    pub async fn send(
        &self,
        peer_id: &str,
        plaintext: &[u8],
        identity: &IdentityKeyPair,
    ) -> Result<Outgoing, SessionError> {
        let now = self.clock.now_ms();
        self.rate.check(peer_id, now)?;

        let session_id = RatchetSession::session_id_for(&self.user_id, peer_id);
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;

        let (message_bytes, peer_identity) = match self.load_record(&session_id).await? {
            Some(mut record) => {
                let inner = record.session.encrypt(plaintext, now)?;
                self.persist_record(&session_id, &record).await?;
                (
                    EncryptedMessage::whisper(inner).to_bytes(),
                    record.peer_identity.clone(),
                )
            }
            None => {
                let bundle = self.prekeys.fetch_bundle(peer_id).await?;
                let start = x3dh::initiate(identity, &bundle, now)?;
                let mut session = RatchetSession::initiate(
                    session_id.clone(),
                    peer_id.to_string(),
                    start.keys,
                    &start.ephemeral,
                    bundle.signed_prekey.public,
                    now,
                );
                let inner = session.encrypt(plaintext, now)?;
                let prekey_message = PreKeyMessage {
                    sender_identity_ed25519: identity.public().ed25519,
                    sender_identity_x25519: identity.public().x25519,
                    ephemeral_key: start.ephemeral_public,
                    signed_prekey_id: bundle.signed_prekey.id,
                    one_time_prekey_id: start.used_one_time_prekey,
                    inner: EncryptedMessage::whisper(inner),
                };
                let record = SessionRecord {
                    version: SESSION_RECORD_VERSION,
                    peer_identity: bundle.identity.clone(),
                    session,
                };
                self.persist_record(&session_id, &record).await?;
                self.add_session_id(&session_id).await?;
                info!(session = %session_id, "established session as initiator");
                (prekey_message.to_bytes(), bundle.identity)
            }
        };

        let envelope = sealed::seal(
            &self.user_id,
            peer_id,
            &peer_identity.x25519,
            &message_bytes,
            identity,
            now,
        )?;
        let message_id = new_message_id(&*self.random);
        let sequence_number = self.sequence.next_outbound(&session_id).await?;
        self.transport
            .deliver(&message_id, peer_id, &envelope, sequence_number)
            .await?;
        debug!(session = %session_id, sequence_number, "delivered message");

        Ok(Outgoing {
            message_id,
            sequence_number,
            envelope,
        })
    }

    // ── Receive pipeline ─────────────────────────────────────────────────

    /// Full inbound pipeline: unseal the envelope, bind the sender
    /// certificate to the session peer, apply replay and sequence
    /// guards, then decrypt.
    pub async fn receive_envelope(
        &self,
        envelope: &SealedEnvelope,
        identity: &IdentityKeyPair,
        message_id: &str,
        sequence_number: Option<u64>,
    ) -> Result<Incoming, SessionError> {
        let now = self.clock.now_ms();
        let unsealed = sealed::unseal(envelope, &identity.x25519_secret(), now)?;
        let peer_id = unsealed.sender_id.clone();
        let session_id = RatchetSession::session_id_for(&self.user_id, &peer_id);

        self.replay.check(&session_id, message_id)?;
        if let Some(sequence) = sequence_number {
            self.sequence.check(&session_id, sequence).await?;
        }

        let plaintext = self
            .receive_inner(&peer_id, &unsealed.inner, identity, Some(&unsealed.sender_public))
            .await?;

        // Guard state commits only after a successful decrypt, so an
        // at-least-once redelivery of a failed message stays accepted.
        self.replay.record(&session_id, message_id);
        if let Some(sequence) = sequence_number {
            self.sequence.advance(&session_id, sequence).await?;
        }
        Ok(Incoming { peer_id, plaintext })
    }

    /// Decrypt raw message bytes from a known peer (no envelope layer).
    pub async fn receive(
        &self,
        peer_id: &str,
        bytes: &[u8],
        identity: &IdentityKeyPair,
    ) -> Result<Vec<u8>, SessionError> {
        self.receive_inner(peer_id, bytes, identity, None).await
    }

    async fn receive_inner(
        &self,
        peer_id: &str,
        bytes: &[u8],
        identity: &IdentityKeyPair,
        expected_sender_ed25519: Option<&[u8; 32]>,
    ) -> Result<Vec<u8>, SessionError> {
        if bytes.is_empty() {
            return Err(SessionError::DecryptFailed);
        }
        let now = self.clock.now_ms();
        let session_id = RatchetSession::session_id_for(&self.user_id, peer_id);
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;

        if bytes[0] == TYPE_PREKEY {
            self.receive_prekey_message(&session_id, peer_id, bytes, identity, expected_sender_ed25519, now)
                .await
        } else {
            let message = EncryptedMessage::from_bytes(bytes)?;
            let mut record = self
                .load_record(&session_id)
                .await?
                .ok_or(SessionError::NoSession)?;
            if let Some(expected) = expected_sender_ed25519 {
                if *expected != record.peer_identity.ed25519 {
                    // Certificate identity does not belong to this session.
                    return Err(SessionError::DecryptFailed);
                }
            }
            let plaintext = record
                .session
                .decrypt(&message.message, &self.config.limits, now)?;
            self.persist_record(&session_id, &record).await?;
            Ok(plaintext)
        }
    }

    /// X3DH responder flow: consume the referenced one-time prekey when
    /// it is still resolvable (a missing id falls back to 3-DH), install
    /// the session, decrypt the inner message.
    async fn receive_prekey_message(
        &self,
        session_id: &str,
        peer_id: &str,
        bytes: &[u8],
        identity: &IdentityKeyPair,
        expected_sender_ed25519: Option<&[u8; 32]>,
        now: i64,
    ) -> Result<Vec<u8>, SessionError> {
        let message = PreKeyMessage::from_bytes(bytes)?;
        if let Some(expected) = expected_sender_ed25519 {
            if *expected != message.sender_identity_ed25519 {
                return Err(SessionError::DecryptFailed);
            }
        }

        // At-least-once transport may replay the PreKeyMessage after the
        // session exists; the skipped-key store serves the duplicate.
        if let Some(mut record) = self.load_record(session_id).await? {
            let plaintext = record
                .session
                .decrypt(&message.inner.message, &self.config.limits, now)?;
            self.persist_record(session_id, &record).await?;
            return Ok(plaintext);
        }

        let mut signed_prekey = self
            .key_store
            .signed_prekey(message.signed_prekey_id, identity)
            .await?
            .ok_or(SessionError::InvalidPrekeyRef(message.signed_prekey_id))?;

        let one_time_prekey = match message.one_time_prekey_id {
            Some(id) => {
                let consumed = self.key_store.consume_one_time_prekey(id).await?;
                if consumed.is_none() {
                    warn!(id, "referenced one-time prekey is gone; falling back to 3-DH");
                }
                consumed
            }
            None => None,
        };

        let keys = x3dh::respond(
            identity,
            &signed_prekey,
            one_time_prekey.as_ref(),
            &message.sender_identity_x25519,
            &message.ephemeral_key,
        )?;
        let mut session = RatchetSession::respond(
            session_id.to_string(),
            peer_id.to_string(),
            keys,
            &signed_prekey,
            now,
        );
        let plaintext = session
            .decrypt(&message.inner.message, &self.config.limits, now)?;

        self.key_store.mark_signed_prekey_used(&mut signed_prekey).await?;
        let record = SessionRecord {
            version: SESSION_RECORD_VERSION,
            peer_identity: IdentityPublicKey::new(
                message.sender_identity_ed25519,
                message.sender_identity_x25519,
            ),
            session,
        };
        self.persist_record(session_id, &record).await?;
        self.add_session_id(session_id).await?;
        info!(session = %session_id, "established session as responder");
        Ok(plaintext)
    }

    // ── Media keys ───────────────────────────────────────────────────────

    /// Derive the next media key on the session's media chain.
    pub async fn create_media_key(
        &self,
        peer_id: &str,
    ) -> Result<(String, [u8; 32]), SessionError> {
        self.with_session(peer_id, |record, now| {
            record.session.next_media_key(now).map_err(SessionError::from)
        })
        .await
    }

    /// Look up a stored media key by id.
    pub async fn media_key(
        &self,
        peer_id: &str,
        media_id: &str,
    ) -> Result<Option<[u8; 32]>, SessionError> {
        let session_id = RatchetSession::session_id_for(&self.user_id, peer_id);
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;
        let record = self
            .load_record(&session_id)
            .await?
            .ok_or(SessionError::NoSession)?;
        Ok(record.session.media_key(media_id))
    }

    /// Record a media key received from the peer.
    pub async fn store_media_key(
        &self,
        peer_id: &str,
        media_id: &str,
        key: [u8; 32],
    ) -> Result<(), SessionError> {
        self.with_session(peer_id, |record, _| {
            record.session.store_media_key(media_id, key);
            Ok(())
        })
        .await
    }

    /// Wipe the key for one media blob.
    pub async fn delete_media(&self, peer_id: &str, media_id: &str) -> Result<(), SessionError> {
        self.with_session(peer_id, |record, _| {
            record.session.delete_media(media_id);
            Ok(())
        })
        .await
    }

    async fn with_session<R>(
        &self,
        peer_id: &str,
        f: impl FnOnce(&mut SessionRecord, i64) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let now = self.clock.now_ms();
        let session_id = RatchetSession::session_id_for(&self.user_id, peer_id);
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;
        let mut record = self
            .load_record(&session_id)
            .await?
            .ok_or(SessionError::NoSession)?;
        let result = f(&mut record, now)?;
        self.persist_record(&session_id, &record).await?;
        Ok(result)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Close and delete a session.
    pub async fn delete_session(&self, peer_id: &str) -> Result<(), SessionError> {
        let session_id = RatchetSession::session_id_for(&self.user_id, peer_id);
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;

        if let Ok(Some(mut record)) = self.load_record(&session_id).await {
            record.session.close();
        }
        self.store.delete(&storage_keys::session(&session_id)).await?;
        self.cache.remove(&session_id);
        self.remove_session_id(&session_id).await?;
        self.replay.forget_session(&session_id);
        info!(session = %session_id, "session closed");
        Ok(())
    }

    /// Snapshot a session's lifecycle state, if one exists.
    pub async fn session_info(&self, peer_id: &str) -> Result<Option<SessionInfo>, SessionError> {
        let session_id = RatchetSession::session_id_for(&self.user_id, peer_id);
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;
        Ok(self.load_record(&session_id).await?.map(|record| SessionInfo {
            state: record.session.state(),
            is_initiator: record.session.is_initiator,
            receiving_index: record.session.receiving_index(),
            skipped_key_count: record.session.skipped_key_count(),
            media_key_index: record.session.media_key_index(),
        }))
    }

    pub async fn list_session_ids(&self) -> Result<Vec<String>, SessionError> {
        match self.store.get(storage_keys::SESSION_IDS).await? {
            None => Ok(Vec::new()),
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| SessionError::Storage(format!("session_ids: {e}"))),
        }
    }

    /// Top up the one-time prekey pool per the configured thresholds.
    pub async fn maintain_prekeys(
        &self,
        identity: &IdentityKeyPair,
    ) -> Result<bool, SessionError> {
        self.key_store
            .replenish_if_below(
                identity,
                self.config.replenish_threshold,
                self.config.replenish_batch,
            )
            .await
    }

    // ── Persistence ──────────────────────────────────────────────────────

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn load_record(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        if let Some(json) = self.cache.get(session_id) {
            match decode_record(&json) {
                Ok(record) => return Ok(Some(record)),
                Err(_) => self.cache.remove(session_id),
            }
        }

        let Some(json) = self.store.get(&storage_keys::session(session_id)).await? else {
            return Ok(None);
        };
        match decode_record(&json) {
            Ok(record) => {
                self.cache.put(session_id, &json);
                Ok(Some(record))
            }
            Err(e) => {
                // Invalidated: delete the record so the peer can re-establish.
                warn!(session = %session_id, error = %e, "session record invalidated");
                self.store.delete(&storage_keys::session(session_id)).await?;
                self.cache.remove(session_id);
                self.remove_session_id(session_id).await?;
                Err(e)
            }
        }
    }

    async fn persist_record(
        &self,
        session_id: &str,
        record: &SessionRecord,
    ) -> Result<(), SessionError> {
        let json = serde_json::to_string(record)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        self.store.put(&storage_keys::session(session_id), &json).await?;
        self.cache.put(session_id, &json);
        Ok(())
    }

    async fn add_session_id(&self, session_id: &str) -> Result<(), SessionError> {
        let mut ids = self.list_session_ids().await?;
        if !ids.iter().any(|id| id == session_id) {
            ids.push(session_id.to_string());
            let json = serde_json::to_string(&ids)
                .map_err(|e| SessionError::Storage(e.to_string()))?;
            self.store.put(storage_keys::SESSION_IDS, &json).await?;
        }
        Ok(())
    }

    async fn remove_session_id(&self, session_id: &str) -> Result<(), SessionError> {
        let mut ids = self.list_session_ids().await?;
        let before = ids.len();
        ids.retain(|id| id != session_id);
        if ids.len() != before {
            let json = serde_json::to_string(&ids)
                .map_err(|e| SessionError::Storage(e.to_string()))?;
            self.store.put(storage_keys::SESSION_IDS, &json).await?;
        }
        Ok(())
    }
}

fn decode_record(json: &str) -> Result<SessionRecord, SessionError> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| SessionError::Storage(format!("session record: {e}")))?;
    let version = value
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as u32;
    if version != SESSION_RECORD_VERSION {
        return Err(SessionError::VersionMismatch(version));
    }
    serde_json::from_value(value)
        .map_err(|e| SessionError::Storage(format!("session record: {e}")))
}
