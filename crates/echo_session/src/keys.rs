//! Identity + prekey store operations.
//!
//! Owns the persisted key material: the identity master seed, the
//! rotating signed prekey, and the one-time prekey pool. Identity
//! rotation is forbidden; signed prekey rotation allocates the next id
//! and leaves previous ids resolvable for in-flight messages. One-time
//! prekey ids are unique and never reused.

use std::sync::Arc;

use tracing::{debug, info};

use echo_crypto::identity::IdentityKeyPair;
use echo_crypto::kdf::MasterSeed;
use echo_crypto::prekeys::{OneTimePrekey, SignedPrekey};
use echo_crypto::{b64, CryptoError};

use crate::error::SessionError;
use crate::services::{Clock, PreKeyService};
use crate::store::{storage_keys, SecretStore};

pub struct KeyStore {
    user_id: String,
    store: Arc<dyn SecretStore>,
    service: Arc<dyn PreKeyService>,
    clock: Arc<dyn Clock>,
}

impl KeyStore {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn SecretStore>,
        service: Arc<dyn PreKeyService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            service,
            clock,
        }
    }

    // ── Identity ─────────────────────────────────────────────────────────

    /// Load the identity; `KeysAbsent` if none was ever generated.
    pub async fn load_identity(&self) -> Result<IdentityKeyPair, SessionError> {
        let encoded = self
            .store
            .get(&storage_keys::identity_seed())
            .await?
            .ok_or(SessionError::KeysAbsent)?;
        let bytes = b64::decode(&encoded).map_err(CryptoError::from)?;
        let seed = MasterSeed::from_bytes(&bytes).map_err(SessionError::Crypto)?;
        Ok(IdentityKeyPair::from_seed(&seed))
    }

    /// Idempotent: returns the stored identity or derives and persists a
    /// new one (from `seed` when given, otherwise OS randomness).
    pub async fn load_or_create_identity(
        &self,
        seed: Option<MasterSeed>,
    ) -> Result<IdentityKeyPair, SessionError> {
        match self.load_identity().await {
            Ok(identity) => Ok(identity),
            Err(SessionError::KeysAbsent) => {
                let seed = seed.unwrap_or_else(MasterSeed::random);
                self.store
                    .put(&storage_keys::identity_seed(), &b64::encode(seed.as_bytes()))
                    .await?;
                info!(user = %self.user_id, "generated identity key pair");
                Ok(IdentityKeyPair::from_seed(&seed))
            }
            Err(e) => Err(e),
        }
    }

    // ── Signed prekeys ───────────────────────────────────────────────────

    /// The active signed prekey; rotates automatically when none exists
    /// or the current one has expired.
    pub async fn current_signed_prekey(
        &self,
        identity: &IdentityKeyPair,
    ) -> Result<SignedPrekey, SessionError> {
        let now = self.clock.now_ms();
        if let Some(id) = self.current_spk_id().await? {
            if let Some(spk) = self.signed_prekey(id, identity).await? {
                if !spk.is_expired(now) {
                    return Ok(spk);
                }
            }
        }
        self.rotate_signed_prekey(identity).await
    }

    /// Allocate `current_spk_id + 1`, persist the new pair and mark it
    /// current. Previous ids stay loadable until GC.
    pub async fn rotate_signed_prekey(
        &self,
        identity: &IdentityKeyPair,
    ) -> Result<SignedPrekey, SessionError> {
        let next_id = self.current_spk_id().await?.unwrap_or(0) + 1;
        let spk = SignedPrekey::generate(identity, next_id, self.clock.now_ms());
        self.persist_signed_prekey(&spk).await?;
        self.store
            .put(storage_keys::CURRENT_SPK_ID, &next_id.to_string())
            .await?;
        info!(id = next_id, "rotated signed prekey");
        Ok(spk)
    }

    /// Resolve any signed prekey by id, verifying it still belongs to
    /// the identity.
    pub async fn signed_prekey(
        &self,
        id: u32,
        identity: &IdentityKeyPair,
    ) -> Result<Option<SignedPrekey>, SessionError> {
        let Some(json) = self.store.get(&storage_keys::signed_prekey(id)).await? else {
            return Ok(None);
        };
        let spk: SignedPrekey = serde_json::from_str(&json)
            .map_err(|e| SessionError::Storage(format!("signed prekey {id}: {e}")))?;
        spk.verify(&identity.public().ed25519)
            .map_err(SessionError::Crypto)?;
        Ok(Some(spk))
    }

    /// Record a signed prekey as used. Reuse is not rejected; the flag
    /// is bookkeeping only.
    pub async fn mark_signed_prekey_used(
        &self,
        spk: &mut SignedPrekey,
    ) -> Result<(), SessionError> {
        spk.used = true;
        self.persist_signed_prekey(spk).await
    }

    async fn persist_signed_prekey(&self, spk: &SignedPrekey) -> Result<(), SessionError> {
        let json = serde_json::to_string(spk)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        self.store
            .put(&storage_keys::signed_prekey(spk.id), &json)
            .await
    }

    async fn current_spk_id(&self) -> Result<Option<u32>, SessionError> {
        match self.store.get(storage_keys::CURRENT_SPK_ID).await? {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u32>()
                .map(Some)
                .map_err(|e| SessionError::Storage(format!("current_spk_id: {e}"))),
        }
    }

    // ── One-time prekeys ─────────────────────────────────────────────────

    /// Allocate `count` fresh one-time prekeys with contiguous ids and
    /// persist each one.
    pub async fn generate_one_time_prekeys(
        &self,
        count: u32,
    ) -> Result<Vec<OneTimePrekey>, SessionError> {
        let start_id = self.next_otp_id().await?;
        let batch = OneTimePrekey::generate_batch(start_id, count, self.clock.now_ms());
        for otp in &batch {
            let json = serde_json::to_string(otp)
                .map_err(|e| SessionError::Storage(e.to_string()))?;
            self.store
                .put(&storage_keys::one_time_prekey(otp.id), &json)
                .await?;
        }
        self.store
            .put(storage_keys::NEXT_OTP_ID, &(start_id + count).to_string())
            .await?;
        debug!(start_id, count, "generated one-time prekeys");
        Ok(batch)
    }

    /// Consume a one-time prekey: returns it and deletes the entry.
    /// A missing id (already consumed or GC'd) yields `None`.
    pub async fn consume_one_time_prekey(
        &self,
        id: u32,
    ) -> Result<Option<OneTimePrekey>, SessionError> {
        let key = storage_keys::one_time_prekey(id);
        let Some(json) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let mut otp: OneTimePrekey = serde_json::from_str(&json)
            .map_err(|e| SessionError::Storage(format!("otp {id}: {e}")))?;
        otp.consumed = true;
        self.store.delete(&key).await?;
        debug!(id, "consumed one-time prekey");
        Ok(Some(otp))
    }

    async fn next_otp_id(&self) -> Result<u32, SessionError> {
        match self.store.get(storage_keys::NEXT_OTP_ID).await? {
            None => Ok(1), // id 0 is the wire sentinel for "no OPK"
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|e| SessionError::Storage(format!("next_otp_id: {e}"))),
        }
    }

    // ── Publication ──────────────────────────────────────────────────────

    /// Upload public halves to the prekey service.
    pub async fn publish_bundle(
        &self,
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPrekey,
        one_time_prekeys: &[OneTimePrekey],
    ) -> Result<(), SessionError> {
        self.service
            .upload_prekeys(
                &self.user_id,
                identity.public().clone(),
                signed_prekey.public_info(),
                one_time_prekeys
                    .iter()
                    .map(OneTimePrekey::public_info)
                    .collect(),
                identity.registration_id(),
            )
            .await
    }

    /// Top up the remote one-time prekey pool when it runs low.
    /// Idempotent when the remote count is already at or above the
    /// threshold; returns whether a batch was published.
    pub async fn replenish_if_below(
        &self,
        identity: &IdentityKeyPair,
        threshold: u32,
        batch: u32,
    ) -> Result<bool, SessionError> {
        let remaining = self.service.check_prekey_count(&self.user_id).await?;
        if remaining >= threshold {
            return Ok(false);
        }
        let fresh = self.generate_one_time_prekeys(batch).await?;
        let spk = self.current_signed_prekey(identity).await?;
        self.publish_bundle(identity, &spk, &fresh).await?;
        info!(remaining, batch, "replenished one-time prekeys");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ManualClock, MemoryPreKeyService, MemorySecretStore};

    fn key_store() -> (KeyStore, Arc<MemoryPreKeyService>, Arc<ManualClock>) {
        let service = Arc::new(MemoryPreKeyService::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = KeyStore::new(
            "alice",
            Arc::new(MemorySecretStore::new()),
            service.clone(),
            clock.clone(),
        );
        (store, service, clock)
    }

    #[tokio::test]
    async fn load_or_create_identity_is_idempotent() {
        let (ks, _, _) = key_store();
        assert!(matches!(
            ks.load_identity().await,
            Err(SessionError::KeysAbsent)
        ));

        let first = ks.load_or_create_identity(None).await.unwrap();
        let second = ks.load_or_create_identity(None).await.unwrap();
        assert_eq!(first.public(), second.public());
    }

    #[tokio::test]
    async fn rotation_allocates_successive_ids() {
        let (ks, _, _) = key_store();
        let identity = ks.load_or_create_identity(None).await.unwrap();

        let first = ks.current_signed_prekey(&identity).await.unwrap();
        assert_eq!(first.id, 1);
        let again = ks.current_signed_prekey(&identity).await.unwrap();
        assert_eq!(again.id, 1, "unexpired prekey is reused");

        let rotated = ks.rotate_signed_prekey(&identity).await.unwrap();
        assert_eq!(rotated.id, 2);
        // Previous id stays resolvable for in-flight messages.
        assert!(ks.signed_prekey(1, &identity).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_prekey_rotates_on_access() {
        let (ks, _, clock) = key_store();
        let identity = ks.load_or_create_identity(None).await.unwrap();
        let first = ks.current_signed_prekey(&identity).await.unwrap();

        clock.set(first.expires_at);
        let next = ks.current_signed_prekey(&identity).await.unwrap();
        assert_eq!(next.id, first.id + 1);
    }

    #[tokio::test]
    async fn otp_ids_advance_and_consume_deletes() {
        let (ks, _, _) = key_store();
        let batch = ks.generate_one_time_prekeys(3).await.unwrap();
        assert_eq!(batch.iter().map(|o| o.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let batch2 = ks.generate_one_time_prekeys(2).await.unwrap();
        assert_eq!(batch2.iter().map(|o| o.id).collect::<Vec<_>>(), vec![4, 5]);

        let consumed = ks.consume_one_time_prekey(2).await.unwrap().unwrap();
        assert!(consumed.consumed);
        assert!(ks.consume_one_time_prekey(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replenish_is_idempotent_above_threshold() {
        let (ks, service, _) = key_store();
        let identity = ks.load_or_create_identity(None).await.unwrap();

        assert!(ks.replenish_if_below(&identity, 10, 50).await.unwrap());
        assert_eq!(service.check_prekey_count("alice").await.unwrap(), 50);

        // Count is above threshold now; nothing happens.
        assert!(!ks.replenish_if_below(&identity, 10, 50).await.unwrap());
        assert_eq!(service.check_prekey_count("alice").await.unwrap(), 50);
    }
}
