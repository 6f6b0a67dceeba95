//! Prekeys
//!
//! - Signed Prekey (SPK): X25519, public half signed by the identity
//!   Ed25519 key, valid for 30 days, rotated on expiry. Previous ids stay
//!   resolvable for in-flight messages.
//! - One-Time Prekeys (OPK): X25519, consumed once per session init.
//!   Batch-generated with monotonically increasing ids; never reused.
//! - PreKeyBundle: public halves published for session initiators.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::b64;
use crate::error::CryptoError;
use crate::identity::{verify_signature, IdentityKeyPair, IdentityPublicKey};

pub const SIGNED_PREKEY_VALIDITY_MS: i64 = 30 * 24 * 60 * 60 * 1000;

// ── Signed prekey ────────────────────────────────────────────────────────────

/// Full signed prekey, private half included. Persisted by the key store.
#[derive(Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SignedPrekey {
    #[zeroize(skip)]
    pub id: u32,
    #[serde(with = "b64::key32")]
    secret: [u8; 32],
    #[zeroize(skip)]
    #[serde(with = "b64::key32")]
    pub public: [u8; 32],
    #[zeroize(skip)]
    #[serde(with = "b64::sig64")]
    pub signature: [u8; 64],
    #[zeroize(skip)]
    pub created_at: i64,
    #[zeroize(skip)]
    pub expires_at: i64,
    #[zeroize(skip)]
    pub used: bool,
}

impl SignedPrekey {
    /// Generate a fresh signed prekey, its public half signed by the
    /// identity Ed25519 key over the raw X25519 public bytes.
    pub fn generate(identity: &IdentityKeyPair, id: u32, now_ms: i64) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        let signature = identity.sign(public.as_bytes());
        Self {
            id,
            secret: secret.to_bytes(),
            public: public.to_bytes(),
            signature,
            created_at: now_ms,
            expires_at: now_ms + SIGNED_PREKEY_VALIDITY_MS,
            used: false,
        }
    }

    /// Expiry is exclusive: valid strictly before `expires_at`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    /// Self-verification against the owning identity.
    pub fn verify(&self, identity_ed25519: &[u8; 32]) -> Result<(), CryptoError> {
        verify_signature(identity_ed25519, &self.public, &self.signature)
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn public_info(&self) -> SignedPrekeyPublic {
        SignedPrekeyPublic {
            id: self.id,
            public: self.public,
            signature: self.signature,
            expires_at: self.expires_at,
        }
    }
}

/// Public half of a signed prekey, as published in bundles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPrekeyPublic {
    pub id: u32,
    #[serde(with = "b64::key32")]
    pub public: [u8; 32],
    #[serde(with = "b64::sig64")]
    pub signature: [u8; 64],
    pub expires_at: i64,
}

// ── One-time prekeys ─────────────────────────────────────────────────────────

/// Full one-time prekey, private half included.
#[derive(Serialize, Deserialize, ZeroizeOnDrop)]
pub struct OneTimePrekey {
    #[zeroize(skip)]
    pub id: u32,
    #[serde(with = "b64::key32")]
    secret: [u8; 32],
    #[zeroize(skip)]
    #[serde(with = "b64::key32")]
    pub public: [u8; 32],
    #[zeroize(skip)]
    pub created_at: i64,
    #[zeroize(skip)]
    pub consumed: bool,
}

impl OneTimePrekey {
    pub fn generate(id: u32, now_ms: i64) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            id,
            secret: secret.to_bytes(),
            public: public.to_bytes(),
            created_at: now_ms,
            consumed: false,
        }
    }

    /// Generate a batch with ids `[start_id, start_id + count)`.
    pub fn generate_batch(start_id: u32, count: u32, now_ms: i64) -> Vec<Self> {
        (start_id..start_id + count)
            .map(|id| Self::generate(id, now_ms))
            .collect()
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn public_info(&self) -> OneTimePrekeyPublic {
        OneTimePrekeyPublic {
            id: self.id,
            public: self.public,
        }
    }
}

/// Public half of a one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekeyPublic {
    pub id: u32,
    #[serde(with = "b64::key32")]
    pub public: [u8; 32],
}

// ── Prekey bundle ────────────────────────────────────────────────────────────

/// Published key set fetched by a session initiator. The one-time prekey
/// is claimed atomically by the prekey service and may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub identity: IdentityPublicKey,
    pub signed_prekey: SignedPrekeyPublic,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<OneTimePrekeyPublic>,
    pub registration_id: u32,
}

impl PreKeyBundle {
    /// Valid iff the signed prekey is unexpired and its signature
    /// verifies against the bundle's identity key.
    pub fn validate(&self, now_ms: i64) -> Result<(), CryptoError> {
        if now_ms >= self.signed_prekey.expires_at {
            return Err(CryptoError::BundleInvalid("signed prekey expired".into()));
        }
        verify_signature(
            &self.identity.ed25519,
            &self.signed_prekey.public,
            &self.signed_prekey.signature,
        )
        .map_err(|_| CryptoError::BundleInvalid("signed prekey signature".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_for(identity: &IdentityKeyPair, now_ms: i64) -> (SignedPrekey, PreKeyBundle) {
        let spk = SignedPrekey::generate(identity, 1, now_ms);
        let bundle = PreKeyBundle {
            identity: identity.public().clone(),
            signed_prekey: spk.public_info(),
            one_time_prekey: None,
            registration_id: identity.registration_id(),
        };
        (spk, bundle)
    }

    #[test]
    fn signed_prekey_verifies_against_owner() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPrekey::generate(&identity, 7, 1_000);
        spk.verify(&identity.public().ed25519).unwrap();

        let stranger = IdentityKeyPair::generate();
        assert!(spk.verify(&stranger.public().ed25519).is_err());
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPrekey::generate(&identity, 1, 0);
        assert!(!spk.is_expired(spk.expires_at - 1));
        assert!(spk.is_expired(spk.expires_at));
    }

    #[test]
    fn bundle_rejects_expired_prekey() {
        let identity = IdentityKeyPair::generate();
        let (spk, bundle) = bundle_for(&identity, 0);
        bundle.validate(spk.expires_at - 1).unwrap();
        assert!(matches!(
            bundle.validate(spk.expires_at),
            Err(CryptoError::BundleInvalid(_))
        ));
    }

    #[test]
    fn bundle_rejects_foreign_signature() {
        let identity = IdentityKeyPair::generate();
        let imposter = IdentityKeyPair::generate();
        let (_, mut bundle) = bundle_for(&identity, 0);
        // Re-sign the prekey with a different identity but keep the bundle's claim.
        bundle.signed_prekey.signature = imposter.sign(&bundle.signed_prekey.public);
        assert!(matches!(
            bundle.validate(1),
            Err(CryptoError::BundleInvalid(_))
        ));
    }

    #[test]
    fn batch_ids_are_contiguous() {
        let batch = OneTimePrekey::generate_batch(10, 5, 0);
        let ids: Vec<u32> = batch.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);
    }
}
