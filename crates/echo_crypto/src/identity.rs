//! Identity key management
//!
//! Each user has one long-term identity: a signing pair (Ed25519) and an
//! agreement pair (X25519), both derived from a single 64-byte master
//! seed via HKDF with protocol-tagged info strings. The seed comes from
//! OS randomness, a caller-supplied 64-byte seed, or Argon2id over a
//! user passphrase.
//!
//! The pair is immutable after derivation; identity rotation is not a
//! supported operation. Private halves are zeroized on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::b64;
use crate::error::CryptoError;
use crate::hash::{sha256, sha256_parts};
use crate::kdf::{self, MasterSeed};

pub const INFO_IDENTITY_ED25519: &[u8] = b"EchoProtocol-Identity-Ed25519-v1";
pub const INFO_IDENTITY_X25519: &[u8] = b"EchoProtocol-Identity-X25519-v1";
pub const INFO_REGISTRATION_ID: &[u8] = b"EchoProtocol-RegistrationId-v1";

// ── Public half ──────────────────────────────────────────────────────────────

/// Public view of an identity: both public keys plus a short key id.
///
/// `key_id` is the hex of the first 8 bytes of SHA-256 over the Ed25519
/// public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublicKey {
    #[serde(with = "b64::key32")]
    pub ed25519: [u8; 32],
    #[serde(with = "b64::key32")]
    pub x25519: [u8; 32],
    pub key_id: String,
}

impl IdentityPublicKey {
    pub fn new(ed25519: [u8; 32], x25519: [u8; 32]) -> Self {
        let key_id = hex::encode(&sha256(&ed25519)[..8]);
        Self {
            ed25519,
            x25519,
            key_id,
        }
    }

    /// Human-verifiable fingerprint: uppercase hex of the first 16 bytes
    /// of SHA-256(ed25519 || x25519), grouped as eight 4-character blocks.
    ///
    /// Example: "A1B2 C3D4 E5F6 7890 ABCD EF01 2345 6789"
    pub fn fingerprint(&self) -> String {
        let digest = sha256_parts(&[&self.ed25519, &self.x25519]);
        let hex = hex::encode_upper(&digest[..16]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Identity keypair ─────────────────────────────────────────────────────────

/// Long-term identity key material. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    ed_secret: [u8; 32],
    x_secret: [u8; 32],
    #[zeroize(skip)]
    public: IdentityPublicKey,
    #[zeroize(skip)]
    registration_id: u32,
}

impl IdentityKeyPair {
    /// Fresh identity from OS randomness.
    pub fn generate() -> Self {
        Self::from_seed(&MasterSeed::random())
    }

    /// Deterministic identity from a 64-byte master seed.
    pub fn from_seed(seed: &MasterSeed) -> Self {
        let ed_secret = expand_seed(seed, INFO_IDENTITY_ED25519);
        let x_secret = expand_seed(seed, INFO_IDENTITY_X25519);
        let reg = expand_seed(seed, INFO_REGISTRATION_ID);
        let registration_id = u32::from_be_bytes([reg[0], reg[1], reg[2], reg[3]]);

        let signing_key = SigningKey::from_bytes(&ed_secret);
        let x_public = X25519Public::from(&StaticSecret::from(x_secret));
        let public =
            IdentityPublicKey::new(signing_key.verifying_key().to_bytes(), x_public.to_bytes());

        Self {
            ed_secret,
            x_secret,
            public,
            registration_id,
        }
    }

    /// Identity from a user passphrase + salt (Argon2id seed derivation).
    pub fn from_passphrase(passphrase: &[u8], salt: &[u8; 16]) -> Result<Self, CryptoError> {
        let seed = MasterSeed::from_passphrase(passphrase, salt)?;
        Ok(Self::from_seed(&seed))
    }

    pub fn public(&self) -> &IdentityPublicKey {
        &self.public
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// Sign arbitrary bytes; returns the raw 64-byte Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.ed_secret).sign(msg).to_bytes()
    }

    /// The X25519 agreement secret, for DH operations.
    pub fn x25519_secret(&self) -> StaticSecret {
        StaticSecret::from(self.x_secret)
    }
}

/// Verify an Ed25519 signature made by any identity public key.
pub fn verify_signature(
    public_bytes: &[u8; 32],
    msg: &[u8],
    sig_bytes: &[u8],
) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(public_bytes)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig = Signature::from_bytes(
        sig_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("bad signature length".into()))?,
    );
    vk.verify(msg, &sig)
        .map_err(|_| CryptoError::SignatureInvalid)
}

fn expand_seed(seed: &MasterSeed, info: &[u8]) -> [u8; 32] {
    kdf::hkdf_expand_32(seed.as_bytes(), None, info)
        .expect("32-byte expand from a SHA-256 PRK cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_derivation_is_deterministic() {
        let seed = MasterSeed::from_bytes(&[0x01; 64]).unwrap();
        let a = IdentityKeyPair::from_seed(&seed);
        let b = IdentityKeyPair::from_seed(&seed);
        assert_eq!(a.public(), b.public());
        assert_eq!(a.registration_id(), b.registration_id());
    }

    #[test]
    fn signing_and_agreement_keys_differ() {
        let pair = IdentityKeyPair::generate();
        assert_ne!(pair.public().ed25519, pair.public().x25519);
    }

    #[test]
    fn key_id_is_truncated_digest_of_ed_public() {
        let pair = IdentityKeyPair::generate();
        let expected = hex::encode(&sha256(&pair.public().ed25519)[..8]);
        assert_eq!(pair.public().key_id, expected);
        assert_eq!(pair.public().key_id.len(), 16);
    }

    #[test]
    fn fingerprint_has_eight_blocks_and_survives_serde() {
        let pair = IdentityKeyPair::generate();
        let fp = pair.public().fingerprint();
        let blocks: Vec<&str> = fp.split(' ').collect();
        assert_eq!(blocks.len(), 8);
        assert!(blocks.iter().all(|b| b.len() == 4));

        let json = serde_json::to_string(pair.public()).unwrap();
        let restored: IdentityPublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, *pair.public());
        assert_eq!(restored.fingerprint(), fp);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let pair = IdentityKeyPair::generate();
        let sig = pair.sign(b"bind me");
        verify_signature(&pair.public().ed25519, b"bind me", &sig).unwrap();

        let other = IdentityKeyPair::generate();
        assert!(verify_signature(&other.public().ed25519, b"bind me", &sig).is_err());
    }
}
