//! Sealed-sender envelope + sender certificate.
//!
//! The envelope hides the sender identity from intermediaries: the relay
//! sees only the recipient id, an ephemeral X25519 public and opaque
//! ciphertext. Authenticity is proved INSIDE the envelope by a signed
//! sender certificate bound to the sender's identity key; the receive
//! pipeline checks the certificate's public against the session peer.
//!
//! Key agreement: ECDH(ephemeral, recipient identity X25519) expanded
//! with HKDF-SHA256 (salt "SealedSender-v1", info = ephemeral_pub ||
//! recipient_pub). Payload: AES-256-GCM, no additional AAD.
//!
//! Certificate signed data:
//!   "SenderCertificate-v1" || len(sender_id):u8 || sender_id
//!                          || sender_ed25519_pub || timestamp:i64BE

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::aead;
use crate::b64;
use crate::error::CryptoError;
use crate::identity::{verify_signature, IdentityKeyPair};
use crate::kdf;

pub const CERT_TAG: &[u8] = b"SenderCertificate-v1";
pub const SEALED_SALT: &[u8] = b"SealedSender-v1";

pub const CERT_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;
pub const CERT_MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;
pub const SEALED_TTL_MS: i64 = 24 * 60 * 60 * 1000;

// ── Sender certificate ───────────────────────────────────────────────────────

/// Proof of sender identity carried inside the sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderCertificate {
    pub sender_id: String,
    #[serde(with = "b64::key32")]
    pub sender_public: [u8; 32],
    pub timestamp: i64,
    #[serde(with = "b64::sig64")]
    pub signature: [u8; 64],
}

impl SenderCertificate {
    /// Issue a fresh certificate signed by the sender's identity key.
    pub fn issue(
        sender_id: &str,
        identity: &IdentityKeyPair,
        now_ms: i64,
    ) -> Result<Self, CryptoError> {
        if sender_id.is_empty() || sender_id.len() > u8::MAX as usize {
            return Err(CryptoError::CertificateInvalid(
                "sender id length out of range".into(),
            ));
        }
        let sender_public = identity.public().ed25519;
        let data = signed_data(sender_id, &sender_public, now_ms);
        let signature = identity.sign(&data);
        Ok(Self {
            sender_id: sender_id.to_string(),
            sender_public,
            timestamp: now_ms,
            signature,
        })
    }

    /// Valid iff younger than 24 h (exactly 24 h is rejected), at most
    /// 5 min in the future, and signed by the embedded public key.
    pub fn verify(&self, now_ms: i64) -> Result<(), CryptoError> {
        if self.timestamp + CERT_MAX_AGE_MS <= now_ms {
            return Err(CryptoError::CertificateInvalid("expired".into()));
        }
        if self.timestamp > now_ms + CERT_MAX_CLOCK_SKEW_MS {
            return Err(CryptoError::CertificateInvalid(
                "timestamp in the future".into(),
            ));
        }
        let data = signed_data(&self.sender_id, &self.sender_public, self.timestamp);
        verify_signature(&self.sender_public, &data, &self.signature)
            .map_err(|_| CryptoError::CertificateInvalid("signature".into()))
    }

    /// Binary layout: senderIdLen:u8 || senderId || ed25519[32]
    /// || timestamp:i64BE || signature[64].
    pub fn to_bytes(&self) -> Vec<u8> {
        let id = self.sender_id.as_bytes();
        let mut out = Vec::with_capacity(1 + id.len() + 32 + 8 + 64);
        out.push(id.len() as u8);
        out.extend_from_slice(id);
        out.extend_from_slice(&self.sender_public);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let err = || CryptoError::CertificateInvalid("truncated".into());
        if data.is_empty() {
            return Err(err());
        }
        let id_len = data[0] as usize;
        let total = 1 + id_len + 32 + 8 + 64;
        if data.len() != total {
            return Err(err());
        }
        let sender_id = std::str::from_utf8(&data[1..1 + id_len])
            .map_err(|_| CryptoError::CertificateInvalid("sender id not utf-8".into()))?
            .to_string();
        let mut cursor = 1 + id_len;
        let mut sender_public = [0u8; 32];
        sender_public.copy_from_slice(&data[cursor..cursor + 32]);
        cursor += 32;
        let timestamp = i64::from_be_bytes(
            data[cursor..cursor + 8].try_into().map_err(|_| err())?,
        );
        cursor += 8;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[cursor..cursor + 64]);
        Ok(Self {
            sender_id,
            sender_public,
            timestamp,
            signature,
        })
    }
}

fn signed_data(sender_id: &str, sender_public: &[u8; 32], timestamp: i64) -> Vec<u8> {
    let id = sender_id.as_bytes();
    let mut data = Vec::with_capacity(CERT_TAG.len() + 1 + id.len() + 32 + 8);
    data.extend_from_slice(CERT_TAG);
    data.push(id.len() as u8);
    data.extend_from_slice(id);
    data.extend_from_slice(sender_public);
    data.extend_from_slice(&timestamp.to_be_bytes());
    data
}

// ── Sealed envelope ──────────────────────────────────────────────────────────

/// Anonymous transport envelope. JSON-serializable for inter-tier
/// transport (raw fields as base64url).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub recipient_id: String,
    /// nonce(12) || ciphertext || tag(16)
    #[serde(with = "b64::vec")]
    pub encrypted_payload: Vec<u8>,
    #[serde(with = "b64::key32")]
    pub ephemeral_public: [u8; 32],
    pub timestamp: i64,
    pub expire_at: i64,
}

/// What a successful unseal yields.
pub struct UnsealedMessage {
    pub sender_id: String,
    pub sender_public: [u8; 32],
    pub inner: Vec<u8>,
    pub certificate_timestamp: i64,
}

fn sealed_key(
    shared: &[u8],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let mut info = Vec::with_capacity(64);
    info.extend_from_slice(ephemeral_public);
    info.extend_from_slice(recipient_public);
    kdf::hkdf_expand_32(shared, Some(SEALED_SALT), &info)
}

/// Seal `inner` for `recipient`, embedding a fresh sender certificate.
pub fn seal(
    sender_id: &str,
    recipient_id: &str,
    recipient_x25519: &[u8; 32],
    inner: &[u8],
    sender_identity: &IdentityKeyPair,
    now_ms: i64,
) -> Result<SealedEnvelope, CryptoError> {
    let certificate = SenderCertificate::issue(sender_id, sender_identity, now_ms)?;
    let cert_bytes = certificate.to_bytes();
    if cert_bytes.len() > u16::MAX as usize {
        return Err(CryptoError::EncryptFailed);
    }

    let mut payload = Vec::with_capacity(2 + cert_bytes.len() + inner.len());
    payload.extend_from_slice(&(cert_bytes.len() as u16).to_be_bytes());
    payload.extend_from_slice(&cert_bytes);
    payload.extend_from_slice(inner);

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&X25519Public::from(*recipient_x25519));
    let mut key = sealed_key(shared.as_bytes(), &ephemeral_public, recipient_x25519)?;

    let encrypted_payload = aead::encrypt(&key, &payload, &[])?;
    key.zeroize();
    payload.zeroize();

    Ok(SealedEnvelope {
        recipient_id: recipient_id.to_string(),
        encrypted_payload,
        ephemeral_public,
        timestamp: now_ms,
        expire_at: now_ms + SEALED_TTL_MS,
    })
}

/// Open a sealed envelope with the recipient's identity agreement secret.
///
/// Certificate failures collapse to the same generic `DecryptFailed` as
/// AEAD failures; this layer offers no oracle.
pub fn unseal(
    envelope: &SealedEnvelope,
    recipient_secret: &StaticSecret,
    now_ms: i64,
) -> Result<UnsealedMessage, CryptoError> {
    if now_ms > envelope.expire_at {
        return Err(CryptoError::DecryptFailed);
    }

    let recipient_public = X25519Public::from(recipient_secret).to_bytes();
    let shared = recipient_secret.diffie_hellman(&X25519Public::from(envelope.ephemeral_public));
    let mut key = sealed_key(shared.as_bytes(), &envelope.ephemeral_public, &recipient_public)?;
    let payload = aead::decrypt(&key, &envelope.encrypted_payload, &[]);
    key.zeroize();
    let payload = payload?;

    if payload.len() < 2 {
        return Err(CryptoError::DecryptFailed);
    }
    let cert_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + cert_len {
        return Err(CryptoError::DecryptFailed);
    }
    let certificate = SenderCertificate::from_bytes(&payload[2..2 + cert_len])
        .map_err(|_| CryptoError::DecryptFailed)?;
    certificate
        .verify(now_ms)
        .map_err(|_| CryptoError::DecryptFailed)?;

    Ok(UnsealedMessage {
        sender_id: certificate.sender_id,
        sender_public: certificate.sender_public,
        inner: payload[2 + cert_len..].to_vec(),
        certificate_timestamp: certificate.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    #[test]
    fn certificate_roundtrip_and_verify() {
        let identity = IdentityKeyPair::generate();
        let cert = SenderCertificate::issue("alice", &identity, 1_000).unwrap();
        cert.verify(1_000).unwrap();

        let restored = SenderCertificate::from_bytes(&cert.to_bytes()).unwrap();
        assert_eq!(restored, cert);
    }

    #[test]
    fn certificate_age_boundary() {
        let identity = IdentityKeyPair::generate();
        let cert = SenderCertificate::issue("alice", &identity, 0).unwrap();
        cert.verify(CERT_MAX_AGE_MS - 1).unwrap();
        assert!(cert.verify(CERT_MAX_AGE_MS).is_err());
    }

    #[test]
    fn certificate_future_skew_boundary() {
        let identity = IdentityKeyPair::generate();
        let now = 100 * HOUR_MS;
        let cert = SenderCertificate::issue("alice", &identity, now + CERT_MAX_CLOCK_SKEW_MS)
            .unwrap();
        cert.verify(now).unwrap();

        let cert = SenderCertificate::issue("alice", &identity, now + CERT_MAX_CLOCK_SKEW_MS + 1)
            .unwrap();
        assert!(cert.verify(now).is_err());
    }

    #[test]
    fn tampered_certificate_fails_verification() {
        let identity = IdentityKeyPair::generate();
        let mut cert = SenderCertificate::issue("alice", &identity, 1_000).unwrap();
        cert.timestamp += 1;
        assert!(cert.verify(1_001).is_err());
    }

    fn seal_hello(now_ms: i64) -> (IdentityKeyPair, IdentityKeyPair, SealedEnvelope) {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let envelope = seal(
            "alice",
            "bob",
            &bob.public().x25519,
            b"inner bytes",
            &alice,
            now_ms,
        )
        .unwrap();
        (alice, bob, envelope)
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let (alice, bob, envelope) = seal_hello(5_000);
        let opened = unseal(&envelope, &bob.x25519_secret(), 5_100).unwrap();
        assert_eq!(opened.sender_id, "alice");
        assert_eq!(opened.sender_public, alice.public().ed25519);
        assert_eq!(opened.inner, b"inner bytes");
        assert_eq!(opened.certificate_timestamp, 5_000);
    }

    #[test]
    fn any_flipped_payload_byte_fails() {
        let (_, bob, envelope) = seal_hello(5_000);
        for i in [0, 13, envelope.encrypted_payload.len() - 1] {
            let mut tampered = envelope.clone();
            tampered.encrypted_payload[i] ^= 0x01;
            assert!(matches!(
                unseal(&tampered, &bob.x25519_secret(), 5_100),
                Err(CryptoError::DecryptFailed)
            ));
        }
    }

    #[test]
    fn expired_envelope_is_rejected() {
        let (_, bob, envelope) = seal_hello(5_000);
        assert!(unseal(&envelope, &bob.x25519_secret(), envelope.expire_at + 1).is_err());
        unseal(&envelope, &bob.x25519_secret(), 6_000).unwrap();
    }

    #[test]
    fn stale_certificate_fails_inside_envelope() {
        // Sealed 1 h ago but carrying a certificate stamped 25 h ago.
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let sealed_at = 25 * HOUR_MS;
        let mut envelope = seal(
            "alice",
            "bob",
            &bob.public().x25519,
            b"x",
            &alice,
            0, // certificate timestamp: 25 h before the unseal clock
        )
        .unwrap();
        envelope.expire_at = sealed_at + SEALED_TTL_MS;
        assert!(matches!(
            unseal(&envelope, &bob.x25519_secret(), sealed_at),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn wrong_recipient_cannot_unseal() {
        let (_, _, envelope) = seal_hello(5_000);
        let eve = IdentityKeyPair::generate();
        assert!(matches!(
            unseal(&envelope, &eve.x25519_secret(), 5_100),
            Err(CryptoError::DecryptFailed)
        ));
    }
}
