//! Binary codecs for published key material.
//!
//! Layouts (big-endian):
//!   SignedPrekeyPublic:  id:u32 || publicKey[32] || signature[64] || expiresAt:i64
//!   OneTimePrekeyPublic: id:u32 || publicKey[32]
//!   IdentityPublicKey:   keyIdLen:u8 || keyId || ed25519[32] || x25519[32]

use echo_crypto::identity::IdentityPublicKey;
use echo_crypto::prekeys::{OneTimePrekeyPublic, SignedPrekeyPublic};

use crate::error::ProtoError;

const SIGNED_PREKEY_LEN: usize = 4 + 32 + 64 + 8;
const ONE_TIME_PREKEY_LEN: usize = 4 + 32;

pub fn signed_prekey_to_bytes(spk: &SignedPrekeyPublic) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIGNED_PREKEY_LEN);
    out.extend_from_slice(&spk.id.to_be_bytes());
    out.extend_from_slice(&spk.public);
    out.extend_from_slice(&spk.signature);
    out.extend_from_slice(&spk.expires_at.to_be_bytes());
    out
}

pub fn signed_prekey_from_bytes(data: &[u8]) -> Result<SignedPrekeyPublic, ProtoError> {
    if data.len() != SIGNED_PREKEY_LEN {
        return Err(ProtoError::Truncated);
    }
    let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let mut public = [0u8; 32];
    public.copy_from_slice(&data[4..36]);
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&data[36..100]);
    let expires_at = i64::from_be_bytes(
        data[100..108]
            .try_into()
            .map_err(|_| ProtoError::Truncated)?,
    );
    Ok(SignedPrekeyPublic {
        id,
        public,
        signature,
        expires_at,
    })
}

pub fn one_time_prekey_to_bytes(opk: &OneTimePrekeyPublic) -> Vec<u8> {
    let mut out = Vec::with_capacity(ONE_TIME_PREKEY_LEN);
    out.extend_from_slice(&opk.id.to_be_bytes());
    out.extend_from_slice(&opk.public);
    out
}

pub fn one_time_prekey_from_bytes(data: &[u8]) -> Result<OneTimePrekeyPublic, ProtoError> {
    if data.len() != ONE_TIME_PREKEY_LEN {
        return Err(ProtoError::Truncated);
    }
    let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let mut public = [0u8; 32];
    public.copy_from_slice(&data[4..36]);
    Ok(OneTimePrekeyPublic { id, public })
}

pub fn identity_public_to_bytes(identity: &IdentityPublicKey) -> Vec<u8> {
    let key_id = identity.key_id.as_bytes();
    let mut out = Vec::with_capacity(1 + key_id.len() + 64);
    out.push(key_id.len() as u8);
    out.extend_from_slice(key_id);
    out.extend_from_slice(&identity.ed25519);
    out.extend_from_slice(&identity.x25519);
    out
}

pub fn identity_public_from_bytes(data: &[u8]) -> Result<IdentityPublicKey, ProtoError> {
    if data.is_empty() {
        return Err(ProtoError::Truncated);
    }
    let id_len = data[0] as usize;
    if data.len() != 1 + id_len + 64 {
        return Err(ProtoError::Truncated);
    }
    let key_id = std::str::from_utf8(&data[1..1 + id_len])
        .map_err(|_| ProtoError::Malformed("key id not utf-8"))?;
    let mut ed25519 = [0u8; 32];
    ed25519.copy_from_slice(&data[1 + id_len..33 + id_len]);
    let mut x25519 = [0u8; 32];
    x25519.copy_from_slice(&data[33 + id_len..65 + id_len]);

    // key_id is derived data; a frame whose carried id disagrees with the
    // embedded public is corrupt.
    let identity = IdentityPublicKey::new(ed25519, x25519);
    if identity.key_id != key_id {
        return Err(ProtoError::Malformed("key id does not match public key"));
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_crypto::identity::IdentityKeyPair;
    use echo_crypto::prekeys::{OneTimePrekey, SignedPrekey};

    #[test]
    fn signed_prekey_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPrekey::generate(&identity, 42, 1_000).public_info();
        let restored = signed_prekey_from_bytes(&signed_prekey_to_bytes(&spk)).unwrap();
        assert_eq!(restored, spk);
    }

    #[test]
    fn one_time_prekey_roundtrip() {
        let opk = OneTimePrekey::generate(9, 0).public_info();
        let restored = one_time_prekey_from_bytes(&one_time_prekey_to_bytes(&opk)).unwrap();
        assert_eq!(restored, opk);
    }

    #[test]
    fn identity_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let bytes = identity_public_to_bytes(identity.public());
        let restored = identity_public_from_bytes(&bytes).unwrap();
        assert_eq!(restored, *identity.public());
    }

    #[test]
    fn identity_rejects_mismatched_key_id() {
        let identity = IdentityKeyPair::generate();
        let mut bytes = identity_public_to_bytes(identity.public());
        // Flip a bit inside the embedded Ed25519 public.
        bytes[20] ^= 0x01;
        assert!(matches!(
            identity_public_from_bytes(&bytes),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_frames_fail() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPrekey::generate(&identity, 1, 0).public_info();
        let bytes = signed_prekey_to_bytes(&spk);
        assert!(signed_prekey_from_bytes(&bytes[..50]).is_err());
    }
}
