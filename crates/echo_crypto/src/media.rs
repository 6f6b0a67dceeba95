//! Forward-secure media key chain.
//!
//! Each session lazily owns a media chain seeded from its root key. A
//! media blob gets a fresh 256-bit key derived from the chain head; the
//! chain then advances, so compromise of a later chain state cannot
//! recover earlier blob keys. The recipient stores received keys in the
//! session's `media_keys` map and looks them up by media id on download.
//!
//! Blob layout: nonce(12) || AES-256-GCM(media_key, nonce, plaintext,
//! AAD = "EchoMedia:<mediaId>").

use zeroize::Zeroize;

use crate::aead;
use crate::error::CryptoError;
use crate::hash::sha256_parts;
use crate::kdf;
use crate::ratchet::RatchetSession;

pub const INFO_MEDIA_CHAIN: &[u8] = b"EchoProtocol-MediaChain-v1";
pub const INFO_MEDIA_KEY: &[u8] = b"EchoProtocol-MediaKey-v1";
pub const INFO_MEDIA_ADVANCE: &[u8] = b"EchoProtocol-MediaChain-v1-advance";

const MEDIA_INIT_SALT: &[u8] = b"media-init";
const MEDIA_AAD_PREFIX: &str = "EchoMedia:";

impl RatchetSession {
    /// Derive the next media key, record it under a fresh media id, and
    /// advance the chain.
    pub fn next_media_key(&mut self, now_ms: i64) -> Result<(String, [u8; 32]), CryptoError> {
        let chain = match self.media_chain_key {
            Some(ck) => ck,
            None => {
                let ck = kdf::hkdf_expand_32(&self.root_key, Some(MEDIA_INIT_SALT), INFO_MEDIA_CHAIN)?;
                self.media_chain_key = Some(ck);
                ck
            }
        };

        let index_salt = [(self.media_key_index & 0xff) as u8];
        let media_key = kdf::hkdf_expand_32(&chain, Some(&index_salt), INFO_MEDIA_KEY)?;

        let digest = sha256_parts(&[
            &now_ms.to_be_bytes(),
            &self.media_key_index.to_be_bytes(),
        ]);
        let media_id = hex::encode(digest)[..16].to_string();
        self.media_keys.insert(media_id.clone(), media_key);

        let mut retired = chain;
        self.media_chain_key = Some(kdf::hkdf_expand_32(&retired, Some(&[0xff]), INFO_MEDIA_ADVANCE)?);
        retired.zeroize();
        self.media_key_index += 1;

        Ok((media_id, media_key))
    }

    /// Look up a stored media key by id.
    pub fn media_key(&self, media_id: &str) -> Option<[u8; 32]> {
        self.media_keys.get(media_id).copied()
    }

    /// Record a key received from the peer (carried inside a message).
    pub fn store_media_key(&mut self, media_id: &str, key: [u8; 32]) {
        self.media_keys.insert(media_id.to_string(), key);
    }

    pub fn media_key_index(&self) -> u32 {
        self.media_key_index
    }

    /// Wipe and forget the key for one media blob.
    pub fn delete_media(&mut self, media_id: &str) {
        if let Some(mut key) = self.media_keys.remove(media_id) {
            key.zeroize();
        }
    }
}

/// Encrypt a media blob under its per-blob key, binding the media id.
pub fn encrypt_media(key: &[u8; 32], media_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let aad = format!("{MEDIA_AAD_PREFIX}{media_id}");
    aead::encrypt(key, plaintext, aad.as_bytes())
}

/// Decrypt a media blob (nonce || ciphertext + tag).
pub fn decrypt_media(key: &[u8; 32], media_id: &str, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let aad = format!("{MEDIA_AAD_PREFIX}{media_id}");
    aead::decrypt(key, data, aad.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyPair;
    use crate::prekeys::{PreKeyBundle, SignedPrekey};
    use crate::x3dh;

    fn session() -> RatchetSession {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let spk = SignedPrekey::generate(&bob, 1, 0);
        let bundle = PreKeyBundle {
            identity: bob.public().clone(),
            signed_prekey: spk.public_info(),
            one_time_prekey: None,
            registration_id: bob.registration_id(),
        };
        let start = x3dh::initiate(&alice, &bundle, 1).unwrap();
        RatchetSession::initiate(
            "alice_bob".into(),
            "bob".into(),
            start.keys,
            &start.ephemeral,
            bundle.signed_prekey.public,
            1,
        )
    }

    #[test]
    fn consecutive_blobs_get_distinct_keys_and_ids() {
        let mut s = session();
        let (id1, key1) = s.next_media_key(1_000).unwrap();
        let (id2, key2) = s.next_media_key(1_001).unwrap();

        assert_ne!(id1, id2);
        assert_ne!(key1, key2);
        assert_eq!(s.media_key_index(), 2);
        assert_eq!(s.media_key(&id1), Some(key1));
        assert_eq!(s.media_key(&id2), Some(key2));
    }

    #[test]
    fn blob_roundtrip_binds_media_id() {
        let mut s = session();
        let (media_id, key) = s.next_media_key(1_000).unwrap();
        let blob = encrypt_media(&key, &media_id, b"one megabyte of cat").unwrap();

        assert_eq!(
            decrypt_media(&key, &media_id, &blob).unwrap(),
            b"one megabyte of cat"
        );
        assert!(decrypt_media(&key, "0000000000000000", &blob).is_err());
    }

    #[test]
    fn delete_media_forgets_key() {
        let mut s = session();
        let (media_id, _) = s.next_media_key(1_000).unwrap();
        s.delete_media(&media_id);
        assert!(s.media_key(&media_id).is_none());
    }

    #[test]
    fn media_id_is_sixteen_hex_chars() {
        let mut s = session();
        let (media_id, _) = s.next_media_key(1_000).unwrap();
        assert_eq!(media_id.len(), 16);
        assert!(media_id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
