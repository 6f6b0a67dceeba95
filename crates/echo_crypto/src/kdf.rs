//! Key derivation
//!
//! `MasterSeed` — the 64-byte seed both identity key pairs are derived
//!   from; fresh randomness, a caller-supplied seed, or Argon2id over a
//!   user passphrase.
//!
//! `hkdf_expand` — HKDF-SHA256, used for all session key material.
//!
//! `chain_step` — symmetric ratchet step: message key via HKDF, next
//!   chain key via HMAC-SHA256 over the constant 0x02.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

pub const MASTER_SEED_LEN: usize = 64;

pub const INFO_MESSAGE_KEY: &[u8] = b"EchoProtocol-MessageKey-v1";
pub const INFO_DH_RATCHET: &[u8] = b"EchoProtocol-DHRatchet-v1";

/// Argon2id parameters for passphrase-derived seeds:
/// 64 MiB memory, 3 iterations, 4 lanes, 64-byte output.
fn argon2_params() -> Params {
    Params::new(
        64 * 1024, // m_cost in KiB: 64 MiB
        3,         // t_cost
        4,         // p_cost
        Some(MASTER_SEED_LEN),
    )
    .expect("static Argon2 params are always valid")
}

/// 64-byte master seed. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct MasterSeed(pub(crate) [u8; MASTER_SEED_LEN]);

impl MasterSeed {
    /// Fresh seed from OS randomness.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; MASTER_SEED_LEN];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self(seed)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; MASTER_SEED_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "master seed must be {MASTER_SEED_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Derive a seed from a user passphrase + 16-byte salt via Argon2id.
    /// The salt is stored alongside the identity record (not secret).
    pub fn from_passphrase(passphrase: &[u8], salt: &[u8; 16]) -> Result<Self, CryptoError> {
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params());
        let mut seed = [0u8; MASTER_SEED_LEN];
        argon2
            .hash_password_into(passphrase, salt, &mut seed)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(Self(seed))
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_SEED_LEN] {
        &self.0
    }
}

/// Generate a fresh random 16-byte salt for passphrase derivation.
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be omitted (HKDF then uses a zeroed salt per RFC 5869).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// 32-byte convenience wrapper around [`hkdf_expand`].
pub fn hkdf_expand_32(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut out = [0u8; 32];
    hkdf_expand(ikm, salt, info, &mut out)?;
    Ok(out)
}

/// Symmetric ratchet step: chain key → (message_key, next_chain_key).
///
/// The message key is an HKDF expansion so it lives in a different key
/// space than the chain; the chain advances via HMAC over 0x02.
pub fn chain_step(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let message_key = hkdf_expand_32(ck, None, INFO_MESSAGE_KEY)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x02]);
    let next_ck: [u8; 32] = mac.finalize().into_bytes().into();

    Ok((message_key, next_ck))
}

/// DH ratchet key schedule: (root, dh_output) → (new_root, new_chain_key).
pub fn dh_ratchet_keys(
    root: &[u8; 32],
    dh_output: &[u8],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut okm = [0u8; 64];
    hkdf_expand(dh_output, Some(root), INFO_DH_RATCHET, &mut okm)?;
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    Ok((new_root, chain))
}
