//! echo_crypto — Echo Protocol cryptographic core
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Cryptographic failures collapse to a generic `DecryptFailed` before
//!   they leave this crate; error text never carries key bytes or nonces.
//!
//! # Module layout
//! - `identity` — long-lived signing (Ed25519) + agreement (X25519) pairs derived from a master seed
//! - `prekeys`  — signed prekeys, one-time prekeys, prekey bundles
//! - `x3dh`     — triple/quad Diffie-Hellman key agreement to root + chain keys
//! - `ratchet`  — double ratchet with DH turns, skipped keys, previous chains
//! - `sealed`   — sealed-sender envelope + signed sender certificate
//! - `media`    — forward-secure per-session media key chain
//! - `aead`     — AES-256-GCM encrypt/decrypt helpers
//! - `kdf`      — HKDF-SHA256 / HMAC chain steps / Argon2id seed derivation
//! - `hash`     — SHA-256 utilities (key ids, media ids, constant-time compare)
//! - `b64`      — base64url serde adapters for fixed-size key material
//! - `error`    — unified error type

pub mod aead;
pub mod b64;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod media;
pub mod prekeys;
pub mod ratchet;
pub mod sealed;
pub mod x3dh;

pub use error::CryptoError;
