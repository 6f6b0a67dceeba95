use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no identity key material present")]
    KeysAbsent,

    #[error("prekey bundle invalid: {0}")]
    BundleInvalid(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("skipped-key bound exceeded")]
    SkipExceeded,

    #[error("session not initialised")]
    SessionNotInitialised,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
