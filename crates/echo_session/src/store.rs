//! Secret storage collaborator.
//!
//! The store is an opaque key → string map. Implementations MUST provide
//! at-rest encryption and atomic per-key writes; this crate only ever
//! reads and writes whole values under the keys below.

use async_trait::async_trait;

use crate::error::SessionError;

/// Storage key layout. Every key this crate touches uses one of these
/// prefixes; external tooling may rely on them for backup and wipe.
pub mod storage_keys {
    pub const IDENTITY_PREFIX: &str = "identity_";
    pub const SIGNED_PREKEY_PREFIX: &str = "signed_prekey_";
    pub const ONE_TIME_PREKEY_PREFIX: &str = "otp_";
    pub const SESSION_PREFIX: &str = "session_";
    pub const SESSION_IDS: &str = "session_ids";
    pub const NEXT_OTP_ID: &str = "next_otp_id";
    pub const CURRENT_SPK_ID: &str = "current_spk_id";
    pub const CACHE_KEY: &str = "cache_key";
    pub const SEQUENCE_COUNTERS: &str = "sequence_counters";

    pub fn identity_seed() -> String {
        format!("{IDENTITY_PREFIX}seed")
    }

    pub fn signed_prekey(id: u32) -> String {
        format!("{SIGNED_PREKEY_PREFIX}{id}")
    }

    pub fn one_time_prekey(id: u32) -> String {
        format!("{ONE_TIME_PREKEY_PREFIX}{id}")
    }

    pub fn session(session_id: &str) -> String {
        format!("{SESSION_PREFIX}{session_id}")
    }
}

/// Opaque key → string blob storage with atomic per-key writes.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), SessionError>;
    async fn delete(&self, key: &str) -> Result<(), SessionError>;
}
