//! External collaborator interfaces.
//!
//! All remote and ambient dependencies of the core are capability
//! traits, passed by reference and required to be thread-safe. CPU-bound
//! crypto never suspends; awaits happen only at these seams.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use echo_crypto::identity::IdentityPublicKey;
use echo_crypto::prekeys::{OneTimePrekeyPublic, PreKeyBundle, SignedPrekeyPublic};
use echo_crypto::sealed::SealedEnvelope;

use crate::error::SessionError;

/// Remote prekey publication + bundle fetch.
#[async_trait]
pub trait PreKeyService: Send + Sync {
    /// Fetch a peer's bundle. The service MUST atomically claim and
    /// remove one one-time prekey when available; absence is signalled
    /// by omitting the field. Failure is fatal to session establishment.
    async fn fetch_bundle(&self, recipient_id: &str) -> Result<PreKeyBundle, SessionError>;

    /// Idempotent upload of public halves.
    async fn upload_prekeys(
        &self,
        user_id: &str,
        identity: IdentityPublicKey,
        signed_prekey: SignedPrekeyPublic,
        one_time_prekeys: Vec<OneTimePrekeyPublic>,
        registration_id: u32,
    ) -> Result<(), SessionError>;

    /// Remaining one-time prekey count, for replenishment decisions.
    async fn check_prekey_count(&self, user_id: &str) -> Result<u32, SessionError>;
}

/// Opaque outbound byte delivery. Ordering is not guaranteed and
/// delivery is at-least-once; message ids are caller-generated.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        message_id: &str,
        recipient_id: &str,
        envelope: &SealedEnvelope,
        sequence_number: u64,
    ) -> Result<(), SessionError>;
}

/// Wall clock, injectable for boundary tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// System clock backed by `chrono`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Randomness for transport-facing material (message ids, cache masks).
/// Key generation inside `echo_crypto` draws from the OS RNG directly.
pub trait Random: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// OS randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl Random for OsRandom {
    fn fill(&self, buf: &mut [u8]) {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(buf);
    }
}

/// Fresh transport message id: 16 random bytes, base64url without padding.
pub fn new_message_id(random: &dyn Random) -> String {
    let mut bytes = [0u8; 16];
    random.fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique_and_unpadded() {
        let random = OsRandom;
        let a = new_message_id(&random);
        let b = new_message_id(&random);
        assert_ne!(a, b);
        assert_eq!(a.len(), 22); // ceil(16 * 4 / 3) without padding
        assert!(!a.contains('='));
    }
}
