//! Forward-secure message ratchet.
//!
//! A session holds one root key and at most one live chain per
//! direction. Each chain derives a single-use message key per index
//! (HKDF for the message key, HMAC over 0x02 to advance); the root key
//! only moves on a DH turn, which mixes a fresh X25519 agreement into
//! it and installs replacement chains.
//!
//! Chain zero needs no turn: the initiator's sending chain and the
//! responder's receiving chain both come straight from X3DH, with the
//! X3DH ephemeral standing in as the initiator's first ratchet keypair
//! and the responder's signed prekey as its own. The responder adopts
//! the peer ratchet public from the first message it decrypts. From
//! then on, a message arriving under an unknown ratchet public turns
//! the receiving side and immediately re-keys the sending side under a
//! freshly generated pair, so no chain outlives one round trip.
//!
//! Out-of-order delivery is served from a bounded, expiring
//! skipped-key store, and a chain displaced by a turn is parked in
//! `previous_receiving_chains` (keyed by its ratchet public, capped at
//! its declared length) so stragglers stay decryptable.

use std::collections::HashMap;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::aead;
use crate::b64;
use crate::error::CryptoError;
use crate::kdf;
use crate::prekeys::SignedPrekey;
use crate::x3dh::SessionKeys;

// ── Limits ───────────────────────────────────────────────────────────────────

/// Bounds on the skipped-key store. Tunable per deployment; the defaults
/// are the protocol constants.
#[derive(Debug, Clone, Copy)]
pub struct RatchetLimits {
    /// Cumulative skipped keys retained per session.
    pub max_skipped: usize,
    /// Largest single forward jump within one chain.
    pub max_skip_distance: u32,
    /// Skipped entries older than this are garbage-collected on touch.
    pub skip_expiry_ms: i64,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self {
            max_skipped: 1000,
            max_skip_distance: 2000,
            skip_expiry_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

// ── Message ──────────────────────────────────────────────────────────────────

/// One ratcheted message: the unencrypted ratchet header fields plus the
/// AEAD body (nonce || ciphertext || tag). Wire framing lives upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    pub sender_ratchet_key: [u8; 32],
    pub previous_chain_length: u32,
    pub message_index: u32,
    pub body: Vec<u8>,
}

// ── Session state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Invalidated,
    Closed,
}

#[derive(Serialize, Deserialize)]
struct SkippedKey {
    #[serde(with = "b64::key32")]
    message_key: [u8; 32],
    stored_at: i64,
}

/// A receiving chain retired by a DH turn. Keyed by its ratchet public;
/// kept so late messages stay decryptable until expiry.
#[derive(Serialize, Deserialize)]
struct PreviousChain {
    #[serde(with = "b64::key32")]
    chain_key: [u8; 32],
    index: u32,
    /// Declared total length of the chain; indexes at or past it were
    /// never sent and are rejected.
    final_length: u32,
}

/// Complete Double Ratchet session state for one peer.
/// Persisted as JSON by the session manager (secrets as base64url).
#[derive(Serialize, Deserialize)]
pub struct RatchetSession {
    pub session_id: String,
    pub peer_user_id: String,

    #[serde(with = "b64::key32")]
    pub(crate) root_key: [u8; 32],
    /// AEAD associated data binding the sorted identity pair.
    #[serde(with = "b64::vec")]
    ad: Vec<u8>,

    // ── Ratchet keys ─────────────────────────────────────────────────────
    #[serde(with = "b64::key32")]
    our_ratchet_secret: [u8; 32],
    #[serde(with = "b64::key32")]
    our_ratchet_public: [u8; 32],
    #[serde(with = "b64::opt_key32")]
    their_ratchet_public: Option<[u8; 32]>,

    // ── Sending chain ────────────────────────────────────────────────────
    #[serde(with = "b64::opt_key32")]
    send_chain_key: Option<[u8; 32]>,
    send_index: u32,
    /// Length of our previous sending chain, carried in every header.
    prev_send_length: u32,

    // ── Receiving chain ──────────────────────────────────────────────────
    #[serde(with = "b64::opt_key32")]
    recv_chain_key: Option<[u8; 32]>,
    recv_index: u32,
    previous_receiving_chains: HashMap<String, PreviousChain>,

    // ── Skipped message keys ─────────────────────────────────────────────
    /// "(base64 ratchet public):(index)" → message key. Bounded and
    /// expiring; served once and deleted.
    skipped_message_keys: HashMap<String, SkippedKey>,

    // ── Media chain ──────────────────────────────────────────────────────
    #[serde(with = "b64::opt_key32")]
    pub(crate) media_chain_key: Option<[u8; 32]>,
    pub(crate) media_key_index: u32,
    #[serde(with = "b64::map32")]
    pub(crate) media_keys: HashMap<String, [u8; 32]>,

    pub created_at: i64,
    pub last_activity_at: i64,
    pub is_initiator: bool,
    state: SessionState,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.our_ratchet_secret.zeroize();
        if let Some(ref mut ck) = self.send_chain_key {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.recv_chain_key {
            ck.zeroize();
        }
        for chain in self.previous_receiving_chains.values_mut() {
            chain.chain_key.zeroize();
        }
        for entry in self.skipped_message_keys.values_mut() {
            entry.message_key.zeroize();
        }
        if let Some(ref mut ck) = self.media_chain_key {
            ck.zeroize();
        }
        for key in self.media_keys.values_mut() {
            key.zeroize();
        }
    }
}

fn skip_key(ratchet_pub_b64: &str, index: u32) -> String {
    format!("{ratchet_pub_b64}:{index}")
}

// ── Construction ─────────────────────────────────────────────────────────────

impl RatchetSession {
    /// Session id shared by both parties: the sorted user-id pair.
    pub fn session_id_for(a: &str, b: &str) -> String {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        format!("{first}_{second}")
    }

    /// Create a session as the INITIATOR (Alice).
    ///
    /// The sending chain starts on the X3DH chain key; the X3DH
    /// ephemeral serves as our first ratchet keypair and the peer's
    /// signed prekey as their ratchet public.
    pub fn initiate(
        session_id: String,
        peer_user_id: String,
        keys: SessionKeys,
        ephemeral: &StaticSecret,
        their_signed_prekey_public: [u8; 32],
        now_ms: i64,
    ) -> Self {
        Self {
            session_id,
            peer_user_id,
            root_key: keys.root_key,
            ad: keys.ad,
            our_ratchet_secret: ephemeral.to_bytes(),
            our_ratchet_public: X25519Public::from(ephemeral).to_bytes(),
            their_ratchet_public: Some(their_signed_prekey_public),
            send_chain_key: Some(keys.chain_key),
            send_index: 0,
            prev_send_length: 0,
            recv_chain_key: None,
            recv_index: 0,
            previous_receiving_chains: HashMap::new(),
            skipped_message_keys: HashMap::new(),
            media_chain_key: None,
            media_key_index: 0,
            media_keys: HashMap::new(),
            created_at: now_ms,
            last_activity_at: now_ms,
            is_initiator: true,
            state: SessionState::Pending,
        }
    }

    /// Create a session as the RESPONDER (Bob).
    ///
    /// The receiving chain starts on the X3DH chain key; our signed
    /// prekey is the first ratchet keypair. The peer's ratchet public is
    /// adopted from their first message.
    pub fn respond(
        session_id: String,
        peer_user_id: String,
        keys: SessionKeys,
        signed_prekey: &SignedPrekey,
        now_ms: i64,
    ) -> Self {
        let secret = signed_prekey.secret();
        Self {
            session_id,
            peer_user_id,
            root_key: keys.root_key,
            ad: keys.ad,
            our_ratchet_secret: secret.to_bytes(),
            our_ratchet_public: signed_prekey.public,
            their_ratchet_public: None,
            send_chain_key: None,
            send_index: 0,
            prev_send_length: 0,
            recv_chain_key: Some(keys.chain_key),
            recv_index: 0,
            previous_receiving_chains: HashMap::new(),
            skipped_message_keys: HashMap::new(),
            media_chain_key: None,
            media_key_index: 0,
            media_keys: HashMap::new(),
            created_at: now_ms,
            last_activity_at: now_ms,
            is_initiator: false,
            state: SessionState::Pending,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn invalidate(&mut self) {
        self.state = SessionState::Invalidated;
    }

    pub fn our_ratchet_public(&self) -> [u8; 32] {
        self.our_ratchet_public
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped_message_keys.len()
    }

    pub fn receiving_index(&self) -> u32 {
        self.recv_index
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Encrypt one message, advancing the sending chain.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        now_ms: i64,
    ) -> Result<RatchetMessage, CryptoError> {
        if self.send_chain_key.is_none() {
            // Responder's first send: turn the sending side of the ratchet.
            self.turn_sending_chain()?;
        }
        let ck = self
            .send_chain_key
            .ok_or(CryptoError::SessionNotInitialised)?;

        let (mut message_key, next_ck) = kdf::chain_step(&ck)?;
        let aad = self.message_aad(
            &self.our_ratchet_public,
            self.send_index,
            self.prev_send_length,
        );
        let body = aead::encrypt(&message_key, plaintext, &aad)?;
        message_key.zeroize();

        let message = RatchetMessage {
            sender_ratchet_key: self.our_ratchet_public,
            previous_chain_length: self.prev_send_length,
            message_index: self.send_index,
            body,
        };

        self.send_chain_key = Some(next_ck);
        self.send_index += 1;
        self.mark_active(now_ms);
        Ok(message)
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Decrypt one message, in any order within the skip bounds.
    pub fn decrypt(
        &mut self,
        message: &RatchetMessage,
        limits: &RatchetLimits,
        now_ms: i64,
    ) -> Result<Vec<u8>, CryptoError> {
        self.gc_skipped(limits, now_ms);

        let ratchet_b64 = b64::encode(&message.sender_ratchet_key);

        // 1. Out-of-order message with a precomputed key?
        let key = skip_key(&ratchet_b64, message.message_index);
        if let Some(entry) = self.skipped_message_keys.get(&key) {
            let message_key = entry.message_key;
            let aad = self.message_aad(
                &message.sender_ratchet_key,
                message.message_index,
                message.previous_chain_length,
            );
            let plaintext = aead::decrypt(&message_key, &message.body, &aad)?;
            if let Some(mut used) = self.skipped_message_keys.remove(&key) {
                used.message_key.zeroize();
            }
            self.mark_active(now_ms);
            return Ok(plaintext);
        }

        // 2. Current receiving chain?
        match self.their_ratchet_public {
            Some(current) if current == message.sender_ratchet_key => {
                return self.decrypt_on_current(message, limits, now_ms);
            }
            None => {
                // Responder's first message: adopt the sender's ratchet
                // key; the receiving chain is already seeded from X3DH.
                self.their_ratchet_public = Some(message.sender_ratchet_key);
                return self.decrypt_on_current(message, limits, now_ms);
            }
            Some(_) => {}
        }

        // 3. A chain retired by an earlier DH turn?
        if self.previous_receiving_chains.contains_key(&ratchet_b64) {
            return self.decrypt_on_previous(&ratchet_b64, message, limits, now_ms);
        }

        // 4. New ratchet public: turn the ratchet, then decrypt on the
        //    fresh receiving chain.
        self.dh_ratchet(message, limits, now_ms)?;
        self.decrypt_on_current(message, limits, now_ms)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    fn message_aad(&self, ratchet_public: &[u8; 32], index: u32, previous_length: u32) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.ad.len() + 40);
        aad.extend_from_slice(&self.ad);
        aad.extend_from_slice(ratchet_public);
        aad.extend_from_slice(&index.to_be_bytes());
        aad.extend_from_slice(&previous_length.to_be_bytes());
        aad
    }

    /// Derive and install a new sending chain against the peer's current
    /// ratchet public, under a freshly generated keypair.
    fn turn_sending_chain(&mut self) -> Result<(), CryptoError> {
        let their = self
            .their_ratchet_public
            .ok_or(CryptoError::SessionNotInitialised)?;

        let new_secret = StaticSecret::random_from_rng(OsRng);
        let new_public = X25519Public::from(&new_secret);
        let dh = new_secret.diffie_hellman(&X25519Public::from(their));
        let (new_root, new_send_ck) = kdf::dh_ratchet_keys(&self.root_key, dh.as_bytes())?;

        self.root_key = new_root;
        self.prev_send_length = self.send_index;
        self.send_chain_key = Some(new_send_ck);
        self.send_index = 0;
        self.our_ratchet_secret = new_secret.to_bytes();
        self.our_ratchet_public = new_public.to_bytes();
        Ok(())
    }

    /// Full DH ratchet on receipt of a message from a new ratchet public:
    /// finish and retire the current receiving chain, derive the new
    /// receiving chain, then immediately replace the sending side too.
    fn dh_ratchet(
        &mut self,
        message: &RatchetMessage,
        limits: &RatchetLimits,
        now_ms: i64,
    ) -> Result<(), CryptoError> {
        let incoming = X25519Public::from(message.sender_ratchet_key);

        // 1+2. Store any keys still owed on the current chain, then move
        // it into the retired set under its ratchet public.
        if let (Some(their), Some(_)) = (self.their_ratchet_public, self.recv_chain_key) {
            if message.previous_chain_length > self.recv_index {
                self.skip_to(message.previous_chain_length, limits, now_ms)?;
            }
            if let Some(chain_key) = self.recv_chain_key.take() {
                self.previous_receiving_chains.insert(
                    b64::encode(&their),
                    PreviousChain {
                        chain_key,
                        index: self.recv_index,
                        final_length: self.recv_index,
                    },
                );
            }
        }

        // 3. Receiving side: mix DH(our current ratchet, incoming).
        let dh_recv =
            StaticSecret::from(self.our_ratchet_secret).diffie_hellman(&incoming);
        let (new_root, new_recv_ck) = kdf::dh_ratchet_keys(&self.root_key, dh_recv.as_bytes())?;
        self.root_key = new_root;
        self.recv_chain_key = Some(new_recv_ck);
        self.recv_index = 0;

        // 4. Sending side: fresh keypair against the incoming public.
        let new_secret = StaticSecret::random_from_rng(OsRng);
        let new_public = X25519Public::from(&new_secret);
        let dh_send = new_secret.diffie_hellman(&incoming);
        let (new_root, new_send_ck) = kdf::dh_ratchet_keys(&self.root_key, dh_send.as_bytes())?;
        self.root_key = new_root;
        self.prev_send_length = self.send_index;
        self.send_chain_key = Some(new_send_ck);
        self.send_index = 0;
        self.our_ratchet_secret = new_secret.to_bytes();
        self.our_ratchet_public = new_public.to_bytes();

        // 5. Track the peer's new ratchet public.
        self.their_ratchet_public = Some(message.sender_ratchet_key);
        Ok(())
    }

    fn decrypt_on_current(
        &mut self,
        message: &RatchetMessage,
        limits: &RatchetLimits,
        now_ms: i64,
    ) -> Result<Vec<u8>, CryptoError> {
        if message.message_index < self.recv_index {
            // Consumed and no longer in the skipped store.
            return Err(CryptoError::DecryptFailed);
        }
        if message.message_index > self.recv_index {
            self.skip_to(message.message_index, limits, now_ms)?;
        }

        let ck = self
            .recv_chain_key
            .ok_or(CryptoError::SessionNotInitialised)?;
        let (mut message_key, next_ck) = kdf::chain_step(&ck)?;
        let aad = self.message_aad(
            &message.sender_ratchet_key,
            message.message_index,
            message.previous_chain_length,
        );
        let plaintext = aead::decrypt(&message_key, &message.body, &aad)?;
        message_key.zeroize();

        self.recv_chain_key = Some(next_ck);
        self.recv_index += 1;
        self.mark_active(now_ms);
        Ok(plaintext)
    }

    /// Late message addressed to a retired chain: replay the same
    /// skip-and-store logic on that chain's stored state.
    fn decrypt_on_previous(
        &mut self,
        ratchet_b64: &str,
        message: &RatchetMessage,
        limits: &RatchetLimits,
        now_ms: i64,
    ) -> Result<Vec<u8>, CryptoError> {
        let (chain_key, index, final_length) = {
            let chain = self
                .previous_receiving_chains
                .get(ratchet_b64)
                .ok_or(CryptoError::DecryptFailed)?;
            (chain.chain_key, chain.index, chain.final_length)
        };

        if message.message_index >= final_length || message.message_index < index {
            return Err(CryptoError::DecryptFailed);
        }

        let gap = message.message_index - index;
        self.can_skip(gap, limits)?;

        let mut ck = chain_key;
        let mut cursor = index;
        while cursor < message.message_index {
            let (mk, next) = kdf::chain_step(&ck)?;
            self.skipped_message_keys.insert(
                skip_key(ratchet_b64, cursor),
                SkippedKey {
                    message_key: mk,
                    stored_at: now_ms,
                },
            );
            ck = next;
            cursor += 1;
        }

        let (mut message_key, next_ck) = kdf::chain_step(&ck)?;
        let aad = self.message_aad(
            &message.sender_ratchet_key,
            message.message_index,
            message.previous_chain_length,
        );
        let plaintext = aead::decrypt(&message_key, &message.body, &aad)?;
        message_key.zeroize();

        if let Some(chain) = self.previous_receiving_chains.get_mut(ratchet_b64) {
            chain.chain_key = next_ck;
            chain.index = cursor + 1;
        }
        self.mark_active(now_ms);
        Ok(plaintext)
    }

    /// Derive and store message keys on the current receiving chain up to
    /// (but not including) `until`, subject to the skip bounds.
    fn skip_to(&mut self, until: u32, limits: &RatchetLimits, now_ms: i64) -> Result<(), CryptoError> {
        let count = until - self.recv_index;
        self.can_skip(count, limits)?;

        let their_b64 = match self.their_ratchet_public {
            Some(ref key) => b64::encode(key),
            None => return Err(CryptoError::SessionNotInitialised),
        };

        while self.recv_index < until {
            let ck = self
                .recv_chain_key
                .ok_or(CryptoError::SessionNotInitialised)?;
            let (mk, next) = kdf::chain_step(&ck)?;
            self.skipped_message_keys.insert(
                skip_key(&their_b64, self.recv_index),
                SkippedKey {
                    message_key: mk,
                    stored_at: now_ms,
                },
            );
            self.recv_chain_key = Some(next);
            self.recv_index += 1;
        }
        Ok(())
    }

    fn can_skip(&self, count: u32, limits: &RatchetLimits) -> Result<(), CryptoError> {
        if count > limits.max_skip_distance {
            return Err(CryptoError::SkipExceeded);
        }
        if self.skipped_message_keys.len() + count as usize > limits.max_skipped {
            return Err(CryptoError::SkipExceeded);
        }
        Ok(())
    }

    /// Drop skipped entries past their expiry. Runs on every decrypt.
    fn gc_skipped(&mut self, limits: &RatchetLimits, now_ms: i64) {
        let expired: Vec<String> = self
            .skipped_message_keys
            .iter()
            .filter(|(_, v)| now_ms - v.stored_at >= limits.skip_expiry_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(mut entry) = self.skipped_message_keys.remove(&key) {
                entry.message_key.zeroize();
            }
        }
    }

    fn mark_active(&mut self, now_ms: i64) {
        self.last_activity_at = now_ms;
        if self.state == SessionState::Pending {
            self.state = SessionState::Active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyPair;
    use crate::prekeys::{PreKeyBundle, SignedPrekey};
    use crate::x3dh;

    fn pair_up() -> (RatchetSession, RatchetSession) {
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
        let bob_keys = x3dh::respond(
            &bob,
            &spk,
            None,
            &alice.public().x25519,
            &start.ephemeral_public,
        )
        .unwrap();

        let session_id = RatchetSession::session_id_for("alice", "bob");
        let a = RatchetSession::initiate(
            session_id.clone(),
            "bob".into(),
            start.keys,
            &start.ephemeral,
            bundle.signed_prekey.public,
            1,
        );
        let b = RatchetSession::respond(session_id, "alice".into(), bob_keys, &spk, 1);
        (a, b)
    }

    fn limits() -> RatchetLimits {
        RatchetLimits::default()
    }

    #[test]
    fn session_id_is_order_independent() {
        assert_eq!(
            RatchetSession::session_id_for("alice", "bob"),
            RatchetSession::session_id_for("bob", "alice"),
        );
        assert_eq!(RatchetSession::session_id_for("b", "a"), "a_b");
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = pair_up();

        // Alice sends 3 messages on the X3DH chain.
        for i in 0..3u32 {
            let msg = alice.encrypt(format!("a{i}").as_bytes(), 2).unwrap();
            assert_eq!(msg.message_index, i);
            let pt = bob.decrypt(&msg, &limits(), 2).unwrap();
            assert_eq!(pt, format!("a{i}").as_bytes());
        }

        // Bob replies twice: his first send turns the ratchet onto a new
        // public, distinct from his signed prekey.
        let spk_pub = bob.our_ratchet_public();
        let reply = bob.encrypt(b"b0", 3).unwrap();
        assert_ne!(reply.sender_ratchet_key, spk_pub);
        assert_eq!(reply.message_index, 0);
        assert_eq!(reply.previous_chain_length, 0);
        assert_eq!(alice.decrypt(&reply, &limits(), 3).unwrap(), b"b0");

        let reply2 = bob.encrypt(b"b1", 3).unwrap();
        assert_eq!(alice.decrypt(&reply2, &limits(), 3).unwrap(), b"b1");

        // Another full turn back.
        let msg = alice.encrypt(b"a3", 4).unwrap();
        assert_eq!(msg.message_index, 0, "new chain after Alice's DH turn");
        assert_eq!(msg.previous_chain_length, 3);
        assert_eq!(bob.decrypt(&msg, &limits(), 4).unwrap(), b"a3");

        assert_eq!(alice.state(), SessionState::Active);
        assert_eq!(bob.state(), SessionState::Active);
    }

    #[test]
    fn out_of_order_within_chain() {
        let (mut alice, mut bob) = pair_up();

        let msgs: Vec<RatchetMessage> = (0..5)
            .map(|i| alice.encrypt(format!("m{i}").as_bytes(), 2).unwrap())
            .collect();

        for i in [2usize, 0, 4, 1, 3] {
            let pt = bob.decrypt(&msgs[i], &limits(), 2).unwrap();
            assert_eq!(pt, format!("m{i}").as_bytes());
        }
        assert_eq!(bob.receiving_index(), 5);
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn skipped_key_serves_once() {
        let (mut alice, mut bob) = pair_up();
        let m0 = alice.encrypt(b"m0", 2).unwrap();
        let m1 = alice.encrypt(b"m1", 2).unwrap();

        bob.decrypt(&m1, &limits(), 2).unwrap();
        bob.decrypt(&m0, &limits(), 2).unwrap();
        assert!(matches!(
            bob.decrypt(&m0, &limits(), 2),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn skip_distance_bound() {
        let (mut alice, mut bob) = pair_up();
        let tight = RatchetLimits {
            max_skipped: 100,
            max_skip_distance: 10,
            ..RatchetLimits::default()
        };

        let mut last = None;
        for _ in 0..12 {
            last = Some(alice.encrypt(b"x", 2).unwrap());
        }
        // Jump of 11 stored keys exceeds the per-jump distance of 10.
        assert!(matches!(
            bob.decrypt(&last.unwrap(), &tight, 2),
            Err(CryptoError::SkipExceeded)
        ));

        // Exactly the distance bound succeeds.
        let (mut alice2, mut bob2) = pair_up();
        let mut eleventh = None;
        for _ in 0..11 {
            eleventh = Some(alice2.encrypt(b"x", 2).unwrap());
        }
        bob2.decrypt(&eleventh.unwrap(), &tight, 2).unwrap();
        assert_eq!(bob2.skipped_key_count(), 10);
    }

    #[test]
    fn cumulative_skip_capacity_bound() {
        let (mut alice, mut bob) = pair_up();
        let tight = RatchetLimits {
            max_skipped: 5,
            max_skip_distance: 100,
            ..RatchetLimits::default()
        };

        let mut seventh = None;
        for _ in 0..7 {
            seventh = Some(alice.encrypt(b"x", 2).unwrap());
        }
        // Decrypting index 6 would store 6 skipped keys > capacity 5.
        assert!(matches!(
            bob.decrypt(&seventh.unwrap(), &tight, 2),
            Err(CryptoError::SkipExceeded)
        ));
        // The failed attempt must not have consumed capacity.
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn expired_skipped_keys_are_collected_on_touch() {
        let (mut alice, mut bob) = pair_up();
        let lim = limits();

        let _m0 = alice.encrypt(b"m0", 2).unwrap();
        let m1 = alice.encrypt(b"m1", 2).unwrap();
        bob.decrypt(&m1, &lim, 1_000).unwrap();
        assert_eq!(bob.skipped_key_count(), 1);

        // Next touch after the expiry window drops the stored key.
        let later = 1_000 + lim.skip_expiry_ms;
        let m2 = alice.encrypt(b"m2", 2).unwrap();
        bob.decrypt(&m2, &lim, later).unwrap();
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn late_message_after_dh_turn_uses_retired_chain_keys() {
        let (mut alice, mut bob) = pair_up();

        let m0 = alice.encrypt(b"m0", 2).unwrap();
        let m1 = alice.encrypt(b"m1", 2).unwrap();
        bob.decrypt(&m0, &limits(), 2).unwrap();

        // Bob replies; Alice turns; her next message retires Bob's view
        // of her first chain (declared length 2).
        let reply = bob.encrypt(b"r", 3).unwrap();
        alice.decrypt(&reply, &limits(), 3).unwrap();
        let m2 = alice.encrypt(b"m2", 4).unwrap();
        assert_eq!(m2.previous_chain_length, 2);
        bob.decrypt(&m2, &limits(), 4).unwrap();

        // m1 arrives late, addressed to the retired chain.
        assert_eq!(bob.decrypt(&m1, &limits(), 5).unwrap(), b"m1");

        // An index past the retired chain's declared end is rejected.
        let forged = RatchetMessage {
            sender_ratchet_key: m1.sender_ratchet_key,
            previous_chain_length: m1.previous_chain_length,
            message_index: 9,
            body: m1.body.clone(),
        };
        assert!(matches!(
            bob.decrypt(&forged, &limits(), 5),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn tampered_body_fails_generically() {
        let (mut alice, mut bob) = pair_up();
        let mut msg = alice.encrypt(b"hello", 2).unwrap();
        let last = msg.body.len() - 1;
        msg.body[last] ^= 0x01;
        assert!(matches!(
            bob.decrypt(&msg, &limits(), 2),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn json_roundtrip_preserves_state() {
        let (mut alice, mut bob) = pair_up();
        for i in 0..3 {
            let msg = alice.encrypt(format!("m{i}").as_bytes(), 2).unwrap();
            if i != 1 {
                bob.decrypt(&msg, &limits(), 2).unwrap();
            }
        }

        let json = serde_json::to_string(&bob).unwrap();
        let restored: RatchetSession = serde_json::from_str(&json).unwrap();
        assert_eq!(
            serde_json::to_value(&restored).unwrap(),
            serde_json::from_str::<serde_json::Value>(&json).unwrap(),
        );

        // The restored session keeps decrypting where the original left off.
        let mut restored = restored;
        let next = alice.encrypt(b"more", 3).unwrap();
        assert_eq!(restored.decrypt(&next, &limits(), 3).unwrap(), b"more");
    }
}
