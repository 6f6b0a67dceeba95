//! X3DH asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Alice (initiator) fetches Bob's published bundle and generates ONE
//! ephemeral X25519 keypair EK_A:
//!
//!   DH1 = DH(IK_A, SPK_B)   — mutual authentication
//!   DH2 = DH(EK_A, IK_B)    — forward secrecy
//!   DH3 = DH(EK_A, SPK_B)   — replay protection
//!   DH4 = DH(EK_A, OPK_B)   — one-time forward secrecy [optional]
//!
//!   ad  = "EchoAAD-v1" || sorted_bytewise(IK_A_x, IK_B_x)
//!   okm = HKDF-SHA256(salt=ad, ikm=DH1||DH2||DH3[||DH4],
//!                     info="EchoProtocol-X3DH-v1", L=64)
//!   root_key = okm[0..32], chain_key = okm[32..64]
//!
//! Bob reconstructs the same DH set from his side. The sorted-key rule
//! makes `ad` identical for both parties. The initiator keeps EK_A as
//! the session's first ratchet keypair.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::kdf;
use crate::prekeys::{OneTimePrekey, PreKeyBundle, SignedPrekey};

pub const INFO_X3DH: &[u8] = b"EchoProtocol-X3DH-v1";
pub const AAD_TAG: &[u8] = b"EchoAAD-v1";

// ── Output ───────────────────────────────────────────────────────────────────

/// Shared session secrets both parties arrive at.
pub struct SessionKeys {
    pub root_key: [u8; 32],
    pub chain_key: [u8; 32],
    /// Associated data binding the sorted identity pair and protocol tag.
    pub ad: Vec<u8>,
}

/// Initiator-side outcome: session keys plus the material the first
/// message must carry.
pub struct InitiatorStart {
    pub keys: SessionKeys,
    /// The ephemeral secret doubles as the session's first ratchet key.
    pub ephemeral: StaticSecret,
    pub ephemeral_public: [u8; 32],
    /// Id of the one-time prekey consumed from the bundle, if any.
    pub used_one_time_prekey: Option<u32>,
}

/// Associated data: protocol tag followed by the two X25519 identity
/// publics in bytewise-sorted order. Symmetric for both parties.
pub fn associated_data(ours_x25519: &[u8; 32], theirs_x25519: &[u8; 32]) -> Vec<u8> {
    let (first, second) = if ours_x25519 <= theirs_x25519 {
        (ours_x25519, theirs_x25519)
    } else {
        (theirs_x25519, ours_x25519)
    };
    let mut ad = Vec::with_capacity(AAD_TAG.len() + 64);
    ad.extend_from_slice(AAD_TAG);
    ad.extend_from_slice(first);
    ad.extend_from_slice(second);
    ad
}

fn derive_session_keys(dh_concat: &[u8], ad: Vec<u8>) -> Result<SessionKeys, CryptoError> {
    let mut okm = [0u8; 64];
    kdf::hkdf_expand(dh_concat, Some(&ad), INFO_X3DH, &mut okm)?;
    let mut root_key = [0u8; 32];
    let mut chain_key = [0u8; 32];
    root_key.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok(SessionKeys {
        root_key,
        chain_key,
        ad,
    })
}

// ── Initiator (Alice) ────────────────────────────────────────────────────────

/// Alice initiates a session with Bob's bundle.
///
/// The bundle is validated (expiry + signed prekey signature) before any
/// DH is computed; all DH outputs are wiped after derivation.
pub fn initiate(
    our_identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
    now_ms: i64,
) -> Result<InitiatorStart, CryptoError> {
    bundle.validate(now_ms)?;

    let spk_b = X25519Public::from(bundle.signed_prekey.public);
    let ik_b_x = X25519Public::from(bundle.identity.x25519);

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral).to_bytes();

    let dh1 = our_identity.x25519_secret().diffie_hellman(&spk_b);
    let dh2 = ephemeral.diffie_hellman(&ik_b_x);
    let dh3 = ephemeral.diffie_hellman(&spk_b);

    let mut dh_concat = Vec::with_capacity(128);
    dh_concat.extend_from_slice(dh1.as_bytes());
    dh_concat.extend_from_slice(dh2.as_bytes());
    dh_concat.extend_from_slice(dh3.as_bytes());

    let mut used_one_time_prekey = None;
    if let Some(ref opk) = bundle.one_time_prekey {
        let dh4 = ephemeral.diffie_hellman(&X25519Public::from(opk.public));
        dh_concat.extend_from_slice(dh4.as_bytes());
        used_one_time_prekey = Some(opk.id);
    }

    let ad = associated_data(&our_identity.public().x25519, &bundle.identity.x25519);
    let keys = derive_session_keys(&dh_concat, ad)?;
    dh_concat.zeroize();

    Ok(InitiatorStart {
        keys,
        ephemeral,
        ephemeral_public,
        used_one_time_prekey,
    })
}

// ── Responder (Bob) ──────────────────────────────────────────────────────────

/// Bob reconstructs the session keys from the initiator's first message.
///
/// `one_time_prekey` — the consumed OPK, when the init referenced one
/// and it is still resolvable. A missing OPK falls back to the 3-DH
/// variant; if the initiator actually performed 4-DH, the inner message
/// simply fails to decrypt.
pub fn respond(
    our_identity: &IdentityKeyPair,
    signed_prekey: &SignedPrekey,
    one_time_prekey: Option<&OneTimePrekey>,
    their_identity_x25519: &[u8; 32],
    their_ephemeral: &[u8; 32],
) -> Result<SessionKeys, CryptoError> {
    let ik_a_x = X25519Public::from(*their_identity_x25519);
    let ek_a = X25519Public::from(*their_ephemeral);

    // Mirror the initiator's DH order exactly:
    //   DH1 = IK_A × SPK_B → SPK_B × IK_A (commutative)
    //   DH2 = EK_A × IK_B  → IK_B × EK_A
    //   DH3 = EK_A × SPK_B → SPK_B × EK_A
    let dh1 = signed_prekey.secret().diffie_hellman(&ik_a_x);
    let dh2 = our_identity.x25519_secret().diffie_hellman(&ek_a);
    let dh3 = signed_prekey.secret().diffie_hellman(&ek_a);

    let mut dh_concat = Vec::with_capacity(128);
    dh_concat.extend_from_slice(dh1.as_bytes());
    dh_concat.extend_from_slice(dh2.as_bytes());
    dh_concat.extend_from_slice(dh3.as_bytes());

    if let Some(opk) = one_time_prekey {
        let dh4 = opk.secret().diffie_hellman(&ek_a);
        dh_concat.extend_from_slice(dh4.as_bytes());
    }

    let ad = associated_data(&our_identity.public().x25519, their_identity_x25519);
    let keys = derive_session_keys(&dh_concat, ad)?;
    dh_concat.zeroize();

    Ok(keys)
}
