//! Message frames.
//!
//! All integers big-endian. Layouts (byte offsets, end exclusive):
//!
//! EncryptedMessage (version 1):
//! ```text
//! [0]        type (1=whisper, 2=prekey, 3=keyconfirm)
//! [1]        version
//! [2..4]     reserved (0)
//! [4..36]    senderRatchetKey
//! [36..40]   previousChainLength
//! [40..44]   messageIndex
//! [44..48]   ciphertextLen (N)
//! [48..48+N] ciphertext (nonce || ct || tag)
//! ```
//!
//! PreKeyMessage (version 2):
//! ```text
//! [0]=2 [1]=2 [2..4]=0
//! [4..36]    senderIdentityEd25519
//! [36..68]   senderIdentityX25519
//! [68..100]  ephemeralKey
//! [100..104] signedPrekeyId
//! [104..108] oneTimePrekeyId (0 = none)
//! [108..112] innerLen
//! [112..]    inner EncryptedMessage bytes
//! ```

use echo_crypto::ratchet::RatchetMessage;

use crate::error::ProtoError;

pub const WIRE_VERSION_MESSAGE: u8 = 1;
pub const WIRE_VERSION_PREKEY: u8 = 2;

pub const TYPE_WHISPER: u8 = 1;
pub const TYPE_PREKEY: u8 = 2;
pub const TYPE_KEYCONFIRM: u8 = 3;

const MESSAGE_HEADER_LEN: usize = 48;
const PREKEY_HEADER_LEN: usize = 112;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Whisper,
    Prekey,
    KeyConfirm,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Whisper => TYPE_WHISPER,
            Self::Prekey => TYPE_PREKEY,
            Self::KeyConfirm => TYPE_KEYCONFIRM,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            TYPE_WHISPER => Ok(Self::Whisper),
            TYPE_PREKEY => Ok(Self::Prekey),
            TYPE_KEYCONFIRM => Ok(Self::KeyConfirm),
            other => Err(ProtoError::UnknownType(other)),
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

// ── EncryptedMessage ─────────────────────────────────────────────────────────

/// One framed ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub msg_type: MessageType,
    pub message: RatchetMessage,
}

impl EncryptedMessage {
    pub fn whisper(message: RatchetMessage) -> Self {
        Self {
            msg_type: MessageType::Whisper,
            message,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let body = &self.message.body;
        let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + body.len());
        out.push(self.msg_type.as_u8());
        out.push(WIRE_VERSION_MESSAGE);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.message.sender_ratchet_key);
        out.extend_from_slice(&self.message.previous_chain_length.to_be_bytes());
        out.extend_from_slice(&self.message.message_index.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(ProtoError::Truncated);
        }
        let msg_type = MessageType::from_u8(data[0])?;
        if data[1] != WIRE_VERSION_MESSAGE {
            return Err(ProtoError::VersionMismatch(data[1]));
        }
        let mut sender_ratchet_key = [0u8; 32];
        sender_ratchet_key.copy_from_slice(&data[4..36]);
        let previous_chain_length = read_u32(data, 36);
        let message_index = read_u32(data, 40);
        let body_len = read_u32(data, 44) as usize;
        if data.len() != MESSAGE_HEADER_LEN + body_len {
            return Err(ProtoError::Malformed("ciphertext length mismatch"));
        }
        Ok(Self {
            msg_type,
            message: RatchetMessage {
                sender_ratchet_key,
                previous_chain_length,
                message_index,
                body: data[MESSAGE_HEADER_LEN..].to_vec(),
            },
        })
    }
}

// ── PreKeyMessage ────────────────────────────────────────────────────────────

/// First-contact frame carrying the X3DH init material plus the inner
/// encrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    pub sender_identity_ed25519: [u8; 32],
    pub sender_identity_x25519: [u8; 32],
    pub ephemeral_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub inner: EncryptedMessage,
}

impl PreKeyMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let inner = self.inner.to_bytes();
        let mut out = Vec::with_capacity(PREKEY_HEADER_LEN + inner.len());
        out.push(TYPE_PREKEY);
        out.push(WIRE_VERSION_PREKEY);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.sender_identity_ed25519);
        out.extend_from_slice(&self.sender_identity_x25519);
        out.extend_from_slice(&self.ephemeral_key);
        out.extend_from_slice(&self.signed_prekey_id.to_be_bytes());
        out.extend_from_slice(&self.one_time_prekey_id.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        out.extend_from_slice(&inner);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() < PREKEY_HEADER_LEN {
            return Err(ProtoError::Truncated);
        }
        if data[0] != TYPE_PREKEY {
            return Err(ProtoError::UnknownType(data[0]));
        }
        if data[1] != WIRE_VERSION_PREKEY {
            return Err(ProtoError::VersionMismatch(data[1]));
        }
        let mut sender_identity_ed25519 = [0u8; 32];
        sender_identity_ed25519.copy_from_slice(&data[4..36]);
        let mut sender_identity_x25519 = [0u8; 32];
        sender_identity_x25519.copy_from_slice(&data[36..68]);
        let mut ephemeral_key = [0u8; 32];
        ephemeral_key.copy_from_slice(&data[68..100]);
        let signed_prekey_id = read_u32(data, 100);
        let one_time_prekey_id = match read_u32(data, 104) {
            0 => None,
            id => Some(id),
        };
        let inner_len = read_u32(data, 108) as usize;
        if data.len() != PREKEY_HEADER_LEN + inner_len {
            return Err(ProtoError::Malformed("inner length mismatch"));
        }
        let inner = EncryptedMessage::from_bytes(&data[PREKEY_HEADER_LEN..])?;
        Ok(Self {
            sender_identity_ed25519,
            sender_identity_x25519,
            ephemeral_key,
            signed_prekey_id,
            one_time_prekey_id,
            inner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> EncryptedMessage {
        EncryptedMessage {
            msg_type: MessageType::Whisper,
            message: RatchetMessage {
                sender_ratchet_key: [0xAB; 32],
                previous_chain_length: 3,
                message_index: 17,
                body: vec![1, 2, 3, 4, 5],
            },
        }
    }

    #[test]
    fn message_roundtrip() {
        let msg = sample_message();
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], TYPE_WHISPER);
        assert_eq!(bytes[1], WIRE_VERSION_MESSAGE);
        assert_eq!(EncryptedMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn message_rejects_unknown_version_and_type() {
        let mut bytes = sample_message().to_bytes();
        bytes[1] = 9;
        assert!(matches!(
            EncryptedMessage::from_bytes(&bytes),
            Err(ProtoError::VersionMismatch(9))
        ));

        let mut bytes = sample_message().to_bytes();
        bytes[0] = 200;
        assert!(matches!(
            EncryptedMessage::from_bytes(&bytes),
            Err(ProtoError::UnknownType(200))
        ));
    }

    #[test]
    fn message_rejects_bad_lengths() {
        let bytes = sample_message().to_bytes();
        assert!(matches!(
            EncryptedMessage::from_bytes(&bytes[..40]),
            Err(ProtoError::Truncated)
        ));
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(
            EncryptedMessage::from_bytes(&longer),
            Err(ProtoError::Malformed(_))
        ));
    }

    fn sample_prekey(one_time_prekey_id: Option<u32>) -> PreKeyMessage {
        PreKeyMessage {
            sender_identity_ed25519: [1; 32],
            sender_identity_x25519: [2; 32],
            ephemeral_key: [3; 32],
            signed_prekey_id: 4,
            one_time_prekey_id,
            inner: sample_message(),
        }
    }

    #[test]
    fn prekey_roundtrip_with_and_without_otp() {
        for otp in [Some(7), None] {
            let msg = sample_prekey(otp);
            let bytes = msg.to_bytes();
            assert_eq!(bytes[0], TYPE_PREKEY);
            assert_eq!(bytes[1], WIRE_VERSION_PREKEY);
            assert_eq!(PreKeyMessage::from_bytes(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn prekey_otp_absence_is_zero_on_wire() {
        let bytes = sample_prekey(None).to_bytes();
        assert_eq!(&bytes[104..108], &[0, 0, 0, 0]);
    }

    #[test]
    fn prekey_rejects_whisper_tag() {
        let mut bytes = sample_prekey(Some(7)).to_bytes();
        bytes[0] = TYPE_WHISPER;
        assert!(matches!(
            PreKeyMessage::from_bytes(&bytes),
            Err(ProtoError::UnknownType(_))
        ));
    }
}
