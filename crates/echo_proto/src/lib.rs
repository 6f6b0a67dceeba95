//! echo_proto — Wire types and serialisation for the Echo Protocol
//!
//! Binary frames are hand-written big-endian codecs with exact layouts;
//! JSON envelopes (serde, base64url fields) cover inter-tier transport
//! where binary framing is unavailable.
//!
//! # Modules
//! - `message`  — EncryptedMessage / PreKeyMessage frames
//! - `keys`     — codecs for key publics and prekey bundles
//! - `envelope` — JSON transport forms (sealed envelope, bundle)
//! - `error`    — codec error type

pub mod envelope;
pub mod error;
pub mod keys;
pub mod message;

pub use error::ProtoError;
pub use message::{EncryptedMessage, MessageType, PreKeyMessage};
