//! JSON transport forms.
//!
//! Where binary framing is unavailable (cloud functions, web tiers) the
//! sealed envelope and prekey bundle travel as JSON with base64url
//! fields and millisecond-epoch timestamps.

use echo_crypto::prekeys::PreKeyBundle;
use echo_crypto::sealed::SealedEnvelope;

use crate::error::ProtoError;

pub fn sealed_to_json(envelope: &SealedEnvelope) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(envelope)?)
}

pub fn sealed_from_json(json: &str) -> Result<SealedEnvelope, ProtoError> {
    Ok(serde_json::from_str(json)?)
}

pub fn bundle_to_json(bundle: &PreKeyBundle) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(bundle)?)
}

pub fn bundle_from_json(json: &str) -> Result<PreKeyBundle, ProtoError> {
    Ok(serde_json::from_str(json)?)
}
