use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame truncated")]
    Truncated,

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("unsupported wire version {0}")]
    VersionMismatch(u8),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
