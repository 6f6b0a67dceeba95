use thiserror::Error;

use echo_crypto::CryptoError;
use echo_proto::ProtoError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no identity keys in storage")]
    KeysAbsent,

    #[error("no session with peer")]
    NoSession,

    #[error("unknown signed prekey id {0}")]
    InvalidPrekeyRef(u32),

    #[error("unsupported session record version {0}")]
    VersionMismatch(u32),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("replay rejected")]
    ReplayRejected,

    #[error("sequence rejected")]
    SequenceRejected,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Proto(#[from] ProtoError),
}
