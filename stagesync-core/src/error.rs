use stagesync_proto::ClientId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("identity conflict: client {0} already has an active registration")]
    IdentityConflict(ClientId),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid resume token for client {0}")]
    InvalidResumeToken(ClientId),

    #[error("client {0} is not clock-synchronized")]
    UnsynchronizedClient(ClientId),

    #[error("deadline unreachable: hint {hint_ms}ms is earlier than required {required_ms}ms")]
    DeadlineUnreachable { required_ms: i64, hint_ms: i64 },

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
