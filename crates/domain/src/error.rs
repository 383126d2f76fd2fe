/// Shared error type used across all AgentRelay crates.
///
/// Variants map onto the relay's recovery policies: validation, not-found and
/// conflict surface directly to HTTP callers; provisioning and channel
/// failures mark the session `error`; journal failures are data-integrity
/// failures and detach the hub.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("sandbox provisioning: {0}")]
    Provisioning(String),

    #[error("sandbox channel: {0}")]
    Channel(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("encryption key version {0} unavailable")]
    KeyUnavailable(u32),

    #[error("ciphertext authentication failed")]
    AuthFailure,

    #[error("journal: {0}")]
    Journal(String),

    #[error("store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
