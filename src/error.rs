use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Dotted share path deeper than two levels, or with an empty segment.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),
    #[error("handler {handler} panicked: {message}")]
    HandlerPanic { handler: String, message: String },
    #[error("snapshot overrun: expected {expected} items, dropped extra item")]
    SnapshotOverrun { expected: usize },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("mailbox already registered: {0}")]
    DuplicateMailbox(String),
    #[error("unknown mailbox: {0}")]
    UnknownMailbox(String),
    #[error("scheduler already running")]
    AlreadyRunning,
    #[error("bus error: {0}")]
    Bus(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
