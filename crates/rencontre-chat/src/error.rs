use thiserror::Error;

use rencontre_shared::constants::MAX_MESSAGE_CHARS;

/// Errors produced by the chat engine.
///
/// Validation variants are reported back to the offending client verbatim;
/// everything else is an internal condition the caller logs.
#[derive(Error, Debug)]
pub enum ChatError {
    /// The client-supplied message id is not a UUID.
    #[error("Invalid message id: {0}")]
    InvalidMessageId(String),

    /// Message text is empty or whitespace-only.
    #[error("Message text must not be empty")]
    EmptyMessage,

    /// Message text exceeds the protocol limit.
    #[error("Message text exceeds {MAX_MESSAGE_CHARS} characters")]
    MessageTooLong,

    /// The command referenced a connection the registry no longer knows.
    #[error("Connection is not registered")]
    UnknownConnection,

    /// The ingestion pipeline has stopped accepting work.
    #[error("Service is shutting down")]
    ShuttingDown,

    /// Store layer failure.
    #[error("Store error: {0}")]
    Store(#[from] rencontre_store::StoreError),

    /// A background task failed to run to completion.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;
