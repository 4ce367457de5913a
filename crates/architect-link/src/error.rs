//! Link error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// Read or write failure on the underlying transport. Terminal for the link.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A frame that parsed as JSON but is not a valid envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("link closed")]
    Closed,

    #[error("ref {0} is already pending")]
    DuplicateRef(u64),

    /// The peer answered with an error reply.
    #[error("rejected: {message}")]
    Rejected { message: String },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),
}

pub type LinkResult<T> = std::result::Result<T, LinkError>;
