use crate::Stage;
use std::io;
use thiserror::Error;

/// A bounded field could not hold the supplied value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("{field} is {len} bytes, limit is {max}")]
    TooLong {
        field: &'static str,
        max: usize,
        len: usize,
    },
    #[error("{field} is not valid hex")]
    BadHex { field: &'static str },
    #[error("{field} must be exactly {expected} bytes, got {len}")]
    BadLength {
        field: &'static str,
        expected: usize,
        len: usize,
    },
    #[error("{field} contains control characters")]
    Control { field: &'static str },
}

/// Why a presented challenge was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("no challenge was issued to this address")]
    Missing,
    #[error("challenge expired {age_secs}s after issue")]
    Expired { age_secs: u64 },
    #[error("challenge does not match the one issued to this address")]
    Mismatch,
}

/// The session authority's message queue refused a message.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    #[error("message queue is full")]
    QueueFull,
    #[error("message queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RedirError {
    #[error("request exceeds {max} bytes")]
    RequestTooLarge { max: usize },
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unsupported method {0}")]
    Method(String),
    #[error("connection closed before a complete request")]
    Incomplete,
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Challenge(#[from] ChallengeError),
    #[error("{0:?} stage timed out")]
    Timeout(Stage),
    #[error(transparent)]
    Io(#[from] io::Error),
}
