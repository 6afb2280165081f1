//! Key-value errors.

use crate::consumer::ConsumerConfigError;
use crate::log::LogError;

/// Result type for key-value operations.
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors that can occur during key-value operations.
///
/// A missing key is never an error: lookups return `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("Key already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Revision mismatch for key {key}: expected {expected}")]
    RevisionMismatch { key: String, expected: u64 },

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    #[error("Invalid bucket name: {0:?}")]
    InvalidBucket(String),

    #[error("Invalid consumer configuration: {0}")]
    Consumer(#[from] ConsumerConfigError),

    #[error("Visitor failed: {0}")]
    Visit(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Log error: {0}")]
    Log(#[from] LogError),
}
