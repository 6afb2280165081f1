//! Revisioned key-value buckets.
//!
//! This module contains:
//! - `KeyValue` trait: the bucket contract
//! - `LogKeyValue`: implementation over any `MessageLog`
//! - Entry, status and bucket configuration types
//!
//! Every write is an append to the bucket's stream. A key's revision is the
//! stream sequence of its latest message, and compare-and-set writes are
//! enforced by the log, not by this client.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::log::{LogMessage, StreamInfo};
use crate::utils::cancel::{run_until_cancelled, CancelSignal};

mod bucket;
mod error;
mod store;

pub use bucket::{
    key_subject_prefix, stream_name, validate_bucket_name, validate_key, KvBucketConfig,
    MAX_HISTORY,
};
pub use error::{KvError, Result};
pub use store::LogKeyValue;

/// Header marking the operation an entry records.
pub const OPERATION_HEADER: &str = "KV-Operation";

/// Operation header value for deletes.
pub const OPERATION_DELETE: &str = "DEL";

/// Operation header value for purges.
pub const OPERATION_PURGE: &str = "PURGE";

/// Operation recorded by an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KvOperation {
    #[default]
    Put,
    Delete,
    Purge,
}

impl KvOperation {
    /// Decode the operation header; anything unrecognised is a put.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(OPERATION_DELETE) => KvOperation::Delete,
            Some(OPERATION_PURGE) => KvOperation::Purge,
            _ => KvOperation::Put,
        }
    }

    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            KvOperation::Put => None,
            KvOperation::Delete => Some(OPERATION_DELETE),
            KvOperation::Purge => Some(OPERATION_PURGE),
        }
    }

    /// Delete and purge entries end a key's visible life.
    pub fn is_tombstone(&self) -> bool {
        !matches!(self, KvOperation::Put)
    }
}

/// One revision of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub bucket: String,
    pub key: String,
    pub value: Bytes,
    /// Stream sequence of the entry.
    pub revision: u64,
    /// Entries still pending behind this one during replay (0 for point reads).
    pub delta: u64,
    pub created: DateTime<Utc>,
    pub operation: KvOperation,
}

impl KvEntry {
    /// Decode a log message stored in `bucket`.
    ///
    /// Returns `None` when the subject does not belong to the bucket.
    pub fn from_message(bucket: &str, message: LogMessage) -> Option<Self> {
        let key = message
            .subject
            .strip_prefix(&key_subject_prefix(bucket))?
            .to_string();
        let operation = KvOperation::from_header(message.header(OPERATION_HEADER));

        Some(Self {
            bucket: bucket.to_string(),
            key,
            value: message.payload,
            revision: message.sequence,
            delta: message.pending,
            created: message.time,
            operation,
        })
    }
}

/// Bucket status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvStatus {
    pub bucket: String,
    /// Messages held by the bucket's stream, tombstones included.
    pub values: u64,
    /// Revisions kept per key.
    pub history: i64,
    /// Entry time-to-live (zero = forever).
    pub ttl: Duration,
    /// Backing stream state.
    pub stream_info: StreamInfo,
}

/// Interface for a revisioned key-value bucket.
///
/// Implementations:
/// - `LogKeyValue`: any `MessageLog` (NATS JetStream, in-memory mock)
#[async_trait]
pub trait KeyValue: Send + Sync {
    /// Name of the bucket.
    fn bucket_name(&self) -> &str;

    /// Current entry for `key`, or `None` if it was never written or its
    /// last operation was a delete or purge.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Entry for `key` at `revision`, with the same live-only rule as `get`.
    ///
    /// Returns `None` when the revision belongs to a different key.
    async fn get_revision(&self, key: &str, revision: u64) -> Result<Option<KvEntry>>;

    /// Latest entry for `key`, tombstones included.
    async fn entry(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Entry for `key` at `revision`, tombstones included.
    async fn entry_at_revision(&self, key: &str, revision: u64) -> Result<Option<KvEntry>>;

    /// Store `value` unconditionally. Returns the new revision.
    async fn put(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Store `value` only if `key` has no live entry. Returns the new revision.
    async fn create(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Store `value` only if the latest revision of `key` is `expected_revision`.
    async fn update(&self, key: &str, value: Bytes, expected_revision: u64) -> Result<u64>;

    /// Place a delete marker. History is kept.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Place a purge marker and drop all earlier history of `key`.
    async fn purge(&self, key: &str) -> Result<()>;

    /// Bucket status.
    async fn status(&self) -> Result<KvStatus>;
}

/// Run a key-value operation until it completes or `signal` fires.
pub async fn cancellable<T, F>(signal: &mut CancelSignal, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    run_until_cancelled(signal, operation)
        .await
        .unwrap_or(Err(KvError::Cancelled))
}
