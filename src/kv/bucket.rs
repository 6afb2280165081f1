//! Bucket naming and configuration.
//!
//! A bucket `b` is backed by stream `KV_b`; key `k` is stored under subject
//! `$KV.b.k`.

use std::time::Duration;

use serde::Deserialize;

use super::{KvError, Result};
use crate::log::{StorageType, StreamConfig};

/// Stream name prefix for buckets.
pub const STREAM_PREFIX: &str = "KV_";

/// Subject prefix for bucket keys.
pub const SUBJECT_PREFIX: &str = "$KV.";

/// Largest history a bucket can keep per key.
pub const MAX_HISTORY: i64 = 64;

/// Bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KvBucketConfig {
    /// Bucket name.
    pub name: String,
    /// Revisions kept per key (1..=64).
    pub history: i64,
    /// Entry time-to-live in seconds (0 = forever).
    pub ttl_secs: u64,
    /// Largest accepted value in bytes (-1 = unlimited).
    pub max_value_size: i32,
    /// Stream replicas.
    pub replicas: usize,
    /// Storage backend.
    pub storage: StorageType,
}

impl Default for KvBucketConfig {
    fn default() -> Self {
        Self {
            name: "kvstream".to_string(),
            history: 1,
            ttl_secs: 0,
            max_value_size: -1,
            replicas: 1,
            storage: StorageType::File,
        }
    }
}

impl KvBucketConfig {
    /// Default configuration for bucket `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: i64) -> Self {
        self.history = history;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Stream configuration backing this bucket.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: stream_name(&self.name),
            subjects: vec![format!("{}{}.>", SUBJECT_PREFIX, self.name)],
            max_messages_per_subject: self.history.clamp(1, MAX_HISTORY),
            max_age: self.ttl(),
            max_message_size: self.max_value_size,
            storage: self.storage,
            replicas: self.replicas.max(1),
            allow_rollup: true,
            deny_delete: true,
            allow_direct: true,
            discard_new: true,
        }
    }

    /// Check the name and limits.
    pub fn validate(&self) -> Result<()> {
        validate_bucket_name(&self.name)?;
        if !(1..=MAX_HISTORY).contains(&self.history) {
            return Err(KvError::InvalidBucket(format!(
                "{}: history must be between 1 and {}",
                self.name, MAX_HISTORY
            )));
        }
        Ok(())
    }
}

/// Stream name backing bucket `bucket`.
pub fn stream_name(bucket: &str) -> String {
    format!("{}{}", STREAM_PREFIX, bucket)
}

/// Subject prefix (with trailing dot) for keys of bucket `bucket`.
pub fn key_subject_prefix(bucket: &str) -> String {
    format!("{}{}.", SUBJECT_PREFIX, bucket)
}

/// Bucket names use `[A-Za-z0-9_-]` only.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(KvError::InvalidBucket(name.to_string()))
    }
}

/// Keys use `[A-Za-z0-9-_/=.]` and may not start or end with a dot.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && !key.ends_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '=' | '.'));
    if valid {
        Ok(())
    } else {
        Err(KvError::InvalidKey(key.to_string()))
    }
}
