//! Append-only, subject-addressed message log.
//!
//! This module contains:
//! - `MessageLog` trait: point reads, conditional appends and push subscriptions
//! - `PushSubscription` trait: an open replay cursor over one subject
//! - Log value types (`LogMessage`, `StreamConfig`, `StreamInfo`, ...)
//! - Implementations: NATS JetStream, in-memory mock

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::consumer::PushSubscribeOptions;

pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

pub use mock::MockLog;
#[cfg(feature = "nats")]
pub use nats::NatsLog;

/// Header carrying the expected last sequence of a subject.
pub const EXPECTED_LAST_SUBJECT_SEQUENCE_HEADER: &str = "Nats-Expected-Last-Subject-Sequence";

/// Header requesting a rollup of prior messages.
pub const ROLLUP_HEADER: &str = "Nats-Rollup";

/// Rollup scope: all prior messages on the same subject.
pub const ROLLUP_SUBJECT: &str = "sub";

/// JetStream API error code for "no message found".
pub const NO_MESSAGE_FOUND_CODE: u16 = 10037;

/// JetStream API error code for "stream not found".
pub const STREAM_NOT_FOUND_CODE: u16 = 10059;

/// JetStream API error code for "wrong last sequence".
pub const WRONG_LAST_SEQUENCE_CODE: u16 = 10071;

// ============================================================================
// Errors
// ============================================================================

/// Result type for log operations.
pub type Result<T> = std::result::Result<T, LogError>;

/// Errors reported by the log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("no message found")]
    NoMessageFound,

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("wrong last sequence: expected {expected}")]
    WrongLastSequence { expected: u64 },

    #[error("JetStream API error {code}: {description}")]
    Api { code: u16, description: String },

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl LogError {
    /// Map a JetStream API error code onto the matching variant.
    pub fn from_api(code: u16, description: impl Into<String>, expected: Option<u64>) -> Self {
        let description = description.into();
        match code {
            NO_MESSAGE_FOUND_CODE => LogError::NoMessageFound,
            STREAM_NOT_FOUND_CODE => LogError::StreamNotFound(description),
            WRONG_LAST_SEQUENCE_CODE => LogError::WrongLastSequence {
                expected: expected.unwrap_or_default(),
            },
            _ => LogError::Api { code, description },
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Message headers, keyed by header name.
pub type Headers = BTreeMap<String, String>;

/// A message as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Subject the message was published under.
    pub subject: String,
    /// Stream sequence assigned on append.
    pub sequence: u64,
    /// Headers stored with the message. Backends may keep only the headers
    /// the key-value layer interprets.
    pub headers: Headers,
    /// Opaque payload.
    pub payload: Bytes,
    /// Time the log stored the message.
    pub time: DateTime<Utc>,
    /// Messages still pending for the consumer at delivery time (0 for point reads).
    pub pending: u64,
}

impl LogMessage {
    /// Look up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Precondition attached to an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Append unconditionally.
    None,
    /// Append only if the subject has no stored message.
    NoPriorMessage,
    /// Append only if the subject's last sequence equals the value.
    LastSubjectSequence(u64),
}

impl Expectation {
    /// Expected last subject sequence, if the append is conditional.
    pub fn expected_sequence(&self) -> Option<u64> {
        match self {
            Expectation::None => None,
            Expectation::NoPriorMessage => Some(0),
            Expectation::LastSubjectSequence(seq) => Some(*seq),
        }
    }
}

/// Acknowledgement of a stored append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

// ============================================================================
// Streams
// ============================================================================

/// Storage backend for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Configuration used when creating a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    /// Messages kept per subject (-1 = unlimited).
    pub max_messages_per_subject: i64,
    /// Zero means messages never expire.
    pub max_age: Duration,
    /// Largest accepted payload (-1 = unlimited).
    pub max_message_size: i32,
    pub storage: StorageType,
    pub replicas: usize,
    pub allow_rollup: bool,
    pub deny_delete: bool,
    pub allow_direct: bool,
    /// Reject new messages instead of dropping old ones when limits are hit.
    pub discard_new: bool,
}

/// Point-in-time view of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub max_messages_per_subject: i64,
    pub max_age: Duration,
    pub replicas: usize,
}

// ============================================================================
// Traits
// ============================================================================

/// An open push subscription over one subject.
///
/// Owned by a single reader for its lifetime. Callers must `unsubscribe`
/// before dropping it.
#[async_trait]
pub trait PushSubscription: Send {
    /// Messages the server reported as pending when the subscription opened.
    fn pending(&self) -> u64;

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<LogMessage>>;

    /// Release the subscription and any server-side consumer behind it.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Capabilities of the append-only log.
///
/// Implementations:
/// - `NatsLog`: NATS JetStream
/// - `MockLog`: In-memory log for testing
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Most recent message stored under `subject` in `stream`.
    async fn get_last_message(&self, stream: &str, subject: &str) -> Result<LogMessage>;

    /// Message stored at `sequence` in `stream`.
    async fn get_message(&self, stream: &str, sequence: u64) -> Result<LogMessage>;

    /// Append a message, enforcing `expectation` atomically at the log.
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
        expectation: Expectation,
    ) -> Result<PublishAck>;

    /// Open a push subscription filtered to `subject`.
    async fn push_subscribe(
        &self,
        subject: &str,
        options: PushSubscribeOptions,
    ) -> Result<Box<dyn PushSubscription>>;

    /// Current stream state.
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo>;

    /// Create the stream unless it already exists.
    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamInfo>;
}

/// Whether `subject` falls under a subscription `filter` (`*` and `>` wildcards).
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
