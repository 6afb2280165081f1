//! Key-value bucket over a message log.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use super::{
    key_subject_prefix, stream_name, validate_bucket_name, validate_key, KeyValue,
    KvBucketConfig, KvEntry, KvError, KvOperation, KvStatus, Result, OPERATION_HEADER,
};
use crate::feature::{FeatureOptions, LogPointReader, ReplayDrainer};
use crate::log::{
    Expectation, Headers, LogError, LogMessage, MessageLog, ROLLUP_HEADER, ROLLUP_SUBJECT,
};

/// Revisioned bucket backed by one stream of a [`MessageLog`].
///
/// Holds no state beyond the binding: every read goes to the log.
pub struct LogKeyValue {
    log: Arc<dyn MessageLog>,
    bucket: String,
    key_prefix: String,
    reader: LogPointReader,
    drainer: ReplayDrainer,
}

impl LogKeyValue {
    /// Bind to an existing bucket.
    pub async fn bind(
        log: Arc<dyn MessageLog>,
        bucket: &str,
        options: FeatureOptions,
    ) -> Result<Self> {
        validate_bucket_name(bucket)?;
        let stream = stream_name(bucket);

        match log.stream_info(&stream).await {
            Ok(_) => {}
            Err(LogError::StreamNotFound(_)) => {
                return Err(KvError::BucketNotFound(bucket.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        info!(bucket = %bucket, stream = %stream, "Bound key-value bucket");

        Ok(Self {
            reader: LogPointReader::new(log.clone(), stream.clone()),
            drainer: ReplayDrainer::new(log.clone(), stream, options),
            key_prefix: key_subject_prefix(bucket),
            bucket: bucket.to_string(),
            log,
        })
    }

    /// Create the bucket's stream if needed, then bind to it.
    pub async fn create_bucket(
        log: Arc<dyn MessageLog>,
        config: &KvBucketConfig,
        options: FeatureOptions,
    ) -> Result<Self> {
        config.validate()?;
        let stream = log.ensure_stream(config.stream_config()).await?;
        debug!(
            bucket = %config.name,
            stream = %stream.name,
            history = config.history,
            "Ensured bucket stream"
        );
        Self::bind(log, &config.name, options).await
    }

    /// Drainer bound to this bucket's stream, for replaying key history.
    pub fn drainer(&self) -> &ReplayDrainer {
        &self.drainer
    }

    fn subject(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.key_prefix, key))
    }

    /// Log failures as seen by bucket callers: a missing stream is a missing bucket.
    fn log_error(&self, error: LogError) -> KvError {
        match error {
            LogError::StreamNotFound(_) => KvError::BucketNotFound(self.bucket.clone()),
            e => KvError::Log(e),
        }
    }

    fn decode(&self, message: LogMessage) -> Option<KvEntry> {
        KvEntry::from_message(&self.bucket, message)
    }

    async fn append(
        &self,
        subject: &str,
        headers: Headers,
        value: Bytes,
        expectation: Expectation,
    ) -> std::result::Result<u64, LogError> {
        let ack = self
            .log
            .publish(subject, headers, value, expectation)
            .await?;
        Ok(ack.sequence)
    }

    async fn marker(&self, key: &str, operation: KvOperation) -> Result<u64> {
        let subject = self.subject(key)?;
        let mut headers = Headers::new();
        if let Some(value) = operation.header_value() {
            headers.insert(OPERATION_HEADER.to_string(), value.to_string());
        }
        if operation == KvOperation::Purge {
            headers.insert(ROLLUP_HEADER.to_string(), ROLLUP_SUBJECT.to_string());
        }

        let revision = self
            .append(&subject, headers, Bytes::new(), Expectation::None)
            .await
            .map_err(|e| self.log_error(e))?;
        debug!(bucket = %self.bucket, key = %key, revision, ?operation, "Wrote marker");
        Ok(revision)
    }
}

fn live(entry: Option<KvEntry>) -> Option<KvEntry> {
    entry.filter(|e| !e.operation.is_tombstone())
}

#[async_trait]
impl KeyValue for LogKeyValue {
    fn bucket_name(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        Ok(live(self.entry(key).await?))
    }

    async fn get_revision(&self, key: &str, revision: u64) -> Result<Option<KvEntry>> {
        Ok(live(self.entry_at_revision(key, revision).await?))
    }

    async fn entry(&self, key: &str) -> Result<Option<KvEntry>> {
        let subject = self.subject(key)?;
        let message = self
            .reader
            .get_last(&subject)
            .await
            .map_err(|e| self.log_error(e))?;
        Ok(message.and_then(|m| self.decode(m)))
    }

    async fn entry_at_revision(&self, key: &str, revision: u64) -> Result<Option<KvEntry>> {
        let subject = self.subject(key)?;
        // Sequences start at 1
        if revision == 0 {
            return Ok(None);
        }
        let Some(message) = self
            .reader
            .get_by_sequence(revision)
            .await
            .map_err(|e| self.log_error(e))?
        else {
            return Ok(None);
        };
        if message.subject != subject {
            debug!(
                bucket = %self.bucket,
                key = %key,
                revision,
                found = %message.subject,
                "Revision belongs to another key"
            );
            return Ok(None);
        }
        Ok(self.decode(message))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        let subject = self.subject(key)?;
        let revision = self
            .append(&subject, Headers::new(), value, Expectation::None)
            .await
            .map_err(|e| self.log_error(e))?;
        debug!(bucket = %self.bucket, key = %key, revision, "Put");
        Ok(revision)
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        let subject = self.subject(key)?;
        match self
            .append(&subject, Headers::new(), value.clone(), Expectation::NoPriorMessage)
            .await
        {
            Ok(revision) => {
                debug!(bucket = %self.bucket, key = %key, revision, "Created");
                return Ok(revision);
            }
            Err(LogError::WrongLastSequence { .. }) => {}
            Err(e) => return Err(self.log_error(e)),
        }

        // The subject has history: a tombstone may be replaced
        let already_exists = || KvError::AlreadyExists {
            key: key.to_string(),
        };
        match self.entry(key).await? {
            Some(current) if current.operation.is_tombstone() => {
                match self.update(key, value, current.revision).await {
                    Err(KvError::RevisionMismatch { .. }) => Err(already_exists()),
                    result => result,
                }
            }
            _ => Err(already_exists()),
        }
    }

    async fn update(&self, key: &str, value: Bytes, expected_revision: u64) -> Result<u64> {
        let subject = self.subject(key)?;
        match self
            .append(
                &subject,
                Headers::new(),
                value,
                Expectation::LastSubjectSequence(expected_revision),
            )
            .await
        {
            Ok(revision) => {
                debug!(
                    bucket = %self.bucket,
                    key = %key,
                    expected_revision,
                    revision,
                    "Updated"
                );
                Ok(revision)
            }
            Err(LogError::WrongLastSequence { .. }) => Err(KvError::RevisionMismatch {
                key: key.to_string(),
                expected: expected_revision,
            }),
            Err(e) => Err(self.log_error(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.marker(key, KvOperation::Delete).await.map(|_| ())
    }

    async fn purge(&self, key: &str) -> Result<()> {
        self.marker(key, KvOperation::Purge).await.map(|_| ())
    }

    async fn status(&self) -> Result<KvStatus> {
        let info = self
            .log
            .stream_info(self.reader.stream_name())
            .await
            .map_err(|e| self.log_error(e))?;

        Ok(KvStatus {
            bucket: self.bucket.clone(),
            values: info.messages,
            history: info.max_messages_per_subject,
            ttl: info.max_age,
            stream_info: info,
        })
    }
}
