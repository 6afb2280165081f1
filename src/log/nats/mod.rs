//! NATS JetStream message log.
//!
//! ## Mapping
//!
//! - Point reads: raw stream message lookups (`$JS.API.STREAM.MSG.GET`)
//! - Conditional appends: `Nats-Expected-Last-Subject-Sequence` header
//! - Replay: push consumers on a fresh inbox, ordered or plain ephemeral
//!
//! JetStream errors are classified by their rendered text, the same way for
//! every call, into the `LogError` variants callers branch on.

use std::pin::Pin;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::push, stream, Context};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tracing::debug;

use super::{
    Expectation, Headers, LogError, LogMessage, MessageLog, PublishAck, PushSubscription, Result,
    StorageType, StreamConfig, StreamInfo, EXPECTED_LAST_SUBJECT_SEQUENCE_HEADER, ROLLUP_HEADER,
};
use crate::consumer::{AckPolicy, DeliverPolicy, PushSubscribeOptions};
use crate::kv::OPERATION_HEADER;

/// Headers copied out of stored messages. Any other header is dropped.
const DECODED_HEADERS: &[&str] = &[OPERATION_HEADER, ROLLUP_HEADER];

/// Idle period after which the server removes an abandoned ephemeral consumer.
const EPHEMERAL_INACTIVE_THRESHOLD: Duration = Duration::from_secs(30);

/// `MessageLog` backed by NATS JetStream.
pub struct NatsLog {
    client: async_nats::Client,
    jetstream: Context,
}

impl NatsLog {
    /// Create a log over a connected NATS client.
    pub fn new(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    async fn stream(&self, name: &str) -> Result<stream::Stream> {
        self.jetstream
            .get_stream(name)
            .await
            .map_err(|e| classify(e, Some(name), None))
    }

    async fn stream_for(&self, subject: &str, options: &PushSubscribeOptions) -> Result<String> {
        match options.stream() {
            Some(name) => Ok(name.to_string()),
            None => self
                .jetstream
                .stream_by_subject(subject)
                .await
                .map_err(|e| classify(e, Some(subject), None)),
        }
    }
}

#[async_trait]
impl MessageLog for NatsLog {
    async fn get_last_message(&self, stream: &str, subject: &str) -> Result<LogMessage> {
        let message = self
            .stream(stream)
            .await?
            .get_last_raw_message_by_subject(subject)
            .await
            .map_err(|e| classify(e, Some(stream), None))?;
        Ok(stored_message(message))
    }

    async fn get_message(&self, stream: &str, sequence: u64) -> Result<LogMessage> {
        let message = self
            .stream(stream)
            .await?
            .get_raw_message(sequence)
            .await
            .map_err(|e| classify(e, Some(stream), None))?;
        Ok(stored_message(message))
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
        expectation: Expectation,
    ) -> Result<PublishAck> {
        let mut header_map = HeaderMap::new();
        for (name, value) in &headers {
            header_map.insert(name.as_str(), value.as_str());
        }
        let expected = expectation.expected_sequence();
        if let Some(sequence) = expected {
            header_map.insert(
                EXPECTED_LAST_SUBJECT_SEQUENCE_HEADER,
                sequence.to_string().as_str(),
            );
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), header_map, payload)
            .await
            .map_err(|e| classify(e, None, expected))?
            .await
            .map_err(|e| classify(e, None, expected))?;

        debug!(subject = %subject, sequence = ack.sequence, "Published to JetStream");

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
        })
    }

    async fn push_subscribe(
        &self,
        subject: &str,
        options: PushSubscribeOptions,
    ) -> Result<Box<dyn PushSubscription>> {
        let stream_name = self.stream_for(subject, &options).await?;
        let stream = self.stream(&stream_name).await?;
        let config = options.config();
        let deliver_subject = options
            .deliver_subject()
            .map(str::to_string)
            .unwrap_or_else(|| self.client.new_inbox());

        let subscription = if options.ordered() {
            let consumer = stream
                .create_consumer(push::OrderedConfig {
                    deliver_subject,
                    filter_subject: subject.to_string(),
                    deliver_policy: deliver_policy(config.deliver_policy),
                    headers_only: config.headers_only,
                    ..Default::default()
                })
                .await
                .map_err(|e| classify(e, Some(&stream_name), None))?;
            let pending = initial_pending(consumer.cached_info());
            let messages = consumer
                .messages()
                .await
                .map_err(|e| classify(e, Some(&stream_name), None))?
                .map(|m| m.map_err(|e| e.to_string()))
                .boxed();

            NatsSubscription {
                pending,
                messages: Some(messages),
                ephemeral: None,
            }
        } else {
            let durable = options.durable().map(str::to_string);
            let consumer = stream
                .create_consumer(push::Config {
                    deliver_subject,
                    durable_name: durable.clone(),
                    filter_subject: subject.to_string(),
                    deliver_policy: deliver_policy(config.deliver_policy),
                    ack_policy: ack_policy(config.ack_policy),
                    headers_only: config.headers_only,
                    inactive_threshold: if durable.is_none() {
                        EPHEMERAL_INACTIVE_THRESHOLD
                    } else {
                        Duration::ZERO
                    },
                    ..Default::default()
                })
                .await
                .map_err(|e| classify(e, Some(&stream_name), None))?;
            let pending = initial_pending(consumer.cached_info());
            let name = consumer.cached_info().name.clone();
            let messages = consumer
                .messages()
                .await
                .map_err(|e| classify(e, Some(&stream_name), None))?
                .map(|m| m.map_err(|e| e.to_string()))
                .boxed();

            NatsSubscription {
                pending,
                messages: Some(messages),
                ephemeral: durable.is_none().then_some((stream, name)),
            }
        };

        debug!(
            subject = %subject,
            stream = %stream_name,
            pending = subscription.pending,
            ordered = options.ordered(),
            "Opened push subscription"
        );

        Ok(Box::new(subscription))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let stream = self.stream(stream).await?;
        Ok(stream_info(stream.cached_info()))
    }

    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        let name = config.name.clone();
        let stream = self
            .jetstream
            .get_or_create_stream(stream::Config {
                name: config.name,
                subjects: config.subjects,
                max_messages_per_subject: config.max_messages_per_subject,
                max_age: config.max_age,
                max_message_size: config.max_message_size,
                storage: match config.storage {
                    StorageType::File => stream::StorageType::File,
                    StorageType::Memory => stream::StorageType::Memory,
                },
                num_replicas: config.replicas,
                allow_rollup: config.allow_rollup,
                deny_delete: config.deny_delete,
                allow_direct: config.allow_direct,
                discard: if config.discard_new {
                    stream::DiscardPolicy::New
                } else {
                    stream::DiscardPolicy::Old
                },
                ..Default::default()
            })
            .await
            .map_err(|e| classify(e, Some(&name), None))?;

        Ok(stream_info(stream.cached_info()))
    }
}

type MessageStream =
    Pin<Box<dyn Stream<Item = std::result::Result<jetstream::Message, String>> + Send>>;

/// Push subscription over a JetStream consumer.
struct NatsSubscription {
    pending: u64,
    messages: Option<MessageStream>,
    /// Stream and name of a consumer to delete on release.
    ephemeral: Option<(stream::Stream, String)>,
}

#[async_trait]
impl PushSubscription for NatsSubscription {
    fn pending(&self) -> u64 {
        self.pending
    }

    async fn next_message(&mut self, timeout: Duration) -> Result<Option<LogMessage>> {
        let messages = self
            .messages
            .as_mut()
            .ok_or(LogError::SubscriptionClosed)?;

        match tokio::time::timeout(timeout, messages.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(LogError::SubscriptionClosed),
            Ok(Some(Err(e))) => Err(LogError::Transport(e)),
            Ok(Some(Ok(message))) => Ok(Some(delivered_message(message))),
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.messages = None;
        if let Some((stream, name)) = self.ephemeral.take() {
            stream
                .delete_consumer(&name)
                .await
                .map_err(|e| classify(e, None, None))?;
            debug!(consumer = %name, "Deleted ephemeral consumer");
        }
        Ok(())
    }
}

/// Pending count as seen by a consumer that may already have started delivering.
fn initial_pending(info: &jetstream::consumer::Info) -> u64 {
    info.num_pending + info.delivered.consumer_sequence
}

fn deliver_policy(policy: DeliverPolicy) -> jetstream::consumer::DeliverPolicy {
    use jetstream::consumer::DeliverPolicy as Nats;
    match policy {
        DeliverPolicy::All => Nats::All,
        DeliverPolicy::Last => Nats::Last,
        DeliverPolicy::New => Nats::New,
        DeliverPolicy::ByStartSequence(start_sequence) => Nats::ByStartSequence { start_sequence },
        DeliverPolicy::LastPerSubject => Nats::LastPerSubject,
    }
}

fn ack_policy(policy: AckPolicy) -> jetstream::consumer::AckPolicy {
    use jetstream::consumer::AckPolicy as Nats;
    match policy {
        AckPolicy::None => Nats::None,
        AckPolicy::All => Nats::All,
        AckPolicy::Explicit => Nats::Explicit,
    }
}

fn stream_info(info: &stream::Info) -> StreamInfo {
    StreamInfo {
        name: info.config.name.clone(),
        subjects: info.config.subjects.clone(),
        messages: info.state.messages,
        bytes: info.state.bytes,
        first_sequence: info.state.first_sequence,
        last_sequence: info.state.last_sequence,
        max_messages_per_subject: info.config.max_messages_per_subject,
        max_age: info.config.max_age,
        replicas: info.config.num_replicas,
    }
}

fn stored_message(message: jetstream::message::StreamMessage) -> LogMessage {
    LogMessage {
        subject: message.subject.to_string(),
        sequence: message.sequence,
        headers: decode_headers(Some(&message.headers)),
        payload: message.payload,
        time: utc(message.time.unix_timestamp(), message.time.nanosecond()),
        pending: 0,
    }
}

fn delivered_message(message: jetstream::Message) -> LogMessage {
    let (sequence, pending, time) = match message.info() {
        Ok(info) => (
            info.stream_sequence,
            info.pending,
            utc(info.published.unix_timestamp(), info.published.nanosecond()),
        ),
        Err(_) => (0, 0, Utc::now()),
    };
    LogMessage {
        subject: message.subject.to_string(),
        sequence,
        headers: decode_headers(message.headers.as_ref()),
        payload: message.payload.clone(),
        time,
        pending,
    }
}

fn decode_headers(headers: Option<&HeaderMap>) -> Headers {
    let mut decoded = Headers::new();
    let Some(headers) = headers else {
        return decoded;
    };
    for name in DECODED_HEADERS {
        if let Some(value) = headers.get(*name) {
            decoded.insert(name.to_string(), value.as_str().to_string());
        }
    }
    decoded
}

fn utc(seconds: i64, nanos: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, nanos).unwrap_or_default()
}

/// Map a JetStream error onto a `LogError`.
///
/// `context` names the stream or subject involved; `expected` is the
/// sequence a conditional publish asserted.
fn classify(error: impl std::fmt::Display, context: Option<&str>, expected: Option<u64>) -> LogError {
    let text = error.to_string();
    let lower = text.to_lowercase();

    if lower.contains("no message found") || lower.contains("10037") {
        LogError::NoMessageFound
    } else if lower.contains("wrong last sequence") || lower.contains("10071") {
        LogError::WrongLastSequence {
            expected: expected.unwrap_or_default(),
        }
    } else if lower.contains("stream not found")
        || lower.contains("10059")
        || lower.contains("no stream matches subject")
    {
        LogError::StreamNotFound(context.unwrap_or_default().to_string())
    } else {
        LogError::Transport(text)
    }
}
