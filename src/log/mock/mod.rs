//! In-memory log implementation for testing.
//!
//! Conditional appends are checked and applied under one write lock, so
//! racing writers see the same all-or-nothing behaviour as a real server.
//! Push subscriptions replay stored messages instantly; an exhausted
//! subscription reports a timeout without sleeping. Tests that need to
//! control delivery queue a `SubscriptionScript` before subscribing.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use super::{
    subject_matches, Expectation, Headers, LogError, LogMessage, MessageLog, PublishAck,
    PushSubscription, Result, StreamConfig, StreamInfo, ROLLUP_HEADER, ROLLUP_SUBJECT,
};
use crate::consumer::{DeliverPolicy, PushSubscribeOptions};

/// One step of a scripted subscription.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Deliver this message.
    Deliver(LogMessage),
    /// Report a receive timeout.
    Timeout,
    /// Never complete the receive.
    Hang,
    /// Fail the receive.
    Fail(LogError),
}

/// Delivery script for the next subscription opened on a `MockLog`.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionScript {
    /// Pending count reported when the subscription opens.
    pub pending: u64,
    /// Steps played in order; an empty script times out.
    pub steps: VecDeque<ScriptStep>,
}

impl SubscriptionScript {
    pub fn new(pending: u64) -> Self {
        Self {
            pending,
            steps: VecDeque::new(),
        }
    }

    pub fn deliver(mut self, message: LogMessage) -> Self {
        self.steps.push_back(ScriptStep::Deliver(message));
        self
    }

    pub fn timeout(mut self) -> Self {
        self.steps.push_back(ScriptStep::Timeout);
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push_back(ScriptStep::Hang);
        self
    }

    pub fn fail(mut self, error: LogError) -> Self {
        self.steps.push_back(ScriptStep::Fail(error));
        self
    }
}

/// Counters shared by every subscription a `MockLog` opens.
#[derive(Debug, Default)]
pub struct SubscriptionProbe {
    subscribes: AtomicUsize,
    receives: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl SubscriptionProbe {
    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn receives(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

struct StoredStream {
    config: StreamConfig,
    messages: BTreeMap<u64, LogMessage>,
    last_sequence: u64,
}

impl StoredStream {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: BTreeMap::new(),
            last_sequence: 0,
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|filter| subject_matches(filter, subject))
    }

    fn last_on_subject(&self, subject: &str) -> Option<&LogMessage> {
        self.messages.values().rev().find(|m| m.subject == subject)
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            name: self.config.name.clone(),
            subjects: self.config.subjects.clone(),
            messages: self.messages.len() as u64,
            bytes: self.messages.values().map(|m| m.payload.len() as u64).sum(),
            first_sequence: self.messages.keys().next().copied().unwrap_or(0),
            last_sequence: self.last_sequence,
            max_messages_per_subject: self.config.max_messages_per_subject,
            max_age: self.config.max_age,
            replicas: self.config.replicas,
        }
    }

    /// Drop the oldest messages on `subject` beyond the per-subject limit.
    fn enforce_subject_limit(&mut self, subject: &str) {
        let limit = self.config.max_messages_per_subject;
        if limit <= 0 {
            return;
        }
        let on_subject: Vec<u64> = self
            .messages
            .values()
            .filter(|m| m.subject == subject)
            .map(|m| m.sequence)
            .collect();
        let excess = on_subject.len().saturating_sub(limit as usize);
        for sequence in on_subject.into_iter().take(excess) {
            self.messages.remove(&sequence);
        }
    }
}

/// In-memory log for testing.
#[derive(Default)]
pub struct MockLog {
    streams: RwLock<HashMap<String, StoredStream>>,
    scripts: Mutex<VecDeque<SubscriptionScript>>,
    probe: Arc<SubscriptionProbe>,
    fail_on_publish: RwLock<Option<LogError>>,
    fail_on_get: RwLock<Option<LogError>>,
    fail_on_unsubscribe: RwLock<bool>,
}

impl MockLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a delivery script for the next `push_subscribe`.
    pub async fn script_subscription(&self, script: SubscriptionScript) {
        self.scripts.lock().await.push_back(script);
    }

    /// Counters for subscriptions opened by this log.
    pub fn probe(&self) -> Arc<SubscriptionProbe> {
        Arc::clone(&self.probe)
    }

    pub async fn set_fail_on_publish(&self, error: Option<LogError>) {
        *self.fail_on_publish.write().await = error;
    }

    pub async fn set_fail_on_get(&self, error: Option<LogError>) {
        *self.fail_on_get.write().await = error;
    }

    pub async fn set_fail_on_unsubscribe(&self, fail: bool) {
        *self.fail_on_unsubscribe.write().await = fail;
    }

    /// Remove a stream and its messages. Returns whether it existed.
    pub async fn delete_stream(&self, stream: &str) -> bool {
        self.streams.write().await.remove(stream).is_some()
    }

    /// All messages currently stored under `subject`, in sequence order.
    pub async fn stored_messages(&self, stream: &str, subject: &str) -> Vec<LogMessage> {
        self.streams
            .read()
            .await
            .get(stream)
            .map(|s| {
                s.messages
                    .values()
                    .filter(|m| m.subject == subject)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn injected_get_failure(&self) -> Result<()> {
        match self.fail_on_get.read().await.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Messages a fresh consumer on `subject` would be delivered.
    async fn replay_set(
        &self,
        subject: &str,
        options: &PushSubscribeOptions,
    ) -> Result<Vec<LogMessage>> {
        let streams = self.streams.read().await;
        let stream = match options.stream() {
            Some(name) => streams
                .get(name)
                .ok_or_else(|| LogError::StreamNotFound(name.to_string()))?,
            None => streams
                .values()
                .find(|s| s.captures(subject))
                .ok_or_else(|| LogError::StreamNotFound(subject.to_string()))?,
        };

        let matching: Vec<&LogMessage> = stream
            .messages
            .values()
            .filter(|m| subject_matches(subject, &m.subject))
            .collect();

        let selected: Vec<&LogMessage> = match options.config().deliver_policy {
            DeliverPolicy::All => matching,
            DeliverPolicy::New => Vec::new(),
            DeliverPolicy::Last => matching.last().copied().into_iter().collect(),
            DeliverPolicy::ByStartSequence(start) => matching
                .into_iter()
                .filter(|m| m.sequence >= start)
                .collect(),
            DeliverPolicy::LastPerSubject => {
                let mut last: BTreeMap<&str, &LogMessage> = BTreeMap::new();
                for message in matching {
                    last.insert(message.subject.as_str(), message);
                }
                let mut messages: Vec<&LogMessage> = last.into_values().collect();
                messages.sort_by_key(|m| m.sequence);
                messages
            }
        };

        let total = selected.len() as u64;
        Ok(selected
            .into_iter()
            .enumerate()
            .map(|(i, m)| {
                let mut message = m.clone();
                if options.config().headers_only {
                    message.payload = Bytes::new();
                }
                message.pending = total - (i as u64) - 1;
                message
            })
            .collect())
    }
}

#[async_trait]
impl MessageLog for MockLog {
    async fn get_last_message(&self, stream: &str, subject: &str) -> Result<LogMessage> {
        self.injected_get_failure().await?;
        let streams = self.streams.read().await;
        let stored = streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;
        stored
            .last_on_subject(subject)
            .cloned()
            .ok_or(LogError::NoMessageFound)
    }

    async fn get_message(&self, stream: &str, sequence: u64) -> Result<LogMessage> {
        self.injected_get_failure().await?;
        let streams = self.streams.read().await;
        let stored = streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;
        stored
            .messages
            .get(&sequence)
            .cloned()
            .ok_or(LogError::NoMessageFound)
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
        expectation: Expectation,
    ) -> Result<PublishAck> {
        if let Some(error) = self.fail_on_publish.read().await.clone() {
            return Err(error);
        }

        let mut streams = self.streams.write().await;
        let stream = streams
            .values_mut()
            .find(|s| s.captures(subject))
            .ok_or_else(|| LogError::StreamNotFound(subject.to_string()))?;

        if let Some(expected) = expectation.expected_sequence() {
            let actual = stream.last_on_subject(subject).map_or(0, |m| m.sequence);
            if actual != expected {
                return Err(LogError::WrongLastSequence { expected });
            }
        }

        let max_size = stream.config.max_message_size;
        if max_size >= 0 && payload.len() > max_size as usize {
            return Err(LogError::Api {
                code: 10054,
                description: "message size exceeds maximum allowed".to_string(),
            });
        }

        if headers.get(ROLLUP_HEADER).map(String::as_str) == Some(ROLLUP_SUBJECT) {
            stream.messages.retain(|_, m| m.subject != subject);
        }

        stream.last_sequence += 1;
        let sequence = stream.last_sequence;
        stream.messages.insert(
            sequence,
            LogMessage {
                subject: subject.to_string(),
                sequence,
                headers,
                payload,
                time: Utc::now(),
                pending: 0,
            },
        );
        stream.enforce_subject_limit(subject);

        Ok(PublishAck {
            stream: stream.config.name.clone(),
            sequence,
        })
    }

    async fn push_subscribe(
        &self,
        subject: &str,
        options: PushSubscribeOptions,
    ) -> Result<Box<dyn PushSubscription>> {
        let script = match self.scripts.lock().await.pop_front() {
            Some(script) => script,
            None => {
                let messages = self.replay_set(subject, &options).await?;
                SubscriptionScript {
                    pending: messages.len() as u64,
                    steps: messages.into_iter().map(ScriptStep::Deliver).collect(),
                }
            }
        };

        self.probe.subscribes.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockSubscription {
            script,
            probe: Arc::clone(&self.probe),
            fail_on_unsubscribe: *self.fail_on_unsubscribe.read().await,
        }))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        self.streams
            .read()
            .await
            .get(stream)
            .map(StoredStream::info)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))
    }

    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .entry(config.name.clone())
            .or_insert_with(|| StoredStream::new(config));
        Ok(stream.info())
    }
}

/// Subscription handed out by `MockLog`.
pub struct MockSubscription {
    script: SubscriptionScript,
    probe: Arc<SubscriptionProbe>,
    fail_on_unsubscribe: bool,
}

#[async_trait]
impl PushSubscription for MockSubscription {
    fn pending(&self) -> u64 {
        self.script.pending
    }

    async fn next_message(&mut self, _timeout: Duration) -> Result<Option<LogMessage>> {
        self.probe.receives.fetch_add(1, Ordering::SeqCst);
        match self.script.steps.pop_front() {
            Some(ScriptStep::Deliver(message)) => Ok(Some(message)),
            Some(ScriptStep::Timeout) | None => Ok(None),
            Some(ScriptStep::Hang) => std::future::pending().await,
            Some(ScriptStep::Fail(error)) => Err(error),
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.probe.unsubscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_unsubscribe {
            return Err(LogError::Transport("Mock unsubscribe failure".to_string()));
        }
        Ok(())
    }
}
