//! Consumer configuration for replay subscriptions.
//!
//! `ConsumerConfig` describes how the log delivers messages to a consumer.
//! `PushSubscribeOptions` wraps it with the stream binding and ordering flag
//! used when opening a push subscription. Both are immutable once built.

use serde::Deserialize;

/// Result type for consumer configuration.
pub type Result<T> = std::result::Result<T, ConsumerConfigError>;

/// Errors raised while building consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerConfigError {
    #[error("Invalid stream name: {0:?}")]
    InvalidStream(String),

    #[error("Invalid durable name: {0:?}")]
    InvalidDurable(String),

    #[error("Ordered consumers cannot be durable (durable: {0})")]
    OrderedDurable(String),
}

/// How delivered messages are acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// No acknowledgement; used for replay.
    None,
    /// Acknowledging a message acknowledges all before it.
    All,
    #[default]
    Explicit,
}

/// Where in the stream delivery starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliverPolicy {
    #[default]
    All,
    /// Only the last message of the stream.
    Last,
    /// Only messages published after the consumer is created.
    New,
    ByStartSequence(u64),
    /// The last message of every matching subject.
    LastPerSubject,
}

/// Consumer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable: Option<String>,
    pub deliver_subject: Option<String>,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    /// Deliver headers without payloads.
    pub headers_only: bool,
}

impl ConsumerConfig {
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }

    /// Builder seeded with the values of an existing configuration.
    pub fn builder_from(config: &ConsumerConfig) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            config: config.clone(),
        }
    }
}

/// Builder for [`ConsumerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn durable(mut self, durable: Option<&str>) -> Self {
        self.config.durable = durable.map(str::to_string);
        self
    }

    pub fn deliver_subject(mut self, subject: Option<&str>) -> Self {
        self.config.deliver_subject = subject.map(str::to_string);
        self
    }

    pub fn deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.config.deliver_policy = policy;
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.config.ack_policy = policy;
        self
    }

    pub fn headers_only(mut self, headers_only: bool) -> Self {
        self.config.headers_only = headers_only;
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

/// Options for opening a push subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushSubscribeOptions {
    stream: Option<String>,
    config: ConsumerConfig,
    ordered: bool,
}

impl PushSubscribeOptions {
    pub fn builder() -> PushSubscribeOptionsBuilder {
        PushSubscribeOptionsBuilder::default()
    }

    /// Options bound to an existing stream, with default consumer settings.
    pub fn bind(stream: &str) -> Result<Self> {
        Self::builder().stream(stream).build()
    }

    /// Stream the subscription is bound to, if any.
    pub fn stream(&self) -> Option<&str> {
        self.stream.as_deref()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn durable(&self) -> Option<&str> {
        self.config.durable.as_deref()
    }

    pub fn deliver_subject(&self) -> Option<&str> {
        self.config.deliver_subject.as_deref()
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }
}

/// Builder for [`PushSubscribeOptions`].
#[derive(Debug, Clone, Default)]
pub struct PushSubscribeOptionsBuilder {
    stream: Option<String>,
    durable: Option<String>,
    deliver_subject: Option<String>,
    config: Option<ConsumerConfig>,
    ordered: bool,
}

impl PushSubscribeOptionsBuilder {
    pub fn stream(mut self, stream: &str) -> Self {
        self.stream = Some(stream.to_string());
        self
    }

    pub fn durable(mut self, durable: &str) -> Self {
        self.durable = Some(durable.to_string());
        self
    }

    pub fn deliver_subject(mut self, subject: &str) -> Self {
        self.deliver_subject = Some(subject.to_string());
        self
    }

    pub fn configuration(mut self, config: ConsumerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Validate and assemble the options.
    ///
    /// The durable name resolves as: explicit argument, then the durable of a
    /// supplied configuration, then none (ephemeral).
    pub fn build(self) -> Result<PushSubscribeOptions> {
        let stream = validate_stream_name(self.stream.as_deref())?;

        let durable = match validate_durable(self.durable.as_deref())? {
            Some(durable) => Some(durable),
            None => validate_durable(self.config.as_ref().and_then(|c| c.durable.as_deref()))?,
        };

        if self.ordered {
            if let Some(durable) = durable {
                return Err(ConsumerConfigError::OrderedDurable(durable));
            }
        }

        let base = self.config.unwrap_or_default();
        let deliver_subject = empty_as_none(self.deliver_subject.as_deref())
            .or_else(|| empty_as_none(base.deliver_subject.as_deref()))
            .map(str::to_string);
        let config = ConsumerConfig::builder_from(&base)
            .durable(durable.as_deref())
            .deliver_subject(deliver_subject.as_deref())
            .build();

        Ok(PushSubscribeOptions {
            stream,
            config,
            ordered: self.ordered,
        })
    }
}

fn empty_as_none(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Stream names may not be empty or contain subject tokens.
pub fn validate_stream_name(stream: Option<&str>) -> Result<Option<String>> {
    match empty_as_none(stream) {
        None => Ok(None),
        Some(name) if is_valid_name(name) => Ok(Some(name.to_string())),
        Some(name) => Err(ConsumerConfigError::InvalidStream(name.to_string())),
    }
}

/// Durable names may not be empty or contain subject or path tokens.
pub fn validate_durable(durable: Option<&str>) -> Result<Option<String>> {
    match empty_as_none(durable) {
        None => Ok(None),
        Some(name) if is_valid_name(name) => Ok(Some(name.to_string())),
        Some(name) => Err(ConsumerConfigError::InvalidDurable(name.to_string())),
    }
}

fn is_valid_name(name: &str) -> bool {
    !name
        .chars()
        .any(|c| matches!(c, '.' | '*' | '>' | '/' | '\\') || c.is_whitespace())
}
