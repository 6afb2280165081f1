//! NATS connection configuration.

use std::time::Duration;

use serde::Deserialize;

/// NATS connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Default timeout for a single log operation, in milliseconds.
    /// Also bounds each receive while replaying a subject.
    pub default_timeout_ms: u64,
    /// Connection retries before giving up.
    pub connect_retries: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            default_timeout_ms: 5000,
            connect_retries: 10,
        }
    }
}

impl NatsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
