//! Point reads against a bound stream.

use std::sync::Arc;

use crate::log::{LogError, LogMessage, MessageLog, Result};

/// Reads single messages from one stream.
///
/// A "no message found" answer from the log becomes `Ok(None)`; every other
/// failure is returned unchanged.
#[derive(Clone)]
pub struct LogPointReader {
    log: Arc<dyn MessageLog>,
    stream_name: String,
}

impl LogPointReader {
    pub fn new(log: Arc<dyn MessageLog>, stream_name: impl Into<String>) -> Self {
        Self {
            log,
            stream_name: stream_name.into(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Most recent message published on `subject`.
    pub async fn get_last(&self, subject: &str) -> Result<Option<LogMessage>> {
        absent_if_not_found(self.log.get_last_message(&self.stream_name, subject).await)
    }

    /// Message stored at `sequence`.
    pub async fn get_by_sequence(&self, sequence: u64) -> Result<Option<LogMessage>> {
        absent_if_not_found(self.log.get_message(&self.stream_name, sequence).await)
    }
}

fn absent_if_not_found(result: Result<LogMessage>) -> Result<Option<LogMessage>> {
    match result {
        Ok(message) => Ok(Some(message)),
        Err(LogError::NoMessageFound) => Ok(None),
        Err(e) => Err(e),
    }
}
