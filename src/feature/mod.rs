//! Read primitives shared by log-backed features.
//!
//! - `LogPointReader`: single-message lookups with "no message" mapped to `None`
//! - `ReplayDrainer`: replays a subject through an ephemeral push consumer
//!
//! Any feature that needs a subject's visible history (watchers, history,
//! key listing) builds on `ReplayDrainer` instead of consuming the log directly.

use std::time::Duration;

use crate::config::NatsConfig;

mod drainer;
mod reader;

pub use drainer::ReplayDrainer;
pub use reader::LogPointReader;

/// Default timeout for a single log operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options shared by every feature bound to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureOptions {
    /// Bounds each receive while draining a subject.
    pub default_timeout: Duration,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl FeatureOptions {
    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl From<&NatsConfig> for FeatureOptions {
    fn from(config: &NatsConfig) -> Self {
        Self::with_timeout(config.default_timeout())
    }
}
