//! Process bootstrap for kvstream binaries: log setup and connection retry.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

/// Filter used when `KVSTREAM_LOG` is unset or unparsable.
const DEFAULT_LOG_FILTER: &str = "info";

/// Install the global subscriber: `KVSTREAM_LOG` filter, fmt output.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Delays between connection attempts: 100ms doubling to 5s, jittered.
fn connect_backoff(max_retries: usize) -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_retries)
        .with_jitter()
        .build()
}

/// Run `connect` until it succeeds or `max_retries` retries are spent.
///
/// `service` and `address` only label log lines. The error of the final
/// attempt is returned.
pub async fn connect_with_retry<T, E, F, Fut>(
    service: &str,
    address: &str,
    max_retries: usize,
    connect: F,
) -> Result<T, E>
where
    E: Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = connect_backoff(max_retries);
    let mut attempt = 1;

    loop {
        let error = match connect().await {
            Ok(connection) => {
                info!(service, address, attempt, "Connected");
                return Ok(connection);
            }
            Err(e) => e,
        };

        let Some(delay) = delays.next() else {
            error!(service, address, attempts = attempt, error = %error, "Giving up on connection");
            return Err(error);
        };

        warn!(service, address, attempt, error = %error, retry_in = ?delay, "Connection attempt failed");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
