//! kvstream-status: bucket status reporter
//!
//! Connects to NATS, creates the configured bucket if it does not exist yet
//! and logs its status.
//!
//! ## Configuration
//! - `kvstream.yaml` / `KVSTREAM_CONFIG`: configuration file
//! - `KVSTREAM__NATS__URL`, `KVSTREAM__BUCKET__NAME`, ...: overrides
//! - `KVSTREAM_LOG`: log filter (default: info)

use std::sync::Arc;

use tracing::info;

use kvstream::config::Config;
use kvstream::feature::FeatureOptions;
use kvstream::kv::{KeyValue, LogKeyValue};
use kvstream::log::NatsLog;
use kvstream::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let url = config.nats.url.clone();

    let client = connect_with_retry("nats", &url, config.nats.connect_retries, || {
        async_nats::connect(url.clone())
    })
    .await?;

    let log = Arc::new(NatsLog::new(client));
    let kv =
        LogKeyValue::create_bucket(log, &config.bucket, FeatureOptions::from(&config.nats)).await?;

    let status = kv.status().await?;
    info!(
        bucket = %status.bucket,
        values = status.values,
        history = status.history,
        ttl = ?status.ttl,
        stream = %status.stream_info.name,
        bytes = status.stream_info.bytes,
        first_sequence = status.stream_info.first_sequence,
        last_sequence = status.stream_info.last_sequence,
        "Bucket status"
    );

    Ok(())
}
