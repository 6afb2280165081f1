//! kvstream configuration.
//!
//! One document with a `nats` section (connection and timeouts) and a
//! `bucket` section (the bucket the binaries bind to). Sources are layered:
//! YAML files first, then `KVSTREAM__*` environment overrides.

mod nats;

pub use nats::NatsConfig;

use ::config::{builder::DefaultState, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::kv::KvBucketConfig;

/// File read from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "kvstream.yaml";
/// Names an additional, required configuration file.
pub const CONFIG_ENV_VAR: &str = "KVSTREAM_CONFIG";
/// Prefix of override variables, e.g. `KVSTREAM__NATS__URL`.
pub const CONFIG_ENV_PREFIX: &str = "KVSTREAM";
/// Log filter variable read by `init_tracing`.
pub const LOG_ENV_VAR: &str = "KVSTREAM_LOG";

/// Client and bucket settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub nats: NatsConfig,
    pub bucket: KvBucketConfig,
}

impl Config {
    /// Load from files and environment.
    ///
    /// Later layers override earlier ones:
    /// 1. `kvstream.yaml` (optional)
    /// 2. `path`, when given
    /// 3. the file named by `KVSTREAM_CONFIG`, when set
    /// 4. `KVSTREAM__<SECTION>__<FIELD>` variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let required: Vec<String> = path
            .map(str::to_string)
            .into_iter()
            .chain(std::env::var(CONFIG_ENV_VAR).ok())
            .collect();

        let builder = required.iter().fold(
            ::config::Config::builder()
                .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false)),
            |builder, file| builder.add_source(File::new(file, FileFormat::Yaml)),
        );

        Self::deserialize_from(
            builder.add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            ),
        )
    }

    /// Parse a single YAML document; files and environment are ignored.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Self::deserialize_from(
            ::config::Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)),
        )
    }

    fn deserialize_from(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder.build()?.try_deserialize()
    }
}
