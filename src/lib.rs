//! kvstream - revisioned key-value buckets on an append-only log
//!
//! Every key of a bucket maps to one subject of a JetStream-style stream.
//! Writes are appends, a key's revision is the stream sequence of its latest
//! message, and compare-and-set is enforced by the log's conditional append.
//!
//! ## Layers
//! - [`log`]: the log capability (`MessageLog`) with NATS and in-memory backends
//! - [`consumer`]: consumer configuration and push-subscribe options
//! - [`feature`]: point reads and subject replay shared by log-backed features
//! - [`kv`]: the `KeyValue` bucket contract and its log-backed implementation

pub mod config;
pub mod consumer;
pub mod feature;
pub mod kv;
pub mod log;
pub mod utils;
