//! Shared key-value integration tests.
//!
//! Tests the KeyValue interface against every log backend.
//! Each backend module imports these test functions and runs them.

pub mod kv_contract_tests;
