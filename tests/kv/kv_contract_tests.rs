//! KeyValue interface tests.
//!
//! These tests verify the contract of the KeyValue trait.
//! Each log backend should run these tests against a bucket keeping at
//! least 5 revisions per key. Keys are unique per test, so one bucket can
//! serve the whole suite.

use bytes::Bytes;
use uuid::Uuid;

use kvstream::consumer::DeliverPolicy;
use kvstream::kv::{key_subject_prefix, KeyValue, KvEntry, KvError, KvOperation, LogKeyValue};

/// Key unique to one test run.
pub fn unique_key(name: &str) -> String {
    format!("{}.{}", name, Uuid::new_v4().simple())
}

fn value(data: &str) -> Bytes {
    Bytes::from(data.to_string())
}

// =============================================================================
// get / put
// =============================================================================

pub async fn test_get_never_written<K: KeyValue>(kv: &K) {
    let key = unique_key("never");

    let entry = kv.get(&key).await.expect("get should succeed");
    assert!(entry.is_none(), "never-written key should be None");
}

pub async fn test_put_then_get<K: KeyValue>(kv: &K) {
    let key = unique_key("put");

    let revision = kv.put(&key, value("hello")).await.expect("put should succeed");

    let entry = kv
        .get(&key)
        .await
        .expect("get should succeed")
        .expect("entry should exist");
    assert_eq!(entry.key, key);
    assert_eq!(entry.bucket, kv.bucket_name());
    assert_eq!(entry.value, value("hello"));
    assert_eq!(entry.revision, revision);
    assert_eq!(entry.operation, KvOperation::Put);
}

pub async fn test_put_increases_revision<K: KeyValue>(kv: &K) {
    let key = unique_key("monotonic");

    let mut last = 0;
    for i in 0..4 {
        let revision = kv
            .put(&key, value(&i.to_string()))
            .await
            .expect("put should succeed");
        assert!(revision > last, "revision {} should exceed {}", revision, last);
        last = revision;
    }
}

// =============================================================================
// create / update
// =============================================================================

pub async fn test_create_new<K: KeyValue>(kv: &K) {
    let key = unique_key("create");

    let revision = kv.create(&key, value("v1")).await.expect("create should succeed");

    let entry = kv.get(&key).await.unwrap().expect("entry should exist");
    assert_eq!(entry.revision, revision);
}

pub async fn test_create_existing_fails<K: KeyValue>(kv: &K) {
    let key = unique_key("create_twice");

    kv.create(&key, value("v1")).await.expect("create should succeed");
    let err = kv
        .create(&key, value("v2"))
        .await
        .expect_err("second create should fail");

    assert_eq!(err, KvError::AlreadyExists { key: key.clone() });
    let entry = kv.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.value, value("v1"), "failed create must not write");
}

pub async fn test_update_expected_revision<K: KeyValue>(kv: &K) {
    let key = unique_key("update");

    let first = kv.put(&key, value("v1")).await.unwrap();
    let second = kv
        .update(&key, value("v2"), first)
        .await
        .expect("update at current revision should succeed");

    assert!(second > first);
    let entry = kv.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.value, value("v2"));
    assert_eq!(entry.revision, second);
}

pub async fn test_update_stale_revision_fails<K: KeyValue>(kv: &K) {
    let key = unique_key("stale");

    let first = kv.put(&key, value("v1")).await.unwrap();
    kv.put(&key, value("v2")).await.unwrap();

    let err = kv
        .update(&key, value("v3"), first)
        .await
        .expect_err("stale update should fail");
    assert_eq!(
        err,
        KvError::RevisionMismatch {
            key: key.clone(),
            expected: first
        }
    );
}

pub async fn test_update_never_written_fails<K: KeyValue>(kv: &K) {
    let key = unique_key("update_missing");

    let err = kv
        .update(&key, value("v1"), 1)
        .await
        .expect_err("update of unwritten key should fail");
    assert!(matches!(err, KvError::RevisionMismatch { .. }));
}

pub async fn test_racing_updates<K: KeyValue>(kv: &K) {
    let key = unique_key("race");
    let revision = kv.put(&key, value("base")).await.unwrap();

    let (left, right) = tokio::join!(
        kv.update(&key, value("left"), revision),
        kv.update(&key, value("right"), revision)
    );

    let results = [left, right];
    assert_eq!(
        results.iter().filter(|r| r.is_ok()).count(),
        1,
        "exactly one racing update should win: {:?}",
        results
    );
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(KvError::RevisionMismatch { .. }))));
}

// =============================================================================
// delete / purge
// =============================================================================

pub async fn test_delete_hides_key<K: KeyValue>(kv: &K) {
    let key = unique_key("delete");

    kv.put(&key, value("v1")).await.unwrap();
    kv.delete(&key).await.expect("delete should succeed");

    assert!(kv.get(&key).await.unwrap().is_none());
    let marker = kv.entry(&key).await.unwrap().expect("tombstone should exist");
    assert_eq!(marker.operation, KvOperation::Delete);
}

pub async fn test_create_after_delete<K: KeyValue>(kv: &K) {
    let key = unique_key("recreate");

    let first = kv.create(&key, value("v1")).await.unwrap();
    kv.delete(&key).await.unwrap();

    let revision = kv
        .create(&key, value("v2"))
        .await
        .expect("create over a tombstone should succeed");
    assert!(revision > first);
    assert_eq!(kv.get(&key).await.unwrap().unwrap().value, value("v2"));
}

pub async fn test_purge_hides_key<K: KeyValue>(kv: &K) {
    let key = unique_key("purge");

    let first = kv.put(&key, value("v1")).await.unwrap();
    kv.put(&key, value("v2")).await.unwrap();
    kv.purge(&key).await.expect("purge should succeed");

    assert!(kv.get(&key).await.unwrap().is_none());
    assert!(
        kv.entry_at_revision(&key, first).await.unwrap().is_none(),
        "purge should drop earlier revisions"
    );
    kv.create(&key, value("v3"))
        .await
        .expect("create after purge should succeed");
}

// =============================================================================
// revision lookups
// =============================================================================

pub async fn test_get_revision<K: KeyValue>(kv: &K) {
    let key = unique_key("revision");

    let first = kv.put(&key, value("v1")).await.unwrap();
    kv.put(&key, value("v2")).await.unwrap();

    let entry = kv
        .get_revision(&key, first)
        .await
        .unwrap()
        .expect("earlier revision should be kept");
    assert_eq!(entry.value, value("v1"));
    assert_eq!(entry.revision, first);
}

pub async fn test_get_revision_of_other_key<K: KeyValue>(kv: &K) {
    let key = unique_key("mine");
    let other = unique_key("theirs");

    let revision = kv.put(&other, value("v1")).await.unwrap();

    assert!(kv.get_revision(&key, revision).await.unwrap().is_none());
}

pub async fn test_tombstone_revision<K: KeyValue>(kv: &K) {
    let key = unique_key("tombstone");

    kv.put(&key, value("v1")).await.unwrap();
    kv.delete(&key).await.unwrap();
    let marker = kv.entry(&key).await.unwrap().unwrap();

    assert!(kv.get_revision(&key, marker.revision).await.unwrap().is_none());
    let raw = kv
        .entry_at_revision(&key, marker.revision)
        .await
        .unwrap()
        .expect("raw lookup should return the tombstone");
    assert_eq!(raw.operation, KvOperation::Delete);
}

// =============================================================================
// misc
// =============================================================================

pub async fn test_lifecycle_scenario<K: KeyValue>(kv: &K) {
    let key = unique_key("scenario");

    let r1 = kv.create(&key, Bytes::from_static(&[1, 2, 3])).await.unwrap();
    let r2 = kv.update(&key, Bytes::from_static(&[4]), r1).await.unwrap();
    assert!(r2 > r1);

    let err = kv
        .update(&key, Bytes::from_static(&[5]), r1)
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::RevisionMismatch { .. }));

    kv.delete(&key).await.unwrap();
    assert!(kv.get(&key).await.unwrap().is_none());

    let r4 = kv.create(&key, Bytes::from_static(&[6])).await.unwrap();
    assert!(r4 > r2);
    let entry = kv.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.value, Bytes::from_static(&[6]));
}

pub async fn test_invalid_key<K: KeyValue>(kv: &K) {
    for key in ["", "bad key", "wild.*", ".leading"] {
        let err = kv.put(key, value("v")).await.unwrap_err();
        assert_eq!(err, KvError::InvalidKey(key.to_string()));
    }
}

pub async fn test_status<K: KeyValue>(kv: &K) {
    kv.put(&unique_key("status"), value("v")).await.unwrap();

    let status = kv.status().await.expect("status should succeed");
    assert_eq!(status.bucket, kv.bucket_name());
    assert!(status.values >= 1);
    assert!(status.history >= 5);
    assert!(status.stream_info.last_sequence >= status.values);
}

/// Replay one key's history through the bucket's drainer.
pub async fn test_replay_history(kv: &LogKeyValue) {
    let key = unique_key("replay");
    for v in ["v1", "v2"] {
        kv.put(&key, value(v)).await.unwrap();
    }
    kv.delete(&key).await.unwrap();

    let subject = format!("{}{}", key_subject_prefix(kv.bucket_name()), key);
    let mut entries = Vec::new();
    let visited = kv
        .drainer()
        .drain(&subject, DeliverPolicy::All, false, true, |message| {
            entries.extend(KvEntry::from_message(kv.bucket_name(), message));
            Ok(())
        })
        .await
        .expect("drain should succeed");

    assert_eq!(visited, 3);
    let operations: Vec<_> = entries.iter().map(|e| e.operation).collect();
    assert_eq!(
        operations,
        vec![KvOperation::Put, KvOperation::Put, KvOperation::Delete]
    );
    assert_eq!(entries[0].value, value("v1"));
    assert_eq!(entries[2].delta, 0);
}

/// Run all KeyValue contract tests against a bucket.
#[macro_export]
macro_rules! run_kv_tests {
    ($kv:expr) => {
        use $crate::kv::kv_contract_tests::*;

        // get / put
        test_get_never_written($kv).await;
        println!("  test_get_never_written: PASSED");

        test_put_then_get($kv).await;
        println!("  test_put_then_get: PASSED");

        test_put_increases_revision($kv).await;
        println!("  test_put_increases_revision: PASSED");

        // create / update
        test_create_new($kv).await;
        println!("  test_create_new: PASSED");

        test_create_existing_fails($kv).await;
        println!("  test_create_existing_fails: PASSED");

        test_update_expected_revision($kv).await;
        println!("  test_update_expected_revision: PASSED");

        test_update_stale_revision_fails($kv).await;
        println!("  test_update_stale_revision_fails: PASSED");

        test_update_never_written_fails($kv).await;
        println!("  test_update_never_written_fails: PASSED");

        test_racing_updates($kv).await;
        println!("  test_racing_updates: PASSED");

        // delete / purge
        test_delete_hides_key($kv).await;
        println!("  test_delete_hides_key: PASSED");

        test_create_after_delete($kv).await;
        println!("  test_create_after_delete: PASSED");

        test_purge_hides_key($kv).await;
        println!("  test_purge_hides_key: PASSED");

        // revision lookups
        test_get_revision($kv).await;
        println!("  test_get_revision: PASSED");

        test_get_revision_of_other_key($kv).await;
        println!("  test_get_revision_of_other_key: PASSED");

        test_tombstone_revision($kv).await;
        println!("  test_tombstone_revision: PASSED");

        // misc
        test_lifecycle_scenario($kv).await;
        println!("  test_lifecycle_scenario: PASSED");

        test_invalid_key($kv).await;
        println!("  test_invalid_key: PASSED");

        test_status($kv).await;
        println!("  test_status: PASSED");
    };
}
