use bytes::Bytes;
use chrono::Utc;

use super::*;
use crate::kv::KvBucketConfig;
use crate::log::mock::{MockLog, SubscriptionScript};
use crate::log::{Expectation, Headers, LogError};
use crate::utils::cancel::cancellation;

const SUBJECT: &str = "$KV.replay.k";

fn message(sequence: u64) -> LogMessage {
    LogMessage {
        subject: SUBJECT.to_string(),
        sequence,
        headers: Headers::new(),
        payload: Bytes::from(sequence.to_string()),
        time: Utc::now(),
        pending: 0,
    }
}

async fn drainer() -> (Arc<MockLog>, ReplayDrainer) {
    let log = Arc::new(MockLog::new());
    log.ensure_stream(KvBucketConfig::new("replay").with_history(5).stream_config())
        .await
        .unwrap();
    let drainer = ReplayDrainer::new(
        log.clone(),
        "KV_replay",
        FeatureOptions::with_timeout(Duration::from_millis(10)),
    );
    (log, drainer)
}

#[tokio::test]
async fn test_zero_pending_visits_nothing_and_releases() {
    let (log, drainer) = drainer().await;

    let mut seen = Vec::new();
    let visited = drainer
        .drain(SUBJECT, DeliverPolicy::All, false, false, |m| {
            seen.push(m.sequence);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(visited, 0);
    assert!(seen.is_empty());
    let probe = log.probe();
    assert_eq!(probe.receives(), 0, "no receive when nothing is pending");
    assert_eq!(probe.unsubscribes(), 1);
}

#[tokio::test]
async fn test_all_pending_delivered_in_order() {
    let (log, drainer) = drainer().await;
    for payload in ["a", "b", "c"] {
        log.publish(SUBJECT, Headers::new(), Bytes::from(payload), Expectation::None)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let visited = drainer
        .drain(SUBJECT, DeliverPolicy::All, false, false, |m| {
            seen.push(m.payload);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(visited, 3);
    assert_eq!(seen, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    let probe = log.probe();
    assert_eq!(probe.receives(), 3, "no receive after the pending count is exhausted");
    assert_eq!(probe.unsubscribes(), 1);
}

#[tokio::test]
async fn test_stale_pending_count_stops_after_two_timeouts() {
    let (log, drainer) = drainer().await;
    log.script_subscription(
        SubscriptionScript::new(5)
            .deliver(message(1))
            .deliver(message(2))
            .deliver(message(3)),
    )
    .await;

    let mut seen = Vec::new();
    let visited = drainer
        .drain(SUBJECT, DeliverPolicy::All, false, false, |m| {
            seen.push(m.sequence);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(visited, 3);
    assert_eq!(seen, vec![1, 2, 3]);
    let probe = log.probe();
    assert_eq!(probe.receives(), 5, "three deliveries then two timeouts");
    assert_eq!(probe.unsubscribes(), 1);
}

#[tokio::test]
async fn test_single_timeout_is_retried() {
    let (log, drainer) = drainer().await;
    log.script_subscription(
        SubscriptionScript::new(3)
            .deliver(message(1))
            .timeout()
            .deliver(message(2))
            .timeout()
            .deliver(message(3)),
    )
    .await;

    let mut seen = Vec::new();
    drainer
        .drain(SUBJECT, DeliverPolicy::All, false, false, |m| {
            seen.push(m.sequence);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(log.probe().receives(), 5);
}

#[tokio::test]
async fn test_visitor_error_propagates_after_release() {
    let (log, drainer) = drainer().await;
    log.script_subscription(
        SubscriptionScript::new(3)
            .deliver(message(1))
            .deliver(message(2))
            .deliver(message(3)),
    )
    .await;

    let mut calls = 0;
    let err = drainer
        .drain(SUBJECT, DeliverPolicy::All, false, false, |m| {
            calls += 1;
            if m.sequence == 2 {
                return Err(KvError::Visit("rejected".to_string()));
            }
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, KvError::Visit(_)));
    assert_eq!(calls, 2);
    assert_eq!(log.probe().unsubscribes(), 1);
}

#[tokio::test]
async fn test_receive_failure_propagates_after_release() {
    let (log, drainer) = drainer().await;
    log.script_subscription(
        SubscriptionScript::new(2)
            .deliver(message(1))
            .fail(LogError::Transport("connection reset".to_string())),
    )
    .await;

    let err = drainer
        .drain(SUBJECT, DeliverPolicy::All, false, false, |_| Ok(()))
        .await
        .unwrap_err();

    assert!(matches!(err, KvError::Log(LogError::Transport(_))));
    assert_eq!(log.probe().unsubscribes(), 1);
}

#[tokio::test]
async fn test_release_failure_does_not_fail_drain() {
    let (log, drainer) = drainer().await;
    log.publish(SUBJECT, Headers::new(), Bytes::from("a"), Expectation::None)
        .await
        .unwrap();
    log.set_fail_on_unsubscribe(true).await;

    let visited = drainer
        .drain(SUBJECT, DeliverPolicy::All, false, false, |_| Ok(()))
        .await
        .unwrap();

    assert_eq!(visited, 1);
    assert_eq!(log.probe().unsubscribes(), 1);
}

#[tokio::test]
async fn test_cancel_stops_hanging_receive() {
    let (log, drainer) = drainer().await;
    log.script_subscription(SubscriptionScript::new(2).deliver(message(1)).hang())
        .await;

    let (handle, mut signal) = cancellation();
    let mut seen = Vec::new();

    let drain = drainer.drain_with_cancel(
        SUBJECT,
        DeliverPolicy::All,
        false,
        false,
        |m| {
            seen.push(m.sequence);
            if m.sequence == 1 {
                handle.cancel();
            }
            Ok(())
        },
        &mut signal,
    );
    let err = drain.await.unwrap_err();

    assert!(matches!(err, KvError::Cancelled));
    assert_eq!(seen, vec![1]);
    assert_eq!(log.probe().unsubscribes(), 1);
}

#[tokio::test]
async fn test_dropped_drain_still_releases() {
    let (log, drainer) = drainer().await;
    log.script_subscription(SubscriptionScript::new(1).hang())
        .await;

    let result = tokio::time::timeout(
        Duration::from_millis(20),
        drainer.drain(SUBJECT, DeliverPolicy::All, false, false, |_| Ok(())),
    )
    .await;
    assert!(result.is_err(), "drain should still be waiting");

    // Release is spawned from the guard's Drop
    for _ in 0..50 {
        if log.probe().unsubscribes() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(log.probe().unsubscribes(), 1);
}

#[tokio::test]
async fn test_invalid_stream_binding_fails_before_subscribing() {
    let log = Arc::new(MockLog::new());
    let drainer = ReplayDrainer::new(log.clone(), "bad.stream", FeatureOptions::default());

    let err = drainer
        .drain(SUBJECT, DeliverPolicy::All, false, false, |_| Ok(()))
        .await
        .unwrap_err();

    assert!(matches!(err, KvError::Consumer(_)));
    assert_eq!(log.probe().subscribes(), 0);
}

#[tokio::test]
async fn test_last_policy_replays_only_latest() {
    let (log, drainer) = drainer().await;
    for payload in ["a", "b"] {
        log.publish(SUBJECT, Headers::new(), Bytes::from(payload), Expectation::None)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    drainer
        .drain(SUBJECT, DeliverPolicy::Last, false, true, |m| {
            seen.push(m.payload);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(seen, vec![Bytes::from("b")]);
}
