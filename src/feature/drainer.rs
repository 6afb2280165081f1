//! Subject replay through an ephemeral push consumer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::FeatureOptions;
use crate::consumer::{AckPolicy, ConsumerConfig, DeliverPolicy, PushSubscribeOptions};
use crate::kv::{KvError, Result};
use crate::log::{LogMessage, MessageLog, PushSubscription};
use crate::utils::cancel::{run_until_cancelled, CancelSignal};

/// Replays the messages of a subject to a visitor.
///
/// The pending count reported at subscription time is only a hint: messages
/// can be removed or added while the replay runs. Draining therefore stops
/// when the count reaches zero or when two receives in a row time out,
/// whichever comes first. The subscription is released on every exit path.
#[derive(Clone)]
pub struct ReplayDrainer {
    log: Arc<dyn MessageLog>,
    stream_name: String,
    timeout: Duration,
}

impl ReplayDrainer {
    pub fn new(
        log: Arc<dyn MessageLog>,
        stream_name: impl Into<String>,
        options: FeatureOptions,
    ) -> Self {
        Self {
            log,
            stream_name: stream_name.into(),
            timeout: options.default_timeout,
        }
    }

    /// Wait applied to each receive.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Visit every pending message on `subject` in arrival order.
    ///
    /// Returns the number of messages visited. An error returned by `visit`
    /// stops the replay and is returned once the subscription is released.
    pub async fn drain<F>(
        &self,
        subject: &str,
        deliver_policy: DeliverPolicy,
        headers_only: bool,
        ordered: bool,
        visit: F,
    ) -> Result<u64>
    where
        F: FnMut(LogMessage) -> Result<()> + Send,
    {
        self.drain_inner(subject, deliver_policy, headers_only, ordered, visit, None)
            .await
    }

    /// Same as [`drain`](Self::drain), stopping with `KvError::Cancelled`
    /// when `cancel` fires.
    pub async fn drain_with_cancel<F>(
        &self,
        subject: &str,
        deliver_policy: DeliverPolicy,
        headers_only: bool,
        ordered: bool,
        visit: F,
        cancel: &mut CancelSignal,
    ) -> Result<u64>
    where
        F: FnMut(LogMessage) -> Result<()> + Send,
    {
        self.drain_inner(
            subject,
            deliver_policy,
            headers_only,
            ordered,
            visit,
            Some(cancel),
        )
        .await
    }

    async fn drain_inner<F>(
        &self,
        subject: &str,
        deliver_policy: DeliverPolicy,
        headers_only: bool,
        ordered: bool,
        visit: F,
        cancel: Option<&mut CancelSignal>,
    ) -> Result<u64>
    where
        F: FnMut(LogMessage) -> Result<()> + Send,
    {
        let options = PushSubscribeOptions::builder()
            .stream(&self.stream_name)
            .ordered(ordered)
            .configuration(
                ConsumerConfig::builder()
                    .ack_policy(AckPolicy::None)
                    .deliver_policy(deliver_policy)
                    .headers_only(headers_only)
                    .build(),
            )
            .build()?;

        let subscription = self.log.push_subscribe(subject, options).await?;
        let mut guard = SubscriptionGuard::new(subject, subscription);

        let result = match guard.subscription() {
            Some(subscription) => {
                visit_pending(subscription, self.timeout, visit, cancel).await
            }
            None => Ok(0),
        };

        guard.release().await;

        if let Ok(visited) = &result {
            debug!(subject = %subject, visited = visited, "Drained subject");
        }
        result
    }
}

async fn visit_pending<F>(
    subscription: &mut dyn PushSubscription,
    timeout: Duration,
    mut visit: F,
    mut cancel: Option<&mut CancelSignal>,
) -> Result<u64>
where
    F: FnMut(LogMessage) -> Result<()> + Send,
{
    let mut pending = subscription.pending();
    let mut visited = 0;
    let mut last_timed_out = false;

    while pending > 0 {
        let received = match cancel.as_deref_mut() {
            Some(signal) => run_until_cancelled(signal, subscription.next_message(timeout))
                .await
                .ok_or(KvError::Cancelled)?,
            None => subscription.next_message(timeout).await,
        };

        match received? {
            Some(message) => {
                visit(message)?;
                visited += 1;
                pending -= 1;
                if pending == 0 {
                    break;
                }
                last_timed_out = false;
            }
            None => {
                // Two timeouts in a row: nothing more is coming
                if last_timed_out {
                    debug!(
                        unvisited = pending,
                        "Replay stopped after consecutive timeouts"
                    );
                    break;
                }
                last_timed_out = true;
            }
        }
    }

    Ok(visited)
}

/// Owns a subscription and guarantees it is released exactly once.
///
/// `release` is the normal path. If the guard is dropped first (the drain
/// future was cancelled mid-receive), the release is spawned onto the
/// current runtime.
struct SubscriptionGuard {
    subject: String,
    subscription: Option<Box<dyn PushSubscription>>,
}

impl SubscriptionGuard {
    fn new(subject: &str, subscription: Box<dyn PushSubscription>) -> Self {
        Self {
            subject: subject.to_string(),
            subscription: Some(subscription),
        }
    }

    fn subscription(&mut self) -> Option<&mut (dyn PushSubscription + 'static)> {
        self.subscription.as_deref_mut()
    }

    async fn release(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            unsubscribe(&self.subject, subscription.as_mut()).await;
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Some(mut subscription) = self.subscription.take() else {
            return;
        };
        let subject = std::mem::take(&mut self.subject);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    unsubscribe(&subject, subscription.as_mut()).await;
                });
            }
            Err(_) => {
                warn!(subject = %subject, "Subscription dropped outside a runtime, not released");
            }
        }
    }
}

async fn unsubscribe(subject: &str, subscription: &mut dyn PushSubscription) {
    if let Err(e) = subscription.unsubscribe().await {
        warn!(subject = %subject, error = %e, "Failed to release replay subscription");
    }
}

#[cfg(test)]
mod tests;
