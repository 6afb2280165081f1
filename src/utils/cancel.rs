//! Cooperative cancellation.
//!
//! A `CancelHandle` flips a watch channel; every `CancelSignal` cloned from the
//! pair observes it. Dropping the handle without cancelling leaves signals
//! pending forever.

use std::future::Future;

use tokio::sync::watch;

/// Sending side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    cancel: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation to every receiver.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Receiving side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    cancel: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Whether cancellation has already been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.cancel.borrow_and_update() {
                return;
            }
            if self.cancel.changed().await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked cancellation handle and signal.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    (
        CancelHandle { cancel: cancel_tx },
        CancelSignal { cancel: cancel_rx },
    )
}

/// Run `fut` until it completes or `signal` fires.
///
/// Returns `None` when cancelled; `fut` is dropped at its current suspend point.
pub async fn run_until_cancelled<F: Future>(signal: &mut CancelSignal, fut: F) -> Option<F::Output> {
    if signal.is_cancelled() {
        return None;
    }
    tokio::select! {
        biased;
        _ = signal.cancelled() => None,
        output = fut => Some(output),
    }
}
