//! Async wait-for-final-status on top of a notifier subscription.

use crate::error::{BusError, Result};
use crate::notifier::{ListenerId, StatusNotifier};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokenkeep_core::{StatusEvent, TxStatus};
use tokio::sync::Notify;

#[derive(Default)]
struct WaiterState {
    /// Final events observed so far, by tx id.
    finals: HashMap<String, StatusEvent>,
    /// Wakeups for tasks parked on a tx id.
    parked: HashMap<String, Arc<Notify>>,
}

/// Lets async tasks wait until a transaction reaches a final status
/// (confirmed or deleted). Non-final events are ignored.
pub struct StatusWaiter {
    notifier: StatusNotifier,
    listener: ListenerId,
    state: Arc<Mutex<WaiterState>>,
}

impl StatusWaiter {
    pub fn new(notifier: &StatusNotifier) -> Self {
        let state: Arc<Mutex<WaiterState>> = Arc::new(Mutex::new(WaiterState::default()));
        let listener = {
            let state = state.clone();
            notifier.subscribe_fn(move |event| {
                if !matches!(event.status, TxStatus::Confirmed | TxStatus::Deleted) {
                    return;
                }
                let mut state = state.lock();
                state.finals.insert(event.tx_id.clone(), event.clone());
                if let Some(notify) = state.parked.remove(&event.tx_id) {
                    notify.notify_waiters();
                }
            })
        };
        Self {
            notifier: notifier.clone(),
            listener,
            state,
        }
    }

    /// Wait until `tx_id` reaches a final status, or time out.
    pub async fn wait_final(&self, tx_id: &str, timeout: Duration) -> Result<StatusEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = {
                let mut state = self.state.lock();
                if let Some(event) = state.finals.get(tx_id) {
                    return Ok(event.clone());
                }
                state
                    .parked
                    .entry(tx_id.to_string())
                    .or_insert_with(|| Arc::new(Notify::new()))
                    .clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            // register interest before the re-check so an event landing
            // between the lock drop and the await cannot be missed
            notified.as_mut().enable();
            if let Some(event) = self.state.lock().finals.get(tx_id) {
                return Ok(event.clone());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BusError::WaitTimeout(tx_id.to_string()));
            }
        }
    }
}

impl Drop for StatusWaiter {
    fn drop(&mut self) {
        self.notifier.unsubscribe(self.listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tx_id: &str, status: TxStatus) -> StatusEvent {
        StatusEvent {
            tx_id: tx_id.to_string(),
            status,
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn wait_resolves_on_final_status() {
        let notifier = StatusNotifier::new();
        let waiter = Arc::new(StatusWaiter::new(&notifier));

        let waiter_task = waiter.clone();
        let handle = tokio::spawn(async move {
            waiter_task
                .wait_final("t1", Duration::from_secs(1))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.notify(&event("t1", TxStatus::Pending)); // ignored
        notifier.notify(&event("t1", TxStatus::Confirmed));

        let resolved = handle.await.unwrap();
        assert_eq!(resolved.status, TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let notifier = StatusNotifier::new();
        let waiter = StatusWaiter::new(&notifier);
        let err = waiter
            .wait_final("never", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::WaitTimeout(_)));
    }

    #[tokio::test]
    async fn final_status_before_wait_resolves_immediately() {
        let notifier = StatusNotifier::new();
        let waiter = StatusWaiter::new(&notifier);
        notifier.notify(&event("t1", TxStatus::Deleted));
        let resolved = waiter
            .wait_final("t1", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(resolved.status, TxStatus::Deleted);
    }
}
