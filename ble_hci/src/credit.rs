//! Per-connection-handle ACL write-credit tracking, generalized from a
//! single bounded semaphore (one fixed connection) to a small map of
//! bounded counters keyed by connection handle — this stack drives many
//! simultaneous LE links, so Number-Of-Completed-Packets accounting must
//! be attributed per handle rather than globally.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::Notify;

const DEFAULT_INITIAL_CREDITS: u16 = 4;

struct HandleCredit {
    available: u16,
    max: u16,
}

/// Tracks outstanding ACL write credits per connection handle. A write
/// acquires one credit (blocking until available); `Number Of Completed
/// Packets` events return credits, clamped to the handle's negotiated max.
pub struct CreditTracker {
    handles: Mutex<HashMap<u16, HandleCredit>>,
    notify: Notify,
}

impl Default for CreditTracker {
    fn default() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }
}

impl CreditTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle (on ConnectionComplete) with its initial credit
    /// allotment; a subsequent registration resets it.
    pub fn register(&self, handle: u16, max: u16) {
        let max = if max == 0 { DEFAULT_INITIAL_CREDITS } else { max };
        self.handles.lock().unwrap().insert(
            handle,
            HandleCredit {
                available: max,
                max,
            },
        );
        self.notify.notify_waiters();
    }

    /// Drops tracking for a handle (on DisconnectionComplete).
    pub fn unregister(&self, handle: u16) {
        self.handles.lock().unwrap().remove(&handle);
        self.notify.notify_waiters();
    }

    /// Adds completed-packet credits back, clamped to the handle's max.
    /// Unknown handles are ignored: the event may race a just-removed
    /// connection.
    pub fn complete(&self, handle: u16, count: u16) {
        let mut handles = self.handles.lock().unwrap();
        if let Some(credit) = handles.get_mut(&handle) {
            credit.available = credit.available.saturating_add(count).min(credit.max);
        }
        drop(handles);
        self.notify.notify_waiters();
    }

    /// Waits for and consumes one write credit on `handle`. Returns `false`
    /// if the handle is not (or no longer) tracked.
    pub async fn acquire(&self, handle: u16) -> bool {
        loop {
            {
                let mut handles = self.handles.lock().unwrap();
                match handles.get_mut(&handle) {
                    None => return false,
                    Some(credit) if credit.available > 0 => {
                        credit.available -= 1;
                        return true;
                    }
                    Some(_) => {}
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn available(&self, handle: u16) -> Option<u16> {
        self.handles.lock().unwrap().get(&handle).map(|c| c.available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_blocks_until_credit_returned() {
        let tracker = CreditTracker::new();
        tracker.register(1, 1);
        assert!(tracker.acquire(1).await);
        assert_eq!(tracker.available(1), Some(0));

        let tracker = std::sync::Arc::new(tracker);
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.acquire(1).await }
        });
        tokio::task::yield_now().await;
        tracker.complete(1, 1);
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn complete_clamps_to_negotiated_max() {
        let tracker = CreditTracker::new();
        tracker.register(2, 4);
        tracker.complete(2, 100);
        assert_eq!(tracker.available(2), Some(4));
    }

    #[tokio::test]
    async fn acquire_on_unknown_handle_returns_false() {
        let tracker = CreditTracker::new();
        assert!(!tracker.acquire(99).await);
    }
}
