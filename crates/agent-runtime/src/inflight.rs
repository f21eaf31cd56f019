//! Outstanding-work accounting for the drain barrier
//!
//! Every envelope holds an [`InFlightGuard`] from the moment it is queued
//! until its handler finishes or it is rejected. The runtime is idle when no
//! guard is alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
struct Shared {
    count: AtomicUsize,
    idle: Notify,
}

/// Counter of queued and executing messages
#[derive(Default)]
pub(crate) struct InFlight {
    shared: Arc<Shared>,
}

impl InFlight {
    /// Account for one more message
    pub(crate) fn enter(&self) -> InFlightGuard {
        self.shared.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            shared: self.shared.clone(),
        }
    }

    /// Number of messages currently queued or executing
    pub(crate) fn count(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// Wait until no message is queued or executing
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent drop cannot be missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guard that decrements the in-flight count on drop
pub(crate) struct InFlightGuard {
    shared: Arc<Shared>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.shared.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_when_empty() {
        let in_flight = InFlight::default();
        in_flight.wait_idle().await;
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_guards() {
        let in_flight = InFlight::default();
        let first = in_flight.enter();
        let second = in_flight.enter();
        assert_eq!(in_flight.count(), 2);

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(first);
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(second);
        });

        in_flight.wait_idle().await;
        assert_eq!(in_flight.count(), 0);
        release.await.unwrap();
    }
}
