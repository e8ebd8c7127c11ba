//! Interruptible waits

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A re-armable stop flag whose waits wake as soon as it is triggered.
///
/// Every polling loop in the link and session layers sleeps through one of
/// these instead of `tokio::time::sleep`, so shutdown and suspension take
/// effect without waiting out the current interval.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the flag and wake every pending wait
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Clear the flag so the owning loop can run again
    pub fn rearm(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Sleep for `duration` unless triggered first.
    ///
    /// Returns `true` when the full duration elapsed, `false` when the wait
    /// was cut short (or the signal was already triggered).
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_triggered(),
            _ = rx.wait_for(|stopped| *stopped) => false,
        }
    }

    /// Wait until triggered
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_to_completion() {
        let signal = StopSignal::new();
        assert!(signal.sleep(Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_interrupts_sleep() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let started = tokio::time::Instant::now();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        signal.trigger();

        assert!(!handle.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_rearm_allows_sleep_again() {
        let signal = StopSignal::new();
        signal.trigger();
        assert!(!signal.sleep(Duration::from_millis(1)).await);
        signal.rearm();
        assert!(signal.sleep(Duration::from_millis(1)).await);
    }
}
