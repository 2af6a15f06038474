//! Cancellable time budget shared by the polling phases of `try_lock`.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A point in time after which an operation gives up, plus a token that
/// ends it early.
#[derive(Clone, Debug)]
pub struct Deadline {
    expires_at: Instant,
    cancellation: CancellationToken,
}

impl Deadline {
    /// Creates a deadline `budget` from now.
    #[must_use]
    pub fn after(budget: Duration, cancellation: CancellationToken) -> Self {
        Self {
            expires_at: Instant::now() + budget,
            cancellation,
        }
    }

    /// Time left before expiry; zero once expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Whether the operation was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Whether the budget is used up or the operation was cancelled.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || self.remaining().is_zero()
    }

    /// Sleeps for `interval`, cut short by expiry or cancellation.
    ///
    /// Returns `true` if there is budget left to poll again.
    pub async fn sleep(&self, interval: Duration) -> bool {
        let wake_at = (Instant::now() + interval).min(self.expires_at);

        tokio::select! {
            () = self.cancellation.cancelled() => false,
            () = tokio::time::sleep_until(wake_at) => !self.is_expired(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_within_budget() {
        let deadline = Deadline::after(Duration::from_secs(5), CancellationToken::new());

        assert!(deadline.sleep(Duration::from_millis(10)).await);
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_stops_at_expiry() {
        let deadline = Deadline::after(Duration::from_millis(30), CancellationToken::new());
        let started = Instant::now();

        assert!(!deadline.sleep(Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancellation_wakes_sleep() {
        let token = CancellationToken::new();
        let deadline = Deadline::after(Duration::from_secs(5), token.child_token());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        assert!(!deadline.sleep(Duration::from_secs(5)).await);
        assert!(deadline.is_cancelled());
        assert!(deadline.is_expired());
        canceller.await.unwrap();
    }
}
