use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window rate limiter.
///
/// `wait` holds the internal lock across its sleep, so concurrent waiters are
/// served one at a time and cannot starve once requests stop arriving.
pub struct Limiter {
    window: Duration,
    limit: usize,
    history: Mutex<Vec<Instant>>,
}

impl Limiter {
    pub fn new(window: Duration, limit: usize) -> Self {
        Limiter {
            window,
            limit,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Returns whether a request may proceed now, recording it if so.
    pub async fn allow(&self) -> bool {
        let mut history = self.history.lock().await;
        let now = Instant::now();
        self.slide(&mut history, now);

        if history.len() >= self.limit {
            return false;
        }

        history.push(now);
        true
    }

    /// Remaining request slots in the current window.
    pub async fn slots(&self) -> usize {
        let mut history = self.history.lock().await;
        let now = Instant::now();
        self.slide(&mut history, now);
        self.limit.saturating_sub(history.len())
    }

    /// Blocks until a slot frees up, then records the request. Cancel-safe:
    /// dropping the future abandons the wait without recording.
    pub async fn wait(&self) {
        let mut history = self.history.lock().await;

        // A slot is already available, no need to wait.
        if history.len() < self.limit {
            return;
        }

        self.slide(&mut history, Instant::now());
        if history.is_empty() || history.len() < self.limit {
            return;
        }

        // Next slot frees when the oldest record leaves the window.
        let next = history[0] + self.window;
        tokio::time::sleep_until(next).await;

        let now = Instant::now();
        self.slide(&mut history, now);
        history.push(now);
    }

    fn slide(&self, history: &mut Vec<Instant>, now: Instant) {
        if let Some(floor) = now.checked_sub(self.window) {
            history.retain(|t| *t > floor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn allow_refuses_over_limit() {
        let limiter = Limiter::new(Duration::from_secs(1), 3);

        for _ in 0..3 {
            assert!(limiter.allow().await);
        }
        assert!(!limiter.allow().await);
        assert_eq!(limiter.slots().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_eviction_frees_slots() {
        let limiter = Limiter::new(Duration::from_secs(1), 2);

        assert!(limiter.allow().await);
        assert!(limiter.allow().await);
        assert!(!limiter.allow().await);

        advance(Duration::from_millis(1100)).await;

        assert_eq!(limiter.slots().await, 2);
        assert!(limiter.allow().await);
    }

    #[tokio::test(start_paused = true)]
    async fn slots_counts_live_records() {
        let limiter = Limiter::new(Duration::from_secs(1), 5);
        assert_eq!(limiter.slots().await, 5);

        assert!(limiter.allow().await);
        assert!(limiter.allow().await);
        assert_eq!(limiter.slots().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_immediately_with_free_slot() {
        let limiter = Limiter::new(Duration::from_secs(1), 2);
        assert!(limiter.allow().await);

        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_oldest_record_expires() {
        let limiter = Limiter::new(Duration::from_secs(1), 1);
        assert!(limiter.allow().await);

        let before = Instant::now();
        // Paused time auto-advances to the sleep deadline.
        limiter.wait().await;
        assert_eq!(Instant::now() - before, Duration::from_secs(1));

        // The wait recorded its own request, so the window is full again.
        assert!(!limiter.allow().await);
    }

    #[tokio::test(start_paused = true)]
    async fn records_never_exceed_limit() {
        let limiter = Limiter::new(Duration::from_secs(1), 4);

        for _ in 0..10 {
            limiter.allow().await;
            advance(Duration::from_millis(100)).await;
        }

        let history = limiter.history.lock().await;
        assert!(history.len() <= 4);
    }
}
