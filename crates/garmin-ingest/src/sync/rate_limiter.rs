//! Shared request pacer for remote calls
//!
//! Every remote call of a run goes through one limiter, including the
//! sub-requests a source issues while fetching a single window.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::PacingConfig;

/// Which delay applies to the next call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    Normal,
    /// Cold-archive calls are served slower upstream and paced further apart
    Archived,
}

/// Thread-safe rate limiter shared between the engine and its sources
#[derive(Clone)]
pub struct SharedRateLimiter {
    /// Minimum delay between requests
    min_delay: Duration,
    /// Delay between archived-path requests
    archived_delay: Duration,
    /// Last request timestamp
    last_request: Arc<Mutex<Option<Instant>>>,
    /// Extra delay after throttling responses
    backoff: Arc<Mutex<Duration>>,
    /// Maximum backoff duration
    max_backoff: Duration,
    /// Consecutive throttled responses
    consecutive_throttles: Arc<AtomicU32>,
}

impl Default for SharedRateLimiter {
    fn default() -> Self {
        Self::new(&PacingConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SharedRateLimiter {
    pub fn new(pacing: &PacingConfig) -> Self {
        Self {
            min_delay: pacing.min_delay(),
            archived_delay: pacing.archived_delay(),
            last_request: Arc::new(Mutex::new(None)),
            backoff: Arc::new(Mutex::new(Duration::ZERO)),
            max_backoff: Duration::from_secs(300),
            consecutive_throttles: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self::new(&PacingConfig::none())
    }

    fn delay_for(&self, pace: Pace) -> Duration {
        match pace {
            Pace::Normal => self.min_delay,
            Pace::Archived => self.archived_delay,
        }
    }

    /// Wait until the next call may be issued, then claim the slot
    pub async fn wait(&self, pace: Pace) {
        let required_delay = {
            let last = lock(&self.last_request);
            let backoff = *lock(&self.backoff);
            match *last {
                Some(last) => {
                    let required = self.delay_for(pace) + backoff;
                    required.saturating_sub(last.elapsed())
                }
                None => Duration::ZERO,
            }
        };

        if !required_delay.is_zero() {
            log::trace!("Pacing: waiting {:?}", required_delay);
            tokio::time::sleep(required_delay).await;
        }

        *lock(&self.last_request) = Some(Instant::now());
    }

    /// Handle a successful request - reset backoff
    pub fn on_success(&self) {
        *lock(&self.backoff) = Duration::ZERO;
        self.consecutive_throttles.store(0, Ordering::Relaxed);
    }

    /// Handle a throttled or transient failure - increase backoff
    pub fn on_throttle(&self) {
        self.consecutive_throttles.fetch_add(1, Ordering::Relaxed);
        let mut backoff = lock(&self.backoff);
        let new_backoff = (*backoff * 2).max(Duration::from_secs(1));
        *backoff = new_backoff.min(self.max_backoff);
    }

    /// Get the current backoff duration
    pub fn current_backoff(&self) -> Duration {
        *lock(&self.backoff)
    }

    pub fn consecutive_throttles(&self) -> u32 {
        self.consecutive_throttles.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacing(min: u64, archived: u64) -> PacingConfig {
        PacingConfig {
            min_delay_ms: min,
            archived_delay_ms: archived,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let limiter = SharedRateLimiter::default();

        limiter.on_throttle();
        assert_eq!(limiter.current_backoff(), Duration::from_secs(1));
        limiter.on_throttle();
        assert_eq!(limiter.current_backoff(), Duration::from_secs(2));
        limiter.on_throttle();
        assert_eq!(limiter.current_backoff(), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_max() {
        let limiter = SharedRateLimiter::default();
        for _ in 0..20 {
            limiter.on_throttle();
        }
        assert!(limiter.current_backoff() <= Duration::from_secs(300));
    }

    #[test]
    fn test_reset_on_success() {
        let limiter = SharedRateLimiter::default();
        limiter.on_throttle();
        limiter.on_throttle();
        limiter.on_success();
        assert_eq!(limiter.current_backoff(), Duration::ZERO);
        assert_eq!(limiter.consecutive_throttles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_does_not_wait() {
        let limiter = SharedRateLimiter::new(&pacing(2000, 10_000));
        let start = Instant::now();
        limiter.wait(Pace::Normal).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_spacing() {
        let limiter = SharedRateLimiter::new(&pacing(2000, 10_000));
        let start = Instant::now();
        limiter.wait(Pace::Normal).await;
        limiter.wait(Pace::Normal).await;
        limiter.wait(Pace::Normal).await;
        assert!(start.elapsed() >= Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_archived_calls_spaced_further() {
        let limiter = SharedRateLimiter::new(&pacing(2000, 10_000));
        limiter.wait(Pace::Normal).await;
        let start = Instant::now();
        limiter.wait(Pace::Archived).await;
        assert!(start.elapsed() >= Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_state() {
        let limiter = SharedRateLimiter::new(&pacing(1000, 1000));
        let source_side = limiter.clone();
        let start = Instant::now();
        limiter.wait(Pace::Normal).await;
        source_side.wait(Pace::Normal).await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }
}
