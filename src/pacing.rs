use std::sync::atomic::Ordering::Relaxed;
use std::sync::{atomic::AtomicBool, Arc};
use tokio::time::Duration;

use leaky_bucket::RateLimiter;

const BACKOFF_DURATION: Duration = Duration::from_secs(60);

/// Global pacing shared by every credential: a minimum gap between calls and
/// a tokens-per-minute budget, plus a backoff latch flipped when the provider
/// reports rate exhaustion despite our own counters.
#[derive(Clone)]
pub struct Pacer {
    calls: Arc<RateLimiter>,
    tokens: Arc<RateLimiter>,
    backoff: Arc<AtomicBool>,
    backoff_duration: Duration,
}

impl Pacer {
    pub fn new(min_call_interval_ms: u64, tokens_per_minute: usize) -> Self {
        let calls = RateLimiter::builder()
            .initial(1)
            .interval(Duration::from_millis(min_call_interval_ms))
            .max(1)
            .refill(1)
            .build();

        // Smooth per-second drip rather than one refill per minute, to avoid
        // burst-then-starve cycles against the provider's sliding window.
        let tokens = RateLimiter::builder()
            .initial(tokens_per_minute / 2)
            .interval(Duration::from_secs(1))
            .max(tokens_per_minute)
            .refill(tokens_per_minute / 60 + 1)
            .build();

        Self {
            calls: Arc::new(calls),
            tokens: Arc::new(tokens),
            backoff: Arc::new(AtomicBool::new(false)),
            backoff_duration: BACKOFF_DURATION,
        }
    }

    pub async fn acquire_call(&self) {
        if self.backoff.load(Relaxed) {
            tokio::time::sleep(self.backoff_duration).await;
        }
        self.calls.acquire_one().await;
    }

    /// Acquire the estimated token usage before making an API call. An
    /// estimate above the bucket maximum would never complete, so it is
    /// clamped.
    pub async fn acquire_tokens(&self, estimated_tokens: usize) {
        if self.backoff.load(Relaxed) {
            tokio::time::sleep(self.backoff_duration).await;
        }
        self.tokens
            .acquire(estimated_tokens.min(self.tokens.max()))
            .await;
    }

    pub fn trigger_backoff(&self) {
        tracing::info!("Triggering backoff...");
        self.backoff.store(true, Relaxed);
        let self_ = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(self_.backoff_duration).await;
            tracing::info!("Backoff expired");
            self_.backoff.store(false, Relaxed);
        });
    }

    pub fn status(&self) -> String {
        let call_bucket = format!("{}/{}", self.calls.balance(), self.calls.max());
        let token_bucket = format!("{}/{}", self.tokens.balance(), self.tokens.max());
        if self.backoff.load(Relaxed) {
            format!("calls: {} tokens: {} (BACKOFF)", call_bucket, token_bucket)
        } else {
            format!("calls: {} tokens: {}", call_bucket, token_bucket)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_between_calls() {
        let pacer = Pacer::new(600, 1_000_000);

        let start = tokio::time::Instant::now();
        pacer.acquire_call().await;
        pacer.acquire_call().await;
        pacer.acquire_call().await;

        // First acquire is free; the next two each wait one interval.
        assert!(start.elapsed() >= Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_token_acquire_is_clamped() {
        let pacer = Pacer::new(1, 600);

        // Larger than the bucket max; must complete rather than park forever.
        pacer.acquire_tokens(10_000).await;
    }
}
