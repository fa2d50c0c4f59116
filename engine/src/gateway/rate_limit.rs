use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// TokenBucket, the per-exchange request limiter
// ---------------------------------------------------------------------------

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every gateway instance of one exchange.
///
/// Acquisition never drops a request: when the bucket is empty the caller
/// is delayed until a token refills, which is how backpressure reaches the
/// strategy worker.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    pub fn new(max_per_minute: u32) -> Self {
        let max = f64::from(max_per_minute);
        Self {
            state: Mutex::new(BucketState {
                tokens: max,
                last_refill: Instant::now(),
            }),
            max_tokens: max,
            refill_rate: max / 60.0,
        }
    }

    /// Takes one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut s = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(s.last_refill).as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.refill_rate).min(self.max_tokens);
                s.last_refill = now;

                if s.tokens >= 1.0 {
                    s.tokens -= 1.0;
                    return;
                }
                // Time until the next whole token.
                Duration::from_secs_f64((1.0 - s.tokens) / self.refill_rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    #[cfg(test)]
    pub async fn available(&self) -> f64 {
        self.state.lock().await.tokens
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_within_capacity_is_immediate() {
        let bucket = TokenBucket::new(600);
        for _ in 0..10 {
            bucket.acquire().await;
        }
        assert!(bucket.available().await >= 589.0);
    }

    #[tokio::test]
    async fn test_empty_bucket_delays_instead_of_dropping() {
        tokio::time::pause();

        let bucket = TokenBucket::new(60); // 1 token per second
        for _ in 0..60 {
            bucket.acquire().await;
        }

        let start = Instant::now();
        bucket.acquire().await; // must wait ~1s for a refill
        let waited = start.elapsed();

        assert!(
            waited >= Duration::from_millis(900),
            "expected ~1s delay, waited {waited:?}"
        );
    }
}
