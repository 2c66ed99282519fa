use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Token-bucket rate limiter: capacity `C`, refill `R` tokens/sec.
/// Grants in any interval of length `T` never exceed `C + R·T`.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `refill_rate` must be positive; a non-positive rate is clamped to a
    /// minimal trickle so `acquire` can always make progress.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            capacity,
            refill_rate: refill_rate.max(0.001),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Take one token, suspending cooperatively until one is available.
    /// The lock is never held across the sleep.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token without waiting. Returns false when the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_without_waiting() {
        let bucket = TokenBucket::new(5.0, 1.0);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1.0, 2.0);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        // 2 tokens/sec → ~500ms for the next token
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(450), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(600), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn grants_bounded_by_capacity_plus_refill() {
        let capacity = 5.0;
        let rate = 2.0;
        let bucket = TokenBucket::new(capacity, rate);
        let window = Duration::from_secs(10);

        let start = Instant::now();
        let mut granted = 0u32;
        while start.elapsed() < window {
            bucket.acquire().await;
            granted += 1;
        }

        let elapsed = start.elapsed().as_secs_f64();
        let bound = capacity + rate * elapsed;
        assert!(
            (granted as f64) <= bound + 1.0,
            "granted {granted} exceeds bound {bound}"
        );
        // And the limiter is not wildly conservative either.
        assert!(granted >= 20, "granted only {granted}");
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_rejects_when_empty() {
        let bucket = TokenBucket::new(2.0, 1.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        // After a second, one token is back.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(3.0, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        let mut granted = 0;
        while bucket.try_acquire() {
            granted += 1;
        }
        assert_eq!(granted, 3);
    }
}
