use std::time::Instant;

/// Token bucket limiting relayed bytes per allocation.
///
/// Holds at most one second of budget, refilled continuously.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket allowing `bytes_per_sec`, starting full
    pub fn new(bytes_per_sec: u64, now: Instant) -> Self {
        let max_tokens = bytes_per_sec as f64;
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate: max_tokens,
            last_refill: now,
        }
    }

    /// Take `amount` tokens if available
    pub fn consume_tokens(&mut self, amount: usize, now: Instant) -> bool {
        self.refill(now);

        let amount = amount as f64;
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();

        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bucket_drains_and_refills() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1000, start);

        assert!(bucket.consume_tokens(600, start));
        assert!(!bucket.consume_tokens(600, start));

        let later = start + Duration::from_millis(500);
        assert!(bucket.consume_tokens(600, later));
    }

    #[test]
    fn test_bucket_caps_at_one_second() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100, start);

        let much_later = start + Duration::from_secs(60);
        assert!(!bucket.consume_tokens(101, much_later));
        assert!(bucket.consume_tokens(100, much_later));
    }
}
