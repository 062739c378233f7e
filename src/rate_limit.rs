// ============================================================================
// Rate Limiting
// ============================================================================
// Pexels allows 200 requests/hour and 20,000 requests/month per key.
// Two layers keep us inside that budget:
//   - TokenBucket paces consecutive API calls locally
//   - Quota mirrors the X-Ratelimit-* headers reported by the server
// ============================================================================

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_HOURLY_LIMIT: u32 = 200;
/// Requests kept back from the hourly budget
pub const DEFAULT_RESERVE: u32 = 10;
/// Longest single wait the bucket will ask for
pub const MAX_WAIT: Duration = Duration::from_secs(3600);

// ============================================================================
// Token Bucket
// ============================================================================
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token at `now`, or report how long until one is available.
    pub fn try_acquire_at(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else if self.refill_per_sec <= 0.0 {
            Err(MAX_WAIT)
        } else {
            let missing = 1.0 - self.tokens;
            let wait = Duration::try_from_secs_f64(missing / self.refill_per_sec).unwrap_or(MAX_WAIT);
            Err(wait.min(MAX_WAIT))
        }
    }

    /// Block until a token is available. Returns the time spent waiting.
    pub fn acquire(&mut self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            match self.try_acquire_at(Instant::now()) {
                Ok(()) => return waited,
                Err(wait) => {
                    tracing::trace!(?wait, "rate limiter sleeping");
                    thread::sleep(wait);
                    waited += wait;
                }
            }
        }
    }
}

impl Default for TokenBucket {
    /// One request every 500ms with no burst
    fn default() -> Self {
        TokenBucket::new(1, 2.0)
    }
}

// ============================================================================
// Server-reported hourly quota
// ============================================================================
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

impl Default for Quota {
    fn default() -> Self {
        Quota {
            limit: DEFAULT_HOURLY_LIMIT,
            remaining: DEFAULT_HOURLY_LIMIT,
            reset_at: None,
        }
    }
}

impl Quota {
    /// Parse X-Ratelimit-Limit / -Remaining / -Reset. Returns None when the
    /// response carries no remaining count.
    pub fn from_headers(headers: &HeaderMap) -> Option<Quota> {
        let read = |name: &str| -> Option<i64> {
            headers.get(name)?.to_str().ok()?.trim().parse::<i64>().ok()
        };

        let remaining = read("X-Ratelimit-Remaining")?;
        let limit = read("X-Ratelimit-Limit").unwrap_or(DEFAULT_HOURLY_LIMIT as i64);
        let reset_at = read("X-Ratelimit-Reset").and_then(|ts| Utc.timestamp_opt(ts, 0).single());

        Some(Quota {
            limit: limit.clamp(0, u32::MAX as i64) as u32,
            remaining: remaining.clamp(0, u32::MAX as i64) as u32,
            reset_at,
        })
    }

    /// The quota as it stands at `now`: a passed reset time means a fresh window.
    pub fn effective(&self, now: DateTime<Utc>) -> Quota {
        match self.reset_at {
            Some(reset) if reset <= now => Quota {
                limit: self.limit,
                remaining: self.limit,
                reset_at: None,
            },
            _ => self.clone(),
        }
    }

    pub fn check(&self, reserve: u32, now: DateTime<Utc>) -> Result<()> {
        let current = self.effective(now);
        if current.remaining <= reserve {
            return Err(Error::QuotaExhausted {
                reset_at: current.reset_at,
            });
        }
        Ok(())
    }

    pub fn used(&self) -> u32 {
        self.limit.saturating_sub(self.remaining)
    }

    pub fn display(&self) -> String {
        let current = self.effective(Utc::now());
        let remaining = current.remaining;
        if remaining <= 20 {
            format!("Rate limit: {}/{} requests ({} remaining!)", current.used(), current.limit, remaining)
        } else {
            format!("Rate limit: {}/{} requests ({} remaining)", current.used(), current.limit, remaining)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_bucket_paces_after_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, 2.0);
        bucket.last_refill = start;

        assert!(bucket.try_acquire_at(start).is_ok());
        assert!(bucket.try_acquire_at(start).is_ok());
        let wait = bucket.try_acquire_at(start).unwrap_err();
        assert!(wait > Duration::from_millis(490) && wait <= Duration::from_millis(500));

        assert!(bucket.try_acquire_at(start + Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn test_bucket_wait_is_capped_for_tiny_rates() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, 1e-20);
        bucket.last_refill = start;

        assert!(bucket.try_acquire_at(start).is_ok());
        assert_eq!(bucket.try_acquire_at(start), Err(MAX_WAIT));

        let mut stalled = TokenBucket::new(1, 0.0);
        stalled.last_refill = start;
        stalled.try_acquire_at(start).unwrap();
        assert_eq!(stalled.try_acquire_at(start), Err(MAX_WAIT));
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, 10.0);
        bucket.last_refill = start;

        let later = start + Duration::from_secs(60);
        assert!(bucket.try_acquire_at(later).is_ok());
        assert!(bucket.try_acquire_at(later).is_err());
    }

    #[test]
    fn test_default_bucket_spacing() {
        // three back-to-back calls need at least one second
        let start = Instant::now();
        let mut bucket = TokenBucket::default();
        bucket.last_refill = start;
        let mut now = start;
        for _ in 0..3 {
            if let Err(wait) = bucket.try_acquire_at(now) {
                now += wait;
                bucket.try_acquire_at(now).unwrap();
            }
        }
        assert!(now - start >= Duration::from_millis(999));
    }

    #[test]
    fn test_quota_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Ratelimit-Limit", HeaderValue::from_static("20000"));
        headers.insert("X-Ratelimit-Remaining", HeaderValue::from_static("19684"));
        headers.insert("X-Ratelimit-Reset", HeaderValue::from_static("1700000000"));

        let quota = Quota::from_headers(&headers).unwrap();
        assert_eq!(quota.limit, 20000);
        assert_eq!(quota.remaining, 19684);
        assert_eq!(quota.reset_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(quota.used(), 316);

        assert!(Quota::from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_quota_check_and_reset() {
        let now = Utc::now();
        let exhausted = Quota {
            limit: 200,
            remaining: 5,
            reset_at: Some(now + chrono::Duration::minutes(20)),
        };
        assert!(matches!(
            exhausted.check(DEFAULT_RESERVE, now),
            Err(Error::QuotaExhausted { reset_at: Some(_) })
        ));
        assert!(exhausted.check(0, now).is_ok());

        // window has rolled over
        let later = now + chrono::Duration::minutes(21);
        assert!(exhausted.check(DEFAULT_RESERVE, later).is_ok());
        assert_eq!(exhausted.effective(later).remaining, 200);
    }
}
