//! Per-caller request limiting for the execution endpoints.
//!
//! [`KeyedRateLimiter`] is a keyed GCRA bucket from `governor`: each caller
//! key may burst up to `requests_per_minute` requests, and capacity refills
//! evenly over the minute.

use std::num::NonZeroU32;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};

use cs_domain::config::RateLimitConfig;
use cs_domain::error::{Error, Result};

/// Prune idle keys once the state map grows past this.
const PRUNE_THRESHOLD: usize = 1024;

/// Admission check run before a request is accepted.
pub trait RateLimiter: Send + Sync {
    /// `Ok(())` admits the request and counts it; otherwise
    /// [`Error::RateLimited`] carries the seconds until a request fits.
    fn check(&self, key: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KeyedRateLimiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct KeyedRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
}

impl KeyedRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        Self::per_minute(config.requests_per_minute)
    }

    pub fn per_minute(requests: u32) -> Result<Self> {
        let requests = NonZeroU32::new(requests).ok_or_else(|| {
            Error::Config("rate_limit.requests_per_minute must be greater than 0".into())
        })?;
        Ok(Self {
            limiter: governor::RateLimiter::keyed(Quota::per_minute(requests)),
            clock: DefaultClock::default(),
        })
    }
}

impl RateLimiter for KeyedRateLimiter {
    fn check(&self, key: &str) -> Result<()> {
        if self.limiter.len() > PRUNE_THRESHOLD {
            self.limiter.retain_recent();
        }

        match self.limiter.check_key(&key.to_owned()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                let retry_after_secs = (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1);
                tracing::debug!(key, retry_after_secs, "rate limit exceeded");
                Err(Error::RateLimited { retry_after_secs })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_burst_then_rejects_with_retry_after() {
        let limiter = KeyedRateLimiter::per_minute(2).unwrap();
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_ok());
        match limiter.check("a") {
            // One cell refills every 30 s.
            Err(Error::RateLimited { retry_after_secs }) => {
                assert!((1..=30).contains(&retry_after_secs), "{retry_after_secs}")
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        // Keys are independent.
        assert!(limiter.check("b").is_ok());
    }

    #[test]
    fn zero_limit_is_a_config_error() {
        assert!(matches!(
            KeyedRateLimiter::per_minute(0),
            Err(Error::Config(_))
        ));
    }
}
