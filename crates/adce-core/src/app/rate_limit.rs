//! Per-source token-bucket rate limiting.
//!
//! One `governor` direct limiter per source, so sources never contend on
//! a shared lock. Sources without a limiter are unlimited.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::debug;

use crate::config::SourceConfig;
use crate::domain::SourceId;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Default, Clone)]
pub struct RateLimiters {
    limiters: HashMap<SourceId, Arc<DirectLimiter>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config<'a>(sources: impl IntoIterator<Item = (&'a String, &'a SourceConfig)>) -> Self {
        let mut limiters = Self::new();
        for (name, config) in sources {
            limiters.set(SourceId::new(name), config.rate_per_second, config.burst);
        }
        limiters
    }

    /// Configure `source` with `rate_per_second` refill and `burst` capacity.
    /// A rate of 0 removes the limiter.
    pub fn set(&mut self, source: SourceId, rate_per_second: f64, burst: u32) {
        match quota(rate_per_second, burst) {
            Some(quota) => {
                debug!(source = %source, rate_per_second, burst, "rate limiter configured");
                self.limiters.insert(source, Arc::new(RateLimiter::direct(quota)));
            }
            None => {
                self.limiters.remove(&source);
            }
        }
    }

    pub fn is_limited(&self, source: &SourceId) -> bool {
        self.limiters.contains_key(source)
    }

    /// Wait up to `timeout` for one permit. `false` means not granted.
    pub async fn acquire(&self, source: &SourceId, timeout: Duration) -> bool {
        let Some(limiter) = self.limiters.get(source) else {
            return true;
        };
        if limiter.check().is_ok() {
            return true;
        }
        tokio::time::timeout(timeout, limiter.until_ready())
            .await
            .is_ok()
    }
}

fn quota(rate_per_second: f64, burst: u32) -> Option<Quota> {
    if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
        return None;
    }
    let period = Duration::from_secs_f64(1.0 / rate_per_second);
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    Quota::with_period(period).map(|q| q.allow_burst(burst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn unknown_source_is_unlimited() {
        let limiters = RateLimiters::new();
        let source = SourceId::new("espn");
        for _ in 0..100 {
            assert!(limiters.acquire(&source, Duration::ZERO).await);
        }
    }

    #[tokio::test]
    async fn burst_is_granted_then_refused_without_wait() {
        let mut limiters = RateLimiters::new();
        let source = SourceId::new("espn");
        limiters.set(source.clone(), 0.1, 2);

        assert!(limiters.acquire(&source, Duration::ZERO).await);
        assert!(limiters.acquire(&source, Duration::ZERO).await);
        assert!(!limiters.acquire(&source, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn permit_arrives_after_refill() {
        let mut limiters = RateLimiters::new();
        let source = SourceId::new("espn");
        limiters.set(source.clone(), 10.0, 1);

        assert!(limiters.acquire(&source, Duration::ZERO).await);
        let started = Instant::now();
        assert!(limiters.acquire(&source, Duration::from_secs(1)).await);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn zero_rate_disables_limiting() {
        let mut limiters = RateLimiters::new();
        let source = SourceId::new("espn");
        limiters.set(source.clone(), 1.0, 1);
        assert!(limiters.is_limited(&source));

        limiters.set(source.clone(), 0.0, 1);
        assert!(!limiters.is_limited(&source));
    }

    #[test]
    fn sources_are_independent() {
        let mut sources = std::collections::BTreeMap::new();
        sources.insert("espn".to_string(), SourceConfig { rate_per_second: 1.0, burst: 1, url_template: None });
        sources.insert("nba".to_string(), SourceConfig { rate_per_second: 0.0, burst: 1, url_template: None });

        let limiters = RateLimiters::from_config(&sources);
        assert!(limiters.is_limited(&SourceId::new("espn")));
        assert!(!limiters.is_limited(&SourceId::new("nba")));
    }
}
