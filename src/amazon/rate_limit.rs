//! Per-endpoint request pacing.
//!
//! Each endpoint class keeps its own last-call timestamp and minimum
//! interval. Waits are cancellable through the shared shutdown signal so
//! Ctrl-C interrupts even the 12-second inter-batch wait.

use crate::daemon::ShutdownSignal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Logical endpoint classes with independent quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Amazon Catalog getCatalogItem: official 0.5 s, +40% safety
    Catalog,
    /// Amazon getItemOffersBatch: official 10 s, +20% safety
    ItemOffersBatch,
    /// Amazon getPricingForAsins (optional path)
    PricingForAsins,
    /// BASE write endpoints
    BaseWrite,
}

const CATALOG_INTERVAL_SECS: f64 = 0.7;
const BATCH_INTERVAL_SECS: f64 = 12.0;
const PRICING_INTERVAL_SECS: f64 = 2.5;
const BASE_WRITE_INTERVAL_SECS: f64 = 0.1;

pub struct RateLimiter {
    intervals: HashMap<EndpointClass, Duration>,
    last_call: Mutex<HashMap<EndpointClass, Instant>>,
    shutdown: ShutdownSignal,
}

impl RateLimiter {
    /// Build with the default interval table, honoring the
    /// `SP_API_CATALOG_INTERVAL` / `SP_API_BATCH_INTERVAL` overrides.
    pub fn new(shutdown: ShutdownSignal) -> Self {
        let catalog = env_interval("SP_API_CATALOG_INTERVAL", CATALOG_INTERVAL_SECS);
        let batch = env_interval("SP_API_BATCH_INTERVAL", BATCH_INTERVAL_SECS);

        let mut intervals = HashMap::new();
        intervals.insert(EndpointClass::Catalog, catalog);
        intervals.insert(EndpointClass::ItemOffersBatch, batch);
        intervals.insert(
            EndpointClass::PricingForAsins,
            Duration::from_secs_f64(PRICING_INTERVAL_SECS),
        );
        intervals.insert(
            EndpointClass::BaseWrite,
            Duration::from_secs_f64(BASE_WRITE_INTERVAL_SECS),
        );

        Self {
            intervals,
            last_call: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn with_interval(
        class: EndpointClass,
        interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        let mut intervals = HashMap::new();
        intervals.insert(class, interval);
        Self {
            intervals,
            last_call: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn interval(&self, class: EndpointClass) -> Duration {
        self.intervals.get(&class).copied().unwrap_or(Duration::ZERO)
    }

    /// Enforce the minimum interval for `class`.
    ///
    /// Returns `true` once it is safe to issue the request. Returns
    /// `false` when the shutdown signal fired mid-wait; the caller must
    /// abort its current batch. The last-call stamp is only advanced on a
    /// completed wait.
    pub async fn wait(&self, class: EndpointClass) -> bool {
        let interval = self.interval(class);

        // Compute the needed delay under the lock; first call passes
        // straight through.
        let needed = {
            let mut last = self.last_call.lock();
            match last.get(&class) {
                None => {
                    last.insert(class, Instant::now());
                    return true;
                }
                Some(prev) => {
                    let elapsed = prev.elapsed();
                    if elapsed >= interval {
                        None
                    } else {
                        Some(interval - elapsed)
                    }
                }
            }
        };

        // Sleep outside the lock so concurrent callers and the signal
        // handler are not blocked.
        if let Some(needed) = needed {
            debug!(?class, "rate limit wait {:.2}s", needed.as_secs_f64());
            if !self.shutdown.sleep(needed).await {
                return false;
            }
        }

        self.last_call.lock().insert(class, Instant::now());
        true
    }
}

fn env_interval(var: &str, default_secs: f64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_does_not_wait() {
        let limiter = RateLimiter::with_interval(
            EndpointClass::ItemOffersBatch,
            Duration::from_secs(60),
            ShutdownSignal::new(),
        );
        let started = Instant::now();
        assert!(limiter.wait(EndpointClass::ItemOffersBatch).await);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn second_call_waits_for_the_interval() {
        let limiter = RateLimiter::with_interval(
            EndpointClass::Catalog,
            Duration::from_millis(80),
            ShutdownSignal::new(),
        );
        assert!(limiter.wait(EndpointClass::Catalog).await);
        let started = Instant::now();
        assert!(limiter.wait(EndpointClass::Catalog).await);
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_wait() {
        let shutdown = ShutdownSignal::new();
        let limiter = RateLimiter::with_interval(
            EndpointClass::ItemOffersBatch,
            Duration::from_secs(60),
            shutdown.clone(),
        );
        assert!(limiter.wait(EndpointClass::ItemOffersBatch).await);
        shutdown.trigger();
        assert!(!limiter.wait(EndpointClass::ItemOffersBatch).await);
    }

    #[test]
    fn default_intervals_match_the_quota_table() {
        let limiter = RateLimiter::new(ShutdownSignal::new());
        assert_eq!(
            limiter.interval(EndpointClass::ItemOffersBatch),
            Duration::from_secs_f64(12.0)
        );
        assert_eq!(
            limiter.interval(EndpointClass::Catalog),
            Duration::from_secs_f64(0.7)
        );
        assert_eq!(
            limiter.interval(EndpointClass::BaseWrite),
            Duration::from_secs_f64(0.1)
        );
    }
}
