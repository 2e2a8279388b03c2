//! Shared outbound rate limiting
//!
//! One [`RateLimiter`] is shared (via `Arc`) by every lifecycle call in the
//! process. Each API family (URL authority) gets its own token bucket and
//! concurrency semaphore, so a 429 storm on one control plane does not stall
//! the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::Result;
use crate::executor::{Request, RequestExecutor, Response};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Sustained requests per second, per API family
    pub requests_per_second: u32,

    /// Maximum in-flight requests, per API family
    pub max_concurrent: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10,
            max_concurrent: 8,
        }
    }
}

impl RateLimitConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(tokens_per_second: u32) -> Self {
        let rate = f64::from(tokens_per_second.max(1));
        Self {
            tokens: rate,
            max_tokens: rate,
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    fn try_acquire(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
        }
    }
}

struct Family {
    semaphore: Arc<Semaphore>,
    bucket: TokenBucket,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    families: Mutex<HashMap<String, Family>>,
}

/// Held for the duration of one request; releases the concurrency slot on drop.
pub struct RateLimitGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            families: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn acquire(&self, family: &str) -> RateLimitGuard {
        if !self.config.enabled {
            return RateLimitGuard { _permit: None };
        }

        let semaphore = {
            let mut families = self.families.lock().await;
            let entry = families
                .entry(family.to_string())
                .or_insert_with(|| self.new_family());
            Arc::clone(&entry.semaphore)
        };
        // the semaphore is never closed
        let permit = semaphore.acquire_owned().await.ok();

        loop {
            let wait = {
                let mut families = self.families.lock().await;
                let entry = families
                    .entry(family.to_string())
                    .or_insert_with(|| self.new_family());
                entry.bucket.try_acquire().err()
            };
            match wait {
                None => {
                    trace!(family, "Rate limit token acquired");
                    return RateLimitGuard { _permit: permit };
                }
                Some(wait) => {
                    debug!(family, wait_ms = wait.as_millis() as u64, "Rate limited, waiting for token");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    fn new_family(&self) -> Family {
        Family {
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent.max(1) as usize)),
            bucket: TokenBucket::new(self.config.requests_per_second),
        }
    }
}

/// Wraps an executor so every request first takes a rate-limit slot.
pub struct RateLimitedExecutor<E> {
    inner: E,
    limiter: Arc<RateLimiter>,
    base_family: Option<String>,
}

impl<E> RateLimitedExecutor<E> {
    pub fn new(inner: E, limiter: Arc<RateLimiter>) -> Self {
        Self {
            inner,
            limiter,
            base_family: None,
        }
    }

    /// Base URL the inner executor resolves relative URLs against.
    ///
    /// Relative requests then share the budget of the base URL's host.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_family = Some(Request::get(base_url).family().to_string());
        self
    }

    fn family_of<'a>(&'a self, request: &'a Request) -> &'a str {
        match &self.base_family {
            Some(base) if !request.is_absolute() => base,
            _ => request.family(),
        }
    }
}

#[async_trait]
impl<E: RequestExecutor> RequestExecutor for RateLimitedExecutor<E> {
    async fn execute(&self, request: Request) -> Result<Response> {
        let _guard = self.limiter.acquire(self.family_of(&request)).await;
        self.inner.execute(request).await
    }
}
