//! Keyed sliding-window rate limiter
//!
//! An injectable store rather than a module-level global; the API server
//! builds one per concern (contact form, public page) and keys it by
//! slug/endpoint/client-IP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
}

/// Sliding-window limiter over arbitrary string keys
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, Vec<Instant>>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    /// Record a request against `key` and report whether it is allowed.
    ///
    /// Timestamps outside the window are pruned on every check so the store
    /// stays bounded by active keys.
    pub async fn check(&self, key: &str) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        let timestamps = windows.entry(key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.max_requests as usize {
            return RateLimitResult {
                allowed: false,
                remaining: 0,
            };
        }

        timestamps.push(now);
        RateLimitResult {
            allowed: true,
            remaining: self.max_requests - timestamps.len() as u32,
        }
    }

    /// Compose a stable key from tenant slug, endpoint and client address
    pub fn make_key(slug: &str, endpoint: &str, client_ip: &str) -> String {
        format!("{slug}:{endpoint}:{client_ip}")
    }
}
