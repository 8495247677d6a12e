//! Per-client token bucket rate limiting

use axum::http::HeaderMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::session::{spawn_sweeper, SweeperHandle};

/// Seconds a rejected client is told to wait
pub const RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Token bucket per client IP. `capacity` tokens refill linearly over
/// `window`; each request costs one token.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: u32,
    window: Duration,
}

impl RateLimiter {
    /// `capacity` requests per minute
    pub fn new(capacity: u32) -> Self {
        Self::with_window(capacity, Duration::from_secs(60))
    }

    pub fn with_window(capacity: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            window,
        }
    }

    /// Take a token for `client`, returning false when the bucket is empty
    pub fn allow(&self, client: &str) -> bool {
        self.allow_at(client, Instant::now())
    }

    pub fn allow_at(&self, client: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();

        let bucket = match buckets.get_mut(client) {
            Some(bucket) => bucket,
            None => {
                buckets.insert(
                    client.to_string(),
                    Bucket {
                        tokens: self.capacity - 1,
                        last_refill: now,
                    },
                );
                return true;
            }
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refill = elapsed.as_millis() * u128::from(self.capacity)
            / self.window.as_millis().max(1);

        // Partial tokens carry over: the refill clock only moves when at
        // least one whole token was added.
        if refill > 0 {
            let tokens = (u128::from(bucket.tokens) + refill).min(u128::from(self.capacity));
            bucket.tokens = tokens as u32;
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Drop buckets untouched for a whole window. Such a bucket would have
    /// refilled to capacity, so forgetting it changes no decision.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            now.saturating_duration_since(bucket.last_refill) < self.window
        });
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep idle buckets once per window until the handle is stopped or
    /// dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let limiter = Arc::clone(self);
        spawn_sweeper("rate limit buckets", self.window, move || {
            limiter.sweep_at(Instant::now())
        })
    }
}

/// Identify the client: first `X-Forwarded-For` entry, then `X-Real-IP`,
/// then the peer address without its port.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.contains(' '))
    {
        return first.to_string();
    }

    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
