//! Fixed-window admission limiter
//!
//! Guards the inbound message path (keyed by peer id) and room joins (keyed by
//! room code). Callers drop whatever is rejected; the limiter never errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::{DEFAULT_JOIN_LIMIT, DEFAULT_MESSAGE_LIMIT};

/// Rate limiter configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Admissions allowed per window
    pub limit: u32,
    /// Window length
    pub window: Duration,
}

impl RateLimiterConfig {
    /// 20 inbound messages per second per peer
    pub fn messages() -> Self {
        Self {
            limit: DEFAULT_MESSAGE_LIMIT,
            window: Duration::from_secs(1),
        }
    }

    /// 5 join attempts per minute per room code
    pub fn joins() -> Self {
        Self {
            limit: DEFAULT_JOIN_LIMIT,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::messages()
    }
}

/// Window state for a single key
#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Per-key fixed-window counter
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    entries: Arc<RwLock<HashMap<String, Window>>>,
}

impl RateLimiter {
    /// Create a new rate limiter with the message policy
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    pub fn with_config(config: RateLimiterConfig) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admit one event for `key`
    ///
    /// Returns `false` once the key has used up its window.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock reading
    pub fn admit_at(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.entries.write();
        let window = entries.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(window.started) >= self.config.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.config.limit {
            debug!(
                "Rate limiter: rejected {} ({}/{} in {:?})",
                key, window.count, self.config.limit, self.config.window
            );
            return false;
        }

        window.count += 1;
        true
    }

    /// Forget a key (peer left, room deleted)
    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Forget every key
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Drop keys whose window has elapsed
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.entries.write().retain(|key, entry| {
            let keep = now.saturating_duration_since(entry.started) < window;
            if !keep {
                debug!("Rate limiter: cleaned up entry for {}", key);
            }
            keep
        });
    }

    /// Get statistics about rate limiter state
    pub fn stats(&self) -> RateLimiterStats {
        let entries = self.entries.read();
        let saturated = entries
            .values()
            .filter(|w| w.count >= self.config.limit)
            .count();

        RateLimiterStats {
            saturated,
            total_tracked: entries.len(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("tracked", &self.entries.read().len())
            .finish()
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Keys that have exhausted their current window
    pub saturated: usize,
    /// Total number of tracked keys
    pub total_tracked: usize,
}
