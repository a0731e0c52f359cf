//! Fixed-window request counter keyed by origin.

use crate::clock::{duration_millis, elapsed_millis, Clock};
use crate::store::ShardedMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: u64,
    count: u32,
}

pub struct RateLimiter<K> {
    windows: ShardedMap<K, Window>,
    max_attempts: u32,
    window_ms: u64,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(max_attempts: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: ShardedMap::new(),
            max_attempts,
            window_ms: duration_millis(window),
            clock,
        }
    }

    /// Records one attempt for `key` and reports whether it is within budget.
    pub fn check(&self, key: K) -> bool {
        let now = self.clock.now_millis();
        let window_ms = self.window_ms;
        let count = self.windows.with_entry(key, |entry| {
            let window = entry.or_insert(Window {
                started_at: now,
                count: 0,
            });
            if elapsed_millis(now, window.started_at) > window_ms {
                window.started_at = now;
                window.count = 0;
            }
            window.count = window.count.saturating_add(1);
            window.count
        });
        count <= self.max_attempts
    }

    /// Drops windows idle for more than twice the window length.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let horizon = self.window_ms.saturating_mul(2);
        self.windows
            .retain(|_, w| elapsed_millis(now, w.started_at) <= horizon)
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
