//! Log throttling utility
//!
//! Cameras on battery frequently ignore stream activation requests. Without
//! throttling, every start/stop would log the same upstream failure.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Limits how often a message with the same key is logged
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` (and records the time) if `key` was not logged within
    /// the interval.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget `key` so the next failure after a recovery is logged at once
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.last_logged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(30)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("cam1"));
        assert!(!throttler.should_log("cam1"));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(throttler.should_log("cam1"));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("cam1"));
        assert!(throttler.should_log("cam2"));
        assert!(!throttler.should_log("cam1"));
        assert_eq!(throttler.len(), 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("cam1"));
        throttler.clear("cam1");
        assert!(throttler.should_log("cam1"));
        throttler.clear("cam1");
        assert!(throttler.is_empty());
    }
}
