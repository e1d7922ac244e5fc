//! Log throttling utility
//!
//! Limits how often the same warning is recorded. The event channel uses it
//! for dropped deliveries and stray completions, which can repeat once per
//! frame while a pipeline misbehaves.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Log throttler that limits how often the same message is logged
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use vvcam_bridge::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("queue_full"));
/// assert!(!throttler.should_log("queue_full"));
/// assert_eq!(throttler.suppressed("queue_full"), 1);
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a new log throttler with the specified interval
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a new log throttler with interval specified in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check if a message should be logged (not throttled)
    ///
    /// Returns `true` and restarts the interval when the key may log again.
    /// Throttled calls are counted and can be read with [`Self::suppressed`]
    /// until the next successful call resets the count.
    pub fn should_log(&self, key: &str) -> bool {
        self.take(key).is_some()
    }

    /// Like [`Self::should_log`], returning how many messages were suppressed
    /// since the key last logged
    pub fn take(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Messages suppressed for `key` since it last logged
    pub fn suppressed(&self, key: &str) -> u64 {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.suppressed)
            .unwrap_or(0)
    }

    /// Clear throttle state for a specific key
    ///
    /// Call when the condition recovers so the next occurrence logs at once.
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Clear all throttle state
    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    /// Get the number of tracked keys
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// Create a default log throttler with 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Macro for throttled warning logging
///
/// # Example
///
/// ```rust
/// use vvcam_bridge::utils::LogThrottler;
/// use vvcam_bridge::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "late_completion", "Discarding completion: {}", 42);
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.take($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("test_key"));
        assert!(!throttler.should_log("test_key"));

        thread::sleep(Duration::from_millis(150));

        assert!(throttler.should_log("test_key"));
    }

    #[test]
    fn test_suppressed_count() {
        let throttler = LogThrottler::new(Duration::from_millis(50));

        assert_eq!(throttler.take("drop"), Some(0));
        assert_eq!(throttler.take("drop"), None);
        assert_eq!(throttler.take("drop"), None);
        assert_eq!(throttler.suppressed("drop"), 2);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(throttler.take("drop"), Some(2));
        assert_eq!(throttler.suppressed("drop"), 0);
    }

    #[test]
    fn test_different_keys() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key1"));
        assert!(throttler.should_log("key2"));
        assert!(!throttler.should_log("key1"));
        assert!(!throttler.should_log("key2"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("test_key"));
        assert!(!throttler.should_log("test_key"));

        throttler.clear("test_key");
        assert!(throttler.should_log("test_key"));

        throttler.clear_all();
        assert!(throttler.is_empty());
    }
}
