use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
#[inline]
pub fn timestamp_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|t| t.as_millis() as i64).unwrap_or_default()
}

/// A counter tracking both the current value and the high-water mark.
#[derive(Serialize, Deserialize)]
pub struct Counter(AtomicIsize, AtomicIsize);

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter(
            AtomicIsize::new(self.0.load(Ordering::SeqCst)),
            AtomicIsize::new(self.1.load(Ordering::SeqCst)),
        )
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Counter(AtomicIsize::new(0), AtomicIsize::new(0))
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, c: isize) {
        let prev = self.0.fetch_add(c, Ordering::SeqCst);
        self.1.fetch_max(prev + c, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.1.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "count": self.count(), "max": self.max() })
    }
}

/// A value with an optional time-to-live, checked lazily on access.
#[derive(Debug, Clone)]
pub struct TimedValue<V> {
    value: V,
    expire_at: Option<Instant>,
}

impl<V> TimedValue<V> {
    #[inline]
    pub fn new(value: V, timeout: Option<Duration>) -> Self {
        TimedValue { value, expire_at: timeout.map(|t| Instant::now() + t) }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expire_at.map(|at| at <= Instant::now()).unwrap_or(false)
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    #[inline]
    pub fn into_value(self) -> V {
        self.value
    }
}
