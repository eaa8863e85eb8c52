use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

/// Short-lived cache of probe results keyed by query name.
pub struct ProbeCache<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> ProbeCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, or compute and store it.
    ///
    /// `force` bypasses a fresh entry. Errors are never cached. The lock is
    /// held while computing so concurrent callers share one probe run.
    pub fn get_or_try_insert<E>(
        &self,
        key: &str,
        force: bool,
        compute: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if !force {
            if let Some((at, value)) = entries.get(key) {
                if at.elapsed() < self.ttl {
                    trace!(key, "Probe served from cache");
                    return Ok(value.clone());
                }
            }
        }

        let value = compute()?;
        entries.insert(key.to_string(), (Instant::now(), value.clone()));
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_until_forced() {
        let cache = ProbeCache::new(Duration::from_secs(60));
        let mut calls = 0;

        let v: Result<u32, ()> = cache.get_or_try_insert("k", false, || {
            calls += 1;
            Ok(1)
        });
        assert_eq!(v, Ok(1));

        let v: Result<u32, ()> = cache.get_or_try_insert("k", false, || {
            calls += 1;
            Ok(2)
        });
        assert_eq!(v, Ok(1));

        let v: Result<u32, ()> = cache.get_or_try_insert("k", true, || {
            calls += 1;
            Ok(3)
        });
        assert_eq!(v, Ok(3));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_errors_not_cached_and_expiry() {
        let cache = ProbeCache::new(Duration::from_millis(0));
        let v: Result<u32, &str> = cache.get_or_try_insert("k", false, || Err("boom"));
        assert!(v.is_err());

        let v: Result<u32, &str> = cache.get_or_try_insert("k", false, || Ok(5));
        assert_eq!(v, Ok(5));
        // zero TTL: always recomputed
        let v: Result<u32, &str> = cache.get_or_try_insert("k", false, || Ok(6));
        assert_eq!(v, Ok(6));
    }
}
