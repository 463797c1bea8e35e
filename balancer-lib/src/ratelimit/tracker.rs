use http::HeaderMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::headers::remaining_quotas;

/// Last observed remaining count per quota category.
///
/// A connection is only as healthy as its most depleted quota, so
/// [`RateLimitSnapshot::minimum`] is the value recycling decisions use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot(HashMap<String, u64>);

impl RateLimitSnapshot {
    /// Remaining count for one category, if it was ever reported
    #[must_use]
    pub fn get(&self, category: &str) -> Option<u64> {
        self.0.get(category).copied()
    }

    /// Smallest remaining count across all categories, `None` without data
    #[must_use]
    pub fn minimum(&self) -> Option<u64> {
        self.0.values().copied().min()
    }

    /// Number of tracked categories
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` if no category has been reported yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(category, remaining)` pairs in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Accumulates quota headers seen on one connection handle.
///
/// A tracker belongs to exactly one handle; recycling a slot installs a
/// fresh tracker together with the fresh handle. `observe` and `minimum`
/// may be called from many request paths at once.
#[derive(Debug)]
pub struct RateLimitTracker {
    prefix: Arc<str>,
    remaining: Mutex<RateLimitSnapshot>,
}

impl RateLimitTracker {
    /// Create an empty tracker for headers starting with `prefix`
    #[must_use]
    pub fn new(prefix: impl Into<Arc<str>>) -> Self {
        Self {
            prefix: prefix.into(),
            remaining: Mutex::new(RateLimitSnapshot::default()),
        }
    }

    /// Record every well-formed quota header in `headers`.
    ///
    /// Malformed values are ignored one by one, so a single bad header never
    /// stops the others from being tracked. Returns how many categories were
    /// updated.
    pub fn observe(&self, headers: &HeaderMap) -> usize {
        let mut remaining = self.lock();
        let mut updated = 0;
        for (category, value) in remaining_quotas(headers, &self.prefix) {
            remaining.0.insert(category.to_ascii_lowercase(), value);
            updated += 1;
        }
        updated
    }

    /// Smallest remaining count seen so far, `None` if nothing was recorded
    #[must_use]
    pub fn minimum(&self) -> Option<u64> {
        self.lock().minimum()
    }

    /// Copy of all tracked categories
    #[must_use]
    pub fn snapshot(&self) -> RateLimitSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateLimitSnapshot> {
        // The map is always left consistent, so a poisoned lock is still usable
        self.remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
