//! At most one in-flight health probe per key

use std::sync::Arc;

use dashmap::DashSet;

/// Set of keys with a probe in flight
///
/// Cloning shares the set.
#[derive(Clone, Debug, Default)]
pub struct ProbeGuard {
    in_flight: Arc<DashSet<String>>,
}

impl ProbeGuard {
    /// Create an empty guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` in flight; false if it already was
    pub fn acquire(&self, key: &str) -> bool {
        self.in_flight.insert(key.to_string())
    }

    /// Clear `key`; a no-op when it is not in flight
    pub fn release(&self, key: &str) {
        self.in_flight.remove(key);
    }

    /// Whether `key` is in flight
    pub fn is_held(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    /// Acquire `key` as a lease that releases it when dropped
    pub fn try_lock(&self, key: &str) -> Option<ProbeLease> {
        self.acquire(key).then(|| ProbeLease {
            guard: self.clone(),
            key: key.to_string(),
        })
    }
}

/// Held key of a [`ProbeGuard`], released on drop
#[derive(Debug)]
pub struct ProbeLease {
    guard: ProbeGuard,
    key: String,
}

impl ProbeLease {
    /// Key this lease holds
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ProbeLease {
    fn drop(&mut self) {
        self.guard.release(&self.key);
    }
}
