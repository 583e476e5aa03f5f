//! Per-domain mutual exclusion for reconciliation runs

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of run locks keyed by domain name.
///
/// Share one registry (behind an `Arc`) between every coordinator that may
/// touch the same domains.
#[derive(Debug, Default)]
pub struct DomainLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held lock for one domain; released on drop
#[derive(Debug)]
pub struct DomainGuard {
    domain: String,
    _guard: OwnedMutexGuard<()>,
}

impl DomainGuard {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl DomainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, domain: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Take the lock if nobody holds it
    pub fn try_acquire(&self, domain: &str) -> Option<DomainGuard> {
        let guard = self.lock_for(domain).try_lock_owned().ok()?;
        Some(DomainGuard {
            domain: domain.to_string(),
            _guard: guard,
        })
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self, domain: &str) -> bool {
        self.locks
            .lock()
            .get(domain)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}
