//! Per-fingerprint build locks within one process

use crate::fingerprint::Fingerprint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Map of fingerprint to async mutex. Requests for different fingerprints
/// never contend.
#[derive(Default)]
pub(crate) struct BuildLocks {
    locks: Mutex<HashMap<Fingerprint, Arc<AsyncMutex<()>>>>,
}

/// Held build lock; the map entry is pruned when the last holder lets go
pub(crate) struct BuildLockGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    fingerprint: Fingerprint,
    owner: &'a BuildLocks,
}

impl BuildLocks {
    /// Wait until `deadline` for the lock of `fingerprint`
    pub(crate) async fn acquire(
        &self,
        fingerprint: &Fingerprint,
        deadline: Instant,
    ) -> Option<BuildLockGuard<'_>> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(fingerprint.clone()).or_default())
        };

        let guard = tokio::time::timeout_at(deadline, mutex.lock_owned()).await.ok();
        match guard {
            Some(guard) => Some(BuildLockGuard {
                guard: Some(guard),
                fingerprint: fingerprint.clone(),
                owner: self,
            }),
            None => {
                self.prune(fingerprint);
                None
            }
        }
    }

    /// Drop the map entry if nobody holds or waits on it
    fn prune(&self, fingerprint: &Fingerprint) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(fingerprint)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(fingerprint);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

impl Drop for BuildLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.owner.prune(&self.fingerprint);
    }
}
