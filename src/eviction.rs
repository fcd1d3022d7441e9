use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::policy::StoragePolicy;
use crate::storage::{QuotaDatabase, StorageError};
use crate::types::{OriginId, StorageKind};

/// Chooses the next eviction candidate: the least-recently-accessed origin
/// of the class that is neither in the exception set nor policy-exempt
/// (unlimited or protected). Stateless; the interesting part is the
/// re-validation contract captured by [`LruProbe`] and [`validate_candidate`].
pub struct EvictionSelector;

impl EvictionSelector {
    pub fn next_candidate(
        database: &QuotaDatabase,
        kind: StorageKind,
        exceptions: &HashSet<OriginId>,
        policy: &dyn StoragePolicy,
    ) -> Result<Option<OriginId>, StorageError> {
        database.get_lru_origin(kind, exceptions, |origin| {
            policy.is_unlimited(origin) || policy.is_protected(origin)
        })
    }
}

/// Decides whether an LRU answer is still usable once the asynchronous
/// lookup resolves. An origin touched (accessed or marked in-use) while the
/// lookup was outstanding is no longer the least recently used, so the stale
/// answer is discarded and eviction waits for the next cycle.
///
/// Deliberately narrow: only the returned candidate is re-checked. A
/// *different* origin turning stale during the window does not invalidate
/// the answer; eviction progress is favored over perfect LRU ordering.
pub fn validate_candidate(
    candidate: Option<OriginId>,
    touched: &HashSet<OriginId>,
) -> Option<OriginId> {
    candidate.filter(|origin| !touched.contains(origin))
}

/// Records origins touched while an LRU lookup is in flight. `begin` opens
/// the observation window, `finish` closes it and returns everything seen;
/// `record` outside a window is a no-op.
#[derive(Debug, Default)]
pub struct LruProbe {
    window: Mutex<Option<HashSet<OriginId>>>,
}

impl LruProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        *self.lock() = Some(HashSet::new());
    }

    pub fn record(&self, origin: &OriginId) {
        if let Some(window) = self.lock().as_mut() {
            window.insert(origin.clone());
        }
    }

    pub fn finish(&self) -> HashSet<OriginId> {
        self.lock().take().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<HashSet<OriginId>>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
