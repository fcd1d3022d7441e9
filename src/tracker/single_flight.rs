use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::error::{QuotaError, QuotaResult};

/// Coalesces concurrent identical queries: the first caller for a key runs
/// the computation, everyone else subscribes to its result. A follower that
/// observes a closed channel learned that the leader (and with it the owning
/// manager) went away mid-flight, which surfaces as `Aborted`.
pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, broadcast::Sender<V>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `compute` for `key` unless one is already in flight, in which
    /// case the caller waits for that run's result instead.
    pub async fn run<F, Fut>(&self, key: K, compute: F) -> QuotaResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let follower = {
            let mut inflight = self.lock();
            match inflight.entry(key.clone()) {
                Entry::Occupied(entry) => Some(entry.get().subscribe()),
                Entry::Vacant(entry) => {
                    // Capacity 1 suffices: exactly one value is ever sent.
                    let (tx, _) = broadcast::channel(1);
                    entry.insert(tx);
                    None
                }
            }
        };

        if let Some(mut rx) = follower {
            return rx.recv().await.map_err(|_| QuotaError::Aborted);
        }

        let guard = LeaderGuard { owner: self, key };
        let value = compute().await;
        guard.publish(value.clone());
        Ok(value)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, broadcast::Sender<V>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the in-flight entry even when the leader future is dropped before
/// completion, so followers observe a closed channel instead of waiting on a
/// key nobody is computing anymore.
struct LeaderGuard<'a, K: Eq + Hash + Clone, V: Clone> {
    owner: &'a SingleFlight<K, V>,
    key: K,
}

impl<K: Eq + Hash + Clone, V: Clone> LeaderGuard<'_, K, V> {
    fn publish(self, value: V) {
        if let Some(tx) = self.owner.lock().remove(&self.key) {
            // No receivers is fine; the leader already holds the value.
            let _ = tx.send(value);
        }
        std::mem::forget(self);
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for LeaderGuard<'_, K, V> {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.key);
    }
}
