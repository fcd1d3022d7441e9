use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;

use crate::client::{ClientId, StorageClient};
use crate::error::QuotaResult;
use crate::policy::{PolicyChange, StoragePolicy};
use crate::types::{GlobalUsage, OriginId, StorageKind};

use super::client_tracker::ClientUsageTracker;

/// Fan-out/fan-in usage coordinator for one storage class. Every query goes
/// to all registered client trackers in parallel and resolves only once all
/// of them answered; zero clients resolves to zero immediately. `join_all`
/// makes a synchronously-completing client harmless by construction.
pub struct UsageTracker {
    kind: StorageKind,
    trackers: Vec<Arc<ClientUsageTracker>>,
    inflight: Arc<AtomicUsize>,
}

impl UsageTracker {
    pub fn new(
        kind: StorageKind,
        clients: &[Arc<dyn StorageClient>],
        policy: Arc<dyn StoragePolicy>,
    ) -> Self {
        let trackers = clients
            .iter()
            .filter(|client| client.supports(kind))
            .map(|client| {
                Arc::new(ClientUsageTracker::new(
                    client.clone(),
                    kind,
                    policy.clone(),
                ))
            })
            .collect();
        Self {
            kind,
            trackers,
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub async fn get_global_usage(&self) -> QuotaResult<GlobalUsage> {
        let _busy = BusyGuard::enter(&self.inflight);
        let results = join_all(
            self.trackers
                .iter()
                .map(|tracker| tracker.get_global_usage()),
        )
        .await;

        let mut totals = GlobalUsage::default();
        for result in results {
            let usage = result?;
            totals.limited = totals.limited.saturating_add(usage.limited);
            totals.unlimited = totals.unlimited.saturating_add(usage.unlimited);
        }
        Ok(totals)
    }

    pub async fn get_global_limited_usage(&self) -> QuotaResult<i64> {
        Ok(self.get_global_usage().await?.limited)
    }

    pub async fn get_host_usage(&self, host: &str) -> QuotaResult<i64> {
        let _busy = BusyGuard::enter(&self.inflight);
        let results = join_all(
            self.trackers
                .iter()
                .map(|tracker| tracker.get_host_usage(host)),
        )
        .await;

        let mut total = 0i64;
        for result in results {
            total = total.saturating_add(result?);
        }
        Ok(total)
    }

    /// Union of every client tracker's cached origins. Never queries a
    /// backend.
    pub fn get_cached_origins(&self) -> HashSet<OriginId> {
        let mut origins = HashSet::new();
        for tracker in &self.trackers {
            origins.extend(tracker.get_cached_origins());
        }
        origins
    }

    /// Cached usage summed per host across clients. Never queries a backend.
    pub fn get_cached_hosts_usage(&self) -> HashMap<String, i64> {
        let mut totals: HashMap<String, i64> = HashMap::new();
        for tracker in &self.trackers {
            for (host, usage) in tracker.get_cached_hosts_usage() {
                let slot = totals.entry(host).or_insert(0);
                *slot = slot.saturating_add(usage);
            }
        }
        totals
    }

    /// Routes a signed cache delta to the matching client's tracker.
    /// Unknown client ids are a programming error.
    pub fn update_usage_cache(&self, client_id: ClientId, origin: &OriginId, delta: i64) {
        let found = self
            .trackers
            .iter()
            .find(|tracker| tracker.client_id() == client_id);
        debug_assert!(found.is_some(), "no tracker for client {client_id:?}");
        if let Some(tracker) = found {
            tracker.update_usage_cache(origin, delta);
        }
    }

    pub fn set_usage_cache_enabled(&self, client_id: ClientId, origin: &OriginId, enabled: bool) {
        if let Some(tracker) = self
            .trackers
            .iter()
            .find(|tracker| tracker.client_id() == client_id)
        {
            tracker.set_usage_cache_enabled(origin, enabled);
        }
    }

    pub fn on_policy_change(&self, change: &PolicyChange) {
        for tracker in &self.trackers {
            tracker.on_policy_change(change);
        }
    }

    /// True while any global or host query is outstanding. Gates destructive
    /// cache resets.
    pub fn is_busy(&self) -> bool {
        self.inflight.load(Ordering::SeqCst) > 0
    }
}

struct BusyGuard {
    counter: Arc<AtomicUsize>,
}

impl BusyGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
