use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::client::{ClientId, StorageClient};
use crate::error::QuotaResult;
use crate::policy::{PolicyChange, StoragePolicy};
use crate::types::{GlobalUsage, OriginId, StorageKind};

use super::single_flight::SingleFlight;

/// Cache validity for one host. `Unknown` hosts always hit the backend;
/// `Cached` hosts serve from `origins` except for members of `live_only`,
/// which opted out of caching and are queried live on every request.
#[derive(Debug, Default)]
struct HostCache {
    cached: bool,
    origins: HashMap<OriginId, i64>,
    live_only: HashSet<OriginId>,
}

#[derive(Debug, Default)]
struct CacheState {
    global_scanned: bool,
    global_limited: i64,
    global_unlimited: i64,
    hosts: HashMap<String, HostCache>,
    /// Origins classified unlimited at the time they were cached. Policy
    /// changes re-bucket from these last known values.
    unlimited_origins: HashSet<OriginId>,
}

impl CacheState {
    fn any_live_only(&self) -> bool {
        self.hosts.values().any(|host| !host.live_only.is_empty())
    }

    /// Adds `delta` to the matching global bucket, clamped at zero.
    fn apply_to_bucket(&mut self, unlimited: bool, delta: i64) {
        let bucket = if unlimited {
            &mut self.global_unlimited
        } else {
            &mut self.global_limited
        };
        *bucket = bucket.saturating_add(delta).max(0);
    }

    /// Inserts or replaces one cached origin value, keeping the global
    /// buckets and the classification set in sync.
    fn store_origin(&mut self, host: &str, origin: OriginId, usage: i64, unlimited: bool) {
        let entry = self.hosts.entry(host.to_string()).or_default();
        if let Some(previous) = entry.origins.insert(origin.clone(), usage) {
            let was_unlimited = self.unlimited_origins.contains(&origin);
            self.apply_to_bucket(was_unlimited, -previous);
        }
        if unlimited {
            self.unlimited_origins.insert(origin);
        } else {
            self.unlimited_origins.remove(&origin);
        }
        self.apply_to_bucket(unlimited, usage);
    }

    /// Drops one origin from the cache, returning its last cached value.
    fn evict_origin(&mut self, host: &str, origin: &OriginId) -> Option<i64> {
        let entry = self.hosts.get_mut(host)?;
        let previous = entry.origins.remove(origin)?;
        let was_unlimited = self.unlimited_origins.remove(origin);
        self.apply_to_bucket(was_unlimited, -previous);
        Some(previous)
    }
}

/// Usage cache for one backend client in one storage class. Serves cached
/// totals when they are complete, falls back to backend enumeration when
/// they are not, and coalesces concurrent identical backend queries.
pub struct ClientUsageTracker {
    client: Arc<dyn StorageClient>,
    kind: StorageKind,
    policy: Arc<dyn StoragePolicy>,
    cache: Mutex<CacheState>,
    global_flight: SingleFlight<(), GlobalUsage>,
    host_flight: SingleFlight<String, i64>,
}

impl ClientUsageTracker {
    pub fn new(
        client: Arc<dyn StorageClient>,
        kind: StorageKind,
        policy: Arc<dyn StoragePolicy>,
    ) -> Self {
        Self {
            client,
            kind,
            policy,
            cache: Mutex::new(CacheState::default()),
            global_flight: SingleFlight::new(),
            host_flight: SingleFlight::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client.id()
    }

    /// Global limited/unlimited totals. Served from cache only when a full
    /// scan has completed and no origin is opted out of caching.
    pub async fn get_global_usage(&self) -> QuotaResult<GlobalUsage> {
        {
            let cache = self.lock_cache();
            if cache.global_scanned && !cache.any_live_only() {
                return Ok(GlobalUsage {
                    limited: cache.global_limited,
                    unlimited: cache.global_unlimited,
                });
            }
        }
        self.global_flight
            .run((), || self.scan_global_usage())
            .await
    }

    /// Combined limited+unlimited usage for one host.
    pub async fn get_host_usage(&self, host: &str) -> QuotaResult<i64> {
        {
            let cache = self.lock_cache();
            if let Some(entry) = cache.hosts.get(host) {
                if entry.cached && entry.live_only.is_empty() {
                    return Ok(entry.origins.values().sum());
                }
            }
        }
        let key = host.to_string();
        self.host_flight
            .run(key.clone(), || self.scan_host_usage(key.clone()))
            .await
    }

    /// Applies a signed delta to the cached value of one origin. A no-op
    /// when the origin's host is not cached or the origin opted out; those
    /// values are re-learned on the next scan.
    pub fn update_usage_cache(&self, origin: &OriginId, delta: i64) {
        let host = origin.host();
        let unlimited = self.policy.is_unlimited(origin);
        let mut cache = self.lock_cache();
        let Some(entry) = cache.hosts.get_mut(&host) else {
            return;
        };
        if !entry.cached || entry.live_only.contains(origin) {
            return;
        }
        let slot = entry.origins.entry(origin.clone()).or_insert(0);
        let previous = *slot;
        *slot = slot.saturating_add(delta).max(0);
        let applied = *slot - previous;
        if unlimited {
            cache.unlimited_origins.insert(origin.clone());
        } else {
            cache.unlimited_origins.remove(origin);
        }
        cache.apply_to_bucket(unlimited, applied);
    }

    /// Disabling removes the origin's contribution and routes future reads
    /// for it to the backend. Re-enabling invalidates the whole host cache,
    /// because the true value while disabled is unknown.
    pub fn set_usage_cache_enabled(&self, origin: &OriginId, enabled: bool) {
        let host = origin.host();
        let mut cache = self.lock_cache();
        if enabled {
            if let Some(entry) = cache.hosts.get_mut(&host) {
                entry.live_only.remove(origin);
            }
            self.invalidate_host(&mut cache, &host);
        } else {
            cache.evict_origin(&host, origin);
            cache
                .hosts
                .entry(host)
                .or_default()
                .live_only
                .insert(origin.clone());
        }
    }

    /// Re-buckets cached usage on unlimited-grant changes from last known
    /// values, without touching the backend. Best-effort by design.
    pub fn on_policy_change(&self, change: &PolicyChange) {
        let mut cache = self.lock_cache();
        match change {
            PolicyChange::GrantedUnlimited(origin) => {
                if let Some(value) = cached_value(&cache, origin) {
                    if cache.unlimited_origins.insert(origin.clone()) {
                        cache.apply_to_bucket(false, -value);
                        cache.apply_to_bucket(true, value);
                    }
                }
            }
            PolicyChange::RevokedUnlimited(origin) => {
                if let Some(value) = cached_value(&cache, origin) {
                    if cache.unlimited_origins.remove(origin) {
                        cache.apply_to_bucket(true, -value);
                        cache.apply_to_bucket(false, value);
                    }
                }
            }
            PolicyChange::Cleared => {
                let moved = cache.global_unlimited;
                cache.global_unlimited = 0;
                cache.global_limited = cache.global_limited.saturating_add(moved);
                cache.unlimited_origins.clear();
            }
        }
    }

    /// Every origin currently present in the cache.
    pub fn get_cached_origins(&self) -> HashSet<OriginId> {
        let cache = self.lock_cache();
        cache
            .hosts
            .values()
            .flat_map(|host| host.origins.keys().cloned())
            .collect()
    }

    /// Cached usage summed per host. Hosts that are not cached are absent.
    pub fn get_cached_hosts_usage(&self) -> HashMap<String, i64> {
        let cache = self.lock_cache();
        cache
            .hosts
            .iter()
            .filter(|(_, entry)| entry.cached)
            .map(|(host, entry)| (host.clone(), entry.origins.values().sum()))
            .collect()
    }

    async fn scan_global_usage(&self) -> GlobalUsage {
        let origins = self.client.origins_for_kind(self.kind).await;
        debug!(
            client = ?self.client.id(),
            kind = %self.kind,
            origins = origins.len(),
            "full usage scan"
        );

        let mut totals = GlobalUsage::default();
        let mut gathered = Vec::with_capacity(origins.len());
        for origin in origins {
            let usage = self.client.origin_usage(&origin, self.kind).await.max(0);
            gathered.push((origin, usage));
        }

        let mut cache = self.lock_cache();
        for (origin, usage) in gathered {
            let host = origin.host();
            let unlimited = self.policy.is_unlimited(&origin);
            if unlimited {
                totals.unlimited = totals.unlimited.saturating_add(usage);
            } else {
                totals.limited = totals.limited.saturating_add(usage);
            }
            let live_only = cache
                .hosts
                .get(&host)
                .is_some_and(|entry| entry.live_only.contains(&origin));
            if !live_only {
                cache.store_origin(&host, origin, usage, unlimited);
            }
        }
        for entry in cache.hosts.values_mut() {
            entry.cached = true;
        }
        cache.global_scanned = true;
        totals
    }

    async fn scan_host_usage(&self, host: String) -> i64 {
        let origins = self.client.origins_for_host(self.kind, &host).await;
        let mut gathered = Vec::with_capacity(origins.len());
        for origin in origins {
            let usage = self.client.origin_usage(&origin, self.kind).await.max(0);
            gathered.push((origin, usage));
        }

        let mut total = 0i64;
        let mut cache = self.lock_cache();
        for (origin, usage) in gathered {
            total = total.saturating_add(usage);
            let live_only = cache
                .hosts
                .get(&host)
                .is_some_and(|entry| entry.live_only.contains(&origin));
            if !live_only {
                let unlimited = self.policy.is_unlimited(&origin);
                cache.store_origin(&host, origin, usage, unlimited);
            }
        }
        if let Some(entry) = cache.hosts.get_mut(&host) {
            entry.cached = true;
        }
        total
    }

    fn invalidate_host(&self, cache: &mut CacheState, host: &str) {
        let Some(entry) = cache.hosts.get_mut(host) else {
            return;
        };
        let origins: Vec<OriginId> = entry.origins.keys().cloned().collect();
        for origin in origins {
            cache.evict_origin(host, &origin);
        }
        if let Some(entry) = cache.hosts.get_mut(host) {
            entry.cached = false;
        }
        // A hole in the host map means the next global read must rescan.
        cache.global_scanned = false;
    }

    fn lock_cache(&self) -> MutexGuard<'_, CacheState> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn cached_value(cache: &CacheState, origin: &OriginId) -> Option<i64> {
    cache
        .hosts
        .get(&origin.host())
        .and_then(|entry| entry.origins.get(origin))
        .copied()
}
