use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, OnceCell};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::client::{ClientId, ClientMask, StorageClient};
use crate::config::QuotaSettings;
use crate::error::{QuotaError, QuotaResult};
use crate::eviction::{validate_candidate, EvictionSelector, LruProbe};
use crate::policy::{PolicyChange, StoragePolicy};
use crate::storage::{ConfigKey, QuotaDatabase, StorageError};
use crate::tracker::{SingleFlight, UsageTracker};
use crate::types::{
    GlobalUsage, HostQuotaRow, OriginId, OriginInfoRow, StorageKind, UsageAndQuota, UsageInfo,
};

use super::monitor::{ObserverEntry, ObserverRegistry, StorageEvent, StorageObserverParams};
use super::{
    DiskSpaceProbe, DEFAULT_MIN_AVAILABLE_DISK_SPACE_TO_START_EVICTION,
    INCOGNITO_DEFAULT_QUOTA_LIMIT, MAX_ERRORS_PER_ROUND, MAX_ORIGIN_ERRORS_TO_BE_BLACKLISTED,
    MINIMUM_PRESERVE_FOR_SYSTEM, NO_LIMIT, PER_HOST_PERSISTENT_QUOTA_LIMIT,
    PER_HOST_TEMPORARY_PORTION, SYNCABLE_DEFAULT_HOST_QUOTA, TEMPORARY_QUOTA_RATIO_DIVISOR,
    USAGE_RATIO_TO_START_EVICTION,
};

/// Numbers the eviction pressure check runs on, also exposed for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionUsageInfo {
    pub limited_usage: i64,
    pub quota: i64,
    pub available_space: i64,
    pub min_available_space: i64,
}

impl EvictionUsageInfo {
    pub fn under_pressure(&self) -> bool {
        let threshold = (self.quota as f64 * USAGE_RATIO_TO_START_EVICTION) as i64;
        self.limited_usage > threshold || self.available_space < self.min_available_space
    }
}

/// Outcome of one eviction round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionRoundStats {
    pub evicted: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum QuotaVariant {
    WebApps,
    StorageClient,
}

struct Trackers {
    temporary: UsageTracker,
    persistent: UsageTracker,
    syncable: UsageTracker,
}

impl Trackers {
    fn for_kind(&self, kind: StorageKind) -> Option<&UsageTracker> {
        match kind {
            StorageKind::Temporary => Some(&self.temporary),
            StorageKind::Persistent => Some(&self.persistent),
            StorageKind::Syncable => Some(&self.syncable),
            StorageKind::Unmanaged => None,
        }
    }

    fn all(&self) -> [&UsageTracker; 3] {
        [&self.temporary, &self.persistent, &self.syncable]
    }
}

pub(crate) struct Inner {
    weak_self: Weak<Inner>,
    settings: QuotaSettings,
    policy: Arc<dyn StoragePolicy>,
    disk_probe: DiskSpaceProbe,
    clients: Mutex<Vec<Arc<dyn StorageClient>>>,
    database: Arc<QuotaDatabase>,
    init: OnceCell<Trackers>,
    db_disabled: AtomicBool,
    in_use: DashMap<OriginId, u32>,
    eviction_errors: DashMap<OriginId, u32>,
    /// Persisted override; values <= 0 mean unset.
    temporary_quota_override: AtomicI64,
    /// Persisted desired-available-space; values <= 0 mean unset.
    desired_available_space: AtomicI64,
    dedup: SingleFlight<(OriginId, StorageKind), QuotaResult<UsageAndQuota>>,
    lru_probe: LruProbe,
    observers: ObserverRegistry,
}

/// The quota accounting façade. Owns the persistent store, the per-class
/// usage trackers, and the eviction driver. There is exactly one owner;
/// everything else talks through [`QuotaManagerProxy`], whose calls fail
/// with [`QuotaError::Aborted`] once the owner is gone.
pub struct QuotaManager {
    inner: Arc<Inner>,
}

impl QuotaManager {
    pub fn new(
        settings: QuotaSettings,
        policy: Arc<dyn StoragePolicy>,
        disk_probe: DiskSpaceProbe,
    ) -> Self {
        let database = match (&settings.data_dir, settings.is_incognito) {
            (Some(dir), false) => Arc::new(QuotaDatabase::new(dir)),
            _ => Arc::new(QuotaDatabase::in_memory()),
        };
        let inner = Arc::new_cyclic(|weak| Inner {
            weak_self: weak.clone(),
            settings,
            policy,
            disk_probe,
            clients: Mutex::new(Vec::new()),
            database,
            init: OnceCell::new(),
            db_disabled: AtomicBool::new(false),
            in_use: DashMap::new(),
            eviction_errors: DashMap::new(),
            temporary_quota_override: AtomicI64::new(0),
            desired_available_space: AtomicI64::new(0),
            dedup: SingleFlight::new(),
            lru_probe: LruProbe::new(),
            observers: ObserverRegistry::default(),
        });
        if !inner.settings.eviction_disabled {
            spawn_eviction_loop(&inner);
        }
        spawn_commit_loop(&inner);
        Self { inner }
    }

    /// Registers a backend client. Must happen before the first operation;
    /// registration after initialization is a programming error and is
    /// ignored.
    pub fn register_client(&self, client: Arc<dyn StorageClient>) {
        if self.inner.init.initialized() {
            debug_assert!(false, "client registered after initialization");
            warn!(client = ?client.id(), "ignoring client registered after initialization");
            return;
        }
        self.inner.lock_clients().push(client);
    }

    /// Clonable handle for backend clients and UI code.
    pub fn proxy(&self) -> QuotaManagerProxy {
        QuotaManagerProxy {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub async fn get_usage_and_quota_for_web_apps(
        &self,
        origin: &OriginId,
        kind: StorageKind,
    ) -> QuotaResult<UsageAndQuota> {
        self.inner
            .usage_and_quota(origin, kind, QuotaVariant::WebApps)
            .await
    }

    pub async fn get_usage_and_quota(
        &self,
        origin: &OriginId,
        kind: StorageKind,
    ) -> QuotaResult<UsageAndQuota> {
        self.inner
            .usage_and_quota(origin, kind, QuotaVariant::StorageClient)
            .await
    }

    pub async fn get_temporary_global_quota(&self) -> QuotaResult<i64> {
        let trackers = self.inner.ensure_ready().await;
        self.inner.temporary_global_quota(trackers).await
    }

    pub async fn set_temporary_global_override_quota(&self, value: i64) -> QuotaResult<i64> {
        self.inner.set_temporary_global_override_quota(value).await
    }

    pub async fn get_persistent_host_quota(&self, host: &str) -> QuotaResult<i64> {
        self.inner.get_persistent_host_quota(host).await
    }

    pub async fn set_persistent_host_quota(&self, host: &str, value: i64) -> QuotaResult<i64> {
        self.inner.set_persistent_host_quota(host, value).await
    }

    pub async fn get_syncable_quota(&self, host: &str) -> QuotaResult<i64> {
        self.inner.get_syncable_quota(host).await
    }

    pub async fn get_global_usage(&self, kind: StorageKind) -> QuotaResult<GlobalUsage> {
        self.inner.get_global_usage(kind).await
    }

    pub async fn get_host_usage(&self, host: &str, kind: StorageKind) -> QuotaResult<i64> {
        self.inner.get_host_usage(host, kind).await
    }

    pub async fn get_usage_info(&self) -> QuotaResult<Vec<UsageInfo>> {
        self.inner.get_usage_info().await
    }

    pub async fn notify_storage_accessed(
        &self,
        client_id: ClientId,
        origin: &OriginId,
        kind: StorageKind,
    ) {
        self.inner
            .notify_storage_accessed(client_id, origin, kind)
            .await;
    }

    pub async fn notify_storage_modified(
        &self,
        client_id: ClientId,
        origin: &OriginId,
        kind: StorageKind,
        delta: i64,
    ) {
        self.inner
            .notify_storage_modified(client_id, origin, kind, delta)
            .await;
    }

    pub fn notify_origin_in_use(&self, origin: &OriginId) {
        self.inner.notify_origin_in_use(origin);
    }

    pub fn notify_origin_no_longer_in_use(&self, origin: &OriginId) {
        self.inner.notify_origin_no_longer_in_use(origin);
    }

    pub fn is_origin_in_use(&self, origin: &OriginId) -> bool {
        self.inner.in_use.contains_key(origin)
    }

    pub async fn delete_origin_data(
        &self,
        origin: &OriginId,
        kind: StorageKind,
        mask: ClientMask,
    ) -> QuotaResult<()> {
        self.inner.delete_origin_data(origin, kind, mask).await
    }

    pub async fn delete_host_data(
        &self,
        host: &str,
        kind: StorageKind,
        mask: ClientMask,
    ) -> QuotaResult<()> {
        self.inner.delete_host_data(host, kind, mask).await
    }

    pub async fn evict_origin_data(
        &self,
        origin: &OriginId,
        kind: StorageKind,
    ) -> QuotaResult<()> {
        self.inner.evict_origin_data(origin, kind).await
    }

    pub async fn get_usage_and_quota_for_eviction(&self) -> QuotaResult<EvictionUsageInfo> {
        let trackers = self.inner.ensure_ready().await;
        self.inner.eviction_usage_info(trackers).await
    }

    /// Runs one pressure-checked eviction round immediately. The interval
    /// timer calls this; tests call it directly.
    pub async fn run_eviction_round(&self) -> EvictionRoundStats {
        self.inner.run_eviction_round().await
    }

    pub async fn get_cached_origins(&self, kind: StorageKind) -> QuotaResult<HashSet<OriginId>> {
        let trackers = self.inner.ensure_ready().await;
        match trackers.for_kind(kind) {
            Some(tracker) => Ok(tracker.get_cached_origins()),
            None => Err(QuotaError::NotSupported(format!(
                "no usage tracking for {kind} storage"
            ))),
        }
    }

    pub async fn get_origins_modified_since(
        &self,
        kind: StorageKind,
        since: DateTime<Utc>,
    ) -> QuotaResult<HashSet<OriginId>> {
        self.inner.ensure_ready().await;
        self.inner
            .db_call(move |db| db.get_origins_modified_since(kind, since))
            .await
    }

    pub async fn dump_host_quota_table(&self) -> QuotaResult<Vec<HostQuotaRow>> {
        self.inner.ensure_ready().await;
        self.inner.db_call(|db| db.dump_host_quota_table()).await
    }

    pub async fn dump_origin_info_table(&self) -> QuotaResult<Vec<OriginInfoRow>> {
        self.inner.ensure_ready().await;
        self.inner.db_call(|db| db.dump_origin_info_table()).await
    }

    pub async fn notify_policy_change(&self, change: PolicyChange) {
        self.inner.notify_policy_change(change).await;
    }

    pub async fn set_usage_cache_enabled(
        &self,
        client_id: ClientId,
        origin: &OriginId,
        kind: StorageKind,
        enabled: bool,
    ) {
        self.inner
            .set_usage_cache_enabled(client_id, origin, kind, enabled)
            .await;
    }

    pub async fn register_observer(
        &self,
        params: StorageObserverParams,
    ) -> mpsc::Receiver<StorageEvent> {
        self.inner.register_observer(params).await
    }
}

/// Weak-referenced clonable handle to a [`QuotaManager`]. Every call
/// upgrades the reference first and fails with [`QuotaError::Aborted`] when
/// the owner has been dropped, so dangling callers observe an explicit
/// status instead of silence.
#[derive(Clone)]
pub struct QuotaManagerProxy {
    inner: Weak<Inner>,
}

impl QuotaManagerProxy {
    fn upgrade(&self) -> QuotaResult<Arc<Inner>> {
        self.inner.upgrade().ok_or(QuotaError::Aborted)
    }

    pub async fn get_usage_and_quota_for_web_apps(
        &self,
        origin: &OriginId,
        kind: StorageKind,
    ) -> QuotaResult<UsageAndQuota> {
        self.upgrade()?
            .usage_and_quota(origin, kind, QuotaVariant::WebApps)
            .await
    }

    pub async fn get_usage_and_quota(
        &self,
        origin: &OriginId,
        kind: StorageKind,
    ) -> QuotaResult<UsageAndQuota> {
        self.upgrade()?
            .usage_and_quota(origin, kind, QuotaVariant::StorageClient)
            .await
    }

    pub async fn get_temporary_global_quota(&self) -> QuotaResult<i64> {
        let inner = self.upgrade()?;
        let trackers = inner.ensure_ready().await;
        inner.temporary_global_quota(trackers).await
    }

    pub async fn set_temporary_global_override_quota(&self, value: i64) -> QuotaResult<i64> {
        self.upgrade()?
            .set_temporary_global_override_quota(value)
            .await
    }

    pub async fn get_persistent_host_quota(&self, host: &str) -> QuotaResult<i64> {
        self.upgrade()?.get_persistent_host_quota(host).await
    }

    pub async fn set_persistent_host_quota(&self, host: &str, value: i64) -> QuotaResult<i64> {
        self.upgrade()?.set_persistent_host_quota(host, value).await
    }

    pub async fn get_host_usage(&self, host: &str, kind: StorageKind) -> QuotaResult<i64> {
        self.upgrade()?.get_host_usage(host, kind).await
    }

    pub async fn notify_storage_accessed(
        &self,
        client_id: ClientId,
        origin: &OriginId,
        kind: StorageKind,
    ) -> QuotaResult<()> {
        self.upgrade()?
            .notify_storage_accessed(client_id, origin, kind)
            .await;
        Ok(())
    }

    pub async fn notify_storage_modified(
        &self,
        client_id: ClientId,
        origin: &OriginId,
        kind: StorageKind,
        delta: i64,
    ) -> QuotaResult<()> {
        self.upgrade()?
            .notify_storage_modified(client_id, origin, kind, delta)
            .await;
        Ok(())
    }

    pub fn notify_origin_in_use(&self, origin: &OriginId) -> QuotaResult<()> {
        self.upgrade()?.notify_origin_in_use(origin);
        Ok(())
    }

    pub fn notify_origin_no_longer_in_use(&self, origin: &OriginId) -> QuotaResult<()> {
        self.upgrade()?.notify_origin_no_longer_in_use(origin);
        Ok(())
    }

    pub async fn delete_origin_data(
        &self,
        origin: &OriginId,
        kind: StorageKind,
        mask: ClientMask,
    ) -> QuotaResult<()> {
        self.upgrade()?.delete_origin_data(origin, kind, mask).await
    }

    pub async fn delete_host_data(
        &self,
        host: &str,
        kind: StorageKind,
        mask: ClientMask,
    ) -> QuotaResult<()> {
        self.upgrade()?.delete_host_data(host, kind, mask).await
    }

    pub async fn notify_policy_change(&self, change: PolicyChange) -> QuotaResult<()> {
        self.upgrade()?.notify_policy_change(change).await;
        Ok(())
    }

    pub async fn set_usage_cache_enabled(
        &self,
        client_id: ClientId,
        origin: &OriginId,
        kind: StorageKind,
        enabled: bool,
    ) -> QuotaResult<()> {
        self.upgrade()?
            .set_usage_cache_enabled(client_id, origin, kind, enabled)
            .await;
        Ok(())
    }

    pub async fn register_observer(
        &self,
        params: StorageObserverParams,
    ) -> QuotaResult<mpsc::Receiver<StorageEvent>> {
        Ok(self.upgrade()?.register_observer(params).await)
    }
}

impl Inner {
    /// Lazy initialization: builds the per-class trackers from the frozen
    /// client list, loads persisted config, and backfills origin rows on
    /// first run. Concurrent callers all wait for the same initialization.
    async fn ensure_ready(&self) -> &Trackers {
        self.init
            .get_or_init(|| async {
                let clients = self.lock_clients().clone();
                let trackers = Trackers {
                    temporary: UsageTracker::new(
                        StorageKind::Temporary,
                        &clients,
                        self.policy.clone(),
                    ),
                    persistent: UsageTracker::new(
                        StorageKind::Persistent,
                        &clients,
                        self.policy.clone(),
                    ),
                    syncable: UsageTracker::new(
                        StorageKind::Syncable,
                        &clients,
                        self.policy.clone(),
                    ),
                };

                if let Ok(Some(value)) = self
                    .db_call(|db| db.get_config_value(ConfigKey::TemporaryQuotaOverride))
                    .await
                {
                    self.temporary_quota_override.store(value, Ordering::SeqCst);
                }
                if let Ok(Some(value)) = self
                    .db_call(|db| db.get_config_value(ConfigKey::DesiredAvailableSpace))
                    .await
                {
                    self.desired_available_space.store(value, Ordering::SeqCst);
                }

                self.bootstrap_origins(&clients).await;
                info!(
                    clients = clients.len(),
                    incognito = self.settings.is_incognito,
                    "quota manager initialized"
                );
                trackers
            })
            .await
    }

    /// First-run backfill: origins that already hold data become LRU
    /// candidates with zero access time. Without this, anything that existed
    /// before the store did would be invisible to eviction.
    async fn bootstrap_origins(&self, clients: &[Arc<dyn StorageClient>]) {
        match self.db_call(|db| db.is_bootstrapped()).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(_) => return,
        }

        let mut origins: HashSet<OriginId> = HashSet::new();
        for client in clients {
            if client.supports(StorageKind::Temporary) {
                origins.extend(client.origins_for_kind(StorageKind::Temporary).await);
            }
        }
        debug!(origins = origins.len(), "bootstrapping origin registry");
        self.db_write(move |db| {
            db.register_initial_origins(&origins, StorageKind::Temporary)?;
            db.set_bootstrapped(true)
        })
        .await;
    }

    #[instrument(skip(self, origin), fields(origin = %origin, kind = %kind))]
    async fn usage_and_quota(
        &self,
        origin: &OriginId,
        kind: StorageKind,
        variant: QuotaVariant,
    ) -> QuotaResult<UsageAndQuota> {
        if variant == QuotaVariant::StorageClient && self.policy.is_unlimited(origin) {
            // Storage clients only need to know "no limit"; skip the usage
            // and disk queries entirely.
            return Ok(UsageAndQuota {
                usage: 0,
                quota: NO_LIMIT,
            });
        }
        // Past the unlimited short-circuit both variants compute the same
        // answer, so they can share one in-flight computation.
        let key = (origin.clone(), kind);
        self.dedup
            .run(key, || self.compute_usage_and_quota(origin, kind))
            .await?
    }

    async fn compute_usage_and_quota(
        &self,
        origin: &OriginId,
        kind: StorageKind,
    ) -> QuotaResult<UsageAndQuota> {
        let trackers = self.ensure_ready().await;
        let Some(tracker) = trackers.for_kind(kind) else {
            return Err(QuotaError::NotSupported(format!(
                "no quota for {kind} storage"
            )));
        };

        let host = origin.host();
        let unlimited = self.policy.is_unlimited(origin);
        let usage = tracker.get_host_usage(&host).await?;

        let mut quota = if unlimited {
            NO_LIMIT
        } else {
            match kind {
                StorageKind::Temporary => {
                    let global_quota = self.temporary_global_quota(trackers).await?;
                    let per_host = global_quota / PER_HOST_TEMPORARY_PORTION;
                    let limited = tracker.get_global_limited_usage().await?;
                    if limited > global_quota {
                        // The pool is over budget; nobody gets growth room.
                        // Hosts under their share are frozen at current
                        // usage, hosts above it still only see the share.
                        per_host.min(usage)
                    } else {
                        per_host
                    }
                }
                StorageKind::Persistent => {
                    let host_owned = host.clone();
                    let stored = match self
                        .db_call(move |db| {
                            db.get_host_quota(&host_owned, StorageKind::Persistent)
                        })
                        .await
                    {
                        Ok(value) => value.unwrap_or(0),
                        Err(_) => 0,
                    };
                    stored.min(PER_HOST_PERSISTENT_QUOTA_LIMIT)
                }
                StorageKind::Syncable => {
                    if self.policy.can_query_disk_size(origin) {
                        NO_LIMIT
                    } else {
                        SYNCABLE_DEFAULT_HOST_QUOTA
                    }
                }
                StorageKind::Unmanaged => unreachable!("checked by for_kind"),
            }
        };

        if (self.policy.can_query_disk_size(origin) || unlimited) && !self.settings.is_incognito {
            let free = self.available_space().await?.max(0);
            quota = if free < MINIMUM_PRESERVE_FOR_SYSTEM {
                usage
            } else {
                quota.min((free - MINIMUM_PRESERVE_FOR_SYSTEM).saturating_add(usage))
            };
        }

        if self.settings.is_incognito {
            quota = quota.min(INCOGNITO_DEFAULT_QUOTA_LIMIT);
        }

        Ok(UsageAndQuota { usage, quota })
    }

    async fn temporary_global_quota(&self, trackers: &Trackers) -> QuotaResult<i64> {
        let override_quota = self.temporary_quota_override.load(Ordering::SeqCst);
        if override_quota > 0 {
            return Ok(override_quota);
        }
        let limited = trackers.temporary.get_global_limited_usage().await?;
        let free = self.available_space().await?.max(0);
        Ok(free.saturating_add(limited) / TEMPORARY_QUOTA_RATIO_DIVISOR)
    }

    async fn set_temporary_global_override_quota(&self, value: i64) -> QuotaResult<i64> {
        let trackers = self.ensure_ready().await;
        if value < 0 {
            return Err(QuotaError::InvalidModification(format!(
                "negative temporary pool override {value}"
            )));
        }
        self.db_call(move |db| db.set_config_value(ConfigKey::TemporaryQuotaOverride, value))
            .await?;
        self.temporary_quota_override.store(value, Ordering::SeqCst);
        info!(quota = value, "temporary global quota override updated");
        if value > 0 {
            Ok(value)
        } else {
            self.temporary_global_quota(trackers).await
        }
    }

    async fn get_persistent_host_quota(&self, host: &str) -> QuotaResult<i64> {
        self.ensure_ready().await;
        if host.is_empty() {
            return Ok(0);
        }
        let host_owned = host.to_string();
        let stored = match self
            .db_call(move |db| db.get_host_quota(&host_owned, StorageKind::Persistent))
            .await
        {
            Ok(value) => value.unwrap_or(0),
            // Reads after a store failure are best-effort and serve zero.
            Err(_) => 0,
        };
        Ok(stored.min(PER_HOST_PERSISTENT_QUOTA_LIMIT))
    }

    async fn set_persistent_host_quota(&self, host: &str, value: i64) -> QuotaResult<i64> {
        self.ensure_ready().await;
        if host.is_empty() {
            return Err(QuotaError::NotSupported(
                "cannot set quota for an empty host".to_string(),
            ));
        }
        if value < 0 {
            return Err(QuotaError::InvalidModification(format!(
                "negative quota {value} for host {host}"
            )));
        }
        let clamped = value.min(PER_HOST_PERSISTENT_QUOTA_LIMIT);
        let host_owned = host.to_string();
        self.db_call(move |db| db.set_host_quota(&host_owned, StorageKind::Persistent, clamped))
            .await?;
        info!(host, quota = clamped, "persistent host quota updated");
        Ok(clamped)
    }

    async fn get_syncable_quota(&self, host: &str) -> QuotaResult<i64> {
        let origin = OriginId::new(format!("https://{host}/"));
        let result = self
            .usage_and_quota(&origin, StorageKind::Syncable, QuotaVariant::WebApps)
            .await?;
        Ok(result.quota)
    }

    async fn get_global_usage(&self, kind: StorageKind) -> QuotaResult<GlobalUsage> {
        let trackers = self.ensure_ready().await;
        match trackers.for_kind(kind) {
            Some(tracker) => tracker.get_global_usage().await,
            None => Err(QuotaError::NotSupported(format!(
                "no usage tracking for {kind} storage"
            ))),
        }
    }

    async fn get_host_usage(&self, host: &str, kind: StorageKind) -> QuotaResult<i64> {
        let trackers = self.ensure_ready().await;
        match trackers.for_kind(kind) {
            Some(tracker) => tracker.get_host_usage(host).await,
            None => Err(QuotaError::NotSupported(format!(
                "no usage tracking for {kind} storage"
            ))),
        }
    }

    /// Per-host usage report across every quota-managed class.
    async fn get_usage_info(&self) -> QuotaResult<Vec<UsageInfo>> {
        let trackers = self.ensure_ready().await;
        let mut report = Vec::new();
        for tracker in trackers.all() {
            tracker.get_global_usage().await?;
            let mut hosts: Vec<(String, i64)> =
                tracker.get_cached_hosts_usage().into_iter().collect();
            hosts.sort();
            for (host, usage) in hosts {
                report.push(UsageInfo {
                    host,
                    kind: tracker.kind(),
                    usage,
                });
            }
        }
        Ok(report)
    }

    async fn notify_storage_accessed(
        &self,
        client_id: ClientId,
        origin: &OriginId,
        kind: StorageKind,
    ) {
        self.ensure_ready().await;
        if !kind.is_quota_managed() {
            return;
        }
        self.lru_probe.record(origin);
        debug!(client = ?client_id, origin = %origin, kind = %kind, "storage accessed");
        let origin = origin.clone();
        self.db_write(move |db| db.set_origin_last_access(&origin, kind, Utc::now()))
            .await;
    }

    async fn notify_storage_modified(
        &self,
        client_id: ClientId,
        origin: &OriginId,
        kind: StorageKind,
        delta: i64,
    ) {
        let trackers = self.ensure_ready().await;
        if let Some(tracker) = trackers.for_kind(kind) {
            // Cache update happens before any suspension so a follow-up read
            // on the control context observes the new totals.
            tracker.update_usage_cache(client_id, origin, delta);
        }
        debug!(client = ?client_id, origin = %origin, kind = %kind, delta, "storage modified");
        if !kind.is_quota_managed() {
            return;
        }
        let persisted = origin.clone();
        self.db_write(move |db| db.set_origin_last_modified(&persisted, kind, Utc::now()))
            .await;
        self.dispatch_storage_events(origin, kind);
    }

    fn notify_origin_in_use(&self, origin: &OriginId) {
        self.lru_probe.record(origin);
        self.in_use
            .entry(origin.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    fn notify_origin_no_longer_in_use(&self, origin: &OriginId) {
        let drained = match self.in_use.get_mut(origin) {
            Some(mut entry) => {
                *entry -= 1;
                *entry == 0
            }
            None => {
                debug_assert!(false, "release of origin not marked in use: {origin}");
                warn!(origin = %origin, "release of origin not marked in use");
                false
            }
        };
        if drained {
            self.in_use.remove_if(origin, |_, count| *count == 0);
        }
    }

    async fn delete_origin_data(
        &self,
        origin: &OriginId,
        kind: StorageKind,
        mask: ClientMask,
    ) -> QuotaResult<()> {
        self.ensure_ready().await;
        let clients: Vec<Arc<dyn StorageClient>> = self
            .lock_clients()
            .iter()
            .filter(|client| client.supports(kind) && mask.contains(client.id()))
            .cloned()
            .collect();

        let mut failures = 0usize;
        for client in clients {
            if let Err(err) = client.delete_origin_data(origin, kind).await {
                warn!(
                    client = ?client.id(),
                    origin = %origin,
                    error = %err,
                    "client failed to delete origin data"
                );
                failures += 1;
            }
        }

        if failures > 0 {
            return Err(QuotaError::InvalidModification(format!(
                "{failures} client(s) failed to delete data for {origin}"
            )));
        }

        // The metadata row only goes away once every client's data for the
        // class is gone; partial masks leave it so the origin stays known.
        if mask == ClientMask::ALL && kind.is_quota_managed() {
            let origin_owned = origin.clone();
            self.db_write(move |db| db.delete_origin_info(&origin_owned, kind))
                .await;
        }
        self.dispatch_storage_events(origin, kind);
        Ok(())
    }

    async fn delete_host_data(
        &self,
        host: &str,
        kind: StorageKind,
        mask: ClientMask,
    ) -> QuotaResult<()> {
        self.ensure_ready().await;
        if host.is_empty() {
            return Ok(());
        }
        let clients: Vec<Arc<dyn StorageClient>> = self
            .lock_clients()
            .iter()
            .filter(|client| client.supports(kind) && mask.contains(client.id()))
            .cloned()
            .collect();

        let mut origins: HashSet<OriginId> = HashSet::new();
        for client in &clients {
            origins.extend(client.origins_for_host(kind, host).await);
        }

        let mut failed = false;
        for origin in origins {
            if self.delete_origin_data(&origin, kind, mask).await.is_err() {
                failed = true;
            }
        }
        if failed {
            Err(QuotaError::InvalidModification(format!(
                "failed to delete some origins on host {host}"
            )))
        } else {
            Ok(())
        }
    }

    /// Forced deletion under quota pressure. Failures count toward the
    /// origin's error blacklist and keep its metadata row so it is retried
    /// on a later cycle.
    async fn evict_origin_data(&self, origin: &OriginId, kind: StorageKind) -> QuotaResult<()> {
        match self.delete_origin_data(origin, kind, ClientMask::ALL).await {
            Ok(()) => {
                self.eviction_errors.remove(origin);
                info!(origin = %origin, kind = %kind, "evicted origin data");
                Ok(())
            }
            Err(err) => {
                let count = {
                    let mut entry = self.eviction_errors.entry(origin.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                warn!(origin = %origin, errors = count, "eviction failed");
                Err(err)
            }
        }
    }

    async fn eviction_usage_info(&self, trackers: &Trackers) -> QuotaResult<EvictionUsageInfo> {
        let limited_usage = trackers.temporary.get_global_limited_usage().await?;
        let quota = self.temporary_global_quota(trackers).await?;
        let available_space = self.available_space().await?.max(0);
        let desired = self.desired_available_space.load(Ordering::SeqCst);
        let min_available_space = if desired > 0 {
            desired
        } else {
            DEFAULT_MIN_AVAILABLE_DISK_SPACE_TO_START_EVICTION
        };
        Ok(EvictionUsageInfo {
            limited_usage,
            quota,
            available_space,
            min_available_space,
        })
    }

    /// LRU lookup with re-validation: origins touched while the lookup was
    /// outstanding invalidate a matching answer, because their recency
    /// information is newer than the store's.
    async fn select_eviction_candidate(
        &self,
        extra_exceptions: &HashSet<OriginId>,
    ) -> Option<OriginId> {
        let mut exceptions: HashSet<OriginId> = self
            .in_use
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        exceptions.extend(
            self.eviction_errors
                .iter()
                .filter(|entry| *entry.value() > MAX_ORIGIN_ERRORS_TO_BE_BLACKLISTED)
                .map(|entry| entry.key().clone()),
        );
        exceptions.extend(extra_exceptions.iter().cloned());

        self.lru_probe.begin();
        let policy = self.policy.clone();
        let candidate = self
            .db_call(move |db| {
                EvictionSelector::next_candidate(
                    db,
                    StorageKind::Temporary,
                    &exceptions,
                    policy.as_ref(),
                )
            })
            .await
            .unwrap_or(None);
        let touched = self.lru_probe.finish();

        validate_candidate(candidate, &touched)
            .filter(|origin| !self.in_use.contains_key(origin))
    }

    async fn run_eviction_round(&self) -> EvictionRoundStats {
        let trackers = self.ensure_ready().await;
        let mut stats = EvictionRoundStats::default();
        let mut consecutive_errors = 0u32;

        loop {
            let pressure = match self.eviction_usage_info(trackers).await {
                Ok(info) => info,
                Err(_) => break,
            };
            if !pressure.under_pressure() {
                break;
            }
            let Some(candidate) = self.select_eviction_candidate(&HashSet::new()).await else {
                break;
            };
            match self
                .evict_origin_data(&candidate, StorageKind::Temporary)
                .await
            {
                Ok(()) => {
                    stats.evicted += 1;
                    consecutive_errors = 0;
                }
                Err(_) => {
                    stats.errors += 1;
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_ERRORS_PER_ROUND {
                        break;
                    }
                }
            }
        }

        if stats != EvictionRoundStats::default() {
            info!(
                evicted = stats.evicted,
                errors = stats.errors,
                "eviction round finished"
            );
        }
        stats
    }

    async fn notify_policy_change(&self, change: PolicyChange) {
        let trackers = self.ensure_ready().await;
        for tracker in trackers.all() {
            tracker.on_policy_change(&change);
        }
        debug!(change = ?change, "storage policy changed");
    }

    async fn set_usage_cache_enabled(
        &self,
        client_id: ClientId,
        origin: &OriginId,
        kind: StorageKind,
        enabled: bool,
    ) {
        let trackers = self.ensure_ready().await;
        if let Some(tracker) = trackers.for_kind(kind) {
            tracker.set_usage_cache_enabled(client_id, origin, enabled);
        }
    }

    async fn register_observer(
        &self,
        params: StorageObserverParams,
    ) -> mpsc::Receiver<StorageEvent> {
        let dispatch_initial = params.dispatch_initial;
        let (id, rx) = self.observers.register(params);
        if dispatch_initial {
            if let Some(entry) = self.observers.get(id) {
                schedule_observer_dispatch(self.weak_self.clone(), id, entry);
            }
        }
        rx
    }

    /// Fans a usage-affecting change to every observer whose filter matches,
    /// honoring each observer's dispatch rate.
    fn dispatch_storage_events(&self, origin: &OriginId, kind: StorageKind) {
        if self.observers.is_empty() {
            return;
        }
        for (id, entry) in self.observers.matching(origin, kind) {
            schedule_observer_dispatch(self.weak_self.clone(), id, entry);
        }
    }

    /// Runs a read/write on the persistence context. Any storage failure
    /// flips the sticky disabled flag; later calls fail fast.
    async fn db_call<T, F>(&self, op: F) -> QuotaResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&QuotaDatabase) -> Result<T, StorageError> + Send + 'static,
    {
        if self.db_disabled.load(Ordering::SeqCst) {
            return Err(QuotaError::DatabaseDisabled);
        }
        let database = self.database.clone();
        match tokio::task::spawn_blocking(move || op(&database)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                warn!(error = %err, "quota database operation failed, disabling persistence");
                self.db_disabled.store(true, Ordering::SeqCst);
                Err(QuotaError::DatabaseDisabled)
            }
            Err(join_err) => {
                warn!(error = %join_err, "quota database task failed");
                Err(QuotaError::Aborted)
            }
        }
    }

    /// Write-through persistence that degrades silently: once the store is
    /// disabled the manager keeps serving cached numbers and drops writes.
    async fn db_write<F>(&self, op: F)
    where
        F: FnOnce(&QuotaDatabase) -> Result<(), StorageError> + Send + 'static,
    {
        let _ = self.db_call(op).await;
    }

    async fn available_space(&self) -> QuotaResult<i64> {
        let probe = self.disk_probe.clone();
        let path = self
            .settings
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/"));
        tokio::task::spawn_blocking(move || probe(&path))
            .await
            .map_err(|_| QuotaError::Aborted)
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn StorageClient>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(err) = self.database.commit() {
            debug!(error = %err, "final quota commit failed");
        }
        for client in self.lock_clients().iter() {
            client.on_manager_destroyed();
        }
    }
}

fn spawn_eviction_loop(inner: &Arc<Inner>) {
    let weak = Arc::downgrade(inner);
    let period = inner.settings.eviction_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so a fresh profile
        // is not scanned before anything registered usage.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            let stats = inner.run_eviction_round().await;
            debug!(
                evicted = stats.evicted,
                errors = stats.errors,
                "eviction tick"
            );
        }
    });
}

fn spawn_commit_loop(inner: &Arc<Inner>) {
    let weak = Arc::downgrade(inner);
    let period = inner.settings.commit_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            inner.db_write(|db| db.commit()).await;
        }
    });
}

/// Delivers one observer event, waiting out the observer's rate window
/// first. A closed receiver unregisters the observer.
fn schedule_observer_dispatch(weak: Weak<Inner>, id: u64, entry: Arc<ObserverEntry>) {
    let Some(delay) = entry.try_begin_dispatch() else {
        return;
    };
    tokio::spawn(async move {
        if delay > std::time::Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let Some(inner) = weak.upgrade() else { return };
        let filter = entry.params.filter.clone();
        let result = inner
            .usage_and_quota(&filter.origin, filter.kind, QuotaVariant::WebApps)
            .await;
        entry.finish_dispatch();
        if let Ok(numbers) = result {
            let event = StorageEvent {
                filter,
                usage: numbers.usage,
                quota: numbers.quota,
            };
            if entry.tx.try_send(event).is_err() && entry.tx.is_closed() {
                inner.observers.remove(id);
            }
        }
    });
}
