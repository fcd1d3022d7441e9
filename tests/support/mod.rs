#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use storage_quota::client::{ClientId, StorageClient};
use storage_quota::error::{QuotaError, QuotaResult};
use storage_quota::manager::{DiskSpaceProbe, QuotaManager, QuotaManagerProxy};
use storage_quota::policy::StoragePolicy;
use storage_quota::types::{OriginId, StorageKind};
use storage_quota::QuotaSettings;

/// In-memory storage backend. Usage is seeded by tests, enumeration calls
/// are counted (and yield once, so concurrent queries interleave the same
/// way slow real backends do), and successful deletions report their delta
/// back through the manager proxy like production clients do.
pub struct MockStorageClient {
    id: ClientId,
    kinds: HashSet<StorageKind>,
    usages: Mutex<HashMap<(OriginId, StorageKind), i64>>,
    fail_deletions: Mutex<HashSet<OriginId>>,
    enumerations: AtomicUsize,
    proxy: Mutex<Option<QuotaManagerProxy>>,
}

impl MockStorageClient {
    pub fn new(id: ClientId, kinds: &[StorageKind]) -> Arc<Self> {
        Arc::new(Self {
            id,
            kinds: kinds.iter().copied().collect(),
            usages: Mutex::new(HashMap::new()),
            fail_deletions: Mutex::new(HashSet::new()),
            enumerations: AtomicUsize::new(0),
            proxy: Mutex::new(None),
        })
    }

    pub fn set_usage(&self, origin: &str, kind: StorageKind, bytes: i64) {
        self.usages
            .lock()
            .expect("lock")
            .insert((OriginId::from(origin), kind), bytes);
    }

    pub fn usage_of(&self, origin: &str, kind: StorageKind) -> i64 {
        self.usages
            .lock()
            .expect("lock")
            .get(&(OriginId::from(origin), kind))
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_deletions_for(&self, origin: &str) {
        self.fail_deletions
            .lock()
            .expect("lock")
            .insert(OriginId::from(origin));
    }

    pub fn allow_deletions_for(&self, origin: &str) {
        self.fail_deletions
            .lock()
            .expect("lock")
            .remove(&OriginId::from(origin));
    }

    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn attach_proxy(&self, proxy: QuotaManagerProxy) {
        *self.proxy.lock().expect("lock") = Some(proxy);
    }
}

#[async_trait]
impl StorageClient for MockStorageClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn supports(&self, kind: StorageKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn origin_usage(&self, origin: &OriginId, kind: StorageKind) -> i64 {
        self.usages
            .lock()
            .expect("lock")
            .get(&(origin.clone(), kind))
            .copied()
            .unwrap_or(0)
    }

    async fn origins_for_kind(&self, kind: StorageKind) -> HashSet<OriginId> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.usages
            .lock()
            .expect("lock")
            .keys()
            .filter(|(_, k)| *k == kind)
            .map(|(origin, _)| origin.clone())
            .collect()
    }

    async fn origins_for_host(&self, kind: StorageKind, host: &str) -> HashSet<OriginId> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.usages
            .lock()
            .expect("lock")
            .keys()
            .filter(|(origin, k)| *k == kind && origin.host() == host)
            .map(|(origin, _)| origin.clone())
            .collect()
    }

    async fn delete_origin_data(&self, origin: &OriginId, kind: StorageKind) -> QuotaResult<()> {
        if self.fail_deletions.lock().expect("lock").contains(origin) {
            return Err(QuotaError::InvalidModification(format!(
                "mock deletion failure for {origin}"
            )));
        }
        let removed = self
            .usages
            .lock()
            .expect("lock")
            .remove(&(origin.clone(), kind));
        let proxy = self.proxy.lock().expect("lock").clone();
        if let (Some(bytes), Some(proxy)) = (removed, proxy) {
            if bytes != 0 {
                let _ = proxy
                    .notify_storage_modified(self.id, origin, kind, -bytes)
                    .await;
            }
        }
        Ok(())
    }
}

/// Policy fixture with mutable grant sets.
#[derive(Default)]
pub struct MockStoragePolicy {
    unlimited: Mutex<HashSet<OriginId>>,
    protected: Mutex<HashSet<OriginId>>,
    disk_query: Mutex<HashSet<OriginId>>,
}

impl MockStoragePolicy {
    pub fn grant_unlimited(&self, origin: &str) {
        self.unlimited
            .lock()
            .expect("lock")
            .insert(OriginId::from(origin));
    }

    pub fn revoke_unlimited(&self, origin: &str) {
        self.unlimited
            .lock()
            .expect("lock")
            .remove(&OriginId::from(origin));
    }

    pub fn protect(&self, origin: &str) {
        self.protected
            .lock()
            .expect("lock")
            .insert(OriginId::from(origin));
    }

    pub fn allow_disk_query(&self, origin: &str) {
        self.disk_query
            .lock()
            .expect("lock")
            .insert(OriginId::from(origin));
    }
}

impl StoragePolicy for MockStoragePolicy {
    fn is_unlimited(&self, origin: &OriginId) -> bool {
        self.unlimited.lock().expect("lock").contains(origin)
    }

    fn is_protected(&self, origin: &OriginId) -> bool {
        self.protected.lock().expect("lock").contains(origin)
    }

    fn can_query_disk_size(&self, origin: &OriginId) -> bool {
        self.disk_query.lock().expect("lock").contains(origin)
    }
}

pub const GIB: i64 = 1024 * 1024 * 1024;

/// A quota manager wired to mock clients, a mock policy, and a settable
/// disk probe, on a throwaway data directory. Timers are disabled; tests
/// drive eviction and commits directly.
pub struct Harness {
    pub manager: QuotaManager,
    pub policy: Arc<MockStoragePolicy>,
    pub free_space: Arc<AtomicI64>,
    pub clients: Vec<Arc<MockStorageClient>>,
    _data_dir: TempDir,
}

impl Harness {
    pub fn new(clients: Vec<Arc<MockStorageClient>>) -> Self {
        let data_dir = TempDir::new().expect("tempdir");
        let settings = QuotaSettings {
            data_dir: Some(data_dir.path().to_path_buf()),
            eviction_disabled: true,
            ..QuotaSettings::default()
        };
        Self::with_settings(settings, clients, data_dir)
    }

    pub fn incognito(clients: Vec<Arc<MockStorageClient>>) -> Self {
        let data_dir = TempDir::new().expect("tempdir");
        let settings = QuotaSettings {
            eviction_disabled: true,
            ..QuotaSettings::incognito()
        };
        Self::with_settings(settings, clients, data_dir)
    }

    fn with_settings(
        settings: QuotaSettings,
        clients: Vec<Arc<MockStorageClient>>,
        data_dir: TempDir,
    ) -> Self {
        let policy = Arc::new(MockStoragePolicy::default());
        let free_space = Arc::new(AtomicI64::new(10 * GIB));
        let probe: DiskSpaceProbe = {
            let free_space = free_space.clone();
            Arc::new(move |_path| free_space.load(Ordering::SeqCst))
        };
        let manager = QuotaManager::new(settings, policy.clone(), probe);
        for client in &clients {
            manager.register_client(client.clone());
            client.attach_proxy(manager.proxy());
        }
        Self {
            manager,
            policy,
            free_space,
            clients,
            _data_dir: data_dir,
        }
    }

    pub fn set_free_space(&self, bytes: i64) {
        self.free_space.store(bytes, Ordering::SeqCst);
    }
}
