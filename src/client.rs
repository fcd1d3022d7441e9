use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QuotaResult;
use crate::types::{OriginId, StorageKind};

/// Identity of a backend storage client. Each id maps to a distinct bit so
/// deletions can be filtered by a client mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientId {
    FileSystem,
    Database,
    AppCache,
    IndexedDb,
}

impl ClientId {
    pub fn bit(self) -> u32 {
        match self {
            ClientId::FileSystem => 1 << 0,
            ClientId::Database => 1 << 1,
            ClientId::AppCache => 1 << 2,
            ClientId::IndexedDb => 1 << 3,
        }
    }
}

/// Bitmask selecting which backend clients a bulk deletion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientMask(u32);

impl ClientMask {
    pub const ALL: ClientMask = ClientMask(u32::MAX);

    pub fn single(id: ClientId) -> Self {
        ClientMask(id.bit())
    }

    pub fn with(self, id: ClientId) -> Self {
        ClientMask(self.0 | id.bit())
    }

    pub fn contains(self, id: ClientId) -> bool {
        self.0 & id.bit() != 0
    }
}

impl From<ClientId> for ClientMask {
    fn from(id: ClientId) -> Self {
        ClientMask::single(id)
    }
}

/// Interface implemented by backend storage subsystems whose usage this
/// engine tracks. Calls may be of arbitrary latency and complete in any
/// order; the tracking layers tolerate any interleaving.
///
/// Implementations are expected to report the usage change of their own
/// deletions back through the manager proxy (`notify_storage_modified` with
/// a negative delta) so cached totals stay consistent.
#[async_trait]
pub trait StorageClient: Send + Sync {
    fn id(&self) -> ClientId;

    /// Whether this client stores any data for the given class.
    fn supports(&self, kind: StorageKind) -> bool;

    /// Current usage in bytes for one origin.
    async fn origin_usage(&self, origin: &OriginId, kind: StorageKind) -> i64;

    /// Every origin this client holds data for in the given class.
    async fn origins_for_kind(&self, kind: StorageKind) -> HashSet<OriginId>;

    /// Origins on one host this client holds data for in the given class.
    async fn origins_for_host(&self, kind: StorageKind, host: &str) -> HashSet<OriginId>;

    /// Delete all of this client's data for one origin and class.
    async fn delete_origin_data(&self, origin: &OriginId, kind: StorageKind) -> QuotaResult<()>;

    /// Lifecycle hook invoked when the owning manager shuts down.
    fn on_manager_destroyed(&self) {}
}
