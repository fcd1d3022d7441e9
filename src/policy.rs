use crate::types::OriginId;

/// Special-treatment predicates consulted for quota math and eviction.
/// Implementations live outside the engine (browser-process policy, test
/// fixtures) and must answer from in-memory state without blocking.
pub trait StoragePolicy: Send + Sync {
    /// Origin is exempt from quota limits entirely.
    fn is_unlimited(&self, origin: &OriginId) -> bool;

    /// Origin must never be chosen for eviction.
    fn is_protected(&self, origin: &OriginId) -> bool;

    /// Origin may have its quota derived from real disk capacity.
    fn can_query_disk_size(&self, origin: &OriginId) -> bool;
}

/// Change notification forwarded by the embedder whenever unlimited grants
/// move. Cached usage is re-bucketed from last known values without
/// re-querying backends, so precision is best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyChange {
    GrantedUnlimited(OriginId),
    RevokedUnlimited(OriginId),
    Cleared,
}

/// Policy that grants nothing: every origin is limited, evictable, and
/// quota'd from computed defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStoragePolicy;

impl StoragePolicy for DefaultStoragePolicy {
    fn is_unlimited(&self, _origin: &OriginId) -> bool {
        false
    }

    fn is_protected(&self, _origin: &OriginId) -> bool {
        false
    }

    fn can_query_disk_size(&self, _origin: &OriginId) -> bool {
        false
    }
}
