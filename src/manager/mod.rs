//! Quota accounting façade: the owning [`QuotaManager`], its weak
//! [`QuotaManagerProxy`] handles, the eviction driver, and the observer
//! notification surface.

use std::path::Path;
use std::sync::Arc;

mod monitor;
mod quota_manager;

pub use monitor::{StorageEvent, StorageObserverFilter, StorageObserverParams};
pub use quota_manager::{EvictionRoundStats, EvictionUsageInfo, QuotaManager, QuotaManagerProxy};

/// Reports the free disk space, in bytes, of the volume holding `path`.
/// Injected so tests and embedders control what "free space" means; called
/// on the blocking pool.
pub type DiskSpaceProbe = Arc<dyn Fn(&Path) -> i64 + Send + Sync>;

const MBYTES: i64 = 1024 * 1024;

/// Quota returned for unlimited origins to storage clients.
pub const NO_LIMIT: i64 = i64::MAX;

/// One host may use at most this fraction of the temporary pool.
pub const PER_HOST_TEMPORARY_PORTION: i64 = 5;

/// The temporary pool is a third of what the profile could reach.
pub const TEMPORARY_QUOTA_RATIO_DIVISOR: i64 = 3;

/// Hard ceiling on any persistent per-host grant.
pub const PER_HOST_PERSISTENT_QUOTA_LIMIT: i64 = 10 * 1024 * MBYTES;

/// Syncable hosts without disk-size privileges get this flat allowance.
pub const SYNCABLE_DEFAULT_HOST_QUOTA: i64 = 500 * MBYTES;

/// Disk headroom never handed out to storage.
pub const MINIMUM_PRESERVE_FOR_SYSTEM: i64 = 1024 * MBYTES;

/// Quota ceiling for ephemeral profiles.
pub const INCOGNITO_DEFAULT_QUOTA_LIMIT: i64 = 100 * MBYTES;

/// Free-space floor that triggers eviction when no persisted preference
/// overrides it.
pub const DEFAULT_MIN_AVAILABLE_DISK_SPACE_TO_START_EVICTION: i64 = 500 * MBYTES;

/// Usage-to-quota ratio above which eviction starts.
pub const USAGE_RATIO_TO_START_EVICTION: f64 = 0.7;

/// Origins failing eviction more often than this are skipped when picking
/// candidates.
pub const MAX_ORIGIN_ERRORS_TO_BE_BLACKLISTED: u32 = 3;

/// Consecutive failures that end an eviction round early.
pub const MAX_ERRORS_PER_ROUND: u32 = 5;
