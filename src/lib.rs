//! Per-origin storage quota accounting and LRU eviction engine.
//!
//! This crate tracks how much data each origin stores across pluggable
//! storage backends, computes usage-and-quota answers per storage class,
//! persists per-host grants and origin recency in SQLite, and evicts the
//! least recently used origins when the temporary pool comes under
//! pressure. Embedders register [`client::StorageClient`] backends on a
//! [`manager::QuotaManager`] and hand [`manager::QuotaManagerProxy`]
//! handles to everything else.

// Module declarations
pub mod client;
pub mod config;
pub mod error;
pub mod eviction;
pub mod manager;
pub mod policy;
pub mod storage;
pub mod tracker;
pub mod types;

// Re-export key types
pub use client::{ClientId, ClientMask, StorageClient};
pub use config::QuotaSettings;
pub use error::{QuotaError, QuotaResult};
pub use manager::{
    DiskSpaceProbe, EvictionRoundStats, EvictionUsageInfo, QuotaManager, QuotaManagerProxy,
    StorageEvent, StorageObserverFilter, StorageObserverParams,
};
pub use policy::{DefaultStoragePolicy, PolicyChange, StoragePolicy};
pub use types::{GlobalUsage, OriginId, StorageKind, UsageAndQuota, UsageInfo};
