use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque key identifying a storage principal, conceptually a web origin
/// such as `http://example.com/`. The engine never interprets the value
/// beyond deriving a host for per-host bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(String);

impl OriginId {
    pub fn new(spec: impl Into<String>) -> Self {
        Self(spec.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hostname portion of the origin, lowercased, without scheme or port.
    /// Falls back to the whole spec when no host can be extracted, so every
    /// origin always belongs to exactly one non-empty host bucket.
    pub fn host(&self) -> String {
        let spec = self.0.as_str();
        let rest = match spec.find("://") {
            Some(idx) => &spec[idx + 3..],
            None => return spec.to_ascii_lowercase(),
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let host = if let Some(stripped) = authority.strip_prefix('[') {
            // Bracketed IPv6 literal, keep everything inside the brackets.
            stripped.split(']').next().unwrap_or(authority)
        } else {
            match authority.rsplit_once(':') {
                Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
                _ => authority,
            }
        };
        if host.is_empty() {
            spec.to_ascii_lowercase()
        } else {
            host.to_ascii_lowercase()
        }
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OriginId {
    fn from(spec: &str) -> Self {
        Self(spec.to_string())
    }
}

impl From<String> for OriginId {
    fn from(spec: String) -> Self {
        Self(spec)
    }
}

/// Partition of the quota space. `Unmanaged` marks data outside quota
/// accounting entirely and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Temporary,
    Persistent,
    Syncable,
    Unmanaged,
}

impl StorageKind {
    pub fn is_quota_managed(self) -> bool {
        !matches!(self, StorageKind::Unmanaged)
    }

    /// Stable numeric code used by the persistent store.
    pub fn code(self) -> i64 {
        match self {
            StorageKind::Temporary => 0,
            StorageKind::Persistent => 1,
            StorageKind::Syncable => 2,
            StorageKind::Unmanaged => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(StorageKind::Temporary),
            1 => Some(StorageKind::Persistent),
            2 => Some(StorageKind::Syncable),
            3 => Some(StorageKind::Unmanaged),
            _ => None,
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageKind::Temporary => "temporary",
            StorageKind::Persistent => "persistent",
            StorageKind::Syncable => "syncable",
            StorageKind::Unmanaged => "unmanaged",
        };
        f.write_str(name)
    }
}

/// Global usage totals split by policy classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalUsage {
    /// Bytes counted against quota.
    pub limited: i64,
    /// Bytes held by policy-unlimited origins.
    pub unlimited: i64,
}

impl GlobalUsage {
    pub fn total(&self) -> i64 {
        self.limited.saturating_add(self.unlimited)
    }
}

/// Result of a usage-and-quota query; both values are host-level for the
/// queried origin's host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageAndQuota {
    pub usage: i64,
    pub quota: i64,
}

/// Per-host usage entry produced by the usage report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageInfo {
    pub host: String,
    pub kind: StorageKind,
    pub usage: i64,
}

/// Durable per-host quota override record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostQuotaRow {
    pub host: String,
    pub kind: StorageKind,
    pub quota: i64,
}

/// Durable per-origin access/modification metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginInfoRow {
    pub origin: OriginId,
    pub kind: StorageKind,
    pub used_count: i32,
    pub last_access_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
}
