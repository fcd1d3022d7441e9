use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 30 * 60;
pub const DEFAULT_COMMIT_INTERVAL_SECS: u64 = 30;

/// Engine configuration. `data_dir` is required unless `is_incognito` is
/// set, in which case the persistent store lives in memory and vanishes
/// with the process.
#[derive(Debug, Clone)]
pub struct QuotaSettings {
    pub data_dir: Option<PathBuf>,
    pub is_incognito: bool,
    pub eviction_interval: Duration,
    pub eviction_disabled: bool,
    pub commit_interval: Duration,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            is_incognito: false,
            eviction_interval: Duration::from_secs(DEFAULT_EVICTION_INTERVAL_SECS),
            eviction_disabled: false,
            commit_interval: Duration::from_secs(DEFAULT_COMMIT_INTERVAL_SECS),
        }
    }
}

impl QuotaSettings {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(dir) = env::var("QUOTA_DATA_DIR") {
            cfg.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(flag) = env::var("QUOTA_INCOGNITO") {
            cfg.is_incognito = parse_bool(&flag)
                .with_context(|| format!("QUOTA_INCOGNITO is invalid: {flag}"))?;
        }
        if let Ok(interval) = env::var("QUOTA_EVICTION_INTERVAL_SECS") {
            let secs: u64 = interval
                .parse()
                .context("QUOTA_EVICTION_INTERVAL_SECS must be a positive integer")?;
            cfg.eviction_interval = Duration::from_secs(secs);
        }
        if let Ok(flag) = env::var("QUOTA_EVICTION_DISABLED") {
            cfg.eviction_disabled = parse_bool(&flag)
                .with_context(|| format!("QUOTA_EVICTION_DISABLED is invalid: {flag}"))?;
        }
        if let Ok(interval) = env::var("QUOTA_COMMIT_INTERVAL_SECS") {
            let secs: u64 = interval
                .parse()
                .context("QUOTA_COMMIT_INTERVAL_SECS must be a positive integer")?;
            cfg.commit_interval = Duration::from_secs(secs);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.data_dir {
            Some(dir) => ensure_directory(dir)?,
            None => {
                if !self.is_incognito {
                    anyhow::bail!("QUOTA_DATA_DIR is required outside incognito mode");
                }
            }
        }

        if self.eviction_interval.is_zero() {
            anyhow::bail!("QUOTA_EVICTION_INTERVAL_SECS must be greater than zero");
        }
        if self.commit_interval.is_zero() {
            anyhow::bail!("QUOTA_COMMIT_INTERVAL_SECS must be greater than zero");
        }

        Ok(())
    }

    /// Settings for an ephemeral profile: in-memory store, no timers racing
    /// the caller.
    pub fn incognito() -> Self {
        Self {
            data_dir: None,
            is_incognito: true,
            ..Self::default()
        }
    }
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            anyhow::bail!("{} exists but is not a directory", path.display());
        }
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("unable to create data directory {}", path.display()))?;
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => anyhow::bail!("invalid boolean value {value}"),
    }
}
