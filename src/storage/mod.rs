pub mod database;
pub mod error;
pub mod schema;

pub use database::{ConfigKey, QuotaDatabase};
pub use error::StorageError;

pub const QUOTA_DB_FILENAME: &str = "quotas.db";
pub const HOST_QUOTA_TABLE: &str = "host_quota";
pub const ORIGIN_INFO_TABLE: &str = "origin_info";
