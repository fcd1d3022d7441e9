use std::io;

use rusqlite;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("quota database not found")]
    NotFound,
    #[error("quota database disabled after an earlier failure")]
    Disabled,
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("invalid quota value: {0}")]
    InvalidQuotaValue(String),
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
}
