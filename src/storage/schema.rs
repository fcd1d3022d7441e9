use rusqlite::Connection;

use super::error::StorageError;

/// Layout revision written into the meta table. Version 4 stores lack the
/// `last_modified_time` column and upgrade in place; anything else that is
/// not current is wiped and recreated.
pub const CURRENT_SCHEMA_VERSION: i64 = 5;
pub const UPGRADABLE_SCHEMA_VERSION: i64 = 4;

pub const META_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

pub const CONFIG_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

pub const HOST_QUOTA_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS host_quota (
    host TEXT NOT NULL,
    storage_kind INTEGER NOT NULL,
    quota INTEGER NOT NULL,
    PRIMARY KEY (host, storage_kind)
);
"#;

pub const ORIGIN_INFO_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS origin_info (
    origin TEXT NOT NULL,
    storage_kind INTEGER NOT NULL,
    used_count INTEGER NOT NULL DEFAULT 0,
    last_access_time INTEGER NOT NULL DEFAULT 0,
    last_modified_time INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (origin, storage_kind)
);
"#;

pub const ORIGIN_INFO_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_origin_info_access ON origin_info(storage_kind, last_access_time);
CREATE INDEX IF NOT EXISTS idx_origin_info_modified ON origin_info(storage_kind, last_modified_time);
"#;

const META_SCHEMA_VERSION_KEY: &str = "schema_version";

pub fn init_database(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(META_TABLE_SCHEMA)?;
    conn.execute_batch(CONFIG_TABLE_SCHEMA)?;
    conn.execute_batch(HOST_QUOTA_TABLE_SCHEMA)?;
    conn.execute_batch(ORIGIN_INFO_TABLE_SCHEMA)?;
    conn.execute_batch(ORIGIN_INFO_INDEXES)?;
    write_schema_version(conn, CURRENT_SCHEMA_VERSION)?;
    Ok(())
}

pub fn read_schema_version(conn: &Connection) -> Result<Option<i64>, StorageError> {
    use rusqlite::OptionalExtension;

    let has_meta: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if has_meta.is_none() {
        return Ok(None);
    }

    let version: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            [META_SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

pub fn write_schema_version(conn: &Connection, version: i64) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO meta (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        rusqlite::params![META_SCHEMA_VERSION_KEY, version],
    )?;
    Ok(())
}

/// In-place upgrade from the previous layout: add the modification-time
/// column and seed it from the access time, which is the closest known
/// lower bound for rows written by the old layout.
pub fn upgrade_from_v4(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        r#"
        ALTER TABLE origin_info ADD COLUMN last_modified_time INTEGER NOT NULL DEFAULT 0;
        UPDATE origin_info SET last_modified_time = last_access_time;
        "#,
    )?;
    write_schema_version(conn, CURRENT_SCHEMA_VERSION)?;
    Ok(())
}

/// Drop everything and start over. Quota bookkeeping is a cache of
/// information that can be re-derived, so losing it is acceptable when the
/// stored layout cannot be understood.
pub fn reset_database(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS meta;
        DROP TABLE IF EXISTS config;
        DROP TABLE IF EXISTS host_quota;
        DROP TABLE IF EXISTS origin_info;
        "#,
    )?;
    init_database(conn)
}
