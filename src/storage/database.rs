use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::types::{HostQuotaRow, OriginId, OriginInfoRow, StorageKind};

use super::error::StorageError;
use super::schema;
use super::QUOTA_DB_FILENAME;

const META_BOOTSTRAP_KEY: &str = "origins_bootstrapped";

/// Recognized keys of the persistent config table. Keeping this closed
/// makes an unknown-key write unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    TemporaryQuotaOverride,
    DesiredAvailableSpace,
}

impl ConfigKey {
    fn as_str(self) -> &'static str {
        match self {
            ConfigKey::TemporaryQuotaOverride => "temporary_quota_override",
            ConfigKey::DesiredAvailableSpace => "desired_available_space",
        }
    }
}

struct DbState {
    conn: Option<Connection>,
    disabled: bool,
    in_transaction: bool,
}

/// Durable bookkeeping store: per-host quota overrides, per-origin
/// access/modification metadata, a tiny config map, and the schema marker.
///
/// The connection opens lazily on first use. Writes accumulate inside one
/// open transaction until `commit`, so reads through the same store observe
/// buffered writes while a concurrent reopen of the file does not. Any
/// structural failure flips a sticky disabled flag; from then on every call
/// fails fast and callers fall back to defaults.
pub struct QuotaDatabase {
    db_path: Option<PathBuf>,
    state: Mutex<DbState>,
}

impl QuotaDatabase {
    /// Store backed by `<data_dir>/quotas.db`. No I/O happens here.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            db_path: Some(data_dir.join(QUOTA_DB_FILENAME)),
            state: Mutex::new(DbState {
                conn: None,
                disabled: false,
                in_transaction: false,
            }),
        }
    }

    /// Ephemeral store for incognito profiles; contents vanish on drop.
    pub fn in_memory() -> Self {
        Self {
            db_path: None,
            state: Mutex::new(DbState {
                conn: None,
                disabled: false,
                in_transaction: false,
            }),
        }
    }

    /// Idempotent explicit open. Fails with `NotFound` when the store file
    /// is absent and `create_if_missing` is false.
    pub fn open(&self, create_if_missing: bool) -> Result<(), StorageError> {
        let mut state = self.lock_state()?;
        if self.ensure_open(&mut state, create_if_missing)? {
            Ok(())
        } else {
            Err(StorageError::NotFound)
        }
    }

    pub fn is_disabled(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.disabled,
            Err(_) => true,
        }
    }

    pub fn get_host_quota(
        &self,
        host: &str,
        kind: StorageKind,
    ) -> Result<Option<i64>, StorageError> {
        let found = self.with_connection(false, |conn| {
            conn.query_row(
                r#"
                SELECT quota FROM host_quota
                WHERE host = ?1 AND storage_kind = ?2
                "#,
                params![host, kind.code()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })?;
        Ok(found.flatten())
    }

    pub fn set_host_quota(
        &self,
        host: &str,
        kind: StorageKind,
        quota: i64,
    ) -> Result<(), StorageError> {
        if quota < 0 {
            return Err(StorageError::InvalidQuotaValue(format!(
                "quota for host {host} must not be negative"
            )));
        }

        self.with_transaction(|conn| {
            conn.execute(
                r#"
                INSERT INTO host_quota (host, storage_kind, quota)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(host, storage_kind) DO UPDATE SET
                    quota = excluded.quota
                "#,
                params![host, kind.code(), quota],
            )?;
            Ok(())
        })
    }

    pub fn delete_host_quota(&self, host: &str, kind: StorageKind) -> Result<(), StorageError> {
        self.with_transaction(|conn| {
            conn.execute(
                "DELETE FROM host_quota WHERE host = ?1 AND storage_kind = ?2",
                params![host, kind.code()],
            )?;
            Ok(())
        })
    }

    /// Bumps the access time and use counter, creating the row on first
    /// access with a zero modification time.
    pub fn set_origin_last_access(
        &self,
        origin: &OriginId,
        kind: StorageKind,
        time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.with_transaction(|conn| {
            conn.execute(
                r#"
                INSERT INTO origin_info (origin, storage_kind, used_count, last_access_time, last_modified_time)
                VALUES (?1, ?2, 1, ?3, 0)
                ON CONFLICT(origin, storage_kind) DO UPDATE SET
                    used_count = used_count + 1,
                    last_access_time = excluded.last_access_time
                "#,
                params![origin.as_str(), kind.code(), micros_from_time(time)],
            )?;
            Ok(())
        })
    }

    /// Updates the modification time without touching the use counter. A row
    /// created here has a zero access time and is an immediate LRU candidate.
    pub fn set_origin_last_modified(
        &self,
        origin: &OriginId,
        kind: StorageKind,
        time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.with_transaction(|conn| {
            conn.execute(
                r#"
                INSERT INTO origin_info (origin, storage_kind, used_count, last_access_time, last_modified_time)
                VALUES (?1, ?2, 0, 0, ?3)
                ON CONFLICT(origin, storage_kind) DO UPDATE SET
                    last_modified_time = excluded.last_modified_time
                "#,
                params![origin.as_str(), kind.code(), micros_from_time(time)],
            )?;
            Ok(())
        })
    }

    pub fn get_origin_info(
        &self,
        origin: &OriginId,
        kind: StorageKind,
    ) -> Result<Option<OriginInfoRow>, StorageError> {
        let found = self.with_connection(false, |conn| {
            conn.query_row(
                r#"
                SELECT origin, storage_kind, used_count, last_access_time, last_modified_time
                FROM origin_info
                WHERE origin = ?1 AND storage_kind = ?2
                "#,
                params![origin.as_str(), kind.code()],
                map_origin_info_row,
            )
            .optional()
        })?;
        Ok(found.flatten())
    }

    pub fn delete_origin_info(
        &self,
        origin: &OriginId,
        kind: StorageKind,
    ) -> Result<(), StorageError> {
        self.with_transaction(|conn| {
            conn.execute(
                "DELETE FROM origin_info WHERE origin = ?1 AND storage_kind = ?2",
                params![origin.as_str(), kind.code()],
            )?;
            Ok(())
        })
    }

    /// Least-recently-accessed origin of the given class, skipping members
    /// of `exceptions` and anything `is_exempt` rules out.
    pub fn get_lru_origin<F>(
        &self,
        kind: StorageKind,
        exceptions: &HashSet<OriginId>,
        is_exempt: F,
    ) -> Result<Option<OriginId>, StorageError>
    where
        F: Fn(&OriginId) -> bool,
    {
        let found = self.with_connection(false, |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT origin FROM origin_info
                WHERE storage_kind = ?1
                ORDER BY last_access_time ASC
                "#,
            )?;
            let rows = stmt.query_map(params![kind.code()], |row| row.get::<_, String>(0))?;
            for row in rows {
                let origin = OriginId::from(row?);
                if exceptions.contains(&origin) || is_exempt(&origin) {
                    continue;
                }
                return Ok(Some(origin));
            }
            Ok(None)
        })?;
        Ok(found.flatten())
    }

    pub fn get_origins_modified_since(
        &self,
        kind: StorageKind,
        since: DateTime<Utc>,
    ) -> Result<HashSet<OriginId>, StorageError> {
        let found = self.with_connection(false, |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT origin FROM origin_info
                WHERE storage_kind = ?1 AND last_modified_time >= ?2
                "#,
            )?;
            let rows = stmt.query_map(
                params![kind.code(), micros_from_time(since)],
                |row| row.get::<_, String>(0),
            )?;
            let mut origins = HashSet::new();
            for row in rows {
                origins.insert(OriginId::from(row?));
            }
            Ok(origins)
        })?;
        Ok(found.unwrap_or_default())
    }

    /// Insert-if-absent backfill with zero times, so origins that existed
    /// before this store did become eviction candidates immediately.
    /// Calling it again with the same set changes nothing.
    pub fn register_initial_origins(
        &self,
        origins: &HashSet<OriginId>,
        kind: StorageKind,
    ) -> Result<(), StorageError> {
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare(
                r#"
                INSERT OR IGNORE INTO origin_info
                    (origin, storage_kind, used_count, last_access_time, last_modified_time)
                VALUES (?1, ?2, 0, 0, 0)
                "#,
            )?;
            for origin in origins {
                stmt.execute(params![origin.as_str(), kind.code()])?;
            }
            Ok(())
        })
    }

    pub fn get_config_value(&self, key: ConfigKey) -> Result<Option<i64>, StorageError> {
        let found = self.with_connection(false, |conn| {
            conn.query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })?;
        Ok(found.flatten())
    }

    pub fn set_config_value(&self, key: ConfigKey, value: i64) -> Result<(), StorageError> {
        self.with_transaction(|conn| {
            conn.execute(
                r#"
                INSERT INTO config (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
                params![key.as_str(), value],
            )?;
            Ok(())
        })
    }

    pub fn is_bootstrapped(&self) -> Result<bool, StorageError> {
        let found = self.with_connection(false, |conn| {
            conn.query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![META_BOOTSTRAP_KEY],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })?;
        Ok(matches!(found.flatten(), Some(value) if value != 0))
    }

    pub fn set_bootstrapped(&self, flag: bool) -> Result<(), StorageError> {
        self.with_transaction(|conn| {
            conn.execute(
                r#"
                INSERT INTO meta (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
                params![META_BOOTSTRAP_KEY, i64::from(flag)],
            )?;
            Ok(())
        })
    }

    pub fn dump_host_quota_table(&self) -> Result<Vec<HostQuotaRow>, StorageError> {
        let found = self.with_connection(false, |conn| {
            let mut stmt = conn.prepare(
                "SELECT host, storage_kind, quota FROM host_quota ORDER BY host, storage_kind",
            )?;
            let rows = stmt.query_map([], |row| {
                let code: i64 = row.get(1)?;
                Ok(HostQuotaRow {
                    host: row.get(0)?,
                    kind: StorageKind::from_code(code).unwrap_or(StorageKind::Unmanaged),
                    quota: row.get(2)?,
                })
            })?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })?;
        Ok(found.unwrap_or_default())
    }

    pub fn dump_origin_info_table(&self) -> Result<Vec<OriginInfoRow>, StorageError> {
        let found = self.with_connection(false, |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT origin, storage_kind, used_count, last_access_time, last_modified_time
                FROM origin_info
                ORDER BY origin, storage_kind
                "#,
            )?;
            let rows = stmt.query_map([], map_origin_info_row)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })?;
        Ok(found.unwrap_or_default())
    }

    /// Flush the buffered transaction, if any. A no-op when nothing is
    /// pending.
    pub fn commit(&self) -> Result<(), StorageError> {
        let mut state = self.lock_state()?;
        if state.disabled {
            return Err(StorageError::Disabled);
        }
        if !state.in_transaction {
            return Ok(());
        }
        let result = match state.conn.as_ref() {
            Some(conn) => conn.execute_batch("COMMIT"),
            None => return Err(StorageError::Disabled),
        };
        match result {
            Ok(()) => {
                state.in_transaction = false;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "quota database commit failed, disabling store");
                state.disabled = true;
                Err(err.into())
            }
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, DbState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Runs a read against the open connection. `Ok(None)` means the store
    /// file does not exist and `create_if_missing` was false; callers serve
    /// their default.
    fn with_connection<T, F>(
        &self,
        create_if_missing: bool,
        op: F,
    ) -> Result<Option<T>, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let mut state = self.lock_state()?;
        if !self.ensure_open(&mut state, create_if_missing)? {
            return Ok(None);
        }
        let result = match state.conn.as_ref() {
            Some(conn) => op(conn),
            None => return Err(StorageError::Disabled),
        };
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(error = %err, "quota database operation failed, disabling store");
                state.disabled = true;
                Err(err.into())
            }
        }
    }

    /// Runs a write inside the buffered transaction, starting one if none
    /// is open yet.
    fn with_transaction<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let mut state = self.lock_state()?;
        if !self.ensure_open(&mut state, true)? {
            return Err(StorageError::NotFound);
        }
        if !state.in_transaction {
            let begun = match state.conn.as_ref() {
                Some(conn) => conn.execute_batch("BEGIN"),
                None => return Err(StorageError::Disabled),
            };
            if let Err(err) = begun {
                warn!(error = %err, "failed to begin quota transaction, disabling store");
                state.disabled = true;
                return Err(err.into());
            }
            state.in_transaction = true;
        }
        let result = match state.conn.as_ref() {
            Some(conn) => op(conn),
            None => return Err(StorageError::Disabled),
        };
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(error = %err, "quota database write failed, disabling store");
                state.disabled = true;
                Err(err.into())
            }
        }
    }

    fn ensure_open(
        &self,
        state: &mut DbState,
        create_if_missing: bool,
    ) -> Result<bool, StorageError> {
        if state.disabled {
            return Err(StorageError::Disabled);
        }
        if state.conn.is_some() {
            return Ok(true);
        }

        let conn = match self.open_connection(create_if_missing) {
            Ok(Some(conn)) => conn,
            Ok(None) => return Ok(false),
            Err(err) => {
                warn!(error = %err, "failed to open quota database, disabling store");
                state.disabled = true;
                return Err(err);
            }
        };

        if let Err(err) = prepare_schema(&conn) {
            warn!(error = %err, "failed to prepare quota schema, disabling store");
            state.disabled = true;
            return Err(err);
        }

        state.conn = Some(conn);
        Ok(true)
    }

    fn open_connection(
        &self,
        create_if_missing: bool,
    ) -> Result<Option<Connection>, StorageError> {
        match &self.db_path {
            None => Ok(Some(Connection::open_in_memory()?)),
            Some(path) => {
                if !path.exists() {
                    if !create_if_missing {
                        return Ok(None);
                    }
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let conn = Connection::open(path)?;
                conn.pragma_update(None, "foreign_keys", "ON")?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                Ok(Some(conn))
            }
        }
    }
}

fn prepare_schema(conn: &Connection) -> Result<(), StorageError> {
    match schema::read_schema_version(conn)? {
        Some(schema::CURRENT_SCHEMA_VERSION) => Ok(()),
        Some(schema::UPGRADABLE_SCHEMA_VERSION) => match schema::upgrade_from_v4(conn) {
            Ok(()) => {
                debug!("upgraded quota schema from version {}", schema::UPGRADABLE_SCHEMA_VERSION);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "quota schema upgrade failed, recreating store");
                schema::reset_database(conn)
            }
        },
        Some(version) => {
            warn!(version, "unsupported quota schema version, recreating store");
            schema::reset_database(conn)
        }
        None => {
            let tables: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )?;
            if tables == 0 {
                schema::init_database(conn)
            } else {
                warn!("quota database has no schema marker, recreating store");
                schema::reset_database(conn)
            }
        }
    }
}

fn map_origin_info_row(row: &rusqlite::Row<'_>) -> Result<OriginInfoRow, rusqlite::Error> {
    let code: i64 = row.get(1)?;
    Ok(OriginInfoRow {
        origin: OriginId::from(row.get::<_, String>(0)?),
        kind: StorageKind::from_code(code).unwrap_or(StorageKind::Unmanaged),
        used_count: row.get(2)?,
        last_access_time: time_from_micros(row.get(3)?),
        last_modified_time: time_from_micros(row.get(4)?),
    })
}

fn micros_from_time(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn time_from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}
