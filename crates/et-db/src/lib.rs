//! Storage layer for the epoch tracker.
//!
//! Provides an [`EpochStore`] backed by `rusqlite`.
//!
//! # Thread Safety
//!
//! `rusqlite::Connection` is `Send` but not `Sync`, so [`Database`] keeps its
//! connection behind a `Mutex`. The engine and the health monitor should each
//! open their own `Database` on the same file rather than share one: the
//! monitor must keep working even when the engine's side is wedged.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in ISO 8601 format with millisecond precision
//! (e.g., `2024-01-15T10:30:00.000Z`). This ensures:
//! - Lexicographic ordering matches chronological ordering
//! - Human-readable values in the database
//! - Timezone-aware (always UTC)
//!
//! ## Engine State
//!
//! The `engine_state` table is a small key-value table. `tracking_state` and
//! `current_epoch` hold JSON documents; `liveness` holds a timestamp and
//! `init_attempts` an integer, both as text.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use et_core::{EpochAccumulator, EpochStore, FinalizedEpoch, StoreError, TrackingState};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const KEY_TRACKING_STATE: &str = "tracking_state";
const KEY_CURRENT_EPOCH: &str = "current_epoch";
const KEY_LIVENESS: &str = "liveness";
const KEY_INIT_ATTEMPTS: &str = "init_attempts";

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp for {key}: {timestamp}")]
    TimestampParse {
        key: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// Failed to encode or decode a stored JSON value.
    #[error("invalid JSON for {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    /// A stored number does not fit the model.
    #[error("value out of range for {key}: {value}")]
    OutOfRange { key: String, value: i64 },
    /// Another thread panicked while holding the connection.
    #[error("database connection lock poisoned")]
    Poisoned,
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Sqlite(err) => classify_sqlite(&err),
            DbError::TimestampParse { key, timestamp, .. } => Self::Corrupt {
                key,
                message: format!("invalid timestamp {timestamp}"),
            },
            DbError::Json { key, source } => Self::Corrupt {
                key,
                message: source.to_string(),
            },
            DbError::OutOfRange { key, value } => Self::Corrupt {
                key,
                message: format!("value out of range: {value}"),
            },
            DbError::Poisoned => Self::Backend {
                message: "database connection lock poisoned".to_string(),
            },
        }
    }
}

fn classify_sqlite(err: &rusqlite::Error) -> StoreError {
    let message = err.to_string();
    match err.sqlite_error_code() {
        Some(
            ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly
            | ErrorCode::AuthorizationForStatementDenied,
        ) => StoreError::PermissionDenied { message },
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase) => StoreError::NotInitialized,
        _ if message.contains("no such table") => StoreError::NotInitialized,
        _ => StoreError::Backend { message },
    }
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Opens an existing database without write access.
    ///
    /// Used by read-only commands. The schema is not created, so reads from a
    /// database the daemon never initialized fail with
    /// [`StoreError::NotInitialized`].
    pub fn open_read_only(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            -- Finalized epochs, keyed by start time
            -- activity_score: 0-100, or -1 for gap records
            CREATE TABLE IF NOT EXISTS epochs (
                timestamp TEXT PRIMARY KEY,
                activity_score INTEGER NOT NULL,
                epoch_duration_minutes INTEGER NOT NULL,
                is_gap INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_epochs_gap ON epochs(is_gap);

            CREATE TABLE IF NOT EXISTS engine_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn get_value(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put_value(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO engine_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            ",
            params![key, value, format_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DbError> {
        let Some(raw) = self.get_value(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| DbError::Json {
                key: key.to_string(),
                source,
            })
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), DbError> {
        let raw = serde_json::to_string(value).map_err(|source| DbError::Json {
            key: key.to_string(),
            source,
        })?;
        self.put_value(key, &raw)
    }

    fn insert_epochs(&self, epochs: &[FinalizedEpoch]) -> Result<(), DbError> {
        if epochs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO epochs (timestamp, activity_score, epoch_duration_minutes, is_gap)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(timestamp) DO UPDATE SET
                    activity_score = excluded.activity_score,
                    epoch_duration_minutes = excluded.epoch_duration_minutes,
                    is_gap = excluded.is_gap
                ",
            )?;
            for epoch in epochs {
                stmt.execute(params![
                    format_timestamp(epoch.timestamp),
                    epoch.activity_score,
                    epoch.epoch_duration_minutes,
                    epoch.is_gap,
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(count = epochs.len(), "stored finalized epochs");
        Ok(())
    }

    fn list_epochs(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FinalizedEpoch>, DbError> {
        let start = start.map(format_timestamp);
        let end = end.map(format_timestamp);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "
            SELECT timestamp, activity_score, epoch_duration_minutes, is_gap
            FROM epochs
            WHERE (?1 IS NULL OR timestamp >= ?1)
              AND (?2 IS NULL OR timestamp < ?2)
            ORDER BY timestamp ASC
            ",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok(EpochRow {
                timestamp: row.get(0)?,
                activity_score: row.get(1)?,
                epoch_duration_minutes: row.get(2)?,
                is_gap: row.get(3)?,
            })
        })?;
        let mut epochs = Vec::new();
        for row in rows {
            epochs.push(row?.into_epoch()?);
        }
        Ok(epochs)
    }

    fn delete_all(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let epochs = tx.execute("DELETE FROM epochs", [])?;
        tx.execute("DELETE FROM engine_state", [])?;
        tx.commit()?;
        tracing::info!(epochs, "cleared stored epochs and engine state");
        Ok(())
    }
}

#[derive(Debug)]
struct EpochRow {
    timestamp: String,
    activity_score: i32,
    epoch_duration_minutes: i64,
    is_gap: bool,
}

impl EpochRow {
    fn into_epoch(self) -> Result<FinalizedEpoch, DbError> {
        let timestamp = parse_timestamp(&self.timestamp, "epochs.timestamp")?;
        let epoch_duration_minutes =
            u32::try_from(self.epoch_duration_minutes).map_err(|_| DbError::OutOfRange {
                key: format!("epochs[{}].epoch_duration_minutes", self.timestamp),
                value: self.epoch_duration_minutes,
            })?;
        Ok(FinalizedEpoch {
            timestamp,
            activity_score: self.activity_score,
            epoch_duration_minutes,
            is_gap: self.is_gap,
        })
    }
}

impl EpochStore for Database {
    fn get_tracking_state(&self) -> Result<Option<TrackingState>, StoreError> {
        Ok(self.get_json(KEY_TRACKING_STATE)?)
    }

    fn save_tracking_state(&self, state: &TrackingState) -> Result<(), StoreError> {
        Ok(self.put_json(KEY_TRACKING_STATE, state)?)
    }

    fn get_current_epoch(&self) -> Result<Option<EpochAccumulator>, StoreError> {
        Ok(self.get_json(KEY_CURRENT_EPOCH)?)
    }

    fn save_current_epoch(&self, epoch: &EpochAccumulator) -> Result<(), StoreError> {
        Ok(self.put_json(KEY_CURRENT_EPOCH, epoch)?)
    }

    fn save_finalized_epochs(&self, epochs: &[FinalizedEpoch]) -> Result<(), StoreError> {
        Ok(self.insert_epochs(epochs)?)
    }

    fn get_epochs_in_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FinalizedEpoch>, StoreError> {
        Ok(self.list_epochs(start, end)?)
    }

    fn get_liveness(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(raw) = self.get_value(KEY_LIVENESS)? else {
            return Ok(None);
        };
        Ok(Some(parse_timestamp(&raw, KEY_LIVENESS)?))
    }

    fn save_liveness(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(self.put_value(KEY_LIVENESS, &format_timestamp(at))?)
    }

    fn get_init_attempts(&self) -> Result<u64, StoreError> {
        let Some(raw) = self.get_value(KEY_INIT_ATTEMPTS)? else {
            return Ok(0);
        };
        raw.parse().map_err(|_| StoreError::Corrupt {
            key: KEY_INIT_ATTEMPTS.to_string(),
            message: format!("not a counter: {raw}"),
        })
    }

    fn save_init_attempts(&self, attempts: u64) -> Result<(), StoreError> {
        Ok(self.put_value(KEY_INIT_ATTEMPTS, &attempts.to_string())?)
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        Ok(self.delete_all()?)
    }
}

fn parse_timestamp(timestamp: &str, key: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            key: key.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use et_core::{BusyState, GAP_SCORE};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()
    }

    fn epoch_at(timestamp: DateTime<Utc>, activity_score: i32) -> FinalizedEpoch {
        FinalizedEpoch {
            timestamp,
            activity_score,
            epoch_duration_minutes: 15,
            is_gap: false,
        }
    }

    fn table_columns(db: &Database, table: &str) -> Vec<String> {
        let conn = db.conn().expect("lock connection");
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn schema_matches_data_model() {
        let db = Database::open_in_memory().expect("open in-memory db");
        assert_eq!(
            table_columns(&db, "epochs"),
            vec![
                "timestamp",
                "activity_score",
                "epoch_duration_minutes",
                "is_gap"
            ]
        );
        assert_eq!(
            table_columns(&db, "engine_state"),
            vec!["key", "value", "updated_at"]
        );
    }

    #[test]
    fn empty_store_returns_defaults() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_tracking_state().unwrap().is_none());
        assert!(db.get_current_epoch().unwrap().is_none());
        assert!(db.get_liveness().unwrap().is_none());
        assert_eq!(db.get_init_attempts().unwrap(), 0);
        assert!(db.get_epochs_in_range(None, None).unwrap().is_empty());
    }

    #[test]
    fn engine_state_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let state = TrackingState::new(t0(), BusyState::Locked);
        let mut epoch = EpochAccumulator::new(t0(), 15);
        epoch.record(90, true);

        db.save_tracking_state(&state).unwrap();
        db.save_current_epoch(&epoch).unwrap();
        db.save_liveness(t0() + Duration::milliseconds(250)).unwrap();
        db.save_init_attempts(3).unwrap();

        assert_eq!(db.get_tracking_state().unwrap(), Some(state));
        assert_eq!(db.get_current_epoch().unwrap(), Some(epoch));
        assert_eq!(
            db.get_liveness().unwrap(),
            Some(t0() + Duration::milliseconds(250))
        );
        assert_eq!(db.get_init_attempts().unwrap(), 3);
    }

    #[test]
    fn finalized_epochs_upsert_by_timestamp() {
        let db = Database::open_in_memory().unwrap();
        db.save_finalized_epoch(&epoch_at(t0(), 10)).unwrap();
        db.save_finalized_epoch(&epoch_at(t0(), 80)).unwrap();

        let epochs = db.get_epochs_in_range(None, None).unwrap();
        assert_eq!(epochs, vec![epoch_at(t0(), 80)]);
    }

    #[test]
    fn range_query_orders_and_bounds() {
        let db = Database::open_in_memory().unwrap();
        let gap = FinalizedEpoch::gap(t0() + Duration::minutes(15), 180_000);
        db.save_finalized_epochs(&[
            epoch_at(t0() + Duration::minutes(30), 20),
            gap.clone(),
            epoch_at(t0(), 60),
        ])
        .unwrap();

        let all = db.get_epochs_in_range(None, None).unwrap();
        let timestamps: Vec<_> = all.iter().map(|epoch| epoch.timestamp).collect();
        assert_eq!(
            timestamps,
            vec![
                t0(),
                t0() + Duration::minutes(15),
                t0() + Duration::minutes(30)
            ]
        );
        assert_eq!(all[1], gap);
        assert_eq!(all[1].activity_score, GAP_SCORE);

        let from = db
            .get_epochs_in_range(Some(t0() + Duration::minutes(15)), None)
            .unwrap();
        assert_eq!(from.len(), 2);

        let until = db
            .get_epochs_in_range(None, Some(t0() + Duration::minutes(15)))
            .unwrap();
        assert_eq!(until, vec![epoch_at(t0(), 60)]);
    }

    #[test]
    fn data_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("et.db");
        {
            let db = Database::open(&path).unwrap();
            db.save_finalized_epoch(&epoch_at(t0(), 42)).unwrap();
            db.save_tracking_state(&TrackingState::new(t0(), BusyState::Idle))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(
            db.get_epochs_in_range(None, None).unwrap(),
            vec![epoch_at(t0(), 42)]
        );
        assert_eq!(
            db.get_tracking_state().unwrap().unwrap().last_busy_state,
            BusyState::Idle
        );
    }

    #[test]
    fn clear_all_deletes_epochs_and_state() {
        let db = Database::open_in_memory().unwrap();
        db.save_finalized_epoch(&epoch_at(t0(), 42)).unwrap();
        db.save_liveness(t0()).unwrap();
        db.clear_all().unwrap();
        assert!(db.get_epochs_in_range(None, None).unwrap().is_empty());
        assert!(db.get_liveness().unwrap().is_none());
    }

    #[test]
    fn corrupt_json_is_reported_as_corrupt() {
        let db = Database::open_in_memory().unwrap();
        db.put_value(KEY_TRACKING_STATE, "{not json").unwrap();
        let err = db.get_tracking_state().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == KEY_TRACKING_STATE));
        assert!(!err.is_unrecoverable());
    }

    #[test]
    fn read_only_writes_are_permission_errors() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("et.db");
        drop(Database::open(&path).unwrap());

        let db = Database::open_read_only(&path).unwrap();
        let err = db.save_liveness(t0()).unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied { .. }), "{err:?}");
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn missing_schema_is_not_initialized() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .unwrap()
            .execute_batch("DROP TABLE epochs;")
            .unwrap();
        let err = db.get_epochs_in_range(None, None).unwrap_err();
        assert_eq!(err, StoreError::NotInitialized);
    }
}
