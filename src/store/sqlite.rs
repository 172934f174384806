use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::codec::{self, PayloadEncoding};
use super::cursor::SnapshotCursor;
use super::{StoreError, StoreStats};
use crate::metrics::Snapshot;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    source_query TEXT    NOT NULL,
    timestamp_us INTEGER NOT NULL,
    encoding     TEXT    NOT NULL,
    payload      BLOB    NOT NULL,
    metric_count INTEGER NOT NULL,
    created_at   TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (source_query, timestamp_us)
);
CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON snapshots (timestamp_us, id);
"#;

pub(crate) const SELECT_COLUMNS: &str = "id, source_query, timestamp_us, encoding, payload";

#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub compress_payloads: bool,
    /// Rows fetched per step by [`SnapshotCursor`].
    pub page_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            compress_payloads: true,
            page_size: 256,
        }
    }
}

/// SQLite-backed snapshot history.
///
/// All access goes through one connection behind a mutex, so every append
/// is a single serialized transaction and readers never see a partial row.
#[derive(Clone)]
pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
    options: StoreOptions,
}

impl SnapshotStore {
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let store = Self::init(conn, options)?;
        info!("snapshot store opened at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, options)
    }

    fn init(conn: Connection, options: StoreOptions) -> Result<Self, StoreError> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::Corruption(format!(
                "schema version {} is newer than supported {}",
                version, SCHEMA_VERSION
            )));
        }
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
            debug!("snapshot schema migrated {} -> {}", version, SCHEMA_VERSION);
        }
        Ok(SnapshotStore {
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Persist a snapshot. Fails with [`StoreError::Duplicate`] when its
    /// `(source_query, timestamp)` already exists and with
    /// [`StoreError::OutOfOrder`] when an older timestamp arrives after a
    /// newer one for the same source.
    pub fn append(&self, snapshot: &Snapshot) -> Result<i64, StoreError> {
        let encoding = if self.options.compress_payloads {
            PayloadEncoding::ZlibJson
        } else {
            PayloadEncoding::Json
        };
        let payload = codec::encode(snapshot.metric_set(), encoding)?;
        let ts_us = snapshot.timestamp().timestamp_micros();

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM snapshots WHERE source_query = ?1 AND timestamp_us = ?2",
                params![snapshot.source_query(), ts_us],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Duplicate {
                source_query: snapshot.source_query().to_string(),
                timestamp: snapshot.timestamp(),
            });
        }

        let latest: Option<i64> = tx.query_row(
            "SELECT MAX(timestamp_us) FROM snapshots WHERE source_query = ?1",
            params![snapshot.source_query()],
            |row| row.get(0),
        )?;
        if let Some(latest_us) = latest.filter(|latest_us| *latest_us > ts_us) {
            return Err(StoreError::OutOfOrder {
                source_query: snapshot.source_query().to_string(),
                timestamp: snapshot.timestamp(),
                latest: micros_to_datetime(latest_us)?,
            });
        }

        tx.execute(
            "INSERT INTO snapshots (source_query, timestamp_us, encoding, payload, metric_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.source_query(),
                ts_us,
                encoding.as_str(),
                payload,
                snapshot.metric_set().len() as i64,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(
            "persisted snapshot {} @ {} as row {} ({} bytes)",
            snapshot.source_query(),
            snapshot.timestamp(),
            id,
            payload.len()
        );
        Ok(id)
    }

    /// Every snapshot with a timestamp strictly after `since`, ascending.
    ///
    /// The cursor is bounded to rows that existed when it was created: an
    /// append racing the iteration is never observed, so a caller that reads
    /// the history and then follows new appends sees each row exactly once.
    pub fn all_since(&self, since: DateTime<Utc>) -> Result<SnapshotCursor, StoreError> {
        self.cursor_from(since.timestamp_micros())
    }

    /// The full history from the first persisted snapshot.
    pub fn history(&self) -> Result<SnapshotCursor, StoreError> {
        self.cursor_from(i64::MIN)
    }

    fn cursor_from(&self, since_us: i64) -> Result<SnapshotCursor, StoreError> {
        let upper_id: i64 =
            self.conn()
                .query_row("SELECT COALESCE(MAX(id), 0) FROM snapshots", [], |row| row.get(0))?;
        Ok(SnapshotCursor::new(
            Arc::clone(&self.conn),
            since_us,
            upper_id,
            self.options.page_size.max(1),
        ))
    }

    /// Most recent snapshot for one source, if any.
    pub fn latest(&self, source_query: &str) -> Result<Option<Snapshot>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM snapshots WHERE source_query = ?1
                     ORDER BY timestamp_us DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![source_query],
                read_raw,
            )
            .optional()?;
        row.map(RawRow::into_snapshot).transpose()
    }

    /// Newest timestamp of one source, read from the key column alone.
    pub fn latest_timestamp_for(
        &self,
        source_query: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let newest: Option<i64> = self.conn().query_row(
            "SELECT MAX(timestamp_us) FROM snapshots WHERE source_query = ?1",
            params![source_query],
            |row| row.get(0),
        )?;
        newest.map(micros_to_datetime).transpose()
    }

    /// Newest timestamp across every source.
    pub fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let newest: Option<i64> =
            self.conn()
                .query_row("SELECT MAX(timestamp_us) FROM snapshots", [], |row| row.get(0))?;
        newest.map(micros_to_datetime).transpose()
    }

    /// Snapshots with `from <= timestamp <= to`, ascending.
    pub fn range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM snapshots WHERE timestamp_us BETWEEN ?1 AND ?2
             ORDER BY timestamp_us, id",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![from.timestamp_micros(), to.timestamp_micros()],
                read_raw,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_snapshot).collect()
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn();
        let (count, sources, oldest, newest): (i64, i64, Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT source_query), MIN(timestamp_us), MAX(timestamp_us)
                 FROM snapshots",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(StoreStats {
            snapshot_count: count as u64,
            source_count: sources as u64,
            oldest: oldest.map(micros_to_datetime).transpose()?,
            newest: newest.map(micros_to_datetime).transpose()?,
            size_bytes: (page_count * page_size).max(0) as u64,
        })
    }

    /// Delete snapshots older than `cutoff`. Retention policy itself is
    /// decided by the caller.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.conn().execute(
            "DELETE FROM snapshots WHERE timestamp_us < ?1",
            params![cutoff.timestamp_micros()],
        )?;
        if removed > 0 {
            info!("pruned {} snapshots older than {}", removed, cutoff);
        }
        Ok(removed)
    }
}

/// Undecoded row as read from the `snapshots` table.
pub(crate) struct RawRow {
    pub id: i64,
    pub source_query: String,
    pub timestamp_us: i64,
    pub encoding: String,
    pub payload: Vec<u8>,
}

pub(crate) fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        source_query: row.get(1)?,
        timestamp_us: row.get(2)?,
        encoding: row.get(3)?,
        payload: row.get(4)?,
    })
}

impl RawRow {
    pub(crate) fn into_snapshot(self) -> Result<Snapshot, StoreError> {
        let encoding: PayloadEncoding = self.encoding.parse()?;
        let metrics = codec::decode(&self.payload, encoding).map_err(|e| match e {
            StoreError::Corruption(msg) => StoreError::Corruption(format!("row {}: {}", self.id, msg)),
            other => other,
        })?;
        let timestamp = micros_to_datetime(self.timestamp_us)?;
        Ok(Snapshot::new(timestamp, &self.source_query, metrics))
    }
}

pub(crate) fn micros_to_datetime(us: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_micros(us)
        .single()
        .ok_or_else(|| StoreError::Corruption(format!("timestamp {}us out of range", us)))
}
