use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use super::sqlite::{read_raw, RawRow, SELECT_COLUMNS};
use super::StoreError;
use crate::metrics::Snapshot;

/// Lazy, ordered walk over persisted snapshots.
///
/// Rows are fetched a page at a time by `(timestamp, id)` keyset, so the
/// connection lock is only held while a page is read. The cursor never
/// yields rows with an id above the bound captured at creation.
pub struct SnapshotCursor {
    conn: Arc<Mutex<Connection>>,
    since_us: i64,
    upper_id: i64,
    page_size: usize,
    last_key: (i64, i64),
    buffer: VecDeque<RawRow>,
    exhausted: bool,
}

impl SnapshotCursor {
    pub(crate) fn new(
        conn: Arc<Mutex<Connection>>,
        since_us: i64,
        upper_id: i64,
        page_size: usize,
    ) -> Self {
        SnapshotCursor {
            conn,
            since_us,
            upper_id,
            page_size,
            last_key: (since_us, i64::MAX),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Start again from the beginning, with the same upper bound.
    pub fn rewind(&mut self) {
        self.last_key = (self.since_us, i64::MAX);
        self.buffer.clear();
        self.exhausted = false;
    }

    /// Drain the cursor, stopping at the first error.
    pub fn collect_all(mut self) -> Result<Vec<Snapshot>, StoreError> {
        let mut out = Vec::new();
        for item in &mut self {
            out.push(item?);
        }
        Ok(out)
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM snapshots
             WHERE id <= ?1
               AND (timestamp_us > ?2 OR (timestamp_us = ?2 AND id > ?3))
             ORDER BY timestamp_us, id
             LIMIT ?4",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![
                    self.upper_id,
                    self.last_key.0,
                    self.last_key.1,
                    self.page_size as i64
                ],
                read_raw,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.last_key = (last.timestamp_us, last.id);
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

impl Iterator for SnapshotCursor {
    type Item = Result<Snapshot, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(RawRow::into_snapshot)
    }
}
