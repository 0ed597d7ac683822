pub mod error;
pub mod models;

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sqlite::configure_connection;

pub use error::{StoreError, StoreResult};
pub use models::{SessionWindow, StreamSession, UploadRecord};

const ARCHIVE_SCHEMA: &str = include_str!("../../../sql/archive.sql");

#[derive(Debug, Clone)]
pub struct ArchiveStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for ArchiveStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl ArchiveStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<ArchiveStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(ArchiveStore { path, flags })
    }
}

/// File-backed store for live sessions and upload records. Connections are
/// opened per call; SQLite's single-writer discipline plus the busy timeout
/// make every operation serializable.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl ArchiveStore {
    pub fn builder() -> ArchiveStoreBuilder {
        ArchiveStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        ArchiveStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(ARCHIVE_SCHEMA)?;
        Ok(())
    }

    // --- sessions ---

    pub fn open_session(&self, streamer: &str, start: NaiveDateTime) -> StoreResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO stream_sessions(streamer_name, start_time, end_time) VALUES (?1, ?2, NULL)",
            params![streamer, start],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record a going-offline edge observed without a matching open session.
    pub fn insert_end_only_session(&self, streamer: &str, end: NaiveDateTime) -> StoreResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO stream_sessions(streamer_name, start_time, end_time) VALUES (?1, NULL, ?2)",
            params![streamer, end],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn close_session(&self, id: i64, end: NaiveDateTime) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE stream_sessions SET end_time = ?2 WHERE id = ?1",
            params![id, end],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    /// Close the most recently started open session for the streamer.
    pub fn close_latest_open_session(
        &self,
        streamer: &str,
        end: NaiveDateTime,
    ) -> StoreResult<Option<i64>> {
        let Some(session) = self.latest_open_session(streamer)? else {
            return Ok(None);
        };
        self.close_session(session.id, end)?;
        Ok(Some(session.id))
    }

    pub fn latest_open_session(&self, streamer: &str) -> StoreResult<Option<StreamSession>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM stream_sessions
             WHERE streamer_name = ?1 AND start_time IS NOT NULL AND end_time IS NULL
             ORDER BY start_time DESC
             LIMIT 1",
        )?;
        let session = stmt
            .query_row([streamer], |row| StreamSession::from_row(row))
            .optional()?;
        Ok(session)
    }

    /// Sessions relevant to uploading: completed ones ending within the
    /// lookback plus the currently open one, ordered by start time.
    pub fn recent_sessions(
        &self,
        streamer: &str,
        lookback_days: i64,
        now: NaiveDateTime,
    ) -> StoreResult<Vec<StreamSession>> {
        let horizon = now - chrono::Duration::days(lookback_days);
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM stream_sessions
             WHERE streamer_name = ?1
               AND start_time IS NOT NULL
               AND end_time IS NOT NULL
               AND end_time > ?2
             ORDER BY start_time ASC",
        )?;
        let mut sessions = stmt
            .query_map(params![streamer, horizon], |row| {
                StreamSession::from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(open) = self.latest_open_session(streamer)? {
            sessions.push(open);
        }
        Ok(sessions)
    }

    /// Force an end time onto sessions open longer than `older_than`. The
    /// synthetic end is start + 12 h, clamped to now.
    pub fn close_stale_sessions(
        &self,
        older_than: chrono::Duration,
        now: NaiveDateTime,
    ) -> StoreResult<usize> {
        let threshold = now - older_than;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM stream_sessions
             WHERE start_time IS NOT NULL AND end_time IS NULL AND start_time < ?1",
        )?;
        let stale = stmt
            .query_map([threshold], |row| StreamSession::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut closed = 0;
        for session in stale {
            let start = match session.start_time {
                Some(start) => start,
                None => continue,
            };
            let end = (start + chrono::Duration::hours(12)).min(now);
            conn.execute(
                "UPDATE stream_sessions SET end_time = ?2 WHERE id = ?1",
                params![session.id, end],
            )?;
            closed += 1;
        }
        Ok(closed)
    }

    pub fn sessions_for_streamer(
        &self,
        streamer: &str,
        limit: usize,
    ) -> StoreResult<Vec<StreamSession>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM stream_sessions
             WHERE streamer_name = ?1
             ORDER BY (start_time IS NULL) ASC, start_time DESC
             LIMIT ?2",
        )?;
        let sessions = stmt
            .query_map(params![streamer, limit as i64], |row| {
                StreamSession::from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    // --- upload records ---

    pub fn insert_upload(
        &self,
        bvid: Option<&str>,
        title: &str,
        first_part_filename: &str,
        at: NaiveDateTime,
    ) -> StoreResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO upload_records(bvid, title, first_part_filename, upload_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![bvid, title, first_part_filename, at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_bvid(&self, id: i64, bvid: &str) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE upload_records SET bvid = ?2 WHERE id = ?1",
            params![id, bvid],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    pub fn find_uploads_in_window(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StoreResult<Vec<UploadRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_records
             WHERE upload_time BETWEEN ?1 AND ?2
             ORDER BY upload_time ASC, id ASC",
        )?;
        let records = stmt
            .query_map(params![start, end], |row| UploadRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count_uploads_in_window(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StoreResult<i64> {
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM upload_records WHERE upload_time BETWEEN ?1 AND ?2",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// The parent submission id for a window, when one is already known.
    pub fn latest_bvid_in_window(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StoreResult<Option<String>> {
        let conn = self.open()?;
        let bvid = conn
            .query_row(
                "SELECT bvid FROM upload_records
                 WHERE upload_time BETWEEN ?1 AND ?2 AND bvid IS NOT NULL
                 ORDER BY upload_time DESC, id DESC
                 LIMIT 1",
                params![start, end],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bvid)
    }

    /// True when the window holds a record still waiting for its parent id.
    pub fn has_pending_in_window(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StoreResult<bool> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM upload_records
             WHERE upload_time BETWEEN ?1 AND ?2 AND bvid IS NULL",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn find_uploads_missing_bvid(&self) -> StoreResult<Vec<UploadRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_records
             WHERE bvid IS NULL
             ORDER BY upload_time DESC",
        )?;
        let records = stmt
            .query_map([], |row| UploadRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn find_upload_by_filename(&self, filename: &str) -> StoreResult<Option<UploadRecord>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare("SELECT * FROM upload_records WHERE first_part_filename = ?1 LIMIT 1")?;
        let record = stmt
            .query_row([filename], |row| UploadRecord::from_row(row))
            .optional()?;
        Ok(record)
    }

    pub fn is_bvid_taken(&self, bvid: &str, excluding_id: i64) -> StoreResult<bool> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM upload_records WHERE bvid = ?1 AND id != ?2",
            params![bvid, excluding_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn recent_uploads(&self, limit: usize) -> StoreResult<Vec<UploadRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_records ORDER BY upload_time DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map([limit as i64], |row| UploadRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
