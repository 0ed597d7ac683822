use chrono::NaiveDateTime;
use rusqlite::Row;
use serde::Serialize;

/// One contiguous live interval for a streamer. At most one session per
/// streamer has a null end time at any instant.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSession {
    pub id: i64,
    pub streamer_name: String,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
}

impl StreamSession {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            streamer_name: row.get("streamer_name")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            created_at: row.get("created_at")?,
        })
    }

    /// Buffered upload window for this session. Open sessions extend to
    /// `now`. Sessions without a start time have no window.
    pub fn window(&self, buffer: chrono::Duration, now: NaiveDateTime) -> Option<SessionWindow> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or(now);
        Some(SessionWindow {
            session_id: self.id,
            session_start: start,
            start: start - buffer,
            end: end + buffer,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub session_id: i64,
    pub session_start: NaiveDateTime,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl SessionWindow {
    /// Boundary timestamps are included.
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.start <= at && at <= self.end
    }
}

/// One persisted upload attempt. `bvid` stays null until the parent
/// submission id is known; at most one record per session window carries a
/// non-null id.
#[derive(Debug, Clone, Serialize)]
pub struct UploadRecord {
    pub id: i64,
    pub bvid: Option<String>,
    pub title: String,
    pub first_part_filename: String,
    pub upload_time: NaiveDateTime,
}

impl UploadRecord {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            bvid: row.get("bvid")?,
            title: row.get("title")?,
            first_part_filename: row.get("first_part_filename")?,
            upload_time: row.get("upload_time")?,
        })
    }
}
