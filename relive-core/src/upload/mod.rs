//! Session-grouped, idempotent publication of staged recordings. Each run
//! buckets staged files into session windows, then either appends them to a
//! known parent submission, holds them while a parent id is pending, or
//! creates at most one new parent per session.

pub mod client;
pub mod error;
pub mod meta;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as TimeDelta, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::store::{ArchiveStore, SessionWindow};

pub use client::{BiliupCliClient, FeedStatus, NewSubmission, UploadClient};
pub use error::{UploadClientError, UploadError, UploadResult};
pub use meta::SubmissionMeta;

/// Filename anchor kept literal for compatibility with on-disk history.
pub const DEFAULT_TIMESTAMP_PATTERN: &str = r"录播(\d{4}-\d{2}-\d{2}T\d{2}_\d{2}_\d{2})";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H_%M_%S";

/// Feature flags snapshot taken at task entry; they never change mid-run.
#[derive(Debug, Clone, Copy)]
pub struct UploadTaskFlags {
    pub skip_encoding: bool,
    pub delete_after_upload: bool,
}

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub staging_dir: PathBuf,
    pub streamers: Vec<String>,
    pub buffer_minutes: i64,
    pub lookback_days: i64,
    pub danmaku_title_suffix: String,
    pub no_danmaku_title_suffix: String,
    pub feed_size: u32,
    pub backfill_attempts: u32,
    pub backfill_wait: Duration,
    pub timestamp_pattern: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::new(),
            streamers: Vec::new(),
            buffer_minutes: 10,
            lookback_days: 3,
            danmaku_title_suffix: "【弹幕版】".to_string(),
            no_danmaku_title_suffix: "【无弹幕版】".to_string(),
            feed_size: 20,
            backfill_attempts: 3,
            backfill_wait: Duration::from_secs(15),
            timestamp_pattern: DEFAULT_TIMESTAMP_PATTERN.to_string(),
        }
    }
}

/// What one run attempted and where it ended up; returned to manual triggers
/// as-is.
#[derive(Debug, Default, Clone, Serialize)]
pub struct UploadReport {
    pub scanned: usize,
    pub skipped_recorded: usize,
    pub unparsable: usize,
    pub orphans: usize,
    pub pending_held: usize,
    pub created: usize,
    pub appended: usize,
    pub failed: usize,
    pub backfilled: usize,
}

#[derive(Debug, Clone)]
struct StagedFile {
    path: PathBuf,
    filename: String,
    streamer: String,
    timestamp: NaiveDateTime,
}

pub struct Uploader {
    store: ArchiveStore,
    client: Arc<dyn UploadClient>,
    config: UploaderConfig,
    meta_path: PathBuf,
    pattern: Regex,
    run_lock: Mutex<()>,
    cancel: AtomicBool,
}

impl Uploader {
    pub fn new(
        store: ArchiveStore,
        client: Arc<dyn UploadClient>,
        config: UploaderConfig,
        meta_path: impl Into<PathBuf>,
    ) -> Self {
        let pattern = Regex::new(&config.timestamp_pattern)
            .unwrap_or_else(|_| Regex::new(DEFAULT_TIMESTAMP_PATTERN).unwrap());
        Self {
            store,
            client,
            config,
            meta_path: meta_path.into(),
            pattern,
            run_lock: Mutex::new(()),
            cancel: AtomicBool::new(false),
        }
    }

    /// Ask the running pass to stop at the next file boundary. A submission
    /// or append call already in flight runs to completion.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Resolves once no upload pass is active.
    pub async fn wait_idle(&self) {
        let _guard = self.run_lock.lock().await;
    }

    /// One upload tick: login check, parent-id back-fill, then the
    /// session-grouped upload pass. At most one instance runs at a time.
    pub async fn run_once(
        &self,
        flags: UploadTaskFlags,
        now: NaiveDateTime,
    ) -> UploadResult<UploadReport> {
        let _guard = self.run_lock.lock().await;
        if !self.client.check_login().await? {
            return Err(UploadError::LoginRejected);
        }
        let mut report = UploadReport::default();
        report.backfilled += self.backfill_missing().await?;
        self.upload_pass(flags, now, &mut report).await?;
        info!(report = ?report, "upload tick finished");
        Ok(report)
    }

    /// Re-query the feed for every record with a missing parent id and fill
    /// in ids matched by exact title.
    pub async fn update_missing_bvids(&self) -> UploadResult<usize> {
        let _guard = self.run_lock.lock().await;
        if !self.client.check_login().await? {
            return Err(UploadError::LoginRejected);
        }
        self.backfill_missing().await
    }

    async fn backfill_missing(&self) -> UploadResult<usize> {
        let records = self.store.find_uploads_missing_bvid()?;
        if records.is_empty() {
            return Ok(0);
        }
        let feed = self
            .client
            .feed(self.config.feed_size, FeedStatus::PublishedAndBeingPublished)
            .await?;
        let mut updated = 0;
        for record in records {
            let Some(bvid) = feed.get(&record.title) else {
                continue;
            };
            if self.store.is_bvid_taken(bvid, record.id)? {
                warn!(
                    bvid = %bvid,
                    record = record.id,
                    "feed match already claimed by another record"
                );
                continue;
            }
            self.store.set_bvid(record.id, bvid)?;
            info!(record = record.id, bvid = %bvid, title = %record.title, "parent id back-filled");
            updated += 1;
        }
        Ok(updated)
    }

    async fn upload_pass(
        &self,
        flags: UploadTaskFlags,
        now: NaiveDateTime,
        report: &mut UploadReport,
    ) -> UploadResult<()> {
        let meta = SubmissionMeta::load(&self.meta_path)?;
        let extension = if flags.skip_encoding { "flv" } else { "mp4" };
        let suffix = if flags.skip_encoding {
            self.config.no_danmaku_title_suffix.as_str()
        } else {
            self.config.danmaku_title_suffix.as_str()
        };

        let mut files = self.scan_staging(extension, report)?;
        if files.is_empty() {
            return Ok(());
        }
        files.sort_by_key(|f| f.timestamp);

        let mut fresh = Vec::new();
        for file in files {
            if self.store.find_upload_by_filename(&file.filename)?.is_some() {
                report.skipped_recorded += 1;
                continue;
            }
            fresh.push(file);
        }
        if fresh.is_empty() {
            return Ok(());
        }

        let buffer = TimeDelta::minutes(self.config.buffer_minutes);
        for streamer in &self.config.streamers {
            let streamer_files: Vec<StagedFile> = fresh
                .iter()
                .filter(|f| f.streamer == *streamer)
                .cloned()
                .collect();
            if streamer_files.is_empty() {
                continue;
            }
            let sessions = self
                .store
                .recent_sessions(streamer, self.config.lookback_days, now)?;
            let mut windows: Vec<SessionWindow> = sessions
                .iter()
                .filter_map(|s| s.window(buffer, now))
                .collect();
            windows.sort_by_key(|w| w.session_start);

            let (buckets, orphans) = bucket_files(streamer_files, &windows);
            for orphan in &orphans {
                warn!(
                    file = %orphan.filename,
                    "no session window matches this recording, leaving it for later"
                );
            }
            report.orphans += orphans.len();

            for (window, bucket) in buckets {
                if self.cancelled() {
                    info!("cancellation requested, stopping before the next session bucket");
                    return Ok(());
                }
                self.process_bucket(&window, &bucket, &meta, flags, suffix, report)
                    .await?;
            }
        }

        let unmatched = fresh
            .iter()
            .filter(|f| !self.config.streamers.contains(&f.streamer))
            .count();
        if unmatched > 0 {
            warn!(unmatched, "staged files belong to no configured streamer");
            report.orphans += unmatched;
        }
        Ok(())
    }

    async fn process_bucket(
        &self,
        window: &SessionWindow,
        bucket: &[StagedFile],
        meta: &SubmissionMeta,
        flags: UploadTaskFlags,
        suffix: &str,
        report: &mut UploadReport,
    ) -> UploadResult<()> {
        if let Some(bvid) = self.store.latest_bvid_in_window(window.start, window.end)? {
            self.append_bucket(window, bucket, &bvid, meta, flags, suffix, report)
                .await
        } else if self.store.has_pending_in_window(window.start, window.end)? {
            info!(
                session = window.session_id,
                files = bucket.len(),
                "parent id still pending back-fill, holding this session's files"
            );
            report.pending_held += bucket.len();
            Ok(())
        } else {
            self.create_submission(bucket, meta, flags, suffix, report)
                .await
        }
    }

    async fn append_bucket(
        &self,
        window: &SessionWindow,
        bucket: &[StagedFile],
        bvid: &str,
        meta: &SubmissionMeta,
        flags: UploadTaskFlags,
        suffix: &str,
        report: &mut UploadReport,
    ) -> UploadResult<()> {
        for file in bucket {
            if self.cancelled() {
                info!("cancellation requested, stopping at a file boundary");
                return Ok(());
            }
            if self.store.find_upload_by_filename(&file.filename)?.is_some() {
                report.skipped_recorded += 1;
                continue;
            }
            // Recomputed per file: a failed append writes no record, so its
            // part slot is retried on the next round.
            let part_number = self
                .store
                .count_uploads_in_window(window.start, window.end)?
                + 1;
            let part_time = file.timestamp.format("%H:%M:%S");
            let part_title = if flags.skip_encoding {
                format!("P{part_number} {part_time} {suffix}")
            } else {
                format!("P{part_number} {part_time}")
            };
            info!(file = %file.filename, part = %part_title, bvid = %bvid, "appending part");
            match self
                .client
                .append_part(&file.path, bvid, meta.cdn.as_deref(), &part_title)
                .await
            {
                Ok(()) => {
                    self.store.insert_upload(
                        None,
                        &format!("{part_title} (分P)"),
                        &file.filename,
                        file.timestamp,
                    )?;
                    report.appended += 1;
                    self.maybe_delete(file, flags).await;
                }
                Err(err) => {
                    error!(file = %file.filename, error = %err, "append failed");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// NEW_UPLOAD: only the first file goes up this round so no further part
    /// commits to a parent whose id is not yet known.
    async fn create_submission(
        &self,
        bucket: &[StagedFile],
        meta: &SubmissionMeta,
        flags: UploadTaskFlags,
        suffix: &str,
        report: &mut UploadReport,
    ) -> UploadResult<()> {
        let Some(first) = bucket.first() else {
            return Ok(());
        };
        if self.cancelled() {
            info!("cancellation requested, not starting a new submission");
            return Ok(());
        }
        let title = format!("{} {}", meta.render_title(first.timestamp.date()), suffix);
        let submission = NewSubmission {
            title: title.clone(),
            tid: meta.tid,
            tags: meta.tag.clone(),
            source: meta.source.clone(),
            desc: meta.desc.clone(),
            cover: meta.cover.clone(),
            dynamic: meta.dynamic.clone(),
            copyright: 2,
        };
        info!(file = %first.filename, title = %title, "creating new parent submission");
        match self.client.upload_new(&first.path, &submission).await {
            Ok(bvid) => {
                let record_id = self.store.insert_upload(
                    bvid.as_deref(),
                    &title,
                    &first.filename,
                    first.timestamp,
                )?;
                report.created += 1;
                self.maybe_delete(first, flags).await;
                if bvid.is_none() && self.backfill_new_submission(record_id, &title).await? {
                    report.backfilled += 1;
                }
                if bucket.len() > 1 {
                    info!(
                        remaining = bucket.len() - 1,
                        "remaining files in this session wait for the next round"
                    );
                }
            }
            Err(err) => {
                error!(file = %first.filename, error = %err, "new submission failed");
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Poll the feed for the freshly created submission's id. The feed query
    /// covers both published and still-publishing states.
    async fn backfill_new_submission(
        &self,
        record_id: i64,
        title: &str,
    ) -> UploadResult<bool> {
        for attempt in 1..=self.config.backfill_attempts {
            sleep(self.config.backfill_wait).await;
            if self.cancelled() {
                break;
            }
            let feed = match self
                .client
                .feed(self.config.feed_size, FeedStatus::PublishedAndBeingPublished)
                .await
            {
                Ok(feed) => feed,
                Err(err) => {
                    warn!(attempt, error = %err, "feed query failed");
                    continue;
                }
            };
            if let Some(bvid) = feed.get(title) {
                if self.store.is_bvid_taken(bvid, record_id)? {
                    warn!(bvid = %bvid, "feed match already claimed, leaving record pending");
                    return Ok(false);
                }
                self.store.set_bvid(record_id, bvid)?;
                info!(record = record_id, bvid = %bvid, "parent id back-filled after submit");
                return Ok(true);
            }
        }
        info!(
            record = record_id,
            "parent id still unknown, the periodic back-fill will retry"
        );
        Ok(false)
    }

    fn scan_staging(
        &self,
        extension: &str,
        report: &mut UploadReport,
    ) -> UploadResult<Vec<StagedFile>> {
        let entries = match std::fs::read_dir(&self.config.staging_dir) {
            Ok(entries) => entries,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(UploadError::Io {
                    path: self.config.staging_dir.clone(),
                    source,
                })
            }
        };
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            report.scanned += 1;
            match parse_staged_filename(filename, &self.pattern) {
                Some((streamer, timestamp)) => files.push(StagedFile {
                    filename: filename.to_string(),
                    streamer,
                    timestamp,
                    path,
                }),
                None => {
                    warn!(file = %filename, "filename carries no recording timestamp, skipping");
                    report.unparsable += 1;
                }
            }
        }
        Ok(files)
    }

    async fn maybe_delete(&self, file: &StagedFile, flags: UploadTaskFlags) {
        if !flags.delete_after_upload {
            return;
        }
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => info!(file = %file.filename, "removed uploaded file"),
            Err(err) => warn!(file = %file.filename, error = %err, "failed to remove uploaded file"),
        }
    }
}

/// Split a staged filename into streamer prefix and recording timestamp.
fn parse_staged_filename(filename: &str, pattern: &Regex) -> Option<(String, NaiveDateTime)> {
    let caps = pattern.captures(filename)?;
    let stamp = caps.get(1)?;
    let timestamp = NaiveDateTime::parse_from_str(stamp.as_str(), TIMESTAMP_FORMAT).ok()?;
    let anchor = caps.get(0)?;
    Some((filename[..anchor.start()].to_string(), timestamp))
}

/// Assign each file to the first window containing its timestamp; windows
/// must be ordered by session start, which makes the overlap tie-break
/// stable. Files matching no window are returned separately.
fn bucket_files(
    files: Vec<StagedFile>,
    windows: &[SessionWindow],
) -> (Vec<(SessionWindow, Vec<StagedFile>)>, Vec<StagedFile>) {
    let mut buckets: Vec<(SessionWindow, Vec<StagedFile>)> =
        windows.iter().map(|w| (*w, Vec::new())).collect();
    let mut orphans = Vec::new();
    'files: for file in files {
        for (window, bucket) in buckets.iter_mut() {
            if window.contains(file.timestamp) {
                bucket.push(file);
                continue 'files;
            }
        }
        orphans.push(file);
    }
    buckets.retain(|(_, bucket)| !bucket.is_empty());
    (buckets, orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 24)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn staged(name: &str, at: NaiveDateTime) -> StagedFile {
        StagedFile {
            path: PathBuf::from(name),
            filename: name.to_string(),
            streamer: "S".to_string(),
            timestamp: at,
        }
    }

    fn window(id: i64, start: NaiveDateTime, end: NaiveDateTime) -> SessionWindow {
        SessionWindow {
            session_id: id,
            session_start: start,
            start,
            end,
        }
    }

    #[test]
    fn filename_parsing_extracts_streamer_and_timestamp() {
        let pattern = Regex::new(DEFAULT_TIMESTAMP_PATTERN).unwrap();
        let (streamer, at) =
            parse_staged_filename("银剑君录播2026-02-24T10_30_00.mp4", &pattern).unwrap();
        assert_eq!(streamer, "银剑君");
        assert_eq!(at, ts(10, 30));
        assert!(parse_staged_filename("random_video.mp4", &pattern).is_none());
        assert!(parse_staged_filename("银剑君录播2026-13-99T10_30_00.mp4", &pattern).is_none());
    }

    #[test]
    fn boundary_timestamps_are_included() {
        let w = window(1, ts(10, 0), ts(12, 0));
        let (buckets, orphans) = bucket_files(
            vec![staged("a", ts(10, 0)), staged("b", ts(12, 0)), staged("c", ts(12, 1))],
            &[w],
        );
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].1.len(), 2);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].filename, "c");
    }

    #[test]
    fn overlapping_windows_bind_to_earliest_session() {
        let first = window(1, ts(9, 0), ts(11, 0));
        let second = window(2, ts(10, 0), ts(13, 0));
        let (buckets, orphans) =
            bucket_files(vec![staged("x", ts(10, 30))], &[first, second]);
        assert!(orphans.is_empty());
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].0.session_id, 1);
    }
}
