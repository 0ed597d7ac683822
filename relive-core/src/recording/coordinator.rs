//! Per-streamer segment coordinator. Drives the OFFLINE → RESOLVING →
//! RECORDING → CLOSING cycle, racing the transcoder and the chat collector
//! against the segment clock and publishing finished artifacts by renaming
//! their `.part` files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::danmaku::DanmakuCollector;
use crate::monitor::StatusMonitor;
use crate::resolver::{ResolvedStream, StreamUrlResolver};

use super::recorder::{RecordError, RecordOutcome, StreamRecorder};
use super::wait_for_stop;

const COLLECTOR_STOP_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Offline,
    Resolving,
    Recording,
    Closing,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub processing_dir: PathBuf,
    pub segment_duration: Duration,
    pub retry_delay: Duration,
    pub cooldown: Duration,
    pub resolve_max_attempts: u32,
}

/// The pair of files one segment produces. Both carry the `.part` suffix
/// until [`SegmentArtifact::finalize`] renames them, XML first so downstream
/// stages only ever see a complete pair once the FLV is visible.
#[derive(Debug, Clone)]
pub struct SegmentArtifact {
    base: String,
    flv_part: PathBuf,
    xml_part: PathBuf,
}

impl SegmentArtifact {
    pub fn new(dir: &Path, streamer: &str, at: NaiveDateTime) -> Self {
        let base = format!("{streamer}录播{}", at.format("%Y-%m-%dT%H_%M_%S"));
        Self {
            flv_part: dir.join(format!("{base}.flv.part")),
            xml_part: dir.join(format!("{base}.xml.part")),
            base,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn flv_part(&self) -> &Path {
        &self.flv_part
    }

    pub fn xml_part(&self) -> &Path {
        &self.xml_part
    }

    /// Rename both files to drop the `.part` suffix. Returns false and leaves
    /// everything in place when either file is missing or empty.
    pub async fn finalize(&self) -> std::io::Result<bool> {
        if !non_empty(&self.xml_part).await || !non_empty(&self.flv_part).await {
            return Ok(false);
        }
        tokio::fs::rename(&self.xml_part, self.xml_part.with_extension("")).await?;
        tokio::fs::rename(&self.flv_part, self.flv_part.with_extension("")).await?;
        Ok(true)
    }
}

async fn non_empty(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.len() > 0)
}

#[derive(Debug, Default)]
pub struct SegmentOutcome {
    pub finalized: bool,
    pub exit_code: Option<i32>,
    pub chat_messages: u64,
    pub chat_degraded: bool,
    pub stop_requested: bool,
}

pub struct SegmentCoordinator {
    streamer: String,
    room_id: String,
    config: CoordinatorConfig,
    resolver: Arc<StreamUrlResolver>,
    recorder: StreamRecorder,
    collector: DanmakuCollector,
    monitor: Arc<StatusMonitor>,
}

impl SegmentCoordinator {
    pub fn new(
        streamer: impl Into<String>,
        room_id: impl Into<String>,
        config: CoordinatorConfig,
        resolver: Arc<StreamUrlResolver>,
        recorder: StreamRecorder,
        collector: DanmakuCollector,
        monitor: Arc<StatusMonitor>,
    ) -> Self {
        Self {
            streamer: streamer.into(),
            room_id: room_id.into(),
            config,
            resolver,
            recorder,
            collector,
            monitor,
        }
    }

    /// Main loop: wait for a live edge, record segments until the streamer
    /// goes offline, repeat. Only one segment is ever active per streamer.
    pub async fn run(&self, mut live: watch::Receiver<bool>, mut stop: watch::Receiver<bool>) {
        info!(streamer = %self.streamer, "segment coordinator started");
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            if !*live.borrow_and_update() {
                debug!(streamer = %self.streamer, state = ?CoordinatorState::Offline, "waiting for live edge");
                tokio::select! {
                    changed = live.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = wait_for_stop(&mut stop) => break,
                }
                continue;
            }

            self.record_live_interval(&mut stop).await;
            if *stop.borrow_and_update() {
                break;
            }

            // The interval ended (offline, or resolution gave up). Wait for
            // the monitor to report offline before arming the next edge.
            loop {
                if *stop.borrow_and_update() || !*live.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    changed = live.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = wait_for_stop(&mut stop) => return,
                }
            }
        }
        info!(streamer = %self.streamer, "segment coordinator stopped");
    }

    async fn record_live_interval(&self, stop: &mut watch::Receiver<bool>) {
        info!(streamer = %self.streamer, "live detected, recording started");
        let mut resolve_failures: u32 = 0;
        loop {
            if *stop.borrow_and_update() {
                return;
            }

            debug!(streamer = %self.streamer, state = ?CoordinatorState::Resolving, "resolving stream url");
            let resolved = match self.resolver.resolve(&self.room_id).await {
                Ok(resolved) => {
                    resolve_failures = 0;
                    resolved
                }
                Err(err) => {
                    resolve_failures += 1;
                    warn!(
                        streamer = %self.streamer,
                        error = %err,
                        resolve_failures,
                        "stream url resolution failed"
                    );
                    if resolve_failures >= self.config.resolve_max_attempts {
                        warn!(
                            streamer = %self.streamer,
                            "resolution exhausted, abandoning this live interval"
                        );
                        return;
                    }
                    tokio::select! {
                        _ = sleep(self.config.retry_delay) => {}
                        _ = wait_for_stop(stop) => return,
                    }
                    continue;
                }
            };

            let artifact = SegmentArtifact::new(
                &self.config.processing_dir,
                &self.streamer,
                Local::now().naive_local(),
            );
            info!(
                streamer = %self.streamer,
                base = %artifact.base(),
                state = ?CoordinatorState::Recording,
                "segment started"
            );
            let outcome = self.run_segment(&resolved, &artifact, stop).await;
            info!(
                streamer = %self.streamer,
                base = %artifact.base(),
                finalized = outcome.finalized,
                exit_code = ?outcome.exit_code,
                chat_messages = outcome.chat_messages,
                chat_degraded = outcome.chat_degraded,
                "segment closed"
            );
            if outcome.stop_requested || *stop.borrow_and_update() {
                return;
            }
            if !outcome.finalized {
                warn!(
                    streamer = %self.streamer,
                    base = %artifact.base(),
                    "segment left partial artifacts in place"
                );
            }

            if let Some(false) = self.monitor.check().await {
                info!(streamer = %self.streamer, "streamer went offline, recording stopped");
                return;
            }
            tokio::select! {
                _ = sleep(self.config.cooldown) => {}
                _ = wait_for_stop(stop) => return,
            }
        }
    }

    async fn run_segment(
        &self,
        resolved: &ResolvedStream,
        artifact: &SegmentArtifact,
        stop: &mut watch::Receiver<bool>,
    ) -> SegmentOutcome {
        let (rec_stop_tx, rec_stop_rx) = watch::channel(false);
        let (col_stop_tx, col_stop_rx) = watch::channel(false);

        let collector = self.collector.clone();
        let room_id = self.room_id.clone();
        let xml_path = artifact.xml_part().to_path_buf();
        let segment_duration = self.config.segment_duration;
        let mut collector_task = tokio::spawn(async move {
            collector
                .collect(&room_id, &xml_path, segment_duration, col_stop_rx)
                .await
        });

        let recorder_fut = self.recorder.record(
            &resolved.url,
            &resolved.headers,
            artifact.flv_part(),
            segment_duration,
            rec_stop_rx,
        );
        tokio::pin!(recorder_fut);

        let mut record_result: Option<Result<RecordOutcome, RecordError>> = None;
        let mut stop_requested = false;
        tokio::select! {
            result = &mut recorder_fut => record_result = Some(result),
            _ = sleep(segment_duration) => {}
            _ = wait_for_stop(stop) => stop_requested = true,
        }

        debug!(streamer = %self.streamer, state = ?CoordinatorState::Closing, "closing segment");
        let _ = col_stop_tx.send(true);
        let mut outcome = SegmentOutcome {
            stop_requested,
            ..SegmentOutcome::default()
        };
        match timeout(COLLECTOR_STOP_WAIT, &mut collector_task).await {
            Ok(Ok(Ok(chat))) => {
                outcome.chat_messages = chat.messages;
                outcome.chat_degraded = chat.degraded;
            }
            Ok(Ok(Err(err))) => {
                warn!(streamer = %self.streamer, error = %err, "chat collector failed");
            }
            Ok(Err(join_err)) => {
                warn!(streamer = %self.streamer, error = %join_err, "chat collector panicked");
            }
            Err(_) => {
                warn!(streamer = %self.streamer, "chat collector ignored stop, aborting");
                collector_task.abort();
            }
        }

        let record_result = match record_result {
            Some(result) => result,
            None => {
                let _ = rec_stop_tx.send(true);
                recorder_fut.await
            }
        };
        match record_result {
            Ok(record) => {
                if record.exit_code != 0 {
                    warn!(
                        streamer = %self.streamer,
                        exit_code = record.exit_code,
                        stderr = ?record.stderr_tail,
                        "transcoder exited with an error"
                    );
                }
                outcome.exit_code = Some(record.exit_code);
            }
            Err(err) => {
                warn!(streamer = %self.streamer, error = %err, "transcoder supervision failed");
            }
        }

        if !outcome.stop_requested {
            match artifact.finalize().await {
                Ok(finalized) => outcome.finalized = finalized,
                Err(err) => {
                    warn!(
                        streamer = %self.streamer,
                        error = %err,
                        "failed to publish segment artifacts"
                    );
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn artifact_names_share_one_timestamped_base() {
        let at = NaiveDate::from_ymd_opt(2026, 2, 24)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        let artifact = SegmentArtifact::new(Path::new("/data"), "银剑君", at);
        assert_eq!(artifact.base(), "银剑君录播2026-02-24T10_30_00");
        assert_eq!(
            artifact.flv_part(),
            Path::new("/data/银剑君录播2026-02-24T10_30_00.flv.part")
        );
        assert_eq!(
            artifact.xml_part(),
            Path::new("/data/银剑君录播2026-02-24T10_30_00.xml.part")
        );
    }

    #[tokio::test]
    async fn finalize_requires_both_files_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let at = NaiveDate::from_ymd_opt(2026, 2, 24)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        let artifact = SegmentArtifact::new(dir.path(), "S", at);

        tokio::fs::write(artifact.flv_part(), b"flv-bytes").await.unwrap();
        assert!(!artifact.finalize().await.unwrap());
        assert!(artifact.flv_part().exists());

        tokio::fs::write(artifact.xml_part(), b"<i></i>").await.unwrap();
        assert!(artifact.finalize().await.unwrap());
        assert!(!artifact.flv_part().exists());
        assert!(dir.path().join("S录播2026-02-24T10_30_00.flv").exists());
        assert!(dir.path().join("S录播2026-02-24T10_30_00.xml").exists());
    }
}
