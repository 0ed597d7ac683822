//! Process wiring: builds the store, monitors, coordinators and uploader
//! from one loaded configuration and drives them through the scheduler until
//! a shutdown signal arrives. All shared state is created here and passed
//! down explicitly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as TimeDelta, Local};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ReliveConfig;
use crate::danmaku::{CollectorConfig, DanmakuCollector};
use crate::error::ConfigError;
use crate::monitor::{MonitorError, StatusMonitor};
use crate::pipeline::{CommandProcessingStage, ProcessingStage};
use crate::recording::{CoordinatorConfig, RecorderConfig, SegmentCoordinator, StreamRecorder};
use crate::resolver::{ResolveError, ResolverConfig, StreamUrlResolver};
use crate::scheduler::JobScheduler;
use crate::store::{ArchiveStore, StoreError};
use crate::upload::{BiliupCliClient, UploadTaskFlags, Uploader, UploaderConfig};

const PIPELINE_JOB: &str = "video-pipeline";
const CLEANUP_JOB: &str = "stale-session-cleanup";
const POST_STREAM_PIPELINE_DELAY: Duration = Duration::from_secs(3 * 60);
const STALE_SESSION_AGE_HOURS: i64 = 24;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const COORDINATOR_SHUTDOWN_WAIT: Duration = Duration::from_secs(15);
const UPLOAD_DRAIN_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),
    #[error("resolver error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ReliveService {
    config: ReliveConfig,
    store: ArchiveStore,
    scheduler: JobScheduler,
    monitors: Arc<HashMap<String, Arc<StatusMonitor>>>,
    uploader: Arc<Uploader>,
    stage: Option<Arc<dyn ProcessingStage>>,
}

impl ReliveService {
    pub fn new(config: ReliveConfig) -> Result<Self, ServiceError> {
        let store = ArchiveStore::new(&config.paths.database)?;
        store.initialize()?;

        let mut monitors = HashMap::new();
        for streamer in &config.streamers {
            let monitor = StatusMonitor::new(
                &config.source.base_url,
                &streamer.room_id,
                &streamer.name,
            )?;
            monitors.insert(streamer.name.clone(), Arc::new(monitor));
        }

        let client = Arc::new(BiliupCliClient::new(
            &config.upload.biliup_path,
            &config.upload.cookies_path,
            &config.upload.submit_mode,
            config.upload.line.clone(),
        ));
        let uploader_config = UploaderConfig {
            staging_dir: config.paths.staging_dir.clone(),
            streamers: config.streamers.iter().map(|s| s.name.clone()).collect(),
            buffer_minutes: config.source.start_adjustment_minutes,
            danmaku_title_suffix: config.processing.danmaku_title_suffix.clone(),
            no_danmaku_title_suffix: config.processing.no_danmaku_title_suffix.clone(),
            ..UploaderConfig::default()
        };
        let uploader = Arc::new(Uploader::new(
            store.clone(),
            client,
            uploader_config,
            &config.upload.submission_meta,
        ));

        let stage = config.processing.stage_command.clone().map(|command| {
            Arc::new(CommandProcessingStage::from_config(
                command,
                &config.paths,
                &config.processing,
                &config.recording,
            )) as Arc<dyn ProcessingStage>
        });

        Ok(Self {
            config,
            store,
            scheduler: JobScheduler::new(),
            monitors: Arc::new(monitors),
            uploader,
            stage,
        })
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    pub fn uploader(&self) -> Arc<Uploader> {
        Arc::clone(&self.uploader)
    }

    /// Feature-flag snapshot for a manually triggered upload pass.
    pub fn upload_flags(&self) -> UploadTaskFlags {
        UploadTaskFlags {
            skip_encoding: self.config.processing.skip_encoding,
            delete_after_upload: self.config.upload.delete_after_upload,
        }
    }

    /// Start everything and block until a shutdown signal.
    pub async fn run(&self) -> Result<(), ServiceError> {
        info!(
            streamers = self.config.streamers.len(),
            "relive service starting"
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let resolver = Arc::new(StreamUrlResolver::new(ResolverConfig {
            base_url: self.config.source.base_url.clone(),
            did: self.config.source.did.clone(),
            cdn: self.config.source.cdn.clone(),
            rate: self.config.source.rate,
            ..ResolverConfig::default()
        })?);
        let pipeline_ctx = PipelineContext {
            stage: self.stage.clone(),
            uploader: Arc::clone(&self.uploader),
            monitors: Arc::clone(&self.monitors),
            skip_encoding: self.config.processing.skip_encoding,
            delete_after_upload: self.config.upload.delete_after_upload,
            scheduled_enabled: self.config.upload.scheduled_enabled,
            process_after_stream_end: self.config.processing.process_after_stream_end,
        };

        let mut coordinator_tasks = Vec::new();
        for streamer in &self.config.streamers {
            let Some(monitor) = self.monitors.get(&streamer.name).cloned() else {
                continue;
            };
            // Each monitor is initialized before its status job exists, so
            // the first scheduled check never fabricates a transition.
            monitor.initialize().await;
            let (live_tx, live_rx) = watch::channel(monitor.is_live());
            let live_tx = Arc::new(live_tx);

            if self.config.recording.enabled {
                let coordinator = SegmentCoordinator::new(
                    &streamer.name,
                    &streamer.room_id,
                    CoordinatorConfig {
                        processing_dir: self.config.paths.processing_dir.clone(),
                        segment_duration: self.config.recording.segment_duration(),
                        retry_delay: Duration::from_secs(self.config.recording.retry_delay_seconds),
                        cooldown: Duration::from_secs(self.config.recording.cooldown_seconds),
                        resolve_max_attempts: self.config.recording.resolve_max_attempts,
                    },
                    Arc::clone(&resolver),
                    StreamRecorder::new(RecorderConfig {
                        ffmpeg_path: self.config.processing.ffmpeg_path.clone(),
                    }),
                    DanmakuCollector::new(CollectorConfig {
                        ws_url: self.config.danmaku.ws_url.clone(),
                        heartbeat: Duration::from_secs(self.config.danmaku.heartbeat_seconds),
                        reconnect_delay: Duration::from_secs(
                            self.config.danmaku.reconnect_delay_seconds,
                        ),
                        reconnect_max_attempts: self.config.danmaku.reconnect_max_attempts,
                    }),
                    Arc::clone(&monitor),
                );
                let stop = stop_rx.clone();
                coordinator_tasks.push(tokio::spawn(async move {
                    coordinator.run(live_rx, stop).await;
                }));
            } else {
                debug!(streamer = %streamer.name, "recording disabled, no coordinator spawned");
            }

            let job_id = format!("status-check:{}", streamer.name);
            let period = Duration::from_secs(self.config.source.status_check_minutes * 60);
            let monitor_for_job = Arc::clone(&monitor);
            let store = self.store.clone();
            let scheduler = self.scheduler.clone();
            let ctx = pipeline_ctx.clone();
            let streamer_name = streamer.name.clone();
            let adjustment = self.config.source.start_adjustment_minutes;
            let process_after_end = self.config.processing.process_after_stream_end;
            self.scheduler.every(&job_id, period, move || {
                run_status_check(
                    Arc::clone(&monitor_for_job),
                    store.clone(),
                    Arc::clone(&live_tx),
                    scheduler.clone(),
                    ctx.clone(),
                    streamer_name.clone(),
                    adjustment,
                    process_after_end,
                )
            });
        }

        {
            let ctx = pipeline_ctx.clone();
            let period = Duration::from_secs(self.config.processing.interval_minutes * 60);
            self.scheduler
                .every(PIPELINE_JOB, period, move || ctx.clone().run());
        }
        {
            let store = self.store.clone();
            self.scheduler.every(CLEANUP_JOB, CLEANUP_INTERVAL, move || {
                let store = store.clone();
                async move {
                    let now = Local::now().naive_local();
                    match store.close_stale_sessions(TimeDelta::hours(STALE_SESSION_AGE_HOURS), now)
                    {
                        Ok(0) => debug!("no stale sessions to close"),
                        Ok(closed) => info!(closed, "closed stale sessions"),
                        Err(err) => error!(error = %err, "stale session cleanup failed"),
                    }
                }
            });
        }
        info!(jobs = ?self.scheduler.job_ids(), "scheduler jobs registered");

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        let _ = stop_tx.send(true);
        // Let an in-flight upload pass reach a file boundary before tearing
        // the scheduler down.
        self.uploader.request_cancel();
        if timeout(UPLOAD_DRAIN_WAIT, self.uploader.wait_idle())
            .await
            .is_err()
        {
            warn!("upload pass did not reach a file boundary in time");
        }
        self.scheduler.shutdown();
        for task in coordinator_tasks {
            if timeout(COORDINATOR_SHUTDOWN_WAIT, task).await.is_err() {
                warn!("coordinator did not stop in time");
            }
        }
        info!("relive service stopped");
        Ok(())
    }
}

/// Everything the pipeline job needs, snapshotted at wiring time so flags
/// stay immutable per task instance.
#[derive(Clone)]
struct PipelineContext {
    stage: Option<Arc<dyn ProcessingStage>>,
    uploader: Arc<Uploader>,
    monitors: Arc<HashMap<String, Arc<StatusMonitor>>>,
    skip_encoding: bool,
    delete_after_upload: bool,
    scheduled_enabled: bool,
    process_after_stream_end: bool,
}

impl PipelineContext {
    async fn run(self) {
        if self.process_after_stream_end {
            if let Some(name) = self
                .monitors
                .iter()
                .find(|(_, monitor)| monitor.is_live())
                .map(|(name, _)| name)
            {
                info!(streamer = %name, "streamer still live, pipeline postponed");
                return;
            }
        }
        match &self.stage {
            Some(stage) => {
                if let Err(err) = stage.run().await {
                    error!(error = %err, "processing stage failed, uploading whatever is staged");
                }
            }
            None => debug!("no processing stage configured"),
        }
        if !self.scheduled_enabled {
            info!("scheduled upload disabled, skipping upload pass");
            return;
        }
        let flags = UploadTaskFlags {
            skip_encoding: self.skip_encoding,
            delete_after_upload: self.delete_after_upload,
        };
        if let Err(err) = self
            .uploader
            .run_once(flags, Local::now().naive_local())
            .await
        {
            error!(error = %err, "upload task failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_status_check(
    monitor: Arc<StatusMonitor>,
    store: ArchiveStore,
    live_tx: Arc<watch::Sender<bool>>,
    scheduler: JobScheduler,
    pipeline: PipelineContext,
    streamer: String,
    adjustment_minutes: i64,
    process_after_stream_end: bool,
) {
    let Some((prev, curr)) = monitor.detect_change().await else {
        return;
    };
    let now = Local::now().naive_local();
    info!(streamer = %streamer, prev, curr, "streamer status changed");

    if curr {
        let start = now - TimeDelta::minutes(adjustment_minutes);
        match store.open_session(&streamer, start) {
            Ok(session) => {
                info!(streamer = %streamer, session, start = %start, "opened live session")
            }
            Err(err) => error!(streamer = %streamer, error = %err, "failed to open session"),
        }
    } else {
        match store.close_latest_open_session(&streamer, now) {
            Ok(Some(session)) => {
                info!(streamer = %streamer, session, end = %now, "closed live session")
            }
            Ok(None) => {
                warn!(streamer = %streamer, "offline edge without an open session");
                if let Err(err) = store.insert_end_only_session(&streamer, now) {
                    error!(streamer = %streamer, error = %err, "failed to record end-only session");
                }
            }
            Err(err) => error!(streamer = %streamer, error = %err, "failed to close session"),
        }
        if process_after_stream_end {
            info!(streamer = %streamer, "scheduling pipeline run after stream end");
            scheduler.once(PIPELINE_JOB, POST_STREAM_PIPELINE_DELAY, pipeline.run());
        }
    }
    let _ = live_tx.send(curr);
}
