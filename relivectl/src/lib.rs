use std::path::PathBuf;

use chrono::Local;
use clap::{Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use relive_core::{
    load_relive_config, ArchiveStore, ReliveConfig, ReliveService, ResolverConfig, StatusMonitor,
    StreamUrlResolver,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] relive_core::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] relive_core::StoreError),
    #[error("service error: {0}")]
    Service(#[from] relive_core::ServiceError),
    #[error("upload error: {0}")]
    Upload(#[from] relive_core::UploadError),
    #[error("resolve error: {0}")]
    Resolve(#[from] relive_core::ResolveError),
    #[error("monitor error: {0}")]
    Monitor(#[from] relive_core::MonitorError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no streamer named {0} in the configuration")]
    UnknownStreamer(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Control interface for the relive stream archiver", long_about = None)]
pub struct Cli {
    /// Path to relive.toml
    #[arg(long, default_value = "configs/relive.toml")]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: CommandKind,
}

#[derive(Subcommand, Debug)]
pub enum CommandKind {
    /// Start the archiver service and block until interrupted
    Run,
    /// Summarize store state per configured streamer
    Status,
    /// List recent sessions for one streamer
    Sessions {
        #[arg(long)]
        streamer: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// List upload records
    Uploads {
        /// Only records still missing a parent id
        #[arg(long)]
        missing: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run one upload pass now and print the report
    Upload,
    /// Back-fill missing parent ids from the account feed
    Backfill,
    /// Force-close sessions left open for more than a day
    CleanupSessions,
    /// Probe the live status of one room
    Check { room_id: String },
    /// Resolve the current stream url of one room
    Resolve { room_id: String },
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_relive_config(&cli.config)?;
    match cli.command {
        CommandKind::Run => {
            let service = ReliveService::new(config)?;
            service.run().await?;
        }
        CommandKind::Status => {
            let store = open_store(&config)?;
            let mut streamers = Vec::new();
            for streamer in &config.streamers {
                let open = store.latest_open_session(&streamer.name)?;
                streamers.push(StreamerStatus {
                    name: streamer.name.clone(),
                    room_id: streamer.room_id.clone(),
                    open_session: open.map(|s| s.id),
                });
            }
            let pending = store.find_uploads_missing_bvid()?.len();
            print_json(&StatusReport {
                streamers,
                uploads_missing_parent_id: pending,
            })?;
        }
        CommandKind::Sessions { streamer, limit } => {
            let store = open_store(&config)?;
            let name = match streamer {
                Some(name) => {
                    if !config.streamers.iter().any(|s| s.name == name) {
                        return Err(AppError::UnknownStreamer(name));
                    }
                    name
                }
                None => config.streamers[0].name.clone(),
            };
            let sessions = store.sessions_for_streamer(&name, limit)?;
            print_json(&sessions)?;
        }
        CommandKind::Uploads { missing, limit } => {
            let store = open_store(&config)?;
            let records = if missing {
                store.find_uploads_missing_bvid()?
            } else {
                store.recent_uploads(limit)?
            };
            print_json(&records)?;
        }
        CommandKind::Upload => {
            let service = ReliveService::new(config)?;
            let report = service
                .uploader()
                .run_once(service.upload_flags(), Local::now().naive_local())
                .await?;
            print_json(&report)?;
        }
        CommandKind::Backfill => {
            let service = ReliveService::new(config)?;
            let updated = service.uploader().update_missing_bvids().await?;
            print_json(&serde_json::json!({ "backfilled": updated }))?;
        }
        CommandKind::CleanupSessions => {
            let store = open_store(&config)?;
            let closed = store
                .close_stale_sessions(chrono::Duration::hours(24), Local::now().naive_local())?;
            print_json(&serde_json::json!({ "closed": closed }))?;
        }
        CommandKind::Check { room_id } => {
            let monitor = StatusMonitor::new(&config.source.base_url, &room_id, "manual")?;
            let status = match monitor.check().await {
                Some(true) => "live",
                Some(false) => "offline",
                None => "unknown",
            };
            print_json(&serde_json::json!({ "room_id": room_id, "status": status }))?;
        }
        CommandKind::Resolve { room_id } => {
            let resolver = StreamUrlResolver::new(ResolverConfig {
                base_url: config.source.base_url.clone(),
                did: config.source.did.clone(),
                cdn: config.source.cdn.clone(),
                rate: config.source.rate,
                ..ResolverConfig::default()
            })?;
            let resolved = resolver.resolve(&room_id).await?;
            print_json(&serde_json::json!({
                "url": resolved.url,
                "headers": resolved.headers,
            }))?;
        }
    }
    Ok(())
}

fn open_store(config: &ReliveConfig) -> Result<ArchiveStore> {
    let store = ArchiveStore::new(&config.paths.database)?;
    store.initialize()?;
    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct StreamerStatus {
    name: String,
    room_id: String,
    open_session: Option<i64>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    streamers: Vec<StreamerStatus>,
    uploads_missing_parent_id: usize,
}
