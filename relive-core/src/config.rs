use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ReliveConfig {
    pub paths: PathsSection,
    pub recording: RecordingSection,
    pub source: SourceSection,
    pub danmaku: DanmakuSection,
    pub processing: ProcessingSection,
    pub upload: UploadSection,
    pub streamers: Vec<StreamerEntry>,
}

/// One configured streamer. The list is ordered and immutable after startup.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamerEntry {
    pub name: String,
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub processing_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub database: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub segment_minutes: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_resolve_attempts")]
    pub resolve_max_attempts: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_min_file_size")]
    pub min_file_size_mb: u64,
}

impl RecordingSection {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_minutes * 60)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    #[serde(default = "default_source_base")]
    pub base_url: String,
    #[serde(default = "default_did")]
    pub did: String,
    #[serde(default = "default_cdn")]
    pub cdn: String,
    #[serde(default)]
    pub rate: u32,
    #[serde(default = "default_status_check")]
    pub status_check_minutes: u64,
    #[serde(default = "default_start_adjustment")]
    pub start_adjustment_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DanmakuSection {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingSection {
    #[serde(default = "default_true")]
    pub skip_encoding: bool,
    #[serde(default = "default_danmaku_suffix")]
    pub danmaku_title_suffix: String,
    #[serde(default = "default_no_danmaku_suffix")]
    pub no_danmaku_title_suffix: String,
    #[serde(default = "default_interval")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub process_after_stream_end: bool,
    /// External encode/move stage. When unset the pipeline job only uploads.
    #[serde(default)]
    pub stage_command: Option<PathBuf>,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: PathBuf,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_sc_font_size")]
    pub sc_font_size: u32,
    #[serde(default)]
    pub library_path: Option<String>,
    #[serde(default)]
    pub va_driver: Option<String>,
    #[serde(default)]
    pub va_driver_path: Option<String>,
    #[serde(default)]
    pub render_device: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    #[serde(default = "default_true")]
    pub scheduled_enabled: bool,
    #[serde(default)]
    pub delete_after_upload: bool,
    pub submission_meta: PathBuf,
    #[serde(default = "default_biliup")]
    pub biliup_path: PathBuf,
    #[serde(default = "default_cookies")]
    pub cookies_path: PathBuf,
    #[serde(default = "default_submit_mode")]
    pub submit_mode: String,
    #[serde(default)]
    pub line: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_retry_delay() -> u64 {
    10
}

fn default_resolve_attempts() -> u32 {
    6
}

fn default_cooldown() -> u64 {
    10
}

fn default_min_file_size() -> u64 {
    10
}

fn default_source_base() -> String {
    "https://www.douyu.com".to_string()
}

fn default_did() -> String {
    "10000000000000000000000000001501".to_string()
}

fn default_cdn() -> String {
    "hw-h5".to_string()
}

fn default_status_check() -> u64 {
    10
}

fn default_start_adjustment() -> i64 {
    10
}

fn default_ws_url() -> String {
    "wss://danmuproxy.douyu.com:8506/".to_string()
}

fn default_heartbeat() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_reconnect_max() -> u32 {
    3
}

fn default_danmaku_suffix() -> String {
    "【弹幕版】".to_string()
}

fn default_no_danmaku_suffix() -> String {
    "【无弹幕版】".to_string()
}

fn default_interval() -> u64 {
    60
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_font_size() -> u32 {
    40
}

fn default_sc_font_size() -> u32 {
    38
}

fn default_biliup() -> PathBuf {
    PathBuf::from("biliup")
}

fn default_cookies() -> PathBuf {
    PathBuf::from("cookies.json")
}

fn default_submit_mode() -> String {
    "app".to_string()
}

pub fn load_relive_config(path: impl AsRef<Path>) -> Result<ReliveConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let config: ReliveConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })?;
    validate(&config, path)?;
    Ok(config)
}

fn validate(config: &ReliveConfig, path: &Path) -> Result<()> {
    let invalid = |reason: &str| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if config.recording.segment_minutes == 0 {
        return Err(invalid("recording.segment_minutes must be at least 1"));
    }
    if config.streamers.is_empty() {
        return Err(invalid("at least one [[streamers]] entry is required"));
    }
    for streamer in &config.streamers {
        if streamer.name.is_empty() || streamer.room_id.is_empty() {
            return Err(invalid("streamer entries need both name and room_id"));
        }
    }
    if config.danmaku.heartbeat_seconds == 0 {
        return Err(invalid("danmaku.heartbeat_seconds must be at least 1"));
    }
    if !["app", "b-cut-android"].contains(&config.upload.submit_mode.as_str()) {
        return Err(invalid("upload.submit_mode must be app or b-cut-android"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [paths]
        processing_dir = "/tmp/relive/processing"
        staging_dir = "/tmp/relive/staging"
        database = "/tmp/relive/archive.sqlite"

        [recording]
        segment_minutes = 60

        [source]

        [danmaku]

        [processing]

        [upload]
        submission_meta = "submission.yaml"

        [[streamers]]
        name = "S"
        room_id = "123"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: ReliveConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.recording.segment_minutes, 60);
        assert_eq!(config.source.status_check_minutes, 10);
        assert_eq!(config.danmaku.reconnect_max_attempts, 3);
        assert!(config.processing.skip_encoding);
        assert_eq!(config.streamers.len(), 1);
        validate(&config, Path::new("test.toml")).unwrap();
    }

    #[test]
    fn zero_segment_duration_is_rejected() {
        let mut config: ReliveConfig = toml::from_str(MINIMAL).unwrap();
        config.recording.segment_minutes = 0;
        let err = validate(&config, Path::new("test.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn empty_streamer_list_is_rejected() {
        let mut config: ReliveConfig = toml::from_str(MINIMAL).unwrap();
        config.streamers.clear();
        assert!(validate(&config, Path::new("test.toml")).is_err());
    }
}
