//! Seam for the downstream encode/move stage that turns finished recordings
//! into staged upload files. The stage itself (subtitle conversion and the
//! transcoder call) is an external program; the core only launches it with a
//! documented environment.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::config::{PathsSection, ProcessingSection, RecordingSection};
use crate::exec::{CommandExecutor, SystemCommandExecutor};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("processing stage {command} failed with status {status:?}: {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ProcessingStage: Send + Sync {
    async fn run(&self) -> Result<(), PipelineError>;
}

/// Runs the configured external stage command with folder, tool and encoder
/// environment handed over as variables.
pub struct CommandProcessingStage {
    command: PathBuf,
    env: Vec<(String, String)>,
    executor: Arc<dyn CommandExecutor>,
}

impl CommandProcessingStage {
    pub fn from_config(
        command: PathBuf,
        paths: &PathsSection,
        processing: &ProcessingSection,
        recording: &RecordingSection,
    ) -> Self {
        let mut env: Vec<(String, String)> = vec![
            (
                "RELIVE_PROCESSING_DIR".into(),
                paths.processing_dir.display().to_string(),
            ),
            (
                "RELIVE_STAGING_DIR".into(),
                paths.staging_dir.display().to_string(),
            ),
            (
                "RELIVE_FFMPEG".into(),
                processing.ffmpeg_path.display().to_string(),
            ),
            (
                "RELIVE_FFPROBE".into(),
                processing.ffprobe_path.display().to_string(),
            ),
            ("RELIVE_FONT_SIZE".into(), processing.font_size.to_string()),
            (
                "RELIVE_SC_FONT_SIZE".into(),
                processing.sc_font_size.to_string(),
            ),
            (
                "RELIVE_MIN_FILE_SIZE_MB".into(),
                recording.min_file_size_mb.to_string(),
            ),
            (
                "RELIVE_SKIP_ENCODING".into(),
                processing.skip_encoding.to_string(),
            ),
        ];
        if let Some(library_path) = &processing.library_path {
            env.push(("LD_LIBRARY_PATH".into(), library_path.clone()));
        }
        if let Some(va_driver) = &processing.va_driver {
            env.push(("LIBVA_DRIVER_NAME".into(), va_driver.clone()));
        }
        if let Some(va_driver_path) = &processing.va_driver_path {
            env.push(("LIBVA_DRIVERS_PATH".into(), va_driver_path.clone()));
        }
        if let Some(render_device) = &processing.render_device {
            env.push(("RELIVE_RENDER_DEVICE".into(), render_device.clone()));
        }
        Self {
            command,
            env,
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }
}

#[async_trait]
impl ProcessingStage for CommandProcessingStage {
    async fn run(&self) -> Result<(), PipelineError> {
        info!(command = %self.command.display(), "running processing stage");
        let mut command = Command::new(&self.command);
        for (name, value) in &self.env {
            command.env(name, value);
        }
        let output = self.executor.run(&mut command).await?;
        if !output.status.success() {
            return Err(PipelineError::CommandFailure {
                command: self.command.display().to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}
