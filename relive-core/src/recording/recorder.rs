//! Supervises the external transcoder child that byte-copies the live stream
//! into a `.part` file. The child is asked to quit through its stdin, given a
//! grace window, then killed.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::wait_for_stop;

const STDERR_WINDOW: usize = 64;
const GRACEFUL_WAIT: Duration = Duration::from_secs(10);
const HARD_CAP_SLACK: Duration = Duration::from_secs(30);
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("output path {0} must carry the .part suffix")]
    NotPartPath(PathBuf),
    #[error("failed to spawn transcoder {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub ffmpeg_path: PathBuf,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

#[derive(Debug)]
pub struct RecordOutcome {
    pub exit_code: i32,
    pub stderr_tail: Vec<String>,
}

enum WaitEnd {
    Exited(std::process::ExitStatus),
    HardCap,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct StreamRecorder {
    config: RecorderConfig,
}

impl StreamRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self { config }
    }

    /// Copy `url` to `out_path` for at most `duration`. A nonzero exit code
    /// is reported, not raised; the caller decides whether it matters.
    pub async fn record(
        &self,
        url: &str,
        headers: &[(String, String)],
        out_path: &Path,
        duration: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> Result<RecordOutcome, RecordError> {
        if out_path.extension().and_then(|e| e.to_str()) != Some("part") {
            return Err(RecordError::NotPartPath(out_path.to_path_buf()));
        }
        if let Some(parent) = out_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut command = Command::new(&self.config.ffmpeg_path);
        command
            .arg("-hide_banner")
            .arg("-y")
            .arg("-loglevel")
            .arg("error");
        if !headers.is_empty() {
            command.arg("-headers").arg(header_arg(headers));
        }
        command
            .arg("-i")
            .arg(url)
            .arg("-c")
            .arg("copy")
            .arg("-t")
            .arg(duration.as_secs().to_string())
            .arg("-f")
            .arg("flv")
            .arg(out_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| RecordError::Spawn {
            program: self.config.ffmpeg_path.display().to_string(),
            source,
        })?;
        let mut stdin = child.stdin.take();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_WINDOW)));
        let tail_task = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().unwrap();
                    if tail.len() == STDERR_WINDOW {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        let end = tokio::select! {
            status = child.wait() => WaitEnd::Exited(status?),
            _ = sleep(duration + HARD_CAP_SLACK) => WaitEnd::HardCap,
            _ = wait_for_stop(&mut stop) => WaitEnd::Stopped,
        };
        let exit_code = match end {
            WaitEnd::Exited(status) => status.code().unwrap_or(-1),
            WaitEnd::HardCap => {
                warn!(path = %out_path.display(), "transcoder exceeded the segment window");
                self.stop_child(&mut child, &mut stdin).await?;
                TIMEOUT_EXIT_CODE
            }
            WaitEnd::Stopped => {
                debug!(path = %out_path.display(), "stop requested, terminating transcoder");
                let status = self.stop_child(&mut child, &mut stdin).await?;
                status.code().unwrap_or(-1)
            }
        };

        if let Some(task) = tail_task {
            let _ = task.await;
        }
        let stderr_tail: Vec<String> = tail.lock().unwrap().iter().cloned().collect();
        Ok(RecordOutcome {
            exit_code,
            stderr_tail,
        })
    }

    /// Graceful quit through stdin, bounded wait, then kill.
    async fn stop_child(
        &self,
        child: &mut Child,
        stdin: &mut Option<ChildStdin>,
    ) -> io::Result<std::process::ExitStatus> {
        if let Some(mut pipe) = stdin.take() {
            let _ = pipe.write_all(b"q").await;
            let _ = pipe.shutdown().await;
        }
        match timeout(GRACEFUL_WAIT, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("transcoder ignored graceful stop, killing");
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

fn header_arg(headers: &[(String, String)]) -> String {
    let mut arg = String::new();
    for (name, value) in headers {
        arg.push_str(name);
        arg.push_str(": ");
        arg.push_str(value);
        arg.push_str("\r\n");
    }
    arg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_arg_joins_with_crlf() {
        let headers = vec![
            ("Referer".to_string(), "https://www.douyu.com".to_string()),
            ("Origin".to_string(), "https://www.douyu.com".to_string()),
        ];
        assert_eq!(
            header_arg(&headers),
            "Referer: https://www.douyu.com\r\nOrigin: https://www.douyu.com\r\n"
        );
    }

    #[tokio::test]
    async fn rejects_output_without_part_suffix() {
        let recorder = StreamRecorder::new(RecorderConfig::default());
        let (_tx, rx) = watch::channel(false);
        let err = recorder
            .record(
                "http://example/stream",
                &[],
                Path::new("/tmp/out.flv"),
                Duration::from_secs(1),
                rx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::NotPartPath(_)));
    }
}
