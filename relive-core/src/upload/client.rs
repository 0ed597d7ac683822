//! Upload-platform client seam. The production implementation shells out to
//! the `biliup` binary; tests substitute a mock through the trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::exec::{CommandExecutor, SystemCommandExecutor};

use super::error::UploadClientError;

/// Which submission states a feed query should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Published,
    BeingPublished,
    /// Freshly created submissions can sit in either state, so back-fill
    /// queries always ask for both.
    PublishedAndBeingPublished,
}

impl FeedStatus {
    pub fn as_query(&self) -> &'static str {
        match self {
            FeedStatus::Published => "pubed",
            FeedStatus::BeingPublished => "is_pubing",
            FeedStatus::PublishedAndBeingPublished => "pubed,is_pubing",
        }
    }
}

/// Metadata for creating a new parent submission.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub title: String,
    pub tid: u32,
    pub tags: Vec<String>,
    pub source: String,
    pub desc: String,
    pub cover: String,
    pub dynamic: String,
    pub copyright: u8,
}

#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn check_login(&self) -> Result<bool, UploadClientError>;

    /// Create a parent submission from `path`. Returns the parent id when the
    /// backend reports one directly.
    async fn upload_new(
        &self,
        path: &Path,
        submission: &NewSubmission,
    ) -> Result<Option<String>, UploadClientError>;

    /// Append `path` as one more part under an existing parent submission.
    async fn append_part(
        &self,
        path: &Path,
        bvid: &str,
        cdn: Option<&str>,
        part_name: &str,
    ) -> Result<(), UploadClientError>;

    /// Map of submission title to parent id from the account's feed.
    async fn feed(
        &self,
        size: u32,
        statuses: FeedStatus,
    ) -> Result<HashMap<String, String>, UploadClientError>;
}

pub struct BiliupCliClient {
    binary: PathBuf,
    cookies: PathBuf,
    submit_mode: String,
    line: Option<String>,
    executor: Arc<dyn CommandExecutor>,
    bvid_pattern: Regex,
}

impl BiliupCliClient {
    pub fn new(
        binary: impl Into<PathBuf>,
        cookies: impl Into<PathBuf>,
        submit_mode: impl Into<String>,
        line: Option<String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            cookies: cookies.into(),
            submit_mode: submit_mode.into(),
            line,
            executor: Arc::new(SystemCommandExecutor),
            bvid_pattern: Regex::new(r"BV[0-9A-Za-z]{10}").unwrap(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("-u").arg(&self.cookies);
        command
    }

    async fn run(&self, command: &mut Command, label: &str) -> Result<CliRun, UploadClientError> {
        let output = self.executor.run(command).await.map_err(|source| {
            UploadClientError::Spawn {
                command: label.to_string(),
                source,
            }
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        for line in stdout.lines().chain(stderr.lines()) {
            debug!(target: "biliup", "{line}");
        }
        Ok(CliRun {
            status: output.status.code(),
            success: output.status.success(),
            combined: format!("{stdout}\n{stderr}"),
        })
    }

    fn extract_bvid(&self, output: &str) -> Option<String> {
        self.bvid_pattern
            .find(output)
            .map(|m| m.as_str().to_string())
    }
}

struct CliRun {
    status: Option<i32>,
    success: bool,
    combined: String,
}

/// Output markers the CLI prints on a successful new submission.
fn create_submit_succeeded(output: &str, success: bool) -> bool {
    success
        && (output.contains("投稿成功")
            || output.contains("APP接口投稿成功")
            || output.contains("\"code\": Number(0)")
            || output.contains("code: 0"))
}

/// Output markers for a successful append.
fn append_submit_succeeded(output: &str, success: bool) -> bool {
    success
        && (output.contains("稿件修改成功")
            || output.contains("投稿成功")
            || output.contains("\"code\": Number(0)"))
}

#[async_trait]
impl UploadClient for BiliupCliClient {
    async fn check_login(&self) -> Result<bool, UploadClientError> {
        let mut command = self.base_command();
        command.arg("renew");
        let run = self.run(&mut command, "biliup renew").await?;
        Ok(run.success)
    }

    async fn upload_new(
        &self,
        path: &Path,
        submission: &NewSubmission,
    ) -> Result<Option<String>, UploadClientError> {
        let mut command = self.base_command();
        command
            .arg("upload")
            .arg("--submit")
            .arg(&self.submit_mode)
            .arg("--tid")
            .arg(submission.tid.to_string())
            .arg("--title")
            .arg(&submission.title)
            .arg("--desc")
            .arg(&submission.desc)
            .arg("--tag")
            .arg(submission.tags.join(","))
            .arg("--copyright")
            .arg(submission.copyright.to_string());
        if let Some(line) = &self.line {
            command.arg("--line").arg(line);
        }
        if !submission.source.is_empty() {
            command.arg("--source").arg(&submission.source);
        }
        if !submission.cover.is_empty() {
            command.arg("--cover").arg(&submission.cover);
        }
        if !submission.dynamic.is_empty() {
            command.arg("--dynamic").arg(&submission.dynamic);
        }
        command.arg(path);

        let run = self.run(&mut command, "biliup upload").await?;
        if !create_submit_succeeded(&run.combined, run.success) {
            return Err(UploadClientError::CommandFailure {
                command: "biliup upload".to_string(),
                status: run.status,
                detail: tail(&run.combined),
            });
        }
        let bvid = self.extract_bvid(&run.combined);
        info!(title = %submission.title, bvid = ?bvid, "created new submission");
        Ok(bvid)
    }

    async fn append_part(
        &self,
        path: &Path,
        bvid: &str,
        cdn: Option<&str>,
        part_name: &str,
    ) -> Result<(), UploadClientError> {
        if cdn.is_some() {
            debug!("cdn hint is not forwarded by the cli backend");
        }
        // The cli backend names parts after the file; the part title is kept
        // in the upload record instead.
        debug!(part_name, "appending part");
        let mut command = self.base_command();
        command
            .arg("append")
            .arg("--submit")
            .arg(&self.submit_mode)
            .arg("--vid")
            .arg(bvid);
        if let Some(line) = &self.line {
            command.arg("--line").arg(line);
        }
        command.arg(path);

        let run = self.run(&mut command, "biliup append").await?;
        if !append_submit_succeeded(&run.combined, run.success) {
            return Err(UploadClientError::CommandFailure {
                command: "biliup append".to_string(),
                status: run.status,
                detail: tail(&run.combined),
            });
        }
        Ok(())
    }

    async fn feed(
        &self,
        size: u32,
        statuses: FeedStatus,
    ) -> Result<HashMap<String, String>, UploadClientError> {
        let mut command = self.base_command();
        command
            .arg("list")
            .arg("--limit")
            .arg(size.to_string())
            .arg("--status")
            .arg(statuses.as_query());
        let run = self.run(&mut command, "biliup list").await?;
        if !run.success {
            return Err(UploadClientError::CommandFailure {
                command: "biliup list".to_string(),
                status: run.status,
                detail: tail(&run.combined),
            });
        }

        let mut feed = HashMap::new();
        for line in run.combined.lines() {
            if let Some(found) = self.bvid_pattern.find(line) {
                let title = line[found.end()..].trim();
                if title.is_empty() {
                    warn!(bvid = found.as_str(), "feed line carries no title");
                    continue;
                }
                feed.insert(title.to_string(), found.as_str().to_string());
            }
        }
        Ok(feed)
    }
}

fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_statuses_map_to_query_values() {
        assert_eq!(FeedStatus::Published.as_query(), "pubed");
        assert_eq!(FeedStatus::BeingPublished.as_query(), "is_pubing");
        assert_eq!(
            FeedStatus::PublishedAndBeingPublished.as_query(),
            "pubed,is_pubing"
        );
    }

    #[test]
    fn create_success_markers() {
        assert!(create_submit_succeeded("xxx 投稿成功 yyy", true));
        assert!(create_submit_succeeded("APP接口投稿成功", true));
        assert!(!create_submit_succeeded("投稿成功", false));
        assert!(!create_submit_succeeded("error", true));
    }

    #[test]
    fn append_success_markers() {
        assert!(append_submit_succeeded("稿件修改成功", true));
        assert!(!append_submit_succeeded("稿件修改成功", false));
    }

    #[test]
    fn bvid_extraction_finds_first_id() {
        let client = BiliupCliClient::new("biliup", "cookies.json", "app", None);
        assert_eq!(
            client.extract_bvid("done: BV1xx411c7mD and BV1yy411c7mE"),
            Some("BV1xx411c7mD".to_string())
        );
        assert_eq!(client.extract_bvid("no id here"), None);
    }
}
