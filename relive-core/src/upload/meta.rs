//! Submission metadata loaded from an external YAML file at upload-task
//! entry. The title template carries a literal `{time}` placeholder that is
//! substituted with the session date.

use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;

use super::error::UploadError;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionMeta {
    pub title: String,
    pub tid: u32,
    #[serde(default)]
    pub tag: Vec<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub dynamic: String,
    #[serde(default)]
    pub cdn: Option<String>,
}

impl SubmissionMeta {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| UploadError::MetaIo {
            path: path.to_path_buf(),
            source,
        })?;
        let meta: SubmissionMeta =
            serde_yaml::from_str(&raw).map_err(|source| UploadError::MetaParse {
                path: path.to_path_buf(),
                source,
            })?;
        if !meta.title.contains("{time}") {
            warn!(
                title = %meta.title,
                "submission title template has no {{time}} placeholder, the title will be fixed"
            );
        }
        Ok(meta)
    }

    pub fn render_title(&self, date: NaiveDate) -> String {
        self.title
            .replace("{time}", &date.format("%Y年%m月%d日").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_time_placeholder_with_chinese_date() {
        let meta: SubmissionMeta =
            serde_yaml::from_str("title: \"S直播录像{time}\"\ntid: 171\n").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();
        assert_eq!(meta.render_title(date), "S直播录像2026年02月24日");
    }

    #[test]
    fn fixed_title_passes_through() {
        let meta: SubmissionMeta = serde_yaml::from_str("title: 固定标题\ntid: 171\n").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();
        assert_eq!(meta.render_title(date), "固定标题");
    }
}
