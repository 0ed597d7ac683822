//! Streaming writer for the Bilibili chat-log XML consumed by the subtitle
//! converter. Elements are buffered and written atomically so that a crash
//! mid-segment leaves the document recoverable by appending the root closer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;

use super::{DanmakuError, DanmakuResult};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DanmakuStyle {
    pub mode: u32,
    pub size: u32,
    pub color: u32,
    pub pool: u32,
    pub user: String,
    pub row_id: u64,
}

impl Default for DanmakuStyle {
    fn default() -> Self {
        Self {
            mode: 1,
            size: 25,
            color: 0xFF_FFFF,
            pool: 0,
            user: "0".to_string(),
            row_id: 0,
        }
    }
}

pub struct ChatLogWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    last_flush: Instant,
}

impl ChatLogWriter {
    /// Truncates `path`, writes the declaration and opening root tag and
    /// flushes so even an immediately-interrupted segment leaves a header.
    pub async fn create(path: impl AsRef<Path>) -> DanmakuResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DanmakuError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        let file = File::create(&path).await.map_err(|source| DanmakuError::Io {
            source,
            path: path.clone(),
        })?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<i>\n")
            .await
            .map_err(|source| DanmakuError::Io {
                source,
                path: path.clone(),
            })?;
        writer.flush().await.map_err(|source| DanmakuError::Io {
            source,
            path: path.clone(),
        })?;
        Ok(Self {
            writer,
            path,
            last_flush: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one chat message with default styling.
    pub async fn write(&mut self, offset_seconds: f64, text: &str) -> DanmakuResult<()> {
        self.write_styled(offset_seconds, text, &DanmakuStyle::default())
            .await
    }

    pub async fn write_styled(
        &mut self,
        offset_seconds: f64,
        text: &str,
        style: &DanmakuStyle,
    ) -> DanmakuResult<()> {
        let element = format!(
            "<d p=\"{:.3},{},{},{},{},{},{},{}\">{}</d>\n",
            offset_seconds,
            style.mode,
            style.size,
            style.color,
            Utc::now().timestamp(),
            style.pool,
            xml_escape(&style.user),
            style.row_id,
            xml_escape(text),
        );
        self.writer
            .write_all(element.as_bytes())
            .await
            .map_err(|source| DanmakuError::Io {
                source,
                path: self.path.clone(),
            })?;
        if self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.writer.flush().await.map_err(|source| DanmakuError::Io {
                source,
                path: self.path.clone(),
            })?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    /// Write the closing root tag and sync the file to disk.
    pub async fn close(mut self) -> DanmakuResult<()> {
        let io_err = |source, path: &PathBuf| DanmakuError::Io {
            source,
            path: path.clone(),
        };
        self.writer
            .write_all(b"</i>\n")
            .await
            .map_err(|e| io_err(e, &self.path))?;
        self.writer
            .flush()
            .await
            .map_err(|e| io_err(e, &self.path))?;
        let file = self.writer.into_inner();
        file.sync_all().await.map_err(|e| io_err(e, &self.path))?;
        Ok(())
    }
}

pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_all_reserved_characters() {
        assert_eq!(
            xml_escape(r#"<a href="x">&'b'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&apos;b&apos;&lt;/a&gt;"
        );
        assert_eq!(xml_escape("弹幕"), "弹幕");
    }
}
