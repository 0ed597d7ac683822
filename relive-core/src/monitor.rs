//! Per-streamer live-status poller. One HTTP probe per check against the
//! room-info endpoint, with a cached tri-state so API errors never fabricate
//! a status transition.

use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::resolver::DESKTOP_USER_AGENT;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Cached live state. `None` means uninitialized; API errors leave the cache
/// untouched, so two consecutive errors can never produce a transition.
#[derive(Debug, Default)]
pub struct StatusCache {
    last: Option<bool>,
}

impl StatusCache {
    pub fn is_live(&self) -> bool {
        self.last.unwrap_or(false)
    }

    /// Startup seeding: an unreachable API counts as offline.
    pub fn seed(&mut self, status: Option<bool>) {
        self.last = Some(status.unwrap_or(false));
    }

    /// Fold one check result into the cache, returning `(prev, curr)` only
    /// for a real transition.
    pub fn apply(&mut self, current: Option<bool>) -> Option<(bool, bool)> {
        let current = current?;
        match self.last {
            None => {
                self.last = Some(current);
                None
            }
            Some(prev) if prev != current => {
                self.last = Some(current);
                Some((prev, current))
            }
            Some(_) => None,
        }
    }
}

pub struct StatusMonitor {
    streamer: String,
    room_id: String,
    base_url: String,
    http: reqwest::Client,
    cache: Mutex<StatusCache>,
}

impl StatusMonitor {
    pub fn new(
        base_url: impl Into<String>,
        room_id: impl Into<String>,
        streamer: impl Into<String>,
    ) -> Result<Self, MonitorError> {
        let http = reqwest::Client::builder()
            .user_agent(DESKTOP_USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            streamer: streamer.into(),
            room_id: room_id.into(),
            base_url: base_url.into(),
            http,
            cache: Mutex::new(StatusCache::default()),
        })
    }

    pub fn streamer(&self) -> &str {
        &self.streamer
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// One API call. `None` on any error; the cache is not touched.
    pub async fn check(&self) -> Option<bool> {
        let url = format!("{}/betard/{}", self.base_url, self.room_id);
        let response = match self
            .http
            .get(&url)
            .header("Referer", self.base_url.as_str())
            .header("Origin", self.base_url.as_str())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(streamer = %self.streamer, error = %err, "room status request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            error!(
                streamer = %self.streamer,
                status = response.status().as_u16(),
                "room status request rejected"
            );
            return None;
        }
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                error!(streamer = %self.streamer, error = %err, "room status payload unreadable");
                return None;
            }
        };
        match parse_live_status(&body) {
            Some(live) => Some(live),
            None => {
                error!(streamer = %self.streamer, "room status payload has unexpected shape");
                None
            }
        }
    }

    /// One check on startup; unreachable APIs seed the cache as offline.
    pub async fn initialize(&self) {
        let status = self.check().await;
        match status {
            Some(live) => info!(
                streamer = %self.streamer,
                live,
                "initialized streamer status"
            ),
            None => warn!(
                streamer = %self.streamer,
                "could not fetch initial status, defaulting to offline"
            ),
        }
        self.cache.lock().unwrap().seed(status);
    }

    /// Returns a `(prev, curr)` transition, or `None` on no change or error.
    pub async fn detect_change(&self) -> Option<(bool, bool)> {
        let current = self.check().await;
        self.cache.lock().unwrap().apply(current)
    }

    pub fn is_live(&self) -> bool {
        self.cache.lock().unwrap().is_live()
    }
}

/// Live means an actual broadcast, not a video loop rerun.
fn parse_live_status(body: &Value) -> Option<bool> {
    let room = body.get("room")?;
    let show_status = room.get("show_status")?.as_i64()?;
    let video_loop = room.get("videoLoop").and_then(Value::as_i64).unwrap_or(0);
    Some(show_status == 1 && video_loop == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uninitialized_cache_reads_offline() {
        let cache = StatusCache::default();
        assert!(!cache.is_live());
    }

    #[test]
    fn seed_defaults_to_offline_on_error() {
        let mut cache = StatusCache::default();
        cache.seed(None);
        assert!(!cache.is_live());
        assert_eq!(cache.apply(Some(false)), None);
    }

    #[test]
    fn api_errors_never_fabricate_transitions() {
        let mut cache = StatusCache::default();
        cache.seed(Some(true));
        assert_eq!(cache.apply(None), None);
        assert_eq!(cache.apply(None), None);
        assert!(cache.is_live());
    }

    #[test]
    fn transition_reported_once() {
        let mut cache = StatusCache::default();
        cache.seed(Some(false));
        assert_eq!(cache.apply(Some(true)), Some((false, true)));
        assert_eq!(cache.apply(Some(true)), None);
        assert_eq!(cache.apply(Some(false)), Some((true, false)));
    }

    #[test]
    fn first_apply_without_seed_only_caches() {
        let mut cache = StatusCache::default();
        assert_eq!(cache.apply(Some(true)), None);
        assert!(cache.is_live());
    }

    #[test]
    fn live_requires_show_status_without_loop() {
        let live = json!({"room": {"show_status": 1, "videoLoop": 0}});
        let rerun = json!({"room": {"show_status": 1, "videoLoop": 1}});
        let off = json!({"room": {"show_status": 2, "videoLoop": 0}});
        assert_eq!(parse_live_status(&live), Some(true));
        assert_eq!(parse_live_status(&rerun), Some(false));
        assert_eq!(parse_live_status(&off), Some(false));
        assert_eq!(parse_live_status(&json!({})), None);
    }
}
