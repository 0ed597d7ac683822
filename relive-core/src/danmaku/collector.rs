//! WebSocket chat collector. Logs into the chat proxy for one room, joins the
//! broadcast group, keeps the connection alive and appends every chat message
//! to the segment's XML log until the segment window ends or a stop arrives.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::codec::{iter_payloads, pack, parse};
use super::writer::ChatLogWriter;
use super::DanmakuResult;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub ws_url: String,
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_max_attempts: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://danmuproxy.douyu.com:8506/".to_string(),
            heartbeat: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            reconnect_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Connecting,
    LoggedIn,
    Joined,
    Running,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Default)]
pub struct CollectorOutcome {
    pub messages: u64,
    /// Set when the reconnect budget ran out and the segment continued
    /// without chat.
    pub degraded: bool,
    pub malformed_frames: u64,
    pub ignored_by_type: HashMap<String, u64>,
}

enum ConnectionEnd {
    Deadline,
    Stopped,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct DanmakuCollector {
    config: CollectorConfig,
}

impl DanmakuCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    /// Collect chat into `output_path` for at most `duration`. The XML log is
    /// always closed cleanly, including on reconnect exhaustion and stop.
    pub async fn collect(
        &self,
        room_id: &str,
        output_path: &Path,
        duration: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> DanmakuResult<CollectorOutcome> {
        let mut writer = ChatLogWriter::create(output_path).await?;
        let start = Instant::now();
        let deadline = start + duration;
        let mut outcome = CollectorOutcome::default();
        let mut attempts_left = self.config.reconnect_max_attempts;

        loop {
            if *stop.borrow() {
                break;
            }
            let end = self
                .run_connection(room_id, &mut writer, start, deadline, &mut stop, &mut outcome)
                .await;
            match end {
                Ok(ConnectionEnd::Deadline) | Ok(ConnectionEnd::Stopped) => break,
                Ok(ConnectionEnd::Dropped) | Err(_) => {
                    if let Err(err) = &end {
                        warn!(room_id, error = %err, "chat connection failed");
                    }
                    if attempts_left == 0 {
                        warn!(
                            room_id,
                            state = ?CollectorState::Stopped,
                            "chat reconnect budget exhausted, video continues without danmaku"
                        );
                        outcome.degraded = true;
                        break;
                    }
                    attempts_left -= 1;
                    debug!(
                        room_id,
                        attempts_left,
                        state = ?CollectorState::Reconnecting,
                        "reconnecting chat socket"
                    );
                    tokio::select! {
                        _ = sleep(self.config.reconnect_delay) => {}
                        _ = sleep_until(deadline) => break,
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if !outcome.ignored_by_type.is_empty() {
            debug!(room_id, ignored = ?outcome.ignored_by_type, "non-chat payload counts");
        }
        if outcome.malformed_frames > 0 {
            warn!(
                room_id,
                malformed = outcome.malformed_frames,
                "skipped malformed chat frames"
            );
        }
        writer.close().await?;
        Ok(outcome)
    }

    async fn run_connection(
        &self,
        room_id: &str,
        writer: &mut ChatLogWriter,
        start: Instant,
        deadline: Instant,
        stop: &mut watch::Receiver<bool>,
        outcome: &mut CollectorOutcome,
    ) -> DanmakuResult<ConnectionEnd> {
        let mut state = CollectorState::Connecting;
        debug!(room_id, state = ?state, "connecting chat socket");
        let (mut ws, _) = connect_async(self.config.ws_url.as_str()).await?;

        ws.send(Message::Binary(pack(&format!(
            "type@=loginreq/roomid@={room_id}/"
        ))))
        .await?;
        state = CollectorState::LoggedIn;
        debug!(room_id, state = ?state, "login request sent");

        ws.send(Message::Binary(pack(&format!(
            "type@=joingroup/rid@={room_id}/gid@=-9999/"
        ))))
        .await?;
        state = CollectorState::Joined;
        debug!(room_id, state = ?state, "joined broadcast group");

        let mut heartbeat = interval_at(Instant::now() + self.config.heartbeat, self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let silence_limit = self.config.heartbeat * 2;
        let mut last_rx = Instant::now();
        state = CollectorState::Running;
        debug!(room_id, state = ?state, "chat collector running");

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    let _ = ws.close(None).await;
                    return Ok(ConnectionEnd::Deadline);
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        let _ = ws.close(None).await;
                        return Ok(ConnectionEnd::Stopped);
                    }
                }
                _ = heartbeat.tick() => {
                    let tick = chrono::Utc::now().timestamp();
                    ws.send(Message::Binary(pack(&format!("type@=keeplive/tick@={tick}/")))).await?;
                }
                _ = sleep_until(last_rx + silence_limit) => {
                    warn!(room_id, "no chat traffic for two heartbeat intervals");
                    return Ok(ConnectionEnd::Dropped);
                }
                frame = ws.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        last_rx = Instant::now();
                        self.consume_frame(&data, writer, start, outcome).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(ConnectionEnd::Dropped),
                    Some(Ok(_)) => {
                        last_rx = Instant::now();
                    }
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }

    async fn consume_frame(
        &self,
        data: &[u8],
        writer: &mut ChatLogWriter,
        start: Instant,
        outcome: &mut CollectorOutcome,
    ) -> DanmakuResult<()> {
        let mut payloads = iter_payloads(data);
        while let Some(payload) = payloads.next() {
            let fields = parse(&payload);
            let kind = fields.get("type").map(String::as_str).unwrap_or("");
            if kind != "chatmsg" {
                if !kind.is_empty() {
                    *outcome.ignored_by_type.entry(kind.to_string()).or_insert(0) += 1;
                }
                continue;
            }
            let Some(text) = fields.get("txt").filter(|t| !t.is_empty()) else {
                continue;
            };
            let offset = start.elapsed().as_secs_f64();
            writer.write(offset, text).await?;
            outcome.messages += 1;
        }
        outcome.malformed_frames += payloads.malformed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_chat_proxy_expectations() {
        let config = CollectorConfig::default();
        assert_eq!(config.heartbeat, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.reconnect_max_attempts, 3);
    }
}
