//! Resolves a playable media URL for a Douyu room through the
//! getEncryption + getH5PlayV1 endpoint pair. Encryption material is cached
//! and invalidated on auth rejection; transient failures retry with capped
//! exponential backoff.

use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

const PLAY_VERSION: &str = "219032101";
const MATERIAL_TTL_SECONDS: i64 = 24 * 60 * 60;
const RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("encryption endpoint rejected request: {0}")]
    Encryption(String),
    #[error("play endpoint returned error {code}: {message}")]
    Play { code: i64, message: String },
    #[error("play info carries no usable stream url")]
    MissingStreamUrl,
    #[error("stream url resolution exhausted {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub base_url: String,
    pub did: String,
    pub cdn: String,
    pub rate: u32,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.douyu.com".to_string(),
            did: "10000000000000000000000000001501".to_string(),
            cdn: "hw-h5".to_string(),
            rate: 0,
            timeout: Duration::from_secs(10),
            user_agent: DESKTOP_USER_AGENT.to_string(),
        }
    }
}

/// Stream URL plus the request headers the transcoder must replay.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct EncryptionMaterial {
    enc_data: String,
    rand_str: String,
    key: String,
    enc_time: u32,
    is_special: bool,
}

struct CachedMaterial {
    material: EncryptionMaterial,
    expires_at: i64,
}

pub struct StreamUrlResolver {
    config: ResolverConfig,
    http: reqwest::Client,
    cache: Mutex<Option<CachedMaterial>>,
}

impl StreamUrlResolver {
    pub fn new(config: ResolverConfig) -> ResolveResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            cache: Mutex::new(None),
        })
    }

    /// Resolve with bounded retries: 3 attempts at 1s/2s/4s spacing.
    pub async fn resolve(&self, room_id: &str) -> ResolveResult<ResolvedStream> {
        let mut last: Option<ResolveError> = None;
        for attempt in 0..RETRY_ATTEMPTS {
            match self.resolve_once(room_id).await {
                Ok(resolved) => return Ok(resolved),
                Err(err) => {
                    warn!(room_id, attempt = attempt + 1, error = %err, "stream resolution failed");
                    last = Some(err);
                    if attempt + 1 < RETRY_ATTEMPTS {
                        sleep(Duration::from_secs(1u64 << attempt)).await;
                    }
                }
            }
        }
        Err(ResolveError::Exhausted {
            attempts: RETRY_ATTEMPTS,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn resolve_once(&self, room_id: &str) -> ResolveResult<ResolvedStream> {
        // One re-auth pass: a 403 means the cached material went stale.
        for auth_attempt in 0..2 {
            let material = self.ensure_material().await?;
            let ts = Utc::now().timestamp();
            let auth = sign(room_id, ts, &material);
            let tt = ts.to_string();
            let rate = self.config.rate.to_string();
            let params: Vec<(&str, &str)> = vec![
                ("cdn", self.config.cdn.as_str()),
                ("rate", rate.as_str()),
                ("ver", PLAY_VERSION),
                ("iar", "0"),
                ("ive", "0"),
                ("rid", room_id),
                ("hevc", "0"),
                ("fa", "0"),
                ("sov", "0"),
                ("enc_data", material.enc_data.as_str()),
                ("tt", tt.as_str()),
                ("did", self.config.did.as_str()),
                ("auth", auth.as_str()),
            ];

            let url = format!("{}/lapi/live/getH5PlayV1/{room_id}", self.config.base_url);
            let response = self
                .http
                .post(&url)
                .header("Referer", self.config.base_url.as_str())
                .header("Origin", self.config.base_url.as_str())
                .query(&params)
                .form(&params)
                .send()
                .await?;

            if response.status() == StatusCode::FORBIDDEN && auth_attempt == 0 {
                debug!(room_id, "play endpoint returned 403, refreshing encryption material");
                self.invalidate().await;
                continue;
            }
            let body: Value = response.error_for_status()?.json().await?;

            let code = body.get("error").and_then(Value::as_i64).unwrap_or(-1);
            if code != 0 {
                return Err(ResolveError::Play {
                    code,
                    message: body
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                });
            }
            let play_info = body.get("data").cloned().unwrap_or(Value::Null);
            let url = pick_stream_url(&play_info).ok_or(ResolveError::MissingStreamUrl)?;
            return Ok(ResolvedStream {
                url,
                headers: self.request_headers(),
            });
        }
        Err(ResolveError::Encryption(
            "encryption material rejected twice".to_string(),
        ))
    }

    async fn ensure_material(&self) -> ResolveResult<EncryptionMaterial> {
        let now = Utc::now().timestamp();
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if now < cached.expires_at {
                return Ok(cached.material.clone());
            }
        }

        let url = format!(
            "{}/wgapi/livenc/liveweb/websec/getEncryption",
            self.config.base_url
        );
        let body: Value = self
            .http
            .get(&url)
            .query(&[("did", self.config.did.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let code = body.get("error").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            return Err(ResolveError::Encryption(format!(
                "getEncryption error {code}"
            )));
        }
        let data = body
            .get("data")
            .ok_or_else(|| ResolveError::Encryption("getEncryption payload has no data".into()))?;
        let material = parse_material(data)?;
        let expires_at = material_expiry(data, now);
        debug!(expires_at, "cached fresh encryption material");
        *cache = Some(CachedMaterial {
            material: material.clone(),
            expires_at,
        });
        Ok(material)
    }

    async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        vec![
            ("User-Agent".to_string(), self.config.user_agent.clone()),
            ("Referer".to_string(), self.config.base_url.clone()),
            ("Origin".to_string(), self.config.base_url.clone()),
        ]
    }
}

fn parse_material(data: &Value) -> ResolveResult<EncryptionMaterial> {
    let field = |name: &str| -> ResolveResult<String> {
        coerce_string(data.get(name)).ok_or_else(|| {
            ResolveError::Encryption(format!("getEncryption data missing field {name}"))
        })
    };
    Ok(EncryptionMaterial {
        enc_data: field("enc_data")?,
        rand_str: field("rand_str")?,
        key: field("key")?,
        enc_time: coerce_i64(data.get("enc_time")).unwrap_or(0) as u32,
        is_special: coerce_i64(data.get("is_special")).unwrap_or(0) != 0,
    })
}

/// Server expiry wins when it is sooner than the 24 h cache ceiling; a small
/// skew keeps segment boundaries clear of server-side 403s.
fn material_expiry(data: &Value, now: i64) -> i64 {
    let ceiling = now + MATERIAL_TTL_SECONDS;
    match coerce_i64(data.get("expire_at")) {
        Some(expire_at) if expire_at > now => ceiling.min(expire_at - 5),
        _ => ceiling,
    }
}

fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn sign(room_id: &str, ts: i64, material: &EncryptionMaterial) -> String {
    let salt = if material.is_special {
        String::new()
    } else {
        format!("{room_id}{ts}")
    };
    let mut secret = material.rand_str.clone();
    for _ in 0..material.enc_time {
        secret = md5_hex(&format!("{secret}{}", material.key));
    }
    md5_hex(&format!("{secret}{}{salt}", material.key))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn pick_stream_url(play_info: &Value) -> Option<String> {
    let join = |base: &str, live: &str| {
        format!("{}/{}", base.trim_end_matches('/'), live.trim_start_matches('/'))
    };
    let field = |name: &str| {
        play_info
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    };
    if let (Some(base), Some(live)) = (field("rtmp_url"), field("rtmp_live")) {
        return Some(join(base, live));
    }
    if let (Some(base), Some(live)) = (field("hls_url"), field("hls_live")) {
        return Some(join(base, live));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn material(rand_str: &str, key: &str, enc_time: u32, is_special: bool) -> EncryptionMaterial {
        EncryptionMaterial {
            enc_data: "enc".to_string(),
            rand_str: rand_str.to_string(),
            key: key.to_string(),
            enc_time,
            is_special,
        }
    }

    #[test]
    fn sign_reference_vector_empty_inputs() {
        // No iterations, special room: auth = md5("").
        let auth = sign("251783", 1_700_000_000, &material("", "", 0, true));
        assert_eq!(auth, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn sign_reference_vector_seeded_secret() {
        // Secret passes through unhashed when enc_time is zero: auth = md5("abc").
        let auth = sign("1", 1, &material("abc", "", 0, true));
        assert_eq!(auth, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn special_rooms_ignore_room_and_timestamp() {
        let m = material("seed", "key", 2, true);
        assert_eq!(sign("1", 111, &m), sign("999", 222, &m));
    }

    #[test]
    fn normal_rooms_salt_with_room_and_timestamp() {
        let m = material("seed", "key", 2, false);
        assert_ne!(sign("1", 111, &m), sign("1", 222, &m));
        assert_ne!(sign("1", 111, &m), sign("2", 111, &m));
    }

    #[test]
    fn iteration_count_changes_the_digest() {
        let auth_once = sign("1", 1, &material("seed", "key", 1, true));
        let auth_twice = sign("1", 1, &material("seed", "key", 2, true));
        assert_ne!(auth_once, auth_twice);
    }

    #[test]
    fn prefers_rtmp_over_hls() {
        let info = json!({
            "rtmp_url": "https://tc.douyu.com/live/",
            "rtmp_live": "/251783.flv?auth=x",
            "hls_url": "https://hls.douyu.com/live",
            "hls_live": "251783.m3u8",
        });
        assert_eq!(
            pick_stream_url(&info).unwrap(),
            "https://tc.douyu.com/live/251783.flv?auth=x"
        );
    }

    #[test]
    fn falls_back_to_hls_when_rtmp_absent() {
        let info = json!({
            "rtmp_url": "",
            "hls_url": "https://hls.douyu.com/live",
            "hls_live": "251783.m3u8",
        });
        assert_eq!(
            pick_stream_url(&info).unwrap(),
            "https://hls.douyu.com/live/251783.m3u8"
        );
    }

    #[test]
    fn missing_urls_yield_none() {
        assert!(pick_stream_url(&json!({})).is_none());
    }

    #[test]
    fn material_parses_numeric_strings() {
        let data = json!({
            "enc_data": "blob",
            "rand_str": "r",
            "key": "k",
            "enc_time": "3",
            "is_special": 1,
        });
        let m = parse_material(&data).unwrap();
        assert_eq!(m.enc_time, 3);
        assert!(m.is_special);
    }

    #[test]
    fn server_expiry_caps_the_cache() {
        let now = 1_000;
        let far = json!({ "expire_at": now + MATERIAL_TTL_SECONDS * 2 });
        assert_eq!(material_expiry(&far, now), now + MATERIAL_TTL_SECONDS);
        let soon = json!({ "expire_at": now + 60 });
        assert_eq!(material_expiry(&soon, now), now + 55);
        let absent = json!({});
        assert_eq!(material_expiry(&absent, now), now + MATERIAL_TTL_SECONDS);
    }
}
