use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{Error, Result};

/// Successful response of a forum-style upload API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OriginUpload {
    #[serde(default)]
    pub id: Option<u64>,
    pub url: String,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub thumbnail_width: Option<u32>,
    #[serde(default)]
    pub thumbnail_height: Option<u32>,
    #[serde(default)]
    pub short_url: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
}

/// The third-party endpoint workers upload to.
///
/// Implementations report a 429 as [`Error::RateLimited`] and every other
/// failed attempt as [`Error::TransientUpload`]; retrying is the caller's job.
pub trait UploadEndpoint: Send + Sync {
    fn provider(&self) -> &str;

    fn upload<'a>(
        &'a self,
        filename: &'a str,
        mime_type: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<OriginUpload>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct HttpEndpointConfig {
    pub url: String,
    /// Extra request headers, e.g. an API key or session cookie.
    pub headers: Vec<(String, String)>,
}

pub struct HttpUploadEndpoint {
    config: HttpEndpointConfig,
    client: reqwest::Client,
}

impl HttpUploadEndpoint {
    pub fn new(config: HttpEndpointConfig) -> Result<Self> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(Error::InvalidConfig {
                message: format!("upload endpoint must be an http(s) url: {}", config.url),
            });
        }
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }
}

impl UploadEndpoint for HttpUploadEndpoint {
    fn provider(&self) -> &str {
        "origin.http"
    }

    fn upload<'a>(
        &'a self,
        filename: &'a str,
        mime_type: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<OriginUpload>> + Send + 'a>> {
        Box::pin(async move {
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(filename.to_string())
                .mime_str(mime_type)
                .map_err(|e| Error::TransientUpload {
                    message: format!("invalid mime type {mime_type}: {e}"),
                })?;
            let form = reqwest::multipart::Form::new()
                .text("type", "composer")
                .text("synchronous", "true")
                .part("file", part);

            let mut req = self.client.post(&self.config.url).multipart(form);
            for (k, v) in &self.config.headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let res = req.send().await.map_err(|e| Error::TransientUpload {
                message: format!("request failed: {e}"),
            })?;

            let status = res.status();
            let retry_after_header = res
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = res.text().await.map_err(|e| Error::TransientUpload {
                message: format!("read response failed: {e}"),
            })?;

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::RateLimited {
                    retry_after_ms: parse_retry_after(retry_after_header.as_deref(), &body),
                });
            }
            if !status.is_success() {
                return Err(Error::TransientUpload {
                    message: format!("http {status}: {body}"),
                });
            }

            serde_json::from_str(&body).map_err(|e| Error::TransientUpload {
                message: format!("invalid json: {e}; body={body}"),
            })
        })
    }
}

/// Pause hint of a 429 in milliseconds: the `Retry-After` header in seconds,
/// else Discourse's `extras.wait_seconds` in the body.
pub fn parse_retry_after(header: Option<&str>, body: &str) -> Option<u64> {
    if let Some(secs) = header.and_then(|h| h.trim().parse::<u64>().ok()) {
        return Some(secs.saturating_mul(1000));
    }
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    let wait = &v["extras"]["wait_seconds"];
    wait.as_u64()
        .or_else(|| wait.as_f64().map(|f| f.max(0.0).ceil() as u64))
        .map(|secs| secs.saturating_mul(1000))
}

/// What the in-memory endpoint does with the next upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    Ok,
    RateLimited { retry_after_ms: Option<u64> },
    Fail(String),
}

/// Test endpoint: uploads succeed unless a scripted response says otherwise.
#[derive(Debug, Default)]
pub struct InMemoryEndpoint {
    pub attempts: AtomicUsize,
    latency_ms: AtomicU64,
    script: Mutex<VecDeque<ScriptedResponse>>,
    always_fail: Mutex<HashMap<String, String>>,
    uploaded: Mutex<Vec<(String, Vec<u8>)>>,
}

impl InMemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_response(&self, response: ScriptedResponse) {
        self.script.lock().await.push_back(response);
    }

    pub async fn fail_always(&self, filename: &str, message: &str) {
        self.always_fail
            .lock()
            .await
            .insert(filename.to_string(), message.to_string());
    }

    pub async fn uploaded_filenames(&self) -> Vec<String> {
        self.uploaded
            .lock()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every upload takes at least this long.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl UploadEndpoint for InMemoryEndpoint {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn upload<'a>(
        &'a self,
        filename: &'a str,
        _mime_type: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<OriginUpload>> + Send + 'a>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let latency = self.latency_ms.load(Ordering::Relaxed);
            if latency > 0 {
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }
            if let Some(message) = self.always_fail.lock().await.get(filename) {
                return Err(Error::TransientUpload {
                    message: message.clone(),
                });
            }
            let scripted = self.script.lock().await.pop_front();
            match scripted.unwrap_or(ScriptedResponse::Ok) {
                ScriptedResponse::Ok => {}
                ScriptedResponse::RateLimited { retry_after_ms } => {
                    return Err(Error::RateLimited { retry_after_ms });
                }
                ScriptedResponse::Fail(message) => {
                    return Err(Error::TransientUpload { message });
                }
            }

            let size = bytes.len() as u64;
            let mut uploaded = self.uploaded.lock().await;
            uploaded.push((filename.to_string(), bytes));
            let id = uploaded.len() as u64;
            Ok(OriginUpload {
                id: Some(id),
                url: format!("mem://uploads/{id}/{filename}"),
                original_filename: Some(filename.to_string()),
                filesize: Some(size),
                ..OriginUpload::default()
            })
        })
    }
}
